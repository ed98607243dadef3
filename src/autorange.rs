use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info};
use ndarray::Array1;

use crate::devices::amplifier::{AutorangeMode, DetectorChannel, GainSpec, group_by_scaler};
use crate::devices::shutter::Shutter;
use crate::error::SequencerError;

/// Floor for the settling wait after any gain change.
pub const AMPLIFIER_MINIMUM_SETTLING_TIME: Duration = Duration::from_millis(10);

/// Last gain the autoscale loop converged to, per (scaler, channel).
///
/// Warm-starting from the previous result usually saves most of the
/// iterations. This cache is owned by the instrument context and handed in
/// explicitly; there is no ambient global.
#[derive(Default)]
pub struct GainCache {
    map: HashMap<(String, String), usize>,
}

impl GainCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, scaler: &str, channel: &str) -> Option<usize> {
        self.map
            .get(&(scaler.to_string(), channel.to_string()))
            .copied()
    }

    /// Record the latest gain, returning the previous one.
    pub fn set(&mut self, scaler: &str, channel: &str, gain: usize) -> Option<usize> {
        self.map
            .insert((scaler.to_string(), channel.to_string()), gain)
    }
}

/// Let the hardware pick a workable gain for every channel.
///
/// Channels sharing a scaler are processed as one group with a single
/// synchronized count per iteration. After each count the sequence program
/// has adjusted the gains; the loop converges when every channel keeps its
/// gain AND its rate is at or below the channel's maximum count rate.
/// Exhausting `max_iterations` is an operational fault, not a transient:
/// the caller gets `ConvergenceError` and should surface it.
///
/// If a shutter is given it is opened first and left open on return.
pub fn autoscale_amplifiers(
    channels: &[DetectorChannel],
    shutter: Option<&Shutter>,
    cache: &mut GainCache,
    count_time: Duration,
    max_iterations: usize,
) -> Result<(), SequencerError> {
    if let Some(shutter) = shutter {
        shutter.open()?;
    }
    for (scaler_name, group) in group_by_scaler(channels) {
        // groups are processed in sequence in case hardware is shared
        info!("Autoscaling amplifiers for: {}", group[0].nickname());
        autoscale_group(&scaler_name, &group, cache, count_time, max_iterations)?;
    }
    Ok(())
}

fn autoscale_group(
    scaler_name: &str,
    group: &[DetectorChannel],
    cache: &mut GainCache,
    count_time: Duration,
    max_iterations: usize,
) -> Result<(), SequencerError> {
    let scaler = group[0].scaler().clone();
    scaler.set_count_mode("OneShot")?;

    let mut settling = AMPLIFIER_MINIMUM_SETTLING_TIME;
    for channel in group {
        channel.auto.set_mode(AutorangeMode::AutoBackground)?;
        // faster if we start from the last converged gain
        if let Some(gain) = cache.get(scaler_name, channel.nickname()) {
            channel.auto.request_gain(GainSpec::Index(gain))?;
        }
        cache.set(
            scaler_name,
            channel.nickname(),
            channel.auto.selected_gain()?,
        );
        settling = settling.max(channel.femto.settling_time());
    }
    std::thread::sleep(settling);

    let mut complete = false;
    for iteration in 0..max_iterations {
        scaler.count(count_time)?;
        // the sequence program has adjusted the gains during the count
        let mut converged = true;
        for channel in group {
            let gain_now = channel.auto.selected_gain()?;
            let gain_previous = cache.set(scaler_name, channel.nickname(), gain_now);
            converged &= gain_previous == Some(gain_now);
            converged &= channel.reading()? <= channel.auto.max_count_rate();
        }
        if converged {
            debug!("autoscale converged after {} iterations", iteration + 1);
            complete = true;
            break;
        }
    }

    scaler.set_count_mode("AutoCount")?;

    if !complete {
        let mut report = Vec::with_capacity(group.len());
        for channel in group {
            report.push(format!(
                "{}: gain={} rate={}",
                channel.nickname(),
                channel.auto.selected_gain()?,
                channel.reading()?
            ));
        }
        return Err(SequencerError::Convergence {
            iterations: max_iterations,
            channels: report,
        });
    }
    Ok(())
}

/// Measure the noise floor of every channel at each gain setting.
///
/// The shutter, if given, is closed first: backgrounds are measured with no
/// beam. Gains are held in manual mode and swept from the most sensitive
/// range downward; the most sensitive ranges settle slowest and are
/// characterized first, while the shutter-closed conditions are freshest.
/// Index 0, the least sensitive range, has negligible background and is not
/// swept. Results land on the per-gain background endpoints of each channel.
pub fn measure_background(
    channels: &[DetectorChannel],
    shutter: Option<&Shutter>,
    count_time: Duration,
    num_readings: usize,
) -> Result<(), SequencerError> {
    if let Some(shutter) = shutter {
        shutter.close()?;
    }
    for (_, group) in group_by_scaler(channels) {
        info!("Measuring background for: {}", group[0].nickname());
        background_group(&group, count_time, num_readings)?;
    }
    Ok(())
}

fn background_group(
    group: &[DetectorChannel],
    count_time: Duration,
    num_readings: usize,
) -> Result<(), SequencerError> {
    let scaler = group[0].scaler().clone();
    for channel in group {
        channel.auto.set_mode(AutorangeMode::Manual)?;
    }
    let num_gains = group[0].auto.num_gains()?;

    for gain in (1..num_gains).rev() {
        let mut settling = AMPLIFIER_MINIMUM_SETTLING_TIME;
        for channel in group {
            channel.auto.request_gain(GainSpec::Index(gain))?;
            settling = settling.max(channel.femto.settling_time());
        }
        std::thread::sleep(settling);

        let mut readings: Vec<Vec<f64>> = vec![Vec::with_capacity(num_readings); group.len()];
        for _ in 0..num_readings {
            scaler.count(count_time)?;
            for (channel, series) in group.iter().zip(readings.iter_mut()) {
                series.push(channel.reading()?);
            }
        }

        for (channel, series) in group.iter().zip(readings.into_iter()) {
            let series = Array1::from_vec(series);
            let mean = series.mean().unwrap_or(0.0);
            let std_dev = series.std(0.0);
            channel.auto.write_background(gain, mean, std_dev)?;
            info!(
                "{} gain={}  bkg={}  +/- {}",
                channel.nickname(),
                gain,
                mean,
                std_dev
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlSystem, IocBehavior, PvValue, SoftIoc};
    use crate::devices::amplifier::{AutorangeChannel, FemtoAmplifier};
    use crate::devices::scaler::Scaler;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const CNT: &str = "lax:vsc:c0.CNT";
    const MAX_RATE: f64 = 950_000.0;

    fn gain_table() -> Vec<String> {
        ["1e4 V/A", "1e6 V/A", "1e8 V/A", "1e10 V/A", "1e12 V/A"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    struct Rig {
        ioc: Arc<SoftIoc>,
        channels: Vec<DetectorChannel>,
    }

    fn rig(nicknames: &[&str]) -> Rig {
        let ioc = Arc::new(SoftIoc::new());
        ioc.seed(CNT, 0i64);
        let scaler = Scaler::new(
            "scaler0",
            CNT,
            "lax:vsc:c0.TP",
            "lax:vsc:c0.CONT",
            ioc.clone(),
        );
        let mut channels = Vec::new();
        for nick in nicknames {
            let femto_addr = format!("lax:fem:{nick}:gainidx");
            let auto_prefix = format!("lax:pd:{nick}:");
            ioc.set_enum_labels(femto_addr.clone(), gain_table());
            ioc.set_enum_labels(format!("{auto_prefix}reqrange"), gain_table());
            ioc.seed(format!("{auto_prefix}gain"), 0i64);
            ioc.seed(format!("{auto_prefix}reqrange"), 0i64);
            ioc.seed(format!("lax:sig:{nick}"), 0.0);
            let femto =
                FemtoAmplifier::new(*nick, femto_addr, Duration::from_millis(1), ioc.clone());
            let auto = AutorangeChannel::new(auto_prefix, MAX_RATE, ioc.clone());
            channels.push(DetectorChannel::new(
                *nick,
                scaler.clone(),
                format!("lax:sig:{nick}"),
                femto,
                auto,
                ioc.clone(),
            ));
        }
        Rig { ioc, channels }
    }

    /// Sequence program stand-in: on each count, selects the requested gain
    /// and produces a fixed rate per channel.
    struct FollowerProgram {
        nicknames: Vec<String>,
        rates: Vec<f64>,
    }

    impl IocBehavior for FollowerProgram {
        fn on_put(&self, ioc: &SoftIoc, address: &str, value: &PvValue) {
            if address != CNT || value.as_i64() != Some(1) {
                return;
            }
            for (nick, rate) in self.nicknames.iter().zip(&self.rates) {
                let requested = ioc
                    .get_i64(&format!("lax:pd:{nick}:reqrange"))
                    .unwrap_or(0);
                ioc.react(format!("lax:pd:{nick}:gain"), requested);
                ioc.react(format!("lax:sig:{nick}"), *rate);
            }
            ioc.react(CNT, 0i64);
        }
    }

    /// Sequence program that never settles: the selected gain toggles on
    /// every count.
    struct OscillatingProgram {
        nickname: String,
        counts: Mutex<i64>,
    }

    impl IocBehavior for OscillatingProgram {
        fn on_put(&self, ioc: &SoftIoc, address: &str, value: &PvValue) {
            if address != CNT || value.as_i64() != Some(1) {
                return;
            }
            let mut counts = self.counts.lock();
            *counts += 1;
            ioc.react(format!("lax:pd:{}:gain", self.nickname), *counts % 2);
            ioc.react(format!("lax:sig:{}", self.nickname), 100.0);
            ioc.react(CNT, 0i64);
        }
    }

    #[test]
    fn stable_hardware_converges_after_one_count() {
        let rig = rig(&["upd", "I0"]);
        rig.ioc.install(Arc::new(FollowerProgram {
            nicknames: vec!["upd".into(), "I0".into()],
            rates: vec![1e5, 2e5],
        }));
        let mut cache = GainCache::new();
        autoscale_amplifiers(
            &rig.channels,
            None,
            &mut cache,
            Duration::from_millis(10),
            9,
        )
        .unwrap();
        assert_eq!(rig.ioc.puts_to(CNT).len(), 1);
        assert_eq!(cache.get("scaler0", "upd"), Some(0));
    }

    #[test]
    fn shared_scaler_gets_one_trigger_per_iteration() {
        let rig = rig(&["upd", "I0", "I00"]);
        rig.ioc.install(Arc::new(FollowerProgram {
            nicknames: vec!["upd".into(), "I0".into(), "I00".into()],
            rates: vec![1e5, 2e5, 3e5],
        }));
        let mut cache = GainCache::new();
        autoscale_amplifiers(
            &rig.channels,
            None,
            &mut cache,
            Duration::from_millis(10),
            9,
        )
        .unwrap();
        // three channels, one shared scaler: exactly one count was issued
        assert_eq!(rig.ioc.puts_to(CNT).len(), 1);
    }

    #[test]
    fn unstable_hardware_fails_after_exactly_max_iterations() {
        let rig = rig(&["upd"]);
        rig.ioc.install(Arc::new(OscillatingProgram {
            nickname: "upd".into(),
            counts: Mutex::new(0),
        }));
        let mut cache = GainCache::new();
        let result = autoscale_amplifiers(
            &rig.channels,
            None,
            &mut cache,
            Duration::from_millis(10),
            4,
        );
        match result {
            Err(SequencerError::Convergence { iterations, .. }) => assert_eq!(iterations, 4),
            other => panic!("expected ConvergenceError, got {other:?}"),
        }
        // not more, not fewer counting cycles than the bound
        assert_eq!(rig.ioc.puts_to(CNT).len(), 4);
    }

    #[test]
    fn saturated_channel_does_not_converge() {
        let rig = rig(&["upd"]);
        rig.ioc.install(Arc::new(FollowerProgram {
            nicknames: vec!["upd".into()],
            rates: vec![MAX_RATE + 1.0],
        }));
        let mut cache = GainCache::new();
        let result = autoscale_amplifiers(
            &rig.channels,
            None,
            &mut cache,
            Duration::from_millis(10),
            3,
        );
        assert!(matches!(
            result,
            Err(SequencerError::Convergence { iterations: 3, .. })
        ));
    }

    #[test]
    fn warm_start_requests_the_cached_gain_first() {
        let rig = rig(&["upd"]);
        rig.ioc.install(Arc::new(FollowerProgram {
            nicknames: vec!["upd".into()],
            rates: vec![1e5],
        }));
        let mut cache = GainCache::new();
        cache.set("scaler0", "upd", 3);
        autoscale_amplifiers(
            &rig.channels,
            None,
            &mut cache,
            Duration::from_millis(10),
            9,
        )
        .unwrap();
        let requests = rig.ioc.puts_to("lax:pd:upd:reqrange");
        assert_eq!(requests.first(), Some(&PvValue::I64(3)));
    }

    #[test]
    fn background_sweeps_gains_from_highest_to_lowest() {
        let rig = rig(&["upd", "I0"]);
        rig.ioc.install(Arc::new(FollowerProgram {
            nicknames: vec!["upd".into(), "I0".into()],
            rates: vec![12.0, 7.0],
        }));
        measure_background(&rig.channels, None, Duration::from_millis(10), 3).unwrap();
        let order: Vec<i64> = rig
            .ioc
            .puts_to("lax:pd:upd:reqrange")
            .iter()
            .filter_map(|v| v.as_i64())
            .collect();
        assert_eq!(order, vec![4, 3, 2, 1]);
        // 4 gains swept, 3 readings each, one shared trigger per reading
        assert_eq!(rig.ioc.puts_to(CNT).len(), 12);
        // mode forced to manual on every channel
        assert_eq!(
            rig.ioc.puts_to("lax:pd:upd:mode").last(),
            Some(&PvValue::Str("manual".into()))
        );
    }

    #[test]
    fn background_statistics_land_on_the_gain_endpoints() {
        struct VaryingProgram {
            counts: Mutex<i64>,
        }
        impl IocBehavior for VaryingProgram {
            fn on_put(&self, ioc: &SoftIoc, address: &str, value: &PvValue) {
                if address != CNT || value.as_i64() != Some(1) {
                    return;
                }
                let mut counts = self.counts.lock();
                *counts += 1;
                // alternate 10, 20 so mean is 15 and spread is nonzero
                let reading = if *counts % 2 == 0 { 20.0 } else { 10.0 };
                ioc.react("lax:sig:upd", reading);
                ioc.react(CNT, 0i64);
            }
        }
        let rig = rig(&["upd"]);
        rig.ioc.install(Arc::new(VaryingProgram {
            counts: Mutex::new(0),
        }));
        measure_background(&rig.channels, None, Duration::from_millis(10), 2).unwrap();
        let (mean, std_dev) = rig.channels[0].auto.background(4).unwrap();
        assert_eq!(mean, 15.0);
        assert!(std_dev > 0.0);
    }
}
