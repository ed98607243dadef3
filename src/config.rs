use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub epics: EpicsConfig,
    pub stages: StagesConfig,
    pub channels: ChannelsConfig,
    pub collection: CollectionConfig,
    pub tuning: TuningConfig,
    pub archive: ArchiveConfig,
    pub notices: NoticesConfig,
    pub logging: LoggingConfig,
    pub scripts: ScriptConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EpicsConfig {
    /// Record name prefix shared by all beamline soft records.
    pub prefix: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StagesConfig {
    pub sample_x_limits: [f64; 2],
    pub sample_y_limits: [f64; 2],
    pub motor_tolerance: f64,
    pub move_timeout_s: f64,
    pub guard_slit_settle_ms: u64,
    pub beam_slit_settle_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChannelsConfig {
    pub count_time_s: f64,
    pub num_backgrounds: usize,
    pub max_iterations: usize,
    pub max_count_rate: f64,
    pub settling_time_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CollectionConfig {
    /// Measure amplifier dark currents at the start of each list.
    pub measure_dark_currents: bool,
    /// Synchronize detector order numbers at the start of each list.
    pub sync_order_numbers: bool,
    /// Attempts per command before the remaining list is abandoned.
    pub maximum_attempts: usize,
    pub acquire_time_s: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TuningConfig {
    /// Points across the tune width when scanning an axis.
    pub tune_points: usize,
    pub tune_count_time_s: f64,
    /// User override for the minimum USAXS step, applied over the
    /// energy-derived default.
    pub usaxs_minstep: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ArchiveConfig {
    pub livedata_file: String,
    pub posterity_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NoticesConfig {
    /// Spool directory for operator notices; log-only when unset.
    pub spool_dir: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Directory for the command attempt journal; disabled when unset.
    pub journal_dir: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScriptConfig {
    pub interpreter: String,
    pub search_paths: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            epics: EpicsConfig::default(),
            stages: StagesConfig::default(),
            channels: ChannelsConfig::default(),
            collection: CollectionConfig::default(),
            tuning: TuningConfig::default(),
            archive: ArchiveConfig::default(),
            notices: NoticesConfig::default(),
            logging: LoggingConfig::default(),
            scripts: ScriptConfig::default(),
        }
    }
}

impl Default for EpicsConfig {
    fn default() -> Self {
        Self {
            prefix: "usxLAX:".to_string(),
        }
    }
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            sample_x_limits: [-25.0, 25.0],
            sample_y_limits: [-10.0, 110.0],
            motor_tolerance: 1e-4,
            move_timeout_s: 30.0,
            guard_slit_settle_ms: 500,
            beam_slit_settle_ms: 2000,
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            count_time_s: 1.0,
            num_backgrounds: 8,
            max_iterations: 9,
            max_count_rate: 950_000.0,
            settling_time_ms: 80,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            measure_dark_currents: true,
            sync_order_numbers: true,
            maximum_attempts: 1,
            acquire_time_s: 10.0,
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            tune_points: 31,
            tune_count_time_s: 0.1,
            usaxs_minstep: None,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            livedata_file: "./livedata/commands.txt".to_string(),
            posterity_dir: "./log/macros".to_string(),
        }
    }
}

impl Default for NoticesConfig {
    fn default() -> Self {
        Self { spool_dir: None }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            journal_dir: None,
        }
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            search_paths: vec![".".to_string()],
        }
    }
}

impl AppConfig {
    /// Configuration suitable for driving the soft IOC: no slit settling
    /// pauses, short move timeouts, no settling on the amplifiers.
    pub fn for_simulation() -> Self {
        let mut config = Self::default();
        config.stages.guard_slit_settle_ms = 0;
        config.stages.beam_slit_settle_ms = 0;
        config.stages.move_timeout_s = 2.0;
        config.channels.settling_time_ms = 1;
        config.channels.count_time_s = 0.05;
        config.collection.acquire_time_s = 0.05;
        config.tuning.tune_count_time_s = 0.01;
        config.tuning.tune_points = 7;
        config
    }
}

/// Load configuration from file with layered fallbacks.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        // Try common config file locations
        let possible_paths = ["usaxs-runner.toml", "config.toml"];
        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Add environment variable overrides with prefix "USAXS_RUNNER_"
    builder = builder.add_source(
        Environment::with_prefix("USAXS_RUNNER")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration with better error handling and defaults.
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({e}), using defaults");
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.collection.maximum_attempts, 1);
        assert!(config.stages.sample_x_limits[0] < config.stages.sample_x_limits[1]);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        write!(
            file,
            "[collection]\nmaximum_attempts = 3\n[epics]\nprefix = \"sim:\"\n"
        )
        .unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.collection.maximum_attempts, 3);
        assert_eq!(config.epics.prefix, "sim:");
        // untouched sections keep their defaults
        assert_eq!(config.channels.max_iterations, 9);
    }
}
