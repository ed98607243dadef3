use std::time::{Duration, Instant};

use crate::error::SequencerError;

/// Poll `condition` until it reports true or `timeout` elapses.
///
/// Every hardware wait in the crate goes through here, so each one is a
/// bounded suspension point: "move and confirm", "trigger and wait" and
/// "sleep for settling" all surface as `Timeout` faults instead of hanging
/// the sequencing thread.
pub fn wait_for<F>(
    mut condition: F,
    timeout: Duration,
    interval: Duration,
    what: &str,
) -> Result<(), SequencerError>
where
    F: FnMut() -> Result<bool, SequencerError>,
{
    let start = Instant::now();
    loop {
        if condition()? {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(SequencerError::Timeout(timeout, what.to_string()));
        }
        std::thread::sleep(interval);
    }
}
