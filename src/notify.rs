use std::path::PathBuf;

use chrono::Local;
use log::{error, warn};
use parking_lot::Mutex;

/// Out-of-band operator messaging.
///
/// Delivery is somebody else's problem (a mail agent watches the spool);
/// the sequencing code only hands over subject and body. Sending never
/// fails the experiment: delivery trouble is logged and swallowed.
pub trait Notifier: Send + Sync {
    fn send(&self, subject: &str, body: &str);
}

/// Writes notices to the log only. Useful for console sessions.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, subject: &str, body: &str) {
        warn!("operator notice: {subject}\n{body}");
    }
}

/// Drops each notice as a file into a spool directory for an external mail
/// agent to pick up.
pub struct SpoolNotifier {
    directory: PathBuf,
}

impl SpoolNotifier {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl Notifier for SpoolNotifier {
    fn send(&self, subject: &str, body: &str) {
        let stamp = Local::now().format("%Y%m%d-%H%M%S%.3f");
        let path = self.directory.join(format!("{stamp}-notice.txt"));
        let contents = format!("Subject: {subject}\n\n{body}\n");
        if let Err(e) = std::fs::create_dir_all(&self.directory) {
            error!("cannot create notice spool {:?}: {e}", self.directory);
            return;
        }
        if let Err(e) = std::fs::write(&path, contents) {
            error!("cannot write notice {path:?}: {e}");
        }
    }
}

/// Captures notices in memory so callers can inspect what was sent.
#[derive(Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }
}

impl Notifier for MemoryNotifier {
    fn send(&self, subject: &str, body: &str) {
        self.messages
            .lock()
            .push((subject.to_string(), body.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spool_notifier_writes_a_message_file() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = SpoolNotifier::new(dir.path());
        notifier.send("ConvergenceError during attempt 1 of 1", "details here");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let contents =
            std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert!(contents.starts_with("Subject: ConvergenceError"));
        assert!(contents.contains("details here"));
    }

    #[test]
    fn memory_notifier_records_in_order() {
        let notifier = MemoryNotifier::new();
        notifier.send("a", "1");
        notifier.send("b", "2");
        assert_eq!(
            notifier.messages(),
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
    }
}
