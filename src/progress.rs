use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, unbounded};
use log::{info, warn};
use parking_lot::Mutex;

/// Events published while a command list runs.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    ListStarted { source: String, total: usize },
    CommandStarted { line: usize, action: String },
    CommandFinished { line: usize, outcome: String },
    ListFinished { outcome: String },
}

/// Read-only view of the current list state for observers (displays, the
/// CLI status line). Updated by the reporter worker only.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub source: String,
    pub total: usize,
    pub finished: usize,
    pub current: Option<(usize, String)>,
    pub last_outcome: Option<String>,
}

/// Worker that consumes progress events off a channel.
///
/// Observation must never block sequencing, so events are fire-and-forget
/// sends; the worker itself is joined at a defined point (`finish`) so the
/// final state is visible before list execution returns.
pub struct ProgressReporter {
    sender: Sender<ProgressEvent>,
    handle: JoinHandle<()>,
    snapshot: Arc<Mutex<ProgressSnapshot>>,
}

impl ProgressReporter {
    pub fn start() -> Self {
        let (sender, receiver) = unbounded::<ProgressEvent>();
        let snapshot = Arc::new(Mutex::new(ProgressSnapshot::default()));
        let shared = snapshot.clone();
        let handle = std::thread::spawn(move || {
            for event in receiver {
                let mut state = shared.lock();
                match event {
                    ProgressEvent::ListStarted { source, total } => {
                        info!("command list started: {source} ({total} commands)");
                        state.source = source;
                        state.total = total;
                    }
                    ProgressEvent::CommandStarted { line, action } => {
                        state.current = Some((line, action));
                    }
                    ProgressEvent::CommandFinished { line, outcome } => {
                        info!("line {line}: {outcome}");
                        state.finished += 1;
                        state.current = None;
                        state.last_outcome = Some(outcome);
                    }
                    ProgressEvent::ListFinished { outcome } => {
                        info!("command list finished: {outcome}");
                        state.current = None;
                        state.last_outcome = Some(outcome);
                    }
                }
            }
        });
        Self {
            sender,
            handle,
            snapshot,
        }
    }

    pub fn send(&self, event: ProgressEvent) {
        // a closed channel only means the worker died; sequencing goes on
        let _ = self.sender.send(event);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot.lock().clone()
    }

    /// Drain outstanding events and join the worker.
    pub fn finish(self) -> ProgressSnapshot {
        drop(self.sender);
        if self.handle.join().is_err() {
            warn!("progress reporter worker panicked");
        }
        let snapshot = self.snapshot.lock().clone();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_event_stream_after_join() {
        let reporter = ProgressReporter::start();
        reporter.send(ProgressEvent::ListStarted {
            source: "overnight.txt".into(),
            total: 2,
        });
        reporter.send(ProgressEvent::CommandStarted {
            line: 1,
            action: "usaxsscan".into(),
        });
        reporter.send(ProgressEvent::CommandFinished {
            line: 1,
            outcome: "ok".into(),
        });
        reporter.send(ProgressEvent::ListFinished {
            outcome: "completed".into(),
        });
        let snapshot = reporter.finish();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.finished, 1);
        assert_eq!(snapshot.last_outcome.as_deref(), Some("completed"));
        assert!(snapshot.current.is_none());
    }
}
