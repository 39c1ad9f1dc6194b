//! Workflow-event publication (§4.6). Listeners are notified synchronously
//! in registration order; a listener failure is logged and never aborts the
//! coordinator.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    WorkflowStart,
    WorkflowSuccess,
    WorkflowFailure,
    TaskQueued { task: String },
    TaskSubmit { task: String, worker: u32 },
    TaskSuccess { task: String, runtime: f64 },
    TaskFailure { task: String, exit_code: i32 },
}

impl WorkflowEvent {
    fn kind_name(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStart => "WORKFLOW_START",
            WorkflowEvent::WorkflowSuccess => "WORKFLOW_SUCCESS",
            WorkflowEvent::WorkflowFailure => "WORKFLOW_FAILURE",
            WorkflowEvent::TaskQueued { .. } => "TASK_QUEUED",
            WorkflowEvent::TaskSubmit { .. } => "TASK_SUBMIT",
            WorkflowEvent::TaskSuccess { .. } => "TASK_SUCCESS",
            WorkflowEvent::TaskFailure { .. } => "TASK_FAILURE",
        }
    }
}

pub trait WorkflowEventListener: Send {
    fn on_event(&mut self, event: &WorkflowEvent) -> std::io::Result<()>;
}

/// Dispatch `event` to every listener in order, logging (not propagating)
/// any failure.
pub fn notify_all(listeners: &mut [Box<dyn WorkflowEventListener>], event: &WorkflowEvent) {
    for listener in listeners.iter_mut() {
        if let Err(e) = listener.on_event(event) {
            warn!(error = %e, event = event.kind_name(), "workflow event listener failed");
        }
    }
}

/// One line per event: a monotonic sequence number, an ISO 8601 timestamp,
/// and the event kind/task name, mirroring Pegasus's jobstate.log.
pub struct JobstateLog {
    path: PathBuf,
    seq: AtomicU64,
}

impl JobstateLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JobstateLog {
            path: path.into(),
            seq: AtomicU64::new(0),
        }
    }
}

impl WorkflowEventListener for JobstateLog {
    fn on_event(&mut self, event: &WorkflowEvent) -> std::io::Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
        let task = match event {
            WorkflowEvent::TaskQueued { task }
            | WorkflowEvent::TaskSubmit { task, .. }
            | WorkflowEvent::TaskSuccess { task, .. }
            | WorkflowEvent::TaskFailure { task, .. } => task.as_str(),
            _ => "-",
        };
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(f, "{seq} {timestamp} {} {task}", event.kind_name())
    }
}

/// A DAG-manager-style log: one textual status-transition line per event,
/// keyed on task name, in the spirit of a DAGMan `.dagman.out` consumer.
pub struct DagManLog {
    path: PathBuf,
}

impl DagManLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DagManLog { path: path.into() }
    }
}

impl WorkflowEventListener for DagManLog {
    fn on_event(&mut self, event: &WorkflowEvent) -> std::io::Result<()> {
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        match event {
            WorkflowEvent::WorkflowStart => writeln!(f, "INFO workflow starting"),
            WorkflowEvent::WorkflowSuccess => writeln!(f, "INFO workflow finished successfully"),
            WorkflowEvent::WorkflowFailure => writeln!(f, "ERROR workflow finished with failures"),
            WorkflowEvent::TaskQueued { task } => writeln!(f, "{task} ... READY"),
            WorkflowEvent::TaskSubmit { task, worker } => {
                writeln!(f, "{task} ... SUBMITTED worker={worker}")
            }
            WorkflowEvent::TaskSuccess { task, runtime } => {
                writeln!(f, "{task} ... SUCCESS runtime={runtime:.3}")
            }
            WorkflowEvent::TaskFailure { task, exit_code } => {
                writeln!(f, "{task} ... FAILURE exit={exit_code}")
            }
        }
    }
}

/// Test/in-process listener collecting every event it sees, for assertions.
#[derive(Default)]
pub struct CollectingListener {
    pub events: Vec<WorkflowEvent>,
}

impl WorkflowEventListener for CollectingListener {
    fn on_event(&mut self, event: &WorkflowEvent) -> std::io::Result<()> {
        self.events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobstate_log_writes_monotonic_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobstate.log");
        let mut log = JobstateLog::new(&path);
        log.on_event(&WorkflowEvent::WorkflowStart).unwrap();
        log.on_event(&WorkflowEvent::TaskQueued {
            task: "A".to_string(),
        })
        .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0 "));
        assert!(lines[1].starts_with("1 "));
    }

    #[test]
    fn dagman_log_formats_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dagman.log");
        let mut log = DagManLog::new(&path);
        log.on_event(&WorkflowEvent::TaskSuccess {
            task: "A".to_string(),
            runtime: 2.5,
        })
        .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), "A ... SUCCESS runtime=2.500");
    }

    #[test]
    fn notify_all_continues_past_a_failing_listener() {
        struct AlwaysFails;
        impl WorkflowEventListener for AlwaysFails {
            fn on_event(&mut self, _event: &WorkflowEvent) -> std::io::Result<()> {
                Err(std::io::Error::other("boom"))
            }
        }

        let mut collector = CollectingListener::default();
        let mut listeners: Vec<Box<dyn WorkflowEventListener>> =
            vec![Box::new(AlwaysFails), Box::new(CollectingListener::default())];
        notify_all(&mut listeners, &WorkflowEvent::WorkflowStart);

        // Exercise the plain collector type directly too.
        collector.on_event(&WorkflowEvent::WorkflowStart).unwrap();
        assert_eq!(collector.events.len(), 1);
    }
}
