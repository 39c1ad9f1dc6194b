//! DAG model: tasks, edges, the ready queue, retry bookkeeping and rescue
//! serialization.

mod parser;
mod rescue;

pub use parser::{parse_dag_file, DagParseError};
pub use rescue::{read_rescue, write_rescue_entry, RescueError};

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Stable arena index for a [`Task`] within a [`Dag`]. Never reused across a
/// `Dag`'s lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

impl TaskId {
    pub fn from_raw(idx: usize) -> Self {
        TaskId(idx)
    }

    pub fn raw(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unready,
    Ready,
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// A forward mapping entry (PIPE or FILE directive): variable-or-path to a
/// destination path.
pub type ForwardMap = HashMap<String, String>;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub argv: Vec<String>,
    pub memory: u32,
    pub cpus: u16,
    pub priority: i64,
    pub retries_remaining: u32,
    pub state: TaskState,
    pub pegasus_id: Option<String>,
    pub pegasus_tr: Option<String>,
    pub pipe_forwards: ForwardMap,
    pub file_forwards: ForwardMap,
    pub parents: Vec<TaskId>,
    pub children: Vec<TaskId>,
    /// Parse order, used as the stable tie-break in the ready queue.
    pub seq: usize,
}

/// Ready-queue entry ordered by `(priority, -seq)` so that higher priority
/// dispatches first and, among equal priorities, earlier-parsed tasks
/// dispatch first (a `BinaryHeap` is a max-heap, so we store `-seq` to make
/// smaller sequence numbers compare greater).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct ReadyEntry {
    priority: i64,
    neg_seq: isize,
    id: TaskId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.neg_seq).cmp(&(other.priority, other.neg_seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The full DAG: owns every task, the ready queue, and retry/rescue state.
#[derive(Debug)]
pub struct Dag {
    tasks: Vec<Task>,
    by_name: HashMap<String, TaskId>,
    ready_queue: BinaryHeap<ReadyEntry>,
    running: usize,
    max_retries: u32,
}

impl Dag {
    /// Build a `Dag` from parsed tasks/edges, apply a rescue replay (if any
    /// entries are given), and seed the ready queue with every task whose
    /// parents have all already succeeded.
    pub fn new(mut tasks: Vec<Task>, max_retries: u32, rescued: &[String]) -> Result<Self, RescueError> {
        let mut by_name = HashMap::with_capacity(tasks.len());
        for t in &tasks {
            by_name.insert(t.name.clone(), t.id);
        }

        for name in rescued {
            let id = *by_name
                .get(name)
                .ok_or_else(|| RescueError::UnknownTask(name.clone()))?;
            tasks[id.raw()].state = TaskState::Succeeded;
        }

        let mut dag = Dag {
            tasks,
            by_name,
            ready_queue: BinaryHeap::new(),
            running: 0,
            max_retries,
        };
        dag.queue_ready_tasks();
        Ok(dag)
    }

    pub fn get_task(&self, name: &str) -> Option<&Task> {
        self.by_name.get(name).map(|id| &self.tasks[id.raw()])
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.raw()]
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    fn is_ready(&self, id: TaskId) -> bool {
        let t = &self.tasks[id.raw()];
        matches!(t.state, TaskState::Unready)
            && t.parents
                .iter()
                .all(|p| self.tasks[p.raw()].state == TaskState::Succeeded)
    }

    /// Drain every task whose parents have all succeeded into the ready
    /// queue, transitioning it from `Unready` to `Ready`.
    pub fn queue_ready_tasks(&mut self) {
        let newly_ready: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| matches!(t.state, TaskState::Unready))
            .map(|t| t.id)
            .filter(|&id| self.is_ready(id))
            .collect();

        for id in newly_ready {
            let t = &mut self.tasks[id.raw()];
            t.state = TaskState::Ready;
            self.ready_queue.push(ReadyEntry {
                priority: t.priority,
                neg_seq: -(t.seq as isize),
                id,
            });
        }
    }

    pub fn has_ready_task(&self) -> bool {
        !self.ready_queue.is_empty()
    }

    /// Pop the highest-priority ready task, marking it `Queued`. The caller
    /// must either dispatch it (transitioning to `Running`) or requeue it
    /// with [`Dag::requeue`] if no slot was found.
    pub fn next_ready_task(&mut self) -> Option<TaskId> {
        let entry = self.ready_queue.pop()?;
        self.tasks[entry.id.raw()].state = TaskState::Queued;
        Some(entry.id)
    }

    /// Put a previously popped task back at the head of the ready queue
    /// without changing its priority ordering. Used when `schedule_tasks`
    /// finds no compatible free slot (head-of-line blocking, see §4.4).
    pub fn requeue(&mut self, id: TaskId) {
        let t = &mut self.tasks[id.raw()];
        t.state = TaskState::Ready;
        self.ready_queue.push(ReadyEntry {
            priority: t.priority,
            neg_seq: -(t.seq as isize),
            id,
        });
    }

    pub fn mark_running(&mut self, id: TaskId) {
        self.tasks[id.raw()].state = TaskState::Running;
        self.running += 1;
    }

    pub fn mark_success(&mut self, id: TaskId) {
        self.tasks[id.raw()].state = TaskState::Succeeded;
        self.running -= 1;
        self.queue_ready_tasks();
    }

    /// Record a failed attempt. Returns `true` if the task was marked
    /// permanently failed (retries exhausted), `false` if it was requeued
    /// for another attempt.
    pub fn mark_failure(&mut self, id: TaskId) -> bool {
        self.running -= 1;
        let t = &mut self.tasks[id.raw()];
        if t.retries_remaining == 0 {
            t.state = TaskState::Failed;
            true
        } else {
            t.retries_remaining -= 1;
            t.state = TaskState::Unready;
            self.queue_ready_tasks();
            false
        }
    }

    /// Mark a task failed outright with no further retries, e.g. due to
    /// infeasibility. Descendants become permanently unreachable because
    /// `is_ready` requires every parent to be `Succeeded`. If the task was
    /// sitting in the ready queue, it is removed first.
    pub fn mark_infeasible(&mut self, id: TaskId) {
        if self.tasks[id.raw()].state == TaskState::Ready {
            self.ready_queue = self.ready_queue.drain().filter(|e| e.id != id).collect();
        }
        self.tasks[id.raw()].state = TaskState::Failed;
    }

    pub fn is_finished(&self) -> bool {
        !self.has_ready_task() && self.running == 0
    }

    pub fn running_count(&self) -> usize {
        self.running
    }

    pub fn succeeded_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Succeeded)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Failed)
            .count()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Write the full rescue file: one `DONE <name>` line per succeeded task.
    pub fn write_rescue(&self, path: &std::path::Path) -> Result<(), RescueError> {
        use std::io::Write as _;
        let mut f = std::fs::File::create(path).map_err(RescueError::Io)?;
        for t in &self.tasks {
            if t.state == TaskState::Succeeded {
                writeln!(f, "DONE {}", t.name).map_err(RescueError::Io)?;
            }
        }
        Ok(())
    }
}
