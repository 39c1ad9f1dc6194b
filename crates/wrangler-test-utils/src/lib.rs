//! Shared test fixtures for wrangler integration tests.
//!
//! Provides a `DagBuilder` for constructing in-memory DAGs without writing
//! the textual grammar out by hand, a `paired_transport` re-export for
//! driving the coordinator without opening sockets, and a `tempfile`-backed
//! rescue-file fixture.

use std::collections::HashMap;
use std::path::PathBuf;

use tempfile::TempDir;

use wrangler_core::dag::{Dag, RescueError, Task, TaskId, TaskState};

pub use wrangler_core::transport::paired_transport;

/// Builds a small DAG in memory by name, without going through the textual
/// parser. Tasks are added in call order; that order becomes their `seq`
/// (and therefore their ready-queue tie-break).
#[derive(Default)]
pub struct DagBuilder {
    tasks: Vec<Task>,
    by_name: HashMap<String, TaskId>,
    max_retries: u32,
}

impl DagBuilder {
    pub fn new(max_retries: u32) -> Self {
        DagBuilder {
            tasks: Vec::new(),
            by_name: HashMap::new(),
            max_retries,
        }
    }

    /// Add a task with default resource requirements (memory 0, cpus 1,
    /// priority 0). Use [`DagBuilder::task_with`] for custom requirements.
    pub fn task(&mut self, name: &str) -> &mut Self {
        self.task_with(name, 0, 1, 0)
    }

    pub fn task_with(&mut self, name: &str, memory: u32, cpus: u16, priority: i64) -> &mut Self {
        let id = TaskId::from_raw(self.tasks.len());
        self.by_name.insert(name.to_string(), id);
        self.tasks.push(Task {
            id,
            name: name.to_string(),
            argv: vec!["true".to_string()],
            memory,
            cpus,
            priority,
            retries_remaining: self.max_retries,
            state: TaskState::Unready,
            pegasus_id: None,
            pegasus_tr: None,
            pipe_forwards: HashMap::new(),
            file_forwards: HashMap::new(),
            parents: vec![],
            children: vec![],
            seq: id.raw(),
        });
        self
    }

    /// Declare `parent -> child`. Both must already have been added.
    pub fn edge(&mut self, parent: &str, child: &str) -> &mut Self {
        let parent_id = *self.by_name.get(parent).unwrap_or_else(|| {
            panic!("DagBuilder::edge: unknown parent task {parent:?}")
        });
        let child_id = *self.by_name.get(child).unwrap_or_else(|| {
            panic!("DagBuilder::edge: unknown child task {child:?}")
        });
        self.tasks[child_id.raw()].parents.push(parent_id);
        self.tasks[parent_id.raw()].children.push(child_id);
        self
    }

    pub fn build(&self) -> Result<Dag, RescueError> {
        self.build_with_rescue(&[])
    }

    pub fn build_with_rescue(&self, rescued: &[String]) -> Result<Dag, RescueError> {
        Dag::new(self.tasks.clone(), self.max_retries, rescued)
    }
}

/// A tempdir-backed rescue file fixture: the directory is removed when the
/// fixture is dropped.
pub struct RescueFixture {
    _dir: TempDir,
    pub path: PathBuf,
}

impl RescueFixture {
    pub fn empty() -> Self {
        let dir = tempfile::tempdir().expect("failed to create rescue fixture tempdir");
        let path = dir.path().join("workflow.rescue");
        RescueFixture { _dir: dir, path }
    }

    /// Seed the fixture with `DONE <name>` lines for each of `done`.
    pub fn seeded(done: &[&str]) -> Self {
        let fixture = Self::empty();
        for name in done {
            wrangler_core::dag::write_rescue_entry(&fixture.path, name)
                .expect("failed to seed rescue fixture");
        }
        fixture
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_a_diamond_with_root_ready() {
        let mut builder = DagBuilder::new(1);
        builder
            .task("A")
            .task("B")
            .task("C")
            .task("D")
            .edge("A", "B")
            .edge("A", "C")
            .edge("B", "D")
            .edge("C", "D");
        let dag = builder.build().unwrap();
        assert!(dag.has_ready_task());
        assert_eq!(dag.get_task("A").unwrap().children.len(), 2);
    }

    #[test]
    fn rescue_fixture_seeds_done_lines() {
        let fixture = RescueFixture::seeded(&["A", "B"]);
        let done = wrangler_core::dag::read_rescue(&fixture.path).unwrap();
        assert_eq!(done, vec!["A".to_string(), "B".to_string()]);
    }
}
