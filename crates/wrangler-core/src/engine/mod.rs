//! The scheduling policy (§2 item 3): moves tasks through
//! ready → submitted → succeeded/failed, notifies listeners, and decides
//! overall workflow termination. This is the pure, transport-free core the
//! coordinator event loop drives.

use std::collections::HashMap;

use crate::dag::{Dag, TaskId};
use crate::listeners::{notify_all, WorkflowEvent, WorkflowEventListener};
use crate::resource::{Binding, ResourcePool};

/// What to do with a task popped off the ready queue during scheduling.
pub enum Placement {
    Dispatched { task: TaskId, binding: Binding },
    NoSlot { task: TaskId },
}

pub struct Engine {
    pub dag: Dag,
    pub resources: ResourcePool,
    listeners: Vec<Box<dyn WorkflowEventListener>>,
    /// Bindings for currently-running tasks, needed to invert the
    /// allocation on completion.
    in_flight: HashMap<TaskId, Binding>,
    registration_complete: bool,
}

impl Engine {
    pub fn new(dag: Dag, resources: ResourcePool, listeners: Vec<Box<dyn WorkflowEventListener>>) -> Self {
        Engine {
            dag,
            resources,
            listeners,
            in_flight: HashMap::new(),
            registration_complete: false,
        }
    }

    pub fn emit(&mut self, event: WorkflowEvent) {
        notify_all(&mut self.listeners, &event);
    }

    /// Drain newly-ready tasks from the DAG, emitting `TaskQueued` for each.
    pub fn queue_ready_tasks(&mut self) {
        let before: Vec<TaskId> = self.dag.tasks().filter(|t| t.state == crate::dag::TaskState::Ready).map(|t| t.id).collect();
        self.dag.queue_ready_tasks();
        let after: Vec<TaskId> = self.dag.tasks().filter(|t| t.state == crate::dag::TaskState::Ready).map(|t| t.id).collect();
        for id in after {
            if !before.contains(&id) {
                let name = self.dag.task(id).name.clone();
                self.emit(WorkflowEvent::TaskQueued { task: name });
            }
        }
    }

    /// Once registration completes, fail any task whose cpu requirement
    /// exceeds every registered host's thread count (§4.2 infeasibility).
    pub fn fail_infeasible_tasks(&mut self) {
        self.registration_complete = true;
        let infeasible: Vec<TaskId> = self
            .dag
            .tasks()
            .filter(|t| matches!(t.state, crate::dag::TaskState::Unready | crate::dag::TaskState::Ready))
            .filter(|t| !self.resources.any_host_could_run(t.memory, t.cpus))
            .map(|t| t.id)
            .collect();

        for id in infeasible {
            self.dag.mark_infeasible(id);
            let name = self.dag.task(id).name.clone();
            self.emit(WorkflowEvent::TaskFailure {
                task: name,
                exit_code: -1,
            });
        }
    }

    /// Pop ready tasks and try to place each on a free slot, in priority
    /// order, until either the ready queue or the free-slot list is empty.
    /// On the first ready task that finds no compatible slot, stop and push
    /// it back (head-of-line blocking by design, §4.4).
    pub fn schedule_tasks(&mut self) -> Vec<Placement> {
        let mut placements = Vec::new();
        while self.dag.has_ready_task() && self.resources.free_slot_count() > 0 {
            let task_id = self.dag.next_ready_task().expect("has_ready_task was true");
            let task = self.dag.task(task_id);
            let (memory, cpus) = (task.memory, task.cpus);

            match self.resources.try_place(task_id, memory, cpus) {
                Some(binding) => {
                    self.dag.mark_running(task_id);
                    self.in_flight.insert(task_id, binding.clone());
                    placements.push(Placement::Dispatched {
                        task: task_id,
                        binding,
                    });
                }
                None => {
                    self.dag.requeue(task_id);
                    placements.push(Placement::NoSlot { task: task_id });
                    break;
                }
            }
        }
        placements
    }

    /// Apply a successful result: release resources and update the DAG, but
    /// do not emit `TaskSuccess` yet. Returns the task's name so the caller
    /// can durably append the rescue entry before calling
    /// `emit_task_success` — rescue durability must precede listener
    /// delivery (§4.1, §5).
    pub fn apply_success(&mut self, task_id: TaskId) -> String {
        if let Some(binding) = self.in_flight.remove(&task_id) {
            self.resources.release(task_id, &binding);
        }
        self.dag.mark_success(task_id);
        self.dag.task(task_id).name.clone()
    }

    pub fn emit_task_success(&mut self, task: String, runtime: f64) {
        self.emit(WorkflowEvent::TaskSuccess { task, runtime });
    }

    /// Apply a successful result and emit `TaskSuccess` immediately, with no
    /// rescue entry in between. Only safe when nothing observes rescue
    /// ordering (e.g. tests); the coordinator uses `apply_success` +
    /// `emit_task_success` directly so it can interleave the rescue write.
    #[cfg(test)]
    pub fn complete_success(&mut self, task_id: TaskId, runtime: f64) {
        let name = self.apply_success(task_id);
        self.emit_task_success(name, runtime);
    }

    /// Apply a failed result: release resources, update the DAG (retry or
    /// permanent failure), emit `TaskFailure`.
    pub fn complete_failure(&mut self, task_id: TaskId, exit_code: i32) {
        if let Some(binding) = self.in_flight.remove(&task_id) {
            self.resources.release(task_id, &binding);
        }
        self.dag.mark_failure(task_id);
        let name = self.dag.task(task_id).name.clone();
        self.emit(WorkflowEvent::TaskFailure { task: name, exit_code });
    }

    pub fn is_finished(&self) -> bool {
        self.dag.is_finished()
    }

    pub fn binding_for(&self, task_id: TaskId) -> Option<&Binding> {
        self.in_flight.get(&task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Dag;
    use std::collections::HashMap as Map;

    fn single_task_dag(memory: u32, cpus: u16) -> Dag {
        let task = crate::dag::Task {
            id: crate::dag::TaskId::from_raw(0),
            name: "A".to_string(),
            argv: vec!["echo".to_string()],
            memory,
            cpus,
            priority: 0,
            retries_remaining: 1,
            state: crate::dag::TaskState::Unready,
            pegasus_id: None,
            pegasus_tr: None,
            pipe_forwards: Map::new(),
            file_forwards: Map::new(),
            parents: vec![],
            children: vec![],
            seq: 0,
        };
        Dag::new(vec![task], 1, &[]).unwrap()
    }

    #[test]
    fn schedules_and_completes_a_single_task() {
        let dag = single_task_dag(512, 2);
        let mut resources = ResourcePool::new();
        resources.host_or_insert("h1", 4096, 4, 2, 1);
        resources.add_slot("h1");
        let mut engine = Engine::new(dag, resources, vec![]);

        let placements = engine.schedule_tasks();
        assert_eq!(placements.len(), 1);
        let task_id = match &placements[0] {
            Placement::Dispatched { task, .. } => *task,
            _ => panic!("expected dispatch"),
        };

        engine.complete_success(task_id, 1.5);
        assert!(engine.is_finished());
        assert_eq!(engine.dag.succeeded_count(), 1);
    }

    #[test]
    fn infeasible_task_is_failed_after_registration() {
        let dag = single_task_dag(0, 8);
        let mut resources = ResourcePool::new();
        resources.host_or_insert("h1", 4096, 4, 2, 1);
        resources.add_slot("h1");
        let mut engine = Engine::new(dag, resources, vec![]);

        engine.fail_infeasible_tasks();
        assert!(engine.is_finished());
        assert_eq!(engine.dag.failed_count(), 1);
    }
}
