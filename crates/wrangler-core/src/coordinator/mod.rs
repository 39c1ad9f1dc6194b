//! The coordinator event loop (§4.4): registration, scheduling loop, result
//! dispatch, wall-time enforcement, shutdown, final summary.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{error, info, warn};

use crate::dag::TaskId;
use crate::engine::{Engine, Placement};
use crate::fdcache::FdCache;
use crate::listeners::WorkflowEvent;
use crate::protocol::{Command, Message, Registration};
use crate::transport::{Transport, TransportError, WorkerId};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("protocol violation during registration: expected Registration, got {0:?}")]
    UnexpectedDuringRegistration(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

pub struct CoordinatorConfig {
    pub numworkers: u32,
    pub rescue_path: PathBuf,
    pub max_wall_time: Option<Duration>,
}

/// Per-worker bookkeeping the coordinator needs beyond what lives in the
/// engine: which host a worker belongs to and which task (if any) it is
/// currently running.
struct WorkerSlot {
    host: String,
    current_task: Option<TaskId>,
}

pub struct Coordinator<T: Transport> {
    transport: T,
    engine: Engine,
    fdcache: FdCache,
    config: CoordinatorConfig,
    workers: Vec<WorkerSlot>,
    start_time: Instant,
    wall_time_exceeded: bool,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(transport: T, engine: Engine, fdcache: FdCache, config: CoordinatorConfig) -> Self {
        Coordinator {
            transport,
            engine,
            fdcache,
            config,
            workers: Vec::new(),
            start_time: Instant::now(),
            wall_time_exceeded: false,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// REGISTERING phase: receive exactly `numworkers` Registration
    /// messages, build Hosts and Slots, assign host-ranks, reply HostRank.
    pub async fn run_registration(&mut self) -> Result<(), CoordinatorError> {
        info!(numworkers = self.config.numworkers, "registration phase starting");
        for _ in 0..self.config.numworkers {
            let (worker_id, msg) = self.transport.recv().await?;
            let registration = match msg {
                Message::Registration(r) => r,
                other => {
                    return Err(CoordinatorError::UnexpectedDuringRegistration(format!(
                        "{other:?}"
                    )))
                }
            };
            self.register_worker(worker_id, registration).await?;
        }
        self.engine.fail_infeasible_tasks();
        info!("registration phase complete");
        Ok(())
    }

    async fn register_worker(
        &mut self,
        worker_id: WorkerId,
        registration: Registration,
    ) -> Result<(), CoordinatorError> {
        let Registration {
            hostname,
            memory,
            threads,
            cores,
            sockets,
        } = registration;

        self.engine
            .resources
            .host_or_insert(&hostname, memory, threads, cores, sockets);
        let (_, rank) = self.engine.resources.add_slot(&hostname);

        let idx = worker_id.0 as usize;
        while self.workers.len() <= idx {
            self.workers.push(WorkerSlot {
                host: String::new(),
                current_task: None,
            });
        }
        self.workers[idx] = WorkerSlot {
            host: hostname,
            current_task: None,
        };

        self.transport
            .send(worker_id, Message::HostRank(crate::protocol::HostRank { rank }))
            .await?;
        Ok(())
    }

    /// SCHEDULING phase: alternate dispatch and result consumption until the
    /// DAG is finished or wall time has expired and everything has drained.
    pub async fn run_scheduling(&mut self) -> Result<(), CoordinatorError> {
        self.engine.emit(WorkflowEvent::WorkflowStart);

        loop {
            self.engine.queue_ready_tasks();
            self.check_wall_time();

            if !self.wall_time_exceeded {
                self.dispatch_ready_tasks().await?;
            }

            if self.engine.is_finished() {
                break;
            }
            if self.wall_time_exceeded && self.engine.dag.running_count() == 0 {
                warn!("wall-time limit exceeded and no in-flight tasks remain, stopping with undispatched work");
                break;
            }

            self.wait_for_result().await?;
        }

        let outcome = self.engine.dag.failed_count() == 0 && !self.wall_time_exceeded;
        self.engine.emit(if outcome {
            WorkflowEvent::WorkflowSuccess
        } else {
            WorkflowEvent::WorkflowFailure
        });

        self.shutdown_all().await?;

        if let Err(e) = self.engine.dag.write_rescue(&self.config.rescue_path) {
            warn!(error = %e, "failed to write rescue file");
        }

        self.log_summary(outcome);
        Ok(())
    }

    fn check_wall_time(&mut self) {
        if self.wall_time_exceeded {
            return;
        }
        if let Some(max) = self.config.max_wall_time {
            if self.start_time.elapsed() > max {
                warn!("wall-time limit exceeded, draining in-flight tasks");
                self.wall_time_exceeded = true;
            }
        }
    }

    async fn dispatch_ready_tasks(&mut self) -> Result<(), CoordinatorError> {
        let placements = self.engine.schedule_tasks();
        for placement in placements {
            if let Placement::Dispatched { task, binding } = placement {
                let worker_id = self.worker_for_slot(&binding.host, binding.slot);
                let t = self.engine.dag.task(task);
                let command = Command {
                    name: t.name.clone(),
                    argv: t.argv.clone(),
                    id: t.pegasus_id.clone().unwrap_or_default(),
                    memory: binding.memory,
                    cpus: binding.cpus.len() as u16,
                    binding: binding.cpus.clone(),
                    pipe_forwards: t.pipe_forwards.clone(),
                    file_forwards: t.file_forwards.clone(),
                };
                let task_name = t.name.clone();
                self.workers[worker_id.0 as usize].current_task = Some(task);
                self.engine.emit(WorkflowEvent::TaskSubmit {
                    task: task_name,
                    worker: worker_id.0,
                });
                self.transport.send(worker_id, Message::Command(command)).await?;
            }
        }
        Ok(())
    }

    /// Resolve which worker owns a given (host, slot) binding. Workers are
    /// registered in the same order slots are created, so the worker index
    /// whose current_task is free and whose host matches is exactly the
    /// owner of that slot.
    fn worker_for_slot(&self, host: &str, _slot: crate::resource::SlotId) -> WorkerId {
        for (idx, w) in self.workers.iter().enumerate() {
            if w.host == host && w.current_task.is_none() {
                return WorkerId(idx as u32);
            }
        }
        panic!("no idle worker found for host {host}, coordinator/engine state diverged");
    }

    async fn wait_for_result(&mut self) -> Result<(), CoordinatorError> {
        let (worker_id, msg) = self.transport.recv().await?;
        match msg {
            Message::Result(result) => {
                let task_id = self.workers[worker_id.0 as usize]
                    .current_task
                    .take()
                    .expect("Result received from a worker with no in-flight task");
                if result.exit_code == 0 {
                    let name = self.engine.apply_success(task_id);
                    if let Err(e) = crate::dag::write_rescue_entry(&self.config.rescue_path, &name)
                    {
                        warn!(error = %e, task = %name, "failed to append rescue entry");
                    }
                    self.engine.emit_task_success(name, result.runtime);
                } else {
                    self.engine.complete_failure(task_id, result.exit_code);
                }
            }
            Message::IoData(data) => {
                let path = PathBuf::from(format!("{}.{}", data.task_name, data.filename));
                if let Err(e) = self.fdcache.write(&path, &data.bytes) {
                    warn!(error = %e, path = %path.display(), "fdcache write failed");
                }
            }
            other => {
                error!(?other, "unexpected message during scheduling");
            }
        }
        Ok(())
    }

    async fn shutdown_all(&mut self) -> Result<(), CoordinatorError> {
        self.transport.broadcast(Message::Shutdown).await?;
        Ok(())
    }

    fn log_summary(&self, outcome: bool) {
        let duration = self.start_time.elapsed().as_secs_f64();
        let start = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
        info!(
            "[workflow-summary stat=\"{}\", tasks={}, succeeded={}, failed={}, duration={:.3}, start={}]",
            if outcome { "ok" } else { "fail" },
            self.engine.dag.tasks().count(),
            self.engine.dag.succeeded_count(),
            self.engine.dag.failed_count(),
            duration,
            start,
        );
    }
}
