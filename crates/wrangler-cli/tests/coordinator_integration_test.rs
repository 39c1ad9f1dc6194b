//! End-to-end coordinator event loop test driven over the in-memory
//! transport, using `wrangler-test-utils` fixtures instead of a textual DAG
//! file or real sockets.

use wrangler_core::coordinator::{Coordinator, CoordinatorConfig};
use wrangler_core::engine::Engine;
use wrangler_core::fdcache::FdCache;
use wrangler_core::protocol::{HostRank, Message, Registration, TaskResult};
use wrangler_core::resource::ResourcePool;
use wrangler_core::transport::{Transport, WorkerId};
use wrangler_test_utils::{paired_transport, DagBuilder, RescueFixture};

#[tokio::test]
async fn diamond_dag_completes_and_rescue_lists_every_task() {
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

    let engine = Engine::new(dag, ResourcePool::new(), vec![]);
    let fdcache = FdCache::new(4).unwrap();
    let fixture = RescueFixture::empty();

    let (coordinator_transport, mut workers) = paired_transport(1);
    let config = CoordinatorConfig {
        numworkers: 1,
        rescue_path: fixture.path.clone(),
        max_wall_time: None,
    };
    let mut coordinator = Coordinator::new(coordinator_transport, engine, fdcache, config);

    let worker_task = tokio::spawn(async move {
        let w = &mut workers[0];
        w.send(
            WorkerId(0),
            Message::Registration(Registration {
                hostname: "h1".to_string(),
                memory: 8192,
                threads: 2,
                cores: 2,
                sockets: 1,
            }),
        )
        .await
        .unwrap();
        let (_, hostrank) = w.recv().await.unwrap();
        assert_eq!(hostrank, Message::HostRank(HostRank { rank: 0 }));

        loop {
            let (_, msg) = w.recv().await.unwrap();
            match msg {
                Message::Command(cmd) => {
                    w.send(
                        WorkerId(0),
                        Message::Result(TaskResult {
                            name: cmd.name,
                            exit_code: 0,
                            runtime: 0.01,
                        }),
                    )
                    .await
                    .unwrap();
                }
                Message::Shutdown => break,
                other => panic!("unexpected message: {other:?}"),
            }
        }
    });

    coordinator.run_registration().await.unwrap();
    coordinator.run_scheduling().await.unwrap();
    worker_task.await.unwrap();

    assert_eq!(coordinator.engine().dag.succeeded_count(), 4);
    assert_eq!(coordinator.engine().dag.failed_count(), 0);

    let rescue_contents = std::fs::read_to_string(&fixture.path).unwrap();
    for name in ["A", "B", "C", "D"] {
        assert!(
            rescue_contents.contains(&format!("DONE {name}")),
            "rescue file missing DONE {name}: {rescue_contents}"
        );
    }
}

#[tokio::test]
async fn rescued_tasks_are_not_resubmitted() {
    let mut builder = DagBuilder::new(1);
    builder.task("A").task("B").edge("A", "B");
    let fixture = RescueFixture::seeded(&["A"]);
    let rescued = wrangler_core::dag::read_rescue(&fixture.path).unwrap();
    let dag = builder.build_with_rescue(&rescued).unwrap();

    let engine = Engine::new(dag, ResourcePool::new(), vec![]);
    let fdcache = FdCache::new(4).unwrap();
    let (coordinator_transport, mut workers) = paired_transport(1);
    let config = CoordinatorConfig {
        numworkers: 1,
        rescue_path: fixture.path.clone(),
        max_wall_time: None,
    };
    let mut coordinator = Coordinator::new(coordinator_transport, engine, fdcache, config);

    let worker_task = tokio::spawn(async move {
        let w = &mut workers[0];
        w.send(
            WorkerId(0),
            Message::Registration(Registration {
                hostname: "h1".to_string(),
                memory: 4096,
                threads: 1,
                cores: 1,
                sockets: 1,
            }),
        )
        .await
        .unwrap();
        let (_, _hostrank) = w.recv().await.unwrap();

        let mut commands_seen = Vec::new();
        loop {
            let (_, msg) = w.recv().await.unwrap();
            match msg {
                Message::Command(cmd) => {
                    commands_seen.push(cmd.name.clone());
                    w.send(
                        WorkerId(0),
                        Message::Result(TaskResult {
                            name: cmd.name,
                            exit_code: 0,
                            runtime: 0.01,
                        }),
                    )
                    .await
                    .unwrap();
                }
                Message::Shutdown => break,
                other => panic!("unexpected message: {other:?}"),
            }
        }
        commands_seen
    });

    coordinator.run_registration().await.unwrap();
    coordinator.run_scheduling().await.unwrap();
    let commands_seen = worker_task.await.unwrap();

    assert_eq!(commands_seen, vec!["B".to_string()]);
}
