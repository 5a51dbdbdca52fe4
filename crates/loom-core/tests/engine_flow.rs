mod common;

use std::collections::HashMap;

use loom_core::app::{GraphFilter, Roles};
use loom_core::domain::{GraphStatus, RequestError, TaskId, TaskState};
use loom_core::ports::{Messenger, TaskGraphStore};

use common::{Cluster, eventually, fast_config, init_tracing, next_finished};

const SCHEDULER_ONLY: Roles = Roles {
    scheduler: true,
    runner: false,
};
const RUNNER_ONLY: Roles = Roles {
    scheduler: false,
    runner: true,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chain_runs_in_dependency_order() {
    init_tracing();
    let cluster = Cluster::new();
    let mut finished = cluster.messenger.subscribe_graph_finished("default").await.unwrap();
    let mut run_tasks = cluster.messenger.subscribe_run_task("default").await.unwrap();
    let mut engine = cluster.engine(Roles::all(), fast_config()).await;

    let active = engine
        .service()
        .run_task_graph("Graph.Chain", None, None)
        .await
        .unwrap();

    let event = next_finished(&mut finished).await;
    assert_eq!(event.graph_id, active.graph_id);
    assert_eq!(event.status, GraphStatus::Succeeded);

    let tasks = cluster.store.tasks_of_graph(active.graph_id).await;
    assert!(tasks.iter().all(|t| t.state == TaskState::Succeeded));
    let label_of: HashMap<TaskId, &str> =
        tasks.iter().map(|t| (t.task_id, t.label.as_str())).collect();

    let mut order = Vec::new();
    while let Some(event) = run_tasks.try_recv() {
        let label = label_of[&event.task_id];
        if !order.contains(&label) {
            order.push(label);
        }
    }
    assert_eq!(order, vec!["a", "b"]);
    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_fails_graph_and_skips_dependents() {
    init_tracing();
    let cluster = Cluster::new();
    let mut finished = cluster.messenger.subscribe_graph_finished("default").await.unwrap();
    let mut engine = cluster.engine(Roles::all(), fast_config()).await;

    let active = engine
        .service()
        .run_task_graph("Graph.FailFast", None, None)
        .await
        .unwrap();

    let event = next_finished(&mut finished).await;
    assert_eq!(event.status, GraphStatus::Failed);

    let store = cluster.store.clone();
    let graph_id = active.graph_id;
    eventually(|| {
        let store = store.clone();
        async move {
            store
                .tasks_of_graph(graph_id)
                .await
                .iter()
                .any(|t| t.label == "b" && t.state == TaskState::Unreachable)
        }
    })
    .await;

    // exactly one graph-finished event
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(finished.try_recv().is_none());
    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_runners_run_every_task_exactly_once() {
    init_tracing();
    let cluster = Cluster::new();
    let mut finished = cluster.messenger.subscribe_graph_finished("default").await.unwrap();
    let mut task_finished = cluster.messenger.subscribe_task_finished("default").await.unwrap();
    let mut first = cluster.engine(Roles::all(), fast_config()).await;
    let mut second = cluster.engine(RUNNER_ONLY, fast_config()).await;

    let active = first
        .service()
        .run_task_graph("Graph.Wide", None, None)
        .await
        .unwrap();
    assert_eq!(next_finished(&mut finished).await.status, GraphStatus::Succeeded);

    let mut runs: HashMap<TaskId, usize> = HashMap::new();
    while let Some(event) = task_finished.try_recv() {
        *runs.entry(event.task_id).or_default() += 1;
    }
    assert_eq!(runs.len(), 8);
    assert!(runs.values().all(|n| *n == 1));
    assert_eq!(cluster.store.tasks_of_graph(active.graph_id).await.len(), 8);

    first.stop();
    second.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_active_graph_per_target_and_cancel_frees_it() {
    init_tracing();
    let cluster = Cluster::new();
    let mut finished = cluster.messenger.subscribe_graph_finished("default").await.unwrap();
    let mut engine = cluster.engine(Roles::all(), fast_config()).await;
    let service = engine.service();

    let active = service
        .run_task_graph("Graph.Long", None, Some("node-1".into()))
        .await
        .unwrap();
    let busy = service
        .run_task_graph("Graph.Chain", None, Some("node-1".into()))
        .await;
    assert!(matches!(busy, Err(RequestError::TargetBusy(t)) if t == "node-1"));

    let store = cluster.store.clone();
    let graph_id = active.graph_id;
    eventually(|| {
        let store = store.clone();
        async move {
            store
                .tasks_of_graph(graph_id)
                .await
                .iter()
                .all(|t| t.state == TaskState::Running)
        }
    })
    .await;

    service
        .cancel_task_graph(&GraphFilter::by_target("node-1"))
        .await
        .unwrap();
    assert_eq!(next_finished(&mut finished).await.status, GraphStatus::Cancelled);

    // the runner stops the running task and persists cancelled
    eventually(|| {
        let store = store.clone();
        async move {
            store
                .tasks_of_graph(graph_id)
                .await
                .iter()
                .all(|t| t.state == TaskState::Cancelled)
        }
    })
    .await;

    assert!(
        service
            .run_task_graph("Graph.Chain", None, Some("node-1".into()))
            .await
            .is_ok()
    );
    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_of_dead_runner_is_run_elsewhere() {
    init_tracing();
    let cluster = Cluster::new();
    let mut finished = cluster.messenger.subscribe_graph_finished("default").await.unwrap();
    let mut task_finished = cluster.messenger.subscribe_task_finished("default").await.unwrap();

    let mut doomed = cluster.engine(RUNNER_ONLY, fast_config()).await;
    let mut scheduler = cluster.engine(SCHEDULER_ONLY, fast_config()).await;
    let active = scheduler
        .service()
        .run_task_graph("Graph.Medium", None, None)
        .await
        .unwrap();

    eventually(|| {
        let checked_out = doomed.runner().is_some_and(|r| r.active_count() == 1);
        async move { checked_out }
    })
    .await;
    // stops heartbeating; the task it holds keeps running locally
    doomed.stop();

    let mut rescuer = cluster.engine(RUNNER_ONLY, fast_config()).await;

    let event = next_finished(&mut finished).await;
    assert_eq!(event.graph_id, active.graph_id);
    assert_eq!(event.status, GraphStatus::Succeeded);

    // let the doomed runner's copy finish; its result must be dropped
    tokio::time::sleep(std::time::Duration::from_millis(2_500)).await;
    let mut reports = 0;
    while task_finished.try_recv().is_some() {
        reports += 1;
    }
    assert_eq!(reports, 1);

    let task = &cluster.store.tasks_of_graph(active.graph_id).await[0];
    assert_eq!(task.state, TaskState::Succeeded);
    assert!(
        cluster
            .store
            .get_graph(active.graph_id)
            .await
            .unwrap()
            .is_some_and(|g| g.status == GraphStatus::Succeeded)
    );

    scheduler.stop();
    rescuer.stop();
}
