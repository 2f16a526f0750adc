use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_client::{Client, ClientError};
use tessera_cluster::{ClusterError, LocalCluster};
use tessera_core::{Call, ClusterConfig, FailureKind, FunctionError, FunctionRegistry, TaskKey};

const WAIT: Duration = Duration::from_secs(15);

fn registry() -> FunctionRegistry {
    let flaky_calls = Arc::new(AtomicU32::new(0));
    let mut registry = FunctionRegistry::new();
    registry
        .register_fn1("inc", |x: i64| Ok(x + 1))
        .register_fn2("add", |a: i64, b: i64| Ok(a + b))
        .register_fn1("sleep", |ms: i64| {
            std::thread::sleep(Duration::from_millis(ms as u64));
            Ok(ms)
        })
        .register_fn1("fill", |byte: u8| Ok(vec![byte; 25]))
        .register_fn1("crash", |_: i64| -> Result<i64, FunctionError> {
            panic!("worker goes down with this task")
        })
        .register_fn1("flaky", move |x: i64| {
            if flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(FunctionError::new("ConnectionError", "transient"))
            } else {
                Ok(x)
            }
        });
    registry
}

async fn start(config: ClusterConfig) -> (LocalCluster, Client, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config;
    config.worker.local_directory = Some(dir.path().to_path_buf());
    let cluster = LocalCluster::start(config, registry()).await.unwrap();
    let client = cluster.client();
    (cluster, client, dir)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn results_are_stable_while_held() {
    let (cluster, client, _dir) = start(ClusterConfig::local(2)).await;
    let future = client.submit(Call::new("inc").arg(&41i64)).await.unwrap();
    let first: i64 = future.result().await.unwrap();
    let second: i64 = future.result().await.unwrap();
    assert_eq!((first, second), (42, 42));

    let who_has = client.who_has(&[future.clone()]).await.unwrap();
    assert!(!who_has[future.key()].is_empty());
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_tasks_spread_evenly() {
    let mut config = ClusterConfig::local(4);
    config.worker.nthreads = 1;
    let (cluster, client, _dir) = start(config).await;

    let futures = client.map("sleep", vec![100i64; 8], false).await.unwrap();
    client.gather::<i64>(&futures).await.unwrap();

    let has_what = client.has_what().await.unwrap();
    let counts: Vec<usize> = has_what.values().map(|keys| keys.len()).collect();
    assert_eq!(counts.iter().sum::<usize>(), 8);
    assert_eq!(counts.len(), 4);
    assert!(counts.iter().all(|&n| (1..=3).contains(&n)), "{counts:?}");
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn killing_a_holder_recomputes_lost_inputs() {
    let (cluster, client, _dir) = start(ClusterConfig::local(2)).await;
    let a = client.submit(Call::new("inc").arg(&1i64)).await.unwrap();
    assert_eq!(a.result::<i64>().await.unwrap(), 2);
    let pause = client.submit(Call::new("sleep").arg(&300i64)).await.unwrap();
    let b = client
        .submit(Call::new("add").dep(a.key().clone()).dep(pause.key().clone()))
        .await
        .unwrap();

    let holders = client.who_has(&[a.clone()]).await.unwrap();
    let holder = holders[a.key()].iter().next().unwrap().clone();
    assert!(cluster.kill_worker(&holder));

    assert_eq!(tokio::time::timeout(WAIT, b.result::<i64>()).await.unwrap().unwrap(), 302);
    eventually("replacement worker", || async { cluster.restarts() >= 1 }).await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_memory_budget_spills_and_reads_back() {
    let mut config = ClusterConfig::local(1);
    config.worker.memory_limit = 100;
    let (cluster, client, _dir) = start(config).await;

    let futures = client.map("fill", [1u8, 2, 3], true).await.unwrap();
    let values: Vec<Vec<u8>> = client.gather(&futures).await.unwrap();
    for (value, byte) in values.iter().zip([1u8, 2, 3]) {
        assert_eq!(value, &vec![byte; 25]);
    }

    eventually("spilled bytes in a heartbeat", || async {
        let status = cluster.status().await.unwrap();
        status.workers.iter().any(|w| w.spilled_bytes > 0)
    })
    .await;

    // The oldest value went to disk and still reads back the same.
    assert_eq!(futures[0].result::<Vec<u8>>().await.unwrap(), vec![1u8; 25]);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failures_stay_with_their_task() {
    let (cluster, client, _dir) = start(ClusterConfig::local(2)).await;
    let bad = client
        .submit(Call::new("flaky").arg(&1i64).pure(false))
        .await
        .unwrap();
    let good = client.map("inc", 0..4i64, true).await.unwrap();

    let err = bad.result::<i64>().await.unwrap_err();
    let failure = err.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::TaskError);
    assert_eq!(failure.exception, "ConnectionError");
    assert_eq!(client.gather::<i64>(&good).await.unwrap(), vec![1, 2, 3, 4]);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_retry_absorbs_a_transient_failure() {
    let (cluster, client, _dir) = start(ClusterConfig::local(1)).await;
    let future = client
        .submit(Call::new("flaky").arg(&7i64).retries(1))
        .await
        .unwrap();
    assert_eq!(future.result::<i64>().await.unwrap(), 7);
    assert_eq!(cluster.metrics().tasks_retried, 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_input_survives_until_dependents_are_done() {
    let (cluster, client, _dir) = start(ClusterConfig::local(2)).await;
    let f1 = client.submit(Call::new("inc").arg(&1i64)).await.unwrap();
    f1.result::<i64>().await.unwrap();
    let pause = client.submit(Call::new("sleep").arg(&400i64)).await.unwrap();
    let f2 = client
        .submit(Call::new("add").dep(f1.key().clone()).dep(pause.key().clone()))
        .await
        .unwrap();

    let k1 = f1.key().clone();
    drop(f1);
    drop(pause);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.key_state(&k1).await.unwrap().is_some());

    assert_eq!(f2.result::<i64>().await.unwrap(), 402);
    f2.release();
    eventually("input to be collected", || async {
        client.key_state(&k1).await.unwrap().is_none()
    })
    .await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_task_that_keeps_killing_workers_is_suspicious() {
    let mut config = ClusterConfig::local(2);
    config.scheduler.allowed_failures = 2;
    let (cluster, client, _dir) = start(config).await;

    let bomb = client.submit(Call::new("crash").arg(&0i64)).await.unwrap();
    let err = tokio::time::timeout(WAIT, bomb.result::<i64>())
        .await
        .unwrap()
        .unwrap_err();
    match err {
        ClientError::SuspiciousTask(failure) => assert_eq!(&failure.key, bomb.key()),
        other => panic!("expected a suspicious task, got {other:?}"),
    }
    eventually("both crashed workers to be replaced", || async {
        cluster.restarts() >= 2
    })
    .await;

    client.wait_for_workers(2, WAIT).await.unwrap();
    let fine = client.submit(Call::new("inc").arg(&1i64)).await.unwrap();
    assert_eq!(fine.result::<i64>().await.unwrap(), 2);
    assert_eq!(cluster.metrics().suspicious_tasks, 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scattered_data_lost_with_its_worker_is_lost_data() {
    let (cluster, client, _dir) = start(ClusterConfig::local(2)).await;
    let scattered = client.scatter(&[123i64], false).await.unwrap();
    let holders = client.who_has(&scattered).await.unwrap();
    let holder_set = &holders[scattered[0].key()];
    assert_eq!(holder_set.len(), 1);
    let holder = holder_set.iter().next().unwrap().clone();

    assert!(cluster.kill_worker(&holder));
    let err = tokio::time::timeout(WAIT, async {
        loop {
            // Until the scheduler notices the loss the old location is
            // still handed out, and the read itself reports it.
            match scattered[0].result::<i64>().await {
                Ok(_) => tokio::time::sleep(Duration::from_millis(25)).await,
                Err(e) => return e,
            }
        }
    })
    .await
    .unwrap();
    match err {
        ClientError::LostData(failure) => {
            assert_eq!(failure.kind, FailureKind::LostData);
            assert_eq!(&failure.key, scattered[0].key());
        }
        other => panic!("expected lost data, got {other:?}"),
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scale_grows_and_shrinks_the_pool() {
    let (cluster, client, _dir) = start(ClusterConfig::local(1)).await;
    cluster.scale(3).await.unwrap();
    assert_eq!(cluster.workers().len(), 3);
    assert_eq!(client.ncores().await.unwrap().len(), 3);

    cluster.scale(1).await.unwrap();
    assert_eq!(cluster.workers().len(), 1);
    eventually("retired workers to be dropped", || async {
        client.identity().await.unwrap().workers.len() == 1
    })
    .await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn adaptive_scaling_follows_queued_work() {
    let mut config = ClusterConfig::local(1);
    config.worker.nthreads = 1;
    config.adaptive.enabled = true;
    config.adaptive.minimum = 1;
    config.adaptive.maximum = 3;
    config.adaptive.target_duration_ms = 200;
    config.adaptive.interval_ms = 50;
    let (cluster, client, _dir) = start(config).await;

    let futures = client.map("sleep", vec![200i64; 12], false).await.unwrap();
    eventually("the pool to grow", || async { cluster.workers().len() > 1 }).await;
    assert!(cluster.workers().len() <= 3);

    client.gather::<i64>(&futures).await.unwrap();
    drop(futures);
    eventually("the pool to shrink", || async { cluster.workers().len() == 1 }).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn invalid_config_is_rejected_at_start() {
    let mut config = ClusterConfig::local(1);
    config.worker.memory.spill = 0.5;
    let err = LocalCluster::start(config, registry()).await.err().unwrap();
    assert!(matches!(err, ClusterError::Config(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compute_over_a_graph() {
    let (cluster, client, _dir) = start(ClusterConfig::local(2)).await;
    let mut graph = tessera_core::TaskGraph::new();
    let leaves: Vec<TaskKey> = (0..4i64)
        .map(|i| graph.add(Call::new("inc").arg(&i)).unwrap())
        .collect();
    let left = graph
        .add(Call::new("add").dep(leaves[0].clone()).dep(leaves[1].clone()))
        .unwrap();
    let right = graph
        .add(Call::new("add").dep(leaves[2].clone()).dep(leaves[3].clone()))
        .unwrap();
    let root = graph.add(Call::new("add").dep(left).dep(right)).unwrap();

    let values: BTreeMap<TaskKey, i64> = client.compute(&graph).await.unwrap();
    assert_eq!(values, BTreeMap::from([(root, 10)]));
    cluster.shutdown().await;
}
