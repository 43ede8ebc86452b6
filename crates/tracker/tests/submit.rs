//! End-to-end bootstrap through `submit_with_config`, with in-process workers
//! joining over loopback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracker::{
    BootstrapConfig, ErrorKind, FnSpawner, JoinError, Rank, SpawnError, TopologyKind, TrackerAddr,
    WorkerEnv, WorkerJoin, build_topology, submit_with_config,
};

type Workers = Arc<Mutex<Vec<JoinHandle<Result<WorkerEnv, JoinError>>>>>;

fn local_config(n: usize) -> BootstrapConfig {
    BootstrapConfig::new(n)
        .with_host("127.0.0.1")
        .with_port(0)
        .with_rendezvous_timeout(Duration::from_secs(20))
}

/// Spawner that starts `started` in-process workers, whatever N is.
fn task_spawner(
    started: usize,
    workers: Workers,
) -> FnSpawner<impl Fn(usize, &[String]) -> Result<(), SpawnError> + Send + Sync> {
    FnSpawner::new(move |_n: usize, args: &[String]| {
        let tracker = TrackerAddr::from_args(args).map_err(|e| SpawnError::Other(e.to_string()))?;
        let mut workers = workers.lock().unwrap();
        for i in 0..started {
            let join = WorkerJoin::new(tracker.clone(), format!("127.0.0.1:{}", 7000 + i))
                .with_release_timeout(Duration::from_secs(20));
            workers.push(tokio::spawn(join.join()));
        }
        Ok(())
    })
}

async fn collect(workers: &Workers) -> Vec<Result<WorkerEnv, JoinError>> {
    let handles: Vec<_> = workers.lock().unwrap().drain(..).collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

fn ranks(env: &WorkerEnv) -> Vec<u32> {
    env.neighbor_ranks().into_iter().map(Rank::get).collect()
}

#[tokio::test]
async fn three_auto_assigned_workers_form_a_tree() {
    let workers = Workers::default();
    let spawner = task_spawner(3, workers.clone());

    let envs = submit_with_config(local_config(3), &["worker".to_string()], &spawner)
        .await
        .unwrap();

    assert_eq!(envs.len(), 3);
    assert_eq!(ranks(&envs[0]), vec![1, 2]);
    assert_eq!(ranks(&envs[1]), vec![0]);
    assert_eq!(ranks(&envs[2]), vec![0]);

    let mut joined: Vec<WorkerEnv> = collect(&workers)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    joined.sort_by_key(|env| env.rank);
    assert_eq!(joined, envs);
}

#[tokio::test]
async fn neighbor_lists_match_topology() {
    for (n, kind) in [(1, TopologyKind::Tree), (5, TopologyKind::Tree), (4, TopologyKind::Ring)] {
        let workers = Workers::default();
        let spawner = task_spawner(n, workers.clone());

        let envs = submit_with_config(local_config(n).with_topology(kind), &[], &spawner)
            .await
            .unwrap();
        let topology = build_topology(n, kind).unwrap();

        // Every rank is advertised under one address, whoever lists it.
        let mut addrs = HashMap::new();
        for env in &envs {
            assert_eq!(env.neighbor_ranks(), topology.neighbors(env.rank));
            assert_eq!(env.world_size as usize, n);
            if n >= 2 {
                assert!(!env.neighbors.is_empty());
            }
            for peer in &env.neighbors {
                assert!(peer.addr.starts_with("127.0.0.1:70"));
                let seen = addrs.entry(peer.rank).or_insert_with(|| peer.addr.clone());
                assert_eq!(*seen, peer.addr);
            }
        }
        assert!(collect(&workers).await.iter().all(Result::is_ok));
    }
}

#[tokio::test]
async fn missing_worker_times_out_and_aborts_the_rest() {
    let workers = Workers::default();
    let spawner = task_spawner(2, workers.clone());
    let config = local_config(3).with_rendezvous_timeout(Duration::from_millis(500));

    let err = submit_with_config(config, &[], &spawner).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RendezvousTimeout);

    let results = collect(&workers).await;
    assert_eq!(results.len(), 2);
    for result in results {
        assert!(matches!(result, Err(JoinError::Aborted(_))));
    }
}
