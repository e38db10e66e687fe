#[cfg(test)]
mod integration_tests {
    use std::collections::BTreeMap;

    use tokio::time::{sleep, timeout, Duration};
    use tracing::info;

    use crate::coord::bully::ElectionState;
    use crate::coord::config::{ClusterConfig, PeerConfig, Timing};
    use crate::coord::core::{AlgorithmSnapshot, Command, ProcessId, ProcessSnapshot, Protocol};
    use crate::coord::error::CoordError;
    use crate::coord::events::CoordEventKind;
    use crate::coord::mutex::LockState;
    use crate::coord::simulation::{spawn_cluster, LocalCluster};

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config(capacities: &[u64], topology: BTreeMap<ProcessId, Vec<ProcessId>>) -> ClusterConfig {
        ClusterConfig {
            peers: capacities
                .iter()
                .zip(1..)
                .map(|(&capacity, id)| PeerConfig {
                    id,
                    host: "localhost".to_string(),
                    port: 9100 + id as u16,
                    capacity,
                })
                .collect(),
            topology,
            resources: vec!["r1".to_string(), "r2".to_string()],
            timing: Timing {
                election_timeout_ms: 100,
                heartbeat_interval_ms: 50,
                pong_timeout_ms: 40,
                propagation_delay_ms: 10,
                reconnect_backoff_ms: 50,
                connect_delay_ms: 0,
            },
        }
    }

    async fn snapshot(cluster: &LocalCluster, id: ProcessId) -> ProcessSnapshot {
        cluster
            .handle(id)
            .expect("process is running")
            .snapshot()
            .await
            .expect("process answers snapshots")
    }

    /// Polls snapshots of `ids` until `check` holds for all of them
    async fn wait_for<F>(cluster: &LocalCluster, ids: &[ProcessId], check: F)
    where
        F: Fn(&ProcessSnapshot) -> bool,
    {
        let polled = timeout(WAIT, async {
            loop {
                let mut all = true;
                for &id in ids {
                    if !check(&snapshot(cluster, id).await) {
                        all = false;
                        break;
                    }
                }
                if all {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "condition not reached within {:?}", WAIT);
    }

    fn delivered(snapshot: &ProcessSnapshot) -> Vec<(u64, ProcessId, String)> {
        match &snapshot.state {
            AlgorithmSnapshot::Multicast(multicast) => multicast
                .delivered
                .iter()
                .map(|m| (m.timestamp, m.sender_id, m.content.clone()))
                .collect(),
            other => panic!("not a multicast snapshot: {other:?}"),
        }
    }

    fn lock_state(snapshot: &ProcessSnapshot, resource_id: &str) -> LockState {
        match &snapshot.state {
            AlgorithmSnapshot::Mutex(resources) => resources
                .iter()
                .find(|resource| resource.resource_id == resource_id)
                .map(|resource| resource.state)
                .expect("resource is tracked"),
            other => panic!("not a mutex snapshot: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multicast_total_order_3_processes() {
        let _ = tracing_subscriber::fmt().try_init();
        info!("🧪 Starting total-order multicast test with 3 processes");

        let config = fast_config(&[0, 0, 0], BTreeMap::new());
        let cluster = spawn_cluster(&config, Protocol::Multicast).await.unwrap();

        for id in 1..=3 {
            let handle = cluster.handle(id).unwrap();
            for n in 0..3 {
                handle
                    .execute(Command::Multicast(format!("m{n} from {id}")))
                    .await
                    .unwrap();
            }
        }

        wait_for(&cluster, &[1, 2, 3], |s| delivered(s).len() == 9).await;

        let reference = delivered(&snapshot(&cluster, 1).await);
        for id in 2..=3 {
            assert_eq!(delivered(&snapshot(&cluster, id).await), reference);
        }
        let keys: Vec<(u64, ProcessId)> = reference.iter().map(|(ts, from, _)| (*ts, *from)).collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);

        info!("✅ Total-order multicast test completed");
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_mutex_handoff_on_release() {
        let _ = tracing_subscriber::fmt().try_init();

        let config = fast_config(&[0, 0, 0], BTreeMap::new());
        let cluster = spawn_cluster(&config, Protocol::Mutex).await.unwrap();
        let mut events = cluster.events.subscribe();

        cluster
            .handle(1)
            .unwrap()
            .execute(Command::Request("r1".to_string()))
            .await
            .unwrap();
        wait_for(&cluster, &[1], |s| lock_state(s, "r1") == LockState::Held).await;

        cluster
            .handle(2)
            .unwrap()
            .execute(Command::Request("r1".to_string()))
            .await
            .unwrap();
        wait_for(&cluster, &[1], |s| match &s.state {
            AlgorithmSnapshot::Mutex(resources) => resources
                .iter()
                .any(|resource| resource.resource_id == "r1" && resource.deferred == vec![2]),
            _ => false,
        })
        .await;
        assert_eq!(lock_state(&snapshot(&cluster, 2).await, "r1"), LockState::Wanted);

        // Independent resource stays available
        cluster
            .handle(3)
            .unwrap()
            .execute(Command::Request("r2".to_string()))
            .await
            .unwrap();
        wait_for(&cluster, &[3], |s| lock_state(s, "r2") == LockState::Held).await;

        cluster
            .handle(1)
            .unwrap()
            .execute(Command::Release("r1".to_string()))
            .await
            .unwrap();

        let acquired = timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("event stream open");
                if event.process_id == 2
                    && event.kind
                        == (CoordEventKind::ResourceAcquired {
                            resource_id: "r1".to_string(),
                        })
                {
                    return event;
                }
            }
        })
        .await
        .expect("process 2 enters after the release");
        assert!(acquired.clock > 0);
        assert_eq!(lock_state(&snapshot(&cluster, 1).await, "r1"), LockState::Released);

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_bully_elects_lowest_id_and_fails_over() {
        let _ = tracing_subscriber::fmt().try_init();
        info!("🧪 Starting bully failover test with 3 processes");

        let config = fast_config(&[0, 0, 0], BTreeMap::new());
        let mut cluster = spawn_cluster(&config, Protocol::Bully).await.unwrap();

        cluster
            .handle(3)
            .unwrap()
            .execute(Command::StartElection)
            .await
            .unwrap();
        wait_for(&cluster, &[1, 2, 3], |s| s.leader() == Some(1)).await;

        match snapshot(&cluster, 1).await.state {
            AlgorithmSnapshot::Bully(bully) => assert_eq!(bully.state, ElectionState::Leader),
            other => panic!("unexpected snapshot {other:?}"),
        }

        info!("💥 Crashing leader 1");
        cluster.crash(1);
        wait_for(&cluster, &[2, 3], |s| s.leader() == Some(2)).await;

        match snapshot(&cluster, 3).await.state {
            AlgorithmSnapshot::Bully(bully) => {
                assert_eq!(bully.state, ElectionState::Follower);
                assert!(!bully.in_progress);
            }
            other => panic!("unexpected snapshot {other:?}"),
        }

        info!("✅ Bully failover test completed");
        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_tree_election_on_a_line() {
        let _ = tracing_subscriber::fmt().try_init();

        let topology = BTreeMap::from([(1, vec![2]), (2, vec![1, 3]), (3, vec![2, 4]), (4, vec![3])]);
        let config = fast_config(&[10, 70, 40, 20], topology);
        let cluster = spawn_cluster(&config, Protocol::Tree).await.unwrap();

        cluster
            .handle(1)
            .unwrap()
            .execute(Command::StartElection)
            .await
            .unwrap();
        wait_for(&cluster, &[1, 2, 3, 4], |s| s.leader() == Some(2)).await;

        // Every wave is gone once the announcement went around
        wait_for(&cluster, &[1, 2, 3, 4], |s| match &s.state {
            AlgorithmSnapshot::Tree(tree) => tree.waves.is_empty(),
            _ => false,
        })
        .await;

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_unsupported_command_is_rejected() {
        let _ = tracing_subscriber::fmt().try_init();

        let config = fast_config(&[0, 0], BTreeMap::new());
        let cluster = spawn_cluster(&config, Protocol::Multicast).await.unwrap();
        let handle = cluster.handle(1).unwrap();

        let result = handle.execute(Command::StartElection).await;
        assert!(matches!(result, Err(CoordError::InvalidOperation(_))));
        let result = handle.execute(Command::Multicast("   ".to_string())).await;
        assert!(matches!(result, Err(CoordError::InvalidOperation(_))));

        // The process keeps serving after a rejection
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.id, 1);
        assert!(delivered(&snapshot).is_empty());

        cluster.shutdown();
    }

    #[tokio::test]
    async fn test_crashed_process_stops_answering() {
        let _ = tracing_subscriber::fmt().try_init();

        let config = fast_config(&[0, 0, 0], BTreeMap::new());
        let mut cluster = spawn_cluster(&config, Protocol::Mutex).await.unwrap();
        let crashed = cluster.handle(3).unwrap().clone();

        cluster.crash(3);
        assert!(!cluster.channels.is_alive(3));

        let result = timeout(WAIT, crashed.snapshot()).await.unwrap();
        assert!(matches!(result, Err(CoordError::PeerUnreachable(3))));

        // Without process 3 a request can never collect every reply
        cluster
            .handle(1)
            .unwrap()
            .execute(Command::Request("r1".to_string()))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(lock_state(&snapshot(&cluster, 1).await, "r1"), LockState::Wanted);

        cluster.shutdown();
    }
}
