//! Node Module Tests
//!
//! ## Test Scopes
//! - **Answers**: control-plane questions served from local state.
//! - **Sessions**: submission failures and completion signalling.
//! - **Cluster**: two nodes over loopback TCP, from `run_stream` to the end
//!   of every group, including a reconnect in the middle of a session.
//! - **Ledgers**: sweeping END records and sticky bindings.

#[cfg(test)]
mod tests {
    use crate::config::{ClusterConfig, RoutingConfig};
    use crate::error::ClusterError;
    use crate::fabric::protocol::{GroupSummary, Question};
    use crate::fabric::{ConnectionDescriptor, RetryPolicy};
    use crate::ids::group_hash;
    use crate::node::Node;
    use crate::stage::{Handler, StageRegistry, StageSender};
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::watch;

    fn free_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(10), Duration::from_millis(50))
    }

    fn descriptors(keys: &[&str]) -> Vec<ConnectionDescriptor> {
        keys.iter()
            .map(|key| ConnectionDescriptor {
                key: key.to_string(),
                manager: free_addr(),
                worker: free_addr(),
                retry: fast_policy(),
            })
            .collect()
    }

    fn config(local: &str, peers: &[ConnectionDescriptor], dir: &Path) -> ClusterConfig {
        let own = peers.iter().find(|p| p.key == local).unwrap();
        ClusterConfig {
            local_key: local.to_string(),
            manager_bind: own.manager.clone(),
            worker_bind: own.worker.clone(),
            queue_dir: dir.join(local),
            memory_limit: 2,
            concurrency: 4,
            ask_timeout_ms: Some(2_000),
            ledger_retention_ms: 600_000,
            listen_retry: fast_policy(),
            routing: RoutingConfig {
                availability_ttl_ms: 10_000,
                poll_interval_ms: 20,
                poll_ceiling_ms: 2_000,
            },
            peers: peers.to_vec(),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    /// "init" forwards every unit to "echo" unchanged.
    fn register_forwarder(registry: &StageRegistry) {
        registry.register("init", |_key, send: StageSender| async move {
            Ok(Handler::new(move |data: Value| {
                let send = send.clone();
                async move { send.send("echo", None, data).await.map_err(anyhow::Error::from) }
            }))
        });
    }

    /// "init" forwards to "echo" after `delay`, keeping a stream in flight.
    fn register_slow_forwarder(registry: &StageRegistry, delay: Duration) {
        registry.register("init", move |_key, send: StageSender| async move {
            Ok(Handler::new(move |data: Value| {
                let send = send.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    send.send("echo", None, data).await.map_err(anyhow::Error::from)
                }
            }))
        });
    }

    /// "echo" records every unit it sees.
    fn register_echo(registry: &StageRegistry) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        registry.register("echo", move |_key, _send| {
            let recorded = recorded.clone();
            async move {
                Ok(Handler::new(move |data: Value| {
                    recorded.lock().unwrap().push(data);
                    async { Ok(()) }
                }))
            }
        });
        seen
    }

    // ============================================================
    // ANSWERS
    // ============================================================

    #[tokio::test]
    async fn test_answers_come_from_local_state() {
        let dir = TempDir::new().unwrap();
        let peers = descriptors(&["a"]);
        let registry = StageRegistry::new();
        register_echo(&registry);
        let node = Node::new(config("a", &peers, dir.path()), registry);

        let stage_server = node
            .answer(Question::GetStageServer, json!({"stage": "echo"}))
            .await
            .unwrap();
        let missing = node
            .answer(Question::GetStageServer, json!({"stage": "missing"}))
            .await
            .unwrap();
        let capable = node
            .answer(Question::CanGetStage, json!({"stage": "echo"}))
            .await
            .unwrap();
        let owner = node
            .answer(
                Question::GetSessionStageKeyServer,
                json!({"session": "s", "stage": "echo", "key": "k"}),
            )
            .await
            .unwrap();
        let count = node
            .answer(Question::CountProcessed, json!({"group": "g"}))
            .await
            .unwrap();

        assert_eq!(stage_server, json!("a"));
        assert_eq!(missing, Value::Null);
        assert_eq!(capable, json!(true));
        assert_eq!(owner, Value::Null);
        assert_eq!(count, json!(0));
    }

    #[tokio::test]
    async fn test_malformed_question_payload_is_a_protocol_error() {
        let dir = TempDir::new().unwrap();
        let peers = descriptors(&["a"]);
        let node = Node::new(config("a", &peers, dir.path()), StageRegistry::new());

        let result = node.answer(Question::CountProcessed, json!({"nope": 1})).await;

        assert!(matches!(result, Err(ClusterError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_ending_a_root_group_signals_its_session() {
        // ARRANGE
        let dir = TempDir::new().unwrap();
        let peers = descriptors(&["a"]);
        let node = Node::new(config("a", &peers, dir.path()), StageRegistry::new());
        let (done_tx, done) = watch::channel(false);
        node.sessions.insert("root".to_string(), done_tx);

        // ACT
        let summary = node
            .answer(Question::EndProcessing, json!({"group": "root"}))
            .await
            .unwrap();

        // ASSERT
        assert_eq!(serde_json::from_value::<GroupSummary>(summary).unwrap(), GroupSummary::default());
        assert!(*done.borrow());
        assert!(node.sessions.is_empty());
        assert!(node.groups().is_finished("root"));
    }

    // ============================================================
    // SESSIONS
    // ============================================================

    #[tokio::test]
    async fn test_run_stream_without_capable_node_fails_fast() {
        let dir = TempDir::new().unwrap();
        let peers = descriptors(&["a"]);
        let node = Node::start(config("a", &peers, dir.path()), StageRegistry::new())
            .await
            .unwrap();

        let result = node.run_stream("missing", None, "x\n".as_bytes()).await;

        match result {
            Err(ClusterError::NoCapablePeer { stage }) => assert_eq!(stage, "missing"),
            other => panic!("expected NoCapablePeer, got {:?}", other),
        }
        assert!(node.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_single_node_session_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let peers = descriptors(&["a"]);
        let registry = StageRegistry::new();
        register_forwarder(&registry);
        let seen = register_echo(&registry);
        let node = Node::start(config("a", &peers, dir.path()), registry).await.unwrap();

        let mut session = node
            .run_stream("init", None, "x\ny\n".as_bytes())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), session.finished())
            .await
            .unwrap()
            .unwrap();

        assert!(session.is_finished());
        assert_eq!(session.units, 2);
        let child = group_hash(&session.group, "echo");
        wait_until(|| node.groups().summary(&child).is_some()).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(node.groups().summary(&child).unwrap().processed, 2);
    }

    // ============================================================
    // CLUSTER
    // ============================================================

    #[tokio::test]
    async fn test_two_nodes_forward_units_and_end_every_group() {
        // ARRANGE: "init" only on a, "echo" only on b
        let dir = TempDir::new().unwrap();
        let peers = descriptors(&["a", "b"]);
        let registry_a = StageRegistry::new();
        register_forwarder(&registry_a);
        let registry_b = StageRegistry::new();
        let seen = register_echo(&registry_b);

        let a = Node::start(config("a", &peers, dir.path()), registry_a).await.unwrap();
        let b = Node::start(config("b", &peers, dir.path()), registry_b).await.unwrap();
        wait_until(|| a.fabric().connections().len() == 1 && b.fabric().connections().len() == 1).await;

        // ACT
        let mut session = a
            .run_stream("init", None, "one\ntwo\nthree\n".as_bytes())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), session.finished())
            .await
            .unwrap()
            .unwrap();

        // ASSERT: the root ended with three units, all of them echoed on b
        assert_eq!(session.units, 3);
        assert_eq!(a.groups().summary(&session.group).unwrap().processed, 3);
        let child = group_hash(&session.group, "echo");
        wait_until(|| a.groups().summary(&child).is_some() && b.groups().summary(&child).is_some()).await;

        let mut echoed: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        echoed.sort();
        assert_eq!(echoed, vec!["one", "three", "two"]);
        assert_eq!(b.groups().summary(&child).unwrap().processed, 3);
        assert_eq!(a.groups().summary(&child).unwrap().processed, 0);
    }

    #[tokio::test]
    async fn test_keyed_session_uses_one_remote_instance() {
        // ARRANGE: "count" only on b, one handler at a time so the
        // end-of-key sentinel runs after the last line
        let dir = TempDir::new().unwrap();
        let peers = descriptors(&["a", "b"]);
        let created = Arc::new(AtomicUsize::new(0));
        let totals = Arc::new(Mutex::new(Vec::new()));
        let registry_b = StageRegistry::new();
        {
            let (created, totals) = (created.clone(), totals.clone());
            registry_b.register("count", move |_key, _send| {
                let (created, totals) = (created.clone(), totals.clone());
                async move {
                    created.fetch_add(1, Ordering::SeqCst);
                    let lines = Arc::new(AtomicUsize::new(0));
                    let counted = lines.clone();
                    Ok(Handler::new(move |_data: Value| {
                        counted.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    })
                    .with_finish(move || {
                        totals.lock().unwrap().push(lines.load(Ordering::SeqCst));
                        async { Ok(()) }
                    }))
                }
            });
        }

        let mut config_a = config("a", &peers, dir.path());
        let mut config_b = config("b", &peers, dir.path());
        config_a.concurrency = 1;
        config_b.concurrency = 1;
        let a = Node::start(config_a, StageRegistry::new()).await.unwrap();
        let b = Node::start(config_b, registry_b).await.unwrap();
        wait_until(|| a.fabric().connections().len() == 1).await;

        // ACT
        let mut session = a
            .run_stream("count", Some("k"), "x\ny\nz\n".as_bytes())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), session.finished())
            .await
            .unwrap()
            .unwrap();

        // ASSERT: three lines plus the sentinel, one instance, finished once
        wait_until(|| b.groups().summary(&session.group).is_some()).await;
        assert_eq!(session.units, 4);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(*totals.lock().unwrap(), vec![3]);
        assert_eq!(a.router().binding(&session.session.0, "count", Some("k")).as_deref(), Some("b"));
        assert_eq!(b.groups().summary(&session.group).unwrap().processed, 4);
    }

    #[tokio::test]
    async fn test_session_survives_reconnect_mid_stream() {
        // ARRANGE: a forwards slowly to b, so lines are still flowing when
        // a drops and redials its channels to b
        let dir = TempDir::new().unwrap();
        let peers = descriptors(&["a", "b"]);
        let registry_a = StageRegistry::new();
        register_slow_forwarder(&registry_a, Duration::from_millis(10));
        let registry_b = StageRegistry::new();
        let seen = register_echo(&registry_b);

        let mut config_a = config("a", &peers, dir.path());
        config_a.concurrency = 1;
        let a = Node::start(config_a, registry_a).await.unwrap();
        let b = Node::start(config("b", &peers, dir.path()), registry_b).await.unwrap();
        wait_until(|| a.fabric().connections().len() == 1 && b.fabric().connections().len() == 1).await;

        let input: String = (0..30).map(|i| format!("line-{}\n", i)).collect();
        let expected: HashSet<String> = (0..30).map(|i| format!("line-{}", i)).collect();

        // ACT
        let redial = {
            let (a, seen) = (a.clone(), seen.clone());
            tokio::spawn(async move {
                wait_until(|| seen.lock().unwrap().len() >= 5).await;
                a.fabric().peer("b").unwrap().reconnect();
            })
        };
        let mut session = a.run_stream("init", None, input.as_bytes()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(20), session.finished())
            .await
            .unwrap()
            .unwrap();
        redial.await.unwrap();

        // ASSERT: every line reached b at least once and every group ended
        let child = group_hash(&session.group, "echo");
        wait_until(|| b.groups().summary(&child).is_some()).await;
        let echoed: HashSet<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(session.units, 30);
        assert_eq!(echoed, expected);
        assert!(b.groups().summary(&child).unwrap().processed >= 30);
    }

    // ============================================================
    // LEDGERS
    // ============================================================

    #[tokio::test]
    async fn test_sweep_forgets_ended_groups_and_idle_bindings() {
        // ARRANGE: a finished keyed session leaves an END record and a binding
        let dir = TempDir::new().unwrap();
        let peers = descriptors(&["a"]);
        let registry = StageRegistry::new();
        register_echo(&registry);
        let node = Node::start(config("a", &peers, dir.path()), registry).await.unwrap();

        let mut session = node
            .run_stream("echo", Some("k"), "x\ny\n".as_bytes())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), session.finished())
            .await
            .unwrap()
            .unwrap();
        assert!(node.groups().summary(&session.group).is_some());
        assert_eq!(node.router().sticky().len(), 1);

        // ACT + ASSERT: young records survive a sweep
        node.sweep_ledgers(Duration::from_secs(60));
        assert!(node.groups().is_finished(&session.group));
        assert_eq!(node.router().sticky().len(), 1);

        // ACT + ASSERT: expired records are gone
        node.sweep_ledgers(Duration::ZERO);
        assert_eq!(node.groups().ended_groups(), 0);
        assert!(node.router().sticky().is_empty());
    }
}
