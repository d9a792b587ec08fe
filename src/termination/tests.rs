//! Termination Module Tests
//!
//! ## Test Scopes
//! - **Group state**: counters, immutable totals, idempotent END.
//! - **Protocol**: counting checks and the post-order cascade over an in-memory cluster.
//! - **Recovery**: rechecking unanswered counts and forgetting old END records.

#[cfg(test)]
mod tests {
    use crate::error::{ClusterError, Result};
    use crate::fabric::protocol::{GroupQuery, NullAchieved, Notice, Question};
    use crate::routing::ClusterLink;
    use crate::stage::Handler;
    use crate::termination::{GroupStore, TerminationDetector};
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct Member {
        key: String,
        groups: Arc<GroupStore>,
        detector: TerminationDetector,
    }

    /// Members answer each other's asks by direct calls; notices run on tasks.
    struct Cluster {
        members: Vec<Arc<Member>>,
    }

    impl Cluster {
        fn new(keys: &[&str]) -> Arc<Self> {
            let members = keys
                .iter()
                .map(|key| {
                    let groups = GroupStore::new();
                    Arc::new(Member {
                        key: key.to_string(),
                        detector: TerminationDetector::new(groups.clone()),
                        groups,
                    })
                })
                .collect();
            Arc::new(Self { members })
        }

        fn member(&self, key: &str) -> Arc<Member> {
            self.members.iter().find(|m| m.key == key).unwrap().clone()
        }

        fn link(self: &Arc<Self>, key: &str) -> MemLink {
            MemLink {
                local: key.to_string(),
                cluster: self.clone(),
            }
        }
    }

    struct MemLink {
        local: String,
        cluster: Arc<Cluster>,
    }

    impl ClusterLink for MemLink {
        fn local_key(&self) -> &str {
            &self.local
        }

        fn member_keys(&self) -> Vec<String> {
            self.cluster.members.iter().map(|m| m.key.clone()).collect()
        }

        fn ask(&self, peer: &str, question: Question, data: Value) -> BoxFuture<'static, Result<Value>> {
            answer(self.cluster.member(peer), question, data).boxed()
        }

        fn notify(&self, peer: &str, notice: Notice, data: Value) -> Result<()> {
            assert_eq!(notice, Notice::NullAchieved);
            let payload: NullAchieved = serde_json::from_value(data)?;
            let link = self.cluster.link(peer);
            let member = self.cluster.member(peer);
            tokio::spawn(async move {
                member
                    .detector
                    .on_null_achieved(&link, &payload.group, payload.total_sum)
                    .await
                    .unwrap();
            });
            Ok(())
        }
    }

    async fn answer(member: Arc<Member>, question: Question, data: Value) -> Result<Value> {
        let query: GroupQuery = serde_json::from_value(data)?;
        match question {
            Question::CountProcessed => Ok(json!(member.groups.processed(&query.group))),
            Question::EndProcessing => {
                let summary = member.detector.end_group(&query.group).await?;
                Ok(serde_json::to_value(summary)?)
            }
            _ => Ok(Value::Null),
        }
    }

    /// Simulates one unit of `group` processed on `member`, sending `sends`
    /// units into `child`.
    fn process_unit(member: &Member, group: &str, child: Option<(&str, u64)>) -> bool {
        let state = member.groups.open(group);
        state.begin();
        if let Some((child, sends)) = child {
            for _ in 0..sends {
                state.count_child(child);
            }
        }
        state.complete()
    }

    /// Installs a live instance for `unit` whose on_finish bumps `finishes`.
    fn install_instance(member: &Member, group: &str, unit: &str, finishes: Arc<AtomicUsize>) {
        let state = member.groups.open(group);
        let handler = Handler::new(|_data| async { Ok(()) }).with_finish(move || {
            let finishes = finishes.clone();
            async move {
                finishes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let instance: Box<dyn crate::stage::StageInstance> = Box::new(handler);
        let _ = state.instance_slot(unit).set(Arc::new(Mutex::new(instance)));
        member.groups.claim_unit(unit);
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition should hold");
    }

    // ============================================================
    // GROUP STATE
    // ============================================================

    #[test]
    fn test_total_is_set_once() {
        let groups = GroupStore::new();
        let state = groups.open("g");

        assert_eq!(state.set_total(3), 3);
        assert_eq!(state.set_total(7), 3);
        assert_eq!(state.total(), Some(3));
    }

    #[test]
    fn test_complete_reports_drain() {
        let groups = GroupStore::new();
        let state = groups.open("g");

        state.begin();
        state.begin();

        assert!(!state.complete());
        assert!(state.complete());
        assert_eq!(state.processed(), 2);
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn test_uncount_child_removes_empty_entries() {
        let groups = GroupStore::new();
        let state = groups.open("g");

        state.count_child("c");
        state.count_child("c");
        state.uncount_child("c");
        assert_eq!(state.children().get("c"), Some(&1));

        state.uncount_child("c");
        assert!(state.children().is_empty());
    }

    #[test]
    fn test_unit_ownership_is_refcounted() {
        let groups = GroupStore::new();

        groups.claim_unit("u");
        groups.claim_unit("u");
        groups.release_unit("u");
        assert!(groups.owns_unit("u"));

        groups.release_unit("u");
        assert!(!groups.owns_unit("u"));
    }

    #[tokio::test]
    async fn test_end_group_runs_on_finish_once_and_repeats_summary() {
        // ARRANGE
        let groups = GroupStore::new();
        let detector = TerminationDetector::new(groups.clone());
        let finishes = Arc::new(AtomicUsize::new(0));
        let member = Member {
            key: "a".into(),
            groups: groups.clone(),
            detector,
        };
        install_instance(&member, "g", "u1", finishes.clone());
        install_instance(&member, "g", "u2", finishes.clone());
        process_unit(&member, "g", Some(("child", 2)));

        // ACT
        let first = member.detector.end_group("g").await.unwrap();
        let second = member.detector.end_group("g").await.unwrap();

        // ASSERT
        assert_eq!(finishes.load(Ordering::SeqCst), 2);
        assert_eq!(first, second);
        assert_eq!(first.processed, 1);
        assert_eq!(first.children.get("child"), Some(&2));
        assert!(groups.get("g").is_none());
        assert!(groups.is_finished("g"));
        assert!(!groups.owns_unit("u1"));
        assert_eq!(groups.processed("g"), 1);
    }

    #[tokio::test]
    async fn test_end_of_untouched_group_is_empty() {
        let groups = GroupStore::new();
        let detector = TerminationDetector::new(groups.clone());

        let summary = detector.end_group("never-seen").await.unwrap();

        assert_eq!(summary.processed, 0);
        assert!(summary.children.is_empty());
    }

    // ============================================================
    // PROTOCOL
    // ============================================================

    #[tokio::test]
    async fn test_check_waits_for_total_and_full_count() {
        let cluster = Cluster::new(&["a", "b"]);
        let (a, b) = (cluster.member("a"), cluster.member("b"));
        let link = cluster.link("a");

        // No total yet.
        process_unit(&a, "g", None);
        assert!(!a.detector.check(&link, "g").await.unwrap());

        // Total known, one of two units missing.
        a.groups.open("g").set_total(2);
        assert!(!a.detector.check(&link, "g").await.unwrap());

        // Last unit lands on b.
        process_unit(&b, "g", None);
        assert!(a.detector.check(&link, "g").await.unwrap());
        assert!(a.groups.is_finished("g"));
        assert!(b.groups.is_finished("g"));
    }

    #[tokio::test]
    async fn test_duplicate_deliveries_still_end_the_group() {
        let cluster = Cluster::new(&["a", "b"]);
        let (a, b) = (cluster.member("a"), cluster.member("b"));

        process_unit(&a, "g", None);
        process_unit(&b, "g", None);
        process_unit(&b, "g", None);
        a.detector
            .on_null_achieved(&cluster.link("a"), "g", 2)
            .await
            .unwrap();

        assert!(a.groups.is_finished("g"));
    }

    #[tokio::test]
    async fn test_cascade_ends_every_group_of_a_fan_out() {
        // ARRANGE: root (3 units) fans out into c1 (2 units) and c2 (2 units);
        // c1 fans out further into leaf (1 unit).
        let cluster = Cluster::new(&["a", "b", "c"]);
        let (a, b, c) = (cluster.member("a"), cluster.member("b"), cluster.member("c"));
        let finishes = Arc::new(AtomicUsize::new(0));
        install_instance(&b, "c1", "keyed-unit", finishes.clone());

        process_unit(&a, "root", Some(("c1", 1)));
        process_unit(&a, "root", Some(("c1", 1)));
        process_unit(&b, "root", Some(("c2", 2)));

        // ACT: the submitter announces the root total
        a.detector
            .on_null_achieved(&cluster.link("a"), "root", 3)
            .await
            .unwrap();

        // ASSERT: root ended, children now know their totals
        assert!(cluster.members.iter().all(|m| m.groups.is_finished("root")));
        wait_until(|| {
            cluster
                .members
                .iter()
                .all(|m| {
                    m.groups.get("c1").and_then(|s| s.total()) == Some(2)
                        && m.groups.get("c2").and_then(|s| s.total()) == Some(2)
                })
        })
        .await;
        assert!(!b.groups.is_finished("c1"));

        // ACT: children are processed; the node draining last runs the check
        process_unit(&b, "c1", Some(("leaf", 1)));
        if process_unit(&c, "c1", None) {
            c.detector.check(&cluster.link("c"), "c1").await.unwrap();
        }
        process_unit(&a, "c2", None);
        if process_unit(&c, "c2", None) {
            c.detector.check(&cluster.link("c"), "c2").await.unwrap();
        }

        // ASSERT: c1 and c2 ended everywhere; the keyed instance finished once
        assert!(cluster.members.iter().all(|m| m.groups.is_finished("c1")));
        assert!(cluster.members.iter().all(|m| m.groups.is_finished("c2")));
        assert_eq!(finishes.load(Ordering::SeqCst), 1);

        // ACT: the leaf unit completes after its total arrives
        wait_until(|| {
            cluster
                .members
                .iter()
                .all(|m| m.groups.get("leaf").and_then(|s| s.total()) == Some(1))
        })
        .await;
        if process_unit(&a, "leaf", None) {
            a.detector.check(&cluster.link("a"), "leaf").await.unwrap();
        }

        // ASSERT
        assert!(cluster.members.iter().all(|m| m.groups.is_finished("leaf")));
    }

    #[tokio::test]
    async fn test_late_null_achieved_does_not_resurrect_group() {
        let cluster = Cluster::new(&["a"]);
        let a = cluster.member("a");
        process_unit(&a, "g", None);
        a.detector
            .on_null_achieved(&cluster.link("a"), "g", 1)
            .await
            .unwrap();
        assert!(a.groups.is_finished("g"));

        a.detector
            .on_null_achieved(&cluster.link("a"), "g", 1)
            .await
            .unwrap();

        assert!(a.groups.get("g").is_none());
    }

    #[tokio::test]
    async fn test_empty_session_ends_immediately() {
        let cluster = Cluster::new(&["a", "b"]);
        let a = cluster.member("a");

        a.detector
            .on_null_achieved(&cluster.link("a"), "root", 0)
            .await
            .unwrap();

        assert!(cluster.members.iter().all(|m| m.groups.is_finished("root")));
    }

    /// A link on which every ask fails.
    struct Silent;

    impl ClusterLink for Silent {
        fn local_key(&self) -> &str {
            "a"
        }
        fn member_keys(&self) -> Vec<String> {
            vec!["a".into()]
        }
        fn ask(&self, peer: &str, _q: Question, _d: Value) -> BoxFuture<'static, Result<Value>> {
            let peer = peer.to_string();
            async move { Err(ClusterError::ChannelClosed(peer)) }.boxed()
        }
        fn notify(&self, _p: &str, _n: Notice, _d: Value) -> Result<()> {
            Ok(())
        }
    }

    /// Wraps a cluster link; the first `failures` counts asked of `peer` fail.
    struct Flaky {
        inner: MemLink,
        peer: String,
        failures: AtomicUsize,
    }

    impl ClusterLink for Flaky {
        fn local_key(&self) -> &str {
            self.inner.local_key()
        }
        fn member_keys(&self) -> Vec<String> {
            self.inner.member_keys()
        }
        fn ask(&self, peer: &str, question: Question, data: Value) -> BoxFuture<'static, Result<Value>> {
            let fail = question == Question::CountProcessed
                && peer == self.peer
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if fail {
                let peer = peer.to_string();
                return async move { Err(ClusterError::ChannelClosed(peer)) }.boxed();
            }
            self.inner.ask(peer, question, data)
        }
        fn notify(&self, peer: &str, notice: Notice, data: Value) -> Result<()> {
            self.inner.notify(peer, notice, data)
        }
    }

    #[tokio::test]
    async fn test_unanswered_count_is_rechecked_until_answered() {
        // ARRANGE: both units are done, but b misses the first count
        let cluster = Cluster::new(&["a", "b"]);
        let (a, b) = (cluster.member("a"), cluster.member("b"));
        process_unit(&a, "g", None);
        process_unit(&b, "g", None);
        a.groups.open("g").set_total(2);
        let link = Flaky {
            inner: cluster.link("a"),
            peer: "b".into(),
            failures: AtomicUsize::new(1),
        };

        // ACT
        let ended = tokio::time::timeout(Duration::from_secs(5), a.detector.check(&link, "g"))
            .await
            .unwrap()
            .unwrap();

        // ASSERT
        assert!(ended);
        assert_eq!(link.failures.load(Ordering::SeqCst), 0);
        assert!(a.groups.is_finished("g"));
        assert!(b.groups.is_finished("g"));
    }

    #[tokio::test]
    async fn test_unanswered_count_keeps_rechecking_until_group_ends() {
        // ARRANGE
        let groups = GroupStore::new();
        let detector = Arc::new(
            TerminationDetector::new(groups.clone())
                .with_recheck(Duration::from_millis(5), Duration::from_millis(20)),
        );
        groups.open("g").set_total(1);

        // ACT
        let checking = {
            let detector = detector.clone();
            tokio::spawn(async move { detector.check(&Silent, "g").await })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;

        // ASSERT: still waiting, and a second check does not start another loop
        assert!(!checking.is_finished());
        assert!(!groups.is_finished("g"));
        assert!(!detector.check(&Silent, "g").await.unwrap());

        // ACT: the group ends through another finisher
        detector.end_group("g").await.unwrap();

        // ASSERT
        let ended_here = tokio::time::timeout(Duration::from_secs(1), checking)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!ended_here);
    }

    #[tokio::test]
    async fn test_evict_ended_forgets_records_past_retention() {
        // ARRANGE
        let cluster = Cluster::new(&["a"]);
        let a = cluster.member("a");
        process_unit(&a, "g", None);
        a.detector
            .on_null_achieved(&cluster.link("a"), "g", 1)
            .await
            .unwrap();
        assert_eq!(a.groups.ended_groups(), 1);
        assert_eq!(a.detector.finishing_len(), 1);

        // ACT
        let kept = a.detector.evict_ended(Duration::from_secs(60));
        let evicted = a.detector.evict_ended(Duration::ZERO);

        // ASSERT
        assert_eq!(kept, 0);
        assert_eq!(evicted, 1);
        assert_eq!(a.groups.ended_groups(), 0);
        assert_eq!(a.detector.finishing_len(), 0);
        assert!(!a.groups.is_finished("g"));
    }

    #[test]
    fn test_running_end_is_never_evicted() {
        let groups = GroupStore::new();
        let _slot = groups.finish_slot("g");

        assert!(groups.evict_ended(Duration::ZERO).is_empty());
        assert!(groups.is_finished("g"));
    }
}
