use crate::draw::{DrawCoordinator, DrawOutcome};
use crate::join::{JoinCoordinator, JoinOutcome};
use crate::reconciler::{self, ReconcilerHandle};
use crate::reset::{ResetCoordinator, ResetOutcome};
use crate::rng::{RandomSource, ThreadRandom};
use crate::round::{ensure_round, load_participants, timed, Participant, Round, RoundRef};
use crate::{LotteryConfig, LotteryError, Result};
use starpot_core::{Amount, DocumentStore, IdentityProvider, StarpotError};
use std::future::Future;
use std::sync::Arc;

/// One participant's handle on a shared round.
pub struct LotteryClient {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    config: LotteryConfig,
    round: RoundRef,
    joiner: JoinCoordinator,
    drawer: DrawCoordinator,
    resetter: ResetCoordinator,
}

impl LotteryClient {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        config: LotteryConfig,
    ) -> Result<Self> {
        Self::with_random(store, identity, config, Arc::new(ThreadRandom))
    }

    pub fn with_random(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        config: LotteryConfig,
        rng: Arc<dyn RandomSource>,
    ) -> Result<Self> {
        config.validate()?;
        let round = RoundRef::from_config(&config)?;

        tracing::debug!("Lottery client bound to {}", round.path());
        Ok(Self {
            joiner: JoinCoordinator::new(store.clone(), round.clone(), &config),
            drawer: DrawCoordinator::new(store.clone(), round.clone(), rng, &config),
            resetter: ResetCoordinator::new(store.clone(), round.clone(), &config),
            store,
            identity,
            config,
            round,
        })
    }

    pub fn config(&self) -> &LotteryConfig {
        &self.config
    }

    pub fn round_ref(&self) -> &RoundRef {
        &self.round
    }

    pub fn identity(&self) -> Result<String> {
        self.identity.current_identity().map_err(|e| match e {
            StarpotError::Identity(reason) => LotteryError::AuthFailure(reason),
            other => LotteryError::Core(other),
        })
    }

    /// Current round, creating it if this is the first client to look.
    pub async fn round(&self) -> Result<Round> {
        timed(
            self.config.op_timeout,
            ensure_round(self.store.as_ref(), &self.round, self.config.default_entry_fee),
        )
        .await
    }

    pub async fn participants(&self) -> Result<Vec<Participant>> {
        let round = self.round().await?;
        timed(
            self.config.op_timeout,
            load_participants(self.store.as_ref(), &self.round, round.generation),
        )
        .await
    }

    pub async fn join(&self, fee: Amount) -> Result<JoinOutcome> {
        let me = self.identity()?;
        self.joiner.join(&me, fee).await
    }

    pub async fn draw(&self) -> Result<DrawOutcome> {
        self.identity()?;
        self.drawer.draw().await
    }

    pub async fn reset(&self) -> Result<ResetOutcome> {
        self.identity()?;
        self.resetter.reset().await
    }

    pub async fn join_with_retry(&self, fee: Amount) -> Result<JoinOutcome> {
        self.retrying("join", || self.join(fee)).await
    }

    pub async fn draw_with_retry(&self) -> Result<DrawOutcome> {
        self.retrying("draw", || self.draw()).await
    }

    /// Every attempt targets the generation observed before the first one,
    /// so a reset that committed but was not acknowledged is not repeated.
    pub async fn reset_with_retry(&self) -> Result<ResetOutcome> {
        self.identity()?;
        let expected = self
            .retrying("reset", || self.resetter.current_generation())
            .await?;
        self.retrying("reset", || self.resetter.reset_from(expected))
            .await
    }

    /// Starts a live view of the round for this client's identity.
    pub fn subscribe(&self) -> Result<ReconcilerHandle> {
        let me = self.identity()?;
        Ok(reconciler::spawn(
            self.store.clone(),
            self.round.clone(),
            &me,
            &self.config,
        ))
    }

    async fn retrying<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.config.retry;
        let mut tries = 1;
        loop {
            match attempt().await {
                Err(e) if e.is_transient() && tries < policy.max_attempts => {
                    let delay = policy.delay_for(tries);
                    tracing::warn!(
                        "{} failed ({}), retrying in {:?} ({}/{})",
                        operation,
                        e,
                        delay,
                        tries,
                        policy.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    tries += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::rng::ScriptedRandom;
    use crate::round::load_round;
    use async_trait::async_trait;
    use starpot_core::{
        CollectionPath, CommitReceipt, DocPath, Document, MemoryStore, StaticIdentity,
        Subscription, WatchTarget, WriteBatch,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn client(store: Arc<dyn DocumentStore>, id: &str) -> LotteryClient {
        LotteryClient::new(store, Arc::new(StaticIdentity::new(id)), test_config()).unwrap()
    }

    fn test_config() -> LotteryConfig {
        let mut config = LotteryConfig::default();
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        config
    }

    fn fee() -> Amount {
        "0.005".parse().unwrap()
    }

    /// Applies commits immediately but acknowledges the first `slow` of
    /// them only after `delay`.
    struct SlowAck {
        inner: MemoryStore,
        delay: Duration,
        slow: AtomicU32,
    }

    #[async_trait]
    impl DocumentStore for SlowAck {
        async fn get(&self, path: &DocPath) -> starpot_core::Result<Option<Document>> {
            self.inner.get(path).await
        }

        async fn list(&self, collection: &CollectionPath) -> starpot_core::Result<Vec<Document>> {
            self.inner.list(collection).await
        }

        async fn commit(&self, batch: WriteBatch) -> starpot_core::Result<CommitReceipt> {
            let receipt = self.inner.commit(batch).await?;
            let remaining = self.slow.load(Ordering::SeqCst);
            if remaining > 0 {
                self.slow.store(remaining - 1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
            }
            Ok(receipt)
        }

        async fn subscribe(&self, target: WatchTarget) -> starpot_core::Result<Subscription> {
            self.inner.subscribe(target).await
        }
    }

    /// Holds every commit until released, so a test can slip writes in
    /// between a coordinator's read and its commit.
    struct GatedCommits {
        inner: Arc<MemoryStore>,
        reached: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DocumentStore for GatedCommits {
        async fn get(&self, path: &DocPath) -> starpot_core::Result<Option<Document>> {
            self.inner.get(path).await
        }

        async fn list(&self, collection: &CollectionPath) -> starpot_core::Result<Vec<Document>> {
            self.inner.list(collection).await
        }

        async fn commit(&self, batch: WriteBatch) -> starpot_core::Result<CommitReceipt> {
            self.reached.notify_one();
            self.release.notified().await;
            self.inner.commit(batch).await
        }

        async fn subscribe(&self, target: WatchTarget) -> starpot_core::Result<Subscription> {
            self.inner.subscribe(target).await
        }
    }

    #[tokio::test]
    async fn test_full_round_cycle() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_latency(Duration::from_millis(4)));
        let alice = client(store.clone(), "alice");
        let bob = client(store.clone(), "bob");
        let carol = client(store.clone(), "carol");
        let dave = client(store.clone(), "dave");

        let mut view = bob.subscribe().unwrap();

        let (a, b, c) = tokio::join!(alice.join(fee()), bob.join(fee()), carol.join(fee()));
        for outcome in [a, b, c] {
            assert_eq!(outcome.unwrap(), JoinOutcome::Joined { generation: 0 });
        }

        let round = alice.round().await.unwrap();
        assert_eq!(round.participant_count, 3);
        assert_eq!(round.pot_total.to_string(), "0.015");

        let drawer = LotteryClient::with_random(
            store.clone(),
            Arc::new(StaticIdentity::new("alice")),
            test_config(),
            Arc::new(ScriptedRandom::new(vec![1])),
        )
        .unwrap();
        let outcome = drawer.draw().await.unwrap();
        assert_eq!(
            outcome,
            DrawOutcome::Drawn {
                winner_id: "bob".to_string(),
                prize: "0.015".parse().unwrap(),
                generation: 0,
            }
        );

        let seen = tokio::time::timeout(
            Duration::from_secs(5),
            view.wait_for(|v| v.winner_announced && v.is_settled()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(seen.has_joined);
        assert_eq!(seen.winner(), Some("bob"));

        assert_eq!(dave.join(fee()).await.unwrap(), JoinOutcome::RoundClosed);

        assert_eq!(carol.reset().await.unwrap(), ResetOutcome::Reset { generation: 1 });
        let round = dave.round().await.unwrap();
        assert_eq!(round.generation, 1);
        assert_eq!(round.participant_count, 0);
        assert_eq!(round.pot_total, Amount::ZERO);
        assert!(round.winner_id.is_none());

        assert_eq!(
            dave.join(fee()).await.unwrap(),
            JoinOutcome::Joined { generation: 1 }
        );

        let seen = tokio::time::timeout(
            Duration::from_secs(5),
            view.wait_for(|v| {
                v.participants_generation == Some(1) && v.is_settled() && !v.participants.is_empty()
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!seen.has_joined);
        let ids: Vec<&str> = seen.participants.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["dave"]);
    }

    #[tokio::test]
    async fn test_many_distinct_joins_are_all_counted() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_latency(Duration::from_millis(5)));
        let clients: Vec<LotteryClient> = (0..12)
            .map(|i| client(store.clone(), &format!("player-{:02}", i)))
            .collect();

        let outcomes = futures::future::join_all(clients.iter().map(|c| c.join(fee()))).await;
        for outcome in outcomes {
            assert!(matches!(outcome.unwrap(), JoinOutcome::Joined { .. }));
        }

        let round = clients[0].round().await.unwrap();
        assert_eq!(round.participant_count, 12);
        assert_eq!(round.pot_total, fee().checked_mul(12).unwrap());
        assert_eq!(clients[0].participants().await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_same_identity_joins_once() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_latency(Duration::from_millis(5)));
        let alice = client(store.clone(), "alice");

        let outcomes = futures::future::join_all((0..8).map(|_| alice.join(fee()))).await;
        let joined = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(JoinOutcome::Joined { .. })))
            .count();
        let repeats = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(JoinOutcome::AlreadyJoined { .. })))
            .count();
        assert_eq!(joined, 1);
        assert_eq!(repeats, 7);

        let round = alice.round().await.unwrap();
        assert_eq!(round.participant_count, 1);
        assert_eq!(round.pot_total, fee());
    }

    #[tokio::test]
    async fn test_join_racing_reset_is_closed() {
        let inner = Arc::new(MemoryStore::new());
        let gated = Arc::new(GatedCommits {
            inner: inner.clone(),
            reached: Notify::new(),
            release: Notify::new(),
        });
        let direct = client(inner.clone(), "admin");
        direct.round().await.unwrap();

        let late = client(gated.clone(), "alice");
        let pending = tokio::spawn(async move { late.join(fee()).await });

        gated.reached.notified().await;
        assert_eq!(direct.reset().await.unwrap(), ResetOutcome::Reset { generation: 1 });
        gated.release.notify_one();

        assert_eq!(pending.await.unwrap().unwrap(), JoinOutcome::RoundClosed);
        let round = direct.round().await.unwrap();
        assert_eq!(round.generation, 1);
        assert_eq!(round.participant_count, 0);
        assert_eq!(round.pot_total, Amount::ZERO);
        let round_ref = direct.round_ref().clone();
        assert!(load_participants(inner.as_ref(), &round_ref, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_draw_racing_join_stays_consistent() {
        let inner = Arc::new(MemoryStore::new());
        let gated = Arc::new(GatedCommits {
            inner: inner.clone(),
            reached: Notify::new(),
            release: Notify::new(),
        });
        let alice = client(inner.clone(), "alice");
        let bob = client(inner.clone(), "bob");
        alice.join(fee()).await.unwrap();

        let drawer = LotteryClient::with_random(
            gated.clone(),
            Arc::new(StaticIdentity::new("carol")),
            test_config(),
            Arc::new(ScriptedRandom::new(vec![0])),
        )
        .unwrap();
        let pending = tokio::spawn(async move { drawer.draw().await });

        // first commit attempt sees a stale count and is retried
        gated.reached.notified().await;
        bob.join(fee()).await.unwrap();
        gated.release.notify_one();
        gated.reached.notified().await;
        gated.release.notify_one();

        let outcome = pending.await.unwrap().unwrap();
        assert!(matches!(outcome, DrawOutcome::Drawn { ref prize, .. } if *prize == fee().checked_mul(2).unwrap()));

        let round = load_round(inner.as_ref(), alice.round_ref()).await.unwrap().unwrap();
        let participants = alice.participants().await.unwrap();
        round.check_invariants(&participants).unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_join_retries_to_already_joined() {
        let slow = Arc::new(SlowAck {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(300),
            slow: AtomicU32::new(0),
        });
        let config = test_config().with_op_timeout(Duration::from_millis(60));
        let alice = LotteryClient::new(
            slow.clone(),
            Arc::new(StaticIdentity::new("alice")),
            config.clone(),
        )
        .unwrap();
        alice.round().await.unwrap();

        // committed but never acknowledged
        slow.slow.store(1, Ordering::SeqCst);
        let outcome = alice.join_with_retry(fee()).await.unwrap();
        assert_eq!(outcome, JoinOutcome::AlreadyJoined { generation: 0 });
        assert_eq!(alice.round().await.unwrap().participant_count, 1);

        let bob = LotteryClient::new(slow.clone(), Arc::new(StaticIdentity::new("bob")), config)
            .unwrap();
        slow.slow.store(1, Ordering::SeqCst);
        let err = bob.join(fee()).await.unwrap_err();
        assert!(matches!(err, LotteryError::Timeout(_)));
        assert!(err.is_transient());
        assert_eq!(bob.participants().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_timed_out_reset_retries_without_advancing_twice() {
        let slow = Arc::new(SlowAck {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(300),
            slow: AtomicU32::new(0),
        });
        let config = test_config().with_op_timeout(Duration::from_millis(60));
        let alice = LotteryClient::new(
            slow.clone(),
            Arc::new(StaticIdentity::new("alice")),
            config.clone(),
        )
        .unwrap();
        let admin =
            LotteryClient::new(slow.clone(), Arc::new(StaticIdentity::new("admin")), config)
                .unwrap();
        alice.join(fee()).await.unwrap();

        // the reset lands but its acknowledgement misses the deadline
        slow.slow.store(1, Ordering::SeqCst);
        let outcome = admin.reset_with_retry().await.unwrap();
        assert_eq!(outcome, ResetOutcome::Reset { generation: 1 });

        let round = alice.round().await.unwrap();
        assert_eq!(round.generation, 1);
        assert_eq!(round.participant_count, 0);
        assert_eq!(
            alice.join(fee()).await.unwrap(),
            JoinOutcome::Joined { generation: 1 }
        );
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_persistent_outage() {
        let store = Arc::new(MemoryStore::new());
        let alice = client(store.clone(), "alice");
        store.set_available(false);

        let err = alice.join_with_retry(fee()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_fee_mismatch_and_auth_failure() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let alice = client(store.clone(), "alice");
        let err = alice.join("0.01".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, LotteryError::FeeMismatch { .. }));
        assert!(!err.is_transient());

        let nobody = client(store.clone(), "");
        assert!(matches!(
            nobody.join(fee()).await,
            Err(LotteryError::AuthFailure(_))
        ));
        assert!(matches!(nobody.subscribe(), Err(LotteryError::AuthFailure(_))));
        assert_eq!(alice.round().await.unwrap().participant_count, 0);
    }
}
