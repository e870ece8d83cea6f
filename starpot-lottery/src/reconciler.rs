//! Live, authoritative view of a round.
//!
//! Two independent push streams feed the view: the round document and the
//! participant collection of the generation the round currently points at.
//! [`RoundView::apply`] folds one typed event into the view and tells the
//! owning task what it must do next; the task in [`spawn`] owns the
//! subscriptions, executes those effects and publishes the view through a
//! `tokio::sync::watch` channel whenever its content actually changes.

use crate::config::RetryPolicy;
use crate::round::{ensure_round, load_participants, load_round, Participant, Round, RoundRef};
use crate::{LotteryConfig, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use starpot_core::{Amount, DocumentStore, Subscription, WatchEvent, WatchTarget};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Connectivity {
    Connecting,
    Live,
    Degraded(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Consistency {
    /// Both streams agree on generation and participant count.
    Settled,
    /// One stream is ahead of the other.
    Settling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundView {
    pub self_id: String,
    pub round: Option<Round>,
    /// Sorted by id, always from `participants_generation`.
    pub participants: Vec<Participant>,
    pub participants_generation: Option<u64>,
    pub has_joined: bool,
    /// Set when this view watched the current generation go from open to
    /// drawn.
    pub winner_announced: bool,
    pub connectivity: Connectivity,
    pub consistency: Consistency,
    pub last_violation: Option<String>,
    #[serde(skip)]
    subscribed_generation: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    Round(Option<Round>),
    Participants {
        generation: u64,
        participants: Vec<Participant>,
    },
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEffect {
    None,
    /// The round document does not exist.
    InitializeRound,
    /// Drop the participant subscription and watch this generation instead.
    Resubscribe { generation: u64 },
    /// Re-read both streams with plain reads.
    ForceResync(String),
    /// Back off, then subscribe to the round again.
    Reconnect,
}

impl RoundView {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            round: None,
            participants: Vec::new(),
            participants_generation: None,
            has_joined: false,
            winner_announced: false,
            connectivity: Connectivity::Connecting,
            consistency: Consistency::Settling,
            last_violation: None,
            subscribed_generation: None,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.round.as_ref().map(|r| r.generation)
    }

    pub fn winner(&self) -> Option<&str> {
        self.round.as_ref().and_then(|r| r.winner_id.as_deref())
    }

    pub fn is_live(&self) -> bool {
        self.connectivity == Connectivity::Live
    }

    pub fn is_settled(&self) -> bool {
        self.consistency == Consistency::Settled
    }

    /// Hex SHA-256 of the serialized view.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn apply(&mut self, event: ViewEvent) -> ViewEffect {
        match event {
            ViewEvent::Round(None) => {
                tracing::debug!("Round document absent");
                self.connectivity = Connectivity::Live;
                self.round = None;
                self.clear_participants();
                self.subscribed_generation = None;
                self.winner_announced = false;
                self.consistency = Consistency::Settling;
                ViewEffect::InitializeRound
            }
            ViewEvent::Round(Some(round)) => {
                self.connectivity = Connectivity::Live;
                self.apply_round(round)
            }
            ViewEvent::Participants {
                generation,
                participants,
            } => {
                self.connectivity = Connectivity::Live;
                if self.subscribed_generation != Some(generation) {
                    tracing::debug!(
                        "Discarding participant snapshot of stale generation {}",
                        generation
                    );
                    return ViewEffect::None;
                }
                self.has_joined = participants.iter().any(|p| p.id == self.self_id);
                self.participants = participants;
                self.participants_generation = Some(generation);
                self.settle()
            }
            ViewEvent::Degraded(reason) => {
                tracing::warn!("Round view degraded: {}", reason);
                self.connectivity = Connectivity::Degraded(reason);
                self.consistency = Consistency::Settling;
                self.subscribed_generation = None;
                ViewEffect::Reconnect
            }
        }
    }

    fn apply_round(&mut self, round: Round) -> ViewEffect {
        let generation = round.generation;
        if let Some(current) = &self.round {
            if generation < current.generation {
                tracing::debug!(
                    "Ignoring round snapshot of generation {} behind {}",
                    generation,
                    current.generation
                );
                return ViewEffect::None;
            }
        }

        let previous = self.round.replace(round);
        match previous {
            Some(prev) if prev.generation == generation => {
                if prev.winner_id.is_none() && self.winner().is_some() {
                    tracing::info!(
                        "Winner announced for generation {}: {}",
                        generation,
                        self.winner().unwrap_or_default()
                    );
                    self.winner_announced = true;
                }
            }
            _ => self.winner_announced = false,
        }

        if self.participants_generation.is_some_and(|g| g != generation) {
            self.clear_participants();
        }

        if self.subscribed_generation != Some(generation) {
            tracing::debug!("Following participants of generation {}", generation);
            self.subscribed_generation = Some(generation);
            self.consistency = Consistency::Settling;
            return ViewEffect::Resubscribe { generation };
        }

        self.settle()
    }

    fn clear_participants(&mut self) {
        self.participants.clear();
        self.participants_generation = None;
        self.has_joined = false;
    }

    fn settle(&mut self) -> ViewEffect {
        let Some(round) = &self.round else {
            self.consistency = Consistency::Settling;
            return ViewEffect::None;
        };

        // Streams are not ordered against each other; a count mismatch is a
        // window, not an error.
        if self.participants_generation != Some(round.generation)
            || round.participant_count != self.participants.len() as u64
        {
            self.consistency = Consistency::Settling;
            return ViewEffect::None;
        }

        self.consistency = Consistency::Settled;
        match round.check_invariants(&self.participants) {
            Ok(()) => {
                self.last_violation = None;
                ViewEffect::None
            }
            Err(violation) => {
                if self.last_violation.as_deref() == Some(violation.as_str()) {
                    return ViewEffect::None;
                }
                tracing::warn!(
                    "Round generation {} violates invariants: {}",
                    round.generation,
                    violation
                );
                self.last_violation = Some(violation.clone());
                ViewEffect::ForceResync(violation)
            }
        }
    }
}

/// Subscriber side of a running reconciler. Dropping it stops the task.
pub struct ReconcilerHandle {
    rx: watch::Receiver<RoundView>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    pub fn view(&self) -> RoundView {
        self.rx.borrow().clone()
    }

    pub fn watcher(&self) -> watch::Receiver<RoundView> {
        self.rx.clone()
    }

    /// Waits for the next published view.
    pub async fn changed(&mut self) -> Option<RoundView> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Waits until a published view satisfies `predicate`.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<RoundView>
    where
        F: FnMut(&RoundView) -> bool,
    {
        loop {
            {
                let view = self.rx.borrow_and_update();
                if predicate(&view) {
                    return Some(view.clone());
                }
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub fn shutdown(self) {
        tracing::debug!("Reconciler for {} shutting down", self.rx.borrow().self_id);
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Incoming {
    Round(Option<WatchEvent>),
    Participants(u64, Option<WatchEvent>),
    Closed,
}

struct ReconcilerTask {
    store: Arc<dyn DocumentStore>,
    round: RoundRef,
    default_fee: Amount,
    retry: RetryPolicy,
    view: RoundView,
    tx: watch::Sender<RoundView>,
    published: String,
    round_sub: Option<Subscription>,
    participants_sub: Option<(u64, Subscription)>,
    failures: u32,
}

/// Starts reconciling `round` for `self_id` on the current tokio runtime.
pub fn spawn(
    store: Arc<dyn DocumentStore>,
    round: RoundRef,
    self_id: &str,
    config: &LotteryConfig,
) -> ReconcilerHandle {
    let view = RoundView::new(self_id);
    let published = view.digest();
    let (tx, rx) = watch::channel(view.clone());

    let task = ReconcilerTask {
        store,
        round,
        default_fee: config.default_entry_fee,
        retry: config.retry.clone(),
        view,
        tx,
        published,
        round_sub: None,
        participants_sub: None,
        failures: 0,
    };

    ReconcilerHandle {
        rx,
        task: tokio::spawn(task.run()),
    }
}

async fn next_round(sub: &mut Option<Subscription>) -> Option<WatchEvent> {
    match sub {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

async fn next_participants(sub: &mut Option<(u64, Subscription)>) -> (u64, Option<WatchEvent>) {
    match sub {
        Some((generation, sub)) => (*generation, sub.next().await),
        None => std::future::pending().await,
    }
}

impl ReconcilerTask {
    async fn run(mut self) {
        tracing::debug!("Reconciling {} for {}", self.round.path(), self.view.self_id);
        let effect = self.connect().await;
        self.execute(effect).await;

        loop {
            let incoming = tokio::select! {
                event = next_round(&mut self.round_sub) => Incoming::Round(event),
                (generation, event) = next_participants(&mut self.participants_sub) => {
                    Incoming::Participants(generation, event)
                }
                _ = self.tx.closed() => Incoming::Closed,
            };

            let event = match incoming {
                Incoming::Closed => {
                    tracing::debug!("No observers left, reconciler stopping");
                    return;
                }
                Incoming::Round(event) => self.translate_round(event),
                Incoming::Participants(generation, event) => {
                    self.translate_participants(generation, event)
                }
            };

            if let Some(event) = event {
                if matches!(event, ViewEvent::Round(_)) {
                    self.failures = 0;
                }
                let effect = self.view.apply(event);
                self.execute(effect).await;
            }
        }
    }

    fn translate_round(&self, event: Option<WatchEvent>) -> Option<ViewEvent> {
        match event {
            Some(WatchEvent::Document { document, .. }) => match document {
                None => Some(ViewEvent::Round(None)),
                Some(doc) => match Round::from_document(&doc) {
                    Ok(round) => Some(ViewEvent::Round(Some(round))),
                    Err(e) => {
                        tracing::warn!("Skipping undecodable round snapshot: {}", e);
                        None
                    }
                },
            },
            Some(WatchEvent::Error { reason, .. }) => Some(ViewEvent::Degraded(reason)),
            Some(WatchEvent::Collection { .. }) => None,
            None => Some(ViewEvent::Degraded("round subscription closed".to_string())),
        }
    }

    fn translate_participants(&self, generation: u64, event: Option<WatchEvent>) -> Option<ViewEvent> {
        match event {
            Some(WatchEvent::Collection { documents, .. }) => Some(ViewEvent::Participants {
                generation,
                participants: Participant::from_documents(&documents),
            }),
            Some(WatchEvent::Error { reason, .. }) => Some(ViewEvent::Degraded(reason)),
            Some(WatchEvent::Document { .. }) => None,
            None => Some(ViewEvent::Degraded(
                "participant subscription closed".to_string(),
            )),
        }
    }

    /// Runs an effect and everything it leads to, publishing after each step.
    async fn execute(&mut self, effect: ViewEffect) {
        let mut queue = VecDeque::from([effect]);
        self.publish();

        while let Some(effect) = queue.pop_front() {
            let next = match effect {
                ViewEffect::None => continue,
                ViewEffect::InitializeRound => self.initialize().await,
                ViewEffect::Resubscribe { generation } => self.resubscribe(generation).await,
                ViewEffect::ForceResync(reason) => {
                    tracing::info!("Re-syncing round view: {}", reason);
                    self.resync().await
                }
                ViewEffect::Reconnect => {
                    self.failures = self.failures.saturating_add(1);
                    let delay = self.retry.delay_for(self.failures);
                    tracing::info!("Reconnecting in {:?} (attempt {})", delay, self.failures);
                    tokio::time::sleep(delay).await;
                    vec![self.connect().await]
                }
            };
            queue.extend(next);
            self.publish();
        }
    }

    async fn connect(&mut self) -> ViewEffect {
        self.round_sub = None;
        self.participants_sub = None;

        let target = WatchTarget::Document(self.round.path().clone());
        match self.store.subscribe(target).await {
            Ok(sub) => {
                self.round_sub = Some(sub);
                ViewEffect::None
            }
            Err(e) => self.view.apply(ViewEvent::Degraded(e.to_string())),
        }
    }

    async fn initialize(&mut self) -> Vec<ViewEffect> {
        // the resulting document arrives through the round subscription
        match ensure_round(self.store.as_ref(), &self.round, self.default_fee).await {
            Ok(_) => Vec::new(),
            Err(e) => vec![self.view.apply(ViewEvent::Degraded(e.to_string()))],
        }
    }

    async fn resubscribe(&mut self, generation: u64) -> Vec<ViewEffect> {
        if let Some((old, sub)) = self.participants_sub.take() {
            tracing::debug!("Dropping participant subscription of generation {}", old);
            sub.unsubscribe();
        }

        let target = match self.round.participants(generation) {
            Ok(path) => WatchTarget::Collection(path),
            Err(e) => return vec![self.view.apply(ViewEvent::Degraded(e.to_string()))],
        };
        match self.store.subscribe(target).await {
            Ok(sub) => {
                self.participants_sub = Some((generation, sub));
                Vec::new()
            }
            Err(e) => vec![self.view.apply(ViewEvent::Degraded(e.to_string()))],
        }
    }

    async fn resync(&mut self) -> Vec<ViewEffect> {
        match self.fetch().await {
            Ok((round, participants)) => {
                let mut effects = Vec::with_capacity(2);
                let generation = round.as_ref().map(|r| r.generation);
                effects.push(self.view.apply(ViewEvent::Round(round)));
                if let Some(generation) = generation {
                    effects.push(self.view.apply(ViewEvent::Participants {
                        generation,
                        participants,
                    }));
                }
                effects
            }
            Err(e) => vec![self.view.apply(ViewEvent::Degraded(e.to_string()))],
        }
    }

    async fn fetch(&self) -> Result<(Option<Round>, Vec<Participant>)> {
        let Some(round) = load_round(self.store.as_ref(), &self.round).await? else {
            return Ok((None, Vec::new()));
        };
        let participants =
            load_participants(self.store.as_ref(), &self.round, round.generation).await?;
        Ok((Some(round), participants))
    }

    fn publish(&mut self) {
        let digest = self.view.digest();
        if digest == self.published {
            return;
        }
        tracing::debug!(
            "View now generation {:?}, {} participants, {:?}/{:?}",
            self.view.generation(),
            self.view.participants.len(),
            self.view.connectivity,
            self.view.consistency
        );
        self.published = digest;
        self.tx.send_replace(self.view.clone());
    }
}
