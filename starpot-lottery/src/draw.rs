use crate::rng::RandomSource;
use crate::round::{
    load_participants, load_round, timed, RoundRef, GENERATION, LAST_DRAWN_AT,
    PARTICIPANT_COUNT, WINNER_ID,
};
use crate::{LotteryConfig, LotteryError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use starpot_core::{
    Amount, DocumentStore, FieldTransform, Fields, Precondition, StarpotError, WriteBatch, WriteOp,
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrawOutcome {
    Drawn {
        winner_id: String,
        prize: Amount,
        generation: u64,
    },
    /// Someone else drew first. `winner_id` is `None` when the generation
    /// was reset before the winner could be observed.
    AlreadyDrawn { winner_id: Option<String> },
    NoParticipants,
}

/// Selects exactly one winner per generation.
pub struct DrawCoordinator {
    store: Arc<dyn DocumentStore>,
    round: RoundRef,
    rng: Arc<dyn RandomSource>,
    timeout: Duration,
    attempts: u32,
}

impl DrawCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        round: RoundRef,
        rng: Arc<dyn RandomSource>,
        config: &LotteryConfig,
    ) -> Self {
        Self {
            store,
            round,
            rng,
            timeout: config.op_timeout,
            attempts: config.contention_attempts,
        }
    }

    pub async fn draw(&self) -> Result<DrawOutcome> {
        for attempt in 1..=self.attempts {
            let Some(current) =
                timed(self.timeout, load_round(self.store.as_ref(), &self.round)).await?
            else {
                tracing::info!("Draw skipped: round {} does not exist", self.round.path());
                return Ok(DrawOutcome::NoParticipants);
            };

            if let Some(winner) = current.winner_id {
                return Ok(DrawOutcome::AlreadyDrawn {
                    winner_id: Some(winner),
                });
            }

            let generation = current.generation;
            let participants = timed(
                self.timeout,
                load_participants(self.store.as_ref(), &self.round, generation),
            )
            .await?;

            if participants.is_empty() {
                tracing::info!("Draw skipped: generation {} has no participants", generation);
                return Ok(DrawOutcome::NoParticipants);
            }

            let index = self.rng.pick_index(participants.len());
            let winner = participants
                .get(index)
                .map(|p| p.id.clone())
                .ok_or_else(|| {
                    LotteryError::InvariantViolation(format!(
                        "random index {} outside {} participants",
                        index,
                        participants.len()
                    ))
                })?;

            let count = participants.len() as u64;
            let prize = current
                .entry_fee
                .checked_mul(count)
                .ok_or_else(|| LotteryError::invalid_round("prize overflows"))?;

            let mut fields = Fields::new();
            fields.insert(WINNER_ID.to_string(), Value::from(winner.as_str()));

            // The count guard pins the draw to the exact set it chose from.
            let batch = WriteBatch::new().push(
                WriteOp::update(self.round.path().clone(), fields)
                    .require(Precondition::field_equals(GENERATION, generation))
                    .require(Precondition::field_equals(WINNER_ID, Value::Null))
                    .require(Precondition::field_equals(PARTICIPANT_COUNT, count))
                    .transform(LAST_DRAWN_AT, FieldTransform::ServerTimestamp),
            );

            match timed(self.timeout, self.store.commit(batch)).await {
                Ok(_) => {
                    tracing::info!(
                        "Generation {} drawn: winner {} takes {} from {} participants",
                        generation,
                        winner,
                        prize,
                        count
                    );
                    return Ok(DrawOutcome::Drawn {
                        winner_id: winner,
                        prize,
                        generation,
                    });
                }
                Err(LotteryError::Core(StarpotError::PreconditionFailed { reason, .. })) => {
                    tracing::debug!("Draw attempt {} lost a race: {}", attempt, reason);
                }
                Err(e) => return Err(e),
            }

            match timed(self.timeout, load_round(self.store.as_ref(), &self.round)).await? {
                Some(latest) if latest.winner_id.is_some() => {
                    return Ok(DrawOutcome::AlreadyDrawn {
                        winner_id: latest.winner_id,
                    });
                }
                Some(latest) if latest.generation != generation => {
                    tracing::info!(
                        "Generation {} was reset during the draw",
                        generation
                    );
                    return Ok(DrawOutcome::AlreadyDrawn { winner_id: None });
                }
                None => return Ok(DrawOutcome::AlreadyDrawn { winner_id: None }),
                // a join landed between the listing and the commit
                Some(_) => continue,
            }
        }

        tracing::warn!("Draw gave up after {} attempts", self.attempts);
        Err(LotteryError::Contention {
            operation: "draw",
            attempts: self.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::{JoinCoordinator, JoinOutcome};
    use crate::rng::ScriptedRandom;
    use crate::round::ensure_round;
    use starpot_core::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        round: RoundRef,
        joiner: JoinCoordinator,
        config: LotteryConfig,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = LotteryConfig::default();
        let round = RoundRef::from_config(&config).unwrap();
        let joiner = JoinCoordinator::new(store.clone(), round.clone(), &config);
        Fixture {
            store,
            round,
            joiner,
            config,
        }
    }

    fn drawer(f: &Fixture, script: Vec<usize>) -> DrawCoordinator {
        DrawCoordinator::new(
            f.store.clone(),
            f.round.clone(),
            Arc::new(ScriptedRandom::new(script)),
            &f.config,
        )
    }

    #[tokio::test]
    async fn test_draw_picks_sorted_participant() {
        let f = fixture();
        let fee = f.config.default_entry_fee;
        for id in ["carol", "alice", "bob"] {
            f.joiner.join(id, fee).await.unwrap();
        }

        let outcome = drawer(&f, vec![1]).draw().await.unwrap();
        assert_eq!(
            outcome,
            DrawOutcome::Drawn {
                winner_id: "bob".to_string(),
                prize: Amount::from_units(15_000_000),
                generation: 0,
            }
        );

        let round = load_round(f.store.as_ref(), &f.round).await.unwrap().unwrap();
        assert_eq!(round.winner_id.as_deref(), Some("bob"));
        assert!(round.last_drawn_at.is_some());
        // the pot is reported, not paid out
        assert_eq!(round.pot_total, Amount::from_units(15_000_000));
    }

    #[tokio::test]
    async fn test_empty_draw_changes_nothing() {
        let f = fixture();
        ensure_round(f.store.as_ref(), &f.round, f.config.default_entry_fee)
            .await
            .unwrap();
        let before = f.store.get(f.round.path()).await.unwrap();

        let outcome = drawer(&f, vec![0]).draw().await.unwrap();
        assert_eq!(outcome, DrawOutcome::NoParticipants);
        assert_eq!(f.store.get(f.round.path()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_draw_on_missing_round_writes_nothing() {
        let f = fixture();

        let outcome = drawer(&f, vec![0]).draw().await.unwrap();
        assert_eq!(outcome, DrawOutcome::NoParticipants);
        assert!(f.store.get(f.round.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_draw_reports_first_winner() {
        let f = fixture();
        let fee = f.config.default_entry_fee;
        f.joiner.join("alice", fee).await.unwrap();
        f.joiner.join("bob", fee).await.unwrap();

        drawer(&f, vec![0]).draw().await.unwrap();
        let again = drawer(&f, vec![1]).draw().await.unwrap();
        assert_eq!(
            again,
            DrawOutcome::AlreadyDrawn {
                winner_id: Some("alice".to_string())
            }
        );
        assert_eq!(
            f.joiner.join("carol", fee).await.unwrap(),
            JoinOutcome::RoundClosed
        );
    }

    #[tokio::test]
    async fn test_concurrent_draws_elect_one_winner() {
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(6)));
        let config = LotteryConfig::default();
        let round = RoundRef::from_config(&config).unwrap();
        let joiner = JoinCoordinator::new(store.clone(), round.clone(), &config);
        for id in ["alice", "bob", "carol", "dave"] {
            joiner.join(id, config.default_entry_fee).await.unwrap();
        }

        let draws = (0..6).map(|i| {
            let coordinator = DrawCoordinator::new(
                store.clone(),
                round.clone(),
                Arc::new(ScriptedRandom::new(vec![i % 4])),
                &config,
            );
            async move { coordinator.draw().await }
        });
        let outcomes: Vec<DrawOutcome> = futures::future::join_all(draws)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let winners: Vec<&String> = outcomes
            .iter()
            .filter_map(|o| match o {
                DrawOutcome::Drawn { winner_id, .. } => Some(winner_id),
                _ => None,
            })
            .collect();
        assert_eq!(winners.len(), 1);

        let stored = load_round(store.as_ref(), &round).await.unwrap().unwrap();
        assert_eq!(stored.winner_id.as_ref(), Some(winners[0]));
        for outcome in &outcomes {
            if let DrawOutcome::AlreadyDrawn { winner_id } = outcome {
                assert_eq!(winner_id.as_ref(), Some(winners[0]));
            }
        }
    }

    #[tokio::test]
    async fn test_out_of_range_index_is_rejected() {
        let f = fixture();
        f.joiner.join("alice", f.config.default_entry_fee).await.unwrap();

        let result = drawer(&f, vec![5]).draw().await;
        assert!(matches!(result, Err(LotteryError::InvariantViolation(_))));
        let round = load_round(f.store.as_ref(), &f.round).await.unwrap().unwrap();
        assert!(round.winner_id.is_none());
    }
}
