use crate::round::{
    ensure_round, load_participants, load_round, timed, RoundRef, GENERATION, LAST_RESET_AT,
    PARTICIPANT_COUNT, POT_TOTAL, WINNER_ID,
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
pub enum ResetOutcome {
    /// The round did not exist and was created at generation 0.
    Initialized,
    /// The round now sits at `generation`, empty and open.
    Reset { generation: u64 },
}

/// Advances the round to a fresh, empty generation.
pub struct ResetCoordinator {
    store: Arc<dyn DocumentStore>,
    round: RoundRef,
    default_fee: Amount,
    timeout: Duration,
    attempts: u32,
}

impl ResetCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, round: RoundRef, config: &LotteryConfig) -> Self {
        Self {
            store,
            round,
            default_fee: config.default_entry_fee,
            timeout: config.op_timeout,
            attempts: config.contention_attempts,
        }
    }

    pub async fn reset(&self) -> Result<ResetOutcome> {
        let expected = self.current_generation().await?;
        self.reset_from(expected).await
    }

    /// Generation a reset issued now would advance from, `None` if the
    /// round does not exist yet.
    pub async fn current_generation(&self) -> Result<Option<u64>> {
        Ok(timed(self.timeout, load_round(self.store.as_ref(), &self.round))
            .await?
            .map(|round| round.generation))
    }

    /// Advances the round past `expected` at most once.
    ///
    /// Calling this again with the same `expected` after the round already
    /// moved beyond it reports the current generation instead of advancing
    /// a second time, so a retried reset stays a single reset.
    pub async fn reset_from(&self, expected: Option<u64>) -> Result<ResetOutcome> {
        let Some(mut current) =
            timed(self.timeout, load_round(self.store.as_ref(), &self.round)).await?
        else {
            timed(
                self.timeout,
                ensure_round(self.store.as_ref(), &self.round, self.default_fee),
            )
            .await?;
            return Ok(ResetOutcome::Initialized);
        };

        let Some(started_at) = expected else {
            tracing::debug!("Round {} already initialized", self.round.path());
            return Ok(ResetOutcome::Initialized);
        };

        if current.generation > started_at {
            tracing::info!(
                "Round already advanced past generation {} to {}",
                started_at,
                current.generation
            );
            return Ok(ResetOutcome::Reset {
                generation: current.generation,
            });
        }

        for attempt in 1..=self.attempts {
            let generation = current.generation;
            let participants = timed(
                self.timeout,
                load_participants(self.store.as_ref(), &self.round, generation),
            )
            .await?;

            let mut fields = Fields::new();
            fields.insert(POT_TOTAL.to_string(), Value::from(0u64));
            fields.insert(PARTICIPANT_COUNT.to_string(), Value::from(0u64));
            fields.insert(WINNER_ID.to_string(), Value::Null);
            fields.insert(GENERATION.to_string(), Value::from(generation + 1));

            // Old tickets go in the same batch, so a late join to this
            // generation either lands before and is deleted, or fails.
            let mut batch = WriteBatch::new();
            for participant in &participants {
                batch = batch.push(WriteOp::delete(
                    self.round.participant(generation, &participant.id)?,
                ));
            }
            batch = batch.push(
                WriteOp::update(self.round.path().clone(), fields)
                    .require(Precondition::field_equals(GENERATION, generation))
                    .require(Precondition::field_equals(
                        PARTICIPANT_COUNT,
                        participants.len() as u64,
                    ))
                    .transform(LAST_RESET_AT, FieldTransform::ServerTimestamp),
            );

            match timed(self.timeout, self.store.commit(batch)).await {
                Ok(_) => {
                    tracing::info!(
                        "Round reset from generation {} to {}, cleared {} participants",
                        generation,
                        generation + 1,
                        participants.len()
                    );
                    return Ok(ResetOutcome::Reset {
                        generation: generation + 1,
                    });
                }
                Err(LotteryError::Core(StarpotError::PreconditionFailed { reason, .. })) => {
                    tracing::debug!("Reset attempt {} lost a race: {}", attempt, reason);
                }
                Err(e) => return Err(e),
            }

            current = match timed(self.timeout, load_round(self.store.as_ref(), &self.round))
                .await?
            {
                Some(latest) => latest,
                None => return Err(LotteryError::invalid_round("round removed during reset")),
            };
            if current.generation > started_at {
                // another client already advanced it; collapse into theirs
                tracing::info!(
                    "Concurrent reset observed, round now at generation {}",
                    current.generation
                );
                return Ok(ResetOutcome::Reset {
                    generation: current.generation,
                });
            }
        }

        tracing::warn!("Reset gave up after {} attempts", self.attempts);
        Err(LotteryError::Contention {
            operation: "reset",
            attempts: self.attempts,
        })
    }
}
