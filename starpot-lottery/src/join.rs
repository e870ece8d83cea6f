use crate::round::{
    ensure_round, timed, RoundRef, ENTRY_FEE, GENERATION, JOINED_AT, PARTICIPANT_COUNT, POT_TOTAL,
    WINNER_ID,
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
pub enum JoinOutcome {
    Joined { generation: u64 },
    /// The identity already holds a ticket for this generation.
    AlreadyJoined { generation: u64 },
    /// A winner was drawn or the round was reset while joining.
    RoundClosed,
}

/// Admits a participant into the current generation exactly once.
pub struct JoinCoordinator {
    store: Arc<dyn DocumentStore>,
    round: RoundRef,
    default_fee: Amount,
    timeout: Duration,
}

impl JoinCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, round: RoundRef, config: &LotteryConfig) -> Self {
        Self {
            store,
            round,
            default_fee: config.default_entry_fee,
            timeout: config.op_timeout,
        }
    }

    pub async fn join(&self, participant_id: &str, fee: Amount) -> Result<JoinOutcome> {
        let current = timed(
            self.timeout,
            ensure_round(self.store.as_ref(), &self.round, self.default_fee),
        )
        .await?;

        if fee != current.entry_fee {
            return Err(LotteryError::FeeMismatch {
                expected: current.entry_fee,
                offered: fee,
            });
        }

        if let Some(winner) = &current.winner_id {
            tracing::warn!(
                "Join by {} rejected: generation {} already drawn ({})",
                participant_id,
                current.generation,
                winner
            );
            return Ok(JoinOutcome::RoundClosed);
        }

        let generation = current.generation;
        let delta = fee
            .as_delta()
            .ok_or_else(|| LotteryError::invalid_round(format!("entry fee {} too large", fee)))?;

        let mut ticket = Fields::new();
        ticket.insert("participantId".to_string(), Value::from(participant_id));

        // The create is the uniqueness guard; the round update only applies
        // while this generation is still open.
        let batch = WriteBatch::new()
            .push(
                WriteOp::create(self.round.participant(generation, participant_id)?, ticket)
                    .transform(JOINED_AT, FieldTransform::ServerTimestamp),
            )
            .push(
                WriteOp::update(self.round.path().clone(), Fields::new())
                    .require(Precondition::field_equals(GENERATION, generation))
                    .require(Precondition::field_equals(WINNER_ID, Value::Null))
                    .require(Precondition::field_equals(ENTRY_FEE, fee.units()))
                    .transform(PARTICIPANT_COUNT, FieldTransform::Increment(1))
                    .transform(POT_TOTAL, FieldTransform::Increment(delta)),
            );

        match timed(self.timeout, self.store.commit(batch)).await {
            Ok(receipt) => {
                tracing::info!(
                    "Participant {} joined generation {} (commit {})",
                    participant_id,
                    generation,
                    receipt.version
                );
                Ok(JoinOutcome::Joined { generation })
            }
            Err(LotteryError::Core(StarpotError::AlreadyExists { .. })) => {
                tracing::info!(
                    "Participant {} already joined generation {}",
                    participant_id,
                    generation
                );
                Ok(JoinOutcome::AlreadyJoined { generation })
            }
            Err(LotteryError::Core(StarpotError::PreconditionFailed { reason, .. })) => {
                tracing::warn!(
                    "Join by {} rejected, round moved on: {}",
                    participant_id,
                    reason
                );
                Ok(JoinOutcome::RoundClosed)
            }
            Err(LotteryError::Core(StarpotError::NotFound { path })) => {
                tracing::warn!("Join by {} rejected, {} was removed", participant_id, path);
                Ok(JoinOutcome::RoundClosed)
            }
            Err(e) => Err(e),
        }
    }
}
