use crate::{LotteryConfig, LotteryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use starpot_core::{
    Amount, CollectionPath, CreateOutcome, DocPath, Document, DocumentStore, Fields,
};
use std::future::Future;
use std::time::Duration;

pub const POT_TOTAL: &str = "potTotal";
pub const ENTRY_FEE: &str = "entryFee";
pub const PARTICIPANT_COUNT: &str = "participantCount";
pub const WINNER_ID: &str = "winnerId";
pub const GENERATION: &str = "generation";
pub const LAST_DRAWN_AT: &str = "lastDrawnAt";
pub const LAST_RESET_AT: &str = "lastResetAt";
pub const JOINED_AT: &str = "joinedAt";

/// Where a round lives and where each generation's participants live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundRef {
    path: DocPath,
}

impl RoundRef {
    pub fn new(path: DocPath) -> Self {
        Self { path }
    }

    pub fn from_config(config: &LotteryConfig) -> Result<Self> {
        Ok(Self::new(config.round_path()?))
    }

    pub fn path(&self) -> &DocPath {
        &self.path
    }

    /// Participant collection scoped to one generation.
    pub fn participants(&self, generation: u64) -> Result<CollectionPath> {
        Ok(self
            .path
            .collection("generations")?
            .doc(&generation.to_string())?
            .collection("participants")?)
    }

    pub fn participant(&self, generation: u64, participant_id: &str) -> Result<DocPath> {
        Ok(self.participants(generation)?.doc(participant_id)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundState {
    Open,
    Drawn,
}

/// One lottery generation as stored in the round document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub pot_total: Amount,
    pub entry_fee: Amount,
    pub participant_count: u64,
    pub winner_id: Option<String>,
    pub generation: u64,
    pub last_drawn_at: Option<DateTime<Utc>>,
    pub last_reset_at: Option<DateTime<Utc>>,
}

impl Round {
    pub fn initial(entry_fee: Amount) -> Self {
        Self {
            pot_total: Amount::ZERO,
            entry_fee,
            participant_count: 0,
            winner_id: None,
            generation: 0,
            last_drawn_at: None,
            last_reset_at: None,
        }
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        doc.decode::<Round>()
            .map_err(|e| LotteryError::invalid_round(format!("{}: {}", doc.path, e)))
    }

    pub fn to_fields(&self) -> Result<Fields> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(fields) => Ok(fields),
            other => Err(LotteryError::invalid_round(format!(
                "round serialized to {}",
                other
            ))),
        }
    }

    pub fn state(&self) -> RoundState {
        if self.winner_id.is_some() {
            RoundState::Drawn
        } else {
            RoundState::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == RoundState::Open
    }

    /// Checks the quiescent-state invariants against a participant set of
    /// the same generation.
    pub fn check_invariants(&self, participants: &[Participant]) -> std::result::Result<(), String> {
        if self.participant_count != participants.len() as u64 {
            return Err(format!(
                "participantCount is {} but {} participants exist",
                self.participant_count,
                participants.len()
            ));
        }

        let expected_pot = self
            .entry_fee
            .checked_mul(self.participant_count)
            .ok_or_else(|| "pot overflow".to_string())?;
        if self.pot_total != expected_pot {
            return Err(format!(
                "potTotal is {} but {} x {} = {}",
                self.pot_total, self.participant_count, self.entry_fee, expected_pot
            ));
        }

        if let Some(winner) = &self.winner_id {
            if !participants.iter().any(|p| &p.id == winner) {
                return Err(format!("winner {} is not a participant", winner));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub joined_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn from_document(doc: &Document) -> Self {
        let joined_at = doc
            .get(JOINED_AT)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        Self {
            id: doc.id().to_string(),
            joined_at,
        }
    }

    /// Decodes a collection snapshot, ordered by identity.
    pub fn from_documents(docs: &[Document]) -> Vec<Self> {
        let mut participants: Vec<Self> = docs.iter().map(Self::from_document).collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants
    }
}

/// Bounds a store round trip; an elapsed deadline is a transient failure.
pub(crate) async fn timed<T, E, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<LotteryError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(LotteryError::Timeout(limit)),
    }
}

pub async fn load_round(store: &dyn DocumentStore, round: &RoundRef) -> Result<Option<Round>> {
    store
        .get(round.path())
        .await?
        .map(|doc| Round::from_document(&doc))
        .transpose()
}

pub async fn load_participants(
    store: &dyn DocumentStore,
    round: &RoundRef,
    generation: u64,
) -> Result<Vec<Participant>> {
    let docs = store.list(&round.participants(generation)?).await?;
    Ok(Participant::from_documents(&docs))
}

/// Reads the round, creating it at generation 0 if it does not exist yet.
pub async fn ensure_round(
    store: &dyn DocumentStore,
    round: &RoundRef,
    entry_fee: Amount,
) -> Result<Round> {
    if let Some(existing) = load_round(store, round).await? {
        return Ok(existing);
    }

    let fields = Round::initial(entry_fee).to_fields()?;
    match store.create_if_absent(round.path(), fields).await? {
        CreateOutcome::Created => {
            tracing::info!("Initialized round {} at generation 0", round.path());
        }
        CreateOutcome::AlreadyExists => {
            tracing::debug!("Round {} initialized concurrently", round.path());
        }
    }

    load_round(store, round)
        .await?
        .ok_or_else(|| LotteryError::invalid_round(format!("{} vanished after init", round.path())))
}
