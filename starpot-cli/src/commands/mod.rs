pub mod round;
pub mod simulate;
pub mod watch;

pub use round::{handle_round_command, RoundCommands};
pub use simulate::handle_simulate_command;
pub use watch::handle_watch_command;

use comfy_table::{presets::UTF8_FULL, Table};
use starpot_core::{DocumentStore, IdentityProvider};
use starpot_lottery::{
    LotteryClient, LotteryConfig, RandomSource, Result, RoundView, SeededRandom, ThreadRandom,
};
use std::sync::Arc;

/// What every subcommand needs to build a client.
pub struct Session {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    config: LotteryConfig,
}

impl Session {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        config: LotteryConfig,
    ) -> Self {
        Self {
            store,
            identity,
            config,
        }
    }

    pub fn client(&self, seed: Option<u64>) -> Result<LotteryClient> {
        let rng: Arc<dyn RandomSource> = match seed {
            Some(seed) => Arc::new(SeededRandom::new(seed)),
            None => Arc::new(ThreadRandom),
        };
        LotteryClient::with_random(
            self.store.clone(),
            self.identity.clone(),
            self.config.clone(),
            rng,
        )
    }
}

pub(crate) fn view_table(view: &RoundView) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);

    let dash = || "-".to_string();
    let round = view.round.as_ref();
    table.add_row(vec!["You".to_string(), view.self_id.clone()]);
    table.add_row(vec![
        "Generation".to_string(),
        round.map(|r| r.generation.to_string()).unwrap_or_else(dash),
    ]);
    table.add_row(vec![
        "Entry fee".to_string(),
        round.map(|r| r.entry_fee.to_string()).unwrap_or_else(dash),
    ]);
    table.add_row(vec![
        "Pot".to_string(),
        round.map(|r| r.pot_total.to_string()).unwrap_or_else(dash),
    ]);
    table.add_row(vec![
        "Participants".to_string(),
        view.participants
            .iter()
            .map(|p| p.id.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    ]);
    table.add_row(vec![
        "Winner".to_string(),
        view.winner().map(str::to_string).unwrap_or_else(dash),
    ]);
    table.add_row(vec![
        "Joined".to_string(),
        if view.has_joined { "yes" } else { "no" }.to_string(),
    ]);
    table.add_row(vec![
        "Sync".to_string(),
        format!("{:?} / {:?}", view.connectivity, view.consistency),
    ]);
    table
}
