use super::Session;
use clap::Subcommand;
use comfy_table::{presets::UTF8_FULL, Table};
use dialoguer::Confirm;
use starpot_core::{Amount, StarpotError};
use starpot_lottery::{DrawOutcome, JoinOutcome, ResetOutcome, Result};

#[derive(Subcommand)]
pub enum RoundCommands {
    /// Show the current round and its participants
    Show,
    /// Join the current round
    Join {
        /// Entry fee to pay, defaults to the round's fee
        #[arg(short, long)]
        fee: Option<Amount>,
    },
    /// Draw a winner for the current round
    Draw {
        /// Seed the random pick, for reproducible draws
        #[arg(short, long)]
        seed: Option<u64>,
    },
    /// Clear the round and start a new generation
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

pub async fn handle_round_command(cmd: RoundCommands, session: &Session) -> Result<()> {
    match cmd {
        RoundCommands::Show => {
            let client = session.client(None)?;
            let round = client.round().await?;
            let participants = client.participants().await?;

            println!("Round {}:", client.round_ref().path());
            println!("  Generation: {}", round.generation);
            println!("  Entry fee: {}", round.entry_fee);
            println!("  Pot: {}", round.pot_total);
            println!("  Participants: {}", round.participant_count);
            match &round.winner_id {
                Some(winner) => println!("  Winner: {}", winner),
                None => println!("  Status: open"),
            }

            if !participants.is_empty() {
                println!();
                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec!["Participant", "Joined at"]);

                for participant in participants {
                    let joined = participant
                        .joined_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    table.add_row(vec![participant.id, joined]);
                }

                println!("{}", table);
            }
        }

        RoundCommands::Join { fee } => {
            let client = session.client(None)?;
            let fee = match fee {
                Some(fee) => fee,
                None => client.round().await?.entry_fee,
            };

            match client.join_with_retry(fee).await? {
                JoinOutcome::Joined { generation } => {
                    println!("Joined generation {} for {}", generation, fee);
                }
                JoinOutcome::AlreadyJoined { generation } => {
                    println!("You are already in generation {}", generation);
                }
                JoinOutcome::RoundClosed => {
                    println!("Round is closed, a winner has been drawn.");
                    println!("Use 'starpot round reset' to start a new one.");
                }
            }
        }

        RoundCommands::Draw { seed } => {
            let client = session.client(seed)?;
            match client.draw_with_retry().await? {
                DrawOutcome::Drawn {
                    winner_id,
                    prize,
                    generation,
                } => {
                    println!("Generation {} winner: {}", generation, winner_id);
                    println!("Prize: {}", prize);
                }
                DrawOutcome::AlreadyDrawn {
                    winner_id: Some(winner),
                } => {
                    println!("Already drawn, winner: {}", winner);
                }
                DrawOutcome::AlreadyDrawn { winner_id: None } => {
                    println!("Round was reset while drawing, nothing drawn.");
                }
                DrawOutcome::NoParticipants => {
                    println!("Nobody has joined yet, nothing to draw.");
                }
            }
        }

        RoundCommands::Reset { yes } => {
            if !yes {
                let confirm = Confirm::new()
                    .with_prompt("Reset the round? All participants of the current generation are removed.")
                    .default(false)
                    .interact()
                    .map_err(|e| StarpotError::internal(e.to_string()))?;

                if !confirm {
                    println!("Reset cancelled.");
                    return Ok(());
                }
            }

            let client = session.client(None)?;
            match client.reset_with_retry().await? {
                ResetOutcome::Initialized => println!("Round created at generation 0."),
                ResetOutcome::Reset { generation } => {
                    println!("Round reset, now at generation {}.", generation)
                }
            }
        }
    }

    Ok(())
}
