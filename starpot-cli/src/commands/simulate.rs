use super::view_table;
use futures::future::join_all;
use starpot_core::{Amount, DocumentStore, MemoryStore, StaticIdentity};
use starpot_lottery::{
    DrawOutcome, JoinOutcome, LotteryClient, LotteryConfig, LotteryError, RandomSource,
    ReconcilerHandle, Result, RoundView, SeededRandom, ThreadRandom,
};
use std::sync::Arc;
use std::time::Duration;

const SIMULATED_LATENCY: Duration = Duration::from_millis(5);
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn handle_simulate_command(
    clients: usize,
    fee: Option<Amount>,
    seed: Option<u64>,
    config: LotteryConfig,
) -> Result<()> {
    if clients == 0 {
        return Err(LotteryError::config("Need at least one client"));
    }

    let fee = fee.unwrap_or(config.default_entry_fee);
    let config = config.with_entry_fee(fee);
    config.validate()?;

    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_latency(SIMULATED_LATENCY));
    let players = (0..clients)
        .map(|i| {
            let rng: Arc<dyn RandomSource> = match seed {
                Some(seed) => Arc::new(SeededRandom::new(seed.wrapping_add(i as u64))),
                None => Arc::new(ThreadRandom),
            };
            LotteryClient::with_random(
                store.clone(),
                Arc::new(StaticIdentity::new(format!("client-{:02}", i + 1))),
                config.clone(),
                rng,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let mut view = players[0].subscribe()?;
    println!("Simulating {} clients, entry fee {}", clients, fee);

    let joins = join_all(players.iter().map(|p| p.join_with_retry(fee)))
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
    let joined = joins
        .iter()
        .filter(|o| matches!(o, JoinOutcome::Joined { .. }))
        .count();
    println!("{} of {} joins committed", joined, clients);

    let draws = join_all(players.iter().map(|p| p.draw_with_retry()))
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
    for outcome in &draws {
        if let DrawOutcome::Drawn {
            winner_id, prize, ..
        } = outcome
        {
            println!("Winner {} takes {}", winner_id, prize);
        }
    }
    let drawn = draws
        .iter()
        .filter(|o| matches!(o, DrawOutcome::Drawn { .. }))
        .count();
    println!("{} concurrent draws, {} committed", clients, drawn);

    let settled = settle(&mut view, |v| v.winner_announced && v.is_settled()).await?;
    println!("{}", view_table(&settled));

    players[clients - 1].reset_with_retry().await?;
    let settled = settle(&mut view, |v| {
        v.participants_generation == Some(1) && v.is_settled()
    })
    .await?;
    println!("After reset:");
    println!("{}", view_table(&settled));

    view.shutdown();
    Ok(())
}

async fn settle<F>(handle: &mut ReconcilerHandle, predicate: F) -> Result<RoundView>
where
    F: FnMut(&RoundView) -> bool,
{
    match tokio::time::timeout(SETTLE_TIMEOUT, handle.wait_for(predicate)).await {
        Ok(Some(view)) => Ok(view),
        Ok(None) => Err(LotteryError::InvariantViolation(
            "reconciler stopped before settling".to_string(),
        )),
        Err(_) => Err(LotteryError::Timeout(SETTLE_TIMEOUT)),
    }
}
