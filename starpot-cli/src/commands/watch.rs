use super::{view_table, Session};
use starpot_lottery::Result;
use std::time::Duration;

pub async fn handle_watch_command(seconds: Option<u64>, session: &Session) -> Result<()> {
    let client = session.client(None)?;
    let mut handle = client.subscribe()?;

    println!("Watching {} (Ctrl-C to stop)", client.round_ref().path());

    let deadline = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut announced = None;

    loop {
        tokio::select! {
            view = handle.changed() => {
                let Some(view) = view else {
                    break;
                };
                println!("{}", view_table(&view));
                if view.winner_announced && announced != view.generation() {
                    announced = view.generation();
                    println!("Winner drawn: {}", view.winner().unwrap_or("-"));
                }
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown();
    Ok(())
}
