// JSON-lines command session
//
// One request object per line on stdin, one result record per line on
// stdout. Logs go to stderr so stdout stays machine-readable.

use anyhow::{Context, Result};
use bluelink_core::Dispatcher;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

pub async fn run(dispatcher: &Dispatcher) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    info!("Session ready");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read request")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let out = dispatcher.handle_json(&line).await;
                stdout.write_all(out.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    dispatcher.shutdown().await;
    Ok(())
}
