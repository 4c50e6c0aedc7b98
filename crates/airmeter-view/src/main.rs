use airmeter_view::config::{load_config, Args};
use airmeter_view::console::{Console, ConsoleCommand};
use airmeter_view::logging::init_logging;
use airmeter_view::{handlers, CommandRouter, HistoryFetcher, Store, WsTransport};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args).context("configuration")?;
    let _session_log = init_logging(&config);
    info!(
        event = "viewer_start",
        ws = %config.ws_address,
        api = config.api_address.as_ref().map(|u| u.as_str()).unwrap_or("-")
    );

    let store = Arc::new(Store::new());
    let fetcher = HistoryFetcher::from_api(Arc::clone(&store), config.api_address.as_ref())?;

    let mut router = CommandRouter::new();
    handlers::install(&mut router, Arc::clone(&store));
    router
        .connect(&WsTransport::new(config.ws_address.clone()))
        .await
        .context("relay connect")?;
    let outbound = router
        .sender()
        .ok_or_else(|| anyhow!("relay channel closed during connect"))?;
    let mut router_task = tokio::spawn(async move {
        if let Err(err) = router.run().await {
            error!(event = "router_error", error = %err);
        }
    });

    let console = Console::new(Arc::clone(&store), fetcher, outbound, config.page_size);
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(line) = lines_rx.recv().await {
            println!("{line}");
        }
    });
    let store_watch = console.watch_store(lines_tx.clone());
    let mut publisher_watches = Vec::new();

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = stdin.next_line() => line.context("stdin")?,
            _ = &mut router_task => {
                info!(event = "viewer_disconnected");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(err) => {
                let _ = lines_tx.send(err.to_string());
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        if let ConsoleCommand::Join(publisher) = command {
            publisher_watches.extend(console.watch_publisher(publisher, lines_tx.clone()));
        }
        match console.execute(command).await {
            Ok(output) => {
                for line in output {
                    let _ = lines_tx.send(line);
                }
            }
            Err(err) => {
                let _ = lines_tx.send(format!("error: {err}"));
            }
        }
    }

    store_watch.abort();
    for watch in publisher_watches {
        watch.abort();
    }
    router_task.abort();
    drop(console);
    drop(lines_tx);
    let _ = printer.await;
    info!(event = "viewer_stop");
    Ok(())
}
