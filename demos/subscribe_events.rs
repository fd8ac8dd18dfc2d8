use std::error::Error;

use hostdb_sdk::bus::EventBus;
use hostdb_sdk::realtime::channel::{RealtimeChannel, RealtimeConfig};
use hostdb_sdk::realtime::proto::KEY_UPDATE_EVENT;
use hostdb_sdk::session::SessionState;
use hostdb_sdk::storage::StorageClient;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::mpsc;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let host_url = "http://localhost:8080";
    let base_url = "http://localhost:8080/api/demoDb";
    let api_key = "REPLACE_WITH_API_KEY";

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let session = SessionState::new();
        let bus = EventBus::new();
        let client = StorageClient::new(
            base_url,
            SecretString::new(api_key.to_string()),
            session.clone(),
        )?;

        // Refetch whichever key the server reports as changed.
        let (changed_tx, mut changed_rx) = mpsc::unbounded_channel();
        let _sub = bus.on(KEY_UPDATE_EVENT, move |payload| {
            if let Value::String(key) = payload {
                let _ = changed_tx.send(key.clone());
            }
        });

        let config = RealtimeConfig::from_http_base(
            host_url,
            "/api/subscribe/demoDb",
            SecretString::new(api_key.to_string()),
        )?;
        let mut channel = RealtimeChannel::new(config, session.clone(), bus);
        let mut log = channel.connect().await?;

        loop {
            tokio::select! {
                maybe_line = log.recv() => {
                    match maybe_line {
                        Some(line) => println!("{line}"),
                        None => break,
                    }
                }
                maybe_key = changed_rx.recv() => {
                    let Some(key) = maybe_key else { break };
                    let record = client.get(&key).await?;
                    println!("refetched {key}: {record:?}");
                }
            }
        }

        channel.disconnect().await?;
        Ok(())
    })
}
