// src/lib.rs
pub mod supervisor {
    use std::path::PathBuf;
    use std::time::Duration;

    use anyhow::Context;
    use tokio::sync::broadcast::error::RecvError;
    use tracing::{info, warn};

    use crate::config::{AppConfig, ChannelStore};
    use crate::logging::init_logging;
    use crate::registry::SupervisorRegistry;
    use crate::report::Reporter;

    pub struct Options {
        pub config_path: PathBuf,
        pub channels_path: PathBuf,
        /// Seconds between JSON status reports, 0 disables them
        pub refresh_secs: u64,
        /// Channels to start once the supervisor is up
        pub start: Vec<String>,
    }

    /// Async entry-point; returns after Ctrl-C once every channel is shut down
    pub async fn run(opts: Options) -> anyhow::Result<()> {
        let config = AppConfig::load_or_init(&opts.config_path)
            .with_context(|| format!("loading {}", opts.config_path.display()))?;
        init_logging(&config.logging_level);
        let store = ChannelStore::load_or_init(&opts.channels_path, config.default_channels_count)
            .with_context(|| format!("loading {}", opts.channels_path.display()))?;
        info!(channels = store.len(), "configuration loaded");

        let registry = SupervisorRegistry::new(config, store, Some(opts.channels_path));
        let mut events = registry.subscribe();
        let printer = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(err) => warn!(error = %err, "failed to serialize event"),
                    },
                    Err(RecvError::Lagged(missed)) => warn!(missed, "event printer fell behind"),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        registry.start().await;
        for name in &opts.start {
            if let Err(err) = registry.start_channel(name).await {
                warn!(channel = %name, error = %err, "could not start channel");
            }
        }

        let mut ticker = (opts.refresh_secs > 0)
            .then(|| tokio::time::interval(Duration::from_secs(opts.refresh_secs)));
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("waiting for Ctrl-C")?;
                    break;
                }
                _ = async {
                    match ticker.as_mut() {
                        Some(ticker) => { ticker.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    println!("{}", Reporter::generate_json_report(registry.snapshot().await));
                }
            }
        }

        info!("interrupt received");
        registry.shutdown().await;
        printer.abort();
        Ok(())
    }
}

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod network;
pub mod preview;
pub mod probe;
pub mod process;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod state;
pub mod stats;
pub mod types;
pub mod watcher;

pub use error::SupervisorError;
pub use events::{Severity, SupervisorEvent};
pub use registry::SupervisorRegistry;
pub use types::{Channel, PreviewKind, StreamStatus};
