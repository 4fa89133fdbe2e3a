use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use channel_supervisor::config::ChannelStore;
use channel_supervisor::constants::DEFAULT_FFPROBE;
use channel_supervisor::logging::init_logging;
use channel_supervisor::probe::ProbeRunner;
use channel_supervisor::supervisor::{Options, run};
use clap::{Parser, Subcommand};

#[derive(Parser)]
struct Opt {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise the configured channels until Ctrl-C
    Run {
        #[clap(long, default_value = "config.json")]
        config: PathBuf,

        #[clap(long, default_value = "channels.json")]
        channels: PathBuf,

        /// Seconds between JSON status reports (0 = never)
        #[clap(long, default_value_t = 2)]
        refresh: u64,

        /// Channel to start after launch; repeatable
        #[clap(long = "start")]
        start: Vec<String>,
    },
    /// List the programs of an input as JSON
    Probe {
        url: String,

        #[clap(long, default_value_t = 15)]
        timeout: u64,

        #[clap(long, default_value = DEFAULT_FFPROBE)]
        ffprobe: String,
    },
    /// Write a channel file with the stock addressing
    Init {
        #[clap(long, default_value = "channels.json")]
        channels: PathBuf,

        #[clap(long, default_value_t = 10)]
        count: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    match opt.command {
        Command::Run {
            config,
            channels,
            refresh,
            start,
        } => {
            run(Options {
                config_path: config,
                channels_path: channels,
                refresh_secs: refresh,
                start,
            })
            .await
        }
        Command::Probe { url, timeout, ffprobe } => {
            init_logging("INFO");
            let programs = ProbeRunner::new(ffprobe)
                .scan(&url, Duration::from_secs(timeout))
                .await
                .with_context(|| format!("probing {url}"))?;
            println!("{}", serde_json::to_string_pretty(&programs)?);
            Ok(())
        }
        Command::Init { channels, count } => {
            ChannelStore::with_defaults(count)
                .save(&channels)
                .with_context(|| format!("writing {}", channels.display()))?;
            println!("wrote {count} channels to {}", channels.display());
            Ok(())
        }
    }
}
