use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cuespeak::config::{LoggingConfig, PlaybackEngineConfig};
use cuespeak::{
    CommandParser, CommandSyntax, Config, Dispatcher, Inbound, JsonLinesSink, LocalPlayback,
    MarkerFormat, MarkerId, MarkerRegistry, SpeechSink, SystemRunner, Voice,
};

#[derive(Parser)]
#[command(name = "cuespeak", version, about)]
struct Cli {
    /// Config file (defaults to ./cuespeak.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Read messages and bookmarks from stdin, publish speech (default)
    Run {
        /// Override the configured playback engine
        #[arg(long, value_enum)]
        playback: Option<PlaybackEngineConfig>,
    },
    /// Show how a message splits into groups, without launching anything
    Parse {
        #[arg(required = true)]
        text: Vec<String>,
    },
}

#[hotpath::main]
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.logging);

    match cli.command.unwrap_or(Command::Run { playback: None }) {
        Command::Parse { text } => run_parse(&config, &text.join(" ")),
        Command::Run { playback } => {
            if let Some(engine) = playback {
                config.playback.engine = engine;
                config.validate().context("applying --playback")?;
            }
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(async_main(config))
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn async_main(config: Config) -> anyhow::Result<()> {
    // Channel: stdin / local playback -> marker resolution
    let (marker_tx, marker_rx) = flume::unbounded::<MarkerId>();

    let (shutdown_tx, shutdown_rx) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("installing Ctrl-C handler")?;

    let registry = MarkerRegistry::from_config(&config.markers, Arc::new(SystemRunner));

    let voice = Voice::from_config(&config.playback);
    // Bookmarks from an external engine arrive on stdin, so once it closes
    // only a local engine can still finish a blocked group
    let drain_limit = match voice {
        Some(_) => None,
        None => Some(config.dispatch.drain()),
    };

    let sink: Arc<dyn SpeechSink> = match voice {
        None => Arc::new(JsonLinesSink::stdout()),
        Some(voice) => {
            info!(?voice, "using local playback");
            let format = MarkerFormat::new(&config.markers.template)?;
            Arc::new(
                LocalPlayback::spawn(voice, format, marker_tx.clone())
                    .context("starting playback engine")?,
            )
        }
    };

    // Marker events are resolved on their own thread so a dispatcher blocked
    // on a command never holds up the event that completes it
    let marker_registry = Arc::clone(&registry);
    thread::Builder::new()
        .name("markers".into())
        .spawn(move || marker_registry.serve(marker_rx))
        .context("starting marker thread")?;

    let dispatcher = Dispatcher::from_config(&config, Arc::clone(&registry), sink)?
        .spawn()
        .context("starting dispatcher thread")?;

    info!(
        markers = ?registry.window(),
        "ready, reading messages from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let drain = loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) => match Inbound::parse_line(&line) {
                        Some(Inbound::Command { text }) => {
                            if !dispatcher.submit(text) {
                                break false;
                            }
                        }
                        Some(Inbound::Bookmark { id }) => {
                            if marker_tx.send(id).is_err() {
                                warn!(marker = id, "marker thread has stopped, dropping bookmark");
                            }
                        }
                        None => {}
                    },
                    None => break true,
                }
            }

            _ = shutdown_rx.recv_async() => {
                info!("interrupted, shutting down");
                break false;
            }
        }
    };

    if drain {
        info!(
            queued = dispatcher.queued(),
            limit = ?drain_limit,
            "stdin closed, finishing queued messages"
        );
        tokio::select! {
            _ = tokio::task::spawn_blocking(move || dispatcher.finish(drain_limit)) => {}
            _ = shutdown_rx.recv_async() => info!("interrupted, shutting down"),
        }
    }

    Ok(())
}

fn run_parse(config: &Config, text: &str) -> anyhow::Result<()> {
    let registry = MarkerRegistry::from_config(&config.markers, Arc::new(SystemRunner));
    let parser = CommandParser::new(CommandSyntax::from_config(config)?, registry);

    let groups = parser.parse(text);
    if groups.is_empty() {
        println!("(nothing to do)");
    }

    for (i, group) in groups.iter().enumerate() {
        let kind = if group.is_pure_command() {
            "commands"
        } else {
            "speech"
        };
        println!("group {} ({}): {}", i + 1, kind, group.utterance());
        for unit in group.units() {
            println!(
                "  marker {}: {}{}",
                unit.id(),
                unit.argv().join(" "),
                if unit.is_blocking() { " [blocking]" } else { "" }
            );
        }
    }
    Ok(())
}
