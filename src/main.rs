use std::{path::PathBuf, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::sync::mpsc;
use url::Url;

use pika_sync::{
    config::Config,
    db,
    error::{Error, ErrorKind, Result},
    events::{Event, Level, Notifier},
    plays::SqlitePlays,
    queue::SqliteQueue,
    remote,
    secrets::Token,
    session::Manager,
    signal,
    transport::RelayTransport,
    watcher::{HistoryEntry, Watcher},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay websocket URL
    #[arg(short, long, env = "PIKA_RELAY_URL", value_hint = ValueHint::Url)]
    relay_url: Url,

    /// Secrets file
    ///
    /// Holds the relay access token. Keep this file private.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Local database file
    ///
    /// Holds the play history, and messages that could not be sent while
    /// the connection was down until they are delivered.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("pika.db"))]
    database: String,

    /// VirtualDJ history directory
    ///
    /// [default: ~/Library/Application Support/VirtualDJ/History]
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    vdj_dir: Option<PathBuf>,

    /// Performer name
    ///
    /// Set the name as it appears to listeners.
    ///
    /// [default: system hostname]
    #[arg(short, long)]
    name: Option<String>,

    /// Seconds between history polls
    #[arg(long, value_name = "SECONDS", default_value_t = 2)]
    interval: u64,

    /// Broadcast the track already playing when going live
    #[arg(long, default_value_t = false)]
    include_current: bool,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

impl Args {
    fn history_dir(&self) -> Option<PathBuf> {
        self.vdj_dir.clone().or_else(|| {
            std::env::var_os("HOME").map(|home| {
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("VirtualDJ")
                    .join("History")
            })
        })
    }
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            // Quiet and verbose are mutually exclusive.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates. The binary and the
        // library share the crate name.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the relay access token.
fn load_token(secrets_file: &str) -> Result<Token> {
    let token = Token::from_file(secrets_file);

    if let Err(ref e) = token {
        if e.kind == ErrorKind::NotFound {
            info!("copy secrets.toml.example to {secrets_file} and paste your relay token");
        }
    }

    token
}

/// Renders UI events as log lines.
fn log_event(event: &Event) {
    match event {
        Event::StatusChanged(status) => info!("status: {status}"),
        Event::Toast {
            level: Level::Info,
            message,
        } => info!("{message}"),
        Event::Toast { message, .. } => warn!("{message}"),
        Event::ListenerCount(count) => info!("{count} listening"),
        Event::Likes { message, .. } => info!("{message}"),
        Event::TempoFeedback(tempo) => info!(
            "tempo: {} faster, {} slower, {} perfect",
            tempo.faster, tempo.slower, tempo.perfect
        ),
        Event::Poll(poll) => debug!("poll {}: {:?}", poll.poll_id, poll.votes),
        Event::PollEnded { poll_id, winner } => info!(
            "poll {poll_id} ended: {}",
            winner.as_deref().unwrap_or("no winner")
        ),
        Event::Reaction(reaction) => info!("reaction: {reaction}"),
        Event::SessionExpired { reason } => warn!(
            "relay ended the set: {}",
            reason.as_deref().unwrap_or("expired")
        ),
    }
}

/// Waits for the next history entry, or forever without a watcher.
async fn next_entry(watcher: &mut Option<Watcher>) -> HistoryEntry {
    match watcher {
        Some(watcher) => watcher.next().await,
        None => std::future::pending().await,
    }
}

/// Main application loop.
///
/// Goes live, keeps the relay connection up and broadcasts every new
/// history entry until a shutdown signal ends the set.
///
/// # Errors
///
/// This function returns an error when the set cannot start or the relay
/// stays unreachable after every reconnect attempt.
async fn run(args: Args) -> Result<()> {
    let token = load_token(&args.secrets_file)?;

    let dj_name = args.name.clone().unwrap_or_else(Config::default_dj_name);
    let config = Config::new(args.relay_url.clone(), dj_name);
    info!("performing as {}", config.dj_name);

    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            log_event(&event);
        }
    });

    let transport = Arc::new(RelayTransport::new());
    let pool = db::open(&args.database).await?;
    let queue = Arc::new(SqliteQueue::new(pool.clone()).await?);
    let plays = Arc::new(SqlitePlays::new(pool).await?);
    let manager = Manager::new(
        config,
        transport.clone(),
        queue,
        plays,
        Notifier::new(tx),
    );

    let mut watcher = args
        .history_dir()
        .map(|dir| Watcher::new(dir, Duration::from_secs(args.interval.max(1))));
    let current = match &mut watcher {
        Some(watcher) => match watcher.poll().await {
            Ok(entry) => entry.map(|entry| entry.track()),
            Err(e) => {
                warn!("no VirtualDJ history: {e}");
                None
            }
        },
        None => None,
    };

    manager.go_live(current, args.include_current).await?;
    let shutdown = manager
        .shutdown_token()
        .ok_or_else(|| Error::internal("set ended before connecting"))?;

    let client = remote::Client::new(manager.clone(), transport, Some(token));
    let mut connection = tokio::spawn(async move { client.run(shutdown).await });

    let mut signals = signal::Handler::new()?;

    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            signal = signals.recv() => {
                info!("received {signal}, ending set");
                manager.end_set().await;
                if let Err(e) = (&mut connection).await {
                    debug!("connection task: {e}");
                }
                break Ok(());
            }

            result = &mut connection => {
                break result.unwrap_or_else(|e| Err(Error::internal(e.to_string())));
            }

            entry = next_entry(&mut watcher) => {
                let track = entry.track();
                if manager.has_played(&track) {
                    info!("{track}: played earlier in this set");
                }
                drop(manager.broadcast_track(&track));
                if let Err(e) = manager.record_play(&track).await {
                    warn!("{track}: play not recorded: {e}");
                }
            }
        }
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    debug!("Command {args:#?}");

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();
    let lang = String::from("en");

    info!("starting {name}/{version}; {BUILD_PROFILE}; {lang}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
