use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, trace, warn, LevelFilter};

use maestro::api::{Method, WorkRequest, NO_REPLY};
use maestro::config::Config;
use maestro::error::{Error, ErrorKind};
use maestro::queue::Queue;
use maestro::session;
use maestro::signal::{Handler, ShutdownSignal};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("maestro.toml"))]
    config_file: String,

    /// MPD host or socket path
    ///
    /// Overrides the configuration file.
    #[arg(long, value_hint = ValueHint::Hostname)]
    host: Option<String>,

    /// MPD port
    ///
    /// Overrides the configuration file.
    #[arg(long)]
    port: Option<u16>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if args.quiet || args.verbose > 0 {
        let level = match args.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose`
                // is 0 by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the configuration file and applies command line overrides.
fn load_config(args: &Args) -> Config {
    let mut config = match Config::load(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            if e.kind == ErrorKind::NotFound {
                info!("no configuration file at {}, using defaults", args.config_file);
            } else {
                warn!("could not read {}: {e}, using defaults", args.config_file);
            }
            Config::default()
        }
    };
    if let Some(ref host) = args.host {
        config.mpd_host = host.clone();
    }
    if let Some(port) = args.port {
        config.mpd_port = port;
    }
    config
}

/// Main application loop: spawns the session thread, seeds it with the
/// initial settings, and waits for signals.
async fn run(args: Args) -> Result<(), Error> {
    let config = load_config(&args);

    let inbound = Arc::new(Queue::<WorkRequest>::new());
    let outbound = Arc::new(Queue::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let session_thread = {
        let config = config.clone();
        let inbound = Arc::clone(&inbound);
        let outbound = Arc::clone(&outbound);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name(String::from("session"))
            .spawn(move || session::run(config, inbound, outbound, shutdown))
            .map_err(Error::internal)?
    };

    // The session waits for its settings before the first connect attempt.
    inbound.push(WorkRequest {
        conn_id: NO_REPLY,
        id: 0,
        method: Method::SettingsSet,
        params: config.settings_payload(),
    });

    // Results and broadcasts are consumed here until a front end attaches
    // to the outbound queue.
    let drain = {
        let outbound = Arc::clone(&outbound);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name(String::from("outbound-drain"))
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    if let Some(result) = outbound.pop_timeout(std::time::Duration::from_millis(200))
                    {
                        trace!("outbound result for connection {}", result.conn_id);
                    }
                }
            })
            .map_err(Error::internal)?
    };

    let mut signals = Handler::new()?;
    loop {
        match signals.recv().await {
            ShutdownSignal::Refresh => {
                info!("received SIGHUP, refreshing smart playlists");
                inbound.push(WorkRequest {
                    conn_id: NO_REPLY,
                    id: 0,
                    method: Method::SmartplsUpdateAll,
                    params: serde_json::Value::Null,
                });
            }
            other => {
                info!("received {other}, shutting down gracefully");
                break;
            }
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    let join = tokio::task::spawn_blocking(move || {
        let _ = session_thread.join();
        let _ = drain.join();
    });
    join.await.map_err(Error::internal)?;
    Ok(())
}

/// Main entry point of the application.
#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
