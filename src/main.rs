//! moodlink - Peer discovery, messaging and clock sync for mood-light devices

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{error, info, trace, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use moodlink::mood::{ControlSurface, CyclePolicy, MoodBoard, MoodCycler, Renderer};
use moodlink::network::{
    Client, ConnectError, ConnectionStats, MacAddress, Radio, Server, UdpRadio,
};
use moodlink::{Clock, DeviceConfig, FailureBudget, MonotonicClock, Recovery};

/// A role that ran at least this long counts as healthy
const HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Pause before restarting a failed role
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Renderer frame period
const FRAME_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "moodlink")]
#[command(about = "Peer discovery, messaging and clock sync for mood-light devices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Device configuration file (TOML)
    #[arg(short, long, global = true, env = "MOODLINK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct LinkArgs {
    /// Network to meet on
    #[arg(long, env = "MOODLINK_SSID")]
    ssid: Option<String>,

    /// Network password (associates with the network)
    #[arg(long, env = "MOODLINK_PASSWORD")]
    password: Option<String>,

    /// Radio address (aa:bb:cc:dd:ee:ff), random if unset
    #[arg(long, env = "MOODLINK_MAC")]
    mac: Option<String>,

    /// Channel the network is visible on
    #[arg(long)]
    channel: Option<u8>,

    /// UDP port of channel 0
    #[arg(long)]
    base_port: Option<u16>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as server: answer joins, broadcast sync beacons and moods
    Server {
        #[command(flatten)]
        link: LinkArgs,

        /// HTTP control port
        #[arg(long)]
        http_port: Option<u16>,

        /// Step through all moods on button release instead of toggling
        #[arg(long)]
        advance: bool,
    },

    /// Run as client: join a server and follow its moods
    Client {
        #[command(flatten)]
        link: LinkArgs,

        /// Join again when the server goes silent
        #[arg(long)]
        rejoin: bool,
    },

    /// Print the default configuration
    Config,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>, link: &LinkArgs) -> Result<DeviceConfig> {
    let mut config = match path {
        Some(path) => DeviceConfig::load(path)?,
        None => DeviceConfig::default(),
    };

    if let Some(ssid) = &link.ssid {
        config.ssid = ssid.clone();
    }
    if let Some(password) = &link.password {
        config.password = Some(password.clone());
    }
    if let Some(mac) = &link.mac {
        config.mac = Some(mac.clone());
    }
    if let Some(channel) = link.channel {
        config.udp.channel = channel;
    }
    if let Some(base_port) = link.base_port {
        config.udp.base_port = base_port;
    }

    config.validate()?;
    Ok(config)
}

fn make_radio(config: &DeviceConfig) -> Result<Arc<dyn Radio>> {
    let mac = config.mac_address()?.unwrap_or_else(MacAddress::random);
    info!("Radio address {}", mac);
    Ok(Arc::new(UdpRadio::new(mac, config.udp_config())))
}

fn print_stats(stats: &ConnectionStats) {
    println!("\n Connection Statistics");
    println!("   Sent:      {:>10}", stats.sent);
    println!("   Received:  {:>10}", stats.received);
    println!("   Enqueued:  {:>10}", stats.enqueued);
    println!("   Dropped:   {:>10}", stats.dropped);
    println!("   Rejected:  {:>10}\n", stats.rejected);
}

/// How one run of a role ended
enum Outcome {
    Shutdown,
    Failed(Option<ConnectError>),
}

/// Decide whether to run the role again after a failure
async fn recover(budget: &mut FailureBudget, started: Instant, fatal: Option<ConnectError>) -> Result<()> {
    match &fatal {
        Some(e) => error!("Connection failed: {}", e),
        None => error!("Connection closed unexpectedly"),
    }
    if started.elapsed() >= HEALTHY_RUN {
        budget.reset();
    }
    match budget.record_failure() {
        Recovery::Restart => {
            tokio::time::sleep(RESTART_DELAY).await;
            Ok(())
        }
        Recovery::RestartDevice => bail!("giving up after {} failures", budget.failures()),
    }
}

async fn run_server(config: DeviceConfig, policy: CyclePolicy) -> Result<()> {
    let radio = make_radio(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let board = Arc::new(MoodBoard::with_default_moods());
    board.set_mood(&config.mood);

    let mut budget = FailureBudget::new(config.max_failures);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        let started = Instant::now();
        let mut server = match Server::start(radio.clone(), clock.clone(), config.server_config()?) {
            Ok(server) => server,
            Err(e @ (ConnectError::NetworkNotFound(_) | ConnectError::MissingSsid)) => {
                return Err(e.into())
            }
            Err(e) => {
                recover(&mut budget, started, Some(e)).await?;
                continue;
            }
        };

        let renderer: Arc<dyn Renderer> = board.clone();
        let cycler = MoodCycler::new(renderer.clone(), server.handle(), policy.clone());
        let listener = TcpListener::bind(("0.0.0.0", config.http_port)).await?;
        let http = tokio::spawn(ControlSurface::new(renderer, server.handle()).serve(listener));

        println!("\nServer running. Press Enter to change the mood, Ctrl+C to stop.\n");

        let mut frames = interval(FRAME_INTERVAL);
        let outcome = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break Outcome::Shutdown,
                fatal = server.closed() => break Outcome::Failed(fatal),
                line = stdin.next_line(), if stdin_open => match line {
                    Ok(Some(_)) => {
                        cycler.on_press();
                        if let Err(e) = cycler.on_release() {
                            warn!("Button release failed: {}", e);
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("stdin closed: {}", e);
                        stdin_open = false;
                    }
                },
                _ = frames.tick() => {
                    let delta = server.tick();
                    trace!("Frame at {} (+{} ms): {:?}", server.now(), delta, board.active());
                }
            }
        };

        http.abort();
        let stats = server.stats();
        server.stop();

        match outcome {
            Outcome::Shutdown => {
                info!("Shutting down...");
                print_stats(&stats);
                return Ok(());
            }
            Outcome::Failed(fatal) => recover(&mut budget, started, fatal).await?,
        }
    }
}

async fn run_client(config: DeviceConfig) -> Result<()> {
    let radio = make_radio(&config)?;
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let board = Arc::new(MoodBoard::with_default_moods());
    board.set_mood(&config.mood);

    let mut budget = FailureBudget::new(config.max_failures);

    loop {
        let started = Instant::now();
        let mut client = match Client::start(radio.clone(), clock.clone(), config.client_config()?) {
            Ok(client) => client,
            Err(e @ (ConnectError::NetworkNotFound(_) | ConnectError::MissingSsid)) => {
                return Err(e.into())
            }
            Err(e) => {
                recover(&mut budget, started, Some(e)).await?;
                continue;
            }
        };

        let renderer = board.clone();
        client.set_update_handler(move |mood| {
            renderer.set_mood(mood);
        });

        println!("\nClient running. Press Ctrl+C to stop.\n");

        let mut frames = interval(FRAME_INTERVAL);
        let outcome = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break Outcome::Shutdown,
                fatal = client.closed() => break Outcome::Failed(fatal),
                _ = frames.tick() => {
                    let delta = client.tick();
                    trace!(
                        "Frame at {} (+{} ms, {:?}, synced={}): {:?}",
                        client.now(),
                        delta,
                        client.state(),
                        client.is_synced(),
                        board.active()
                    );
                }
            }
        };

        let stats = client.stats();
        client.stop();

        match outcome {
            Outcome::Shutdown => {
                info!("Shutting down...");
                print_stats(&stats);
                return Ok(());
            }
            Outcome::Failed(fatal) => recover(&mut budget, started, fatal).await?,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Server {
            link,
            http_port,
            advance,
        } => {
            let mut config = load_config(cli.config.as_ref(), &link)?;
            if let Some(port) = http_port {
                config.http_port = port;
            }
            let policy = if advance {
                CyclePolicy::Advance
            } else {
                CyclePolicy::default()
            };
            run_server(config, policy).await?;
        }
        Commands::Client { link, rejoin } => {
            let mut config = load_config(cli.config.as_ref(), &link)?;
            config.rejoin_on_silence |= rejoin;
            run_client(config).await?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&DeviceConfig::default())?);
        }
    }

    Ok(())
}
