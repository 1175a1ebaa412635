use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use playcord_core::display::{format_progress, format_track_position, rich_description};
use playcord_core::{AppConfig, ArbitrationMode, SourceFamily};
use playcord_discord_rpc::{ipc_candidates, DiscordRpcClient, RPC_PORTS};
use playcord_engine::{Engine, EngineConfig, NowPlayingEvent};
use playcord_providers::{build_chain, AppPresence, ArtworkCache, SystemAppDetector};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "playcord",
    about = "Local music players -> arbitration -> Discord Rich Presence"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run,
    Doctor,
    Status,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Run);
    let cfg_path = cli.config.unwrap_or_else(default_config_path);

    match cmd {
        Commands::Config {
            action: ConfigAction::Init,
        } => {
            init_config(&cfg_path)?;
            println!("Initialized config at {}", cfg_path.display());
            Ok(())
        }
        Commands::Doctor => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            doctor(&cfg).await
        }
        Commands::Status => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            status(&cfg).await
        }
        Commands::Run => {
            let cfg = load_or_default(&cfg_path)?;
            init_logging(&cfg.log_level);
            run(cfg, cfg_path).await
        }
    }
}

struct Running {
    engine: Engine,
    notifier: Option<JoinHandle<()>>,
}

impl Running {
    fn start(cfg: &AppConfig) -> Self {
        report_issues(cfg);
        let engine_cfg = EngineConfig::from_app_config(cfg);
        let artwork = Arc::new(ArtworkCache::in_temp_dir());
        let chains = SourceFamily::ALL
            .into_iter()
            .map(|family| {
                let chain = build_chain(family, Arc::clone(&artwork), engine_cfg.adapter_timeout);
                info!(%family, adapters = ?chain.adapter_names(), "source chain ready");
                (family, chain)
            })
            .collect();

        let engine = Engine::start(
            engine_cfg,
            Arc::new(SystemAppDetector::new()),
            chains,
            DiscordRpcClient::factory(cfg.discord_app_id.clone()),
        );
        let notifier = cfg.ui.notify_on_change.then(|| spawn_notifier(&engine));
        Self { engine, notifier }
    }

    async fn stop(self) {
        if let Some(notifier) = self.notifier {
            notifier.abort();
        }
        self.engine.stop().await;
    }
}

async fn run(mut cfg: AppConfig, cfg_path: PathBuf) -> Result<()> {
    let mut running = Running::start(&cfg);
    info!(arbitration = ?cfg.arbitration, "playcord started");

    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(4);
    spawn_reload_watchers(
        cfg_path.clone(),
        cfg.intervals.file_watch_poll_ms,
        reload_tx,
    )
    .await?;

    loop {
        tokio::select! {
            msg = reload_rx.recv() => {
                if msg.is_none() {
                    continue;
                }
                match load_or_default(&cfg_path) {
                    Ok(new_cfg) if new_cfg == cfg => {
                        info!("configuration unchanged");
                    }
                    Ok(new_cfg) => {
                        cfg = new_cfg;
                        running.stop().await;
                        running = Running::start(&cfg);
                        info!("configuration reloaded");
                    }
                    Err(err) => {
                        error!(error=%err, "failed to reload config");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c; shutting down");
                break;
            }
        }
    }

    running.stop().await;
    Ok(())
}

/// Logs arbitrated track changes and connection transitions.
fn spawn_notifier(engine: &Engine) -> JoinHandle<()> {
    let mut events = engine.subscribe();
    let mut state = engine.publisher().watch_state();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(NowPlayingEvent::TrackChanged { family, source, track }) => {
                        let app = source.map(|a| a.display_name()).unwrap_or("unknown");
                        info!(%family, app, track = %track.name, artist = %track.artist, "now playing");
                    }
                    Ok(NowPlayingEvent::PlayStateChanged { family, is_playing }) => {
                        info!(%family, is_playing, "playback state changed");
                    }
                    Ok(NowPlayingEvent::Cleared) => info!("nothing playing"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notifications dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = state.borrow_and_update().clone();
                    info!(state = %current, "discord connection");
                }
            }
        }
    })
}

async fn doctor(cfg: &AppConfig) -> Result<()> {
    println!("== playcord doctor ==");

    let discord_ok = discord_running().await;
    println!(
        "Discord RPC local endpoint: {}",
        if discord_ok {
            "reachable"
        } else {
            "not reachable"
        }
    );

    let apps = tokio::task::spawn_blocking(|| SystemAppDetector::new().detect_running_apps())
        .await
        .context("app detection task failed")?;
    if apps.is_empty() {
        println!("Detected players: none");
    }
    for app in &apps {
        println!(
            "Detected player: {app} priority {} family {}",
            app.priority,
            app.app_name.family()
        );
    }

    let artwork = Arc::new(ArtworkCache::in_temp_dir());
    let timeout = EngineConfig::from_app_config(cfg).adapter_timeout;
    for family in SourceFamily::ALL {
        let hint = apps.iter().find(|a| family.supports(a.app_name));
        let mut chain = build_chain(family, Arc::clone(&artwork), timeout);
        match chain.try_get_track(hint).await {
            Ok(Some(track)) => println!("{family}: {} - {}", track.artist, track.name),
            Ok(None) => println!("{family}: no track"),
            Err(err) => println!("{family}: error: {err}"),
        }
    }

    let issues = cfg.validate();
    if issues.is_empty() {
        println!("Config: ok");
    }
    for issue in issues {
        println!("Config issue: {issue}");
    }

    #[cfg(target_os = "macos")]
    {
        println!(
            "macOS automation: verify System Settings > Privacy & Security > Automation allows Terminal (or your shell) to control Music"
        );
    }

    Ok(())
}

async fn status(cfg: &AppConfig) -> Result<()> {
    let apps = tokio::task::spawn_blocking(|| SystemAppDetector::new().detect_running_apps())
        .await
        .context("app detection task failed")?;
    let artwork = Arc::new(ArtworkCache::in_temp_dir());
    let timeout = EngineConfig::from_app_config(cfg).adapter_timeout;

    for family in SourceFamily::ALL {
        let hint = apps.iter().find(|a| family.supports(a.app_name));
        println!("[{family}]");
        println!(
            "app: {}",
            hint.map(ToString::to_string)
                .unwrap_or_else(|| "<none>".to_string())
        );
        let mut chain = build_chain(family, Arc::clone(&artwork), timeout);
        match chain.try_get_track(hint).await {
            Ok(Some(track)) => {
                println!("track: {}", track.name);
                println!("about: {}", rich_description(&track));
                println!(
                    "position: {}",
                    format_track_position(track.track_number, track.track_count)
                );
                println!("progress: {}", format_progress(&track, SystemTime::now()));
                println!("playing: {}", track.is_playing);
            }
            Ok(None) => println!("track: <none>"),
            Err(err) => println!("error: {err}"),
        }
    }

    Ok(())
}

fn default_config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("playcord").join("config.toml")
}

fn init_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let cfg = AppConfig::default();
    let toml = toml::to_string_pretty(&cfg)?;
    std::fs::write(path, toml)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

fn load_or_default(path: &Path) -> Result<AppConfig> {
    let mut cfg = read_config(path)?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

fn read_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let data =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
}

fn report_issues(cfg: &AppConfig) {
    for issue in cfg.validate() {
        warn!(%issue, "configuration issue");
    }
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}

async fn spawn_reload_watchers(path: PathBuf, poll_ms: u64, tx: mpsc::Sender<()>) -> Result<()> {
    let tx_poll = tx.clone();
    tokio::spawn(async move {
        let mut known_mtime = file_mtime(&path);
        let sleep = Duration::from_millis(poll_ms.max(2_000));
        loop {
            tokio::time::sleep(sleep).await;
            let current = file_mtime(&path);
            if current.is_some() && current != known_mtime {
                known_mtime = current;
                let _ = tx_poll.send(()).await;
            }
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let tx_hup = tx.clone();
        tokio::spawn(async move {
            if let Ok(mut sig) = signal(SignalKind::hangup()) {
                while sig.recv().await.is_some() {
                    let _ = tx_hup.send(()).await;
                }
            }
        });
    }

    Ok(())
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

async fn discord_running() -> bool {
    if (0..=9).any(|slot| ipc_candidates(slot).iter().any(|p| p.exists())) {
        return true;
    }

    for port in RPC_PORTS {
        let addr = format!("127.0.0.1:{port}");
        if tokio::time::timeout(
            Duration::from_millis(200),
            tokio::net::TcpStream::connect(addr),
        )
        .await
        .ok()
        .and_then(Result::ok)
        .is_some()
        {
            return true;
        }
    }
    false
}

fn apply_env_overrides(cfg: &mut AppConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("PLAYCORD_DISCORD_APP_ID") {
        if !v.trim().is_empty() {
            cfg.discord_app_id = v;
        }
    }
    if let Some(v) = var("PLAYCORD_LOG_LEVEL") {
        if !v.trim().is_empty() {
            cfg.log_level = v;
        }
    }
    if let Some(v) = var("PLAYCORD_ARBITRATION") {
        match v.parse::<ArbitrationMode>() {
            Ok(mode) => cfg.arbitration = mode,
            Err(err) => eprintln!("ignoring PLAYCORD_ARBITRATION: {err}"),
        }
    }
    if let Some(v) = var("PLAYCORD_NOTIFY_ON_CHANGE") {
        if let Ok(parsed) = v.trim().parse::<bool>() {
            cfg.ui.notify_on_change = parsed;
        }
    }
}
