mod demo;

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use kiosk_vision_core::{
    preset::{self, HudOverrides},
    AppConfig, KioskError, Modality, PerceptionSession, SceneCatalog, SessionParts,
    TransitionCallbacks, TransitionEvent, TransitionMachine,
};
use tokio::time::{Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> kiosk_vision_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            preset,
            backend,
            seconds,
            scene_every,
        } => {
            let config = load_config(config.as_ref(), preset, backend)?;
            let scene_every = scene_every.map(Duration::from_secs);
            run_session(config, Duration::from_secs(seconds), scene_every).await
        }
        Commands::Presets { name } => print_presets(name.as_deref()),
        Commands::Transition { from, to } => run_transition(from, to).await,
        Commands::Config { config } => {
            let config = load_config(config.as_ref(), None, None)?;
            println!("{}", config.to_json_pretty()?);
            Ok(())
        }
    }
}

fn load_config(
    path: Option<&PathBuf>,
    preset: Option<String>,
    backend: Option<String>,
) -> kiosk_vision_core::Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(preset) = preset {
        config.session.initial_preset = preset;
    }
    if let Some(backend) = backend {
        config.transport.url = backend;
    }
    Ok(config)
}

async fn run_session(
    config: AppConfig,
    duration: Duration,
    scene_every: Option<Duration>,
) -> kiosk_vision_core::Result<()> {
    tracing::info!(
        preset = %config.session.initial_preset,
        seconds = duration.as_secs(),
        "starting demo session"
    );

    let session = PerceptionSession::new(
        config,
        SessionParts {
            device: Arc::new(demo::SyntheticCamera),
            detectors: demo::detectors(Duration::from_millis(150)),
            vision_model: Some(Arc::new(demo::SyntheticVlm::new(Duration::from_millis(40)))),
            connector: Some(Arc::new(demo::LoopbackConnector)),
            catalog: SceneCatalog::default(),
        },
    );

    if let Err(err) = session.start().await {
        if err.is_user_visible() {
            tracing::error!(error = %err, "camera could not be started");
        }
        return Err(err);
    }

    let deadline = Instant::now() + duration;
    let mut report = tokio::time::interval(Duration::from_secs(1));
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut next_scene = scene_every.map(|every| Instant::now() + every);

    while Instant::now() < deadline {
        report.tick().await;
        log_snapshot(&session);

        if let (Some(at), Some(every)) = (next_scene, scene_every) {
            if Instant::now() >= at {
                session.advance();
                next_scene = Some(at + every);
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn log_snapshot(session: &PerceptionSession) {
    let vision = session.latest_vision();
    let present: Vec<&str> = vision.present().into_iter().map(Modality::as_str).collect();
    let analysis = session.inference().and_then(|inference| inference.latest_analysis());
    let engagement = session.app_store().fresh_engagement(Instant::now());
    let gestures = vision
        .hand_landmarks()
        .map(|hands| hands.gestures().join(","))
        .unwrap_or_default();

    tracing::info!(
        scene = session.app_store().scene_index(),
        camera = ?session.camera().status(),
        last_update = vision.last_update,
        present = ?present,
        gestures = %gestures,
        score = ?analysis.as_ref().map(|analysis| analysis.derived_score),
        backend = ?session.transport().map(|transport| transport.status()),
        engagement = ?engagement,
        "snapshot"
    );
    for modality in Modality::ALL {
        let state = session.module_store().state(modality);
        if state.enabled {
            tracing::debug!(
                %modality,
                ready = state.ready,
                fps = state.observed_fps,
                error = ?state.error,
                "module"
            );
        }
    }
}

fn print_presets(name: Option<&str>) -> kiosk_vision_core::Result<()> {
    match name {
        Some(name) => {
            let config = preset::resolve(name, &HudOverrides::default());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        None => {
            for preset in preset::presets() {
                println!("{:<14} {}", preset.name, preset.description);
            }
        }
    }
    Ok(())
}

async fn run_transition(from: usize, to: usize) -> kiosk_vision_core::Result<()> {
    let machine = TransitionMachine::new();
    let mut events = machine.subscribe_events();

    if !machine.request(from, to, TransitionCallbacks::noop()) {
        return Err(KioskError::msg(format!("transition {from} -> {to} was not started")));
    }

    while let Ok(event) = events.recv().await {
        println!("{}", serde_json::to_string(&event)?);
        if matches!(event, TransitionEvent::Complete { .. }) {
            break;
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera-driven kiosk perception layer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a perception session against the synthetic demo rig.
    Run {
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Preset applied when the session starts.
        #[arg(short, long)]
        preset: Option<String>,
        /// Backend socket URL.
        #[arg(short, long)]
        backend: Option<String>,
        /// How long to run before shutting down.
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
        /// Advance to the next scene every N seconds.
        #[arg(long)]
        scene_every: Option<u64>,
    },
    /// List presets, or print the resolved config of one.
    Presets {
        name: Option<String>,
    },
    /// Run one scene transition and print its events.
    Transition {
        #[arg(long)]
        from: usize,
        #[arg(long)]
        to: usize,
    },
    /// Print the effective configuration.
    Config {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
