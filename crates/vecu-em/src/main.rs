//! vecu-em - Execution Manager daemon.
//!
//! Launches the declared applications in dependency order, supervises their
//! liveness through the Platform Health Manager, restarts failed
//! applications within policy, and shuts everything down cleanly on
//! SIGINT/SIGTERM.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vecu_core::com::binding::APP_TABLE_ENV;
use vecu_core::com::{Binding, DEFAULT_EVENT_GROUP, EventId};
use vecu_core::per::StorageRegistry;
use vecu_core::phm::{self, PhmSupervisor};

use vecu_em::apptable::load_client_map;
use vecu_em::deps::startup_order;
use vecu_em::manifest::{AppConfig, load_manifests};
use vecu_em::phm_routing::{SupervisorMap, register_phm_handler};
use vecu_em::runtime::{AppRuntime, reap_and_restart, shutdown_children, spawn_app};

/// Application name the Execution Manager registers on the transport.
const EM_APP_NAME: &str = "execution_manager";

/// Status event offered alongside the PHM service.
const PHM_STATUS_EVENT: EventId = 0x0100;

/// Cadence of the supervision/reap loop.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and SIGKILL at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// vecu Execution Manager
#[derive(Parser, Debug)]
#[command(name = "vecu-em")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory containing the application and persistency manifests
    #[arg(short, long, default_value = "manifests")]
    manifest_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Path to the transport application table (overrides
    /// VSOMEIP_CONFIGURATION)
    #[arg(long)]
    app_table: Option<PathBuf>,
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;
    info!("Execution Manager starting");

    // Phase 1: bootstrap.
    let running = Arc::new(AtomicBool::new(true));
    spawn_signal_task(Arc::clone(&running));

    let registry = StorageRegistry::new();
    let persistency_manifest = args.manifest_dir.join("persistency.json");
    registry
        .init_from_file(&persistency_manifest)
        .with_context(|| {
            format!(
                "failed to load persistency registry from {}",
                persistency_manifest.display()
            )
        })?;

    let binding = Binding::global();
    binding.init(EM_APP_NAME);
    binding
        .offer_service(
            phm::ids::SERVICE,
            phm::ids::INSTANCE,
            Some(PHM_STATUS_EVENT),
            Some(DEFAULT_EVENT_GROUP),
        )
        .context("failed to offer PHM service")?;

    let apps = load_manifests(&args.manifest_dir);
    info!(count = apps.len(), "loaded application manifests");

    // Phase 2: wire-up.
    let supervisors = build_supervisors(&apps);

    let known_apps: HashSet<String> = apps.iter().map(|a| a.app_id.clone()).collect();
    let table_path = args
        .app_table
        .clone()
        .or_else(|| std::env::var(APP_TABLE_ENV).ok().map(PathBuf::from));
    let client_map = match table_path {
        Some(path) => load_client_map(&path, &known_apps).unwrap_or_else(|e| {
            warn!(error = %e, "no usable application table, PHM routing disabled");
            HashMap::new()
        }),
        None => {
            warn!("no application table configured, PHM routing disabled");
            HashMap::new()
        }
    };
    register_phm_handler(&binding, Arc::clone(&supervisors), Arc::new(client_map));

    // Phase 3: ordered start.
    let mut children: HashMap<String, AppRuntime> = HashMap::new();
    let by_id: HashMap<&str, &AppConfig> =
        apps.iter().map(|a| (a.app_id.as_str(), a)).collect();
    for app_id in startup_order(&apps) {
        let config = AppConfig::clone(by_id[app_id.as_str()]);
        match spawn_app(&config) {
            Ok(child) => {
                children.insert(
                    app_id,
                    AppRuntime {
                        config,
                        child: Some(child),
                        restart_count: 0,
                    },
                );
            }
            Err(e) => error!(app = %app_id, error = %e, "failed to launch application"),
        }
    }

    // Phase 4: supervise until a shutdown signal arrives or every child is
    // gone.
    run_loop(&running, &supervisors, &mut children).await;

    // Phase 5: shutdown.
    shutdown_children(&mut children, SHUTDOWN_GRACE, TICK_INTERVAL).await;
    binding.shutdown();
    info!("Execution Manager shutdown complete");
    Ok(())
}

/// Flip the running flag on SIGINT/SIGTERM.
fn spawn_signal_task(running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        running.store(false, Ordering::SeqCst);
    });
}

/// One supervisor per app with a PHM block, violation logging attached.
fn build_supervisors(apps: &[AppConfig]) -> Arc<SupervisorMap> {
    let mut supervisors = SupervisorMap::new();
    for app in apps {
        let Some(phm_config) = &app.phm else { continue };
        let mut supervisor = PhmSupervisor::new(phm_config.supervision_config());
        let app_id = app.app_id.clone();
        supervisor.set_violation_callback(move |reason| {
            error!(app = %app_id, reason, "supervision violation");
        });
        supervisors.insert(app.app_id.clone(), Arc::new(Mutex::new(supervisor)));
    }
    Arc::new(supervisors)
}

/// Drive supervision ticks and reap exited children at a 100 ms cadence.
///
/// The interval bursts to catch up when ticks were missed, without
/// drifting. Reaping is non-blocking; abnormal exits are restarted within
/// the on-failure policy and its cap.
async fn run_loop(
    running: &AtomicBool,
    supervisors: &SupervisorMap,
    children: &mut HashMap<String, AppRuntime>,
) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Burst);

    while running.load(Ordering::SeqCst) && !children.is_empty() {
        tick.tick().await;

        for supervisor in supervisors.values() {
            supervisor
                .lock()
                .expect("supervisor lock poisoned")
                .maintenance_tick();
        }

        reap_and_restart(children);
    }
}

