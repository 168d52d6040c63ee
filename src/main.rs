//! spatial-gw: parameter sync gateway between control surfaces and a
//! redundant spatial audio processor pair.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spatial_gw::cli;
use spatial_gw::config::{watcher::ConfigWatcher, AppConfig};
use spatial_gw::engine::{DeviceTopology, Engine, ExtensionMode, Participant};
use spatial_gw::protocol::{ConsoleTransport, DeviceIndex};
use spatial_gw::state::PersistenceActor;

/// Spatial gateway - sync sound object and matrix parameters with a
/// redundant processor pair
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write logs to daily files in this directory
    #[arg(long)]
    log_dir: Option<String>,

    /// Start with device polling disabled, regardless of configuration
    #[arg(long)]
    offline: bool,

    /// Run without the interactive console
    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let _log_guard = init_logging(&args.log_level, args.log_dir.as_deref())?;

    info!("Starting spatial-gw...");
    info!("Configuration file: {}", args.config);

    // Load configuration with hot-reload watcher
    let (mut config_watcher, initial_config) = ConfigWatcher::new(args.config.clone()).await?;
    info!("Configuration loaded, hot reload enabled");

    let mut config = (*initial_config).clone();
    if args.offline {
        config.engine.online = false;
    }

    let topology = DeviceTopology::new(config.topology.mode, config.topology.active_side);
    let engine = Arc::new(Engine::new(
        topology,
        config.engine.tick_ms,
        config.engine.online,
    ));

    // Snapshot persistence with debounced writes
    let persistence = PersistenceActor::spawn(&config.snapshot.dir, config.snapshot.debounce_ms)?;
    engine.set_persistence(persistence).await;

    if config.snapshot.restore_on_start {
        match engine.restore_latest().await {
            Ok(true) => info!("restored objects from the last snapshot"),
            Ok(false) => info!("no snapshot to restore"),
            Err(e) => warn!("snapshot restore failed: {e:#}"),
        }
    }

    seed_objects(&engine, &config).await;

    // One console transport per configured device channel
    engine
        .register_transport(
            DeviceIndex::First,
            Arc::new(ConsoleTransport::new(config.devices.first.clone())),
        )
        .await?;
    if config.topology.mode != ExtensionMode::Off {
        let name = config
            .devices
            .second
            .clone()
            .unwrap_or_else(|| "second".to_string());
        engine
            .register_transport(DeviceIndex::Second, Arc::new(ConsoleTransport::new(name)))
            .await?;
    }

    engine.clone().start();
    info!("Engine running, dispatch every {} ms", engine.status().tick_ms);

    let mut repl_task: tokio::task::JoinHandle<Result<()>> = if args.headless {
        tokio::spawn(async {
            std::future::pending::<()>().await;
            Ok(())
        })
    } else {
        tokio::spawn(cli::run_repl(engine.clone()))
    };

    loop {
        tokio::select! {
            res = &mut repl_task => {
                match res {
                    Ok(Ok(())) => info!("console closed"),
                    Ok(Err(e)) => warn!("console error: {e:#}"),
                    Err(e) => warn!("console task failed: {e}"),
                }
                break;
            }

            Some(new_config) = config_watcher.next_config() => {
                info!("Configuration file changed, applying settings...");
                engine
                    .apply_settings(
                        new_config.topology.mode,
                        new_config.topology.active_side,
                        new_config.engine.tick_ms,
                        new_config.engine.online,
                    )
                    .await;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    repl_task.abort();

    info!("Shutting down...");
    if let Err(e) = engine.save_now().await {
        warn!("final snapshot save failed: {e:#}");
    }
    engine.shutdown().await;
    info!("spatial-gw shutdown complete");
    Ok(())
}

/// Create the objects the configuration declares, but only into an empty
/// registry so a restored snapshot wins over the config list.
async fn seed_objects(engine: &Arc<Engine>, config: &AppConfig) {
    let status = engine.status();
    if status.sound_objects + status.matrix_inputs + status.matrix_outputs > 0 {
        return;
    }
    for obj in &config.objects {
        let id = engine.create_object(obj.kind).await;
        engine
            .set_object_id(id, obj.object_id, Participant::Init)
            .await;
        if obj.mapping_id > 0 {
            engine
                .set_mapping_id(id, obj.mapping_id, Participant::Init)
                .await;
        }
        engine
            .set_direction(id, obj.direction.to_mode(), Participant::Init)
            .await;
        if !obj.name.is_empty() {
            engine.set_name(id, &obj.name, Participant::Init).await;
        }
        info!(
            id,
            kind = obj.kind.label(),
            object_id = obj.object_id,
            "seeded object"
        );
    }
}

fn init_logging(
    level: &str,
    log_dir: Option<&str>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false),
    );

    if let Some(dir) = log_dir {
        let appender = tracing_appender::rolling::daily(dir, "spatial-gw.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .init();
        Ok(Some(guard))
    } else {
        registry.init();
        Ok(None)
    }
}
