use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use preset_cache::{
    audio::{FileChunkProcessor, Preset, ProcessingLock},
    buffer::{BackgroundWorker, BufferManager, WorkerState},
    cache::{ChunkCacheKeys, TierName},
    config::Config,
    memory::{DegradationManager, MemoryMonitor, SysinfoProbe},
    storage::JsonTrackLibrary,
    tuning::{FileRuleLearner, SelfTuner},
};

/// One request per stdin line, answered with one JSON line on stdout.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
    Position {
        track_id: u64,
        position: f64,
        preset: Preset,
        #[serde(default = "full_intensity")]
        intensity: f32,
    },
    Cached {
        track_id: u64,
        preset: Preset,
        chunk_idx: u32,
        #[serde(default = "full_intensity")]
        intensity: f32,
    },
    Needed {
        track_id: u64,
    },
    Stats,
    Clear,
    ClearTier {
        tier: TierName,
    },
}

fn full_intensity() -> f32 {
    1.0
}

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging (stdout queda para las respuestas)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("preset_cache=debug".parse()?)
                .add_directive("symphonia=warn".parse()?),
        )
        .init();

    info!("🎵 Iniciando Preset Cache v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    let library = Arc::new(JsonTrackLibrary::load(config.library_path.clone()).await?);
    let buffer = Arc::new(BufferManager::new(&config));

    let (worker_tx, worker_rx) = watch::channel(WorkerState::Running);
    let degradation = Arc::new(DegradationManager::new(
        Arc::clone(&buffer),
        worker_tx,
        config.tier_budgets(),
        config.worker_latency_threshold(),
    ));
    let monitor = Arc::new(MemoryMonitor::new(SysinfoProbe::new(), &config));
    degradation.update(&monitor.status());

    let processor = ProcessingLock::new(FileChunkProcessor::new(
        library,
        ChunkCacheKeys::new(&config.cache_dir),
        config.chunk_duration_seconds,
        config.sample_rate,
    ));
    let worker = BackgroundWorker::new(
        Arc::clone(&buffer),
        processor,
        Arc::clone(&degradation),
        worker_rx,
        &config,
    );
    let tuner = SelfTuner::new(
        Arc::clone(&buffer),
        monitor,
        Arc::clone(&degradation),
        Arc::new(FileRuleLearner::new(&config.rules_path)),
        &config,
    );

    let cancel = CancellationToken::new();
    let worker_handle = tokio::spawn(worker.run(cancel.clone()));
    let tuner_handle = tokio::spawn(tuner.run(cancel.clone()));

    // Manejar shutdown graceful
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shutdown.cancel();
    });

    info!("🚀 Preset Cache listo, esperando comandos en stdin");
    if let Err(e) = serve(&buffer, &degradation, &cancel).await {
        error!("❌ Error en el canal de comandos: {:#}", e);
    }

    cancel.cancel();
    let (worker_result, tuner_result) = tokio::join!(worker_handle, tuner_handle);
    for (name, result) in [("worker", worker_result), ("tuner", tuner_result)] {
        if let Err(e) = result {
            error!("❌ {} terminó con error: {}", name, e);
        }
    }

    info!("👋 Preset Cache detenido");
    Ok(())
}

async fn serve(
    buffer: &BufferManager,
    degradation: &DegradationManager,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("📭 stdin cerrado");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Command>(&line) {
            Ok(command) => handle(buffer, degradation, command),
            Err(e) => {
                warn!("⚠️ Comando inválido: {}", e);
                json!({ "error": e.to_string() })
            }
        };

        stdout.write_all(format!("{}\n", reply).as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}

fn handle(buffer: &BufferManager, degradation: &DegradationManager, command: Command) -> Value {
    match command {
        Command::Position {
            track_id,
            position,
            preset,
            intensity,
        } => {
            let phase = buffer.update_position(track_id, position, preset, intensity);
            json!({ "phase": phase })
        }
        Command::Cached {
            track_id,
            preset,
            chunk_idx,
            intensity,
        } => {
            let tier = buffer.is_cached(track_id, preset, chunk_idx, intensity);
            json!({
                "cached": tier.is_some(),
                "tier": tier.map(|t| t.as_str()).unwrap_or("miss"),
            })
        }
        Command::Needed { track_id } => {
            json!({ "track_id": track_id, "needed": buffer.get_needed_chunks(track_id) })
        }
        Command::Stats => {
            json!({ "cache": buffer.cache_stats(), "degradation": degradation.snapshot() })
        }
        Command::Clear => {
            json!({ "event": "cache_cleared", "removed": buffer.clear_all() })
        }
        Command::ClearTier { tier } => {
            json!({ "event": "tier_cleared", "tier": tier, "removed": buffer.clear_tier(tier) })
        }
    }
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar que la biblioteca se puede leer y el caché es escribible
    let library = JsonTrackLibrary::load(config.library_path.clone()).await?;
    let probe = config.cache_dir.join(".health-check");
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await?;

    println!("OK ({} pistas)", library.len());
    Ok(())
}
