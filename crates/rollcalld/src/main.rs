use anyhow::{Context, Result};
use rollcall_core::{
    FaceDetector, OnnxDetector, OnnxEncoder, Recognizer, SignatureEncoder, SignatureGallery,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod access;
mod bus;
mod config;
mod dbus_interface;
mod dispatcher;
mod enrollment;
mod ledger;
mod pool;
mod scheduler;
mod transfer;

use access::AccessGuard;
use bus::MqttTransport;
use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use dispatcher::IngestDispatcher;
use enrollment::EnrollmentStore;
use ledger::AttendanceLedger;
use pool::{ResultSink, WorkerContext, WorkerRecognizer};
use scheduler::Scheduler;
use transfer::SessionRegistry;

/// Load one detector/encoder pair per worker. Fails fast if a model is missing.
fn load_recognizers(config: &Config) -> Result<Vec<WorkerRecognizer>> {
    let detector_path = config.detector_model_path();
    let encoder_path = config.encoder_model_path();
    let mut recognizers = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        let detector = OnnxDetector::load(&detector_path)
            .with_context(|| format!("loading face detector from {detector_path}"))?;
        let encoder = OnnxEncoder::load(&encoder_path)
            .with_context(|| format!("loading signature model from {encoder_path}"))?;
        recognizers.push(Recognizer::new(
            Box::new(detector) as Box<dyn FaceDetector>,
            Box::new(encoder) as Box<dyn SignatureEncoder>,
            config.policy,
        ));
    }
    tracing::info!(
        workers = config.workers,
        detector = %detector_path,
        encoder = %encoder_path,
        "models loaded"
    );
    Ok(recognizers)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        threshold = config.policy.threshold,
        strictness = ?config.policy.strictness,
        "configuration loaded"
    );

    let system_db = config.system_db_path();
    let enrollment = Arc::new(EnrollmentStore::open(&system_db)?);
    let access = Arc::new(AccessGuard::open(&system_db)?);
    let ledger = Arc::new(AttendanceLedger::open(config.groups_dir(), config.cutoffs));
    let gallery = Arc::new(SignatureGallery::new(enrollment.clone()));

    let recognizers = load_recognizers(&config)?;
    let transport = MqttTransport::new(&config.mqtt);
    let sink: Arc<dyn ResultSink> = Arc::new(transport.sink());

    let pool = pool::spawn_pool(
        recognizers,
        config.queue_depth,
        Arc::new(WorkerContext {
            gallery: Arc::clone(&gallery),
            enrollment: Arc::clone(&enrollment),
            ledger: Arc::clone(&ledger),
            sink: Arc::clone(&sink),
        }),
    )
    .context("spawning worker threads")?;

    let dispatcher = Arc::new(IngestDispatcher::new(
        Arc::new(SessionRegistry::new(config.transfer)),
        Arc::clone(&access),
        pool.clone(),
        sink,
        config.auth_limit,
        config.submit_limit,
    ));

    let mut scheduler = Scheduler::new();
    scheduler.spawn_reaper(Arc::clone(&dispatcher), config.transfer.reap_interval);
    scheduler.spawn_daily_reset(Arc::clone(&ledger), config.reset_times.clone());

    let service = AttendanceService {
        pool,
        access,
        enrollment,
        gallery,
        ledger,
        dispatcher: Arc::clone(&dispatcher),
        policy: config.policy,
        auth_limit: config.auth_limit,
        submit_limit: config.submit_limit,
        admin_uids: config.admin_uids.clone(),
        started: Instant::now(),
    };
    let builder = if config.dbus_session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _dbus = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;
    tracing::info!(name = BUS_NAME, session_bus = config.dbus_session, "D-Bus interface registered");

    let mqtt = tokio::spawn(transport.run(dispatcher, scheduler.shutdown_signal()));
    tracing::info!(
        host = %config.mqtt.host,
        port = config.mqtt.port,
        "rollcalld ready"
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    tracing::info!("rollcalld shutting down");

    scheduler.shutdown().await;
    if let Err(e) = mqtt.await {
        tracing::warn!(error = %e, "mqtt task ended abnormally");
    }

    Ok(())
}
