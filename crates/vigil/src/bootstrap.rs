//! Process wiring: stores, engine, scanners, supervisor, orchestrator.

use crate::cli::{LookupArgs, ServeArgs, StatusArgs, UpdateArgs};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use vigil_cache::VulnCache;
use vigil_protocol::SystemConfig;
use vigil_scanner::{
    ArtifactFetcher, ClamAv, DependencyScanAdapter, FsObjectStore, HttpObjectStore, ObjectStore,
    Orchestrator, OrchestratorConfig, OsvClient, OsvScannerBinary, ScanRunner, ScannerSet,
};
use vigil_signatures::{ContentHash, EngineConfig, SignatureEngine};
use vigil_store::{CompletionPublisher, ConsumerConfig, StateManager, StreamConsumer};
use vigil_updater::{
    NoopReadiness, ReadinessProvider, ScanCounter, ScanGate, SignatureFeedSource, SourceSpec,
    UpdateSupervisor, VirusDatabaseSource, VulnDatabaseSource, SOURCE_SIGNATURE_FEED,
    SOURCE_VIRUS_DB, SOURCE_VULN_DB,
};

const FEED_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const VIRUS_DB_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
const VULN_DB_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

pub async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = SystemConfig::default();
    config.store_url = args.store.store_url.clone();
    config.signature_db_path = args.store.signature_db.clone();
    config.task_stream = args.task_stream.clone();
    config.task_group = args.task_group.clone();
    config.workers = args.workers;
    config.skip_db_update = args.skip_db_update;
    config.rebuild_bloom_on_start = !args.no_bloom_rebuild;
    if let Some(work_root) = &args.work_root {
        config.work_root = work_root.clone();
    }

    let backend = vigil_store::connect(&config.store_url)
        .await
        .with_context(|| format!("Failed to connect to state store at {}", config.store_url))?;

    // Engine open failure is fatal; there is no pipeline without it
    let engine = Arc::new(
        SignatureEngine::open(
            &config.signature_db_path,
            EngineConfig {
                expected_items: config.bloom_expected_items,
                fp_rate: config.bloom_fp_rate,
                rebuild_on_open: config.rebuild_bloom_on_start,
            },
        )
        .await
        .context("Failed to open signature engine")?,
    );

    let gate = ScanGate::new();
    let mut supervisor = UpdateSupervisor::new(Arc::clone(&gate));
    register_sources(
        &mut supervisor,
        Arc::clone(&engine),
        args.feed_url.clone(),
        args.vuln_manifest_url.clone(),
        args.clamav_db_dir.clone(),
    );

    let readiness: Arc<dyn ReadinessProvider> = if config.skip_db_update {
        info!("Database updates skipped (air-gapped mode)");
        Arc::new(NoopReadiness)
    } else {
        supervisor.readiness()
    };

    let cache = VulnCache::new(
        Arc::clone(&backend),
        config.cache_prefix.clone(),
        config.cache_ttl,
    );

    // Dependency scanner selection: the local vendor binary wins when it is
    // installed; otherwise the cache-backed remote adapter takes over.
    let mut scanners = ScannerSet::new();
    match OsvScannerBinary::discover() {
        Ok(binary) => {
            info!("Dependency scans via local osv-scanner binary");
            scanners = scanners.with_dependency(Arc::new(binary));
        }
        Err(_) => {
            scanners = scanners.with_dependency(Arc::new(DependencyScanAdapter::new(
                cache,
                Arc::new(OsvClient::new()),
            )));
        }
    }
    match ClamAv::discover() {
        Ok(clamav) => {
            scanners = scanners.with_antivirus(Arc::new(clamav.with_engine(Arc::clone(&engine))));
        }
        Err(err) => {
            warn!("Antivirus scanner unavailable: {}", err);
        }
    }

    let object_store: Arc<dyn ObjectStore> = match (&args.object_endpoint, &args.object_root) {
        (Some(endpoint), _) => Arc::new(HttpObjectStore::new(endpoint.clone())),
        (None, Some(root)) => Arc::new(FsObjectStore::new(root.clone())),
        (None, None) => Arc::new(FsObjectStore::new(PathBuf::from("objects"))),
    };

    let consumer = StreamConsumer::new(
        Arc::clone(&backend),
        ConsumerConfig::new(
            config.task_stream.clone(),
            config.task_group.clone(),
            format!("worker-{}", Uuid::new_v4().simple()),
        )
        .with_block(config.block_timeout),
    );
    let state = StateManager::new(
        Arc::clone(&backend),
        config.key_prefix.clone(),
        config.state_prefix.clone(),
        config.job_ttl,
    );
    let completions = CompletionPublisher::new(Arc::clone(&backend), config.completion_prefix.clone());
    let fetcher = ArtifactFetcher::new(object_store, config.work_root.clone());

    let orchestrator = Orchestrator::new(
        backend,
        consumer,
        state,
        completions,
        fetcher,
        ScanRunner::new(scanners),
        readiness,
        Arc::clone(&gate) as Arc<dyn ScanCounter>,
        OrchestratorConfig::from_system(&config),
    );

    let stop = CancellationToken::new();
    let updater_handles = supervisor.run(stop.clone());

    // Graceful shutdown on ctrl-c
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                stop.cancel();
            }
        });
    }

    orchestrator.run(stop.clone()).await?;

    stop.cancel();
    for handle in updater_handles {
        let _ = handle.await;
    }
    Ok(())
}

pub async fn lookup(args: LookupArgs) -> Result<()> {
    let engine = SignatureEngine::open(&args.store.signature_db, EngineConfig::default())
        .await
        .context("Failed to open signature engine")?;

    let hash = ContentHash::from_hex(&args.hash)?;
    let lookup = engine.lookup(&hash).await?;

    let output = serde_json::json!({
        "hash": hash.to_hex(),
        "verdict": match lookup.verdict {
            vigil_signatures::Verdict::Clean => "clean",
            vigil_signatures::Verdict::Malware => "malware",
        },
        "bloom_hit": lookup.bloom_hit,
        "elapsed_us": lookup.elapsed.as_micros() as u64,
        "signature": lookup.signature.map(|sig| serde_json::json!({
            "detection_name": sig.detection_name,
            "family": sig.family,
            "severity": sig.severity,
            "source": sig.source,
            "first_seen": sig.first_seen,
        })),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub async fn update(args: UpdateArgs) -> Result<()> {
    let gate = ScanGate::new();
    let mut supervisor = UpdateSupervisor::new(gate);

    match args.source.as_str() {
        SOURCE_SIGNATURE_FEED => {
            let Some(feed_url) = args.feed_url else {
                bail!("--feed-url is required for {}", SOURCE_SIGNATURE_FEED);
            };
            let engine = Arc::new(
                SignatureEngine::open(&args.store.signature_db, EngineConfig::default())
                    .await
                    .context("Failed to open signature engine")?,
            );
            supervisor.register(SourceSpec::new(
                Arc::new(SignatureFeedSource::new(engine, feed_url)),
                FEED_INTERVAL,
            ));
        }
        SOURCE_VIRUS_DB => {
            supervisor.register(
                SourceSpec::new(
                    Arc::new(VirusDatabaseSource::new(args.clamav_db_dir)),
                    VIRUS_DB_INTERVAL,
                )
                .scan_sensitive(),
            );
        }
        SOURCE_VULN_DB => {
            let Some(manifest_url) = args.vuln_manifest_url else {
                bail!("--vuln-manifest-url is required for {}", SOURCE_VULN_DB);
            };
            supervisor.register(SourceSpec::new(
                Arc::new(VulnDatabaseSource::new(manifest_url, vuln_snapshot_path())),
                VULN_DB_INTERVAL,
            ));
        }
        other => bail!(
            "unknown source '{}'. Expected: {}, {}, or {}",
            other,
            SOURCE_SIGNATURE_FEED,
            SOURCE_VIRUS_DB,
            SOURCE_VULN_DB
        ),
    }

    let version = supervisor.force_update(&args.source).await?;
    println!("{} updated to version {}", args.source, version);
    Ok(())
}

pub async fn status(args: StatusArgs) -> Result<()> {
    let gate = ScanGate::new();
    let mut supervisor = UpdateSupervisor::new(gate);

    let engine = Arc::new(
        SignatureEngine::open(&args.store.signature_db, EngineConfig::default())
            .await
            .context("Failed to open signature engine")?,
    );
    let stats = engine.stats().await?;

    register_sources(
        &mut supervisor,
        engine,
        None,
        None,
        args.clamav_db_dir,
    );

    let output = serde_json::json!({
        "signature_count": stats.signature_count,
        "bloom_size_bytes": stats.bloom_size_bytes,
        "sources": supervisor.status(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn register_sources(
    supervisor: &mut UpdateSupervisor,
    engine: Arc<SignatureEngine>,
    feed_url: Option<String>,
    vuln_manifest_url: Option<String>,
    clamav_db_dir: Option<PathBuf>,
) {
    if let Some(feed_url) = feed_url {
        supervisor.register(SourceSpec::new(
            Arc::new(SignatureFeedSource::new(engine, feed_url)),
            FEED_INTERVAL,
        ));
    }
    supervisor.register(
        SourceSpec::new(
            Arc::new(VirusDatabaseSource::new(clamav_db_dir)),
            VIRUS_DB_INTERVAL,
        )
        .scan_sensitive(),
    );
    if let Some(manifest_url) = vuln_manifest_url {
        supervisor.register(SourceSpec::new(
            Arc::new(VulnDatabaseSource::new(manifest_url, vuln_snapshot_path())),
            VULN_DB_INTERVAL,
        ));
    }
}

pub async fn enqueue(args: crate::cli::EnqueueArgs) -> Result<()> {
    let scanners = args
        .scanners
        .iter()
        .map(|name| name.parse())
        .collect::<Result<Vec<_>, _>>()
        .context("Unrecognized scanner name")?;

    let task = vigil_protocol::TaskMessage {
        job_id: args
            .job_id
            .unwrap_or_else(|| format!("job-{}", Uuid::new_v4().simple())),
        tenant_id: args.tenant_id,
        artifact_uri: args.artifact_uri,
        scanners,
        timeout_seconds: args.timeout_seconds,
        ttl_seconds: None,
        retry_count: 0,
        created_at: Some(chrono::Utc::now()),
    };
    task.validate().context("Invalid task")?;

    let backend = vigil_store::connect(&args.store.store_url)
        .await
        .with_context(|| format!("Failed to connect to state store at {}", args.store.store_url))?;
    let entry_id = backend
        .stream_add(
            &args.task_stream,
            &[("data".to_string(), task.to_json()?)],
        )
        .await?;

    println!("Enqueued job {} as stream entry {}", task.job_id, entry_id);
    Ok(())
}

fn vuln_snapshot_path() -> PathBuf {
    vigil_logging::vigil_home()
        .join("data")
        .join("vuln-snapshot.json")
}
