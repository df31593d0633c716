//! Command-line interface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vigil", version, about = "Distributed security-scanning pipeline")]
pub struct Cli {
    /// Mirror the log file's verbosity on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the scan orchestrator and the update supervisor
    Serve(ServeArgs),
    /// Look a content hash up in the signature engine
    Lookup(LookupArgs),
    /// Force one refresh of a data source
    Update(UpdateArgs),
    /// Show installed data-source versions
    Status(StatusArgs),
    /// Append a scan task to the task stream
    Enqueue(EnqueueArgs),
}

#[derive(Args, Clone)]
pub struct StoreArgs {
    /// State store URL (redis://... | memory:)
    #[arg(long, env = "VIGIL_STORE_URL", default_value = "redis://127.0.0.1:6379")]
    pub store_url: String,

    /// Signature database path (sqlite)
    #[arg(long, env = "VIGIL_SIGNATURE_DB", default_value = "vigil-signatures.db")]
    pub signature_db: PathBuf,
}

#[derive(Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Scratch root for per-job downloads and extraction
    #[arg(long, env = "VIGIL_WORK_ROOT")]
    pub work_root: Option<PathBuf>,

    /// Orchestrator worker count
    #[arg(long, env = "VIGIL_WORKERS", default_value_t = vigil_protocol::defaults::DEFAULT_WORKERS)]
    pub workers: usize,

    /// Task stream name
    #[arg(long, default_value = vigil_protocol::defaults::DEFAULT_TASK_STREAM)]
    pub task_stream: String,

    /// Consumer group name
    #[arg(long, default_value = vigil_protocol::defaults::DEFAULT_TASK_GROUP)]
    pub task_group: String,

    /// Serve objects from this local directory (scheme-agnostic bucket root)
    #[arg(long, env = "VIGIL_OBJECT_ROOT", conflicts_with = "object_endpoint")]
    pub object_root: Option<PathBuf>,

    /// Fetch objects from this HTTP endpoint (`{endpoint}/{bucket}/{object}`)
    #[arg(long, env = "VIGIL_OBJECT_ENDPOINT")]
    pub object_endpoint: Option<String>,

    /// Signature hash feed URL (omit to disable the source)
    #[arg(long, env = "VIGIL_FEED_URL")]
    pub feed_url: Option<String>,

    /// Vulnerability snapshot manifest URL (omit to disable the source)
    #[arg(long, env = "VIGIL_VULN_MANIFEST_URL")]
    pub vuln_manifest_url: Option<String>,

    /// ClamAV database directory (freshclam --datadir)
    #[arg(long, env = "VIGIL_CLAMAV_DB_DIR")]
    pub clamav_db_dir: Option<PathBuf>,

    /// Air-gapped mode: run scanners without waiting for source readiness
    #[arg(long, env = "VIGIL_SKIP_DB_UPDATE")]
    pub skip_db_update: bool,

    /// Skip the bloom rebuild at startup
    #[arg(long)]
    pub no_bloom_rebuild: bool,
}

#[derive(Args)]
pub struct LookupArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Hex content hash (SHA-256, SHA-1, or MD5; tier inferred from length)
    pub hash: String,
}

#[derive(Args)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Source to refresh: signature-feed | virus-db | vulnerability-db
    pub source: String,

    #[arg(long, env = "VIGIL_FEED_URL")]
    pub feed_url: Option<String>,

    #[arg(long, env = "VIGIL_VULN_MANIFEST_URL")]
    pub vuln_manifest_url: Option<String>,

    #[arg(long, env = "VIGIL_CLAMAV_DB_DIR")]
    pub clamav_db_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Task stream name
    #[arg(long, default_value = vigil_protocol::defaults::DEFAULT_TASK_STREAM)]
    pub task_stream: String,

    /// Job id (generated when omitted)
    #[arg(long)]
    pub job_id: Option<String>,

    #[arg(long)]
    pub tenant_id: String,

    /// Artifact URI (`scheme://bucket/{tenant_id}/...`)
    pub artifact_uri: String,

    /// Scanners to run (repeatable): dependency | antivirus
    #[arg(long = "scanner", required = true)]
    pub scanners: Vec<String>,

    #[arg(long)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, env = "VIGIL_CLAMAV_DB_DIR")]
    pub clamav_db_dir: Option<PathBuf>,
}
