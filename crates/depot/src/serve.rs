//! The `depot serve` command: wire up storage, the metadata store,
//! auth and metrics, then run the HTTP server until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use depot_server::auth::AuthConfig;
use depot_server::downloadcounter;
use depot_server::kv::Kv;
use depot_server::nix::{NixDb, NixState, SigningKey};
use depot_server::npm::{NpmDb, NpmState};
use depot_server::python::{PythonDb, PythonState};
use depot_server::storage::{FsStorage, LoggedStorage, S3Config, S3Storage, ShutdownHandle, Storage};
use depot_server::{AccessLog, Metrics};
use tracing::{debug, error, info};

type CliError = Box<dyn std::error::Error + Send + Sync>;

#[derive(clap::Args)]
pub struct ServeArgs {
    /// Choice of database (sqlite, rqlite or postgres)
    #[arg(long, default_value = "sqlite", env = "DEPOT_DATABASE_TYPE")]
    database_type: String,

    /// Database connection URL
    #[arg(long, default_value = "", env = "DEPOT_DATABASE_URL")]
    database_url: String,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080", env = "DEPOT_LISTEN_ADDR")]
    listen_addr: SocketAddr,

    /// Address for the metrics endpoint
    #[arg(long, default_value = "0.0.0.0:9090", env = "DEPOT_METRICS_LISTEN_ADDR")]
    metrics_listen_addr: SocketAddr,

    /// Path to the file store
    #[arg(long, default_value = "", env = "DEPOT_STORE_PATH")]
    store_path: String,

    /// Public base URL clients reach this server at (used in rewritten
    /// Python file links)
    #[arg(long, default_value = "http://localhost:8080", env = "DEPOT_PUBLIC_URL")]
    public_url: String,

    /// Path to the SSH public keys auth file (format: r/w ssh-key comment)
    #[arg(long, env = "DEPOT_AUTH_FILE")]
    auth_file: Option<PathBuf>,

    /// Path to the private key file for signing narinfo files
    #[arg(long, env = "DEPOT_PRIVATE_KEY")]
    private_key: Option<PathBuf>,

    /// Storage backend type (fs or s3)
    #[arg(long, default_value = "fs", env = "DEPOT_STORAGE_TYPE")]
    storage_type: String,

    /// S3 bucket name (required when storage-type=s3)
    #[arg(long = "s3-bucket", env = "DEPOT_S3_BUCKET", default_value = "")]
    s3_bucket: String,

    /// S3 region
    #[arg(long = "s3-region", env = "DEPOT_S3_REGION", default_value = "us-east-1")]
    s3_region: String,

    /// S3 endpoint URL (for MinIO/custom endpoints)
    #[arg(long = "s3-endpoint", env = "DEPOT_S3_ENDPOINT", default_value = "")]
    s3_endpoint: String,

    /// S3 access key ID (uses IAM role credentials if not set)
    #[arg(long = "s3-access-key-id", env = "DEPOT_S3_ACCESS_KEY_ID", default_value = "")]
    s3_access_key_id: String,

    /// S3 secret access key (uses IAM role credentials if not set)
    #[arg(long = "s3-secret-access-key", env = "DEPOT_S3_SECRET_ACCESS_KEY", default_value = "")]
    s3_secret_access_key: String,

    /// Use path-style S3 URLs (required for MinIO)
    #[arg(long = "s3-force-path-style", env = "DEPOT_S3_FORCE_PATH_STYLE")]
    s3_force_path_style: bool,
}

impl ServeArgs {
    async fn create_storage(
        &self,
        prefix: &str,
        kv: Kv,
        metrics: Metrics,
    ) -> Result<(Arc<dyn Storage>, ShutdownHandle), CliError> {
        let base: Arc<dyn Storage> = match self.storage_type.as_str() {
            "s3" => Arc::new(
                S3Storage::new(S3Config {
                    bucket: self.s3_bucket.clone(),
                    prefix: format!("{prefix}/"),
                    region: self.s3_region.clone(),
                    endpoint: self.s3_endpoint.clone(),
                    access_key_id: self.s3_access_key_id.clone(),
                    secret_access_key: self.s3_secret_access_key.clone(),
                    force_path_style: self.s3_force_path_style,
                })
                .await?,
            ),
            "fs" => Arc::new(FsStorage::new(PathBuf::from(&self.store_path).join(prefix))),
            other => return Err(format!("unknown storage type {other:?} - expected 'fs' or 's3'").into()),
        };

        let (logged, shutdown) = LoggedStorage::new(base, AccessLog::new(kv), metrics);
        Ok((Arc::new(logged), shutdown))
    }
}

pub async fn run(mut args: ServeArgs) -> Result<(), CliError> {
    match args.storage_type.as_str() {
        "s3" => {
            if args.s3_bucket.is_empty() {
                return Err("--s3-bucket must also be set when --storage-type=s3".into());
            }
        }
        "fs" => {
            if args.store_path.is_empty() {
                let home = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .ok_or("failed to get user home directory")?;
                args.store_path = home.join("depot-store").to_string_lossy().into_owned();
            }
            std::fs::create_dir_all(&args.store_path)?;
        }
        other => return Err(format!("unknown storage type {other:?} - expected 'fs' or 's3'").into()),
    }

    if args.database_url.is_empty() {
        args.database_url = PathBuf::from(&args.store_path)
            .join("depot.db")
            .to_string_lossy()
            .into_owned();
    }

    let kv = Kv::connect(&args.database_type, &args.database_url).await?;

    let auth = match &args.auth_file {
        Some(path) => {
            let config = AuthConfig::load(path)?;
            info!(
                auth_file = %path.display(),
                keys = config.keys.len(),
                require_auth_for_read = config.require_auth_for_read,
                "loaded authentication configuration"
            );
            config
        }
        None => AuthConfig::default(),
    };

    let signing_key = match &args.private_key {
        Some(path) => {
            let key = SigningKey::parse(&std::fs::read_to_string(path)?)?;
            info!(key = %key.public_key(), "loaded private key for signing");
            Some(Arc::new(key))
        }
        None => None,
    };

    let metrics = Metrics::new()?;
    let metrics_addr = args.metrics_listen_addr;
    let metrics_server = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = depot_server::metrics::listen_and_serve(metrics_addr, metrics_server).await {
            error!(addr = %metrics_addr, error = %e, "metrics server exited");
        }
    });

    let (downloads, counter_shutdown) = downloadcounter::spawn_buffered(kv.clone(), metrics.clone());

    let (nix_storage, nix_shutdown) = args.create_storage("nix", kv.clone(), metrics.clone()).await?;
    let (npm_storage, npm_shutdown) = args.create_storage("npm", kv.clone(), metrics.clone()).await?;
    let (python_storage, python_shutdown) = args.create_storage("python", kv.clone(), metrics.clone()).await?;

    let app = depot_server::router(
        NixState {
            db: NixDb::new(kv.clone()),
            storage: nix_storage,
            signing_key,
            downloads: downloads.clone(),
            metrics: metrics.clone(),
        },
        NpmState {
            db: NpmDb::new(kv.clone()),
            storage: npm_storage,
            downloads: downloads.clone(),
            metrics: metrics.clone(),
        },
        PythonState {
            db: PythonDb::new(kv.clone()),
            storage: python_storage,
            base_url: format!("{}/python", args.public_url.trim_end_matches('/')),
            downloads,
            metrics,
        },
        auth,
    );

    info!(
        addr = %args.listen_addr,
        metrics_addr = %args.metrics_listen_addr,
        store_path = %args.store_path,
        "starting server"
    );
    let listener = tokio::net::TcpListener::bind(args.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    debug!("waiting for storage to finish processing events");
    let drain = Duration::from_secs(30);
    if let Err(e) = nix_shutdown.shutdown(drain).await {
        error!(error = %e, "nix storage shutdown timed out");
    }
    if let Err(e) = npm_shutdown.shutdown(drain).await {
        error!(error = %e, "npm storage shutdown timed out");
    }
    if let Err(e) = python_shutdown.shutdown(drain).await {
        error!(error = %e, "python storage shutdown timed out");
    }
    if let Err(e) = counter_shutdown.shutdown(drain).await {
        error!(error = %e, "download counter shutdown timed out");
    }
    info!("server shutdown complete");
    Ok(())
}
