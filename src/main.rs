use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use database_operator::controller::{
    BackoffPolicy, Context, Controller, ControllerConfig, KubeEventRecorder, StorageCleanup,
};
use database_operator::crd::Database;
use database_operator::store::{KubeStore, ResourceStore};
use database_operator::Error;
use kube::CustomResourceExt;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Print the Database CustomResourceDefinition as YAML
    Crd,
    /// Show version information
    Version,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Only watch Databases in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Number of concurrent reconciliation workers
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    workers: usize,

    /// Deadline for a single reconciliation attempt
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 30)]
    reconcile_timeout_secs: u64,

    /// Requeue interval for converged Databases
    #[arg(long, env = "RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,

    /// Requeue interval while a rollout is in progress
    #[arg(long, env = "PROGRESS_SECS", default_value_t = 10)]
    progress_secs: u64,

    /// Consecutive apply failures before a Database is marked Degraded
    #[arg(long, env = "QUICK_RETRIES", default_value_t = 3)]
    quick_retries: u32,

    #[arg(long, env = "BACKOFF_BASE_SECS", default_value_t = 5)]
    backoff_base_secs: u64,

    #[arg(long, env = "BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,

    /// Backoff base for authorization failures
    #[arg(long, env = "FORBIDDEN_BACKOFF_BASE_SECS", default_value_t = 60)]
    forbidden_backoff_base_secs: u64,

    #[arg(long, env = "FORBIDDEN_BACKOFF_MAX_SECS", default_value_t = 900)]
    forbidden_backoff_max_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Port for /healthz and /metrics
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    http_port: u16,
}

impl RunArgs {
    fn controller_config(&self) -> Result<ControllerConfig, Error> {
        if self.workers == 0 {
            return Err(Error::ConfigError("--workers must be at least 1".to_string()));
        }
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "--reconcile-timeout-secs must be at least 1".to_string(),
            ));
        }
        if self.backoff_base_secs > self.backoff_max_secs
            || self.forbidden_backoff_base_secs > self.forbidden_backoff_max_secs
        {
            return Err(Error::ConfigError(
                "backoff base must not exceed backoff max".to_string(),
            ));
        }

        Ok(ControllerConfig {
            namespace: self.namespace.clone(),
            workers: self.workers,
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_secs),
            progress_interval: Duration::from_secs(self.progress_secs),
            quick_retries: self.quick_retries,
            backoff: BackoffPolicy::new(
                Duration::from_secs(self.backoff_base_secs),
                Duration::from_secs(self.backoff_max_secs),
            ),
            forbidden_backoff: BackoffPolicy::new(
                Duration::from_secs(self.forbidden_backoff_base_secs),
                Duration::from_secs(self.forbidden_backoff_max_secs),
            ),
            ..ControllerConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Database Operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Crd => {
            let yaml = serde_yaml::to_string(&Database::crd())
                .map_err(|e| Error::ConfigError(format!("Failed to render CRD: {e}")))?;
            print!("{yaml}");
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .init(),
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).init(),
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);
    let config = args.controller_config()?;

    info!("Starting Database Operator v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let store: Arc<dyn ResourceStore> =
        Arc::new(KubeStore::new(client.clone(), config.namespace.clone()));

    // Verify CRD exists
    match store.list().await {
        Ok(_) => info!("Database CRD is available"),
        Err(e) => {
            return Err(Error::ConfigError(format!(
                "Database CRD not available, install it with \
                 `database-operator crd | kubectl apply -f -`: {e}"
            )));
        }
    }

    let ctx = Context::new(
        store.clone(),
        Arc::new(KubeEventRecorder::new(client)),
        Arc::new(StorageCleanup::new(store.clone())),
        config,
    );
    let controller = Controller::new(ctx);

    #[cfg(feature = "rest-api")]
    {
        let state = database_operator::rest_api::ApiState {
            store: store.clone(),
            queue: controller.queue(),
        };
        let port = args.http_port;
        tokio::spawn(async move {
            if let Err(e) = database_operator::rest_api::run_server(state, port).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    controller.run(shutdown_signal()).await?;
    info!("Database Operator stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
