#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use fp_cache::{PackageCache, PackageCacheConfig};
use fp_daemon::{
    build_executor_router, build_gateway_router, ExecutorMiddlewareAuthorizer, ExecutorState,
    GatewayState,
};
use fp_executor::{ExecutionEngine, ExecutionEngineConfig, IsolateRunnerConfig};
use fp_gateway::proxy::Proxy;
use fp_gateway::{Gateway, RouteIndex};
use fp_invalidation::{DebounceConfig, InvalidationBus};
use fp_objectstore::{LocalDiskObjectStore, ObjectStore, S3ObjectStore};
use fp_pool::PoolConfig;
use fp_retry::RetryConfig;
use fp_store::MetadataStore;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fp-daemon", version, about = "Serverless function platform daemon")]
struct Args {
    /// Public gateway bind address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    gateway_bind: SocketAddr,

    /// Internal executor bind address the gateway proxies to.
    #[arg(long, default_value = "127.0.0.1:8081")]
    executor_bind: SocketAddr,

    /// Path to a TOML configuration file. Falls back to defaults plus
    /// environment overrides when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Isolate runner command, e.g. `node` or a wrapper script.
    #[arg(long, default_value = "node")]
    isolate_command: String,

    /// Enable debug-level logging.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("fp=debug,fp_daemon=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = fp_config::load_config(args.config.as_deref()).context("load config")?;
    for warning in fp_config::validate_config(&config).context("validate config")? {
        tracing::warn!(target: "fp.daemon", %warning, "configuration warning");
    }

    let store_pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.metadata_database_url)
        .await
        .context("connect metadata store pool")?;
    let log_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.metadata_database_url)
        .await
        .context("connect execution-log pool")?;
    let store = MetadataStore::new(store_pool);
    let log_store = MetadataStore::new(log_pool);

    let object_store: Arc<dyn ObjectStore> = if let Some(path) = config
        .object_store_url
        .strip_prefix("file://")
    {
        Arc::new(LocalDiskObjectStore::new(PathBuf::from(path)))
    } else {
        let aws_config = aws_config::load_from_env().await;
        let client = aws_sdk_s3::Client::new(&aws_config);
        Arc::new(S3ObjectStore::new(client, config.object_store_bucket.clone()))
    };

    let package_cache = Arc::new(PackageCache::new(
        PackageCacheConfig {
            cache_dir: PathBuf::from(&config.cache_dir),
            max_cache_size_bytes: config.max_cache_size_gb * 1_000_000_000,
            ttl: Duration::from_secs(config.cache_ttl_days * 24 * 60 * 60),
            retry: RetryConfig {
                max_retries: config.max_fetch_retries,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
            },
        },
        object_store,
    ));

    let pool_config = PoolConfig {
        min_size: config.min_pool,
        max_size: config.max_pool_size,
        idle_timeout: Duration::from_secs(300),
        health_check_interval: Duration::from_secs(30),
    };
    let engine_config = ExecutionEngineConfig {
        execution_timeout: Duration::from_millis(config.execution_timeout_ms),
        acquire_timeout: Duration::from_secs(5),
        isolate_runner: IsolateRunnerConfig {
            command: args.isolate_command.clone(),
            base_args: Vec::new(),
        },
    };
    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        log_store,
        package_cache,
        pool_config,
        engine_config,
    ));

    let invalidation_bus = Arc::new(InvalidationBus::new(DebounceConfig {
        window: Duration::from_millis(config.debounce_ms),
    }));
    engine.spawn_invalidation_listener(invalidation_bus.subscribe());

    let route_index = Arc::new(RouteIndex::load(&store).await.context("load route index")?);
    spawn_gateway_refresh_listener(route_index.clone(), store.clone(), invalidation_bus.subscribe());

    {
        let bus = invalidation_bus.clone();
        let database_url = config.metadata_database_url.clone();
        tokio::spawn(async move {
            if let Err(err) = bus.run(&database_url).await {
                tracing::error!(target: "fp.daemon", error = %err, "invalidation bus exited");
            }
        });
    }

    spawn_pool_reaper(engine.clone());
    spawn_retention_sweeper(store.clone(), config.default_retention_days);

    let executor_base_url = format!("http://{}", args.executor_bind);
    let proxy = Proxy::new(executor_base_url.clone(), Duration::from_millis(config.execution_timeout_ms));
    let middleware = Arc::new(ExecutorMiddlewareAuthorizer::new(executor_base_url));
    let gateway = Arc::new(Gateway::new(route_index, proxy, middleware, Duration::from_secs(10)));

    let executor_app = build_executor_router(ExecutorState { engine })
        .into_make_service_with_connect_info::<SocketAddr>();
    let gateway_app = build_gateway_router(GatewayState { gateway })
        .into_make_service_with_connect_info::<SocketAddr>();

    let executor_listener = tokio::net::TcpListener::bind(args.executor_bind)
        .await
        .with_context(|| format!("bind executor at {}", args.executor_bind))?;
    let gateway_listener = tokio::net::TcpListener::bind(args.gateway_bind)
        .await
        .with_context(|| format!("bind gateway at {}", args.gateway_bind))?;

    info!(
        executor_bind = %args.executor_bind,
        gateway_bind = %args.gateway_bind,
        "fp-daemon listening"
    );

    tokio::try_join!(
        async { axum::serve(executor_listener, executor_app).await.context("serve executor") },
        async { axum::serve(gateway_listener, gateway_app).await.context("serve gateway") },
    )?;

    Ok(())
}

fn spawn_gateway_refresh_listener(
    route_index: Arc<RouteIndex>,
    store: MetadataStore,
    mut rx: tokio::sync::broadcast::Receiver<fp_invalidation::InvalidationEvent>,
) {
    use fp_invalidation::InvalidationEvent;
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(InvalidationEvent::GatewayConfig | InvalidationEvent::FullRefresh) => {
                    if let Err(err) = route_index.refresh(&store).await {
                        tracing::warn!(target: "fp.daemon", error = %err, "route index refresh failed");
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if let Err(err) = route_index.refresh(&store).await {
                        tracing::warn!(target: "fp.daemon", error = %err, "route index refresh failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_pool_reaper(engine: Arc<ExecutionEngine>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            engine.pool().reap_idle().await;
        }
    });
}

/// Periodic execution-log retention sweep (§3, §4.4 "Retention sweep"):
/// every active function's logs are pruned per its own `retention`
/// override, falling back to `default_retention_days` (§8 testable
/// property #8).
fn spawn_retention_sweeper(store: MetadataStore, default_retention_days: u32) {
    let default_policy = fp_core::RetentionPolicy::Time {
        days: default_retention_days,
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60 * 60));
        loop {
            ticker.tick().await;
            match store.sweep_execution_log_retention(&default_policy).await {
                Ok(deleted) => {
                    if deleted > 0 {
                        info!(target: "fp.daemon", deleted, "execution log retention sweep pruned rows");
                    }
                }
                Err(err) => {
                    tracing::warn!(target: "fp.daemon", error = %err, "execution log retention sweep failed");
                }
            }
        }
    });
}
