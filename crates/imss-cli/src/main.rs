use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "imss", about = "Instant-messaging core: gateway and logic processes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Path to a config file, overriding the standard discovery order.
    #[arg(long, global = true, env = "IMSS_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Address to bind to (overrides config value); gateway only.
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Port to listen on (overrides config value); gateway only.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// This process's gateway/worker instance id (overrides config value).
    #[arg(long, global = true, env = "IMSS_INSTANCE_ID")]
    instance_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Gateway process (default when no subcommand is given).
    Gateway,
    /// Start the Logic Orchestrator and Delivery Pipeline consumers.
    Logic,
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry.with(fmt::layer().json().with_target(true).with_thread_ids(false)).init();
    } else {
        registry.with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true)).init();
    }
}

fn load_config(cli: &Cli) -> imss_config::ImssConfig {
    let mut config = match &cli.config {
        Some(path) => imss_config::load_config(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            imss_config::ImssConfig::default()
        }),
        None => imss_config::discover_and_load(),
    };

    if let Some(ref bind) = cli.bind {
        config.server.bind = bind.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref id) = cli.instance_id {
        config.instance_id = id.clone();
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);
    info!(version = env!("CARGO_PKG_VERSION"), "imss starting");

    let config = load_config(&cli);

    match cli.command {
        None | Some(Commands::Gateway) => run_gateway(config).await,
        Some(Commands::Logic) => run_logic(config).await,
    }
}

async fn run_gateway(config: imss_config::ImssConfig) -> anyhow::Result<()> {
    let kv = Arc::new(imss_kv_store::RedisKvStore::connect(&config.kv.url).await?);
    let ring = Arc::new(imss_hash_ring::HashRing::new(config.ring.partitions, config.ring.replicas, config.ring.load_factor));
    let locator = Arc::new(imss_locator::SessionLocator::new(kv.clone(), ring));

    let sync_producer = Arc::new(imss_durable_log::KafkaSyncProducer::new(&config.broker.bootstrap_servers)?);
    let async_producer = Arc::new(imss_durable_log::KafkaAsyncProducer::new(&config.broker.bootstrap_servers)?);
    let id_gen = Arc::new(imss_id_gen::IdGenerator::new(worker_id(&config.instance_id))?);
    let services = Arc::new(imss_logic::Services::default());
    let orchestrator =
        Arc::new(imss_logic::LogicOrchestrator::new(id_gen, services, kv.clone(), locator.clone(), sync_producer, async_producer));

    let heartbeat = Arc::new(imss_locator::HeartbeatManager::new(kv.clone(), config.instance_id.clone()));
    let authenticator = Arc::new(imss_gateway::SharedSecretAuthenticator::new(
        std::env::var("IMSS_SHARED_SECRET").unwrap_or_else(|_| "dev-secret".into()),
    ));

    let state = imss_gateway::GatewayState::new(config.instance_id.clone(), kv, orchestrator, heartbeat, authenticator);

    let locator_shutdown = locator_sync_loop(&locator);
    let runtime = imss_gateway::GatewayRuntime::start(state.clone(), &config.server.bind, config.server.port).await?;

    let router = imss_gateway::build_router(state).into_make_service_with_connect_info::<std::net::SocketAddr>();
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");

    let serve = axum::serve(listener, router);
    tokio::select! {
        result = serve => result.map_err(anyhow::Error::from)?,
        _ = tokio::signal::ctrl_c() => {
            info!("gateway: shutdown signal received");
        },
    }
    let _ = locator_shutdown.send(true);
    runtime.shutdown().await;
    Ok(())
}

/// Starts the locator's own membership-sync loop, independent of the
/// gateway's shutdown channel — the locator is a read path shared by every
/// gateway and logic process and keeps syncing until the process exits.
/// Returns the sender used to stop it.
fn locator_sync_loop(locator: &Arc<imss_locator::SessionLocator<imss_kv_store::RedisKvStore>>) -> tokio::sync::watch::Sender<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    locator.spawn_sync_loop(rx);
    tx
}

async fn run_logic(config: imss_config::ImssConfig) -> anyhow::Result<()> {
    let kv = Arc::new(imss_kv_store::RedisKvStore::connect(&config.kv.url).await?);
    let consumer = Arc::new(imss_durable_log::KafkaConsumer::new(config.broker.bootstrap_servers.clone()));

    let pool = sqlx::SqlitePool::connect(&std::env::var("IMSS_ARCHIVE_DB").unwrap_or_else(|_| "sqlite://imss-archive.db".into())).await?;
    imss_delivery::SqlMessageStore::init(&pool).await?;
    let store = Arc::new(imss_delivery::SqlMessageStore::new(pool));

    let storage_handler: Arc<dyn imss_durable_log::ConsumerHandler> = Arc::new(imss_delivery::StorageConsumerHandler::new(store));
    let push_handler: Arc<dyn imss_durable_log::ConsumerHandler> = Arc::new(imss_delivery::PushConsumerHandler::new(kv.clone()));

    let storage_consumer = Arc::clone(&consumer);
    let storage_task = tokio::spawn(async move {
        use imss_durable_log::Consumer;
        storage_consumer.run(imss_protocol::topics::MESSAGE_PERSISTENCE_LOG, "imss-storage-consumer", storage_handler).await
    });

    let push_consumer = Arc::clone(&consumer);
    let push_task = tokio::spawn(async move {
        use imss_durable_log::Consumer;
        push_consumer.run(imss_protocol::topics::DOWNLINK_MESSAGES, "imss-push-consumer", push_handler).await
    });

    let ring = Arc::new(imss_hash_ring::HashRing::new(config.ring.partitions, config.ring.replicas, config.ring.load_factor));
    let locator = Arc::new(imss_locator::SessionLocator::new(kv.clone(), ring));
    let _locator_shutdown = locator_sync_loop(&locator);

    let cleaner = Arc::new(imss_locator::MembershipCleaner::new(kv.clone(), config.instance_id.clone()));
    let cleaner_shutdown = cleaner_loop(&cleaner);

    info!("logic/delivery process running");
    tokio::select! {
        result = storage_task => { result??; },
        result = push_task => { result??; },
        _ = tokio::signal::ctrl_c() => {
            info!("logic: shutdown signal received");
        },
    }
    let _ = cleaner_shutdown.send(true);
    Ok(())
}

/// Starts this replica's membership-cleaner leader-election/purge loop
/// (§4.6) — every Logic replica runs one, with exactly one acting as leader
/// at a time. Returns the sender used to stop it.
fn cleaner_loop(cleaner: &Arc<imss_locator::MembershipCleaner<imss_kv_store::RedisKvStore>>) -> tokio::sync::watch::Sender<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    cleaner.spawn_loop(rx);
    tx
}

fn worker_id(instance_id: &str) -> u32 {
    instance_id.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b))) % 1024
}
