//! KYC AVS Operator
//!
//! Answers KYC compliance tasks issued by the AVS contract.

use alloy_primitives::Address;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kyc_operator::config::{
    DEFAULT_ORACLE_TIMEOUT_MS, DEFAULT_SHUTDOWN_GRACE_SECS, DEFAULT_WORKERS,
};
use kyc_operator::queue::{DEFAULT_LEASE_SECS, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF_SECS};
use kyc_operator::{
    init_logging, ChainClients, ComplianceOracleAggregator, EventSourceConfig, LogFormat,
    OperatorKey, QueueConfig, RawConfig, SignatureIssuer, SqliteTaskQueue, TaskLifecycleController,
    TaskQueue, WorkerConfig,
};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kyc-operator")]
#[command(about = "KYC AVS attestation operator")]
struct Args {
    /// Operator private key (hex)
    #[arg(long, env = "OPERATOR_PRIVATE_KEY", hide_env_values = true)]
    operator_private_key: Option<String>,

    /// AVS contract address
    #[arg(long, env = "AVS_CONTRACT_ADDRESS")]
    avs_contract_address: Option<String>,

    /// Chain the AVS contract lives on
    #[arg(long, env = "AVS_CONTRACT_CHAIN_ID")]
    avs_contract_chain_id: Option<String>,

    /// Comma separated list of enabled chain ids
    #[arg(long, env = "CHAIN_IDS")]
    chain_ids: Option<String>,

    /// RPC endpoints as `chain_id=url`, comma separated.
    /// Falls back to `CHAIN_RPC_<chain_id>` per chain.
    #[arg(long = "chain-rpc", env = "CHAIN_RPCS", value_delimiter = ',')]
    chain_rpcs: Vec<String>,

    /// First block of the historical backfill, or `latest`
    #[arg(long, env = "EVENTS_FROM_BLOCK_NUMBER")]
    events_from_block_number: Option<String>,

    /// Queue database file
    #[arg(long, env = "QUEUE_PATH", default_value = "./data/queue.db")]
    queue_path: PathBuf,

    /// Number of queue workers
    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Live head polling interval
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 4_000)]
    poll_interval_ms: u64,

    /// Largest block range per log query
    #[arg(long, env = "LOG_BLOCK_RANGE", default_value_t = 10_000)]
    log_block_range: u64,

    /// Per-chain compliance query timeout
    #[arg(long, env = "ORACLE_TIMEOUT_MS", default_value_t = DEFAULT_ORACLE_TIMEOUT_MS)]
    oracle_timeout_ms: u64,

    /// Deliveries per task before it stays failed
    #[arg(long, env = "QUEUE_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    queue_max_attempts: u32,

    /// Base delay between queue retries
    #[arg(long, env = "QUEUE_RETRY_BACKOFF_SECS", default_value_t = DEFAULT_RETRY_BACKOFF_SECS)]
    queue_retry_backoff_secs: u64,

    /// Lease length before an unfinished task is redelivered
    #[arg(long, env = "QUEUE_LEASE_SECS", default_value_t = DEFAULT_LEASE_SECS)]
    queue_lease_secs: u64,

    /// Time busy workers get to finish on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = DEFAULT_SHUTDOWN_GRACE_SECS)]
    shutdown_grace_secs: u64,

    /// Submit responses with the operator signature attached
    #[arg(long, env = "SUBMIT_WITH_SIGNATURE")]
    submit_with_signature: bool,

    /// Log output format (pretty or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the operator (default)
    Run,
    /// Print a signature for registering the operator with the AVS
    RegistrationSignature,
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field(
                "operator_private_key",
                &self.operator_private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("avs_contract_address", &self.avs_contract_address)
            .field("avs_contract_chain_id", &self.avs_contract_chain_id)
            .field("chain_ids", &self.chain_ids)
            .field("chain_rpcs", &self.chain_rpcs)
            .field("events_from_block_number", &self.events_from_block_number)
            .field("queue_path", &self.queue_path)
            .field("workers", &self.workers)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("log_block_range", &self.log_block_range)
            .field("oracle_timeout_ms", &self.oracle_timeout_ms)
            .field("queue_max_attempts", &self.queue_max_attempts)
            .field("queue_retry_backoff_secs", &self.queue_retry_backoff_secs)
            .field("queue_lease_secs", &self.queue_lease_secs)
            .field("shutdown_grace_secs", &self.shutdown_grace_secs)
            .field("submit_with_signature", &self.submit_with_signature)
            .field("log_format", &self.log_format)
            .field("command", &self.command)
            .finish()
    }
}

impl Args {
    fn raw_config(&self) -> RawConfig {
        let events = EventSourceConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_block_range: self.log_block_range,
            ..EventSourceConfig::default()
        };

        RawConfig {
            operator_private_key: self.operator_private_key.clone(),
            avs_contract_address: self.avs_contract_address.clone(),
            avs_contract_chain_id: self.avs_contract_chain_id.clone(),
            chain_ids: self.chain_ids.clone(),
            chain_rpcs: self.chain_rpcs.clone(),
            events_from_block: self.events_from_block_number.clone(),
            events,
            queue: QueueConfig {
                max_attempts: self.queue_max_attempts,
                retry_backoff: Duration::from_secs(self.queue_retry_backoff_secs),
                lease_duration: Duration::from_secs(self.queue_lease_secs),
            },
            workers: WorkerConfig {
                workers: self.workers,
                shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
                ..WorkerConfig::default()
            },
            oracle_timeout_ms: self.oracle_timeout_ms,
            submit_with_signature: self.submit_with_signature,
            ..RawConfig::default()
        }
        .with_legacy_rpcs(|name| std::env::var(name).ok())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    match args.command {
        Some(Command::RegistrationSignature) => registration_signature(&args),
        Some(Command::Run) | None => run(&args).await,
    }
}

async fn run(args: &Args) -> Result<()> {
    let config = match args.raw_config().validate() {
        Ok(config) => config,
        Err(errors) => {
            for e in &errors {
                error!("Configuration error: {}", e);
            }
            anyhow::bail!("invalid configuration ({} error(s))", errors.len());
        }
    };

    info!("Starting KYC AVS operator");
    info!("  Operator: {}", config.operator_address);
    info!("  AVS: {} on chain {}", config.avs_address, config.avs_chain_id);
    info!("  Chains: {:?}", config.chains.chain_ids());
    info!("  Backfill from: {}", config.events.from_block);
    info!("  Workers: {}", config.workers.workers);

    let clients = ChainClients::connect(&config.chains, &config.operator_key);
    let avs = Arc::new(clients.avs_contract(&config)?);
    let aggregator = ComplianceOracleAggregator::new(
        clients.compliance_oracles(&config.chains)?,
        config.oracle_timeout,
    )?;
    info!("  Compliance chains: {:?}", aggregator.chain_ids());

    let queue: Arc<dyn TaskQueue> = Arc::new(
        SqliteTaskQueue::open(&args.queue_path, config.queue.clone())
            .with_context(|| format!("failed to open queue at {:?}", args.queue_path))?,
    );

    let controller = TaskLifecycleController::new(
        avs,
        aggregator,
        SignatureIssuer::new(config.operator_key.signer().clone()),
        queue,
        config.events.clone(),
        config.workers.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    controller.run(shutdown_rx).await?;
    info!("Operator stopped");
    Ok(())
}

fn registration_signature(args: &Args) -> Result<()> {
    let key: OperatorKey = args
        .operator_private_key
        .as_deref()
        .context("OPERATOR_PRIVATE_KEY is required")?
        .parse()?;
    let avs = args
        .avs_contract_address
        .as_deref()
        .context("AVS_CONTRACT_ADDRESS is required")?
        .trim()
        .parse::<Address>()
        .context("invalid AVS_CONTRACT_ADDRESS")?;

    let issuer = SignatureIssuer::new(key.signer().clone());
    let attestation = issuer.sign_registration(key.address(), avs)?;

    let output = serde_json::json!({
        "operator": key.address(),
        "avs": avs,
        "signature": attestation.signature,
        "salt": attestation.salt,
        "expiry": attestation.expiry,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
