//! Error taxonomy for the operator.
//!
//! - Configuration errors are fatal at startup.
//! - Contract/RPC errors are scoped to the call that produced them.
//! - Submission errors fail a single task.

use thiserror::Error;

/// Invalid or missing process settings. The operator does not start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("CHAIN_IDS cannot be empty")]
    EmptyChainSet,
    #[error("AVS_CONTRACT_CHAIN_ID ({avs_chain}) must be one of the enabled chain IDs: {enabled}")]
    AvsChainNotEnabled { avs_chain: u64, enabled: String },
    #[error("CHAIN_RPC_{0} is required for chain ID {0}")]
    MissingRpc(u64),
    #[error("no compliance oracle deployment known for chain {0}")]
    MissingOracleDeployment(u64),
    #[error("no compliance chains left to evaluate after excluding sandbox chains")]
    NoComplianceChains,
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// A chain id the operator has no knowledge of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("chain {0} not supported")]
    Unsupported(u64),
    #[error("client for chain {0} is not defined")]
    ClientNotDefined(u64),
}

/// Failure of a read or write against a contract.
#[derive(Debug, Clone, Error)]
pub enum ContractError {
    #[error("rpc error on chain {chain_id}: {message}")]
    Rpc { chain_id: u64, message: String },
    #[error("failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },
    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },
    #[error("call timed out after {0}ms")]
    Timeout(u64),
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid operator private key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("corrupt queue row for task {task_id}: {reason}")]
    Corrupt { task_id: String, reason: String },
    #[error("lease for task {0} was lost (expired and redelivered)")]
    LeaseLost(String),
    #[error("queue is closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EventSourceError {
    #[error("historical backfill failed: {0}")]
    Backfill(#[source] ContractError),
    #[error("could not read head block: {0}")]
    Head(#[source] ContractError),
}

/// Reason a task ended in the `Failed` state.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("signing task response failed: {0}")]
    Signing(#[from] SignatureError),
    #[error("submitting task response failed: {0}")]
    Contract(#[from] ContractError),
}
