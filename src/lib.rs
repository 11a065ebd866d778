//! KYC AVS attestation operator
//!
//! Listens to a KYC AVS contract for compliance tasks, checks each task's
//! wallet against compliance oracles on every configured chain, and submits
//! a signed verdict back to the AVS.
//!
//! ## Module Structure
//!
//! - `types`: Task, event and lifecycle types
//! - `chain`: Supported chains and oracle deployments
//! - `config`: Environment-driven configuration and validation
//! - `signature`: Salted, expiring operator attestations
//! - `oracle`: Multi-chain compliance aggregation
//! - `avs`: AVS contract port and the actionability filter
//! - `events`: Backfill and live task discovery
//! - `queue`: Durable at-least-once task queue
//! - `controller`: Discovery-to-submission lifecycle and worker pool
//! - `evm`: alloy bindings for the ports above
//! - `observability`: Logging setup and spans

// ============================================================================
// Domain
// ============================================================================

/// Error types
pub mod error;

/// Core types
pub mod types;

/// Supported chains
pub mod chain;

/// Operator configuration
pub mod config;

/// Attestation signing
pub mod signature;

// ============================================================================
// Pipeline
// ============================================================================

/// Compliance oracle aggregation
pub mod oracle;

/// AVS contract port
pub mod avs;

/// Task discovery
pub mod events;

/// Durable task queue
pub mod queue;

/// Task lifecycle controller
pub mod controller;

// ============================================================================
// Infrastructure
// ============================================================================

/// EVM adapters
pub mod evm;

/// Logging
pub mod observability;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use avs::{Actionability, ActionabilityFilter, AvsContract, SubmissionReceipt};
pub use chain::{resolve_chain, SupportedChain, SANDBOX_CHAIN_ID};
pub use config::{ChainEndpoint, ChainRegistry, OperatorConfig, OperatorKey, RawConfig, WorkerConfig};
pub use controller::{TaskLedger, TaskLifecycleController, TaskOutcome, TaskProcessor};
pub use error::{
    ChainError, ConfigError, ContractError, EventSourceError, QueueError, SignatureError,
    SubmissionError,
};
pub use events::{Discovery, EventSource, EventSourceConfig, LiveSubscription};
pub use evm::{ChainClients, EvmAvsContract, EvmComplianceOracle};
pub use observability::{init_logging, LogFormat};
pub use oracle::{ChainOutcome, ComplianceOracle, ComplianceOracleAggregator, ComplianceReport};
pub use queue::{EnqueueOutcome, FailOutcome, Lease, QueueConfig, QueueStats, SqliteTaskQueue, TaskQueue};
pub use signature::{SignatureIssuer, SignedAttestation};
pub use types::{StartBlock, Task, TaskCreatedEvent, TaskDetails, TaskState};
