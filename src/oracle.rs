//! Compliance oracle aggregation
//!
//! A wallet is compliant if ANY configured (non-sandbox) chain's oracle
//! says so. Oracles are queried concurrently; a failing or slow oracle
//! counts as "not compliant" for its chain and never fails the verdict.

use crate::chain::SANDBOX_CHAIN_ID;
use crate::error::{ConfigError, ContractError};
use alloy_primitives::Address;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Read-only compliance oracle deployed on one chain.
#[async_trait]
pub trait ComplianceOracle: Send + Sync {
    fn chain_id(&self) -> u64;

    /// `isAuthorized(subject, user)` with the wallet as both arguments
    async fn is_authorized(&self, wallet: Address) -> Result<bool, ContractError>;
}

/// What a single chain answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Compliant,
    NotCompliant,
    /// Query failed or timed out; counted as not compliant
    Failed(String),
}

impl ChainOutcome {
    pub fn is_compliant(&self) -> bool {
        matches!(self, ChainOutcome::Compliant)
    }
}

/// Verdict with the per-chain breakdown that produced it
#[derive(Debug, Clone)]
pub struct ComplianceReport {
    pub wallet: Address,
    pub chains: Vec<(u64, ChainOutcome)>,
}

impl ComplianceReport {
    pub fn is_compliant(&self) -> bool {
        self.chains.iter().any(|(_, o)| o.is_compliant())
    }

    pub fn failed_chains(&self) -> Vec<u64> {
        self.chains
            .iter()
            .filter(|(_, o)| matches!(o, ChainOutcome::Failed(_)))
            .map(|(id, _)| *id)
            .collect()
    }
}

pub struct ComplianceOracleAggregator {
    oracles: Vec<Arc<dyn ComplianceOracle>>,
    timeout: Duration,
}

impl ComplianceOracleAggregator {
    /// Build from the configured oracles. Sandbox chains are dropped.
    ///
    /// An empty set is a configuration error, not a "non-compliant" answer.
    pub fn new(
        oracles: Vec<Arc<dyn ComplianceOracle>>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if oracles.is_empty() {
            return Err(ConfigError::EmptyChainSet);
        }

        let oracles: Vec<_> = oracles
            .into_iter()
            .filter(|o| o.chain_id() != SANDBOX_CHAIN_ID)
            .collect();
        if oracles.is_empty() {
            return Err(ConfigError::NoComplianceChains);
        }

        Ok(Self { oracles, timeout })
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.oracles.iter().map(|o| o.chain_id()).collect()
    }

    /// Is `wallet` compliant on at least one chain. Never fails.
    pub async fn evaluate(&self, wallet: Address) -> bool {
        self.evaluate_detailed(wallet).await.is_compliant()
    }

    pub async fn evaluate_detailed(&self, wallet: Address) -> ComplianceReport {
        let queries = self.oracles.iter().map(|oracle| {
            let oracle = Arc::clone(oracle);
            async move {
                let chain_id = oracle.chain_id();
                let outcome = self.query_chain(oracle.as_ref(), wallet).await;
                (chain_id, outcome)
            }
        });

        let chains = join_all(queries).await;
        ComplianceReport { wallet, chains }
    }

    async fn query_chain(&self, oracle: &dyn ComplianceOracle, wallet: Address) -> ChainOutcome {
        let chain_id = oracle.chain_id();
        let result = match tokio::time::timeout(self.timeout, oracle.is_authorized(wallet)).await {
            Ok(r) => r,
            Err(_) => Err(ContractError::Timeout(self.timeout.as_millis() as u64)),
        };

        match result {
            Ok(authorized) => {
                info!(
                    chain_id,
                    %wallet,
                    "Chain {} responded with: {} for wallet {}", chain_id, authorized, wallet
                );
                if authorized {
                    ChainOutcome::Compliant
                } else {
                    ChainOutcome::NotCompliant
                }
            }
            Err(e @ ContractError::Timeout(_)) => {
                warn!(chain_id, %wallet, "Compliance check timed out: {}", e);
                ChainOutcome::Failed(e.to_string())
            }
            Err(e) => {
                error!(
                    chain_id,
                    %wallet,
                    "Error checking compliance for chain {} and wallet {}: {}", chain_id, wallet, e
                );
                ChainOutcome::Failed(e.to_string())
            }
        }
    }
}
