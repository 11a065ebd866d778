//! Operator Configuration
//!
//! Settings arrive as loosely typed strings (environment / CLI) in a
//! [`RawConfig`] and are validated eagerly into an [`OperatorConfig`]:
//! - chain ids are resolved against the known chain catalogue
//! - every enabled chain must map to an RPC endpoint
//! - every enabled non-sandbox chain must have an oracle deployment
//!
//! All problems are reported together, and any problem keeps the operator
//! from starting.

use crate::chain::{resolve_chain, SupportedChain};
use crate::error::{ChainError, ConfigError};
use crate::events::EventSourceConfig;
use crate::queue::QueueConfig;
use crate::types::StartBlock;
use alloy::signers::local::PrivateKeySigner;
use alloy_primitives::Address;
use reqwest::Url;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default per-chain oracle call timeout
pub const DEFAULT_ORACLE_TIMEOUT_MS: u64 = 10_000;

/// Default number of queue workers
pub const DEFAULT_WORKERS: usize = 4;

/// Default shutdown grace period for busy workers
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Operator private key. Held in memory only; never printed.
#[derive(Clone)]
pub struct OperatorKey(PrivateKeySigner);

impl OperatorKey {
    pub fn signer(&self) -> &PrivateKeySigner {
        &self.0
    }

    pub fn address(&self) -> Address {
        self.0.address()
    }
}

impl FromStr for OperatorKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PrivateKeySigner::from_str(s.trim())
            .map(OperatorKey)
            .map_err(|e| ConfigError::Invalid {
                name: "OPERATOR_PRIVATE_KEY",
                reason: e.to_string(),
            })
    }
}

impl fmt::Debug for OperatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OperatorKey(<redacted>)")
    }
}

/// RPC endpoint and oracle deployment for one enabled chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEndpoint {
    pub chain: SupportedChain,
    pub rpc_url: Url,
    pub oracle: Option<Address>,
}

impl ChainEndpoint {
    pub fn chain_id(&self) -> u64 {
        self.chain.id()
    }
}

/// Enabled chains keyed by chain id. Static for the process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainRegistry {
    endpoints: BTreeMap<u64, ChainEndpoint>,
}

impl ChainRegistry {
    pub fn new(endpoints: impl IntoIterator<Item = ChainEndpoint>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.chain_id(), e))
                .collect(),
        }
    }

    pub fn get(&self, chain_id: u64) -> Result<&ChainEndpoint, ChainError> {
        self.endpoints
            .get(&chain_id)
            .ok_or(ChainError::ClientNotDefined(chain_id))
    }

    pub fn is_enabled(&self, chain_id: u64) -> bool {
        self.endpoints.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.endpoints.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainEndpoint> {
        self.endpoints.values()
    }

    /// Chains whose oracle answers count towards a verdict
    pub fn compliance_chains(&self) -> impl Iterator<Item = &ChainEndpoint> {
        self.endpoints.values().filter(|e| !e.chain.is_sandbox())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub workers: usize,
    /// How long an idle worker waits before polling the queue again
    pub idle_poll: Duration,
    /// Time busy workers get to finish on shutdown before they are aborted
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            idle_poll: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

/// Validated operator configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub operator_key: OperatorKey,
    pub operator_address: Address,
    pub avs_address: Address,
    pub avs_chain_id: u64,
    pub chains: ChainRegistry,
    pub events: EventSourceConfig,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub oracle_timeout: Duration,
    /// Pass the attestation to `submitResponse` (three-argument form)
    pub submit_with_signature: bool,
}

impl OperatorConfig {
    pub fn avs_endpoint(&self) -> Result<&ChainEndpoint, ChainError> {
        self.chains.get(self.avs_chain_id)
    }
}

/// Unvalidated settings as read from the environment / command line
#[derive(Clone)]
pub struct RawConfig {
    pub operator_private_key: Option<String>,
    pub avs_contract_address: Option<String>,
    pub avs_contract_chain_id: Option<String>,
    /// Comma separated chain ids
    pub chain_ids: Option<String>,
    /// `chain_id=url` entries
    pub chain_rpcs: Vec<String>,
    /// Per-chain `CHAIN_RPC_<id>` values, used when `chain_rpcs` has no entry
    pub legacy_chain_rpcs: BTreeMap<u64, String>,
    pub events_from_block: Option<String>,
    pub events: EventSourceConfig,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub oracle_timeout_ms: u64,
    pub submit_with_signature: bool,
}

impl fmt::Debug for RawConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConfig")
            .field(
                "operator_private_key",
                &self.operator_private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("avs_contract_address", &self.avs_contract_address)
            .field("avs_contract_chain_id", &self.avs_contract_chain_id)
            .field("chain_ids", &self.chain_ids)
            .field("chain_rpcs", &self.chain_rpcs)
            .field("legacy_chain_rpcs", &self.legacy_chain_rpcs)
            .field("events_from_block", &self.events_from_block)
            .field("events", &self.events)
            .field("queue", &self.queue)
            .field("workers", &self.workers)
            .field("oracle_timeout_ms", &self.oracle_timeout_ms)
            .field("submit_with_signature", &self.submit_with_signature)
            .finish()
    }
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            operator_private_key: None,
            avs_contract_address: None,
            avs_contract_chain_id: None,
            chain_ids: None,
            chain_rpcs: Vec::new(),
            legacy_chain_rpcs: BTreeMap::new(),
            events_from_block: None,
            events: EventSourceConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkerConfig::default(),
            oracle_timeout_ms: DEFAULT_ORACLE_TIMEOUT_MS,
            submit_with_signature: false,
        }
    }
}

impl RawConfig {
    /// Collect `CHAIN_RPC_<id>` values for the listed chain ids through `lookup`.
    pub fn with_legacy_rpcs<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for id in parse_chain_ids(self.chain_ids.as_deref().unwrap_or_default()).unwrap_or_default() {
            if let Some(url) = lookup(&format!("CHAIN_RPC_{}", id)) {
                self.legacy_chain_rpcs.insert(id, url);
            }
        }
        self
    }

    /// Validate every setting, returning all problems found.
    pub fn validate(self) -> Result<OperatorConfig, Vec<ConfigError>> {
        let mut errors = Vec::new();

        let signer = match non_blank(&self.operator_private_key) {
            None => {
                errors.push(ConfigError::Missing("OPERATOR_PRIVATE_KEY"));
                None
            }
            Some(pk) => match pk.parse::<OperatorKey>() {
                Ok(key) => {
                    let address = key.address();
                    Some((key, address))
                }
                Err(e) => {
                    errors.push(e);
                    None
                }
            },
        };

        let avs_address = match non_blank(&self.avs_contract_address) {
            None => {
                errors.push(ConfigError::Missing("AVS_CONTRACT_ADDRESS"));
                None
            }
            Some(s) => match Address::from_str(s) {
                Ok(a) => Some(a),
                Err(e) => {
                    errors.push(ConfigError::Invalid {
                        name: "AVS_CONTRACT_ADDRESS",
                        reason: e.to_string(),
                    });
                    None
                }
            },
        };

        let avs_chain_id = match non_blank(&self.avs_contract_chain_id) {
            None => {
                errors.push(ConfigError::Missing("AVS_CONTRACT_CHAIN_ID"));
                None
            }
            Some(s) => match s.parse::<u64>() {
                Ok(id) => Some(id),
                Err(e) => {
                    errors.push(ConfigError::Invalid {
                        name: "AVS_CONTRACT_CHAIN_ID",
                        reason: e.to_string(),
                    });
                    None
                }
            },
        };

        let chain_ids = match non_blank(&self.chain_ids) {
            None => {
                errors.push(ConfigError::Missing("CHAIN_IDS"));
                Vec::new()
            }
            Some(s) => match parse_chain_ids(s) {
                Ok(ids) if ids.is_empty() => {
                    errors.push(ConfigError::EmptyChainSet);
                    ids
                }
                Ok(ids) => ids,
                Err(reason) => {
                    errors.push(ConfigError::Invalid {
                        name: "CHAIN_IDS",
                        reason,
                    });
                    Vec::new()
                }
            },
        };

        if let Some(avs_chain) = avs_chain_id {
            if !chain_ids.is_empty() && !chain_ids.contains(&avs_chain) {
                errors.push(ConfigError::AvsChainNotEnabled {
                    avs_chain,
                    enabled: join_ids(&chain_ids),
                });
            }
        }

        let explicit_rpcs = match parse_rpc_entries(&self.chain_rpcs) {
            Ok(map) => map,
            Err(reason) => {
                errors.push(ConfigError::Invalid {
                    name: "CHAIN_RPCS",
                    reason,
                });
                BTreeMap::new()
            }
        };

        let mut endpoints = Vec::with_capacity(chain_ids.len());
        for &id in &chain_ids {
            let chain = match resolve_chain(id) {
                Ok(c) => c,
                Err(e) => {
                    errors.push(e.into());
                    continue;
                }
            };

            let rpc = explicit_rpcs
                .get(&id)
                .or_else(|| self.legacy_chain_rpcs.get(&id))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty());
            let rpc_url = match rpc {
                None => {
                    errors.push(ConfigError::MissingRpc(id));
                    continue;
                }
                Some(raw) => match Url::parse(raw) {
                    Ok(u) => u,
                    Err(e) => {
                        errors.push(ConfigError::Invalid {
                            name: "CHAIN_RPCS",
                            reason: format!("chain {}: {}", id, e),
                        });
                        continue;
                    }
                },
            };

            let oracle = chain.oracle_deployment();
            if oracle.is_none() && !chain.is_sandbox() {
                errors.push(ConfigError::MissingOracleDeployment(id));
                continue;
            }

            endpoints.push(ChainEndpoint {
                chain,
                rpc_url,
                oracle,
            });
        }

        let chains = ChainRegistry::new(endpoints);
        if !chain_ids.is_empty()
            && chain_ids
                .iter()
                .filter_map(|id| resolve_chain(*id).ok())
                .all(|c| c.is_sandbox())
        {
            errors.push(ConfigError::NoComplianceChains);
        }

        let events_from = match self.events_from_block.as_deref().map(str::trim) {
            None | Some("") => StartBlock::Latest,
            Some(s) => match s.parse::<StartBlock>() {
                Ok(b) => b,
                Err(reason) => {
                    errors.push(ConfigError::Invalid {
                        name: "EVENTS_FROM_BLOCK_NUMBER",
                        reason,
                    });
                    StartBlock::Latest
                }
            },
        };

        if self.workers.workers == 0 {
            errors.push(ConfigError::Invalid {
                name: "WORKERS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.events.max_block_range == 0 {
            errors.push(ConfigError::Invalid {
                name: "LOG_BLOCK_RANGE",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.oracle_timeout_ms == 0 {
            errors.push(ConfigError::Invalid {
                name: "ORACLE_TIMEOUT_MS",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.queue.max_attempts == 0 {
            errors.push(ConfigError::Invalid {
                name: "QUEUE_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        // Every branch that leaves these unset has pushed an error.
        let (Some((operator_key, operator_address)), Some(avs_address), Some(avs_chain_id)) =
            (signer, avs_address, avs_chain_id)
        else {
            return Err(vec![ConfigError::Missing("OPERATOR_PRIVATE_KEY")]);
        };

        Ok(OperatorConfig {
            operator_key,
            operator_address,
            avs_address,
            avs_chain_id,
            chains,
            events: EventSourceConfig {
                from_block: events_from,
                ..self.events
            },
            queue: self.queue,
            workers: self.workers,
            oracle_timeout: Duration::from_millis(self.oracle_timeout_ms),
            submit_with_signature: self.submit_with_signature,
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse `"1, 8453,42161"`. Empty segments are ignored; duplicates collapse.
pub fn parse_chain_ids(s: &str) -> Result<Vec<u64>, String> {
    let mut ids = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id = part
            .parse::<u64>()
            .map_err(|_| format!("'{}' is not a chain id", part))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Parse `chain_id=url` entries.
pub fn parse_rpc_entries(entries: &[String]) -> Result<BTreeMap<u64, String>, String> {
    let mut map = BTreeMap::new();
    for entry in entries.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        let (id, url) = entry
            .split_once('=')
            .ok_or_else(|| format!("'{}' is not of the form <chain_id>=<url>", entry))?;
        let id = id
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("'{}' is not a chain id", id.trim()))?;
        map.insert(id, url.trim().to_string());
    }
    Ok(map)
}
