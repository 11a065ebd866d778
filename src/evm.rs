//! EVM adapters over alloy
//!
//! One HTTP provider per enabled chain, all signing with the operator key.
//! The AVS contract and the compliance oracles are thin bindings on top.

use crate::avs::{AvsContract, SubmissionReceipt};
use crate::config::{ChainRegistry, OperatorConfig, OperatorKey};
use crate::error::{ChainError, ConfigError, ContractError};
use crate::oracle::ComplianceOracle;
use crate::signature::SignedAttestation;
use crate::types::{TaskCreatedEvent, TaskDetails};
use alloy::network::{EthereumWallet, ReceiptResponse};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::Filter;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

sol! {
    #[sol(rpc)]
    interface IKycAvs {
        event TaskCreated(
            uint256 indexed taskId,
            address indexed userAddress,
            uint32 taskCreatedBlock,
            uint256 totalWeightAtCreation
        );

        function getTaskDetailsForOperatorListener(uint256 taskId, address operator)
            external
            view
            returns (bool isCompleted, bool isAnswered, address userAddress);

        function submitResponse(uint256 taskId, bool isKyc) external;
    }

    #[sol(rpc)]
    interface IKycAvsSigned {
        struct SignatureWithSaltAndExpiry {
            bytes signature;
            bytes32 salt;
            uint256 expiry;
        }

        function submitResponse(
            uint256 taskId,
            bool isKyc,
            SignatureWithSaltAndExpiry operatorSignature
        ) external;
    }

    #[sol(rpc)]
    interface IAccessPortal {
        /// First address is the subject, second the user
        function isAuthorized(address subject, address user) external view returns (bool);
    }
}

/// Longest wait for a submitted transaction to be mined
pub const RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

fn rpc_error(chain_id: u64, e: impl Display) -> ContractError {
    ContractError::Rpc {
        chain_id,
        message: e.to_string(),
    }
}

// ============================================================================
// Per-chain clients
// ============================================================================

/// Signing providers for every enabled chain
#[derive(Clone)]
pub struct ChainClients {
    providers: BTreeMap<u64, DynProvider>,
    operator: Address,
}

impl ChainClients {
    /// Build one provider per chain. No network traffic happens here.
    pub fn connect(chains: &ChainRegistry, key: &OperatorKey) -> Self {
        let providers = chains
            .iter()
            .map(|endpoint| {
                let wallet = EthereumWallet::from(key.signer().clone());
                let provider = ProviderBuilder::new()
                    .wallet(wallet)
                    .connect_http(endpoint.rpc_url.clone())
                    .erased();
                debug!(
                    "Created client for chain {} ({})",
                    endpoint.chain_id(),
                    endpoint.chain
                );
                (endpoint.chain_id(), provider)
            })
            .collect();

        Self {
            providers,
            operator: key.address(),
        }
    }

    pub fn get(&self, chain_id: u64) -> Result<&DynProvider, ChainError> {
        self.providers
            .get(&chain_id)
            .ok_or(ChainError::ClientNotDefined(chain_id))
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    /// AVS binding on the configured AVS chain
    pub fn avs_contract(&self, config: &OperatorConfig) -> Result<EvmAvsContract, ConfigError> {
        let provider = self.get(config.avs_chain_id)?.clone();
        Ok(EvmAvsContract {
            provider,
            chain_id: config.avs_chain_id,
            address: config.avs_address,
            submit_with_signature: config.submit_with_signature,
        })
    }

    /// One oracle binding per non-sandbox chain
    pub fn compliance_oracles(
        &self,
        chains: &ChainRegistry,
    ) -> Result<Vec<Arc<dyn ComplianceOracle>>, ConfigError> {
        chains
            .compliance_chains()
            .map(|endpoint| {
                let chain_id = endpoint.chain_id();
                let portal = endpoint
                    .oracle
                    .ok_or(ConfigError::MissingOracleDeployment(chain_id))?;
                let oracle: Arc<dyn ComplianceOracle> = Arc::new(EvmComplianceOracle {
                    provider: self.get(chain_id)?.clone(),
                    chain_id,
                    portal,
                    caller: self.operator,
                });
                Ok(oracle)
            })
            .collect()
    }
}

// ============================================================================
// AVS contract
// ============================================================================

pub struct EvmAvsContract {
    provider: DynProvider,
    chain_id: u64,
    address: Address,
    /// Use the 3-argument `submitResponse` carrying the attestation
    submit_with_signature: bool,
}

#[async_trait]
impl AvsContract for EvmAvsContract {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn address(&self) -> Address {
        self.address
    }

    async fn head_block(&self) -> Result<u64, ContractError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| rpc_error(self.chain_id, e))
    }

    async fn task_created_events(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<TaskCreatedEvent>, ContractError> {
        let filter = Filter::new()
            .address(self.address)
            .event_signature(IKycAvs::TaskCreated::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| rpc_error(self.chain_id, e))?;

        logs.iter()
            .map(|log| {
                let decoded = log.log_decode::<IKycAvs::TaskCreated>().map_err(|e| {
                    ContractError::Decode {
                        what: "TaskCreated log",
                        message: e.to_string(),
                    }
                })?;
                let event = &decoded.inner.data;
                Ok(TaskCreatedEvent {
                    task_id: event.taskId,
                    user_address: event.userAddress,
                    block_number: log.block_number.unwrap_or(from),
                })
            })
            .collect()
    }

    async fn task_details(
        &self,
        task_id: U256,
        operator: Address,
    ) -> Result<TaskDetails, ContractError> {
        let avs = IKycAvs::new(self.address, self.provider.clone());
        let details = avs
            .getTaskDetailsForOperatorListener(task_id, operator)
            .call()
            .await
            .map_err(|e| rpc_error(self.chain_id, e))?;

        Ok(TaskDetails {
            is_completed: details.isCompleted,
            is_answered: details.isAnswered,
            user_address: details.userAddress,
        })
    }

    async fn submit_response(
        &self,
        task_id: U256,
        verdict: bool,
        attestation: &SignedAttestation,
    ) -> Result<SubmissionReceipt, ContractError> {
        info!(
            "Submitting task answer for task {} with isKyc={} on chain {}",
            task_id, verdict, self.chain_id
        );

        let pending = if self.submit_with_signature {
            let avs = IKycAvsSigned::new(self.address, self.provider.clone());
            avs.submitResponse(task_id, verdict, signature_param(attestation))
                .send()
                .await
        } else {
            let avs = IKycAvs::new(self.address, self.provider.clone());
            avs.submitResponse(task_id, verdict).send().await
        }
        .map_err(|e| rpc_error(self.chain_id, e))?;

        let receipt = pending
            .with_timeout(Some(RECEIPT_TIMEOUT))
            .get_receipt()
            .await
            .map_err(|e| rpc_error(self.chain_id, e))?;

        if !receipt.status() {
            return Err(ContractError::Reverted {
                tx_hash: receipt.transaction_hash.to_string(),
            });
        }

        Ok(SubmissionReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
        })
    }
}

fn signature_param(attestation: &SignedAttestation) -> IKycAvsSigned::SignatureWithSaltAndExpiry {
    IKycAvsSigned::SignatureWithSaltAndExpiry {
        signature: Bytes::copy_from_slice(attestation.signature.as_slice()),
        salt: attestation.salt,
        expiry: U256::from(attestation.expiry),
    }
}

// ============================================================================
// Compliance oracle
// ============================================================================

pub struct EvmComplianceOracle {
    provider: DynProvider,
    chain_id: u64,
    portal: Address,
    /// `from` of the simulated call
    caller: Address,
}

#[async_trait]
impl ComplianceOracle for EvmComplianceOracle {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn is_authorized(&self, wallet: Address) -> Result<bool, ContractError> {
        let portal = IAccessPortal::new(self.portal, self.provider.clone());
        portal
            .isAuthorized(wallet, wallet)
            .from(self.caller)
            .call()
            .await
            .map_err(|e| rpc_error(self.chain_id, e))
    }
}
