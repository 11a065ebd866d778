//! Task-issuing (AVS) contract port and the actionability filter.

use crate::error::ContractError;
use crate::signature::SignedAttestation;
use crate::types::{Task, TaskCreatedEvent, TaskDetails};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Outcome of an accepted `submitResponse` transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
}

/// The contract whose tasks this operator answers.
///
/// Implementations must be safe to share between workers.
#[async_trait]
pub trait AvsContract: Send + Sync {
    fn chain_id(&self) -> u64;

    fn address(&self) -> Address;

    /// Current head block of the AVS chain
    async fn head_block(&self) -> Result<u64, ContractError>;

    /// `TaskCreated` events emitted in `[from, to]` (inclusive), in log order
    async fn task_created_events(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<TaskCreatedEvent>, ContractError>;

    /// `getTaskDetailsForOperatorListener(taskId, operator)`
    async fn task_details(
        &self,
        task_id: U256,
        operator: Address,
    ) -> Result<TaskDetails, ContractError>;

    /// Submit the verdict. A reverted transaction is an error.
    async fn submit_response(
        &self,
        task_id: U256,
        verdict: bool,
        attestation: &SignedAttestation,
    ) -> Result<SubmissionReceipt, ContractError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actionability {
    RequiresAction(Task),
    /// Completed or answered already, by this or another operator
    AlreadyHandled { is_completed: bool, is_answered: bool },
}

/// Dedup gate: re-reads live task state before a task enters the queue.
#[derive(Clone)]
pub struct ActionabilityFilter {
    avs: Arc<dyn AvsContract>,
    operator: Address,
}

impl ActionabilityFilter {
    pub fn new(avs: Arc<dyn AvsContract>, operator: Address) -> Self {
        Self { avs, operator }
    }

    pub async fn check(&self, task_id: U256) -> Result<Actionability, ContractError> {
        let details = self.avs.task_details(task_id, self.operator).await?;

        if details.requires_action() {
            Ok(Actionability::RequiresAction(Task::new(
                task_id,
                details.user_address,
            )))
        } else {
            debug!(
                %task_id,
                is_completed = details.is_completed,
                is_answered = details.is_answered,
                "Task does not require action"
            );
            Ok(Actionability::AlreadyHandled {
                is_completed: details.is_completed,
                is_answered: details.is_answered,
            })
        }
    }
}
