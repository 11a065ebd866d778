//! In-memory chain fakes shared by the integration tests

#![allow(dead_code)]

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use kyc_operator::{
    AvsContract, ComplianceOracle, ContractError, SignedAttestation, SubmissionReceipt,
    TaskCreatedEvent, TaskDetails,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const AVS_CHAIN_ID: u64 = 8453;

pub fn wallet(id: u64) -> Address {
    Address::repeat_byte(id as u8)
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub task_id: U256,
    pub verdict: bool,
    pub attestation: SignedAttestation,
}

/// AVS contract backed by in-memory state
pub struct FakeAvs {
    address: Address,
    head: Mutex<u64>,
    events: Mutex<Vec<TaskCreatedEvent>>,
    details: Mutex<HashMap<U256, TaskDetails>>,
    reverting: Mutex<HashSet<U256>>,
    hanging: Mutex<HashSet<U256>>,
    submit_attempts: Mutex<Vec<U256>>,
    submissions: Mutex<Vec<Submission>>,
}

impl FakeAvs {
    pub fn new(head: u64) -> Arc<Self> {
        Arc::new(Self {
            address: Address::repeat_byte(0xa5),
            head: Mutex::new(head),
            events: Mutex::new(Vec::new()),
            details: Mutex::new(HashMap::new()),
            reverting: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            submit_attempts: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
        })
    }

    /// Emit `TaskCreated` at `block` for an open task on `wallet(task_id)`.
    pub fn create_task(&self, task_id: u64, block: u64) {
        let id = U256::from(task_id);
        self.events.lock().push(TaskCreatedEvent {
            task_id: id,
            user_address: wallet(task_id),
            block_number: block,
        });
        self.details.lock().insert(
            id,
            TaskDetails {
                is_completed: false,
                is_answered: false,
                user_address: wallet(task_id),
            },
        );
    }

    pub fn complete_task(&self, task_id: u64) {
        if let Some(d) = self.details.lock().get_mut(&U256::from(task_id)) {
            d.is_completed = true;
        }
    }

    pub fn answer_task(&self, task_id: u64) {
        if let Some(d) = self.details.lock().get_mut(&U256::from(task_id)) {
            d.is_answered = true;
        }
    }

    pub fn revert_submissions_for(&self, task_id: u64) {
        self.reverting.lock().insert(U256::from(task_id));
    }

    /// Submissions for `task_id` never get a receipt.
    pub fn hang_submissions_for(&self, task_id: u64) {
        self.hanging.lock().insert(U256::from(task_id));
    }

    /// Make the task lookup for `task_id` fail while its event stays visible.
    pub fn break_details_of(&self, task_id: u64) {
        self.details.lock().remove(&U256::from(task_id));
    }

    pub fn set_head(&self, head: u64) {
        *self.head.lock() = head;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    /// Every `submitResponse` call, reverted or not
    pub fn submit_attempts(&self, task_id: u64) -> usize {
        let id = U256::from(task_id);
        self.submit_attempts.lock().iter().filter(|t| **t == id).count()
    }

    pub fn submitted_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .submissions
            .lock()
            .iter()
            .map(|s| s.task_id.to::<u64>())
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl AvsContract for FakeAvs {
    fn chain_id(&self) -> u64 {
        AVS_CHAIN_ID
    }

    fn address(&self) -> Address {
        self.address
    }

    async fn head_block(&self) -> Result<u64, ContractError> {
        Ok(*self.head.lock())
    }

    async fn task_created_events(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<TaskCreatedEvent>, ContractError> {
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|e| e.block_number >= from && e.block_number <= to)
            .copied()
            .collect())
    }

    async fn task_details(
        &self,
        task_id: U256,
        _operator: Address,
    ) -> Result<TaskDetails, ContractError> {
        self.details
            .lock()
            .get(&task_id)
            .copied()
            .ok_or_else(|| ContractError::Rpc {
                chain_id: AVS_CHAIN_ID,
                message: format!("task {} not found", task_id),
            })
    }

    async fn submit_response(
        &self,
        task_id: U256,
        verdict: bool,
        attestation: &SignedAttestation,
    ) -> Result<SubmissionReceipt, ContractError> {
        self.submit_attempts.lock().push(task_id);
        let hangs = self.hanging.lock().contains(&task_id);
        if hangs {
            std::future::pending::<()>().await;
        }
        if self.reverting.lock().contains(&task_id) {
            return Err(ContractError::Reverted {
                tx_hash: B256::repeat_byte(0xee).to_string(),
            });
        }

        self.submissions.lock().push(Submission {
            task_id,
            verdict,
            attestation: attestation.clone(),
        });
        if let Some(d) = self.details.lock().get_mut(&task_id) {
            d.is_answered = true;
        }

        Ok(SubmissionReceipt {
            tx_hash: B256::from(task_id.to_be_bytes::<32>()),
            block_number: Some(*self.head.lock()),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OracleAnswer {
    Compliant,
    NotCompliant,
    Fails,
    Hangs,
}

/// Compliance oracle giving the same answer for every wallet
pub struct FakeOracle {
    chain_id: u64,
    answer: OracleAnswer,
    calls: AtomicUsize,
}

impl FakeOracle {
    pub fn new(chain_id: u64, answer: OracleAnswer) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            answer,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComplianceOracle for FakeOracle {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn is_authorized(&self, _wallet: Address) -> Result<bool, ContractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.answer {
            OracleAnswer::Compliant => Ok(true),
            OracleAnswer::NotCompliant => Ok(false),
            OracleAnswer::Fails => Err(ContractError::Rpc {
                chain_id: self.chain_id,
                message: "execution reverted".to_string(),
            }),
            OracleAnswer::Hangs => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(true)
            }
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
