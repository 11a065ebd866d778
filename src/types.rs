//! Core domain types shared across the pipeline.

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A compliance verification request. Identity is `task_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub task_id: U256,
    /// Wallet whose compliance is being attested
    pub subject_wallet: Address,
}

impl Task {
    pub fn new(task_id: U256, subject_wallet: Address) -> Self {
        Self {
            task_id,
            subject_wallet,
        }
    }
}

/// Decoded `TaskCreated` log. Only the fields the operator consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCreatedEvent {
    pub task_id: U256,
    pub user_address: Address,
    pub block_number: u64,
}

/// On-chain view of a task as seen by this operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDetails {
    pub is_completed: bool,
    pub is_answered: bool,
    pub user_address: Address,
}

impl TaskDetails {
    /// A task needs an answer only while it is neither completed nor answered.
    pub fn requires_action(&self) -> bool {
        !self.is_completed && !self.is_answered
    }
}

/// Where the historical backfill starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartBlock {
    /// Only the head block observed at startup
    #[default]
    Latest,
    Number(u64),
}

impl FromStr for StartBlock {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("latest") {
            return Ok(StartBlock::Latest);
        }
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err("must be a string of digits or 'latest'".to_string());
        }
        s.parse::<u64>()
            .map(StartBlock::Number)
            .map_err(|e| e.to_string())
    }
}

impl fmt::Display for StartBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartBlock::Latest => write!(f, "latest"),
            StartBlock::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Lifecycle of a task inside this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Discovered,
    /// Passed the actionability check
    Filtered,
    Queued,
    Verifying,
    Submitting,
    Resolved,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Resolved | TaskState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Discovered, Filtered)
                | (Filtered, Queued)
                | (Queued, Verifying)
                // re-checked after dequeue and found already handled
                | (Queued, Resolved)
                | (Verifying, Submitting)
                | (Submitting, Resolved)
                | (Submitting, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Discovered => "discovered",
            TaskState::Filtered => "filtered",
            TaskState::Queued => "queued",
            TaskState::Verifying => "in_flight(verifying)",
            TaskState::Submitting => "in_flight(signing+submitting)",
            TaskState::Resolved => "resolved",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}
