//! Attestation signing
//!
//! Every attestation carries a fresh 32-byte random salt and an expiry:
//! - task responses are valid for 1 hour
//! - registrations are valid for 1 day
//!
//! The message is the keccak256 hash of the concatenated fields, signed as
//! an EIP-191 personal message with the operator key. Nothing is cached, so
//! a retried submission always gets a new salt and expiry.

use crate::error::SignatureError;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy_primitives::{keccak256, Address, FixedBytes, Signature, B256, U256};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Validity window of a task response signature (1 hour)
pub const TASK_RESPONSE_VALIDITY_SECS: u64 = 3600;

/// Validity window of a registration signature (1 day)
pub const REGISTRATION_VALIDITY_SECS: u64 = 86_400;

/// A signed, salted, expiring payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAttestation {
    pub payload_hash: B256,
    /// r ‖ s ‖ v
    pub signature: FixedBytes<65>,
    pub salt: B256,
    /// Unix seconds
    pub expiry: u64,
    /// Unix seconds at signing time
    pub issued_at: u64,
}

impl SignedAttestation {
    /// Recover the address that produced this signature.
    pub fn recover_signer(&self) -> Result<Address, SignatureError> {
        let sig = Signature::try_from(self.signature.as_slice())
            .map_err(|e| SignatureError::Signing(e.to_string()))?;
        sig.recover_address_from_msg(self.payload_hash.as_slice())
            .map_err(|e| SignatureError::Signing(e.to_string()))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        unix_secs(now) >= self.expiry
    }
}

/// Signs registration and task-response payloads with the operator key.
///
/// Stateless after construction; share it behind an `Arc`.
pub struct SignatureIssuer {
    signer: PrivateKeySigner,
}

impl SignatureIssuer {
    pub fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    pub fn operator_address(&self) -> Address {
        self.signer.address()
    }

    /// Sign the answer to a task.
    pub fn sign_task_response(
        &self,
        task_id: U256,
        verdict: bool,
        operator: Address,
        contract: Address,
    ) -> Result<SignedAttestation, SignatureError> {
        self.sign_task_response_at(task_id, verdict, operator, contract, Utc::now())
    }

    pub fn sign_task_response_at(
        &self,
        task_id: U256,
        verdict: bool,
        operator: Address,
        contract: Address,
        now: DateTime<Utc>,
    ) -> Result<SignedAttestation, SignatureError> {
        let issued_at = unix_secs(now);
        let expiry = issued_at + TASK_RESPONSE_VALIDITY_SECS;
        let salt = fresh_salt();

        let message = format!(
            "{}{}{}{}{}{}",
            task_id,
            if verdict { "1" } else { "0" },
            lower_hex(operator.as_slice()),
            lower_hex(contract.as_slice()),
            lower_hex(salt.as_slice()),
            expiry
        );
        self.sign(message, salt, issued_at, expiry)
    }

    /// Sign an operator registration with the AVS.
    pub fn sign_registration(
        &self,
        operator: Address,
        avs: Address,
    ) -> Result<SignedAttestation, SignatureError> {
        self.sign_registration_at(operator, avs, Utc::now())
    }

    pub fn sign_registration_at(
        &self,
        operator: Address,
        avs: Address,
        now: DateTime<Utc>,
    ) -> Result<SignedAttestation, SignatureError> {
        let issued_at = unix_secs(now);
        let expiry = issued_at + REGISTRATION_VALIDITY_SECS;
        let salt = fresh_salt();

        let message = format!(
            "{}{}{}{}",
            lower_hex(operator.as_slice()),
            lower_hex(avs.as_slice()),
            lower_hex(salt.as_slice()),
            expiry
        );
        self.sign(message, salt, issued_at, expiry)
    }

    fn sign(
        &self,
        message: String,
        salt: B256,
        issued_at: u64,
        expiry: u64,
    ) -> Result<SignedAttestation, SignatureError> {
        let payload_hash = keccak256(message.as_bytes());
        let signature = self
            .signer
            .sign_message_sync(payload_hash.as_slice())
            .map_err(|e| SignatureError::Signing(e.to_string()))?;

        Ok(SignedAttestation {
            payload_hash,
            signature: FixedBytes::from(signature.as_bytes()),
            salt,
            expiry,
            issued_at,
        })
    }
}

fn fresh_salt() -> B256 {
    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    B256::from(salt)
}

fn lower_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn unix_secs(t: DateTime<Utc>) -> u64 {
    t.timestamp().max(0) as u64
}
