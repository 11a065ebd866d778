//! Catalogue of chains the operator knows how to talk to.

use crate::error::ChainError;
use alloy_primitives::{address, Address};
use std::fmt;

/// Chain id of the local development chain. Its oracle answers are never trusted.
pub const SANDBOX_CHAIN_ID: u64 = 31337;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupportedChain {
    Mainnet,
    Arbitrum,
    Base,
    Hardhat,
}

impl SupportedChain {
    pub const ALL: [SupportedChain; 4] = [
        SupportedChain::Mainnet,
        SupportedChain::Arbitrum,
        SupportedChain::Base,
        SupportedChain::Hardhat,
    ];

    pub fn id(&self) -> u64 {
        match self {
            SupportedChain::Mainnet => 1,
            SupportedChain::Arbitrum => 42161,
            SupportedChain::Base => 8453,
            SupportedChain::Hardhat => SANDBOX_CHAIN_ID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SupportedChain::Mainnet => "Ethereum",
            SupportedChain::Arbitrum => "Arbitrum One",
            SupportedChain::Base => "Base",
            SupportedChain::Hardhat => "Hardhat",
        }
    }

    /// Compliance oracle (access portal) deployment on this chain
    pub fn oracle_deployment(&self) -> Option<Address> {
        match self {
            SupportedChain::Mainnet => Some(address!("82A5439B451D545E747314C17509B693e14B6b4F")),
            SupportedChain::Base => Some(address!("Fa368E046B4051582662f7d1C033756dB55058cF")),
            SupportedChain::Arbitrum => Some(address!("7e230aa15db2C0B6E293abBa3e0d278f4B612fC4")),
            SupportedChain::Hardhat => None,
        }
    }

    /// Test/sandbox chains are excluded from compliance evaluation
    pub fn is_sandbox(&self) -> bool {
        self.id() == SANDBOX_CHAIN_ID
    }
}

impl fmt::Display for SupportedChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id())
    }
}

/// Resolve a numeric chain id. Unknown ids are a configuration/code mismatch.
pub fn resolve_chain(chain_id: u64) -> Result<SupportedChain, ChainError> {
    SupportedChain::ALL
        .into_iter()
        .find(|c| c.id() == chain_id)
        .ok_or(ChainError::Unsupported(chain_id))
}
