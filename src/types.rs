//! Domain types shared between the bridge contract and the sidechain module.
//!
//! Validator sets and outgoing batches are owned by the sidechain; the
//! orchestrator only ever holds read-only snapshots of them. Confirms are
//! created locally and queued to the sidechain.

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// Total voting power of the bridge, normalized to u32::MAX every time a
/// validator set is created on the sidechain. Kept in an i64-compatible u64
/// so aggregation cannot overflow.
pub const TOTAL_BRIDGE_POWER: u64 = u32::MAX as u64;

/// 66.67% of [`TOTAL_BRIDGE_POWER`]. An update with less aggregate signed
/// power than this will be rejected by the bridge contract.
pub const POWER_THRESHOLD: u64 = 2_863_311_530;

/// A single validator snapshot inside a [`Valset`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValsetMember {
    pub eth_address: Address,
    pub power: u64,
}

/// An ordered set of (Ethereum address, voting power) at a specific nonce.
/// Immutable once confirmed; the nonce strictly increases across sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Valset {
    pub nonce: u64,
    pub members: Vec<ValsetMember>,
    pub reward_amount: U256,
    pub reward_token: Address,
}

impl Valset {
    /// Aggregate power as a percentage of the normalized total, for logging.
    pub fn power_percent(power: u64) -> f32 {
        (power as f64 * 100.0 / TOTAL_BRIDGE_POWER as f64) as f32
    }
}

/// One outbound transfer inside an [`OutgoingBatch`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTransfer {
    pub destination: Address,
    pub amount: U256,
    pub fee: U256,
}

/// A batch of outbound transfers for a single ERC20, cut by the sidechain.
/// Transfers are sorted fee-descending; the batch nonce is unique per token
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    pub nonce: u64,
    pub token_contract: Address,
    pub transfers: Vec<BatchTransfer>,
    pub batch_timeout: u64,
}

impl OutgoingBatch {
    /// Sum of the per-transfer fees, denominated in the batch token.
    pub fn total_fee(&self) -> U256 {
        self.transfers
            .iter()
            .fold(U256::zero(), |acc, t| acc + t.fee)
    }
}

/// A validator's signature over a valset checkpoint digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValsetConfirm {
    pub validator: String,
    pub eth_signer: Address,
    pub nonce: u64,
    /// 65-byte r || s || v signature, hex-encoded
    pub signature: String,
}

/// A validator's signature over a batch checkpoint digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfirm {
    pub validator: String,
    pub eth_signer: Address,
    pub nonce: u64,
    pub token_contract: Address,
    pub signature: String,
}

/// A queued send-to-Ethereum transfer that has not been batched yet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSendToEth {
    pub sender: String,
    pub destination: Address,
    pub token_contract: Address,
    pub amount: U256,
    pub fee: U256,
}

/// ERC20 metadata attached to deposit claims
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Erc20Metadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// The highest event nonce this validator has attested to, and the Ethereum
/// height it was observed at. Maintained by the sidechain.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LastObservedEvent {
    pub event_nonce: u64,
    pub ethereum_height: u64,
}
