//! Error types for the Gantry orchestrator

use thiserror::Error;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Ethereum RPC error: {0}")]
    EthRpc(String),

    #[error("Sidechain RPC error: {0}")]
    SidechainRpc(String),

    #[error("Nonce error for account {account}: {message}")]
    Nonce { account: String, message: String },

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("ABI encoding error: {0}")]
    AbiEncoding(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("insufficient voting power: {aggregated} of {total}")]
    InsufficientVotingPower { aggregated: u64, total: u64 },

    #[error("Price feed error: {0}")]
    PriceFeed(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Check if the error is worth retrying within the same loop iteration
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::EthRpc(_)
                | OrchestratorError::SidechainRpc(_)
                | OrchestratorError::Timeout { .. }
                | OrchestratorError::PriceFeed(_)
        )
    }

    /// Fatal errors abort the process after the supervisor exhausts retries
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Fatal(_) | OrchestratorError::Wallet(_)
        )
    }
}

/// Result type for orchestrator operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Ethereum node errors that indicate the filter crossed a reorg boundary.
/// Geth reports "unknown block", OpenEthereum reports a longer sentence about
/// blocks specified in the filter. Both are recoverable on the next iteration.
pub fn is_unknown_block_err(message: &str) -> bool {
    message.contains("unknown block")
        || message.contains("One of the blocks specified in filter")
}

/// Node-side rejection for a nonce below the account's pending nonce.
pub fn is_nonce_too_low_err(message: &str) -> bool {
    message.contains("nonce too low") || message.contains("nonce is too low")
}
