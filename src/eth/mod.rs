//! Ethereum side of the orchestrator
//!
//! Provider wrapper, nonce cache, pending-tx tracking, the signed
//! transaction committer and the bridge contract ABI surface.

pub mod committer;
pub mod contract;
pub mod events;
pub mod nonce;
pub mod pending;
pub mod provider;

pub use committer::EthCommitter;
pub use contract::BridgeContract;
pub use events::BridgeEvent;
pub use nonce::NonceCache;
pub use pending::PendingTxSet;
pub use provider::{EthProvider, EthereumRpc};
