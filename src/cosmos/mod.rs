//! Sidechain side of the orchestrator
//!
//! Query and broadcast capabilities over the sidechain bridge module, plus
//! the denom cache and the LCD submitter used in production.

pub mod broadcast;
pub mod client;
pub mod denom;
pub mod msgs;
pub mod query;

pub use broadcast::{BroadcastClient, MsgSubmitter};
pub use client::LcdSubmitter;
pub use denom::Erc20DenomCache;
pub use msgs::SidechainMsg;
pub use query::{GrpcGatewayClient, SidechainQuery};
