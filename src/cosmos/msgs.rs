//! Sidechain bridge module messages
//!
//! Amino-JSON shapes: every message serializes as `{"type": ..., "value":
//! ...}` with uint64 fields rendered as strings, matching what the
//! sidechain's REST endpoint accepts.

use serde::{Deserialize, Serialize};

/// uint64 fields travel as JSON strings
pub mod string_num {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum SidechainMsg {
    #[serde(rename = "bridge/MsgSetOrchestratorAddresses")]
    SetOrchestratorAddresses(MsgSetOrchestratorAddresses),
    #[serde(rename = "bridge/MsgValsetConfirm")]
    ValsetConfirm(MsgValsetConfirm),
    #[serde(rename = "bridge/MsgConfirmBatch")]
    ConfirmBatch(MsgConfirmBatch),
    #[serde(rename = "bridge/MsgRequestBatch")]
    RequestBatch(MsgRequestBatch),
    #[serde(rename = "bridge/MsgDepositClaim")]
    DepositClaim(MsgDepositClaim),
    #[serde(rename = "bridge/MsgWithdrawClaim")]
    WithdrawClaim(MsgWithdrawClaim),
    #[serde(rename = "bridge/MsgValsetUpdatedClaim")]
    ValsetUpdatedClaim(MsgValsetUpdatedClaim),
    #[serde(rename = "bridge/MsgERC20DeployedClaim")]
    Erc20DeployedClaim(MsgErc20DeployedClaim),
    #[serde(rename = "bridge/MsgSendToEth")]
    SendToEth(MsgSendToEth),
}

impl SidechainMsg {
    /// Short name for logging and metrics
    pub fn name(&self) -> &'static str {
        match self {
            SidechainMsg::SetOrchestratorAddresses(_) => "set_orchestrator_addresses",
            SidechainMsg::ValsetConfirm(_) => "valset_confirm",
            SidechainMsg::ConfirmBatch(_) => "confirm_batch",
            SidechainMsg::RequestBatch(_) => "request_batch",
            SidechainMsg::DepositClaim(_) => "deposit_claim",
            SidechainMsg::WithdrawClaim(_) => "withdraw_claim",
            SidechainMsg::ValsetUpdatedClaim(_) => "valset_updated_claim",
            SidechainMsg::Erc20DeployedClaim(_) => "erc20_deployed_claim",
            SidechainMsg::SendToEth(_) => "send_to_eth",
        }
    }

    /// Event nonce for claim messages, None for everything else
    pub fn claim_event_nonce(&self) -> Option<u64> {
        match self {
            SidechainMsg::DepositClaim(m) => Some(m.event_nonce),
            SidechainMsg::WithdrawClaim(m) => Some(m.event_nonce),
            SidechainMsg::ValsetUpdatedClaim(m) => Some(m.event_nonce),
            SidechainMsg::Erc20DeployedClaim(m) => Some(m.event_nonce),
            _ => None,
        }
    }
}

/// Binds the validator's sidechain identity to its Ethereum signing address.
/// The signature is an Ethereum personal-sign over the keccak of the
/// validator address bytes.
#[derive(Debug, Clone, Serialize)]
pub struct MsgSetOrchestratorAddresses {
    pub validator: String,
    pub orchestrator: String,
    pub eth_address: String,
    pub eth_signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MsgValsetConfirm {
    #[serde(with = "string_num")]
    pub nonce: u64,
    pub orchestrator: String,
    pub eth_address: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MsgConfirmBatch {
    #[serde(with = "string_num")]
    pub nonce: u64,
    pub token_contract: String,
    pub orchestrator: String,
    pub eth_signer: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MsgRequestBatch {
    pub orchestrator: String,
    pub denom: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MsgDepositClaim {
    #[serde(with = "string_num")]
    pub event_nonce: u64,
    #[serde(with = "string_num")]
    pub block_height: u64,
    pub token_contract: String,
    pub amount: String,
    pub ethereum_sender: String,
    pub cosmos_receiver: String,
    pub orchestrator: String,
    pub token_name: String,
    pub token_symbol: String,
    #[serde(with = "string_num")]
    pub token_decimals: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MsgWithdrawClaim {
    #[serde(with = "string_num")]
    pub event_nonce: u64,
    #[serde(with = "string_num")]
    pub block_height: u64,
    #[serde(with = "string_num")]
    pub batch_nonce: u64,
    pub token_contract: String,
    pub orchestrator: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValsetMemberJson {
    #[serde(with = "string_num")]
    pub power: u64,
    pub eth_address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MsgValsetUpdatedClaim {
    #[serde(with = "string_num")]
    pub event_nonce: u64,
    #[serde(with = "string_num")]
    pub block_height: u64,
    #[serde(with = "string_num")]
    pub valset_nonce: u64,
    pub members: Vec<ValsetMemberJson>,
    pub reward_amount: String,
    pub reward_token: String,
    pub orchestrator: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MsgErc20DeployedClaim {
    #[serde(with = "string_num")]
    pub event_nonce: u64,
    #[serde(with = "string_num")]
    pub block_height: u64,
    pub cosmos_denom: String,
    pub token_contract: String,
    pub name: String,
    pub symbol: String,
    #[serde(with = "string_num")]
    pub decimals: u64,
    pub orchestrator: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MsgSendToEth {
    pub sender: String,
    pub eth_dest: String,
    pub amount: Coin,
    pub bridge_fee: Coin,
}
