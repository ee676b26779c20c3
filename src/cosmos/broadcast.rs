//! Sidechain broadcast client
//!
//! Turns local observations and signatures into queued sidechain messages.
//! Actual transaction assembly and delivery is behind [`MsgSubmitter`];
//! everything bridge-specific (checkpoint signing, claim ordering) lives
//! here.

use super::msgs::*;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::eth::contract::{batch_checkpoint_hash, sign_checkpoint, valset_checkpoint_hash};
use crate::eth::events::BridgeEvent;
use crate::types::{Erc20Metadata, OutgoingBatch, Valset};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::utils::{hash_message, keccak256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Delivery seam to the sidechain node. One call is one sidechain
/// transaction; message order inside the call is preserved.
#[async_trait]
pub trait MsgSubmitter: Send + Sync {
    async fn submit_msgs(&self, msgs: Vec<SidechainMsg>) -> OrchestratorResult<()>;
}

pub struct BroadcastClient {
    submitter: Arc<dyn MsgSubmitter>,
    eth_wallet: LocalWallet,
    /// Bech32 address of this validator's orchestrator key
    orchestrator: String,
    /// Bech32 valoper address of the validator itself
    validator: String,
}

impl BroadcastClient {
    pub fn new(
        submitter: Arc<dyn MsgSubmitter>,
        eth_wallet: LocalWallet,
        orchestrator: String,
        validator: String,
    ) -> Self {
        Self {
            submitter,
            eth_wallet,
            orchestrator,
            validator,
        }
    }

    pub fn orchestrator_address(&self) -> &str {
        &self.orchestrator
    }

    pub fn eth_address(&self) -> Address {
        self.eth_wallet.address()
    }

    /// Register this validator's Ethereum and orchestrator addresses on the
    /// sidechain. The Ethereum key signs the keccak of the validator
    /// address bytes to prove control.
    pub async fn register_orchestrator_addresses(&self) -> OrchestratorResult<()> {
        let digest = H256::from(keccak256(self.validator.as_bytes()));
        let signature = self
            .eth_wallet
            .sign_hash(hash_message(digest.as_bytes()))
            .map_err(|e| OrchestratorError::Wallet(e.to_string()))?;

        let msg = SidechainMsg::SetOrchestratorAddresses(MsgSetOrchestratorAddresses {
            validator: self.validator.clone(),
            orchestrator: self.orchestrator.clone(),
            eth_address: format!("{:?}", self.eth_wallet.address()),
            eth_signature: hex::encode(signature.to_vec()),
        });

        info!("registering orchestrator addresses on the sidechain");
        self.submitter.submit_msgs(vec![msg]).await
    }

    /// Sign a valset checkpoint and queue the confirm
    pub async fn send_valset_confirm(
        &self,
        bridge_id: H256,
        valset: &Valset,
    ) -> OrchestratorResult<()> {
        let digest = valset_checkpoint_hash(bridge_id, valset);
        let signature = sign_checkpoint(&self.eth_wallet, digest)?;

        let msg = SidechainMsg::ValsetConfirm(MsgValsetConfirm {
            nonce: valset.nonce,
            orchestrator: self.orchestrator.clone(),
            eth_address: format!("{:?}", self.eth_wallet.address()),
            signature: hex::encode(signature.to_vec()),
        });

        debug!("queueing valset confirm for nonce {}", valset.nonce);
        self.submitter.submit_msgs(vec![msg]).await
    }

    /// Sign a batch checkpoint and queue the confirm
    pub async fn send_batch_confirm(
        &self,
        bridge_id: H256,
        batch: &OutgoingBatch,
    ) -> OrchestratorResult<()> {
        let digest = batch_checkpoint_hash(bridge_id, batch);
        let signature = sign_checkpoint(&self.eth_wallet, digest)?;

        let msg = SidechainMsg::ConfirmBatch(MsgConfirmBatch {
            nonce: batch.nonce,
            token_contract: format!("{:?}", batch.token_contract),
            orchestrator: self.orchestrator.clone(),
            eth_signer: format!("{:?}", self.eth_wallet.address()),
            signature: hex::encode(signature.to_vec()),
        });

        debug!(
            "queueing batch confirm for nonce {} token {:?}",
            batch.nonce, batch.token_contract
        );
        self.submitter.submit_msgs(vec![msg]).await
    }

    /// Convert scanned bridge events into claim messages and submit them in
    /// a single sidechain transaction, ordered by event nonce. The caller
    /// supplies deposit token metadata keyed by ERC20 contract.
    pub async fn send_ethereum_claims(
        &self,
        events: &[BridgeEvent],
        metadata: &HashMap<Address, Erc20Metadata>,
    ) -> OrchestratorResult<()> {
        let mut msgs = Vec::with_capacity(events.len());
        let mut last_nonce = 0u64;

        for event in events {
            // defense against a caller handing us an unsorted slice
            if event.event_nonce() <= last_nonce {
                return Err(OrchestratorError::Internal(format!(
                    "claims out of order: {} after {}",
                    event.event_nonce(),
                    last_nonce
                )));
            }
            last_nonce = event.event_nonce();
            msgs.push(self.claim_for_event(event, metadata));
        }

        info!("submitting {} claims to the sidechain", msgs.len());
        self.submitter.submit_msgs(msgs).await
    }

    fn claim_for_event(
        &self,
        event: &BridgeEvent,
        metadata: &HashMap<Address, Erc20Metadata>,
    ) -> SidechainMsg {
        match event {
            BridgeEvent::SendToCosmos {
                erc20,
                sender,
                destination,
                amount,
                event_nonce,
                block_number,
            } => {
                let meta = metadata.get(erc20).cloned().unwrap_or_default();
                SidechainMsg::DepositClaim(MsgDepositClaim {
                    event_nonce: *event_nonce,
                    block_height: *block_number,
                    token_contract: format!("{:?}", erc20),
                    amount: amount.to_string(),
                    ethereum_sender: format!("{:?}", sender),
                    cosmos_receiver: hex::encode(destination),
                    orchestrator: self.orchestrator.clone(),
                    token_name: meta.name,
                    token_symbol: meta.symbol,
                    token_decimals: meta.decimals as u64,
                })
            }

            BridgeEvent::BatchExecuted {
                batch_nonce,
                token,
                event_nonce,
                block_number,
                ..
            } => SidechainMsg::WithdrawClaim(MsgWithdrawClaim {
                event_nonce: *event_nonce,
                block_height: *block_number,
                batch_nonce: *batch_nonce,
                token_contract: format!("{:?}", token),
                orchestrator: self.orchestrator.clone(),
            }),

            BridgeEvent::ValsetUpdated {
                valset_nonce,
                event_nonce,
                reward_amount,
                reward_token,
                validators,
                powers,
                block_number,
            } => SidechainMsg::ValsetUpdatedClaim(MsgValsetUpdatedClaim {
                event_nonce: *event_nonce,
                block_height: *block_number,
                valset_nonce: *valset_nonce,
                members: validators
                    .iter()
                    .zip(powers)
                    .map(|(addr, power)| ValsetMemberJson {
                        power: *power,
                        eth_address: format!("{:?}", addr),
                    })
                    .collect(),
                reward_amount: reward_amount.to_string(),
                reward_token: format!("{:?}", reward_token),
                orchestrator: self.orchestrator.clone(),
            }),

            BridgeEvent::Erc20Deployed {
                cosmos_denom,
                token_contract,
                name,
                symbol,
                decimals,
                event_nonce,
                block_number,
            } => SidechainMsg::Erc20DeployedClaim(MsgErc20DeployedClaim {
                event_nonce: *event_nonce,
                block_height: *block_number,
                cosmos_denom: cosmos_denom.clone(),
                token_contract: format!("{:?}", token_contract),
                name: name.clone(),
                symbol: symbol.clone(),
                decimals: *decimals as u64,
                orchestrator: self.orchestrator.clone(),
            }),
        }
    }

    /// Queue a request for the sidechain to cut a batch for `denom`
    pub async fn send_request_batch(&self, denom: &str) -> OrchestratorResult<()> {
        let msg = SidechainMsg::RequestBatch(MsgRequestBatch {
            orchestrator: self.orchestrator.clone(),
            denom: denom.to_string(),
        });
        debug!("queueing batch request for denom {}", denom);
        self.submitter.submit_msgs(vec![msg]).await
    }

    /// Queue a transfer of sidechain tokens to an Ethereum address. The
    /// bridge fee is separate from the chain fee and pays for eventual
    /// batch relay.
    pub async fn send_to_eth(
        &self,
        destination: Address,
        amount: Coin,
        bridge_fee: Coin,
    ) -> OrchestratorResult<()> {
        let msg = SidechainMsg::SendToEth(MsgSendToEth {
            sender: self.orchestrator.clone(),
            eth_dest: format!("{:?}", destination),
            amount,
            bridge_fee,
        });
        self.submitter.submit_msgs(vec![msg]).await
    }
}
