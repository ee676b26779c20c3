//! Bridge contract wrapper
//!
//! Read calls, checkpoint digests and calldata encoding for the Ethereum
//! bridge contract. Everything here is plain ABI encoding over the
//! committer; the contract owns no loop state of its own.

use super::committer::EthCommitter;
use super::pending::PendingTxSet;
use super::provider::EthereumRpc;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{
    BatchConfirm, OutgoingBatch, Valset, ValsetConfirm, POWER_THRESHOLD, TOTAL_BRIDGE_POWER,
};

use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{hash_message, id, keccak256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct BridgeContract {
    committer: Arc<EthCommitter>,
    provider: Arc<dyn EthereumRpc>,
    address: Address,
    pending_txs: Arc<PendingTxSet>,
}

impl BridgeContract {
    pub fn new(
        committer: Arc<EthCommitter>,
        address: Address,
        pending_txs: Arc<PendingTxSet>,
    ) -> Self {
        let provider = committer.provider();
        Self {
            committer,
            provider,
            address,
            pending_txs,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn from_address(&self) -> Address {
        self.committer.from_address()
    }

    pub fn provider(&self) -> Arc<dyn EthereumRpc> {
        self.provider.clone()
    }

    /// True if identical calldata is already in the mempool and fresh
    pub fn is_pending_tx_input(&self, calldata: &[u8], wait: Duration) -> bool {
        self.pending_txs.is_pending(calldata, wait)
    }

    pub fn pending_tx_count(&self) -> usize {
        self.pending_txs.len()
    }

    async fn call_read(&self, calldata: Vec<u8>) -> OrchestratorResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.committer.from_address())
            .to(self.address)
            .data(calldata)
            .into();
        self.provider.call(&tx).await
    }

    /// `state_lastValsetNonce()`
    pub async fn get_valset_nonce(&self) -> OrchestratorResult<u64> {
        let out = self.call_read(id("state_lastValsetNonce()").to_vec()).await?;
        decode_uint(&out).map(|n| n.as_u64())
    }

    /// `state_lastBatchNonces(token)`
    pub async fn get_tx_batch_nonce(&self, token: Address) -> OrchestratorResult<u64> {
        let mut calldata = id("state_lastBatchNonces(address)").to_vec();
        calldata.extend(abi::encode(&[Token::Address(token)]));
        let out = self.call_read(calldata).await?;
        decode_uint(&out).map(|n| n.as_u64())
    }

    /// `state_peggyId()`, the bridge ID mixed into every checkpoint digest
    pub async fn get_bridge_id(&self) -> OrchestratorResult<H256> {
        let out = self.call_read(id("state_peggyId()").to_vec()).await?;
        if out.len() < 32 {
            return Err(OrchestratorError::AbiEncoding(
                "state_peggyId returned short output".to_string(),
            ));
        }
        Ok(H256::from_slice(&out[0..32]))
    }

    pub async fn get_erc20_symbol(&self, erc20: Address) -> OrchestratorResult<String> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.committer.from_address())
            .to(erc20)
            .data(id("symbol()").to_vec())
            .into();
        let out = self.provider.call(&tx).await?;
        let tokens = abi::decode(&[ParamType::String], &out)
            .map_err(|e| OrchestratorError::AbiEncoding(e.to_string()))?;
        match tokens.into_iter().next() {
            Some(Token::String(s)) => Ok(s),
            _ => Err(OrchestratorError::AbiEncoding(
                "symbol() did not decode to a string".to_string(),
            )),
        }
    }

    pub async fn get_erc20_name(&self, erc20: Address) -> OrchestratorResult<String> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.committer.from_address())
            .to(erc20)
            .data(id("name()").to_vec())
            .into();
        let out = self.provider.call(&tx).await?;
        let tokens = abi::decode(&[ParamType::String], &out)
            .map_err(|e| OrchestratorError::AbiEncoding(e.to_string()))?;
        match tokens.into_iter().next() {
            Some(Token::String(s)) => Ok(s),
            _ => Err(OrchestratorError::AbiEncoding(
                "name() did not decode to a string".to_string(),
            )),
        }
    }

    pub async fn get_erc20_decimals(&self, erc20: Address) -> OrchestratorResult<u8> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.committer.from_address())
            .to(erc20)
            .data(id("decimals()").to_vec())
            .into();
        let out = self.provider.call(&tx).await?;
        decode_uint(&out).map(|n| n.as_u32() as u8)
    }

    /// Encode an `updateValset` call. Signatures are validated against the
    /// old valset's checkpoint and must aggregate at least 2/3 power.
    pub fn encode_valset_update(
        &self,
        bridge_id: H256,
        old_valset: &Valset,
        new_valset: &Valset,
        confirms: &[ValsetConfirm],
    ) -> OrchestratorResult<Vec<u8>> {
        let checkpoint = valset_checkpoint_hash(bridge_id, new_valset);
        let sigs = align_signatures(
            old_valset,
            checkpoint,
            confirms.iter().map(|c| (c.eth_signer, c.signature.as_str())),
        )?;

        let (new_addresses, new_powers) = member_arrays(new_valset);
        let (old_addresses, old_powers) = member_arrays(old_valset);

        let mut calldata = id(
            "updateValset(address[],uint256[],uint256,address[],uint256[],uint256,uint8[],bytes32[],bytes32[])",
        )
        .to_vec();
        calldata.extend(abi::encode(&[
            Token::Array(new_addresses),
            Token::Array(new_powers),
            Token::Uint(U256::from(new_valset.nonce)),
            Token::Array(old_addresses),
            Token::Array(old_powers),
            Token::Uint(U256::from(old_valset.nonce)),
            sigs.v_tokens(),
            sigs.r_tokens(),
            sigs.s_tokens(),
        ]));
        Ok(calldata)
    }

    /// Encode a `submitBatch` call. Signatures are validated against the
    /// batch checkpoint and must aggregate at least 2/3 power.
    pub fn encode_transaction_batch(
        &self,
        bridge_id: H256,
        current_valset: &Valset,
        batch: &OutgoingBatch,
        confirms: &[BatchConfirm],
    ) -> OrchestratorResult<Vec<u8>> {
        let checkpoint = batch_checkpoint_hash(bridge_id, batch);
        let sigs = align_signatures(
            current_valset,
            checkpoint,
            confirms.iter().map(|c| (c.eth_signer, c.signature.as_str())),
        )?;

        let (addresses, powers) = member_arrays(current_valset);
        let amounts: Vec<Token> = batch
            .transfers
            .iter()
            .map(|t| Token::Uint(t.amount))
            .collect();
        let destinations: Vec<Token> = batch
            .transfers
            .iter()
            .map(|t| Token::Address(t.destination))
            .collect();
        let fees: Vec<Token> = batch.transfers.iter().map(|t| Token::Uint(t.fee)).collect();

        let mut calldata = id(
            "submitBatch(address[],uint256[],uint256,uint8[],bytes32[],bytes32[],uint256[],address[],uint256[],uint256,address,uint256)",
        )
        .to_vec();
        calldata.extend(abi::encode(&[
            Token::Array(addresses),
            Token::Array(powers),
            Token::Uint(U256::from(current_valset.nonce)),
            sigs.v_tokens(),
            sigs.r_tokens(),
            sigs.s_tokens(),
            Token::Array(amounts),
            Token::Array(destinations),
            Token::Array(fees),
            Token::Uint(U256::from(batch.nonce)),
            Token::Address(batch.token_contract),
            Token::Uint(U256::from(batch.batch_timeout)),
        ]));
        Ok(calldata)
    }

    /// Encode a `sendToCosmos` deposit call
    pub fn encode_send_to_cosmos(
        &self,
        erc20: Address,
        destination: [u8; 32],
        amount: U256,
    ) -> Vec<u8> {
        let mut calldata = id("sendToCosmos(address,bytes32,uint256)").to_vec();
        calldata.extend(abi::encode(&[
            Token::Address(erc20),
            Token::FixedBytes(destination.to_vec()),
            Token::Uint(amount),
        ]));
        calldata
    }

    /// Broadcast pre-encoded calldata to the bridge contract and record it
    /// in the pending set so we do not race ourselves.
    pub async fn submit(&self, calldata: Vec<u8>) -> OrchestratorResult<H256> {
        let hash = self.committer.submit_tx(self.address, calldata.clone()).await?;
        self.pending_txs.record(&calldata);
        debug!("bridge contract call submitted: {:?}", hash);
        Ok(hash)
    }
}

/// keccak of the ABI-packed valset checkpoint tuple. Matches the digest the
/// contract derives in `makeCheckpoint`.
pub fn valset_checkpoint_hash(bridge_id: H256, valset: &Valset) -> H256 {
    let (addresses, powers) = member_arrays(valset);
    let encoded = abi::encode(&[
        Token::FixedBytes(bridge_id.as_bytes().to_vec()),
        method_name_token("checkpoint"),
        Token::Uint(U256::from(valset.nonce)),
        Token::Array(addresses),
        Token::Array(powers),
        Token::Uint(valset.reward_amount),
        Token::Address(valset.reward_token),
    ]);
    H256::from(keccak256(encoded))
}

/// keccak of the ABI-packed batch checkpoint tuple
pub fn batch_checkpoint_hash(bridge_id: H256, batch: &OutgoingBatch) -> H256 {
    let amounts: Vec<Token> = batch
        .transfers
        .iter()
        .map(|t| Token::Uint(t.amount))
        .collect();
    let destinations: Vec<Token> = batch
        .transfers
        .iter()
        .map(|t| Token::Address(t.destination))
        .collect();
    let fees: Vec<Token> = batch.transfers.iter().map(|t| Token::Uint(t.fee)).collect();

    let encoded = abi::encode(&[
        Token::FixedBytes(bridge_id.as_bytes().to_vec()),
        method_name_token("transactionBatch"),
        Token::Array(amounts),
        Token::Array(destinations),
        Token::Array(fees),
        Token::Uint(U256::from(batch.nonce)),
        Token::Address(batch.token_contract),
        Token::Uint(U256::from(batch.batch_timeout)),
    ]);
    H256::from(keccak256(encoded))
}

/// Sign a checkpoint digest with the 32-byte personal-sign prefix so the
/// contract's ecrecover accepts it.
pub fn sign_checkpoint(wallet: &LocalWallet, digest: H256) -> OrchestratorResult<Signature> {
    wallet
        .sign_hash(hash_message(digest.as_bytes()))
        .map_err(|e| OrchestratorError::Wallet(e.to_string()))
}

/// Split a hex signature into contract-ready (v, r, s). V is normalized to
/// 27/28.
pub fn sig_to_vrs(sig_hex: &str) -> OrchestratorResult<(u8, H256, H256)> {
    let bytes = hex::decode(sig_hex.trim_start_matches("0x"))
        .map_err(|e| OrchestratorError::Signature(e.to_string()))?;
    if bytes.len() != 65 {
        return Err(OrchestratorError::Signature(format!(
            "expected 65-byte signature, got {}",
            bytes.len()
        )));
    }
    let v = match bytes[64] {
        0 => 27,
        1 => 28,
        27 | 28 => bytes[64],
        other => {
            return Err(OrchestratorError::Signature(format!(
                "invalid recovery byte {}",
                other
            )))
        }
    };
    Ok((
        v,
        H256::from_slice(&bytes[0..32]),
        H256::from_slice(&bytes[32..64]),
    ))
}

/// Signature arrays aligned to valset member order
#[derive(Debug)]
pub struct AlignedSignatures {
    v: Vec<u8>,
    r: Vec<H256>,
    s: Vec<H256>,
    pub aggregated_power: u64,
}

impl AlignedSignatures {
    fn v_tokens(&self) -> Token {
        Token::Array(self.v.iter().map(|v| Token::Uint(U256::from(*v))).collect())
    }
    fn r_tokens(&self) -> Token {
        Token::Array(
            self.r
                .iter()
                .map(|r| Token::FixedBytes(r.as_bytes().to_vec()))
                .collect(),
        )
    }
    fn s_tokens(&self) -> Token {
        Token::Array(
            self.s
                .iter()
                .map(|s| Token::FixedBytes(s.as_bytes().to_vec()))
                .collect(),
        )
    }
}

/// Order confirm signatures by valset membership, inserting a zero
/// signature for members that have not confirmed. Every present signature
/// must recover to its member's address; the aggregate power of present
/// signatures must clear [`POWER_THRESHOLD`].
pub fn align_signatures<'a>(
    valset: &Valset,
    checkpoint: H256,
    confirms: impl Iterator<Item = (Address, &'a str)>,
) -> OrchestratorResult<AlignedSignatures> {
    let by_signer: std::collections::HashMap<Address, &str> = confirms.collect();

    let mut out = AlignedSignatures {
        v: Vec::with_capacity(valset.members.len()),
        r: Vec::with_capacity(valset.members.len()),
        s: Vec::with_capacity(valset.members.len()),
        aggregated_power: 0,
    };

    let prefixed = hash_message(checkpoint.as_bytes());
    for member in &valset.members {
        match by_signer.get(&member.eth_address) {
            Some(sig_hex) => {
                let (v, r, s) = sig_to_vrs(sig_hex)?;

                let sig = Signature {
                    r: U256::from_big_endian(r.as_bytes()),
                    s: U256::from_big_endian(s.as_bytes()),
                    v: v as u64,
                };
                let recovered = sig
                    .recover(RecoveryMessage::Hash(prefixed))
                    .map_err(|e| OrchestratorError::Signature(e.to_string()))?;
                if recovered != member.eth_address {
                    return Err(OrchestratorError::Signature(format!(
                        "signature for {:?} recovers to {:?}",
                        member.eth_address, recovered
                    )));
                }

                out.v.push(v);
                out.r.push(r);
                out.s.push(s);
                out.aggregated_power += member.power;
            }
            None => {
                out.v.push(0);
                out.r.push(H256::zero());
                out.s.push(H256::zero());
            }
        }
    }

    if out.aggregated_power < POWER_THRESHOLD {
        return Err(OrchestratorError::InsufficientVotingPower {
            aggregated: out.aggregated_power,
            total: TOTAL_BRIDGE_POWER,
        });
    }

    debug!(
        "{:.2}% of bridge power has signed this checkpoint",
        Valset::power_percent(out.aggregated_power)
    );
    Ok(out)
}

fn member_arrays(valset: &Valset) -> (Vec<Token>, Vec<Token>) {
    let addresses = valset
        .members
        .iter()
        .map(|m| Token::Address(m.eth_address))
        .collect();
    let powers = valset
        .members
        .iter()
        .map(|m| Token::Uint(U256::from(m.power)))
        .collect();
    (addresses, powers)
}

/// Method names are mixed into checkpoints as right-padded bytes32
fn method_name_token(name: &str) -> Token {
    let mut padded = [0u8; 32];
    padded[..name.len()].copy_from_slice(name.as_bytes());
    Token::FixedBytes(padded.to_vec())
}

fn decode_uint(out: &[u8]) -> OrchestratorResult<U256> {
    if out.len() < 32 {
        return Err(OrchestratorError::AbiEncoding(format!(
            "expected a uint256 word, got {} bytes",
            out.len()
        )));
    }
    Ok(U256::from_big_endian(&out[0..32]))
}
