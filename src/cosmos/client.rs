//! Legacy LCD transaction submitter
//!
//! Assembles amino-JSON StdTx envelopes, signs the canonical sign-doc with
//! the orchestrator's secp256k1 key and delivers them through the node's
//! REST endpoint in sync mode.

use super::broadcast::MsgSubmitter;
use super::msgs::{Coin, SidechainMsg};
use crate::error::{OrchestratorError, OrchestratorResult};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ethers::core::k256::ecdsa::{signature::Signer as _, Signature as K256Signature, SigningKey};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const BROADCAST_TIMEOUT: Duration = Duration::from_secs(30);
/// Flat gas limit for queued messages; the sidechain refunds nothing for
/// overestimating
const TX_GAS_LIMIT: u64 = 2_000_000;

pub struct LcdSubmitter {
    http: reqwest::Client,
    base_url: String,
    chain_id: String,
    from_address: String,
    signing_key: SigningKey,
    gas_price: f64,
    fee_denom: String,
}

impl LcdSubmitter {
    pub fn new(
        base_url: &str,
        chain_id: &str,
        from_address: &str,
        private_key_hex: &str,
        gas_prices: &str,
    ) -> OrchestratorResult<Self> {
        let key_bytes = hex::decode(private_key_hex.trim_start_matches("0x"))
            .map_err(|e| OrchestratorError::Wallet(format!("bad cosmos key: {}", e)))?;
        let signing_key = SigningKey::from_slice(&key_bytes)
            .map_err(|e| OrchestratorError::Wallet(format!("bad cosmos key: {}", e)))?;

        let (gas_price, fee_denom) = parse_gas_prices(gas_prices)?;

        let http = reqwest::Client::builder()
            .timeout(BROADCAST_TIMEOUT)
            .build()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            chain_id: chain_id.to_string(),
            from_address: from_address.to_string(),
            signing_key,
            gas_price,
            fee_denom,
        })
    }

    async fn fetch_account(&self) -> OrchestratorResult<(u64, u64)> {
        let url = format!("{}/auth/accounts/{}", self.base_url, self.from_address);
        let resp: AccountResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| OrchestratorError::SidechainRpc(e.to_string()))?
            .json()
            .await
            .map_err(|e| OrchestratorError::SidechainRpc(e.to_string()))?;

        let account_number = resp
            .result
            .value
            .account_number
            .parse()
            .map_err(|_| OrchestratorError::SidechainRpc("bad account_number".to_string()))?;
        let sequence = resp
            .result
            .value
            .sequence
            .parse()
            .map_err(|_| OrchestratorError::SidechainRpc("bad sequence".to_string()))?;
        Ok((account_number, sequence))
    }

    fn fee(&self) -> Coin {
        let amount = (TX_GAS_LIMIT as f64 * self.gas_price).ceil() as u128;
        Coin {
            denom: self.fee_denom.clone(),
            amount: amount.to_string(),
        }
    }

    /// Canonical sign-doc bytes: serde_json orders object keys, which is
    /// exactly the canonical form the sidechain verifies against.
    fn sign_doc(
        &self,
        account_number: u64,
        sequence: u64,
        msgs: &[SidechainMsg],
    ) -> OrchestratorResult<Vec<u8>> {
        let doc = json!({
            "account_number": account_number.to_string(),
            "chain_id": self.chain_id,
            "fee": {
                "amount": [self.fee()],
                "gas": TX_GAS_LIMIT.to_string(),
            },
            "memo": "",
            "msgs": msgs,
            "sequence": sequence.to_string(),
        });
        serde_json::to_vec(&doc).map_err(|e| OrchestratorError::Internal(e.to_string()))
    }
}

#[async_trait]
impl MsgSubmitter for LcdSubmitter {
    async fn submit_msgs(&self, msgs: Vec<SidechainMsg>) -> OrchestratorResult<()> {
        if msgs.is_empty() {
            return Ok(());
        }
        debug!(
            "broadcasting {} msgs: {:?}",
            msgs.len(),
            msgs.iter().map(|m| m.name()).collect::<Vec<_>>()
        );

        let (account_number, sequence) = self.fetch_account().await?;
        let sign_doc = self.sign_doc(account_number, sequence, &msgs)?;

        // the ecdsa signer hashes the sign-doc with SHA-256 internally
        let signature: K256Signature = self.signing_key.sign(&sign_doc);
        let pub_key = self.signing_key.verifying_key().to_sec1_bytes();

        let body = json!({
            "tx": {
                "msg": msgs,
                "fee": {
                    "amount": [self.fee()],
                    "gas": TX_GAS_LIMIT.to_string(),
                },
                "signatures": [{
                    "pub_key": {
                        "type": "tendermint/PubKeySecp256k1",
                        "value": BASE64.encode(&pub_key),
                    },
                    "signature": BASE64.encode(signature.to_bytes()),
                }],
                "memo": "",
            },
            "mode": "sync",
        });

        let url = format!("{}/txs", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| OrchestratorError::SidechainRpc(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::SidechainRpc(format!(
                "broadcast returned {}",
                resp.status()
            )));
        }

        let result: BroadcastResponse = resp
            .json()
            .await
            .map_err(|e| OrchestratorError::SidechainRpc(e.to_string()))?;
        if result.code.unwrap_or(0) != 0 {
            warn!(
                "sidechain rejected tx: code {} log {:?}",
                result.code.unwrap_or(0),
                result.raw_log
            );
            return Err(OrchestratorError::SidechainRpc(format!(
                "tx rejected: {}",
                result.raw_log.unwrap_or_default()
            )));
        }

        debug!("broadcast accepted, txhash {:?}", result.txhash);
        Ok(())
    }
}

fn parse_gas_prices(raw: &str) -> OrchestratorResult<(f64, String)> {
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| OrchestratorError::Config(format!("bad gas prices {:?}", raw)))?;
    let (amount, denom) = raw.split_at(split);
    let price: f64 = amount
        .parse()
        .map_err(|_| OrchestratorError::Config(format!("bad gas prices {:?}", raw)))?;
    if denom.is_empty() {
        return Err(OrchestratorError::Config(format!("bad gas prices {:?}", raw)));
    }
    Ok((price, denom.to_string()))
}

#[derive(Deserialize)]
struct AccountResponse {
    result: AccountResult,
}

#[derive(Deserialize)]
struct AccountResult {
    value: AccountValue,
}

#[derive(Deserialize)]
struct AccountValue {
    account_number: String,
    sequence: String,
}

#[derive(Deserialize)]
struct BroadcastResponse {
    txhash: Option<String>,
    code: Option<u32>,
    raw_log: Option<String>,
}
