//! Sidechain bridge query interface
//!
//! The orchestrator reads all sidechain state through [`SidechainQuery`],
//! implemented over the node's grpc-gateway REST endpoint in production and
//! by in-memory mocks in tests.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{
    BatchConfirm, BatchTransfer, LastObservedEvent, OutgoingBatch, PendingSendToEth, Valset,
    ValsetConfirm, ValsetMember,
};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait SidechainQuery: Send + Sync {
    /// Highest event nonce this orchestrator has attested to, and the
    /// Ethereum height it was observed at
    async fn last_event_by_addr(&self, orchestrator: &str)
        -> OrchestratorResult<LastObservedEvent>;

    /// The valset currently active on the sidechain
    async fn current_valset(&self) -> OrchestratorResult<Valset>;

    /// Most recent valsets, newest first
    async fn latest_valsets(&self) -> OrchestratorResult<Vec<Valset>>;

    /// Valsets this orchestrator has not confirmed yet
    async fn oldest_unsigned_valsets(&self, orchestrator: &str)
        -> OrchestratorResult<Vec<Valset>>;

    /// Most recent outgoing batches across all tokens, newest first
    async fn latest_batches(&self) -> OrchestratorResult<Vec<OutgoingBatch>>;

    /// Oldest batch this orchestrator has not confirmed yet
    async fn oldest_unsigned_batch(
        &self,
        orchestrator: &str,
    ) -> OrchestratorResult<Option<OutgoingBatch>>;

    async fn valset_confirms_by_nonce(&self, nonce: u64)
        -> OrchestratorResult<Vec<ValsetConfirm>>;

    async fn batch_confirms_by_nonce_and_token(
        &self,
        nonce: u64,
        token: Address,
    ) -> OrchestratorResult<Vec<BatchConfirm>>;

    /// Unbatched send-to-Ethereum transfers queued on the sidechain
    async fn pending_send_to_eth_by_addr(
        &self,
        orchestrator: &str,
    ) -> OrchestratorResult<Vec<PendingSendToEth>>;

    /// Sidechain denom minted for an ERC20 contract
    async fn denom_by_erc20(&self, erc20: Address) -> OrchestratorResult<String>;
}

/// REST client over the sidechain's grpc-gateway endpoint
pub struct GrpcGatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl GrpcGatewayClient {
    pub fn new(base_url: &str) -> OrchestratorResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(|e| OrchestratorError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> OrchestratorResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| OrchestratorError::SidechainRpc(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::SidechainRpc(format!(
                "GET {} returned {}",
                url,
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map_err(|e| OrchestratorError::SidechainRpc(e.to_string()))
    }
}

#[async_trait]
impl SidechainQuery for GrpcGatewayClient {
    async fn last_event_by_addr(
        &self,
        orchestrator: &str,
    ) -> OrchestratorResult<LastObservedEvent> {
        let resp: LastEventResponse = self
            .get_json(&format!("/bridge/v1/last_event_by_addr/{}", orchestrator))
            .await?;
        Ok(LastObservedEvent {
            event_nonce: parse_u64(&resp.event_nonce)?,
            ethereum_height: parse_u64(&resp.ethereum_height)?,
        })
    }

    async fn current_valset(&self) -> OrchestratorResult<Valset> {
        let resp: CurrentValsetResponse = self.get_json("/bridge/v1/valset/current").await?;
        resp.valset.into_domain()
    }

    async fn latest_valsets(&self) -> OrchestratorResult<Vec<Valset>> {
        let resp: ValsetsResponse = self.get_json("/bridge/v1/valset/latest").await?;
        resp.valsets.into_iter().map(|v| v.into_domain()).collect()
    }

    async fn oldest_unsigned_valsets(
        &self,
        orchestrator: &str,
    ) -> OrchestratorResult<Vec<Valset>> {
        let resp: ValsetsResponse = self
            .get_json(&format!("/bridge/v1/valset/unsigned/{}", orchestrator))
            .await?;
        resp.valsets.into_iter().map(|v| v.into_domain()).collect()
    }

    async fn latest_batches(&self) -> OrchestratorResult<Vec<OutgoingBatch>> {
        let resp: BatchesResponse = self.get_json("/bridge/v1/batch/latest").await?;
        resp.batches.into_iter().map(|b| b.into_domain()).collect()
    }

    async fn oldest_unsigned_batch(
        &self,
        orchestrator: &str,
    ) -> OrchestratorResult<Option<OutgoingBatch>> {
        let resp: UnsignedBatchResponse = self
            .get_json(&format!("/bridge/v1/batch/unsigned/{}", orchestrator))
            .await?;
        resp.batch.map(|b| b.into_domain()).transpose()
    }

    async fn valset_confirms_by_nonce(
        &self,
        nonce: u64,
    ) -> OrchestratorResult<Vec<ValsetConfirm>> {
        let resp: ValsetConfirmsResponse = self
            .get_json(&format!("/bridge/v1/valset/confirms/{}", nonce))
            .await?;
        resp.confirms.into_iter().map(|c| c.into_domain()).collect()
    }

    async fn batch_confirms_by_nonce_and_token(
        &self,
        nonce: u64,
        token: Address,
    ) -> OrchestratorResult<Vec<BatchConfirm>> {
        let resp: BatchConfirmsResponse = self
            .get_json(&format!("/bridge/v1/batch/confirms/{}/{:?}", nonce, token))
            .await?;
        resp.confirms.into_iter().map(|c| c.into_domain()).collect()
    }

    async fn pending_send_to_eth_by_addr(
        &self,
        orchestrator: &str,
    ) -> OrchestratorResult<Vec<PendingSendToEth>> {
        let resp: PendingSendToEthResponse = self
            .get_json(&format!("/bridge/v1/pending_send_to_eth/{}", orchestrator))
            .await?;
        resp.transfers.into_iter().map(|t| t.into_domain()).collect()
    }

    async fn denom_by_erc20(&self, erc20: Address) -> OrchestratorResult<String> {
        let resp: DenomResponse = self
            .get_json(&format!("/bridge/v1/denom_by_erc20/{:?}", erc20))
            .await?;
        Ok(resp.denom)
    }
}

// --- wire DTOs ---

#[derive(Deserialize)]
struct LastEventResponse {
    event_nonce: String,
    ethereum_height: String,
}

#[derive(Deserialize)]
struct ValsetMemberDto {
    power: String,
    eth_address: String,
}

#[derive(Deserialize)]
struct ValsetDto {
    nonce: String,
    members: Vec<ValsetMemberDto>,
    reward_amount: String,
    reward_token: String,
}

impl ValsetDto {
    fn into_domain(self) -> OrchestratorResult<Valset> {
        Ok(Valset {
            nonce: parse_u64(&self.nonce)?,
            members: self
                .members
                .into_iter()
                .map(|m| {
                    Ok(ValsetMember {
                        eth_address: parse_address(&m.eth_address)?,
                        power: parse_u64(&m.power)?,
                    })
                })
                .collect::<OrchestratorResult<Vec<_>>>()?,
            reward_amount: parse_u256(&self.reward_amount)?,
            reward_token: parse_address(&self.reward_token)?,
        })
    }
}

#[derive(Deserialize)]
struct CurrentValsetResponse {
    valset: ValsetDto,
}

#[derive(Deserialize)]
struct ValsetsResponse {
    #[serde(default)]
    valsets: Vec<ValsetDto>,
}

#[derive(Deserialize)]
struct BatchTransferDto {
    destination: String,
    amount: String,
    fee: String,
}

#[derive(Deserialize)]
struct BatchDto {
    nonce: String,
    token_contract: String,
    transfers: Vec<BatchTransferDto>,
    batch_timeout: String,
}

impl BatchDto {
    fn into_domain(self) -> OrchestratorResult<OutgoingBatch> {
        Ok(OutgoingBatch {
            nonce: parse_u64(&self.nonce)?,
            token_contract: parse_address(&self.token_contract)?,
            transfers: self
                .transfers
                .into_iter()
                .map(|t| {
                    Ok(BatchTransfer {
                        destination: parse_address(&t.destination)?,
                        amount: parse_u256(&t.amount)?,
                        fee: parse_u256(&t.fee)?,
                    })
                })
                .collect::<OrchestratorResult<Vec<_>>>()?,
            batch_timeout: parse_u64(&self.batch_timeout)?,
        })
    }
}

#[derive(Deserialize)]
struct BatchesResponse {
    #[serde(default)]
    batches: Vec<BatchDto>,
}

#[derive(Deserialize)]
struct UnsignedBatchResponse {
    batch: Option<BatchDto>,
}

#[derive(Deserialize)]
struct ValsetConfirmDto {
    validator: String,
    eth_address: String,
    nonce: String,
    signature: String,
}

impl ValsetConfirmDto {
    fn into_domain(self) -> OrchestratorResult<ValsetConfirm> {
        Ok(ValsetConfirm {
            validator: self.validator,
            eth_signer: parse_address(&self.eth_address)?,
            nonce: parse_u64(&self.nonce)?,
            signature: self.signature,
        })
    }
}

#[derive(Deserialize)]
struct ValsetConfirmsResponse {
    #[serde(default)]
    confirms: Vec<ValsetConfirmDto>,
}

#[derive(Deserialize)]
struct BatchConfirmDto {
    validator: String,
    eth_signer: String,
    nonce: String,
    token_contract: String,
    signature: String,
}

impl BatchConfirmDto {
    fn into_domain(self) -> OrchestratorResult<BatchConfirm> {
        Ok(BatchConfirm {
            validator: self.validator,
            eth_signer: parse_address(&self.eth_signer)?,
            nonce: parse_u64(&self.nonce)?,
            token_contract: parse_address(&self.token_contract)?,
            signature: self.signature,
        })
    }
}

#[derive(Deserialize)]
struct BatchConfirmsResponse {
    #[serde(default)]
    confirms: Vec<BatchConfirmDto>,
}

#[derive(Deserialize)]
struct PendingSendToEthDto {
    sender: String,
    destination: String,
    token_contract: String,
    amount: String,
    fee: String,
}

impl PendingSendToEthDto {
    fn into_domain(self) -> OrchestratorResult<PendingSendToEth> {
        Ok(PendingSendToEth {
            sender: self.sender,
            destination: parse_address(&self.destination)?,
            token_contract: parse_address(&self.token_contract)?,
            amount: parse_u256(&self.amount)?,
            fee: parse_u256(&self.fee)?,
        })
    }
}

#[derive(Deserialize)]
struct PendingSendToEthResponse {
    #[serde(default)]
    transfers: Vec<PendingSendToEthDto>,
}

#[derive(Deserialize)]
struct DenomResponse {
    denom: String,
}

fn parse_u64(raw: &str) -> OrchestratorResult<u64> {
    raw.parse()
        .map_err(|_| OrchestratorError::SidechainRpc(format!("bad uint64 {:?}", raw)))
}

fn parse_u256(raw: &str) -> OrchestratorResult<U256> {
    U256::from_dec_str(raw)
        .map_err(|_| OrchestratorError::SidechainRpc(format!("bad uint256 {:?}", raw)))
}

fn parse_address(raw: &str) -> OrchestratorResult<Address> {
    Address::from_str(raw)
        .map_err(|_| OrchestratorError::SidechainRpc(format!("bad address {:?}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valset_dto_parses() {
        let raw = r#"{
            "nonce": "42",
            "members": [
                {"power": "2863311530", "eth_address": "0xd8da6bf26964af9d7eed9e03e53415d37aa96045"},
                {"power": "1431655765", "eth_address": "0x3bdf8428734244c9e5d82c95d125081939d6d42d"}
            ],
            "reward_amount": "0",
            "reward_token": "0x0000000000000000000000000000000000000000"
        }"#;
        let dto: ValsetDto = serde_json::from_str(raw).unwrap();
        let valset = dto.into_domain().unwrap();
        assert_eq!(valset.nonce, 42);
        assert_eq!(valset.members.len(), 2);
        assert_eq!(valset.members[0].power, 2_863_311_530);
    }

    #[test]
    fn test_batch_dto_parses() {
        let raw = r#"{
            "nonce": "7",
            "token_contract": "0xcccccccccccccccccccccccccccccccccccccccc",
            "transfers": [
                {"destination": "0xdddddddddddddddddddddddddddddddddddddddd",
                 "amount": "340282366920938463463374607431768211456",
                 "fee": "25"}
            ],
            "batch_timeout": "15000"
        }"#;
        let dto: BatchDto = serde_json::from_str(raw).unwrap();
        let batch = dto.into_domain().unwrap();
        assert_eq!(batch.nonce, 7);
        // amounts above u128 survive the decimal parse
        assert_eq!(batch.transfers[0].amount, U256::from(2).pow(U256::from(128)));
    }

    #[test]
    fn test_bad_address_rejected() {
        assert!(parse_address("not-an-address").is_err());
        assert!(parse_u64("-3").is_err());
    }
}
