//! Bridge contract event types and log parsing
//!
//! Every event the contract emits carries a global, strictly increasing
//! event nonce. The nonce is the unit of replay protection for
//! attestations, so parsing and ordering here must be exact.

use crate::error::{OrchestratorError, OrchestratorResult};

use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::utils::keccak256;

/// Topic signatures of the consumed events
pub mod topics {
    use ethers::types::H256;
    use ethers::utils::keccak256;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref SEND_TO_COSMOS: H256 =
            H256::from(keccak256("SendToCosmos(address,address,bytes32,uint256,uint256)"));
        pub static ref BATCH_EXECUTED: H256 = H256::from(keccak256(
            "TransactionBatchExecuted(uint256,address,uint256)"
        ));
        pub static ref VALSET_UPDATED: H256 = H256::from(keccak256(
            "ValsetUpdated(uint256,uint256,uint256,address,address[],uint256[])"
        ));
        pub static ref ERC20_DEPLOYED: H256 = H256::from(keccak256(
            "ERC20Deployed(string,address,string,string,uint8,uint256)"
        ));
    }
}

/// Union of events emitted by the bridge contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// An ERC20 deposit headed to the sidechain
    SendToCosmos {
        erc20: Address,
        sender: Address,
        destination: [u8; 32],
        amount: U256,
        event_nonce: u64,
        block_number: u64,
    },

    /// An outgoing batch was executed on the contract
    BatchExecuted {
        batch_nonce: u64,
        token: Address,
        event_nonce: u64,
        block_number: u64,
        tx_hash: H256,
    },

    /// The contract accepted a new validator set
    ValsetUpdated {
        valset_nonce: u64,
        event_nonce: u64,
        reward_amount: U256,
        reward_token: Address,
        validators: Vec<Address>,
        powers: Vec<u64>,
        block_number: u64,
    },

    /// The contract deployed a new ERC20 for a sidechain denom
    Erc20Deployed {
        cosmos_denom: String,
        token_contract: Address,
        name: String,
        symbol: String,
        decimals: u8,
        event_nonce: u64,
        block_number: u64,
    },
}

impl BridgeEvent {
    pub fn event_nonce(&self) -> u64 {
        match self {
            BridgeEvent::SendToCosmos { event_nonce, .. } => *event_nonce,
            BridgeEvent::BatchExecuted { event_nonce, .. } => *event_nonce,
            BridgeEvent::ValsetUpdated { event_nonce, .. } => *event_nonce,
            BridgeEvent::Erc20Deployed { event_nonce, .. } => *event_nonce,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            BridgeEvent::SendToCosmos { block_number, .. } => *block_number,
            BridgeEvent::BatchExecuted { block_number, .. } => *block_number,
            BridgeEvent::ValsetUpdated { block_number, .. } => *block_number,
            BridgeEvent::Erc20Deployed { block_number, .. } => *block_number,
        }
    }

    /// Event name for metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::SendToCosmos { .. } => "send_to_cosmos",
            BridgeEvent::BatchExecuted { .. } => "batch_executed",
            BridgeEvent::ValsetUpdated { .. } => "valset_updated",
            BridgeEvent::Erc20Deployed { .. } => "erc20_deployed",
        }
    }
}

/// Parse a raw log from the bridge contract into a [`BridgeEvent`].
/// Unrecognized topics are an error; the filters only request known ones.
pub fn parse_log(log: &Log) -> OrchestratorResult<BridgeEvent> {
    let topic0 = log
        .topics
        .first()
        .copied()
        .ok_or_else(|| OrchestratorError::EventParsing("log without topics".to_string()))?;
    let block_number = log
        .block_number
        .map(|b| b.as_u64())
        .ok_or_else(|| OrchestratorError::EventParsing("log without block number".to_string()))?;

    if topic0 == *topics::SEND_TO_COSMOS {
        parse_send_to_cosmos(log, block_number)
    } else if topic0 == *topics::BATCH_EXECUTED {
        parse_batch_executed(log, block_number)
    } else if topic0 == *topics::VALSET_UPDATED {
        parse_valset_updated(log, block_number)
    } else if topic0 == *topics::ERC20_DEPLOYED {
        parse_erc20_deployed(log, block_number)
    } else {
        Err(OrchestratorError::EventParsing(format!(
            "unrecognized topic {:?}",
            topic0
        )))
    }
}

fn indexed_address(log: &Log, index: usize) -> OrchestratorResult<Address> {
    log.topics
        .get(index)
        .map(|t| Address::from_slice(&t.0[12..32]))
        .ok_or_else(|| OrchestratorError::EventParsing(format!("missing topic {}", index)))
}

fn indexed_uint(log: &Log, index: usize) -> OrchestratorResult<U256> {
    log.topics
        .get(index)
        .map(|t| U256::from_big_endian(&t.0))
        .ok_or_else(|| OrchestratorError::EventParsing(format!("missing topic {}", index)))
}

fn parse_send_to_cosmos(log: &Log, block_number: u64) -> OrchestratorResult<BridgeEvent> {
    let erc20 = indexed_address(log, 1)?;
    let sender = indexed_address(log, 2)?;
    let destination: [u8; 32] = log
        .topics
        .get(3)
        .map(|t| t.0)
        .ok_or_else(|| OrchestratorError::EventParsing("missing destination topic".to_string()))?;

    let tokens = abi::decode(&[ParamType::Uint(256), ParamType::Uint(256)], &log.data)
        .map_err(|e| OrchestratorError::EventParsing(e.to_string()))?;
    let amount = uint_token(&tokens[0])?;
    let event_nonce = uint_token(&tokens[1])?.as_u64();

    Ok(BridgeEvent::SendToCosmos {
        erc20,
        sender,
        destination,
        amount,
        event_nonce,
        block_number,
    })
}

fn parse_batch_executed(log: &Log, block_number: u64) -> OrchestratorResult<BridgeEvent> {
    let batch_nonce = indexed_uint(log, 1)?.as_u64();
    let token = indexed_address(log, 2)?;
    let tokens = abi::decode(&[ParamType::Uint(256)], &log.data)
        .map_err(|e| OrchestratorError::EventParsing(e.to_string()))?;
    let event_nonce = uint_token(&tokens[0])?.as_u64();
    let tx_hash = log.transaction_hash.unwrap_or_default();

    Ok(BridgeEvent::BatchExecuted {
        batch_nonce,
        token,
        event_nonce,
        block_number,
        tx_hash,
    })
}

fn parse_valset_updated(log: &Log, block_number: u64) -> OrchestratorResult<BridgeEvent> {
    let valset_nonce = indexed_uint(log, 1)?.as_u64();
    let tokens = abi::decode(
        &[
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Address,
            ParamType::Array(Box::new(ParamType::Address)),
            ParamType::Array(Box::new(ParamType::Uint(256))),
        ],
        &log.data,
    )
    .map_err(|e| OrchestratorError::EventParsing(e.to_string()))?;

    let event_nonce = uint_token(&tokens[0])?.as_u64();
    let reward_amount = uint_token(&tokens[1])?;
    let reward_token = address_token(&tokens[2])?;
    let validators = match &tokens[3] {
        Token::Array(items) => items
            .iter()
            .map(address_token)
            .collect::<OrchestratorResult<Vec<_>>>()?,
        _ => return Err(OrchestratorError::EventParsing("bad validators array".into())),
    };
    let powers = match &tokens[4] {
        Token::Array(items) => items
            .iter()
            .map(|t| uint_token(t).map(|u| u.as_u64()))
            .collect::<OrchestratorResult<Vec<_>>>()?,
        _ => return Err(OrchestratorError::EventParsing("bad powers array".into())),
    };

    Ok(BridgeEvent::ValsetUpdated {
        valset_nonce,
        event_nonce,
        reward_amount,
        reward_token,
        validators,
        powers,
        block_number,
    })
}

fn parse_erc20_deployed(log: &Log, block_number: u64) -> OrchestratorResult<BridgeEvent> {
    let token_contract = indexed_address(log, 1)?;
    let tokens = abi::decode(
        &[
            ParamType::String,
            ParamType::String,
            ParamType::String,
            ParamType::Uint(8),
            ParamType::Uint(256),
        ],
        &log.data,
    )
    .map_err(|e| OrchestratorError::EventParsing(e.to_string()))?;

    Ok(BridgeEvent::Erc20Deployed {
        cosmos_denom: string_token(&tokens[0])?,
        token_contract,
        name: string_token(&tokens[1])?,
        symbol: string_token(&tokens[2])?,
        decimals: uint_token(&tokens[3])?.as_u32() as u8,
        event_nonce: uint_token(&tokens[4])?.as_u64(),
        block_number,
    })
}

fn uint_token(t: &Token) -> OrchestratorResult<U256> {
    match t {
        Token::Uint(u) => Ok(*u),
        _ => Err(OrchestratorError::EventParsing("expected uint".to_string())),
    }
}

fn address_token(t: &Token) -> OrchestratorResult<Address> {
    match t {
        Token::Address(a) => Ok(*a),
        _ => Err(OrchestratorError::EventParsing("expected address".to_string())),
    }
}

fn string_token(t: &Token) -> OrchestratorResult<String> {
    match t {
        Token::String(s) => Ok(s.clone()),
        _ => Err(OrchestratorError::EventParsing("expected string".to_string())),
    }
}

/// Merge per-type event lists into the single attestation stream, strictly
/// increasing by event nonce. Two events sharing a nonce cannot happen by
/// contract invariant, so a tie is unrecoverable.
pub fn merge_by_nonce(mut events: Vec<BridgeEvent>) -> OrchestratorResult<Vec<BridgeEvent>> {
    events.sort_by_key(|e| e.event_nonce());
    for pair in events.windows(2) {
        if pair[0].event_nonce() == pair[1].event_nonce() {
            return Err(OrchestratorError::Fatal(format!(
                "two bridge events share event nonce {}",
                pair[0].event_nonce()
            )));
        }
    }
    Ok(events)
}

/// Drop events already attested to, i.e. with nonce at or below the
/// sidechain's last observed event nonce.
pub fn filter_by_nonce(events: Vec<BridgeEvent>, last_observed: u64) -> Vec<BridgeEvent> {
    events
        .into_iter()
        .filter(|e| e.event_nonce() > last_observed)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{batch_executed_log, deposit_log};

    fn padded_address(addr: Address) -> H256 {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(addr.as_bytes());
        H256::from(word)
    }

    #[test]
    fn test_parse_deposit() {
        let erc20 = Address::from([0xaa; 20]);
        let sender = Address::from([0xbb; 20]);
        let destination = [0x11; 32];
        let log = deposit_log(erc20, sender, destination, 100, 5, 1000);

        let event = parse_log(&log).unwrap();
        match event {
            BridgeEvent::SendToCosmos {
                erc20: e,
                sender: s,
                destination: d,
                amount,
                event_nonce,
                block_number,
            } => {
                assert_eq!(e, erc20);
                assert_eq!(s, sender);
                assert_eq!(d, destination);
                assert_eq!(amount, U256::from(100));
                assert_eq!(event_nonce, 5);
                assert_eq!(block_number, 1000);
            }
            other => panic!("parsed wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_batch_executed() {
        let token = Address::from([0xcc; 20]);
        let log = batch_executed_log(7, token, 9, 1234);
        let event = parse_log(&log).unwrap();
        assert_eq!(event.event_nonce(), 9);
        assert_eq!(event.block_number(), 1234);
        match event {
            BridgeEvent::BatchExecuted {
                batch_nonce,
                token: t,
                ..
            } => {
                assert_eq!(batch_nonce, 7);
                assert_eq!(t, token);
            }
            other => panic!("parsed wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_valset_updated() {
        let validators = vec![Address::from([1u8; 20]), Address::from([2u8; 20])];
        let log = Log {
            address: Address::zero(),
            topics: vec![*topics::VALSET_UPDATED, H256::from_low_u64_be(42)],
            data: abi::encode(&[
                Token::Uint(U256::from(17u64)),
                Token::Uint(U256::zero()),
                Token::Address(Address::zero()),
                Token::Array(validators.iter().map(|a| Token::Address(*a)).collect()),
                Token::Array(vec![
                    Token::Uint(U256::from(3_000_000_000u64)),
                    Token::Uint(U256::from(1_294_967_295u64)),
                ]),
            ])
            .into(),
            block_number: Some(55.into()),
            ..Default::default()
        };

        match parse_log(&log).unwrap() {
            BridgeEvent::ValsetUpdated {
                valset_nonce,
                event_nonce,
                validators: v,
                powers,
                ..
            } => {
                assert_eq!(valset_nonce, 42);
                assert_eq!(event_nonce, 17);
                assert_eq!(v, validators);
                assert_eq!(powers, vec![3_000_000_000, 1_294_967_295]);
            }
            other => panic!("parsed wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_erc20_deployed() {
        let token = Address::from([0xee; 20]);
        let log = Log {
            address: Address::zero(),
            topics: vec![*topics::ERC20_DEPLOYED, padded_address(token)],
            data: abi::encode(&[
                Token::String("uatom".to_string()),
                Token::String("Cosmos Atom".to_string()),
                Token::String("ATOM".to_string()),
                Token::Uint(U256::from(6u64)),
                Token::Uint(U256::from(21u64)),
            ])
            .into(),
            block_number: Some(77.into()),
            ..Default::default()
        };

        match parse_log(&log).unwrap() {
            BridgeEvent::Erc20Deployed {
                cosmos_denom,
                token_contract,
                symbol,
                decimals,
                event_nonce,
                ..
            } => {
                assert_eq!(cosmos_denom, "uatom");
                assert_eq!(token_contract, token);
                assert_eq!(symbol, "ATOM");
                assert_eq!(decimals, 6);
                assert_eq!(event_nonce, 21);
            }
            other => panic!("parsed wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_merge_orders_by_nonce() {
        let a = parse_log(&deposit_log(
            Address::from([1; 20]),
            Address::from([2; 20]),
            [0; 32],
            10,
            8,
            100,
        ))
        .unwrap();
        let b = parse_log(&batch_executed_log(1, Address::from([3; 20]), 6, 99)).unwrap();
        let c = parse_log(&deposit_log(
            Address::from([1; 20]),
            Address::from([2; 20]),
            [0; 32],
            20,
            7,
            100,
        ))
        .unwrap();

        let merged = merge_by_nonce(vec![a, b, c]).unwrap();
        let nonces: Vec<u64> = merged.iter().map(|e| e.event_nonce()).collect();
        assert_eq!(nonces, vec![6, 7, 8]);
    }

    #[test]
    fn test_merge_rejects_duplicate_nonce() {
        let a = parse_log(&deposit_log(
            Address::from([1; 20]),
            Address::from([2; 20]),
            [0; 32],
            10,
            6,
            100,
        ))
        .unwrap();
        let b = parse_log(&batch_executed_log(1, Address::from([3; 20]), 6, 99)).unwrap();

        let err = merge_by_nonce(vec![a, b]).unwrap_err();
        assert!(matches!(err, OrchestratorError::Fatal(_)));
    }

    #[test]
    fn test_filter_by_nonce() {
        let events: Vec<BridgeEvent> = [3u64, 4, 5, 6]
            .iter()
            .map(|n| {
                parse_log(&deposit_log(
                    Address::from([1; 20]),
                    Address::from([2; 20]),
                    [0; 32],
                    1,
                    *n,
                    100,
                ))
                .unwrap()
            })
            .collect();

        let kept = filter_by_nonce(events, 4);
        let nonces: Vec<u64> = kept.iter().map(|e| e.event_nonce()).collect();
        assert_eq!(nonces, vec![5, 6]);
    }
}
