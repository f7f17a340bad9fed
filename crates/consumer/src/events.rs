//! On-chain event definitions and message decoding.
//!
//! Topic0 constants are derived from the `sol!` signatures so the registry
//! can never drift from the ABI. An unparsable log is logged and skipped;
//! the rest of the message still processes.

use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, Bytes, B256, U256};
use tracing::warn;

use vaultbridge_bus::{ChainMessage, MatchedLog};
use vaultbridge_core::TokenId;

sol! {
    /// ERC-721 / ERC-20 Transfer. Discriminated by topic count: the ERC-721
    /// variant indexes the token id (4 topics), ERC-20 carries the amount in
    /// data (3 topics).
    #[derive(Debug, PartialEq, Eq)]
    event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

    /// Vault deposit of an asset backing an NFT position.
    #[derive(Debug, PartialEq, Eq)]
    event Deposit(
        address indexed sender,
        address indexed asset,
        address vault,
        uint256 amount,
        uint256 tokenId
    );

    /// Withdrawal request awaiting ledger validation.
    #[derive(Debug, PartialEq, Eq)]
    event WithdrawRequest(
        address indexed sender,
        address indexed asset,
        uint256 amount,
        uint256 tokenId,
        bytes32 requestId
    );

    /// Completed withdrawal.
    #[derive(Debug, PartialEq, Eq)]
    event Withdraw(
        bytes32 indexed requestId,
        address indexed sender,
        address asset,
        uint256 amount
    );

    /// Cross-chain collateralized-borrow request.
    #[derive(Debug, PartialEq, Eq)]
    event CollateralRequest(
        bytes32 indexed requestId,
        uint256 indexed tokenId,
        address protocol,
        address asset,
        address sender,
        uint256 amount,
        uint256 deadline,
        bytes data,
        bytes signature
    );

    /// On-chain outcome of a collateral request.
    #[derive(Debug, PartialEq, Eq)]
    event CollateralProcess(bytes32 indexed requestId, uint8 status, bytes errorData);

    /// Loan repayment.
    #[derive(Debug, PartialEq, Eq)]
    event Repay(address indexed by, uint256 amount);
}

/// Topic0 of `Transfer(address,address,uint256)`.
pub const TRANSFER_TOPIC: B256 = Transfer::SIGNATURE_HASH;
/// Topic0 of the vault `Deposit` event.
pub const DEPOSIT_TOPIC: B256 = Deposit::SIGNATURE_HASH;
/// Topic0 of the vault `WithdrawRequest` event.
pub const WITHDRAW_REQUEST_TOPIC: B256 = WithdrawRequest::SIGNATURE_HASH;
/// Topic0 of the vault `Withdraw` event.
pub const WITHDRAW_TOPIC: B256 = Withdraw::SIGNATURE_HASH;
/// Topic0 of the relayer `CollateralRequest` event.
pub const COLLATERAL_REQUEST_TOPIC: B256 = CollateralRequest::SIGNATURE_HASH;
/// Topic0 of the relayer `CollateralProcess` event.
pub const COLLATERAL_PROCESS_TOPIC: B256 = CollateralProcess::SIGNATURE_HASH;
/// Topic0 of the relayer `Repay` event.
pub const REPAY_TOPIC: B256 = Repay::SIGNATURE_HASH;

/// An NFT ownership transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    /// Chain the transfer was observed on.
    pub chain_id: u64,
    /// Transaction hash.
    pub tx_hash: B256,
    /// Block number.
    pub block_number: u64,
    /// Block hash.
    pub block_hash: B256,
    /// NFT contract address.
    pub token_address: Address,
    /// Token id.
    pub token_id: TokenId,
    /// Previous owner (zero for mints).
    pub from: Address,
    /// New owner.
    pub to: Address,
    /// Log index within the block.
    pub log_index: u64,
    /// Block timestamp, seconds.
    pub timestamp: u64,
}

/// An ERC-20 transfer co-emitted in a matched transaction. Only used to
/// resolve the repaid asset for `Repay` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc20TransferEvent {
    /// Token contract.
    pub token: Address,
    /// Sender.
    pub from: Address,
    /// Recipient.
    pub to: Address,
    /// Raw amount.
    pub amount: U256,
}

/// Kind of a vault event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultEventKind {
    /// Asset deposited into a vault.
    Deposit,
    /// Withdrawal requested.
    WithdrawRequest,
    /// Withdrawal completed on chain.
    Withdraw,
}

impl VaultEventKind {
    /// Database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            VaultEventKind::Deposit => "DEPOSIT",
            VaultEventKind::WithdrawRequest => "WITHDRAW_REQUEST",
            VaultEventKind::Withdraw => "WITHDRAW",
        }
    }
}

/// A decoded vault event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultEvent {
    /// Event kind.
    pub kind: VaultEventKind,
    /// Chain id.
    pub chain_id: u64,
    /// Transaction hash.
    pub tx_hash: B256,
    /// Log index within the block.
    pub log_index: u64,
    /// Acting wallet.
    pub sender: Address,
    /// Asset address.
    pub asset: Address,
    /// Vault address (zero when the event does not carry one).
    pub vault: Address,
    /// Raw asset amount.
    pub amount: U256,
    /// NFT position the vault backs.
    pub token_id: TokenId,
    /// Request id for withdraw request/completion.
    pub request_id: Option<B256>,
    /// Block timestamp, seconds.
    pub timestamp: u64,
}

/// Kind of a relayer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayerEventKind {
    /// A borrow request against NFT collateral.
    CollateralRequest,
    /// The on-chain processing outcome of a request.
    CollateralProcess,
    /// A repayment.
    Repay,
}

impl RelayerEventKind {
    /// Database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayerEventKind::CollateralRequest => "COLLATERAL_REQUEST",
            RelayerEventKind::CollateralProcess => "COLLATERAL_PROCESS",
            RelayerEventKind::Repay => "REPAY",
        }
    }
}

/// A decoded relayer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayerEvent {
    /// Event kind.
    pub kind: RelayerEventKind,
    /// Request id; zero-filled for repayments, which carry none.
    pub request_id: B256,
    /// Chain id.
    pub chain_id: u64,
    /// Transaction hash.
    pub tx_hash: B256,
    /// Log index within the block.
    pub log_index: u64,
    /// NFT position (collateral requests only).
    pub token_id: Option<TokenId>,
    /// Lending protocol address (collateral requests only).
    pub protocol: Option<Address>,
    /// Asset address (collateral requests only).
    pub asset: Option<Address>,
    /// Acting wallet.
    pub sender: Address,
    /// Raw amount.
    pub amount: U256,
    /// Request deadline, unix seconds (collateral requests only).
    pub deadline: Option<u64>,
    /// Opaque request payload.
    pub data: Bytes,
    /// Request signature.
    pub signature: Bytes,
    /// Processing status byte (collateral process only): 1 = approved.
    pub process_status: Option<u8>,
    /// Error payload carried by a rejection.
    pub error_data: Option<Bytes>,
    /// Block timestamp, seconds.
    pub timestamp: u64,
}

/// Any event the consumer reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// NFT ownership transition.
    Transfer(TransferEvent),
    /// Co-emitted ERC-20 transfer (repay asset resolution).
    Erc20Transfer(Erc20TransferEvent),
    /// Vault deposit/withdraw activity.
    Vault(VaultEvent),
    /// Relayer borrow lifecycle activity.
    Relayer(RelayerEvent),
}

/// Decode all recognizable events from a message, in log order.
///
/// Unknown topics are ignored; a log that fails to decode is logged and
/// skipped without affecting its siblings.
pub fn decode_message(message: &ChainMessage) -> Vec<PipelineEvent> {
    let tx = &message.transaction;
    let mut events = Vec::new();

    for log in &tx.logs {
        match decode_log(message, log) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    chain_id = tx.chain_id,
                    tx = %tx.hash,
                    log_index = log.log_index,
                    error = %e,
                    "Undecodable event log, skipping"
                );
            }
        }
    }

    events
}

fn decode_log(message: &ChainMessage, log: &MatchedLog) -> anyhow::Result<Option<PipelineEvent>> {
    let tx = &message.transaction;
    let Some(topic0) = log.topics.first().copied() else {
        return Ok(None);
    };

    let data = hex::decode(log.data.trim_start_matches("0x"))?;
    let raw = alloy_primitives::Log::new_unchecked(
        log.address,
        log.topics.clone(),
        Bytes::from(data),
    );

    let event = if topic0 == TRANSFER_TOPIC {
        match log.topics.len() {
            // ERC-721: token id is the third indexed topic
            4 => {
                let decoded = Transfer::decode_log(&raw, true)?.data;
                Some(PipelineEvent::Transfer(TransferEvent {
                    chain_id: tx.chain_id,
                    tx_hash: tx.hash,
                    block_number: tx.block_number,
                    block_hash: tx.block_hash,
                    token_address: log.address,
                    token_id: TokenId::from(decoded.tokenId),
                    from: decoded.from,
                    to: decoded.to,
                    log_index: log.log_index,
                    timestamp: tx.timestamp,
                }))
            }
            // ERC-20: amount lives in the data segment
            3 => {
                let from = Address::from_word(log.topics[1]);
                let to = Address::from_word(log.topics[2]);
                let amount = U256::from_be_slice(raw.data.data.as_ref());
                Some(PipelineEvent::Erc20Transfer(Erc20TransferEvent {
                    token: log.address,
                    from,
                    to,
                    amount,
                }))
            }
            _ => None,
        }
    } else if topic0 == DEPOSIT_TOPIC {
        let decoded = Deposit::decode_log(&raw, true)?.data;
        Some(PipelineEvent::Vault(VaultEvent {
            kind: VaultEventKind::Deposit,
            chain_id: tx.chain_id,
            tx_hash: tx.hash,
            log_index: log.log_index,
            sender: decoded.sender,
            asset: decoded.asset,
            vault: decoded.vault,
            amount: decoded.amount,
            token_id: TokenId::from(decoded.tokenId),
            request_id: None,
            timestamp: tx.timestamp,
        }))
    } else if topic0 == WITHDRAW_REQUEST_TOPIC {
        let decoded = WithdrawRequest::decode_log(&raw, true)?.data;
        Some(PipelineEvent::Vault(VaultEvent {
            kind: VaultEventKind::WithdrawRequest,
            chain_id: tx.chain_id,
            tx_hash: tx.hash,
            log_index: log.log_index,
            sender: decoded.sender,
            asset: decoded.asset,
            vault: Address::ZERO,
            amount: decoded.amount,
            token_id: TokenId::from(decoded.tokenId),
            request_id: Some(decoded.requestId),
            timestamp: tx.timestamp,
        }))
    } else if topic0 == WITHDRAW_TOPIC {
        let decoded = Withdraw::decode_log(&raw, true)?.data;
        Some(PipelineEvent::Vault(VaultEvent {
            kind: VaultEventKind::Withdraw,
            chain_id: tx.chain_id,
            tx_hash: tx.hash,
            log_index: log.log_index,
            sender: decoded.sender,
            asset: decoded.asset,
            vault: Address::ZERO,
            amount: decoded.amount,
            token_id: TokenId::from(U256::ZERO),
            request_id: Some(decoded.requestId),
            timestamp: tx.timestamp,
        }))
    } else if topic0 == COLLATERAL_REQUEST_TOPIC {
        let decoded = CollateralRequest::decode_log(&raw, true)?.data;
        Some(PipelineEvent::Relayer(RelayerEvent {
            kind: RelayerEventKind::CollateralRequest,
            request_id: decoded.requestId,
            chain_id: tx.chain_id,
            tx_hash: tx.hash,
            log_index: log.log_index,
            token_id: Some(TokenId::from(decoded.tokenId)),
            protocol: Some(decoded.protocol),
            asset: Some(decoded.asset),
            sender: decoded.sender,
            amount: decoded.amount,
            deadline: Some(decoded.deadline.saturating_to::<u64>()),
            data: decoded.data.clone(),
            signature: decoded.signature.clone(),
            process_status: None,
            error_data: None,
            timestamp: tx.timestamp,
        }))
    } else if topic0 == COLLATERAL_PROCESS_TOPIC {
        let decoded = CollateralProcess::decode_log(&raw, true)?.data;
        Some(PipelineEvent::Relayer(RelayerEvent {
            kind: RelayerEventKind::CollateralProcess,
            request_id: decoded.requestId,
            chain_id: tx.chain_id,
            tx_hash: tx.hash,
            log_index: log.log_index,
            token_id: None,
            protocol: None,
            asset: None,
            sender: tx.from,
            amount: U256::ZERO,
            deadline: None,
            data: Bytes::new(),
            signature: Bytes::new(),
            process_status: Some(decoded.status),
            error_data: Some(decoded.errorData.clone()),
            timestamp: tx.timestamp,
        }))
    } else if topic0 == REPAY_TOPIC {
        let decoded = Repay::decode_log(&raw, true)?.data;
        Some(PipelineEvent::Relayer(RelayerEvent {
            kind: RelayerEventKind::Repay,
            request_id: B256::ZERO,
            chain_id: tx.chain_id,
            tx_hash: tx.hash,
            log_index: log.log_index,
            token_id: None,
            protocol: None,
            asset: None,
            sender: decoded.by,
            amount: decoded.amount,
            deadline: None,
            data: Bytes::new(),
            signature: Bytes::new(),
            process_status: None,
            error_data: None,
            timestamp: tx.timestamp,
        }))
    } else {
        None
    };

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolValue;
    use alloy_primitives::{address, b256};
    use vaultbridge_bus::FilteredTransaction;

    fn message_with_logs(logs: Vec<MatchedLog>) -> ChainMessage {
        ChainMessage::from_transaction(FilteredTransaction {
            chain_id: 1,
            chain_name: "test".to_string(),
            block_hash: b256!("1111111111111111111111111111111111111111111111111111111111111111"),
            block_number: 100,
            hash: b256!("2222222222222222222222222222222222222222222222222222222222222222"),
            from: address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            to: Some(address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")),
            value: U256::ZERO,
            data: Some("0x".to_string()),
            status: Some(true),
            gas_used: None,
            gas_price: None,
            matched_topics: logs.iter().filter_map(|l| l.topics.first().copied()).collect(),
            logs,
            timestamp: 1_700_000_000,
        })
    }

    fn encode_hex(data: &[u8]) -> String {
        format!("0x{}", hex::encode(data))
    }

    #[test]
    fn test_transfer_topic_matches_known_erc721_signature() {
        // The canonical ERC-721/ERC-20 Transfer topic
        assert_eq!(TRANSFER_TOPIC, vaultbridge_core::ERC721_TRANSFER_TOPIC);
    }

    #[test]
    fn test_decode_erc721_transfer() {
        let owner = address!("1111111111111111111111111111111111111111");
        let log = MatchedLog {
            address: address!("5555555555555555555555555555555555555555"),
            topics: vec![
                TRANSFER_TOPIC,
                B256::ZERO,
                owner.into_word(),
                B256::from(U256::from(7u64)),
            ],
            data: "0x".to_string(),
            log_index: 3,
        };

        let events = decode_message(&message_with_logs(vec![log]));
        assert_eq!(events.len(), 1);
        match &events[0] {
            PipelineEvent::Transfer(t) => {
                assert_eq!(t.from, Address::ZERO);
                assert_eq!(t.to, owner);
                assert_eq!(t.token_id, TokenId::from(7u64));
                assert_eq!(t.block_number, 100);
                assert_eq!(t.log_index, 3);
            }
            other => panic!("expected Transfer, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_erc20_transfer_by_topic_count() {
        let from = address!("1111111111111111111111111111111111111111");
        let to = address!("2222222222222222222222222222222222222222");
        let amount = U256::from(1_500_000u64);
        let log = MatchedLog {
            address: address!("dddddddddddddddddddddddddddddddddddddddd"),
            topics: vec![TRANSFER_TOPIC, from.into_word(), to.into_word()],
            data: encode_hex(&amount.to_be_bytes::<32>()),
            log_index: 0,
        };

        let events = decode_message(&message_with_logs(vec![log]));
        assert_eq!(events.len(), 1);
        match &events[0] {
            PipelineEvent::Erc20Transfer(t) => {
                assert_eq!(t.from, from);
                assert_eq!(t.to, to);
                assert_eq!(t.amount, amount);
            }
            other => panic!("expected Erc20Transfer, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_deposit() {
        let sender = address!("1111111111111111111111111111111111111111");
        let asset = address!("2222222222222222222222222222222222222222");
        let vault = address!("3333333333333333333333333333333333333333");
        let amount = U256::from(10u64).pow(U256::from(18u64));
        let token_id = U256::from(42u64);

        let body = (vault, amount, token_id).abi_encode();
        let log = MatchedLog {
            address: vault,
            topics: vec![DEPOSIT_TOPIC, sender.into_word(), asset.into_word()],
            data: encode_hex(&body),
            log_index: 1,
        };

        let events = decode_message(&message_with_logs(vec![log]));
        assert_eq!(events.len(), 1);
        match &events[0] {
            PipelineEvent::Vault(v) => {
                assert_eq!(v.kind, VaultEventKind::Deposit);
                assert_eq!(v.sender, sender);
                assert_eq!(v.asset, asset);
                assert_eq!(v.vault, vault);
                assert_eq!(v.amount, amount);
                assert_eq!(v.token_id, TokenId::from(42u64));
            }
            other => panic!("expected Vault, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_withdraw_request_and_completion() {
        let sender = address!("1111111111111111111111111111111111111111");
        let asset = address!("2222222222222222222222222222222222222222");
        let request_id =
            b256!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

        let req_body = (U256::from(300u64), U256::from(1u64), request_id).abi_encode();
        let request = MatchedLog {
            address: asset,
            topics: vec![WITHDRAW_REQUEST_TOPIC, sender.into_word(), asset.into_word()],
            data: encode_hex(&req_body),
            log_index: 0,
        };

        let done_body = (asset, U256::from(300u64)).abi_encode();
        let done = MatchedLog {
            address: asset,
            topics: vec![WITHDRAW_TOPIC, request_id, sender.into_word()],
            data: encode_hex(&done_body),
            log_index: 1,
        };

        let events = decode_message(&message_with_logs(vec![request, done]));
        assert_eq!(events.len(), 2);

        match (&events[0], &events[1]) {
            (PipelineEvent::Vault(req), PipelineEvent::Vault(fin)) => {
                assert_eq!(req.kind, VaultEventKind::WithdrawRequest);
                assert_eq!(req.request_id, Some(request_id));
                assert_eq!(fin.kind, VaultEventKind::Withdraw);
                assert_eq!(fin.request_id, Some(request_id));
                assert_eq!(fin.asset, asset);
            }
            other => panic!("expected two vault events, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_collateral_request() {
        let request_id =
            b256!("cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc");
        let protocol = address!("4444444444444444444444444444444444444444");
        let asset = address!("2222222222222222222222222222222222222222");
        let sender = address!("1111111111111111111111111111111111111111");

        let body = (
            protocol,
            asset,
            sender,
            U256::from(200u64),
            U256::from(1_800_000_000u64),
            Bytes::from(vec![0x01, 0x02]),
            Bytes::from(vec![0x03]),
        )
            .abi_encode();
        let log = MatchedLog {
            address: protocol,
            topics: vec![
                COLLATERAL_REQUEST_TOPIC,
                request_id,
                B256::from(U256::from(9u64)),
            ],
            data: encode_hex(&body),
            log_index: 0,
        };

        let events = decode_message(&message_with_logs(vec![log]));
        assert_eq!(events.len(), 1);
        match &events[0] {
            PipelineEvent::Relayer(r) => {
                assert_eq!(r.kind, RelayerEventKind::CollateralRequest);
                assert_eq!(r.request_id, request_id);
                assert_eq!(r.token_id, Some(TokenId::from(9u64)));
                assert_eq!(r.protocol, Some(protocol));
                assert_eq!(r.deadline, Some(1_800_000_000));
                assert_eq!(r.data.as_ref(), &[0x01, 0x02]);
            }
            other => panic!("expected Relayer, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_collateral_process_and_repay() {
        let request_id =
            b256!("cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc");
        let by = address!("1111111111111111111111111111111111111111");

        let process_body = (1u8, Bytes::new()).abi_encode();
        let process = MatchedLog {
            address: Address::ZERO,
            topics: vec![COLLATERAL_PROCESS_TOPIC, request_id],
            data: encode_hex(&process_body),
            log_index: 0,
        };

        let repay_body = (U256::from(150u64),).abi_encode();
        let repay = MatchedLog {
            address: Address::ZERO,
            topics: vec![REPAY_TOPIC, by.into_word()],
            data: encode_hex(&repay_body),
            log_index: 1,
        };

        let events = decode_message(&message_with_logs(vec![process, repay]));
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (PipelineEvent::Relayer(p), PipelineEvent::Relayer(r)) => {
                assert_eq!(p.kind, RelayerEventKind::CollateralProcess);
                assert_eq!(p.process_status, Some(1));
                assert_eq!(r.kind, RelayerEventKind::Repay);
                assert_eq!(r.sender, by);
                assert_eq!(r.amount, U256::from(150u64));
            }
            other => panic!("expected two relayer events, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_topic_ignored_and_bad_log_skipped() {
        let unknown = MatchedLog {
            address: Address::ZERO,
            topics: vec![b256!(
                "00000000000000000000000000000000000000000000000000000000000000aa"
            )],
            data: "0x".to_string(),
            log_index: 0,
        };
        // Deposit topic with truncated data fails decoding and is skipped
        let broken = MatchedLog {
            address: Address::ZERO,
            topics: vec![
                DEPOSIT_TOPIC,
                Address::ZERO.into_word(),
                Address::ZERO.into_word(),
            ],
            data: "0x01".to_string(),
            log_index: 1,
        };

        let events = decode_message(&message_with_logs(vec![unknown, broken]));
        assert!(events.is_empty());
    }
}
