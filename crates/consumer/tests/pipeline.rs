//! End-to-end consumer pipeline: messages arrive on the bus, events decode,
//! the ownership tree and the collateral ledger advance together.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::sol_types::SolValue;
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;

use vaultbridge_bus::{
    ChainMessage, FilteredTransaction, InMemoryBus, MatchedLog, MessagePublisher,
    MessageSubscriber, WireMessage,
};
use vaultbridge_consumer::config::{AssetConfig, AssetTable};
use vaultbridge_consumer::events::{
    COLLATERAL_PROCESS_TOPIC, COLLATERAL_REQUEST_TOPIC, DEPOSIT_TOPIC, REPAY_TOPIC, TRANSFER_TOPIC,
    WITHDRAW_REQUEST_TOPIC, WITHDRAW_TOPIC,
};
use vaultbridge_consumer::storage::WithdrawalStatus;
use vaultbridge_consumer::{Ledger, LendingPool, MerkleEngine, RelayerClient, StaticPriceOracle, Storage};
use vaultbridge_core::{TokenId, UsdValue};

const CHAIN: u64 = 1;
const CHANNEL: &str = "vaultbridge:events";

fn user() -> Address {
    Address::from([0xaa; 20])
}

fn weth() -> Address {
    Address::from([0x11; 20])
}

fn usdc() -> Address {
    Address::from([0x22; 20])
}

fn nft_contract() -> Address {
    Address::from([0x10; 20])
}

fn protocol() -> Address {
    Address::from([0x44; 20])
}

fn handler() -> Address {
    Address::from([0x55; 20])
}

/// Records every write the ledger drives on chain.
#[derive(Default)]
struct RecordingRelayer {
    approvals: Mutex<Vec<(B256, bool)>>,
    roots: Mutex<Vec<B256>>,
    withdraw_proofs: Mutex<Vec<Vec<B256>>>,
}

#[async_trait]
impl RelayerClient for RecordingRelayer {
    async fn submit_root(&self, _chain_id: u64, root: B256) -> anyhow::Result<()> {
        self.roots.lock().push(root);
        Ok(())
    }

    async fn process_request(
        &self,
        _chain_id: u64,
        request_id: B256,
        approved: bool,
    ) -> anyhow::Result<()> {
        self.approvals.lock().push((request_id, approved));
        Ok(())
    }

    async fn complete_withdraw(
        &self,
        _chain_id: u64,
        _handler: Address,
        _request_id: B256,
        proof: Vec<B256>,
        _additional_data: Bytes,
    ) -> anyhow::Result<()> {
        self.withdraw_proofs.lock().push(proof);
        Ok(())
    }
}

struct ZeroUtilization;

#[async_trait]
impl LendingPool for ZeroUtilization {
    async fn utilization(
        &self,
        _chain_id: u64,
        _protocol: Address,
        _token_id: &TokenId,
    ) -> anyhow::Result<u64> {
        Ok(0)
    }
}

fn asset_table() -> AssetTable {
    AssetTable::new(vec![
        AssetConfig {
            chain_id: CHAIN,
            symbol: "WETH".to_string(),
            address: weth(),
            decimals: 18,
            ltv_percent: Some(75),
            unit_price_usd: bigdecimal::BigDecimal::from(1000),
        },
        AssetConfig {
            chain_id: CHAIN,
            symbol: "USDC".to_string(),
            address: usdc(),
            decimals: 6,
            ltv_percent: Some(80),
            unit_price_usd: bigdecimal::BigDecimal::from(1),
        },
    ])
}

struct Pipeline {
    ledger: Arc<Ledger>,
    storage: Storage,
    relayer: Arc<RecordingRelayer>,
    _db: tempfile::NamedTempFile,
}

async fn pipeline() -> Pipeline {
    let db = tempfile::NamedTempFile::new().unwrap();
    let storage = Storage::new_with_path(db.path(), None, None).await.unwrap();
    storage.run_migrations().await.unwrap();

    let relayer = Arc::new(RecordingRelayer::default());
    let merkle = Arc::new(MerkleEngine::new(
        storage.clone(),
        relayer.clone(),
        vec![CHAIN],
    ));
    merkle.initialize().await.unwrap();

    let ledger = Arc::new(Ledger::new(
        storage.clone(),
        merkle,
        Arc::new(StaticPriceOracle::new(asset_table())),
        relayer.clone(),
        Arc::new(ZeroUtilization),
        asset_table(),
        HashMap::from([(CHAIN, handler())]),
        false,
    ));

    Pipeline {
        ledger,
        storage,
        relayer,
        _db: db,
    }
}

fn message(block: u64, tx_seed: u8, logs: Vec<MatchedLog>) -> ChainMessage {
    ChainMessage::from_transaction(FilteredTransaction {
        chain_id: CHAIN,
        chain_name: "mainnet".to_string(),
        block_hash: B256::from([block as u8; 32]),
        block_number: block,
        hash: B256::from([tx_seed; 32]),
        from: user(),
        to: Some(nft_contract()),
        value: U256::ZERO,
        data: Some("0x23b872dd".to_string()),
        status: Some(true),
        gas_used: Some(U256::from(90_000u64)),
        gas_price: None,
        matched_topics: logs.iter().filter_map(|l| l.topics.first().copied()).collect(),
        logs,
        timestamp: 1_700_000_000 + block,
    })
}

fn hex_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn mint_log(token: u64, to: Address, log_index: u64) -> MatchedLog {
    MatchedLog {
        address: nft_contract(),
        topics: vec![
            TRANSFER_TOPIC,
            B256::ZERO,
            to.into_word(),
            B256::from(U256::from(token)),
        ],
        data: "0x".to_string(),
        log_index,
    }
}

fn deposit_log(asset: Address, amount: U256, token: u64, log_index: u64) -> MatchedLog {
    let body = (Address::from([0x66; 20]), amount, U256::from(token)).abi_encode();
    MatchedLog {
        address: Address::from([0x66; 20]),
        topics: vec![DEPOSIT_TOPIC, user().into_word(), asset.into_word()],
        data: hex_data(&body),
        log_index,
    }
}

fn usdc_units(whole: u64) -> U256 {
    U256::from(whole) * U256::from(1_000_000u64)
}

fn eth_units(whole: u64) -> U256 {
    U256::from(whole) * U256::from(10u64).pow(U256::from(18u64))
}

#[tokio::test]
async fn test_full_saga_over_the_bus() {
    let p = pipeline().await;
    let wallet = format!("{:#x}", user());
    let token = 7u64;

    // Wire the ledger behind a real bus subscription
    let bus = Arc::new(InMemoryBus::new());
    MessagePublisher::connect(bus.as_ref()).await.unwrap();
    let mut subscription = MessageSubscriber::subscribe(bus.as_ref(), CHANNEL)
        .await
        .unwrap();

    // Block 100: mint the position NFT; block 101: deposit 1 WETH ($1000)
    bus.publish(CHANNEL, message(100, 1, vec![mint_log(token, user(), 0)]))
        .await
        .unwrap();
    bus.publish(
        CHANNEL,
        message(101, 2, vec![deposit_log(weth(), eth_units(1), token, 0)]),
    )
    .await
    .unwrap();

    for _ in 0..2 {
        let msg = subscription.recv().await.unwrap();
        p.ledger.handle_message(&msg).await.unwrap();
    }

    // The mint produced and submitted a root
    assert!(!p.relayer.roots.lock().is_empty());

    let user_row = p.storage.get_user(&wallet).await.unwrap().unwrap();
    assert_eq!(user_row.total_usd_balance, UsdValue::from_dollars(1000));

    // Block 102: request a 300 USDC withdrawal
    let request_id = B256::from([0x90; 32]);
    let req_body = (usdc_units(300), U256::from(token), request_id).abi_encode();
    let withdraw_request = MatchedLog {
        address: Address::from([0x66; 20]),
        topics: vec![
            WITHDRAW_REQUEST_TOPIC,
            user().into_word(),
            usdc().into_word(),
        ],
        data: hex_data(&req_body),
        log_index: 0,
    };
    bus.publish(CHANNEL, message(102, 3, vec![withdraw_request]))
        .await
        .unwrap();
    let msg = subscription.recv().await.unwrap();
    p.ledger.handle_message(&msg).await.unwrap();

    let user_row = p.storage.get_user(&wallet).await.unwrap().unwrap();
    assert_eq!(user_row.floating_usd_balance, UsdValue::from_dollars(700));
    // completeWithdraw carried a proof (or [root])
    assert!(!p.relayer.withdraw_proofs.lock()[0].is_empty());

    // Block 103: withdrawal completes on chain
    let done_body = (usdc(), usdc_units(300)).abi_encode();
    let withdraw_done = MatchedLog {
        address: Address::from([0x66; 20]),
        topics: vec![WITHDRAW_TOPIC, request_id, user().into_word()],
        data: hex_data(&done_body),
        log_index: 0,
    };
    bus.publish(CHANNEL, message(103, 4, vec![withdraw_done]))
        .await
        .unwrap();
    let msg = subscription.recv().await.unwrap();
    p.ledger.handle_message(&msg).await.unwrap();

    let user_row = p.storage.get_user(&wallet).await.unwrap().unwrap();
    assert_eq!(user_row.total_usd_balance, UsdValue::from_dollars(700));
    assert_eq!(user_row.floating_usd_balance, UsdValue::from_dollars(700));
    assert_eq!(
        p.storage
            .withdrawals_usd_total(&wallet, WithdrawalStatus::Completed)
            .await
            .unwrap(),
        UsdValue::from_dollars(300)
    );

    // Block 104: borrow 200 USDC against the position
    let borrow_request_id = B256::from([0x91; 32]);
    let borrow_body = (
        protocol(),
        usdc(),
        user(),
        usdc_units(200),
        U256::from(2_000_000_000u64),
        Bytes::new(),
        Bytes::new(),
    )
        .abi_encode();
    let borrow_request = MatchedLog {
        address: protocol(),
        topics: vec![
            COLLATERAL_REQUEST_TOPIC,
            borrow_request_id,
            B256::from(U256::from(token)),
        ],
        data: hex_data(&borrow_body),
        log_index: 0,
    };
    bus.publish(CHANNEL, message(104, 5, vec![borrow_request]))
        .await
        .unwrap();
    let msg = subscription.recv().await.unwrap();
    p.ledger.handle_message(&msg).await.unwrap();

    assert_eq!(
        p.relayer.approvals.lock().as_slice(),
        &[(borrow_request_id, true)]
    );

    // Block 105: the on-chain approval ack
    let process_body = (1u8, Bytes::new()).abi_encode();
    let process = MatchedLog {
        address: protocol(),
        topics: vec![COLLATERAL_PROCESS_TOPIC, borrow_request_id],
        data: hex_data(&process_body),
        log_index: 0,
    };
    bus.publish(CHANNEL, message(105, 6, vec![process]))
        .await
        .unwrap();
    let msg = subscription.recv().await.unwrap();
    p.ledger.handle_message(&msg).await.unwrap();

    let user_row = p.storage.get_user(&wallet).await.unwrap().unwrap();
    assert_eq!(user_row.borrowed_usd_amount, UsdValue::from_dollars(200));
    assert_eq!(user_row.floating_usd_balance, UsdValue::from_dollars(500));

    // Block 106: repay in full; the ERC-20 transfer in the same tx names the asset
    let repay_body = (usdc_units(200),).abi_encode();
    let repay = MatchedLog {
        address: protocol(),
        topics: vec![REPAY_TOPIC, user().into_word()],
        data: hex_data(&repay_body),
        log_index: 1,
    };
    let erc20 = MatchedLog {
        address: usdc(),
        topics: vec![TRANSFER_TOPIC, user().into_word(), protocol().into_word()],
        data: hex_data(&usdc_units(200).to_be_bytes::<32>()),
        log_index: 0,
    };
    bus.publish(CHANNEL, message(106, 7, vec![erc20, repay]))
        .await
        .unwrap();
    let msg = subscription.recv().await.unwrap();
    p.ledger.handle_message(&msg).await.unwrap();

    let user_row = p.storage.get_user(&wallet).await.unwrap().unwrap();
    assert!(user_row.borrowed_usd_amount.is_zero());
    assert_eq!(user_row.floating_usd_balance, UsdValue::from_dollars(700));
    assert!(p.storage.active_borrows(&wallet).await.unwrap().is_empty());

    // Invariant holds at the end of the saga
    let pending = p
        .storage
        .withdrawals_usd_total(&wallet, WithdrawalStatus::Pending)
        .await
        .unwrap();
    let expected = user_row.total_usd_balance.clone() - &user_row.borrowed_usd_amount - &pending;
    assert_eq!(user_row.floating_usd_balance, expected);
}

#[tokio::test]
async fn test_legacy_wire_shape_feeds_the_same_pipeline() {
    let p = pipeline().await;

    // A legacy flat payload carrying a deposit log
    let body = (Address::from([0x66; 20]), usdc_units(100), U256::from(9u64)).abi_encode();
    let payload = serde_json::json!({
        "transaction": {
            "blockHash": format!("{:?}", B256::from([0x01; 32])),
            "blockNumber": 200,
            "hash": format!("{:?}", B256::from([0x02; 32])),
            "from": format!("{:?}", user()),
            "value": "0",
            "data": "0x",
            "chainId": CHAIN,
            "chainName": "mainnet",
            "topics": [],
            "logs": [{
                "address": format!("{:?}", Address::from([0x66; 20])),
                "topics": [
                    format!("{:?}", DEPOSIT_TOPIC),
                    format!("{:?}", user().into_word()),
                    format!("{:?}", usdc().into_word()),
                ],
                "data": hex_data(&body),
                "logIndex": 0
            }]
        },
        "timestamp": 1_700_000_500u64,
        "topics": [format!("{:?}", DEPOSIT_TOPIC)]
    });

    let wire = WireMessage::from_json(&payload.to_string()).unwrap();
    let message = wire.normalize();
    p.ledger.handle_message(&message).await.unwrap();

    let wallet = format!("{:#x}", user());
    let user_row = p.storage.get_user(&wallet).await.unwrap().unwrap();
    assert_eq!(user_row.total_usd_balance, UsdValue::from_dollars(100));
}

#[tokio::test]
async fn test_producer_republish_is_idempotent() {
    let p = pipeline().await;
    let msg = message(
        100,
        1,
        vec![deposit_log(usdc(), usdc_units(50), 3, 0)],
    );

    p.ledger.handle_message(&msg).await.unwrap();
    // Producer recovery re-publishes the same transaction
    p.ledger.handle_message(&msg).await.unwrap();

    let wallet = format!("{:#x}", user());
    let user_row = p.storage.get_user(&wallet).await.unwrap().unwrap();
    assert_eq!(user_row.total_usd_balance, UsdValue::from_dollars(50));
}
