//! Database types for the consumer storage layer.

use alloy_primitives::{Address, B256, U256};
use vaultbridge_core::{TokenId, UsdValue};

/// A stored NFT transfer observation.
///
/// Once `included_in_merkle` is set, `merkle_root` is immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftTransfer {
    /// Row id.
    pub id: i64,
    /// Chain the transfer was observed on.
    pub chain_id: u64,
    /// Transaction hash (unique).
    pub tx_hash: B256,
    /// Block number.
    pub block_number: u64,
    /// Block hash.
    pub block_hash: B256,
    /// NFT contract address, lowercase.
    pub token_address: String,
    /// Token id.
    pub token_id: TokenId,
    /// Previous owner, lowercase.
    pub from: String,
    /// New owner, lowercase.
    pub to: String,
    /// Log index within the block (snapshot tie-break).
    pub log_index: u64,
    /// Block timestamp, seconds.
    pub timestamp: u64,
    /// Whether a Merkle root has been built over this transfer.
    pub included_in_merkle: bool,
    /// The root that first covered this transfer.
    pub merkle_root: Option<B256>,
}

/// Withdrawal lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawalStatus {
    /// Validated, awaiting on-chain completion.
    Pending,
    /// Completed on chain.
    Completed,
    /// Rejected by the availability check.
    Rejected,
}

impl WithdrawalStatus {
    /// Database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "PENDING",
            WithdrawalStatus::Completed => "COMPLETED",
            WithdrawalStatus::Rejected => "REJECTED",
        }
    }
}

impl std::str::FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(WithdrawalStatus::Pending),
            "COMPLETED" => Ok(WithdrawalStatus::Completed),
            "REJECTED" => Ok(WithdrawalStatus::Rejected),
            _ => Err(format!("Unknown withdrawal status: {s}")),
        }
    }
}

/// Borrow lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowStatus {
    /// Outstanding.
    Active,
    /// Fully repaid.
    Repaid,
}

impl BorrowStatus {
    /// Database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BorrowStatus::Active => "ACTIVE",
            BorrowStatus::Repaid => "REPAID",
        }
    }
}

impl std::str::FromStr for BorrowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(BorrowStatus::Active),
            "REPAID" => Ok(BorrowStatus::Repaid),
            _ => Err(format!("Unknown borrow status: {s}")),
        }
    }
}

/// Relayer event lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayerEventStatus {
    /// Awaiting validation/processing.
    Pending,
    /// Approved on chain.
    Approved,
    /// Rejected (validation or on-chain).
    Rejected,
}

impl RelayerEventStatus {
    /// Database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayerEventStatus::Pending => "PENDING",
            RelayerEventStatus::Approved => "APPROVED",
            RelayerEventStatus::Rejected => "REJECTED",
        }
    }
}

impl std::str::FromStr for RelayerEventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RelayerEventStatus::Pending),
            "APPROVED" => Ok(RelayerEventStatus::Approved),
            "REJECTED" => Ok(RelayerEventStatus::Rejected),
            _ => Err(format!("Unknown relayer event status: {s}")),
        }
    }
}

/// A ledger user.
///
/// Invariant: `floating = total − borrowed − Σ pending withdrawals`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Wallet address, lowercase (unique).
    pub wallet_address: String,
    /// Total USD deposited minus completed withdrawals.
    pub total_usd_balance: UsdValue,
    /// Freely available USD.
    pub floating_usd_balance: UsdValue,
    /// Outstanding borrowed USD.
    pub borrowed_usd_amount: UsdValue,
}

/// A recorded deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    /// Row id.
    pub id: i64,
    /// Chain id.
    pub chain_id: u64,
    /// Transaction hash.
    pub tx_hash: B256,
    /// Depositing wallet, lowercase.
    pub sender: String,
    /// Asset address, lowercase.
    pub asset: String,
    /// Vault address, lowercase.
    pub vault: String,
    /// Raw asset amount.
    pub amount: U256,
    /// NFT position backing the deposit.
    pub token_id: TokenId,
    /// USD value at deposit time.
    pub usd_value: UsdValue,
    /// Block timestamp, seconds.
    pub timestamp: u64,
}

/// A recorded withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawal {
    /// Row id.
    pub id: i64,
    /// Chain id.
    pub chain_id: u64,
    /// On-chain request id.
    pub request_id: B256,
    /// Withdrawing wallet, lowercase.
    pub sender: String,
    /// Asset address, lowercase.
    pub asset: String,
    /// Raw asset amount.
    pub amount: U256,
    /// NFT position.
    pub token_id: TokenId,
    /// USD value at request time.
    pub usd_value: UsdValue,
    /// Lifecycle status.
    pub status: WithdrawalStatus,
    /// Block timestamp of the request, seconds.
    pub timestamp: u64,
    /// Unix timestamp of completion.
    pub completed_at: Option<i64>,
}

/// A recorded borrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Borrow {
    /// Row id.
    pub id: i64,
    /// Chain the borrow executes on.
    pub chain_id: u64,
    /// Originating request id.
    pub request_id: B256,
    /// Borrowing wallet, lowercase.
    pub sender: String,
    /// Collateral NFT position.
    pub token_id: TokenId,
    /// Lending protocol address, lowercase.
    pub protocol: String,
    /// Borrowed asset address, lowercase.
    pub asset: String,
    /// Raw borrowed amount.
    pub amount: U256,
    /// Outstanding USD value (reduced by repayments).
    pub usd_value: UsdValue,
    /// Lifecycle status.
    pub status: BorrowStatus,
    /// Unix timestamp the loan opened.
    pub loan_start_date: i64,
    /// Unix timestamp the loan closed (REPAID only).
    pub loan_end_date: Option<i64>,
}

/// A raw relayer event row (dedup ledger for the request lifecycle).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayerEventRecord {
    /// Row id.
    pub id: i64,
    /// Event kind string (COLLATERAL_REQUEST, COLLATERAL_PROCESS, REPAY).
    pub event_type: String,
    /// Request id.
    pub request_id: B256,
    /// Chain id.
    pub chain_id: u64,
    /// NFT position, when carried.
    pub token_id: Option<TokenId>,
    /// Lending protocol, lowercase, when carried.
    pub protocol: Option<String>,
    /// Asset address, lowercase, when carried.
    pub asset: Option<String>,
    /// Acting wallet, lowercase.
    pub sender: String,
    /// Raw amount.
    pub amount: U256,
    /// Request deadline, unix seconds.
    pub deadline: Option<i64>,
    /// Opaque payload.
    pub data: Vec<u8>,
    /// Request signature.
    pub signature: Vec<u8>,
    /// Lifecycle status.
    pub status: RelayerEventStatus,
    /// Rejection reason or on-chain error payload.
    pub error_data: Option<String>,
    /// Hash of the processing transaction.
    pub process_tx_hash: Option<B256>,
    /// Block timestamp, seconds.
    pub timestamp: u64,
}

/// Lowercase 0x-prefixed rendering used for every stored address.
pub fn addr_key(address: &Address) -> String {
    format!("{address:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_status_roundtrips() {
        for s in [
            WithdrawalStatus::Pending,
            WithdrawalStatus::Completed,
            WithdrawalStatus::Rejected,
        ] {
            assert_eq!(s.as_str().parse::<WithdrawalStatus>().unwrap(), s);
        }
        for s in [BorrowStatus::Active, BorrowStatus::Repaid] {
            assert_eq!(s.as_str().parse::<BorrowStatus>().unwrap(), s);
        }
        for s in [
            RelayerEventStatus::Pending,
            RelayerEventStatus::Approved,
            RelayerEventStatus::Rejected,
        ] {
            assert_eq!(s.as_str().parse::<RelayerEventStatus>().unwrap(), s);
        }
    }

    #[test]
    fn test_addr_key_is_lowercase() {
        let addr = address!("AbCdEF0123456789abcdef0123456789ABCDEF01");
        let key = addr_key(&addr);
        assert_eq!(key, key.to_lowercase());
        assert!(key.starts_with("0x"));
        assert_eq!(key.len(), 42);
    }
}
