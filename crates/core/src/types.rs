//! Domain types for VaultBridge.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use alloy_primitives::{B256, U256};
use bigdecimal::num_bigint::BigInt;
use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};

use crate::constants::USD_SCALE;
use crate::error::CoreError;

/// NFT token identifier (uint256 on chain).
///
/// Wrapper around U256 to provide domain-specific type safety. Tokens are
/// addressed on chain by `(contract, tokenId)`, but ownership-tree leaves use
/// only the token id; the active NFT contract is configured externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub U256);

impl TokenId {
    /// Create a new TokenId.
    pub const fn new(value: U256) -> Self {
        TokenId(value)
    }

    /// Get the inner U256.
    pub const fn inner(&self) -> &U256 {
        &self.0
    }

    /// Big-endian 32-byte encoding, as used in packed leaf preimages.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    /// Encode as a B256 (big-endian).
    pub fn to_b256(&self) -> B256 {
        B256::from(self.to_be_bytes())
    }
}

impl From<U256> for TokenId {
    fn from(value: U256) -> Self {
        TokenId(value)
    }
}

impl From<u64> for TokenId {
    fn from(value: u64) -> Self {
        TokenId(U256::from(value))
    }
}

impl FromStr for TokenId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner =
            U256::from_str(s).map_err(|_| CoreError::InvalidAddress(format!("token id {s}")))?;
        Ok(TokenId(inner))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A USD amount with exactly [`USD_SCALE`] fractional digits.
///
/// All ledger arithmetic runs through this type so binary-float drift can
/// never enter balances. The scale is re-normalized after every operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsdValue(BigDecimal);

impl UsdValue {
    /// The zero amount.
    pub fn zero() -> Self {
        UsdValue(BigDecimal::zero().with_scale(USD_SCALE))
    }

    /// Construct from an already-parsed decimal, normalizing the scale.
    pub fn from_decimal(value: BigDecimal) -> Self {
        UsdValue(value.with_scale(USD_SCALE))
    }

    /// Parse from a decimal string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let value =
            BigDecimal::from_str(s).map_err(|_| CoreError::InvalidUsdAmount(s.to_string()))?;
        Ok(Self::from_decimal(value))
    }

    /// Construct from a whole-dollar integer (convenient in tests and configs).
    pub fn from_dollars(dollars: i64) -> Self {
        Self::from_decimal(BigDecimal::from(dollars))
    }

    /// Convert a raw on-chain token amount into USD.
    ///
    /// `raw` is the unscaled integer amount, `decimals` the token's decimal
    /// count, `unit_price` the USD price of one whole token.
    pub fn from_token_amount(raw: U256, decimals: u8, unit_price: &BigDecimal) -> Self {
        // raw / 10^decimals, exactly
        let raw_int = BigInt::from_str(&raw.to_string()).unwrap_or_else(|_| BigInt::zero());
        let tokens = BigDecimal::new(raw_int, i64::from(decimals));
        Self::from_decimal(tokens * unit_price)
    }

    /// True if the amount is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// True if the amount is below zero.
    pub fn is_negative(&self) -> bool {
        self.0 < BigDecimal::zero()
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub(&self, other: &UsdValue) -> UsdValue {
        if self.0 <= other.0 {
            UsdValue::zero()
        } else {
            UsdValue::from_decimal(&self.0 - &other.0)
        }
    }

    /// The smaller of two amounts.
    pub fn min(self, other: UsdValue) -> UsdValue {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }

    /// Access the inner decimal.
    pub fn as_decimal(&self) -> &BigDecimal {
        &self.0
    }
}

impl Default for UsdValue {
    fn default() -> Self {
        Self::zero()
    }
}

impl Add for UsdValue {
    type Output = UsdValue;

    fn add(self, rhs: UsdValue) -> UsdValue {
        UsdValue::from_decimal(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a UsdValue> for UsdValue {
    type Output = UsdValue;

    fn add(self, rhs: &'a UsdValue) -> UsdValue {
        UsdValue::from_decimal(self.0 + &rhs.0)
    }
}

impl Sub for UsdValue {
    type Output = UsdValue;

    fn sub(self, rhs: UsdValue) -> UsdValue {
        UsdValue::from_decimal(self.0 - rhs.0)
    }
}

impl<'a> Sub<&'a UsdValue> for UsdValue {
    type Output = UsdValue;

    fn sub(self, rhs: &'a UsdValue) -> UsdValue {
        UsdValue::from_decimal(self.0 - &rhs.0)
    }
}

impl AddAssign<&UsdValue> for UsdValue {
    fn add_assign(&mut self, rhs: &UsdValue) {
        self.0 = (&self.0 + &rhs.0).with_scale(USD_SCALE);
    }
}

impl SubAssign<&UsdValue> for UsdValue {
    fn sub_assign(&mut self, rhs: &UsdValue) {
        self.0 = (&self.0 - &rhs.0).with_scale(USD_SCALE);
    }
}

impl fmt::Display for UsdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Serialized as the fixed-scale decimal string; deserialization re-validates
// and re-normalizes so malformed amounts never enter the system.
impl Serialize for UsdValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UsdValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        UsdValue::parse(&s).map_err(|e| serde::de::Error::custom(format!("{e}")))
    }
}
