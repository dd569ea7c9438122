use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A merchant-defined subscription template. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub product_hash: String,
    pub chain: String,
    pub merchant_address: String,
    pub token_address: String,
    pub token_symbol: String,
    pub token_decimals: i16,
    pub uint_amount: String,
    pub period: i64,
    pub payment_period: i64,
    pub free_trial_length: i64,
    pub metadata_hash: String,
    pub merchant_domain: String,
    pub product_name: String,
}

impl Product {
    #[must_use]
    pub fn uint_amount(&self) -> U256 {
        U256::from_dec_str(&self.uint_amount).unwrap_or_default()
    }

    #[must_use]
    pub fn token_address(&self) -> Address {
        self.token_address.parse().unwrap_or_default()
    }

    #[must_use]
    pub fn merchant_address(&self) -> Address {
        self.merchant_address.parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Paid,
    Pending,
    Expired,
    Terminated,
}

impl SubscriptionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Pending => "pending",
            Self::Expired => "expired",
            Self::Terminated => "terminated",
        }
    }
}

/// A user's instantiation of a [`Product`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_hash: String,
    pub product_hash: String,
    pub chain: String,
    pub user_address: String,
    pub start_ts: i64,
    pub payments_made: i64,
    pub terminated: bool,
    pub subscription_id: Option<String>,
    pub user_id: Option<String>,
}

impl Subscription {
    #[must_use]
    pub fn user_address(&self) -> Address {
        self.user_address.parse().unwrap_or_default()
    }

    #[must_use]
    pub fn subscription_hash(&self) -> H256 {
        self.subscription_hash.parse().unwrap_or_default()
    }

    /// `start_ts + period * payments_made`: the timestamp of the next unpaid cycle.
    #[must_use]
    pub fn next_payment_at(&self, period: i64) -> i64 {
        self.start_ts + period * self.payments_made
    }

    /// `true` iff `now <= next_payment_at + payment_period` and the
    /// subscription has not been terminated.
    #[must_use]
    pub fn is_active(&self, period: i64, payment_period: i64, now: i64) -> bool {
        !self.terminated && now <= self.next_payment_at(period) + payment_period
    }

    #[must_use]
    pub fn status(&self, period: i64, payment_period: i64, now: i64) -> SubscriptionStatus {
        if self.terminated {
            return SubscriptionStatus::Terminated;
        }
        let next_payment_at = self.next_payment_at(period);
        if now > next_payment_at + payment_period {
            return SubscriptionStatus::Expired;
        }
        if now > next_payment_at {
            return SubscriptionStatus::Pending;
        }
        SubscriptionStatus::Paid
    }
}

/// A fully hydrated subscription: its own row plus the immutable product
/// fields a consumer needs to interpret it (amount, cadence, merchant).
/// This is what the Query Interface (§4.8) returns.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    pub subscription_hash: String,
    pub chain: String,
    pub user_address: String,
    pub merchant_address: String,
    pub merchant_domain: String,
    pub product_hash: String,
    pub product_name: String,
    pub token_address: String,
    pub token_symbol: String,
    pub token_decimals: i16,
    pub uint_amount: String,
    pub period: i64,
    pub start_ts: i64,
    pub payment_period: i64,
    pub payments_made: i64,
    pub terminated: bool,
    pub subscription_id: Option<String>,
    pub user_id: Option<String>,
    pub initiator_address: String,
    pub status: String,
    pub is_active: bool,
    pub next_payment_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MerchantBinding {
    pub merchant_address: String,
    pub chain: String,
    pub initiator_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionLogType {
    PaymentIssue,
    PaymentMade,
}

impl SubscriptionLogType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PaymentIssue => "payment-issue",
            Self::PaymentMade => "payment-made",
        }
    }
}

impl std::str::FromStr for SubscriptionLogType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment-issue" => Ok(Self::PaymentIssue),
            "payment-made" => Ok(Self::PaymentMade),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionLog {
    pub log_id: i64,
    pub log_type: String,
    pub subscription_hash: String,
    pub payment_number: i64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A content-addressed off-chain metadata blob, cached by IPFS CID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MetadataBlob {
    pub cid: String,
    pub content: String,
}
