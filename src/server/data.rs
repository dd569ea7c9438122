use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::database::types::{MerchantBinding, Product, Subscription, SubscriptionLog, SubscriptionView};

#[derive(Debug, Clone, Deserialize)]
pub struct ByUserQuery {
    pub chain: String,
    pub user_address: Address,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ByMerchantDomainQuery {
    pub merchant_domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ByMerchantAndUserQuery {
    pub merchant_address: Address,
    pub user_address: Address,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ByMerchantAndSubscriptionIdQuery {
    pub merchant_address: Address,
    pub subscription_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashSubscriptionRequest {
    pub merchant_address: Address,
    pub userid: String,
    pub merchant_domain: String,
    pub product: String,
    pub nonce: String,
    pub token_address: Address,
    pub uint_amount: String,
    pub period: u64,
    pub free_trial_length: u64,
    pub payment_period: u64,
    pub initiator: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashSubscriptionResponse {
    pub subscription_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadataRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadataResponse {
    pub cid: String,
}

/// Joins a [`Subscription`] row with its [`Product`] and [`MerchantBinding`]
/// into the flattened shape the Query Interface returns (§4.8), computing the
/// `status`/`is_active`/`next_payment_at` derived fields as of `now`.
#[must_use]
pub fn hydrate(
    subscription: Subscription,
    product: &Product,
    binding: Option<&MerchantBinding>,
    now: i64,
) -> SubscriptionView {
    let status = subscription.status(product.period, product.payment_period, now);
    let is_active = subscription.is_active(product.period, product.payment_period, now);
    let next_payment_at = subscription.next_payment_at(product.period);
    let initiator_address = binding
        .map(|b| b.initiator_address.clone())
        .unwrap_or_default();

    SubscriptionView {
        subscription_hash: subscription.subscription_hash,
        chain: subscription.chain,
        user_address: subscription.user_address,
        merchant_address: product.merchant_address.clone(),
        merchant_domain: product.merchant_domain.clone(),
        product_hash: subscription.product_hash,
        product_name: product.product_name.clone(),
        token_address: product.token_address.clone(),
        token_symbol: product.token_symbol.clone(),
        token_decimals: product.token_decimals,
        uint_amount: product.uint_amount.clone(),
        period: product.period,
        start_ts: subscription.start_ts,
        payment_period: product.payment_period,
        payments_made: subscription.payments_made,
        terminated: subscription.terminated,
        subscription_id: subscription.subscription_id,
        user_id: subscription.user_id,
        initiator_address,
        status: status.as_str().to_owned(),
        is_active,
        next_payment_at,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionLogsResponse {
    pub logs: Vec<SubscriptionLog>,
}
