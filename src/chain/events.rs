use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::providers::Middleware;
use ethers::types::{Log, H256};
use sqlx::{Pool, Postgres};
use tracing::{error, info, instrument};

use super::abi::{
    Erc20, InitiatorChangedFilter, PaymentMadeFilter, Router, SubscriptionStartedFilter,
    SubscriptionTerminatedFilter,
};
use crate::database::types::{MerchantBinding, Product, Subscription};
use crate::database::DbMethods;
use crate::metadata::MetadataResolver;

/// One cursor per router event kind (§4.1, §3 "Cursors").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Subscriptions,
    Payments,
    Terminations,
    Initiators,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscriptions => "subscriptions",
            Self::Payments => "payments",
            Self::Terminations => "terminations",
            Self::Initiators => "initiators",
        }
    }

    #[must_use]
    pub fn topic0(self) -> H256 {
        match self {
            Self::Subscriptions => SubscriptionStartedFilter::signature(),
            Self::Payments => PaymentMadeFilter::signature(),
            Self::Terminations => SubscriptionTerminatedFilter::signature(),
            Self::Initiators => InitiatorChangedFilter::signature(),
        }
    }
}

fn decode<T: EthEvent>(log: &Log) -> Result<T, ethers::abi::Error> {
    T::decode_log(&RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    })
}

/// Dispatches one raw log to its typed, idempotent handler. Unknown or
/// undecodable logs are skipped with a warning rather than aborting the scan.
#[instrument(skip(pool, router, metadata, log), fields(chain = %chain_name))]
pub async fn handle_log<M: Middleware + 'static>(
    pool: &Pool<Postgres>,
    chain_name: &str,
    kind: EventKind,
    router: &Router<M>,
    metadata: &MetadataResolver,
    log: &Log,
) -> anyhow::Result<()> {
    match kind {
        EventKind::Subscriptions => {
            let event: SubscriptionStartedFilter = decode(log)?;
            handle_subscription_started(pool, chain_name, router, metadata, event).await
        }
        EventKind::Payments => {
            let event: PaymentMadeFilter = decode(log)?;
            handle_payment_made(pool, event).await
        }
        EventKind::Terminations => {
            let event: SubscriptionTerminatedFilter = decode(log)?;
            handle_subscription_terminated(pool, event).await
        }
        EventKind::Initiators => {
            let event: InitiatorChangedFilter = decode(log)?;
            handle_initiator_changed(pool, chain_name, event).await
        }
    }
}

#[instrument(skip(pool, router, metadata))]
async fn handle_subscription_started<M: Middleware + 'static>(
    pool: &Pool<Postgres>,
    chain_name: &str,
    router: &Router<M>,
    metadata: &MetadataResolver,
    event: SubscriptionStartedFilter,
) -> anyhow::Result<()> {
    let product_hash = format!("{:#x}", H256::from(event.product_hash));
    let subscription_hash = format!("{:#x}", H256::from(event.subscription_hash));

    if pool.get_product(&product_hash).await?.is_none() {
        let (merchant, token, amount, period, free_trial_length, payment_period, metadata_bytes) =
            router.products(event.product_hash).call().await?;

        let erc20 = Erc20::new(token, router.client());
        let decimals = erc20.decimals().call().await?;
        let symbol = erc20.symbol().call().await?;

        let Some(resolved) = metadata.resolve(&metadata_bytes).await? else {
            error!(%product_hash, "Product metadata fetch failed; skipping subscription ingestion");
            return Ok(());
        };

        let (Some(merchant_domain), Some(product_name)) = (
            resolved.get("merchantDomain").and_then(|v| v.as_str()),
            resolved.get("productName").and_then(|v| v.as_str()),
        ) else {
            error!(%product_hash, "Product metadata missing required key(s); skipping subscription ingestion");
            return Ok(());
        };

        let product = Product {
            product_hash: product_hash.clone(),
            chain: chain_name.to_owned(),
            merchant_address: format!("{merchant:#x}"),
            token_address: format!("{token:#x}"),
            token_symbol: symbol,
            token_decimals: i16::from(decimals),
            uint_amount: amount.to_string(),
            period: period.as_u64() as i64,
            payment_period: payment_period.as_u64() as i64,
            free_trial_length: free_trial_length.as_u64() as i64,
            metadata_hash: hex::encode(&metadata_bytes),
            merchant_domain: merchant_domain.to_owned(),
            product_name: product_name.to_owned(),
        };
        pool.add_product(&product).await?;

        let initiator = router.merchant_settings(merchant).call().await?;
        pool.set_merchant_binding(&MerchantBinding {
                merchant_address: format!("{merchant:#x}"),
                chain: chain_name.to_owned(),
                initiator_address: format!("{initiator:#x}"),
            })
            .await?;
    }

    let subscription_metadata = metadata.resolve(&event.subscription_metadata).await?;
    let (subscription_id, user_id) = subscription_metadata
        .map(|value| {
            (
                value
                    .get("subscriptionId")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned),
                value
                    .get("userId")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned),
            )
        })
        .unwrap_or_default();

    let subscription = Subscription {
        subscription_hash,
        product_hash,
        chain: chain_name.to_owned(),
        user_address: format!("{:#x}", event.user),
        start_ts: event.start.as_u64() as i64,
        payments_made: 0,
        terminated: false,
        subscription_id,
        user_id,
    };
    pool.add_subscription(&subscription).await?;

    info!(subscription_hash = %subscription.subscription_hash, "Persisted new subscription");
    Ok(())
}

#[instrument(skip(pool))]
async fn handle_payment_made(pool: &Pool<Postgres>, event: PaymentMadeFilter) -> anyhow::Result<()> {
    let subscription_hash = format!("{:#x}", H256::from(event.subscription_hash));
    let payment_number = event.payment_number.as_u64() as i64;
    pool
        .update_payments_made(&subscription_hash, payment_number)
        .await?;
    Ok(())
}

#[instrument(skip(pool))]
async fn handle_subscription_terminated(
    pool: &Pool<Postgres>,
    event: SubscriptionTerminatedFilter,
) -> anyhow::Result<()> {
    let subscription_hash = format!("{:#x}", H256::from(event.subscription_hash));
    pool.terminate(&subscription_hash).await?;
    Ok(())
}

#[instrument(skip(pool))]
async fn handle_initiator_changed(
    pool: &Pool<Postgres>,
    chain_name: &str,
    event: InitiatorChangedFilter,
) -> anyhow::Result<()> {
    pool.set_merchant_binding(&MerchantBinding {
            merchant_address: format!("{:#x}", event.merchant),
            chain: chain_name.to_owned(),
            initiator_address: format!("{:#x}", event.new_initiator),
        })
        .await?;
    Ok(())
}

pub const EVENT_KINDS: [EventKind; 4] = [
    EventKind::Subscriptions,
    EventKind::Payments,
    EventKind::Terminations,
    EventKind::Initiators,
];

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ethers::abi::{encode, Token};
    use ethers::providers::MockProvider;
    use ethers::types::{Address, Bytes, U256};
    use postgres_docker_utils::DockerContainerGuard;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::{DatabaseConfig, MetadataConfig};
    use crate::database::Database;
    use crate::secret::SecretUrl;

    async fn setup_db() -> anyhow::Result<(Database, DockerContainerGuard)> {
        let container = postgres_docker_utils::setup().await?;
        let url = format!("postgres://postgres@localhost:{}/postgres", container.port());
        let db = Database::new(&DatabaseConfig {
            url: url.parse::<SecretUrl>()?,
            migrate: true,
            max_connections: 5,
        })
        .await?;
        Ok((db, container))
    }

    fn abi_call_result(tokens: &[Token]) -> Bytes {
        Bytes::from(encode(tokens))
    }

    /// A fresh `SubscriptionStarted` log for a product the store has never
    /// seen drives three contract reads (`products`, `decimals`, `symbol`),
    /// a merchant-settings read, and two metadata fetches, then persists a
    /// `Product`, `MerchantBinding`, and `Subscription` row.
    #[tokio::test]
    async fn fresh_subscription_resolves_product_and_persists() -> anyhow::Result<()> {
        let (db, _container) = setup_db().await?;
        let pool = db.pool().clone();

        let merchant = Address::from_low_u64_be(0x1111);
        let token = Address::from_low_u64_be(0x2222);
        let user = Address::from_low_u64_be(0x3333);
        let initiator = Address::from_low_u64_be(0x4444);
        let router_address = Address::from_low_u64_be(0x5555);

        let product_metadata_bytes = b"product-metadata-blob".to_vec();
        let subscription_metadata_bytes = b"subscription-metadata-blob".to_vec();
        let product_cid = bs58::encode(&product_metadata_bytes).into_string();
        let subscription_cid = bs58::encode(&subscription_metadata_bytes).into_string();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{product_cid}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "merchantDomain": "merchant.example",
                "productName": "Pro plan",
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/{subscription_cid}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subscriptionId": "sub-123",
                "userId": "user-456",
            })))
            .mount(&server)
            .await;

        let metadata = MetadataResolver::new(
            &MetadataConfig {
                pinata_base_url: server.uri().parse()?,
                pinata_api_key: "test-key".parse()?,
            },
            pool.clone(),
        );

        // `handle_subscription_started`'s fresh-product branch issues, in
        // order: `products`, `decimals`, `symbol`, `merchantSettings`.
        // `MockProvider` serves pushed responses last-in-first-out, so push
        // in the reverse of that call order.
        let mock = MockProvider::new();
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[Token::Address(initiator)]))?; // merchantSettings
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[Token::String("USDC".to_owned())]))?; // symbol
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[Token::Uint(U256::from(6u64))]))?; // decimals
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[
            Token::Address(merchant),
            Token::Address(token),
            Token::Uint(U256::from(1_000_000u64)),
            Token::Uint(U256::from(2_592_000u64)),
            Token::Uint(U256::from(0u64)),
            Token::Uint(U256::from(259_200u64)),
            Token::Bytes(product_metadata_bytes),
        ]))?; // products

        let provider = Arc::new(ethers::providers::Provider::new(mock));
        let router = Router::new(router_address, provider);

        let product_hash = [0x11u8; 32];
        let subscription_hash = [0x22u8; 32];

        let event = SubscriptionStartedFilter {
            subscription_hash,
            product_hash,
            user,
            start: U256::from(1_700_000_000u64),
            subscription_metadata: Bytes::from(subscription_metadata_bytes),
        };

        handle_subscription_started(&pool, "testchain", &router, &metadata, event).await?;

        let product_hash_hex = format!("{:#x}", H256::from(product_hash));
        let stored_product = pool
            .get_product(&product_hash_hex)
            .await?
            .expect("product persisted");
        assert_eq!(stored_product.product_name, "Pro plan");
        assert_eq!(stored_product.merchant_domain, "merchant.example");
        assert_eq!(stored_product.token_symbol, "USDC");
        assert_eq!(stored_product.token_decimals, 6);

        let binding = pool
            .get_merchant_binding(&format!("{merchant:#x}"), "testchain")
            .await?
            .expect("merchant binding persisted");
        assert_eq!(binding.initiator_address, format!("{initiator:#x}"));

        let subscription_hash_hex = format!("{:#x}", H256::from(subscription_hash));
        let stored_subscription = pool
            .get_subscription(&subscription_hash_hex)
            .await?
            .expect("subscription persisted");
        assert_eq!(stored_subscription.subscription_id.as_deref(), Some("sub-123"));
        assert_eq!(stored_subscription.user_id.as_deref(), Some("user-456"));
        assert_eq!(stored_subscription.user_address, format!("{user:#x}"));

        Ok(())
    }

    /// A product whose off-chain metadata is missing a required key is
    /// skipped entirely: no product, binding, or subscription is persisted.
    #[tokio::test]
    async fn missing_required_metadata_key_skips_ingestion() -> anyhow::Result<()> {
        let (db, _container) = setup_db().await?;
        let pool = db.pool().clone();

        let merchant = Address::from_low_u64_be(0x1111);
        let token = Address::from_low_u64_be(0x2222);
        let user = Address::from_low_u64_be(0x3333);
        let router_address = Address::from_low_u64_be(0x5555);

        let product_metadata_bytes = b"incomplete-metadata-blob".to_vec();
        let product_cid = bs58::encode(&product_metadata_bytes).into_string();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{product_cid}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "productName": "Pro plan",
                // "merchantDomain" is required and intentionally absent.
            })))
            .mount(&server)
            .await;

        let metadata = MetadataResolver::new(
            &MetadataConfig {
                pinata_base_url: server.uri().parse()?,
                pinata_api_key: "test-key".parse()?,
            },
            pool.clone(),
        );

        let mock = MockProvider::new();
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[Token::String("USDC".to_owned())]))?; // symbol
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[Token::Uint(U256::from(6u64))]))?; // decimals
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[
            Token::Address(merchant),
            Token::Address(token),
            Token::Uint(U256::from(1_000_000u64)),
            Token::Uint(U256::from(2_592_000u64)),
            Token::Uint(U256::from(0u64)),
            Token::Uint(U256::from(259_200u64)),
            Token::Bytes(product_metadata_bytes),
        ]))?; // products

        let provider = Arc::new(ethers::providers::Provider::new(mock));
        let router = Router::new(router_address, provider);

        let product_hash = [0x33u8; 32];
        let subscription_hash = [0x44u8; 32];

        let event = SubscriptionStartedFilter {
            subscription_hash,
            product_hash,
            user,
            start: U256::from(1_700_000_000u64),
            subscription_metadata: Bytes::default(),
        };

        handle_subscription_started(&pool, "testchain", &router, &metadata, event).await?;

        let product_hash_hex = format!("{:#x}", H256::from(product_hash));
        assert!(pool.get_product(&product_hash_hex).await?.is_none());

        let subscription_hash_hex = format!("{:#x}", H256::from(subscription_hash));
        assert!(pool.get_subscription(&subscription_hash_hex).await?.is_none());

        Ok(())
    }
}
