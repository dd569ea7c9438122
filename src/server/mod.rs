pub mod data;
pub mod error;
pub mod timeout_layer;

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use ethers::abi::Token;
use ethers::utils::keccak256;
use hyper::header::CONTENT_TYPE;
use hyper::StatusCode;
use prometheus::{Encoder, TextEncoder};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::App;
use crate::config::ServerConfig;
use crate::database::DbMethods;
use crate::shutdown::Shutdown;

use self::data::{
    hydrate, ByMerchantAndSubscriptionIdQuery, ByMerchantAndUserQuery, ByMerchantDomainQuery,
    ByUserQuery, HashSubscriptionRequest, HashSubscriptionResponse, StoreMetadataRequest,
    StoreMetadataResponse, SubscriptionLogsResponse,
};
use self::error::Error;

async fn get_subscription_by_hash(
    State(app): State<Arc<App>>,
    axum::extract::Path(subscription_hash): axum::extract::Path<String>,
) -> Result<Json<crate::database::types::SubscriptionView>, Error> {
    let subscription = app
        .pool
        .get_subscription_by_hash(&subscription_hash)
        .await?
        .ok_or(Error::SubscriptionNotFound)?;

    Ok(Json(hydrate_one(&app, subscription).await?))
}

async fn get_subscription_logs(
    State(app): State<Arc<App>>,
    axum::extract::Path(subscription_hash): axum::extract::Path<String>,
) -> Result<Json<SubscriptionLogsResponse>, Error> {
    let logs = app.pool.get_subscription_logs(&subscription_hash).await?;
    Ok(Json(SubscriptionLogsResponse { logs }))
}

async fn get_subscriptions_by_user(
    State(app): State<Arc<App>>,
    Query(query): Query<ByUserQuery>,
) -> Result<Json<Vec<crate::database::types::SubscriptionView>>, Error> {
    let user_address = format!("{:#x}", query.user_address);
    let subscriptions = app
        .pool
        .get_subscriptions_by_user(&query.chain, &user_address)
        .await?;

    hydrate_all(&app, subscriptions).await.map(Json)
}

async fn get_subscriptions_by_merchant_domain(
    State(app): State<Arc<App>>,
    Query(query): Query<ByMerchantDomainQuery>,
) -> Result<Json<Vec<crate::database::types::SubscriptionView>>, Error> {
    let subscriptions = app
        .pool
        .get_subscriptions_by_merchant_domain(&query.merchant_domain)
        .await?;

    hydrate_all(&app, subscriptions).await.map(Json)
}

async fn get_subscriptions_by_merchant_and_user(
    State(app): State<Arc<App>>,
    Query(query): Query<ByMerchantAndUserQuery>,
) -> Result<Json<Vec<crate::database::types::SubscriptionView>>, Error> {
    let merchant_address = format!("{:#x}", query.merchant_address);
    let user_address = format!("{:#x}", query.user_address);
    let subscriptions = app
        .pool
        .get_subscriptions_by_merchant_and_user(&merchant_address, &user_address)
        .await?;

    hydrate_all(&app, subscriptions).await.map(Json)
}

async fn get_subscription_by_merchant_and_subscription_id(
    State(app): State<Arc<App>>,
    Query(query): Query<ByMerchantAndSubscriptionIdQuery>,
) -> Result<Json<crate::database::types::SubscriptionView>, Error> {
    let merchant_address = format!("{:#x}", query.merchant_address);
    let subscription = app
        .pool
        .get_subscription_by_merchant_and_subscription_id(&merchant_address, &query.subscription_id)
        .await?
        .ok_or(Error::SubscriptionNotFound)?;

    Ok(Json(hydrate_one(&app, subscription).await?))
}

async fn get_all_subscriptions(
    State(app): State<Arc<App>>,
) -> Result<Json<Vec<crate::database::types::SubscriptionView>>, Error> {
    let subscriptions = app.pool.get_all_subscriptions().await?;
    hydrate_all(&app, subscriptions).await.map(Json)
}

async fn store_metadata(
    State(app): State<Arc<App>>,
    Json(req): Json<StoreMetadataRequest>,
) -> Result<Json<StoreMetadataResponse>, Error> {
    let cid = app.metadata.store(&req.content).await?;
    Ok(Json(StoreMetadataResponse { cid }))
}

/// Hashes a subscription's identifying parameter tuple the same way the
/// router contract does, so a client can know the `subscriptionHash` a
/// `SubscriptionStarted` event will carry before submitting the transaction.
/// Packed (not padded) per the on-chain ABI: `address, bytes32, bytes32,
/// bytes32, bytes32, address, uint256, uint256, uint256, uint256, address`.
async fn hash_subscription(
    Json(req): Json<HashSubscriptionRequest>,
) -> Result<Json<HashSubscriptionResponse>, Error> {
    let uint_amount = ethers::types::U256::from_dec_str(&req.uint_amount)
        .map_err(|_| Error::InvalidHex(req.uint_amount.clone()))?;

    let packed = ethers::abi::encode_packed(&[
        Token::Address(req.merchant_address),
        Token::FixedBytes(ascii_bytes32(&req.userid)?.to_vec()),
        Token::FixedBytes(ascii_bytes32(&req.merchant_domain)?.to_vec()),
        Token::FixedBytes(ascii_bytes32(&req.product)?.to_vec()),
        Token::FixedBytes(ascii_bytes32(&req.nonce)?.to_vec()),
        Token::Address(req.token_address),
        Token::Uint(uint_amount),
        Token::Uint(req.period.into()),
        Token::Uint(req.free_trial_length.into()),
        Token::Uint(req.payment_period.into()),
        Token::Address(req.initiator),
    ])
    .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;

    let hash = keccak256(packed);

    Ok(Json(HashSubscriptionResponse {
        subscription_hash: format!("0x{}", hex::encode(hash)),
    }))
}

fn ascii_bytes32(value: &str) -> Result<[u8; 32], Error> {
    if value.len() > 32 || !value.is_ascii() {
        return Err(Error::InvalidHex(value.to_owned()));
    }
    let mut bytes = [0u8; 32];
    bytes[..value.len()].copy_from_slice(value.as_bytes());
    Ok(bytes)
}

async fn hydrate_one(
    app: &App,
    subscription: crate::database::types::Subscription,
) -> Result<crate::database::types::SubscriptionView, Error> {
    let product = app
        .pool
        .get_product(&subscription.product_hash)
        .await?
        .ok_or(Error::SubscriptionNotFound)?;
    let binding = app
        .pool
        .get_merchant_binding(&product.merchant_address, &product.chain)
        .await?;
    let now = chrono::Utc::now().timestamp();
    Ok(hydrate(subscription, &product, binding.as_ref(), now))
}

async fn hydrate_all(
    app: &App,
    subscriptions: Vec<crate::database::types::Subscription>,
) -> Result<Vec<crate::database::types::SubscriptionView>, Error> {
    let mut views = Vec::with_capacity(subscriptions.len());
    for subscription in subscriptions {
        views.push(hydrate_one(app, subscription).await?);
    }
    Ok(views)
}

async fn health() -> Result<(), Error> {
    Ok(())
}

async fn metrics() -> Result<Response<Body>, Error> {
    let encoder = TextEncoder::new();

    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Other(e.into()))?;

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .map_err(|e| Error::Other(e.into()))?;

    Ok(response)
}

/// # Errors
///
/// Will return `Err` if the server cannot bind to `config.address`.
pub async fn run(app: Arc<App>, config: ServerConfig, shutdown: Arc<Shutdown>) -> anyhow::Result<()> {
    info!("Will listen on {}", config.address);
    let listener = TcpListener::bind(config.address)?;
    bind_from_listener(app, config.serve_timeout, listener, shutdown).await
}

/// # Errors
///
/// Will return `Err` if the provided `listener` cannot be converted into a
/// Tokio listener or if the server encounters an I/O error while serving.
pub async fn bind_from_listener(
    app: Arc<App>,
    serve_timeout: Duration,
    listener: TcpListener,
    shutdown: Arc<Shutdown>,
) -> anyhow::Result<()> {
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;

    let router = Router::new()
        .route("/subscription/hash", post(hash_subscription))
        .route("/subscription/:subscription_hash", get(get_subscription_by_hash))
        .route("/subscription/:subscription_hash/logs", get(get_subscription_logs))
        .route("/subscriptions/by-user", get(get_subscriptions_by_user))
        .route(
            "/subscriptions/by-merchant-domain",
            get(get_subscriptions_by_merchant_domain),
        )
        .route(
            "/subscriptions/by-merchant-and-user",
            get(get_subscriptions_by_merchant_and_user),
        )
        .route(
            "/subscriptions/by-merchant-and-subscription-id",
            get(get_subscription_by_merchant_and_subscription_id),
        )
        .route("/subscriptions", get(get_all_subscriptions))
        .route("/metadata", post(store_metadata))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(
            serve_timeout,
            timeout_layer::middleware,
        ))
        .with_state(app);

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        shutdown.await_shutdown_begin().await;
    });

    server.await?;

    Ok(())
}
