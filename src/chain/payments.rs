use std::time::Duration;

use chrono::Utc;
use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::providers::Middleware;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{BlockNumber, Eip1559TransactionRequest, TransactionRequest, H256, U256};
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::abi::{Erc20, PaymentMadeFilter};
use super::ChainHandle;
use crate::database::types::SubscriptionLogType;
use crate::database::DbMethods;
use crate::price::PriceOracle;

/// First payment is bundled with subscription creation; the second pays the
/// one-off storage-initialization overhead of the payment slot (§4.5b).
const GAS_PER_PAYMENT: u64 = 100_000;
const SECOND_PAYMENT_GAS: u64 = 120_000;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("insufficient balance: has {balance}, needs {required}")]
    InsufficientFunds { balance: U256, required: U256 },

    #[error("insufficient allowance: has {allowance}, needs {required}")]
    InsufficientAllowance { allowance: U256, required: U256 },

    #[error(transparent)]
    UnsupportedToken(#[from] crate::price::Error),

    #[error("failed to build or sign payment transaction: {0}")]
    BuildOrSign(String),

    #[error("timed out waiting for payment receipt")]
    ReceiptTimeout,

    #[error("receipt contained {0} matching PaymentMade logs, expected exactly 1")]
    SchemaInvariantViolation(usize),

    #[error(transparent)]
    Database(#[from] crate::database::Error),
}

/// Runs the payment initiator once for `chain` (§4.5). Returns after either
/// exhausting the payable set or freezing the chain on a receipt timeout.
#[instrument(skip_all, fields(chain = %chain.name))]
pub async fn run<P: Middleware + 'static>(
    chain: &ChainHandle<P>,
    pool: &Pool<Postgres>,
    price_oracle: &PriceOracle,
    receipt_timeout: Duration,
    priority_fee_wei: u64,
) -> anyhow::Result<()> {
    if pool.is_initiator_frozen(&chain.name).await? {
        error!(chain = %chain.name, "Chain is frozen; payment initiator will not run");
        crate::metrics::CHAIN_FROZEN
            .with_label_values(&[&chain.name])
            .set(1.0);
        return Ok(());
    }
    crate::metrics::CHAIN_FROZEN
        .with_label_values(&[&chain.name])
        .set(0.0);

    let now = Utc::now().timestamp();
    let initiator = format!("{:#x}", chain.initiator_address);
    let payable = pool.get_payable(&chain.name, now, &initiator).await?;

    info!(chain = %chain.name, count = payable.len(), "Evaluating payable subscriptions");

    for subscription in payable {
        let payment_number = subscription.payments_made + 1;

        match pay_one(chain, pool, price_oracle, priority_fee_wei, receipt_timeout, &subscription.subscription_hash, payment_number).await {
            Ok(()) => {
                crate::metrics::PAYMENT_ATTEMPTS
                    .with_label_values(&[&chain.name, "success"])
                    .inc();
            }
            Err(PaymentError::ReceiptTimeout) => {
                error!(
                    chain = %chain.name,
                    subscription_hash = %subscription.subscription_hash,
                    "Payment receipt timed out; freezing chain"
                );
                crate::metrics::PAYMENT_ATTEMPTS
                    .with_label_values(&[&chain.name, "timeout"])
                    .inc();
                crate::metrics::CHAIN_FROZEN
                    .with_label_values(&[&chain.name])
                    .set(1.0);
                pool.freeze_initiator(&chain.name).await?;
                pool.add_subscription_log(
                    SubscriptionLogType::PaymentIssue,
                    &subscription.subscription_hash,
                    payment_number,
                    "receipt timeout; chain frozen pending operator intervention",
                )
                .await?;
                return Ok(());
            }
            Err(error) => {
                warn!(chain = %chain.name, subscription_hash = %subscription.subscription_hash, %error, "Payment attempt failed");
                crate::metrics::PAYMENT_ATTEMPTS
                    .with_label_values(&[&chain.name, "failure"])
                    .inc();
                pool.add_subscription_log(
                    SubscriptionLogType::PaymentIssue,
                    &subscription.subscription_hash,
                    payment_number,
                    &error.to_string(),
                )
                .await?;
            }
        }
    }

    Ok(())
}

#[instrument(skip(chain, pool, price_oracle))]
#[allow(clippy::too_many_arguments)]
async fn pay_one<P: Middleware + 'static>(
    chain: &ChainHandle<P>,
    pool: &Pool<Postgres>,
    price_oracle: &PriceOracle,
    priority_fee_wei: u64,
    receipt_timeout: Duration,
    subscription_hash: &str,
    payment_number: i64,
) -> Result<(), PaymentError> {
    let subscription = pool
        .get_subscription(subscription_hash)
        .await?
        .ok_or_else(|| PaymentError::BuildOrSign("subscription vanished mid-run".to_owned()))?;
    let product = pool
        .get_product(&subscription.product_hash)
        .await?
        .ok_or_else(|| PaymentError::BuildOrSign("product vanished mid-run".to_owned()))?;

    let client = chain.provider();
    let erc20 = Erc20::new(product.token_address(), client.clone());
    let user = subscription.user_address();
    let router_address = chain.router.address();
    let required = product.uint_amount();

    let balance = erc20
        .balance_of(user)
        .call()
        .await
        .map_err(|e| PaymentError::BuildOrSign(e.to_string()))?;
    if balance < required {
        return Err(PaymentError::InsufficientFunds { balance, required });
    }

    let allowance = erc20
        .allowance(user, router_address)
        .call()
        .await
        .map_err(|e| PaymentError::BuildOrSign(e.to_string()))?;
    if allowance < required {
        return Err(PaymentError::InsufficientAllowance { allowance, required });
    }

    let gas = if payment_number == 2 {
        SECOND_PAYMENT_GAS
    } else {
        GAS_PER_PAYMENT
    };

    let tip_padded = U256::from(priority_fee_wei).saturating_mul(U256::from(11u64)) / U256::from(10u64);

    // PoA/pre-London chains (§6 `needs_poa_middleware`) don't populate
    // `baseFeePerGas` and commonly reject EIP-1559 transactions; fall back to
    // a legacy `gasPrice` transaction for them.
    let latest_block = client
        .get_block(BlockNumber::Latest)
        .await
        .map_err(|e| PaymentError::BuildOrSign(e.to_string()))?
        .ok_or_else(|| PaymentError::BuildOrSign("latest block unavailable".to_owned()))?;
    let use_legacy_tx = chain.needs_poa_middleware || latest_block.base_fee_per_gas.is_none();

    let max_fee = if use_legacy_tx {
        let gas_price = client
            .get_gas_price()
            .await
            .map_err(|e| PaymentError::BuildOrSign(e.to_string()))?;
        gas_price.saturating_mul(U256::from(12u64)) / U256::from(10u64)
    } else {
        let base_fee = latest_block
            .base_fee_per_gas
            .expect("checked by use_legacy_tx above");
        let base_fee_padded = base_fee.saturating_mul(U256::from(12u64)) / U256::from(10u64);
        base_fee_padded + tip_padded
    };

    let eth_fee = gas as f64 * max_fee.as_u128() as f64 / 1e18;
    let price = price_oracle
        .get_token_to_native(&chain.name, product.token_address())
        .await?;
    let token_comp_human = eth_fee * price;
    let token_comp_atomic =
        U256::from((token_comp_human * 10f64.powi(i32::from(product.token_decimals))) as u128);

    let subscription_hash_bytes: [u8; 32] = subscription.subscription_hash().into();

    let calldata = chain
        .router
        .make_payment(subscription_hash_bytes, token_comp_atomic)
        .calldata()
        .ok_or_else(|| PaymentError::BuildOrSign("failed to encode calldata".to_owned()))?;

    let tx: TypedTransaction = if use_legacy_tx {
        TransactionRequest::new()
            .to(router_address)
            .gas(gas)
            .gas_price(max_fee)
            .data(calldata)
            .into()
    } else {
        Eip1559TransactionRequest::new()
            .to(router_address)
            .gas(gas)
            .max_fee_per_gas(max_fee)
            .max_priority_fee_per_gas(tip_padded)
            .data(calldata)
            .into()
    };

    crate::metrics::PAYMENT_GAS_USED
        .with_label_values(&[&chain.name])
        .observe(gas as f64);
    crate::metrics::PAYMENT_EFFECTIVE_GAS_PRICE_WEI
        .with_label_values(&[&chain.name])
        .observe(max_fee.as_u128() as f64);

    let pending = client
        .send_transaction(tx, None)
        .await
        .map_err(|e| PaymentError::BuildOrSign(e.to_string()))?;
    let tx_hash = *pending;
    info!(%tx_hash, subscription_hash, payment_number, "Payment transaction submitted");

    let receipt = tokio::time::timeout(receipt_timeout, pending)
        .await
        .map_err(|_| PaymentError::ReceiptTimeout)?
        .map_err(|e| PaymentError::BuildOrSign(e.to_string()))?
        .ok_or_else(|| PaymentError::BuildOrSign("transaction dropped from mempool".to_owned()))?;

    let matches: Vec<PaymentMadeFilter> = receipt
        .logs
        .iter()
        .filter_map(|log| {
            PaymentMadeFilter::decode_log(&RawLog {
                topics: log.topics.clone(),
                data: log.data.to_vec(),
            })
            .ok()
        })
        .filter(|event: &PaymentMadeFilter| H256::from(event.subscription_hash) == subscription.subscription_hash())
        .collect();

    if matches.len() != 1 {
        return Err(PaymentError::SchemaInvariantViolation(matches.len()));
    }

    let confirmed_payment_number = matches[0].payment_number.as_u64() as i64;
    pool.update_payments_made(subscription_hash, confirmed_payment_number)
        .await?;
    pool.add_subscription_log(
        SubscriptionLogType::PaymentMade,
        subscription_hash,
        confirmed_payment_number,
        &format!("payment confirmed in tx {tx_hash:#x}"),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ethers::abi::{encode, Token};
    use ethers::middleware::SignerMiddleware;
    use ethers::providers::{MockProvider, Provider};
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::{Address, Block, Log, TransactionReceipt};
    use postgres_docker_utils::DockerContainerGuard;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::chain::abi::Router;
    use crate::config::DatabaseConfig;
    use crate::database::{types::MerchantBinding, Database};
    use crate::secret::SecretUrl;

    const TEST_WALLET_KEY: &str =
        "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const SEPOLIA_USDC: &str = "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238";

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

    fn abi_call_result(tokens: &[Token]) -> ethers::types::Bytes {
        ethers::types::Bytes::from(encode(tokens))
    }

    type MockSigner = SignerMiddleware<Provider<MockProvider>, LocalWallet>;

    /// Builds a `ChainHandle` over a `MockProvider`-backed signer and seeds a
    /// single overdue, payable subscription for it on `sepolia` (so
    /// `PriceOracle`'s static `USDCETH` venue mapping applies).
    async fn seed_chain_and_subscription(
        pool: &Pool<Postgres>,
        router_address: Address,
        subscription_hash: &str,
        mock: MockProvider,
    ) -> anyhow::Result<ChainHandle<MockSigner>> {
        let wallet: LocalWallet = TEST_WALLET_KEY.parse()?;
        let wallet = wallet.with_chain_id(11_155_111u64);
        let initiator_address = wallet.address();

        let provider = Provider::new(mock);
        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let router = Router::new(router_address, client);

        let chain = ChainHandle {
            name: "sepolia".to_owned(),
            chain_id: 11_155_111,
            router,
            initiator_address,
            needs_poa_middleware: false,
        };

        let product_hash = "0xproduct-payments-test".to_owned();

        pool.add_product(&crate::database::types::Product {
            product_hash: product_hash.clone(),
            chain: "sepolia".to_owned(),
            merchant_address: "0x0000000000000000000000000000000000aaaa".to_owned(),
            token_address: SEPOLIA_USDC.to_owned(),
            token_symbol: "USDC".to_owned(),
            token_decimals: 6,
            uint_amount: "1000000".to_owned(),
            period: 2_592_000,
            payment_period: 259_200,
            free_trial_length: 0,
            metadata_hash: "00".to_owned(),
            merchant_domain: "merchant.example".to_owned(),
            product_name: "Pro plan".to_owned(),
        })
        .await?;

        pool.set_merchant_binding(&MerchantBinding {
            merchant_address: "0x0000000000000000000000000000000000aaaa".to_owned(),
            chain: "sepolia".to_owned(),
            initiator_address: format!("{initiator_address:#x}"),
        })
        .await?;

        let now = chrono::Utc::now().timestamp();
        pool.add_subscription(&crate::database::types::Subscription {
            subscription_hash: subscription_hash.to_owned(),
            product_hash,
            chain: "sepolia".to_owned(),
            user_address: "0x0000000000000000000000000000000000bbbb".to_owned(),
            start_ts: now - 2_592_001,
            payments_made: 0,
            terminated: false,
            subscription_id: None,
            user_id: None,
        })
        .await?;

        Ok(chain)
    }

    fn latest_block_with_base_fee() -> Option<Block<H256>> {
        let mut block = Block::<H256>::default();
        block.base_fee_per_gas = Some(U256::from(1_000_000_000u64));
        Some(block)
    }

    /// Scenario: a full `pay_one` run against a mocked chain with sufficient
    /// balance and allowance produces exactly one `payment-made` log and
    /// advances `payments_made`.
    #[tokio::test]
    async fn successful_payment_updates_store_and_logs_payment_made() -> anyhow::Result<()> {
        let (db, _container) = setup_db().await?;
        let pool = db.pool().clone();

        let router_address = Address::from_low_u64_be(0x5555);
        let required = U256::from(1_000_000u64);
        let tx_hash = H256::repeat_byte(0x77);

        let subscription_hash_h256 = H256::repeat_byte(0x22);
        let subscription_hash = format!("{subscription_hash_h256:#x}");
        let subscription_hash_bytes: [u8; 32] = subscription_hash_h256.into();
        let payment_log = Log {
            address: router_address,
            topics: vec![PaymentMadeFilter::signature()],
            data: abi_call_result(&[
                Token::FixedBytes(subscription_hash_bytes.to_vec()),
                Token::Uint(U256::from(1u64)),
            ]),
            ..Default::default()
        };
        let receipt = Some(TransactionReceipt {
            transaction_hash: tx_hash,
            logs: vec![payment_log],
            ..Default::default()
        });

        let mock = MockProvider::new();
        // Push order is the reverse of call order: `MockProvider` serves
        // queued responses last-in-first-out.
        for _ in 0..5 {
            mock.push(receipt.clone())?;
        }
        mock.push(tx_hash)?;
        mock.push(U256::zero())?; // eth_getTransactionCount (nonce)
        mock.push(latest_block_with_base_fee())?;
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[Token::Uint(required)]))?; // allowance
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[Token::Uint(required)]))?; // balanceOf

        let chain =
            seed_chain_and_subscription(&pool, router_address, &subscription_hash, mock).await?;

        let price_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "price": "0.0004",
            })))
            .mount(&price_server)
            .await;
        let price_oracle = PriceOracle::new().with_endpoint(price_server.uri().parse()?);

        run(
            &chain,
            &pool,
            &price_oracle,
            Duration::from_secs(5),
            1_000_000_000,
        )
        .await?;

        let stored = pool
            .get_subscription(&subscription_hash)
            .await?
            .expect("subscription still exists");
        assert_eq!(stored.payments_made, 1);

        let logs = pool.get_subscription_logs(&subscription_hash).await?;
        let payment_made_logs: Vec<_> = logs
            .iter()
            .filter(|l| l.log_type == SubscriptionLogType::PaymentMade.as_str())
            .collect();
        assert_eq!(payment_made_logs.len(), 1);

        Ok(())
    }

    /// Scenario: the receipt never arrives within `receipt_timeout` — the
    /// chain is frozen and a single `payment-issue` log records the timeout,
    /// via the real `payments::run` path (not a direct `pay_one` call).
    #[tokio::test]
    async fn receipt_timeout_freezes_chain_and_logs_payment_issue() -> anyhow::Result<()> {
        let (db, _container) = setup_db().await?;
        let pool = db.pool().clone();

        let router_address = Address::from_low_u64_be(0x6666);
        let required = U256::from(1_000_000u64);
        let tx_hash = H256::repeat_byte(0x88);
        let subscription_hash = format!("{:#x}", H256::repeat_byte(0x33));

        let mock = MockProvider::new();
        // The receipt poll never resolves within the short timeout below;
        // `None` is method-agnostic-safe to over-supply since every poll in
        // this phase requests the same `Option<TransactionReceipt>` type.
        for _ in 0..20 {
            mock.push(Option::<TransactionReceipt>::None)?;
        }
        mock.push(tx_hash)?;
        mock.push(U256::zero())?; // eth_getTransactionCount (nonce)
        mock.push(latest_block_with_base_fee())?;
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[Token::Uint(required)]))?; // allowance
        mock.push::<ethers::types::Bytes, _>(abi_call_result(&[Token::Uint(required)]))?; // balanceOf

        let chain =
            seed_chain_and_subscription(&pool, router_address, &subscription_hash, mock).await?;

        let price_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "price": "0.0004",
            })))
            .mount(&price_server)
            .await;
        let price_oracle = PriceOracle::new().with_endpoint(price_server.uri().parse()?);

        run(
            &chain,
            &pool,
            &price_oracle,
            Duration::from_millis(20),
            1_000_000_000,
        )
        .await?;

        assert!(pool.is_initiator_frozen("sepolia").await?);

        let stored = pool
            .get_subscription(&subscription_hash)
            .await?
            .expect("subscription still exists");
        assert_eq!(stored.payments_made, 0);

        let logs = pool.get_subscription_logs(&subscription_hash).await?;
        let payment_issue_logs: Vec<_> = logs
            .iter()
            .filter(|l| l.log_type == SubscriptionLogType::PaymentIssue.as_str())
            .collect();
        assert_eq!(payment_issue_logs.len(), 1);
        assert!(payment_issue_logs[0].message.contains("receipt timeout"));

        Ok(())
    }
}
