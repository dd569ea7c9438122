pub mod abi;
pub mod events;
pub mod payments;
pub mod scanner;

use std::sync::Arc;
use std::time::Duration;

use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Topic, ValueOrArray};
use sqlx::{Pool, Postgres};
use tracing::{info, instrument, warn};

use self::abi::Router;
use self::events::{handle_log, EventKind, EVENT_KINDS};
use self::scanner::BlockScanner;
use crate::config::ChainConfig;
use crate::database::DbMethods;
use crate::metadata::MetadataResolver;
use crate::price::PriceOracle;
use crate::secret::SecretString;

pub type SignerProvider = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Everything needed to index and pay one configured chain: a read provider
/// for cursor-based log scanning and a signing client bound to the router
/// contract for submitting payments. Cheap to clone: the underlying client
/// is `Arc`-wrapped.
///
/// Generic over the inner provider so tests can substitute a mocked client;
/// production code only ever constructs `ChainHandle<SignerProvider>` via
/// [`connect`](Self::connect).
#[derive(Clone)]
pub struct ChainHandle<P = SignerProvider>
where
    P: Middleware,
{
    pub name: String,
    pub chain_id: u64,
    pub router: Router<P>,
    pub initiator_address: Address,

    /// Chain lacks EIP-1559 support (e.g. older PoA/Clique networks): submit
    /// legacy `gasPrice` transactions instead of `maxFeePerGas`/
    /// `maxPriorityFeePerGas` ones (§4.5c, §6 `needs_poa_middleware`).
    pub needs_poa_middleware: bool,
}

impl ChainHandle<SignerProvider> {
    #[instrument(skip(config, signing_key), fields(chain = %config.name))]
    pub async fn connect(config: &ChainConfig, signing_key: &SecretString) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.expose())?;

        let wallet: LocalWallet = signing_key.expose().parse()?;
        let wallet = wallet.with_chain_id(config.chain_id);
        let initiator_address = wallet.address();

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let router = Router::new(config.router_address, client);

        info!(?initiator_address, chain_id = config.chain_id, "Connected chain client");

        Ok(Self {
            name: config.name.clone(),
            chain_id: config.chain_id,
            router,
            initiator_address,
            needs_poa_middleware: config.needs_poa_middleware,
        })
    }
}

impl<P> ChainHandle<P>
where
    P: Middleware + 'static,
{
    #[must_use]
    pub fn provider(&self) -> Arc<P> {
        self.router.client()
    }

    /// Scans all four router event kinds forward from their stored cursors
    /// to the chain head, in bounded `max_log_range`-block slices (§4.4).
    #[instrument(skip_all, fields(chain = %self.name))]
    pub async fn scan(
        &self,
        pool: &Pool<Postgres>,
        metadata: &MetadataResolver,
        min_block: u64,
        max_log_range: u64,
    ) -> anyhow::Result<()> {
        for kind in EVENT_KINDS {
            self.scan_kind(pool, metadata, kind, min_block, max_log_range)
                .await?;
        }
        Ok(())
    }

    async fn scan_kind(
        &self,
        pool: &Pool<Postgres>,
        metadata: &MetadataResolver,
        kind: EventKind,
        min_block: u64,
        max_log_range: u64,
    ) -> anyhow::Result<()> {
        let timer = crate::metrics::SCAN_LATENCY_SECONDS
            .with_label_values(&[&self.name, kind.as_str()])
            .start_timer();

        let cursor = pool.get_cursor(&self.name, kind.as_str(), min_block).await?;
        let mut scanner = BlockScanner::new(self.provider(), cursor + 1, max_log_range);

        let address = ValueOrArray::Value(self.router.address());
        let topics: [Option<Topic>; 4] = [
            Some(ValueOrArray::Value(kind.topic0()).into()),
            None,
            None,
            None,
        ];

        loop {
            let slice = match scanner.next(address.clone(), topics.clone()).await {
                Ok(slice) => slice,
                Err(error) => {
                    warn!(chain = %self.name, kind = kind.as_str(), %error, "Log scan failed; resuming next tick");
                    timer.observe_duration();
                    return Ok(());
                }
            };

            let Some((logs, end)) = slice else {
                break;
            };

            crate::metrics::SCAN_LOGS_PROCESSED
                .with_label_values(&[&self.name, kind.as_str()])
                .inc_by(logs.len() as u64);

            for log in &logs {
                if let Err(error) = handle_log(pool, &self.name, kind, &self.router, metadata, log).await
                {
                    warn!(chain = %self.name, kind = kind.as_str(), %error, "Event handler failed; resuming next tick");
                    timer.observe_duration();
                    return Ok(());
                }
            }

            pool.set_cursor(&self.name, kind.as_str(), end).await?;
        }

        timer.observe_duration();
        Ok(())
    }

    /// Runs the payment initiator once for this chain (§4.5).
    #[instrument(skip_all, fields(chain = %self.name))]
    pub async fn pay_due_subscriptions(
        &self,
        pool: &Pool<Postgres>,
        price_oracle: &PriceOracle,
        receipt_timeout: Duration,
        priority_fee_wei: u64,
    ) -> anyhow::Result<()> {
        payments::run(self, pool, price_oracle, receipt_timeout, priority_fee_wei).await
    }
}
