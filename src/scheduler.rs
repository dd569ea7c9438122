use std::sync::Arc;
use std::time::Duration;

use sqlx::{Pool, Postgres};
use tracing::{error, info, instrument};

use crate::chain::ChainHandle;
use crate::config::{ChainConfig, ScannerConfig};
use crate::metadata::MetadataResolver;
use crate::price::PriceOracle;
use crate::shutdown::Shutdown;

/// One cooperative driver loop per chain (§4.7, §5): run the four event
/// scanners then the payment initiator in sequence, catch all errors at this
/// level so a single bad tick cannot wedge the loop, then sleep. `main`
/// spawns one `Scheduler` per configured chain so a stalled RPC endpoint on
/// one chain cannot starve another's scanning or payments.
pub struct Scheduler {
    chain_config: ChainConfig,
    handle: ChainHandle,
    pool: Pool<Postgres>,
    metadata: MetadataResolver,
    price_oracle: PriceOracle,
    scanner_config: ScannerConfig,
    shutdown: Arc<Shutdown>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        chain_config: ChainConfig,
        handle: ChainHandle,
        pool: Pool<Postgres>,
        metadata: MetadataResolver,
        price_oracle: PriceOracle,
        scanner_config: ScannerConfig,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            chain_config,
            handle,
            pool,
            metadata,
            price_oracle,
            scanner_config,
            shutdown,
        }
    }

    #[instrument(skip_all, fields(chain = %self.chain_config.name))]
    pub async fn run(&self) {
        info!("Scheduler starting for chain");

        // Short warmup so the first tick doesn't race provider connection setup.
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
            () = self.shutdown.await_shutdown_begin() => return,
        }

        loop {
            if self.shutdown.is_shutting_down() {
                info!("Scheduler shutting down");
                return;
            }

            if let Err(error) = self.tick().await {
                error!(%error, "Scheduler tick failed");
            }

            tokio::select! {
                () = tokio::time::sleep(self.scanner_config.time_between_ticks) => {}
                () = self.shutdown.await_shutdown_begin() => {
                    info!("Scheduler shutting down");
                    return;
                }
            }
        }
    }

    async fn tick(&self) -> anyhow::Result<()> {
        self.handle
            .scan(
                &self.pool,
                &self.metadata,
                self.chain_config.min_block,
                self.scanner_config.max_log_range,
            )
            .await?;

        self.handle
            .pay_due_subscriptions(
                &self.pool,
                &self.price_oracle,
                self.scanner_config.receipt_timeout,
                self.chain_config.priority_fee_wei,
            )
            .await?;

        Ok(())
    }
}
