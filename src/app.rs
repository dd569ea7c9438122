use std::sync::Arc;

use sqlx::{Pool, Postgres};
use tracing::{info, instrument};

use crate::chain::ChainHandle;
use crate::config::Config;
use crate::database::Database;
use crate::metadata::MetadataResolver;
use crate::price::PriceOracle;
use crate::shutdown::Shutdown;

/// Everything one running instance of the indexer needs: the database pool,
/// a connected client per configured chain, and the collaborators (metadata
/// resolver, price oracle) those clients call into. Constructed once at
/// startup and shared behind an `Arc` by the scheduler and the HTTP server.
pub struct App {
    pub pool: Pool<Postgres>,
    pub chains: Vec<ChainHandle>,
    pub config: Config,
    pub metadata: MetadataResolver,
    pub price_oracle: PriceOracle,
    pub shutdown: Arc<Shutdown>,
}

impl App {
    /// # Errors
    ///
    /// Will return `Err` if the database cannot be reached or migrated, or if
    /// any configured chain's RPC client cannot be constructed.
    #[instrument(name = "App::new", skip_all)]
    pub async fn new(config: Config, shutdown: Arc<Shutdown>) -> anyhow::Result<Self> {
        let database = Database::new(&config.database).await?;
        let pool = database.pool().clone();

        let metadata = MetadataResolver::new(&config.metadata, pool.clone());
        let price_oracle = PriceOracle::new();

        let mut chains = Vec::with_capacity(config.chains.len());
        for chain_config in &config.chains {
            let chain = ChainHandle::connect(chain_config, &config.initiator_signing_key).await?;
            chains.push(chain);
        }

        info!(chains = chains.len(), "App initialized");

        Ok(Self {
            pool,
            chains,
            config,
            metadata,
            price_oracle,
            shutdown,
        })
    }

    #[must_use]
    pub fn chain(&self, name: &str) -> Option<&ChainHandle> {
        self.chains.iter().find(|chain| chain.name == name)
    }
}
