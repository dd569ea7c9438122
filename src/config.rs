use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::secret::{SecretString, SecretUrl};

/// Load configuration from an optional TOML file overlaid with
/// `SEQ__`-prefixed, `__`-separated environment variables.
///
/// # Errors
///
/// Returns `Err` if the file cannot be read or the merged configuration does
/// not deserialize into [`Config`].
pub fn load_config(config_file_path: Option<&Path>) -> anyhow::Result<Config> {
    let mut settings = config::Config::builder();

    if let Some(path) = config_file_path {
        settings = settings.add_source(config::File::from(path).required(true));
    }

    let settings = settings
        .add_source(
            config::Environment::with_prefix("SEQ")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize::<Config>()?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Private key of the externally-owned account used to sign and submit
    /// `makePayment` transactions on every configured chain. Consumed as-is;
    /// this service does not manage key custody.
    pub initiator_signing_key: SecretString,
}

/// Per-chain configuration: where the router lives and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Short, lowercase name used as the key prefix in the `setting` table
    /// (e.g. `sepolia_last_checked_payments_block`).
    pub name: String,

    pub chain_id: u64,

    pub router_address: Address,

    pub rpc_url: SecretUrl,

    /// Lower bound on the scan cursor; validated against chain head so a
    /// misconfigured, too-large value cannot skip real history.
    #[serde(default)]
    pub min_block: u64,

    /// Base priority fee for payment transactions on this chain, in wei.
    /// The initiator pads it by 10% (`tip' = ⌊1.1·priority_fee_wei⌋`) before
    /// use as `maxPriorityFeePerGas` (§4.5c).
    pub priority_fee_wei: u64,

    /// Whether the node requires the proof-of-authority extra-data middleware
    /// (needed for some L2s/testnets, e.g. Polygon PoS).
    #[serde(default)]
    pub needs_poa_middleware: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: SecretUrl,

    #[serde(default = "default::migrate")]
    pub migrate: bool,

    #[serde(default = "default::max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: SocketAddr,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::serve_timeout")]
    pub serve_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Base URL the indexer reads pinned blobs from, e.g. a gateway mirror.
    pub pinata_base_url: url::Url,

    /// Bearer token for `POST https://api.pinata.cloud/pinning/pinFileToIPFS`.
    pub pinata_api_key: SecretString,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Maximum number of blocks fetched in a single `eth_getLogs` call.
    #[serde(default = "default::max_log_range")]
    pub max_log_range: u64,

    /// Delay between scheduler ticks.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::time_between_ticks")]
    pub time_between_ticks: Duration,

    /// Timeout waiting for a payment transaction receipt before the chain is frozen.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::receipt_timeout")]
    pub receipt_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::shutdown_timeout")]
    pub shutdown_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::shutdown_delay")]
    pub shutdown_delay: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_log_range: default::max_log_range(),
            time_between_ticks: default::time_between_ticks(),
            receipt_timeout: default::receipt_timeout(),
            shutdown_timeout: default::shutdown_timeout(),
            shutdown_delay: default::shutdown_delay(),
        }
    }
}

pub mod default {
    use std::time::Duration;

    #[must_use]
    pub const fn migrate() -> bool {
        true
    }

    #[must_use]
    pub const fn max_connections() -> u32 {
        10
    }

    #[must_use]
    pub const fn serve_timeout() -> Duration {
        Duration::from_secs(30)
    }

    #[must_use]
    pub const fn max_log_range() -> u64 {
        100
    }

    #[must_use]
    pub const fn time_between_ticks() -> Duration {
        Duration::from_secs(12)
    }

    #[must_use]
    pub const fn receipt_timeout() -> Duration {
        Duration::from_secs(120)
    }

    #[must_use]
    pub const fn shutdown_timeout() -> Duration {
        Duration::from_secs(30)
    }

    #[must_use]
    pub const fn shutdown_delay() -> Duration {
        Duration::from_secs(1)
    }
}
