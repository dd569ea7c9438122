use ethers::types::Address;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::instrument;
use url::Url;

const AVG_PRICE_ENDPOINT: &str = "https://api.binance.com/api/v3/avgPrice";

#[derive(Debug, Error)]
pub enum Error {
    #[error("no price venue mapping for token {token:#x} on chain {chain}")]
    UnsupportedToken { chain: String, token: Address },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("price venue returned a non-numeric price: {0}")]
    MalformedPrice(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct AvgPriceResponse {
    price: String,
}

/// Static (chain, token) -> exchange-symbol table. Extend when onboarding a
/// new token; there is no on-chain discovery mechanism for price venues.
static TOKEN_TO_SYMBOL: Lazy<HashMap<(&'static str, Address), &'static str>> = Lazy::new(|| {
    HashMap::from([
        (
            (
                "sepolia",
                "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"
                    .parse()
                    .unwrap(),
            ),
            "USDCETH",
        ),
        (
            (
                "mumbai",
                "0x0FA8781a83E46826621b3BC094Ea2A0212e71B23"
                    .parse()
                    .unwrap(),
            ),
            "USDCMATIC",
        ),
    ])
});

/// Token -> native-coin price lookup (§4.6). The returned price is always in
/// the `token -> native` direction, so `gas_in_native * price = gas_in_token`.
#[derive(Clone)]
pub struct PriceOracle {
    client: reqwest::Client,
    endpoint: Url,
}

impl Default for PriceOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceOracle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: AVG_PRICE_ENDPOINT.parse().expect("valid built-in URL"),
        }
    }

    /// Points the venue endpoint elsewhere; used in tests against a mock server.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    #[instrument(skip(self))]
    pub async fn get_token_to_native(&self, chain: &str, token: Address) -> Result<f64, Error> {
        let symbol = TOKEN_TO_SYMBOL
            .get(&(chain, token))
            .ok_or(Error::UnsupportedToken {
                chain: chain.to_owned(),
                token,
            })?;

        let response: AvgPriceResponse = self
            .client
            .get(self.endpoint.clone())
            .query(&[("symbol", *symbol)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .price
            .parse::<f64>()
            .map_err(|_| Error::MalformedPrice(response.price))
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn sepolia_usdc() -> Address {
        "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn price_direction_is_token_to_native() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(AvgPriceResponse {
                price: "0.0004".to_owned(),
            }))
            .mount(&server)
            .await;

        let oracle = PriceOracle::new().with_endpoint(server.uri().parse().unwrap());
        let price = oracle
            .get_token_to_native("sepolia", sepolia_usdc())
            .await
            .unwrap();

        // A quote of 0.0004 ETH per USDC means 1 gas-unit of ETH converts to
        // far fewer token units than it would at parity.
        let gas_in_native = 0.01_f64;
        let gas_in_token = gas_in_native * price;
        assert!(gas_in_token < gas_in_native);
        assert!((price - 0.0004).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn unsupported_token_is_rejected() {
        let oracle = PriceOracle::new();
        let err = oracle
            .get_token_to_native("sepolia", Address::zero())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedToken { .. }));
    }
}
