use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tracing::{instrument, warn};
use url::Url;

use crate::config::MetadataConfig;
use crate::database::types::MetadataBlob;
use crate::database::DbMethods;
use crate::secret::SecretString;

const PINATA_PIN_ENDPOINT: &str = "https://api.pinata.cloud/pinning/pinFileToIPFS";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] crate::database::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("pinning service did not return valid JSON")]
    MalformedResponse,
}

#[derive(Debug, Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: String,
}

/// Resolves content-addressed off-chain metadata referenced by on-chain
/// events: interprets raw event bytes as a base58-encoded IPFS CID, consults
/// a local cache, and falls back to the pinning service on miss (§4.3).
#[derive(Clone)]
pub struct MetadataResolver {
    client: reqwest::Client,
    pinata_base_url: Url,
    pinata_api_key: SecretString,
    pin_endpoint: Url,
    pool: Pool<Postgres>,
}

impl MetadataResolver {
    #[must_use]
    pub fn new(config: &MetadataConfig, pool: Pool<Postgres>) -> Self {
        Self {
            client: reqwest::Client::new(),
            pinata_base_url: config.pinata_base_url.clone(),
            pinata_api_key: config.pinata_api_key.clone(),
            pin_endpoint: PINATA_PIN_ENDPOINT.parse().expect("valid built-in URL"),
            pool,
        }
    }

    /// Points the pinning endpoint elsewhere; used in tests against a mock server.
    #[must_use]
    pub fn with_pin_endpoint(mut self, endpoint: Url) -> Self {
        self.pin_endpoint = endpoint;
        self
    }

    /// Resolves raw on-chain metadata bytes to a JSON object. Returns `None`
    /// if the reference is empty or the pinning service cannot serve it;
    /// callers decide whether a missing result is fatal for the entity being
    /// ingested (§4.3).
    #[instrument(skip(self, raw))]
    pub async fn resolve(&self, raw: &[u8]) -> Result<Option<Value>, Error> {
        if raw.is_empty() {
            return Ok(None);
        }

        let cid = bs58::encode(raw).into_string();

        if let Some(content) = self.pool.get_cached_metadata(&cid).await? {
            return Ok(serde_json::from_str(&content).ok());
        }

        let url = format!(
            "{}/{cid}",
            self.pinata_base_url.as_str().trim_end_matches('/')
        );

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(%cid, %error, "Metadata fetch failed");
                return Ok(None);
            }
        };

        if !response.status().is_success() {
            warn!(%cid, status = %response.status(), "Metadata fetch returned non-success status");
            return Ok(None);
        }

        let content = response.text().await?;
        let Ok(value) = serde_json::from_str::<Value>(&content) else {
            warn!(%cid, "Metadata blob is not valid JSON");
            return Ok(None);
        };

        self.pool
            .cache_metadata(&MetadataBlob {
                cid,
                content,
            })
            .await?;

        Ok(Some(value))
    }

    /// Stores a caller-provided blob: reuses its CID if this exact content is
    /// already cached, otherwise pins it upstream and caches the result.
    #[instrument(skip(self, content))]
    pub async fn store(&self, content: &str) -> Result<String, Error> {
        if let Some(cid) = self.pool.get_cid_by_content(content).await? {
            return Ok(cid);
        }

        let cid = self.pin(content).await?;
        self.pool
            .cache_metadata(&MetadataBlob {
                cid: cid.clone(),
                content: content.to_owned(),
            })
            .await?;

        Ok(cid)
    }

    async fn pin(&self, content: &str) -> Result<String, Error> {
        let form = Form::new().part(
            "file",
            Part::bytes(content.as_bytes().to_vec()).file_name("metadata.json"),
        );

        let response = self
            .client
            .post(self.pin_endpoint.clone())
            .bearer_auth(self.pinata_api_key.expose())
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let parsed: PinResponse = response
            .json()
            .await
            .map_err(|_| Error::MalformedResponse)?;

        Ok(parsed.ipfs_hash)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::MetadataConfig;

    // `connect_lazy` never dials Postgres, so these tests can exercise the
    // HTTP-only code paths (`resolve`'s empty-input guard, `pin`) without a
    // live database; they only fail if a call actually reaches `self.pool`.
    fn resolver() -> MetadataResolver {
        let pool = Pool::<Postgres>::connect_lazy("postgres://localhost/unused")
            .expect("lazy pool never dials the network");
        MetadataResolver::new(
            &MetadataConfig {
                pinata_base_url: "https://example.invalid".parse().unwrap(),
                pinata_api_key: "test-key".parse().unwrap(),
            },
            pool,
        )
    }

    #[tokio::test]
    async fn resolve_returns_none_for_empty_reference() {
        assert_eq!(resolver().resolve(&[]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn pin_rejects_non_success_responses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let resolver = resolver().with_pin_endpoint(server.uri().parse().unwrap());
        let err = resolver.pin("{}").await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
    }

    #[tokio::test]
    async fn pin_parses_ipfs_hash_from_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "IpfsHash": "Qm_test_cid",
            })))
            .mount(&server)
            .await;

        let resolver = resolver().with_pin_endpoint(server.uri().parse().unwrap());
        let cid = resolver.pin("{}").await.unwrap();
        assert_eq!(cid, "Qm_test_cid");
    }

    #[tokio::test]
    async fn pin_rejects_non_json_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let resolver = resolver().with_pin_endpoint(server.uri().parse().unwrap());
        let err = resolver.pin("{}").await.unwrap_err();
        assert!(matches!(err, Error::MalformedResponse));
    }
}
