use async_trait::async_trait;
use once_cell::sync::Lazy;
use sqlx::{Acquire, Postgres, Row};
use tokio::sync::Mutex;
use tracing::instrument;

use super::types::{
    MerchantBinding, MetadataBlob, Product, Subscription, SubscriptionLog, SubscriptionLogType,
};
use super::Error;

fn cursor_key(chain: &str, kind: &str) -> String {
    format!("{chain}_{kind}_cursor")
}

fn frozen_key(chain: &str) -> String {
    format!("{chain}_initiator_frozen")
}

/// Single-writer discipline (§4.2/§5): every mutating statement holds this
/// process-wide lock for its duration, so concurrent reads from the Query
/// Interface never interleave with a write mid-statement. Reads are exempt
/// and proceed concurrently against the pool.
static WRITE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[async_trait]
pub trait DbMethods<'c>: Acquire<'c, Database = Postgres> + Sized + Send {
    /// Returns `max(min_block, stored)`; a missing cursor is treated as `min_block`.
    #[instrument(skip(self), level = "debug")]
    async fn get_cursor(self, chain: &str, kind: &str, min_block: u64) -> Result<u64, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query("SELECT value FROM setting WHERE key = $1")
            .bind(cursor_key(chain, kind))
            .fetch_optional(&mut *conn)
            .await?;

        let Some(row) = row else {
            return Ok(min_block);
        };

        let stored: i64 = row
            .get::<String, _>(0)
            .parse()
            .map_err(|_| Error::InvalidHex(cursor_key(chain, kind)))?;

        Ok(min_block.max(stored as u64))
    }

    #[instrument(skip(self), level = "debug")]
    async fn set_cursor(self, chain: &str, kind: &str, block: u64) -> Result<(), Error> {
        let _guard = WRITE_LOCK.lock().await;
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO setting (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(cursor_key(chain, kind))
        .bind((block as i64).to_string())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn is_initiator_frozen(self, chain: &str) -> Result<bool, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query("SELECT 1 FROM setting WHERE key = $1")
            .bind(frozen_key(chain))
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row.is_some())
    }

    /// Latches the chain frozen. Only cleared by operator intervention
    /// (direct row deletion), never automatically.
    #[instrument(skip(self), level = "debug")]
    async fn freeze_initiator(self, chain: &str) -> Result<(), Error> {
        let _guard = WRITE_LOCK.lock().await;
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO setting (key, value) VALUES ($1, 'true')
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(frozen_key(chain))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn add_product(self, product: &Product) -> Result<(), Error> {
        let _guard = WRITE_LOCK.lock().await;
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO product (
                product_hash, chain, merchant_address, token_address, token_symbol,
                token_decimals, uint_amount, period, payment_period, free_trial_length,
                metadata_hash, merchant_domain, product_name
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (product_hash) DO NOTHING
            "#,
        )
        .bind(&product.product_hash)
        .bind(&product.chain)
        .bind(&product.merchant_address)
        .bind(&product.token_address)
        .bind(&product.token_symbol)
        .bind(product.token_decimals)
        .bind(&product.uint_amount)
        .bind(product.period)
        .bind(product.payment_period)
        .bind(product.free_trial_length)
        .bind(&product.metadata_hash)
        .bind(&product.merchant_domain)
        .bind(&product.product_name)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_product(self, product_hash: &str) -> Result<Option<Product>, Error> {
        let mut conn = self.acquire().await?;

        let product = sqlx::query_as::<_, Product>("SELECT * FROM product WHERE product_hash = $1")
            .bind(product_hash)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(product)
    }

    #[instrument(skip(self), level = "debug")]
    async fn add_subscription(self, subscription: &Subscription) -> Result<(), Error> {
        let _guard = WRITE_LOCK.lock().await;
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO subscription (
                subscription_hash, product_hash, chain, user_address, start_ts,
                payments_made, terminated, subscription_id, user_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (subscription_hash) DO NOTHING
            "#,
        )
        .bind(&subscription.subscription_hash)
        .bind(&subscription.product_hash)
        .bind(&subscription.chain)
        .bind(&subscription.user_address)
        .bind(subscription.start_ts)
        .bind(subscription.payments_made)
        .bind(subscription.terminated)
        .bind(&subscription.subscription_id)
        .bind(&subscription.user_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_subscription(self, subscription_hash: &str) -> Result<Option<Subscription>, Error> {
        let mut conn = self.acquire().await?;

        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscription WHERE subscription_hash = $1",
        )
        .bind(subscription_hash)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(subscription)
    }

    /// `payments_made <- max(payments_made, n)`. A no-op if `n` does not advance the count.
    #[instrument(skip(self), level = "debug")]
    async fn update_payments_made(self, subscription_hash: &str, n: i64) -> Result<(), Error> {
        let _guard = WRITE_LOCK.lock().await;
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            UPDATE subscription
            SET payments_made = GREATEST(payments_made, $2)
            WHERE subscription_hash = $1
            "#,
        )
        .bind(subscription_hash)
        .bind(n)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Irreversible: sets `terminated = true`. Never clears it back.
    #[instrument(skip(self), level = "debug")]
    async fn terminate(self, subscription_hash: &str) -> Result<(), Error> {
        let _guard = WRITE_LOCK.lock().await;
        let mut conn = self.acquire().await?;

        sqlx::query("UPDATE subscription SET terminated = TRUE WHERE subscription_hash = $1")
            .bind(subscription_hash)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// Upsert with last-write-wins, unlike every other entity in this store:
    /// `InitiatorChanged` events must overwrite the previous binding.
    #[instrument(skip(self), level = "debug")]
    async fn set_merchant_binding(self, binding: &MerchantBinding) -> Result<(), Error> {
        let _guard = WRITE_LOCK.lock().await;
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO merchant (merchant_address, chain, initiator_address)
            VALUES ($1, $2, $3)
            ON CONFLICT (merchant_address, chain)
            DO UPDATE SET initiator_address = EXCLUDED.initiator_address
            "#,
        )
        .bind(&binding.merchant_address)
        .bind(&binding.chain)
        .bind(&binding.initiator_address)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_merchant_binding(
        self,
        merchant_address: &str,
        chain: &str,
    ) -> Result<Option<MerchantBinding>, Error> {
        let mut conn = self.acquire().await?;

        let binding = sqlx::query_as::<_, MerchantBinding>(
            "SELECT * FROM merchant WHERE merchant_address = $1 AND chain = $2",
        )
        .bind(merchant_address)
        .bind(chain)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(binding)
    }

    /// Subscriptions due for payment right now on `chain`, bound to `initiator`,
    /// excluding any whose next payment number was attempted (and failed) within
    /// the last 24 hours.
    #[instrument(skip(self), level = "debug")]
    async fn get_payable(
        self,
        chain: &str,
        now: i64,
        initiator: &str,
    ) -> Result<Vec<Subscription>, Error> {
        let mut conn = self.acquire().await?;

        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT s.*
            FROM subscription s
            JOIN product p ON p.product_hash = s.product_hash
            JOIN merchant m ON m.merchant_address = p.merchant_address AND m.chain = p.chain
            WHERE s.chain = $1
              AND NOT s.terminated
              AND m.initiator_address = $2
              AND $3 > (s.start_ts + p.period * s.payments_made)
              AND $3 < (s.start_ts + p.period * s.payments_made + p.payment_period)
              AND NOT EXISTS (
                  SELECT 1 FROM subscription_log l
                  WHERE l.subscription_hash = s.subscription_hash
                    AND l.log_type = 'payment-issue'
                    AND l.payment_number = s.payments_made + 1
                    AND l.timestamp > (CURRENT_TIMESTAMP - INTERVAL '24 hours')
              )
            "#,
        )
        .bind(chain)
        .bind(initiator)
        .bind(now)
        .fetch_all(&mut *conn)
        .await?;

        Ok(subscriptions)
    }

    #[instrument(skip(self), level = "debug")]
    async fn add_subscription_log(
        self,
        log_type: SubscriptionLogType,
        subscription_hash: &str,
        payment_number: i64,
        message: &str,
    ) -> Result<(), Error> {
        let _guard = WRITE_LOCK.lock().await;
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO subscription_log (log_type, subscription_hash, payment_number, message)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(log_type.as_str())
        .bind(subscription_hash)
        .bind(payment_number)
        .bind(message)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_subscription_logs(self, subscription_hash: &str) -> Result<Vec<SubscriptionLog>, Error> {
        let mut conn = self.acquire().await?;

        let logs = sqlx::query_as::<_, SubscriptionLog>(
            r#"
            SELECT * FROM subscription_log
            WHERE subscription_hash = $1
            ORDER BY timestamp DESC
            "#,
        )
        .bind(subscription_hash)
        .fetch_all(&mut *conn)
        .await?;

        Ok(logs)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_cached_metadata(self, cid: &str) -> Result<Option<String>, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query("SELECT content FROM metadata WHERE cid = $1")
            .bind(cid)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row.map(|row| row.get::<String, _>(0)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_cid_by_content(self, content: &str) -> Result<Option<String>, Error> {
        let mut conn = self.acquire().await?;

        let row = sqlx::query("SELECT cid FROM metadata WHERE content = $1")
            .bind(content)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row.map(|row| row.get::<String, _>(0)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn cache_metadata(self, blob: &MetadataBlob) -> Result<(), Error> {
        let _guard = WRITE_LOCK.lock().await;
        let mut conn = self.acquire().await?;

        sqlx::query(
            r#"
            INSERT INTO metadata (cid, content) VALUES ($1, $2)
            ON CONFLICT (cid) DO NOTHING
            "#,
        )
        .bind(&blob.cid)
        .bind(&blob.content)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_subscription_by_hash(self, subscription_hash: &str) -> Result<Option<Subscription>, Error> {
        self.get_subscription(subscription_hash).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_subscriptions_by_user(
        self,
        chain: &str,
        user_address: &str,
    ) -> Result<Vec<Subscription>, Error> {
        let mut conn = self.acquire().await?;

        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscription
            WHERE chain = $1 AND user_address = $2
            ORDER BY start_ts DESC
            "#,
        )
        .bind(chain)
        .bind(user_address)
        .fetch_all(&mut *conn)
        .await?;

        Ok(subscriptions)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_subscriptions_by_merchant_domain(
        self,
        merchant_domain: &str,
    ) -> Result<Vec<Subscription>, Error> {
        let mut conn = self.acquire().await?;

        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT s.* FROM subscription s
            JOIN product p ON p.product_hash = s.product_hash
            WHERE p.merchant_domain = $1
            ORDER BY s.start_ts DESC
            "#,
        )
        .bind(merchant_domain)
        .fetch_all(&mut *conn)
        .await?;

        Ok(subscriptions)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_subscriptions_by_merchant_and_user(
        self,
        merchant_address: &str,
        user_address: &str,
    ) -> Result<Vec<Subscription>, Error> {
        let mut conn = self.acquire().await?;

        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT s.* FROM subscription s
            JOIN product p ON p.product_hash = s.product_hash
            WHERE p.merchant_address = $1 AND s.user_address = $2
            ORDER BY s.start_ts DESC
            "#,
        )
        .bind(merchant_address)
        .bind(user_address)
        .fetch_all(&mut *conn)
        .await?;

        Ok(subscriptions)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_subscription_by_merchant_and_subscription_id(
        self,
        merchant_address: &str,
        subscription_id: &str,
    ) -> Result<Option<Subscription>, Error> {
        let mut conn = self.acquire().await?;

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT s.* FROM subscription s
            JOIN product p ON p.product_hash = s.product_hash
            WHERE p.merchant_address = $1 AND s.subscription_id = $2
            "#,
        )
        .bind(merchant_address)
        .bind(subscription_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(subscription)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_all_subscriptions(self) -> Result<Vec<Subscription>, Error> {
        let mut conn = self.acquire().await?;

        let subscriptions =
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscription ORDER BY start_ts DESC")
                .fetch_all(&mut *conn)
                .await?;

        Ok(subscriptions)
    }
}

impl<'a, T> DbMethods<'a> for T where T: Acquire<'a, Database = Postgres> + Send + Sync + Sized {}
