use ethers::providers::Middleware;
use ethers::types::{Address, Filter, Log, Topic, ValueOrArray};

/// Bounded-range `eth_getLogs` pagination over `[cursor+1, head]`.
///
/// Each call to [`next`](Self::next) advances by at most `window_size` blocks
/// and never past the chain head observed at call time. Callers own cursor
/// persistence: advance the durable cursor only after the returned slice has
/// been fully handled (§4.1, §4.4).
pub struct BlockScanner<M> {
    provider: M,
    current_block: u64,
    window_size: u64,
}

impl<M> BlockScanner<M>
where
    M: Middleware,
    M::Error: 'static,
{
    #[must_use]
    pub const fn new(provider: M, from_block: u64, window_size: u64) -> Self {
        Self {
            provider,
            current_block: from_block,
            window_size,
        }
    }

    /// Fetches the next bounded-range slice of logs matching `address` and
    /// `topics`, returning `(logs, end_block)`. Returns `None` once the
    /// scanner has caught up to the chain head.
    pub async fn next(
        &mut self,
        address: ValueOrArray<Address>,
        topics: [Option<Topic>; 4],
    ) -> anyhow::Result<Option<(Vec<Log>, u64)>> {
        let head = self.provider.get_block_number().await?.as_u64();

        if self.current_block > head {
            return Ok(None);
        }

        let end = head.min(self.current_block + self.window_size - 1);

        let mut filter = Filter::new()
            .from_block(self.current_block)
            .to_block(end)
            .address(address);
        filter.topics = topics;

        let logs = self.provider.get_logs(&filter).await?;

        self.current_block = end + 1;

        Ok(Some((logs, end)))
    }

    #[must_use]
    pub const fn current_block(&self) -> u64 {
        self.current_block
    }
}
