//! Background Sweeper
//!
//! Periodically removes expired entries. Each pass runs one blocking task per
//! shard, so shards are swept in parallel while each shard is swept under its
//! own exclusive lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::store::StoreCore;
use crate::error::{Error, Result};

/// Handle to a running sweeper task
#[derive(Debug)]
pub(crate) struct SweeperHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Spawn the sweeper on the current tokio runtime
    pub fn spawn<V>(core: Arc<StoreCore<V>>, period: Duration) -> Result<Self>
    where
        V: Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::NoRuntime("the cache sweeper"))?;
        let cancel = CancellationToken::new();
        let task = runtime.spawn(run(core, period, cancel.clone()));
        Ok(Self { cancel, task })
    }

    /// Request shutdown without waiting
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the in-flight pass to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Cache sweeper terminated abnormally: {}", e);
        }
    }
}

#[instrument(skip(core, cancel))]
async fn run<V>(core: Arc<StoreCore<V>>, period: Duration, cancel: CancellationToken)
where
    V: Send + Sync + 'static,
{
    info!(
        "Starting cache sweeper (interval={:?}, shards={})",
        period,
        core.shard_count()
    );

    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Cache sweeper shutting down");
                break;
            }

            _ = tick.tick() => {
                let removed = sweep_pass(&core).await;
                if removed > 0 {
                    debug!("Sweeper removed {} expired entries", removed);
                }
            }
        }
    }
}

/// One parallel pass over every shard. Returns the number of entries removed.
pub(crate) async fn sweep_pass<V>(core: &Arc<StoreCore<V>>) -> usize
where
    V: Send + Sync + 'static,
{
    let mut join_set = JoinSet::new();
    for index in 0..core.shard_count() {
        let core = Arc::clone(core);
        join_set.spawn_blocking(move || core.sweep_shard(index));
    }

    let mut removed = 0;
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(count) => removed += count,
            // One failed shard never stops the others or later passes
            Err(e) => error!("Sweeper shard pass failed: {}", e),
        }
    }
    removed
}
