//! Repeatedly attempt to join the configured cluster addresses.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::gossip::Gossip;

/// Keep trying `addrs` every `interval` until at least one join succeeds or
/// the attempt budget is exhausted. `max_attempts` of 0 retries forever.
pub async fn retry_join(
    gossip: Arc<Gossip>,
    addrs: Vec<String>,
    interval: Duration,
    max_attempts: u64,
    shutdown: CancellationToken,
) -> Result<(), String> {
    if addrs.is_empty() {
        return Ok(());
    }

    let mut attempt = 0u64;
    loop {
        attempt += 1;
        let contacted = gossip.join(&addrs).await;
        if contacted > 0 {
            tracing::info!(contacted, "agent: join completed");
            return Ok(());
        }

        tracing::warn!(attempt, "agent: join failed, will retry");
        if max_attempts > 0 && attempt >= max_attempts {
            return Err(format!("agent: max join retry attempts made ({attempt})"));
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
