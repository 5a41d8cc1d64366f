//! Fee market snapshots and replacement fee arithmetic

use super::{FeeComponents, FeeMarket};
use crate::config::FeePolicy;
use crate::error::KeeperResult;

use alloy_primitives::U256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Short-lived cache over the fee market
///
/// One bump tick and every queued submission inside the TTL window share
/// a single quote instead of hammering the node.
pub struct FeeOracle {
    market: Arc<dyn FeeMarket>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, FeeComponents)>>,
}

impl FeeOracle {
    pub fn new(market: Arc<dyn FeeMarket>, ttl: Duration) -> Self {
        Self {
            market,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Current fee quote, served from cache while fresh
    pub async fn snapshot(&self) -> KeeperResult<FeeComponents> {
        let mut cached = self.cached.lock().await;
        if let Some((at, fees)) = *cached {
            if at.elapsed() < self.ttl {
                return Ok(fees);
            }
        }

        let fees = self.market.fee_rate().await?;
        debug!(
            max_fee = %fees.max_fee_per_gas,
            priority_fee = %fees.max_priority_fee_per_gas,
            "refreshed fee market snapshot"
        );
        *cached = Some((Instant::now(), fees));
        Ok(fees)
    }
}

/// Minimum a fee dimension must reach to supersede `previous`
fn replacement_floor(previous: U256, policy: &FeePolicy) -> U256 {
    previous * U256::from(100 + policy.min_increase_percent) / U256::from(100)
        + U256::from(policy.min_increase_absolute)
}

/// Decide whether the active variant's fees should be replaced
///
/// A dimension warrants a bump only when the market strictly exceeds it.
/// Once any dimension warrants one, every dimension is raised together to
/// `max(market, floor(previous))`, because the network rejects
/// replacements whose fees do not increase monotonically across the
/// board. Returns `None` when no bump is warranted, or when the
/// configured fee ceiling leaves no room to raise anything.
pub(crate) fn plan_bump(
    active: &FeeComponents,
    market: &FeeComponents,
    policy: &FeePolicy,
) -> Option<FeeComponents> {
    let warranted = market.max_fee_per_gas > active.max_fee_per_gas
        || market.max_priority_fee_per_gas > active.max_priority_fee_per_gas;
    if !warranted {
        return None;
    }

    let mut max_fee = std::cmp::max(
        market.max_fee_per_gas,
        replacement_floor(active.max_fee_per_gas, policy),
    );
    let mut priority_fee = std::cmp::max(
        market.max_priority_fee_per_gas,
        replacement_floor(active.max_priority_fee_per_gas, policy),
    );

    if let Some(cap) = policy.max_fee_per_gas {
        let cap = U256::from(cap);
        if max_fee > cap {
            warn!(planned = %max_fee, ceiling = %cap, "fee ceiling clamps replacement");
            max_fee = cap;
        }
        if priority_fee > max_fee {
            priority_fee = max_fee;
        }
    }

    let raises = max_fee > active.max_fee_per_gas
        || priority_fee > active.max_priority_fee_per_gas;
    if !raises {
        warn!(
            active = %active.max_fee_per_gas,
            ceiling = ?policy.max_fee_per_gas,
            "fee ceiling leaves no room to replace, will rebroadcast instead"
        );
        return None;
    }

    Some(FeeComponents {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: priority_fee,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fees(max_fee: u64, priority: u64) -> FeeComponents {
        FeeComponents {
            max_fee_per_gas: U256::from(max_fee),
            max_priority_fee_per_gas: U256::from(priority),
        }
    }

    fn policy(percent: u64, absolute: u128) -> FeePolicy {
        FeePolicy {
            min_increase_percent: percent,
            min_increase_absolute: absolute,
            ..FeePolicy::default()
        }
    }

    #[test]
    fn flat_market_warrants_no_bump() {
        assert!(plan_bump(&fees(100, 10), &fees(100, 10), &policy(11, 1)).is_none());
        assert!(plan_bump(&fees(100, 10), &fees(90, 5), &policy(11, 1)).is_none());
    }

    #[test]
    fn market_spike_takes_market_rate() {
        // floor = 100 * 1.11 + 1 = 112, market 200 wins
        let planned = plan_bump(&fees(100, 10), &fees(200, 10), &policy(11, 1)).unwrap();
        assert_eq!(planned.max_fee_per_gas, U256::from(200));
        // priority warranted no bump on its own but is raised to its floor
        assert_eq!(planned.max_priority_fee_per_gas, U256::from(12));
    }

    #[test]
    fn small_market_move_takes_relative_floor() {
        // market 101 barely exceeds, floor 112 wins
        let planned = plan_bump(&fees(100, 10), &fees(101, 10), &policy(11, 1)).unwrap();
        assert_eq!(planned.max_fee_per_gas, U256::from(112));
    }

    #[test]
    fn absolute_floor_guarantees_progress() {
        // zero percent policy still moves by the absolute minimum
        let planned = plan_bump(&fees(100, 10), &fees(101, 10), &policy(0, 5)).unwrap();
        assert_eq!(planned.max_fee_per_gas, U256::from(105));
        assert_eq!(planned.max_priority_fee_per_gas, U256::from(15));
    }

    #[test]
    fn priority_spike_raises_both_dimensions() {
        let planned = plan_bump(&fees(100, 10), &fees(100, 50), &policy(11, 1)).unwrap();
        assert_eq!(planned.max_priority_fee_per_gas, U256::from(50));
        // max fee was not warranted but must rise monotonically too
        assert_eq!(planned.max_fee_per_gas, U256::from(112));
    }

    #[test]
    fn ceiling_clamps_and_can_cancel_the_bump() {
        let mut p = policy(11, 1);
        p.max_fee_per_gas = Some(150);
        let planned = plan_bump(&fees(100, 10), &fees(200, 10), &p).unwrap();
        assert_eq!(planned.max_fee_per_gas, U256::from(150));

        // ceiling at the active rate leaves nothing to raise
        p.max_fee_per_gas = Some(100);
        let mut active = fees(100, 10);
        active.max_priority_fee_per_gas = U256::from(100);
        assert!(plan_bump(&active, &fees(200, 120), &p).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn oracle_caches_within_ttl() {
        use crate::error::KeeperResult;
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingMarket {
            calls: AtomicU32,
        }

        #[async_trait]
        impl FeeMarket for CountingMarket {
            async fn fee_rate(&self) -> KeeperResult<FeeComponents> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(FeeComponents {
                    max_fee_per_gas: U256::from(100),
                    max_priority_fee_per_gas: U256::from(10),
                })
            }
        }

        let market = Arc::new(CountingMarket {
            calls: AtomicU32::new(0),
        });
        let oracle = FeeOracle::new(market.clone(), Duration::from_secs(5));

        oracle.snapshot().await.unwrap();
        oracle.snapshot().await.unwrap();
        assert_eq!(market.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        oracle.snapshot().await.unwrap();
        assert_eq!(market.calls.load(Ordering::SeqCst), 2);
    }
}
