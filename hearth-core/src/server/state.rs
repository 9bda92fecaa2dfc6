//! Shared server state: the live-message bound, message ids, and the
//! statistics and duration stores every transaction reports into.
use tokio::sync::Semaphore;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use perfmon::MonitoredDurationStore;
use stats::StatsMgr;

use crate::metrics::IN_FLIGHT;

/// Represents the current Server state
#[derive(Debug)]
pub struct State {
    /// current live message count
    live_msgs: Arc<Semaphore>,
    /// max live message count
    live_limit: usize,
    /// id to assign incoming messages
    next_id: AtomicU64,
    /// named server statistics
    stats: Arc<StatsMgr>,
    /// per-transaction timing aggregation for this family
    durations: Arc<MonitoredDurationStore>,
}

impl State {
    /// Create new state with a set max live message count
    pub fn new(
        max_live: usize,
        stats: Arc<StatsMgr>,
        durations: Arc<MonitoredDurationStore>,
    ) -> State {
        State {
            live_msgs: Arc::new(Semaphore::new(max_live)),
            live_limit: max_live,
            next_id: AtomicU64::new(0),
            stats,
            durations,
        }
    }

    /// named statistics
    pub fn stats(&self) -> &Arc<StatsMgr> {
        &self.stats
    }

    /// this family's monitored-duration store
    pub fn durations(&self) -> &Arc<MonitoredDurationStore> {
        &self.durations
    }

    /// Increments the count of live in-flight messages
    pub async fn inc_live_msgs(&self) {
        // forget() must be used on the semaphore after acquire otherwise
        // it will add the permit back when the semaphore is dropped,
        // and we don't actually want to do that, we want to add it back
        //  when MsgContext is dropped
        //
        // SAFETY: acquire returns an Err when the semaphore is closed, which we never
        // do
        self.live_msgs.acquire().await.unwrap().forget();
        IN_FLIGHT.inc();
    }

    /// Decrements the count of live in-flight messages
    #[inline]
    pub fn dec_live_msgs(&self) {
        self.live_msgs.add_permits(1);
        IN_FLIGHT.dec();
    }

    /// Return the current number of live queries
    #[inline]
    pub fn live_msgs(&self) -> usize {
        self.live_limit - self.live_msgs.available_permits()
    }

    /// Increment the context id
    #[inline]
    pub fn inc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Acquire)
    }
}
