//! Hook callouts and the parking lot.
//!
//! Extensions attach to named points in the transaction lifecycle. A
//! callout can let the stage proceed, suppress the stage's default
//! action, drop the transaction, or park it. Parking transfers ownership
//! of the transaction into a bounded lot keyed by xid; the hook later
//! resumes or drops it, and a sweeper drops anything that overstays.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use stats::StatsMgr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{metrics, server::context::MsgContext};

/// named extension points in the transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalloutPoint {
    /// raw bytes arrived, not yet decoded
    BufferReceive,
    /// the query decoded
    PktReceive,
    /// a subnet was chosen for the query
    SubnetSelect,
    /// an address is about to be selected
    LeaseSelect,
    /// an offer is about to be made
    LeaseOffer,
    /// leases were written to the store
    LeasesCommitted,
    /// the response is built, not yet encoded
    PktSend,
    /// the response is encoded, about to hit the wire
    BufferSend,
    /// a release is about to be processed
    LeaseRelease,
    /// a decline is about to be processed
    LeaseDecline,
}

/// what a callout wants done with the in-flight transaction. When several
/// callouts run at one point, the most severe verdict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CalloutAction {
    /// proceed normally
    Continue,
    /// suppress the default action of this stage only
    Skip,
    /// abandon the transaction (counted drop)
    Drop,
    /// move the transaction to the parking lot
    Park,
}

/// an extension attached to one or more callout points
#[async_trait]
pub trait Callout<T>: Send + Sync + 'static {
    /// inspect/mutate the transaction at `point`
    async fn on_event(
        &self,
        point: CalloutPoint,
        ctx: &mut MsgContext<T>,
    ) -> Result<CalloutAction>;
}

/// callouts registered per point, dispatched in registration order
pub struct HookRegistry<T> {
    callouts: HashMap<CalloutPoint, Vec<Arc<dyn Callout<T>>>>,
}

impl<T> fmt::Debug for HookRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("points", &self.callouts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T> Default for HookRegistry<T> {
    fn default() -> Self {
        HookRegistry {
            callouts: HashMap::new(),
        }
    }
}

impl<T: 'static> HookRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// attach a callout to a point
    pub fn register(&mut self, point: CalloutPoint, callout: Arc<dyn Callout<T>>) {
        self.callouts.entry(point).or_default().push(callout);
    }

    pub fn is_empty(&self) -> bool {
        self.callouts.is_empty()
    }

    /// run every callout at `point`. A callout error counts as Drop.
    pub async fn dispatch(&self, point: CalloutPoint, ctx: &mut MsgContext<T>) -> CalloutAction {
        let mut verdict = CalloutAction::Continue;
        let Some(callouts) = self.callouts.get(&point) else {
            return verdict;
        };
        for callout in callouts {
            let action = match callout.on_event(point, ctx).await {
                Ok(action) => action,
                Err(err) => {
                    warn!(?err, ?point, "callout failed, dropping transaction");
                    CalloutAction::Drop
                }
            };
            verdict = verdict.max(action);
        }
        verdict
    }
}

/// one suspended transaction
pub struct Parked<T> {
    /// the transaction, ownership transferred from the worker
    pub ctx: MsgContext<T>,
    /// plugin index to continue the chain from
    pub resume_at: usize,
    deadline: Instant,
}

impl<T> fmt::Debug for Parked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parked")
            .field("resume_at", &self.resume_at)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// a resumed transaction handed back to the worker pool
#[derive(Debug)]
pub struct Resumed<T> {
    /// the transaction
    pub ctx: MsgContext<T>,
    /// plugin index to continue the chain from
    pub resume_at: usize,
}

/// Bounded set of suspended transactions, keyed by xid. Exceeding the
/// capacity degrades a park into a drop.
pub struct ParkingLot<T> {
    inner: Mutex<HashMap<u32, Parked<T>>>,
    capacity: usize,
    base_timeout: Duration,
    stats: Arc<StatsMgr>,
    /// which drop counter this family uses
    drop_stat: &'static str,
    resume_tx: mpsc::UnboundedSender<Resumed<T>>,
}

impl<T> fmt::Debug for ParkingLot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParkingLot")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<T> ParkingLot<T> {
    /// build the lot plus the receiver the worker pool drains resumed
    /// transactions from
    pub fn new(
        capacity: usize,
        base_timeout: Duration,
        stats: Arc<StatsMgr>,
        drop_stat: &'static str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Resumed<T>>) {
        let (resume_tx, resume_rx) = mpsc::unbounded_channel();
        (
            Arc::new(ParkingLot {
                inner: Mutex::new(HashMap::new()),
                capacity,
                base_timeout,
                stats,
                drop_stat,
                resume_tx,
            }),
            resume_rx,
        )
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("parking lot lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Park a transaction. When the lot is at capacity the park is
    /// refused, `parking-lot-full` is counted, and the transaction comes
    /// back to the caller to be dropped.
    pub fn park(
        &self,
        xid: u32,
        ctx: MsgContext<T>,
        resume_at: usize,
    ) -> Result<(), MsgContext<T>> {
        let mut inner = self.inner.lock().expect("parking lot lock poisoned");
        if inner.len() >= self.capacity {
            self.stats.inc("parking-lot-full");
            return Err(ctx);
        }
        // under pressure, overstayers get less slack
        let timeout = if inner.len() >= self.capacity / 2 {
            self.base_timeout / 2
        } else {
            self.base_timeout
        };
        debug!(xid, ?timeout, "parking transaction");
        inner.insert(
            xid,
            Parked {
                ctx,
                resume_at,
                deadline: Instant::now() + timeout,
            },
        );
        metrics::PARKED.set(inner.len() as i64);
        Ok(())
    }

    /// hand a parked transaction back to the worker pool. Returns false
    /// when the xid is not parked (already resumed, dropped, or swept).
    pub fn resume(&self, xid: u32) -> bool {
        let parked = {
            let mut inner = self.inner.lock().expect("parking lot lock poisoned");
            let parked = inner.remove(&xid);
            metrics::PARKED.set(inner.len() as i64);
            parked
        };
        match parked {
            Some(parked) => self
                .resume_tx
                .send(Resumed {
                    ctx: parked.ctx,
                    resume_at: parked.resume_at,
                })
                .is_ok(),
            None => false,
        }
    }

    /// abandon a parked transaction
    pub fn drop_parked(&self, xid: u32) -> bool {
        let mut inner = self.inner.lock().expect("parking lot lock poisoned");
        let dropped = inner.remove(&xid).is_some();
        if dropped {
            self.stats.inc(self.drop_stat);
        }
        metrics::PARKED.set(inner.len() as i64);
        dropped
    }

    /// drop every transaction whose deadline has passed. Called
    /// periodically; returns how many were dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().expect("parking lot lock poisoned");
        let overdue: Vec<u32> = inner
            .iter()
            .filter(|(_, parked)| parked.deadline <= now)
            .map(|(xid, _)| *xid)
            .collect();
        for xid in &overdue {
            debug!(xid, "parked transaction timed out, dropping");
            inner.remove(xid);
            self.stats.inc(self.drop_stat);
        }
        metrics::PARKED.set(inner.len() as i64);
        overdue.len()
    }

    /// drop everything still parked (shutdown drain)
    pub fn drain(&self) -> usize {
        let mut inner = self.inner.lock().expect("parking lot lock poisoned");
        let count = inner.len();
        inner.clear();
        metrics::PARKED.set(0);
        count
    }
}
