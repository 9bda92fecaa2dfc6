//! # Server
//!
//! Contains the main server code: the socket reactor feeding the bounded
//! packet queue, the worker pool driving each transaction through the
//! plugin chain and hook callouts, the parking lot for suspended
//! transactions, and shutdown draining.
use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use perfmon::{DurationKey, MonitoredDurationStore};
use pnet::datalink::NetworkInterface;
use proto::{Decodable, Encodable, v4, v6};
use stats::StatsMgr;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::time;
use tracing::{debug, error, info, instrument, trace, warn};
use unix_udp_sock::UdpSocket;

use std::{
    any::{Any, TypeId},
    fmt,
    future::Future,
    os::unix::prelude::{FromRawFd, IntoRawFd},
    sync::Arc,
    time::{Duration, Instant},
};

pub mod context;
pub mod msg;
pub(crate) mod queue;
pub mod shutdown;
pub mod state;
pub mod topo_sort;
pub mod typemap;

use crate::{
    config::cli::{ALL_DHCP_RELAY_AGENTS_AND_SERVERS, Config},
    handler::*,
    hook::{CalloutAction, CalloutPoint, HookRegistry, ParkingLot, Resumed},
    server::{
        context::{
            EVENT_PROCESS_COMPLETED, EVENT_PROCESS_STARTED, EVENT_RECEIVED, EVENT_RESPONSE_SENT,
            SelectedSubnet, XidKey,
        },
        queue::Ingress,
        shutdown::Shutdown,
        topo_sort::DependencyTree,
    },
};

pub use crate::server::state::State;

/// Handy type alias for different `handle` traits
pub(crate) type PluginFn<T> = Arc<dyn Plugin<T>>;
pub(crate) type PostResponseFn<T> = Arc<dyn PostResponse<T>>;

/// per-family wiring the generic engine needs
pub trait FamilyMsg: Encodable + Decodable + XidKey + Send + Sync + fmt::Debug + 'static {
    /// which drop counter this family charges
    const DROP_STAT: &'static str;
    /// which duration store family this maps to
    const FAMILY: perfmon::Family;
    /// the query's message type as a wire byte (0 when absent)
    fn query_type(&self) -> u8;
}

impl FamilyMsg for v4::Message {
    const DROP_STAT: &'static str = "pkt4-receive-drop";
    const FAMILY: perfmon::Family = perfmon::Family::V4;
    fn query_type(&self) -> u8 {
        self.opts().msg_type().map(u8::from).unwrap_or(0)
    }
}

impl FamilyMsg for v6::Message {
    const DROP_STAT: &'static str = "pkt6-receive-drop";
    const FAMILY: perfmon::Family = perfmon::Family::V6;
    fn query_type(&self) -> u8 {
        u8::from(self.msg_type())
    }
}

/// Holds the plugin chain, hook callouts, and shared state for one
/// protocol family. Built up at startup, then consumed by
/// [`Server::start`].
pub struct Server<T> {
    /// all the plugins the server will use expressed as a dependency tree
    plugins: DependencyTree<TypeId, PluginFn<T>>,
    /// there can only be one post response plugin as it consumes `MsgContext<T>`
    postresponse: Option<PostResponseFn<T>>,
    /// callouts keyed by lifecycle point
    hooks: HookRegistry<T>,
    /// additional application state
    state: State,
    /// server config
    config: Config,
    interfaces: Vec<NetworkInterface>,
    parking: Arc<ParkingLot<T>>,
    resume_rx: mpsc::UnboundedReceiver<Resumed<T>>,
}

impl<T> fmt::Debug for Server<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}

impl<T> Server<T>
where
    T: FamilyMsg,
{
    /// Make a new server for one protocol family
    pub fn new(
        config: Config,
        interfaces: Vec<NetworkInterface>,
        stats: Arc<StatsMgr>,
        durations: Arc<MonitoredDurationStore>,
    ) -> Result<Server<T>> {
        let state = State::new(config.max_live_msgs, Arc::clone(&stats), durations);
        let (parking, resume_rx) = ParkingLot::new(
            config.parked_packet_limit,
            config.parked_packet_timeout(),
            stats,
            T::DROP_STAT,
        );

        Ok(Server {
            plugins: DependencyTree::new(),
            postresponse: None,
            hooks: HookRegistry::new(),
            state,
            config,
            interfaces,
            parking,
            resume_rx,
        })
    }

    /// the parking lot, for hooks that park transactions and the tests
    /// that poke them
    pub fn parking_lot(&self) -> Arc<ParkingLot<T>> {
        Arc::clone(&self.parking)
    }

    /// Add plugin to the list of handlers
    pub fn plugin<P, U>(&mut self, plugin: U) -> &mut Self
    where
        U: Into<Arc<P>>,
        P: Plugin<T>,
    {
        self.plugin_order(plugin, &[])
    }

    /// Add plugin to the list of handlers, specifying dependencies
    pub fn plugin_order<P, U>(&mut self, plugin: U, dependencies: &[TypeId]) -> &mut Self
    where
        U: Into<Arc<P>>,
        P: Plugin<T>,
    {
        let plugin = plugin.into();
        let id = <P as Any>::type_id(&plugin);
        self.plugins.add(id, plugin, dependencies);
        self
    }

    /// Add plugin to the postresponse list of handlers
    pub fn postresponse<P, U>(&mut self, plugin: U) -> &mut Self
    where
        U: Into<Arc<P>>,
        P: PostResponse<T>,
    {
        if self.postresponse.is_some() {
            warn!("Replacing postresponse plugin. There can only be one.");
        }
        self.postresponse.replace(plugin.into());
        self
    }

    /// Attach a hook callout to a lifecycle point
    pub fn callout(
        &mut self,
        point: CalloutPoint,
        callout: Arc<dyn crate::hook::Callout<T>>,
    ) -> &mut Self {
        self.hooks.register(point, callout);
        self
    }

    /// consume `Server<T>` and return `Service<T>` which has the
    /// dependencies topologically sorted and in a list, shutdown handlers, etc
    fn into_service(self) -> Result<Service<T>> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        Ok(Service {
            plugins: Arc::new(ServiceInner {
                plugins: self
                    .plugins
                    .topological_sort()
                    .context("plugin dependency sort failed")?,
                postresponse: self.postresponse,
                hooks: Arc::new(self.hooks),
                config: self.config,
                interfaces: self.interfaces,
            }),
            state: Arc::new(self.state),
            parking: self.parking,
            resume_rx: self.resume_rx,
            notify_shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
        })
    }
}

/// how one pass over the plugin chain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainOutcome {
    Respond,
    NoResponse,
    Dropped,
    Park { resume_at: usize },
}

impl<T> ServiceInner<T>
where
    T: FamilyMsg,
{
    /// drive the plugin chain starting at `start` (nonzero when resuming
    /// a parked transaction)
    async fn run_chain(&self, ctx: &mut MsgContext<T>, start: usize) -> ChainOutcome {
        for (idx, handler) in self.plugins.iter().enumerate().skip(start) {
            match handler.handle(ctx).await {
                Ok(Action::Respond) => return ChainOutcome::Respond,
                Ok(Action::NoResponse) => {
                    // remove the resp_msg if we don't plan to send a response
                    ctx.resp_msg_take();
                    return ChainOutcome::NoResponse;
                }
                Ok(Action::Park) => {
                    return ChainOutcome::Park {
                        resume_at: idx + 1,
                    };
                }
                Err(ref err) => {
                    // The client will not get a response if we encounter
                    // an error; counted at the worker boundary
                    warn!(?err);
                    return ChainOutcome::Dropped;
                }
                // continue
                _ => {}
            }
        }
        ChainOutcome::Respond
    }

    async fn run_post_response_handler(&self, mut ctx: MsgContext<T>) {
        ctx.mark_as_not_live();
        if let Some(ref handler) = self.postresponse {
            handler.handle(ctx).await;
        }
    }

    /// feed the transaction's event timings into the duration monitor
    fn record_durations(&self, ctx: &MsgContext<T>, response_type: u8) {
        let Some(sample) = ctx.duration_between(EVENT_RECEIVED, EVENT_RESPONSE_SENT) else {
            return;
        };
        let subnet_id = ctx.get_local::<SelectedSubnet>().map(|s| s.0).unwrap_or(0);
        let key = match DurationKey::new(
            T::FAMILY,
            ctx.msg().query_type(),
            response_type,
            EVENT_RECEIVED,
            EVENT_RESPONSE_SENT,
            subnet_id,
        ) {
            Ok(key) => key,
            // not every exchange is monitored (releases, declines)
            Err(_) => return,
        };
        match ctx
            .state()
            .durations()
            .add_duration_sample(key, Utc::now(), sample)
        {
            Ok(Some(rotated)) => {
                debug!(key = %rotated.key(), "duration interval rotated, report due");
            }
            Ok(None) => {}
            Err(err) => trace!(?err, "duration sample not recorded"),
        }
    }
}

/// Service is the type that actually does all the work: it owns the
/// reactor, the worker pool, the parking-lot sweeper, and waits for a
/// shutdown signal
pub(crate) struct Service<T> {
    pub(crate) notify_shutdown: broadcast::Sender<()>,
    pub(crate) shutdown_complete_tx: mpsc::Sender<()>,
    pub(crate) shutdown_complete_rx: mpsc::Receiver<()>,
    pub(crate) plugins: Arc<ServiceInner<T>>,
    /// reference to server state
    pub(crate) state: Arc<State>,
    pub(crate) parking: Arc<ParkingLot<T>>,
    pub(crate) resume_rx: mpsc::UnboundedReceiver<Resumed<T>>,
}

pub(crate) struct ServiceInner<T> {
    /// our list of plugins to execute
    plugins: Vec<PluginFn<T>>,
    /// the postresponse plugin
    postresponse: Option<PostResponseFn<T>>,
    /// hook callouts, shared into every context
    hooks: Arc<HookRegistry<T>>,
    /// reference to server config
    config: Config,
    interfaces: Vec<NetworkInterface>,
}

impl<T> fmt::Debug for Service<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").finish()
    }
}

/// what a worker pulled off its channels
enum WorkItem<T> {
    Ingress(Ingress),
    Resumed(Resumed<T>),
    Exit,
}

/// One transaction worker. Drains the ingress queue and the resume
/// channel; each transaction runs to completion or a park point before
/// the next is taken.
struct Worker<T> {
    service: Arc<ServiceInner<T>>,
    state: Arc<State>,
    parking: Arc<ParkingLot<T>>,
    ingress: Arc<AsyncMutex<mpsc::Receiver<Ingress>>>,
    resume: Arc<AsyncMutex<mpsc::UnboundedReceiver<Resumed<T>>>>,
    soc: Arc<UdpSocket>,
    shutdown: Shutdown,
    _shutdown_complete: mpsc::Sender<()>,
}

// The engine is defined over T, yet the send path differs for v4/v6
// (response addressing, metrics). Letting the compiler copy-paste the
// family-specific halves keeps the dispatch static.
macro_rules! impl_server {
    ($t:ty) => {
        impl Server<$t> {
            /// start server with parsed config values
            pub async fn start<F>(self, shutdown: F) -> Result<()>
            where
                F: Future<Output = Result<()>>,
            {
                self.listen(shutdown).await?;
                Ok(())
            }

            /// bind the socket, spawn the reactor/workers/sweeper, and
            /// serve until `shutdown` resolves. Consumes `self`.
            pub async fn listen<F>(self, shutdown: F) -> Result<()>
            where
                F: Future<Output = Result<()>>,
            {
                let mut service = self
                    .into_service()
                    .context("creating list of services failed in topological sort")?;

                tokio::select! {
                    res = service.listen() => {
                        if let Err(err) = res {
                            error!(?err, "error occurred in UDP listener");
                        }
                    }
                    res = shutdown => {
                        info!("caught shutdown signal handler");
                        if let Err(err) = res {
                            error!(?err);
                        }
                    }
                }

                info!("notifying tasks of shutdown...");
                let Service {
                    mut shutdown_complete_rx,
                    shutdown_complete_tx,
                    notify_shutdown,
                    parking,
                    ..
                } = service;

                // When `notify_shutdown` is dropped, all tasks which have
                // `subscribe`d will receive the shutdown signal and can exit
                drop(notify_shutdown);
                // Drop final `Sender` so the `Receiver` below can complete
                drop(shutdown_complete_tx);
                // Wait for all active tasks to finish processing. When the
                // worker-held `Sender`s drop, `recv()` returns `None`.
                if time::timeout(Duration::from_secs(3), shutdown_complete_rx.recv())
                    .await
                    .is_err()
                {
                    error!("tasks did not finish within 3 seconds-- exiting anyway");
                } else {
                    info!("all tasks finished cleanly");
                }
                // anything still parked is dropped, never leaked
                let abandoned = parking.drain();
                if abandoned > 0 {
                    warn!(abandoned, "dropped parked transactions at shutdown");
                }

                Ok(())
            }
        }

        impl Service<$t> {
            /// spawn the reactor, the sweeper, and the worker pool, then
            /// park this task until the reactor dies
            async fn listen(&mut self) -> Result<()> {
                let soc = Arc::new(self.create_socket().await?);

                let (ingress_tx, ingress_rx) =
                    mpsc::channel::<Ingress>(self.plugins.config.queue_size);
                let ingress_rx = Arc::new(AsyncMutex::new(ingress_rx));
                let resume_rx = std::mem::replace(&mut self.resume_rx, mpsc::unbounded_channel().1);
                let resume_rx = Arc::new(AsyncMutex::new(resume_rx));

                // parking-lot sweeper
                {
                    let parking = Arc::clone(&self.parking);
                    let mut sweeper_shutdown = Shutdown::new(self.notify_shutdown.subscribe());
                    tokio::spawn(async move {
                        let mut tick = time::interval(Duration::from_secs(1));
                        loop {
                            tokio::select! {
                                _ = sweeper_shutdown.recv() => return,
                                _ = tick.tick() => {
                                    parking.sweep(Instant::now());
                                }
                            }
                        }
                    });
                }

                let workers = self
                    .plugins
                    .config
                    .workers
                    .unwrap_or_else(num_workers);
                debug!(workers, "starting transaction workers");
                for _ in 0..workers {
                    let worker = Worker::<$t> {
                        service: Arc::clone(&self.plugins),
                        state: Arc::clone(&self.state),
                        parking: Arc::clone(&self.parking),
                        ingress: Arc::clone(&ingress_rx),
                        resume: Arc::clone(&resume_rx),
                        soc: Arc::clone(&soc),
                        shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                        _shutdown_complete: self.shutdown_complete_tx.clone(),
                    };
                    tokio::spawn(worker.run());
                }

                // the reactor owns the socket read half; it exits when the
                // socket errors or every worker is gone
                queue::reactor(soc, ingress_tx, Arc::clone(self.state.stats())).await;
                Ok(())
            }
        }

        impl Worker<$t> {
            async fn run(mut self) {
                loop {
                    let ingress = Arc::clone(&self.ingress);
                    let resume = Arc::clone(&self.resume);
                    // bind the outcome first; the select must finish
                    // borrowing before the transaction runs
                    let work: WorkItem<$t> = tokio::select! {
                        _ = self.shutdown.recv() => WorkItem::Exit,
                        work = async move { ingress.lock().await.recv().await } => {
                            match work {
                                Some(ingress) => WorkItem::Ingress(ingress),
                                None => WorkItem::Exit,
                            }
                        }
                        resumed = async move { resume.lock().await.recv().await } => {
                            match resumed {
                                Some(resumed) => WorkItem::Resumed(resumed),
                                None => WorkItem::Exit,
                            }
                        }
                    };
                    // a panicking transaction must not take the worker
                    // with it: catch, log once with context, and keep
                    // draining the queue. The unwind drops the context,
                    // so the live count and any partial state go with it.
                    let caught = match work {
                        WorkItem::Exit => {
                            trace!("worker received shutdown notifier");
                            return;
                        }
                        WorkItem::Ingress(ingress) => {
                            std::panic::AssertUnwindSafe(self.process(ingress))
                                .catch_unwind()
                                .await
                        }
                        WorkItem::Resumed(resumed) => std::panic::AssertUnwindSafe(
                            self.run_transaction(resumed.ctx, resumed.resume_at),
                        )
                        .catch_unwind()
                        .await,
                    };
                    if let Err(panic) = caught {
                        error!(
                            panic = panic_message(panic.as_ref()),
                            "worker caught panic; transaction abandoned"
                        );
                    }
                }
            }

            /// decode one raw datagram and run it through the chain
            async fn process(&self, ingress: Ingress) {
                self.state.inc_live_msgs().await;
                let mut ctx = match MsgContext::<$t>::new(
                    ingress.msg,
                    ingress.meta,
                    Arc::clone(&self.state),
                    Some(Arc::clone(&self.service.hooks)),
                ) {
                    Ok(ctx) => ctx,
                    Err(err) => {
                        // a parse failure is a counted drop, not an event
                        // worth a worker's attention
                        debug!(?err, "failed to decode query");
                        self.state.stats().inc(<$t>::DROP_STAT);
                        self.state.dec_live_msgs();
                        return;
                    }
                };
                ctx.recv_metrics();
                ctx.add_event(EVENT_PROCESS_STARTED);

                match ctx.dispatch(CalloutPoint::BufferReceive).await {
                    CalloutAction::Drop => {
                        self.state.stats().inc(<$t>::DROP_STAT);
                        return;
                    }
                    CalloutAction::Park => {
                        self.park(ctx, 0);
                        return;
                    }
                    _ => {}
                }
                match ctx.dispatch(CalloutPoint::PktReceive).await {
                    CalloutAction::Drop => {
                        self.state.stats().inc(<$t>::DROP_STAT);
                        return;
                    }
                    CalloutAction::Park => {
                        self.park(ctx, 0);
                        return;
                    }
                    _ => {}
                }

                self.run_transaction(ctx, 0).await;
            }

            /// run (or resume) the plugin chain, then the send path
            async fn run_transaction(&self, mut ctx: MsgContext<$t>, start: usize) {
                let timeout = self.service.config.timeout();
                let outcome =
                    match time::timeout(timeout, self.service.run_chain(&mut ctx, start)).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            warn!(id = ctx.id(), "transaction timed out");
                            self.state.stats().inc(<$t>::DROP_STAT);
                            ChainOutcome::NoResponse
                        }
                    };
                match outcome {
                    ChainOutcome::Respond => self.finish(ctx).await,
                    ChainOutcome::NoResponse => {
                        self.service.run_post_response_handler(ctx).await;
                    }
                    ChainOutcome::Dropped => {
                        self.state.stats().inc(<$t>::DROP_STAT);
                        self.service.run_post_response_handler(ctx).await;
                    }
                    ChainOutcome::Park { resume_at } => {
                        self.park(ctx, resume_at);
                    }
                }
            }

            /// move a transaction into the parking lot; over capacity it
            /// degrades to a drop
            fn park(&self, ctx: MsgContext<$t>, resume_at: usize) {
                let xid = ctx.msg().xid_key();
                if let Err(dropped) = self.parking.park(xid, ctx, resume_at) {
                    debug!(xid, "parking lot full, dropping transaction");
                    drop(dropped);
                }
            }

            /// encode and send the response, record metrics and timings,
            /// then run the post-response handler
            async fn finish(&self, mut ctx: MsgContext<$t>) {
                ctx.add_event(EVENT_PROCESS_COMPLETED);

                let send_suppressed =
                    match ctx.dispatch(CalloutPoint::PktSend).await {
                        CalloutAction::Drop => {
                            self.state.stats().inc(<$t>::DROP_STAT);
                            self.service.run_post_response_handler(ctx).await;
                            return;
                        }
                        CalloutAction::Skip => true,
                        _ => false,
                    };

                let response_type = ctx
                    .resp_msg()
                    .map(FamilyMsg::query_type)
                    .unwrap_or(0);
                if ctx.resp_msg().is_some() && !send_suppressed {
                    let default_port = self.default_port();
                    let dst_addr = ctx.resp_addr(default_port);
                    match ctx.encode_resp_msg() {
                        Ok(buf) => {
                            ctx.set_resp_buf(buf);
                            let buffer_verdict = ctx.dispatch(CalloutPoint::BufferSend).await;
                            if !matches!(
                                buffer_verdict,
                                CalloutAction::Skip | CalloutAction::Drop
                            ) {
                                ctx.set_dst_addr(dst_addr);
                                let bytes =
                                    ctx.resp_buf().expect("encoded above").msg();
                                debug!(
                                    ?dst_addr,
                                    resp = %ctx.resp_msg().expect("response present"),
                                );
                                if let Err(err) = self.soc.send_to(&bytes, dst_addr).await {
                                    error!(?err);
                                } else {
                                    ctx.add_event(EVENT_RESPONSE_SENT);
                                    ctx.sent_metrics();
                                }
                            }
                        }
                        Err(err) => error!(?err, "failed to encode response"),
                    }
                }

                self.service.record_durations(&ctx, response_type);
                // run post-response handler, if any
                self.service.run_post_response_handler(ctx).await;
            }
        }
    };
}

impl_server!(v4::Message);
impl_server!(v6::Message);

fn num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl Worker<v4::Message> {
    fn default_port(&self) -> bool {
        self.service.config.is_default_port_v4()
    }
}

impl Worker<v6::Message> {
    fn default_port(&self) -> bool {
        self.service.config.is_default_port_v6()
    }
}

impl Service<v4::Message> {
    #[instrument(name = "v4", level = "debug", skip_all)]
    async fn create_socket(&self) -> Result<UdpSocket> {
        let addr = self.plugins.config.v4_addr;
        let interfaces = self.plugins.interfaces.clone();
        debug!(?addr, "binding UDP socket");
        let soc = if interfaces.len() == 1 {
            trace!("binding exactly one interface so use SO_BINDTODEVICE");
            // to bind to an interface, we must create the socket using libc
            let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)?;
            // SO_BINDTODEVICE
            socket
                .bind_device(Some(interfaces.first().unwrap().name.as_bytes()))
                .context("failed to find interface")?;
            socket
                .set_nonblocking(true)
                .context("failed to set nonblocking mode on socket")?;
            socket
                .bind(&addr.into())
                .context("failed to bind interface")?;

            UdpSocket::from_std(unsafe {
                std::net::UdpSocket::from_raw_fd(socket.into_raw_fd())
            })?
        } else {
            UdpSocket::bind(addr).await?
        };
        soc.set_broadcast(true).context("failed to set_broadcast")?;
        Ok(soc)
    }
}

impl Service<v6::Message> {
    #[instrument(name = "v6", level = "debug", skip_all)]
    async fn create_socket(&self) -> Result<UdpSocket> {
        let addr = self.plugins.config.v6_addr;
        let interfaces = self.plugins.interfaces.clone();
        debug!(?addr, "binding v6 UDP socket");
        let socket = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::DGRAM, None)?;
        socket.set_only_v6(true).context("only ipv6")?;

        socket
            .set_reuse_address(true)
            .context("failed to set_reuse_address")?;
        socket
            .set_reuse_port(true)
            .context("failed to set_reuse_port")?;
        socket
            .set_nonblocking(true)
            .context("failed to set nonblocking mode on socket")?;
        socket
            .bind(&addr.into())
            .context("failed to bind interface")?;

        for int in &interfaces {
            debug!("joining multicast");
            socket
                .join_multicast_v6(&ALL_DHCP_RELAY_AGENTS_AND_SERVERS, int.index)
                .context("join v6 multicast")?;
        }
        if interfaces.len() == 1 {
            trace!("binding exactly one interface, use SO_BINDTODEVICE");
            // SO_BINDTODEVICE
            socket
                .bind_device(Some(interfaces.first().unwrap().name.as_bytes()))
                .context("failed to find interface")?;
        }
        Ok(UdpSocket::from_std(unsafe {
            std::net::UdpSocket::from_raw_fd(socket.into_raw_fd())
        })?)
    }
}
