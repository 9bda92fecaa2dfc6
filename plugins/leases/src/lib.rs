#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

//! DHCPv4 allocation stage: DISCOVER, REQUEST in its three flavors,
//! RELEASE, and DECLINE, driven through the allocation engine against the
//! lease store.

use std::net::Ipv4Addr;

use chrono::Utc;
use hearth_core::{
    prelude::*,
    proto::v4::{DhcpOption, Message, MessageType, OptionCode},
    server::context::SelectedSubnet,
};

use alloc_engine::{AllocEngine, AllocError, Client4, Grant};
use config::{DhcpConfig, v4::Network};
use message_type::{MatchedClasses, MsgType, RequestState};
use static_addr::{ReservedHost, StaticAddr};

pub struct Leases {
    cfg: Arc<DhcpConfig>,
    engine: Arc<AllocEngine>,
}

impl std::fmt::Debug for Leases {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leases").finish()
    }
}

impl Leases {
    pub fn new(cfg: Arc<DhcpConfig>, engine: Arc<AllocEngine>) -> Self {
        Self { cfg, engine }
    }
}

impl hearth_core::Register<Message> for Leases {
    fn register(self, srv: &mut hearth_core::Server<Message>) {
        srv.plugin_order(
            self,
            &[
                std::any::TypeId::of::<MsgType>(),
                std::any::TypeId::of::<StaticAddr>(),
            ],
        );
    }
}

#[async_trait]
impl Plugin<Message> for Leases {
    #[instrument(level = "debug", skip_all)]
    async fn handle(&self, ctx: &mut MsgContext<Message>) -> Result<Action> {
        let Some(SelectedSubnet(subnet_id)) = ctx.get_local::<SelectedSubnet>().copied() else {
            debug!("no subnet selected, nothing to allocate from");
            return Ok(Action::NoResponse);
        };
        let Some(network) = self
            .cfg
            .v4()
            .networks()
            .iter()
            .find(|net| net.subnet_id() == subnet_id)
        else {
            return Ok(Action::NoResponse);
        };

        let client = Client4::new(
            ctx.msg().chaddr(),
            client_id_opt(&self.cfg, ctx.msg()),
        );

        match ctx.msg().opts().msg_type() {
            Some(MessageType::Discover) => self.discover(ctx, &client, network).await,
            Some(MessageType::Request) => self.request(ctx, &client, network).await,
            Some(MessageType::Release) => self.release(ctx, &client).await,
            Some(MessageType::Decline) => self.decline(ctx, &client, network).await,
            _ => Ok(Action::Continue),
        }
    }
}

fn client_id_opt<'a>(cfg: &DhcpConfig, msg: &'a Message) -> Option<&'a [u8]> {
    if cfg.v4().chaddr_only() {
        return None;
    }
    match msg.opts().get(OptionCode::ClientIdentifier) {
        Some(DhcpOption::ClientIdentifier(id)) => Some(id),
        _ => None,
    }
}

impl Leases {
    async fn discover(
        &self,
        ctx: &mut MsgContext<Message>,
        client: &Client4,
        network: &Network,
    ) -> Result<Action> {
        let now = Utc::now();
        let classes = ctx.get_local::<MatchedClasses>().map(|c| c.0.to_owned());
        let classes = classes.as_deref();

        match ctx.dispatch(CalloutPoint::LeaseSelect).await {
            CalloutAction::Drop => {
                ctx.state().stats().inc("pkt4-receive-drop");
                return Ok(Action::NoResponse);
            }
            CalloutAction::Park => return Ok(Action::Park),
            // skip suppresses the allocation itself; the scaffolded offer
            // goes out with whatever a callout put in it
            CalloutAction::Skip => return Ok(Action::Continue),
            CalloutAction::Continue => {}
        }

        let reservation = ctx.get_local::<ReservedHost>().map(|r| r.0.clone());
        let rapid_commit = ctx.msg().opts().get(OptionCode::RapidCommit).is_some();
        let requested = ctx.requested_ip();
        let requested_lease = ctx.requested_lease_time();

        // pick the candidate without touching the store yet, so the offer
        // callouts can veto the write after seeing it
        let grant = match self.engine.select_candidate(
            network,
            client,
            requested,
            classes,
            reservation.as_ref(),
            requested_lease,
            now,
        ) {
            Ok(grant) => grant,
            Err(AllocError::NoAddressAvailable(subnet)) => {
                debug!(subnet, "no address available for DISCOVER");
                ctx.state().stats().inc("v4-allocation-fail");
                ctx.update_resp_msg(MessageType::Nak)
                    .context("failed to set msg type")?;
                return Ok(Action::Respond);
            }
            Err(err) => return Err(err.into()),
        };

        self.apply_grant(ctx, network, &grant, reservation.as_ref(), classes)?;
        if rapid_commit {
            // committed straight away, answer with an ACK
            ctx.update_resp_msg(MessageType::Ack)
                .context("failed to set msg type")?;
            ctx.resp_msg_mut()
                .context("response must be set")?
                .opts_mut()
                .insert(DhcpOption::RapidCommit);
        }
        let write_suppressed = match ctx.dispatch(CalloutPoint::LeaseOffer).await {
            CalloutAction::Drop => {
                ctx.state().stats().inc("pkt4-receive-drop");
                return Ok(Action::NoResponse);
            }
            CalloutAction::Park => return Ok(Action::Park),
            // skip: the offer still goes out, the store stays untouched
            CalloutAction::Skip => true,
            CalloutAction::Continue => false,
        };
        if !write_suppressed {
            // pin the advertised candidate and write it
            self.engine.offer(
                network,
                client,
                Some(grant.addr),
                classes,
                reservation.as_ref(),
                requested_lease,
                rapid_commit,
                now,
            )?;
            if ctx.dispatch(CalloutPoint::LeasesCommitted).await == CalloutAction::Drop {
                ctx.state().stats().inc("pkt4-receive-drop");
                return Ok(Action::NoResponse);
            }
        }
        Ok(Action::Continue)
    }

    async fn request(
        &self,
        ctx: &mut MsgContext<Message>,
        client: &Client4,
        network: &Network,
    ) -> Result<Action> {
        let now = Utc::now();
        let classes = ctx.get_local::<MatchedClasses>().map(|c| c.0.to_owned());
        let classes = classes.as_deref();
        let state = ctx
            .get_local::<RequestState>()
            .copied()
            .unwrap_or(RequestState::Selecting);

        let ip = match ctx.requested_ip() {
            Some(ip) => ip,
            None if network.authoritative() => {
                debug!("no requested IP and we are authoritative, so NAK");
                ctx.update_resp_msg(MessageType::Nak)
                    .context("failed to set msg type")?;
                return Ok(Action::Respond);
            }
            None => {
                debug!("couldn't get requested IP, No response");
                return Ok(Action::NoResponse);
            }
        };

        match ctx.dispatch(CalloutPoint::LeaseSelect).await {
            CalloutAction::Drop => {
                ctx.state().stats().inc("pkt4-receive-drop");
                return Ok(Action::NoResponse);
            }
            CalloutAction::Park => return Ok(Action::Park),
            CalloutAction::Skip => return Ok(Action::Continue),
            CalloutAction::Continue => {}
        }

        // INIT-REBOOT: the address is ours (the foreign case was already
        // silently dropped). ACK when it matches the client's lease,
        // NAK otherwise.
        if state == RequestState::InitReboot {
            let held = self.engine.store().get_by_address(ip);
            if !matches!(&held, Some(lease) if lease.matches_client(&client.hwaddr, client.client_id.as_deref()))
            {
                debug!(%ip, "init-reboot address not bound to this client, NAK");
                ctx.update_resp_msg(MessageType::Nak)
                    .context("failed to set msg type")?;
                return Ok(Action::Respond);
            }
        }

        let reservation = ctx.get_local::<ReservedHost>().map(|r| r.0.clone());
        let requested_lease = ctx.requested_lease_time();
        match self
            .engine
            .commit(network, client, ip, classes, requested_lease, now)
        {
            Ok(grant) => {
                if grant.reused {
                    debug!(%ip, "renewal inside reuse window");
                    ctx.state().stats().inc("lease-reuses");
                }
                self.apply_grant(ctx, network, &grant, reservation.as_ref(), classes)?;
                if ctx.dispatch(CalloutPoint::LeasesCommitted).await == CalloutAction::Drop {
                    ctx.state().stats().inc("pkt4-receive-drop");
                    return Ok(Action::NoResponse);
                }
                Ok(Action::Continue)
            }
            Err(AllocError::AddressUnavailable(_) | AllocError::NoAddressAvailable(_))
                if network.authoritative() =>
            {
                debug!(%ip, "can't give out lease, NAK");
                ctx.state().stats().inc("v4-allocation-fail");
                ctx.update_resp_msg(MessageType::Nak)
                    .context("failed to set msg type")?;
                Ok(Action::Respond)
            }
            Err(AllocError::AddressUnavailable(_) | AllocError::NoAddressAvailable(_)) => {
                debug!(%ip, "can't give out lease & not authoritative");
                Ok(Action::NoResponse)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn release(&self, ctx: &mut MsgContext<Message>, client: &Client4) -> Result<Action> {
        if ctx.dispatch(CalloutPoint::LeaseRelease).await == CalloutAction::Skip {
            return Ok(Action::NoResponse);
        }
        let ip = ctx.msg().ciaddr();
        match self.engine.release(client, ip, Utc::now())? {
            Some(prior) => {
                debug!(%ip, subnet_id = prior.subnet_id, "released lease");
            }
            None => {
                debug!(%ip, "release for a lease we don't hold, ignoring");
            }
        }
        // release has no response
        Ok(Action::NoResponse)
    }

    async fn decline(
        &self,
        ctx: &mut MsgContext<Message>,
        client: &Client4,
        network: &Network,
    ) -> Result<Action> {
        if ctx.dispatch(CalloutPoint::LeaseDecline).await == CalloutAction::Skip {
            return Ok(Action::NoResponse);
        }
        let declined_ip = match ctx.msg().opts().get(OptionCode::RequestedIpAddress) {
            Some(DhcpOption::RequestedIpAddress(ip)) => *ip,
            _ => {
                return Err(anyhow::anyhow!("decline has no option 50 (requested IP)"));
            }
        };
        match self
            .engine
            .decline(client, declined_ip, network.probation_period(), Utc::now())
        {
            Ok(()) => {
                ctx.state().stats().inc("declined-addresses");
                debug!(
                    %declined_ip,
                    probation = ?network.probation_period(),
                    "declined IP, probation set"
                );
            }
            Err(err) => {
                debug!(?err, %declined_ip, "decline for a lease we don't hold");
            }
        }
        // declines are not answered
        Ok(Action::NoResponse)
    }

    /// put the granted address and options on the response
    fn apply_grant(
        &self,
        ctx: &mut MsgContext<Message>,
        network: &Network,
        grant: &Grant,
        reservation: Option<&hosts::Reservation>,
        classes: Option<&[String]>,
    ) -> Result<()> {
        let (lease, t1, t2) = grant.times;
        ctx.resp_msg_mut()
            .context("response message must be set before leases runs")?
            .set_yiaddr(grant.addr);
        let mut opts = match network.pool_for(grant.addr, classes) {
            Some(pool) => network.collect_opts(pool),
            None => network.opts().clone(),
        };
        // reservation-scoped options and hostname override the pool's
        if let Some(res) = reservation {
            for (_, opt) in res.opts.iter() {
                opts.insert(opt.clone());
            }
            if let Some(hostname) = &res.hostname {
                opts.insert(DhcpOption::Hostname(hostname.clone()));
            }
        }
        ctx.populate_opts_lease(&opts, lease, t1, t2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::server::msg::SerialMsg;
    use hearth_core::unix_udp_sock::RecvMeta;
    use lease_store::LeaseStore;
    use tracing_test::traced_test;

    const SAMPLE_YAML: &str = r#"
cache_threshold: 25
networks:
  - subnet: 192.0.2.0/24
    authoritative: true
    probation_period: 86400
    server_id: 192.0.2.1
    pools:
      - start: 192.0.2.100
        end: 192.0.2.199
        lease_time:
          default: 4000
    options:
      routers: [192.0.2.1]
      domain_servers: [192.0.2.1]
"#;

    struct Fixture {
        plugin: Leases,
        msg_type: MsgType,
    }

    fn fixture() -> Fixture {
        let cfg = Arc::new(DhcpConfig::parse_str(SAMPLE_YAML).unwrap());
        let engine = Arc::new(AllocEngine::new(
            Arc::new(LeaseStore::new()),
            cfg.v4().cache_threshold(),
        ));
        Fixture {
            plugin: Leases::new(Arc::clone(&cfg), engine),
            msg_type: MsgType::new(cfg).unwrap(),
        }
    }

    fn query(
        msg_type: MessageType,
        chaddr: &[u8],
        opts: Vec<DhcpOption>,
    ) -> MsgContext<Message> {
        let uns = Ipv4Addr::UNSPECIFIED;
        let mut msg = Message::new(uns, uns, uns, uns, chaddr);
        msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
        // queries arrive via a relay so subnet selection has something
        // to chew on without a real interface
        msg.set_giaddr([192, 0, 2, 1]);
        for opt in opts {
            msg.opts_mut().insert(opt);
        }
        let addr: std::net::SocketAddr = "192.0.2.1:67".parse().unwrap();
        let state = Arc::new(hearth_core::server::State::new(
            10,
            Arc::new(hearth_core::stats::StatsMgr::new()),
            Arc::new(
                hearth_core::perfmon::MonitoredDurationStore::new(
                    hearth_core::perfmon::Family::V4,
                    hearth_core::chrono::TimeDelta::seconds(60),
                )
                .unwrap(),
            ),
        ));
        let meta = RecvMeta {
            addr,
            ..RecvMeta::default()
        };
        MsgContext::new(
            SerialMsg::new(proto::Encodable::to_vec(&msg).unwrap().into(), addr),
            meta,
            state,
            None,
        )
        .unwrap()
    }

    async fn run(fix: &Fixture, ctx: &mut MsgContext<Message>) -> Action {
        let action = fix.msg_type.handle(ctx).await.unwrap();
        if action != Action::Continue {
            return action;
        }
        fix.plugin.handle(ctx).await.unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn discover_offer_request_ack() {
        let fix = fixture();
        let chaddr = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];

        // DISCOVER -> OFFER of the first pool address
        let mut ctx = query(MessageType::Discover, &chaddr, vec![]);
        run(&fix, &mut ctx).await;
        let offer = ctx.resp_msg().unwrap();
        assert!(offer.opts().has_msg_type(MessageType::Offer));
        assert_eq!(offer.yiaddr(), Ipv4Addr::from([192, 0, 2, 100]));

        // REQUEST (selecting) -> ACK with the configured lease time
        let mut ctx = query(
            MessageType::Request,
            &chaddr,
            vec![
                DhcpOption::RequestedIpAddress([192, 0, 2, 100].into()),
                DhcpOption::ServerIdentifier([192, 0, 2, 1].into()),
                DhcpOption::ParameterRequestList(vec![OptionCode::Router]),
            ],
        );
        run(&fix, &mut ctx).await;
        let ack = ctx.resp_msg().unwrap();
        assert!(ack.opts().has_msg_type(MessageType::Ack));
        assert_eq!(ack.yiaddr(), Ipv4Addr::from([192, 0, 2, 100]));
        assert_eq!(
            ack.opts().get(OptionCode::AddressLeaseTime),
            Some(&DhcpOption::AddressLeaseTime(4000))
        );

        // exactly one lease in the store
        assert_eq!(fix.plugin.engine.store().len4(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn init_reboot_foreign_address_is_silently_dropped() {
        let fix = fixture();
        // REQUEST with no server id for an address outside every subnet
        let mut ctx = query(
            MessageType::Request,
            &[1, 2, 3, 4, 5, 6],
            vec![DhcpOption::RequestedIpAddress([10, 0, 0, 5].into())],
        );
        let action = run(&fix, &mut ctx).await;
        assert_eq!(action, Action::NoResponse);
        assert!(ctx.resp_msg().is_none());
        assert_eq!(ctx.state().stats().get_integer("pkt4-receive-drop"), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn init_reboot_for_other_clients_lease_is_naked() {
        let fix = fixture();
        let owner = [0xaa, 0xbb, 0xcc, 0, 0, 1];
        let thief = [0xaa, 0xbb, 0xcc, 0, 0, 2];

        let mut ctx = query(MessageType::Discover, &owner, vec![]);
        run(&fix, &mut ctx).await;

        // the other client init-reboots claiming the owner's address
        let mut ctx = query(
            MessageType::Request,
            &thief,
            vec![DhcpOption::RequestedIpAddress([192, 0, 2, 100].into())],
        );
        let action = run(&fix, &mut ctx).await;
        assert_eq!(action, Action::Respond);
        assert!(ctx.resp_msg().unwrap().opts().has_msg_type(MessageType::Nak));
    }

    #[tokio::test]
    #[traced_test]
    async fn decline_quarantines_and_next_client_skips() {
        let fix = fixture();
        let victim = [0xaa, 0xbb, 0xcc, 0, 0, 1];
        let next = [0xaa, 0xbb, 0xcc, 0, 0, 2];

        // victim gets .100 committed
        let mut ctx = query(MessageType::Discover, &victim, vec![]);
        run(&fix, &mut ctx).await;
        let mut ctx = query(
            MessageType::Request,
            &victim,
            vec![
                DhcpOption::RequestedIpAddress([192, 0, 2, 100].into()),
                DhcpOption::ServerIdentifier([192, 0, 2, 1].into()),
            ],
        );
        run(&fix, &mut ctx).await;

        // victim declines it
        let mut ctx = query(
            MessageType::Decline,
            &victim,
            vec![
                DhcpOption::RequestedIpAddress([192, 0, 2, 100].into()),
                DhcpOption::ServerIdentifier([192, 0, 2, 1].into()),
            ],
        );
        let action = run(&fix, &mut ctx).await;
        assert_eq!(action, Action::NoResponse);
        assert_eq!(ctx.state().stats().get_integer("declined-addresses"), 1);

        // a different client discovers and must get .101
        let mut ctx = query(MessageType::Discover, &next, vec![]);
        run(&fix, &mut ctx).await;
        assert_eq!(
            ctx.resp_msg().unwrap().yiaddr(),
            Ipv4Addr::from([192, 0, 2, 101])
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn release_then_reallocate() {
        let fix = fixture();
        let chaddr = [0xaa, 0xbb, 0xcc, 0, 0, 1];

        let mut ctx = query(MessageType::Discover, &chaddr, vec![]);
        run(&fix, &mut ctx).await;

        // RELEASE carries the address in ciaddr and gets no reply
        let uns = Ipv4Addr::UNSPECIFIED;
        let mut msg = Message::new([192, 0, 2, 100].into(), uns, uns, uns, &chaddr);
        msg.set_giaddr([192, 0, 2, 1]);
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Release));
        msg.opts_mut()
            .insert(DhcpOption::ServerIdentifier([192, 0, 2, 1].into()));
        let addr: std::net::SocketAddr = "192.0.2.1:67".parse().unwrap();
        let state = ctx.state().clone();
        let meta = RecvMeta {
            addr,
            ..RecvMeta::default()
        };
        let mut ctx = MsgContext::new(
            SerialMsg::new(proto::Encodable::to_vec(&msg).unwrap().into(), addr),
            meta,
            state,
            None,
        )
        .unwrap();
        let action = run(&fix, &mut ctx).await;
        assert_eq!(action, Action::NoResponse);

        // a client asking for the released address gets it right away
        let mut ctx = query(
            MessageType::Discover,
            &[9, 9, 9, 9, 9, 9],
            vec![DhcpOption::RequestedIpAddress([192, 0, 2, 100].into())],
        );
        run(&fix, &mut ctx).await;
        assert_eq!(
            ctx.resp_msg().unwrap().yiaddr(),
            Ipv4Addr::from([192, 0, 2, 100])
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn rapid_commit_discover_gets_ack() {
        let fix = fixture();
        let mut ctx = query(
            MessageType::Discover,
            &[1, 2, 3, 4, 5, 6],
            vec![DhcpOption::RapidCommit],
        );
        run(&fix, &mut ctx).await;
        let resp = ctx.resp_msg().unwrap();
        assert!(resp.opts().has_msg_type(MessageType::Ack));
        assert!(resp.opts().get(OptionCode::RapidCommit).is_some());
        assert_eq!(fix.plugin.engine.store().len4(), 1);
    }
}
