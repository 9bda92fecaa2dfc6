#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

//! DHCPv6 allocation stage: SOLICIT (with and without rapid commit),
//! REQUEST, RENEW, REBIND, CONFIRM, RELEASE, and DECLINE over IA_NA
//! bindings. Allocation failures answer with a status code, never a
//! drop.

use std::net::Ipv6Addr;

use chrono::Utc;
use hearth_core::{
    prelude::*,
    proto::v6::{self, DhcpOption, IAAddr, IANA, Message, MessageType, OptionCode, Status},
    server::context::SelectedSubnet,
};

use alloc_engine::{AllocEngine, AllocError};
use config::{DhcpConfig, v6::Network};
use hosts::{ClientIdentifier, HostScope};
use message_type::{MsgType, util};

pub struct LeasesV6 {
    cfg: Arc<DhcpConfig>,
    engine: Arc<AllocEngine>,
}

impl std::fmt::Debug for LeasesV6 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasesV6").finish()
    }
}

impl LeasesV6 {
    pub fn new(cfg: Arc<DhcpConfig>, engine: Arc<AllocEngine>) -> Self {
        Self { cfg, engine }
    }
}

impl hearth_core::Register<Message> for LeasesV6 {
    fn register(self, srv: &mut hearth_core::Server<Message>) {
        srv.plugin_order(self, &[std::any::TypeId::of::<MsgType>()]);
    }
}

/// the identity associations a query carries, one per IA_NA
fn ia_requests(msg: &Message) -> Vec<(u32, Option<Ipv6Addr>)> {
    msg.opts()
        .get_all(OptionCode::IANA)
        .filter_map(|opt| match opt {
            DhcpOption::IANA(ia) => {
                let hint = ia.opts.iter().find_map(|sub| match sub {
                    DhcpOption::IAAddr(ia_addr) => Some(ia_addr.addr),
                    _ => None,
                });
                Some((ia.id, hint))
            }
            _ => None,
        })
        .collect()
}

fn client_duid(msg: &Message) -> Option<Vec<u8>> {
    match msg.opts().get(OptionCode::ClientId) {
        Some(DhcpOption::ClientId(duid)) => Some(duid.clone()),
        _ => None,
    }
}

fn ia_answer(network: &Network, iaid: u32, lease: &lease_store::Lease6) -> DhcpOption {
    let mut ia_opts = v6::DhcpOptions::new();
    ia_opts.insert(DhcpOption::IAAddr(IAAddr {
        addr: lease.addr,
        preferred_life: lease.preferred_lifetime,
        valid_life: lease.valid_lifetime,
        opts: v6::DhcpOptions::new(),
    }));
    DhcpOption::IANA(IANA {
        id: iaid,
        t1: network.preferred_lifetime() / 2,
        t2: network.preferred_lifetime() * 4 / 5,
        opts: ia_opts,
    })
}

fn ia_status(iaid: u32, status: Status, msg: &str) -> DhcpOption {
    let mut ia_opts = v6::DhcpOptions::new();
    ia_opts.insert(DhcpOption::StatusCode {
        status,
        msg: msg.to_owned(),
    });
    DhcpOption::IANA(IANA {
        id: iaid,
        t1: 0,
        t2: 0,
        opts: ia_opts,
    })
}

#[async_trait]
impl Plugin<Message> for LeasesV6 {
    #[instrument(level = "debug", skip_all)]
    async fn handle(&self, ctx: &mut MsgContext<Message>) -> Result<Action> {
        let Some(SelectedSubnet(subnet_id)) = ctx.get_local::<SelectedSubnet>().copied() else {
            debug!("no subnet selected, nothing to allocate from");
            return Ok(Action::NoResponse);
        };
        let Some(network) = self
            .cfg
            .v6()
            .networks()
            .iter()
            .find(|net| net.subnet_id() == subnet_id)
        else {
            return Ok(Action::NoResponse);
        };

        let client_msg = ctx.msg().innermost().clone();
        let Some(duid) = client_duid(&client_msg) else {
            debug!("stateful query without a client id, dropping");
            ctx.state().stats().inc("pkt6-receive-drop");
            return Ok(Action::NoResponse);
        };

        match ctx.dispatch(CalloutPoint::LeaseSelect).await {
            CalloutAction::Drop => {
                ctx.state().stats().inc("pkt6-receive-drop");
                return Ok(Action::NoResponse);
            }
            CalloutAction::Park => return Ok(Action::Park),
            CalloutAction::Skip => return Ok(Action::Continue),
            CalloutAction::Continue => {}
        }

        let action = match client_msg.msg_type() {
            MessageType::Solicit => {
                self.solicit(ctx, network, &client_msg, &duid).await?
            }
            MessageType::Request | MessageType::Renew | MessageType::Rebind => {
                self.assign(ctx, network, &client_msg, &duid).await?
            }
            MessageType::Confirm => self.confirm(ctx, network, &client_msg),
            MessageType::Release => self.release(ctx, &client_msg, &duid).await,
            MessageType::Decline => self.decline(ctx, network, &client_msg, &duid).await,
            _ => Action::NoResponse,
        };

        // a relayed query goes back wrapped in a relay-reply
        if ctx.msg().is_relay() && action == Action::Respond {
            if let Some(resp) = ctx.resp_msg_take() {
                let wrapped = util::maybe_wrap_relay(ctx.msg(), resp);
                ctx.set_resp_msg(wrapped);
            }
        }
        Ok(action)
    }
}

impl LeasesV6 {
    fn reservation(&self, network: &Network, duid: &[u8]) -> Option<hosts::Reservation> {
        let idents = [ClientIdentifier::Duid(duid.to_vec())];
        let hosts = self.cfg.hosts();
        hosts
            .find_first(HostScope::Subnet(network.subnet_id()), &idents, None)
            .or_else(|| hosts.find_first(HostScope::Global, &idents, None))
            .cloned()
    }

    /// SOLICIT: advertise an address, or commit it when the client asked
    /// for rapid commit and the subnet allows it
    async fn solicit(
        &self,
        ctx: &mut MsgContext<Message>,
        network: &Network,
        client_msg: &Message,
        duid: &[u8],
    ) -> Result<Action> {
        let rapid = client_msg.opts().get(OptionCode::RapidCommit).is_some()
            && network.rapid_commit();
        let reservation = self.reservation(network, duid);
        let now = Utc::now();

        let mut answers = Vec::new();
        let mut any_addr = false;
        for (iaid, hint) in ia_requests(client_msg) {
            match self.engine.allocate6(
                network,
                duid,
                iaid,
                hint,
                reservation.as_ref(),
                rapid,
                now,
            ) {
                Ok(lease) => {
                    any_addr = true;
                    answers.push(ia_answer(network, iaid, &lease));
                }
                Err(AllocError::NoAddressAvailable(_)) => {
                    ctx.state().stats().inc("v6-allocation-fail");
                    answers.push(ia_status(iaid, Status::NoAddrsAvail, "no addresses available"));
                }
                Err(err) => return Err(err.into()),
            }
        }
        if answers.is_empty() {
            debug!("solicit carried no IA_NA, nothing to advertise");
            return Ok(Action::NoResponse);
        }

        let resp = ctx.resp_msg_mut().context("response must be set")?;
        if rapid {
            // REPLY (not ADVERTISE) with the committed lease
            resp.set_msg_type(MessageType::Reply);
            resp.opts_mut().insert(DhcpOption::RapidCommit);
        } else {
            resp.set_msg_type(MessageType::Advertise);
        }
        for answer in answers {
            resp.opts_mut().insert(answer);
        }
        ctx.populate_opts(&v6::DhcpOptions::new());
        if any_addr
            && ctx.dispatch(CalloutPoint::LeasesCommitted).await == CalloutAction::Drop
        {
            ctx.state().stats().inc("pkt6-receive-drop");
            return Ok(Action::NoResponse);
        }
        Ok(Action::Respond)
    }

    /// REQUEST / RENEW / REBIND: commit or extend the binding
    async fn assign(
        &self,
        ctx: &mut MsgContext<Message>,
        network: &Network,
        client_msg: &Message,
        duid: &[u8],
    ) -> Result<Action> {
        let reservation = self.reservation(network, duid);
        let now = Utc::now();

        let mut answers = Vec::new();
        let mut any_addr = false;
        for (iaid, hint) in ia_requests(client_msg) {
            match self.engine.allocate6(
                network,
                duid,
                iaid,
                hint,
                reservation.as_ref(),
                true,
                now,
            ) {
                Ok(lease) => {
                    any_addr = true;
                    answers.push(ia_answer(network, iaid, &lease));
                }
                Err(AllocError::NoAddressAvailable(_)) => {
                    ctx.state().stats().inc("v6-allocation-fail");
                    answers.push(ia_status(iaid, Status::NoAddrsAvail, "no addresses available"));
                }
                Err(err) => return Err(err.into()),
            }
        }
        if answers.is_empty() {
            return Ok(Action::NoResponse);
        }

        let resp = ctx.resp_msg_mut().context("response must be set")?;
        for answer in answers {
            resp.opts_mut().insert(answer);
        }
        ctx.populate_opts(&v6::DhcpOptions::new());
        if any_addr
            && ctx.dispatch(CalloutPoint::LeasesCommitted).await == CalloutAction::Drop
        {
            ctx.state().stats().inc("pkt6-receive-drop");
            return Ok(Action::NoResponse);
        }
        Ok(Action::Respond)
    }

    /// CONFIRM: is every address the client holds on-link here?
    fn confirm(
        &self,
        ctx: &mut MsgContext<Message>,
        network: &Network,
        client_msg: &Message,
    ) -> Action {
        let mut on_link = true;
        let mut saw_addr = false;
        for opt in client_msg.opts().get_all(OptionCode::IANA) {
            if let DhcpOption::IANA(ia) = opt {
                for sub in ia.opts.iter() {
                    if let DhcpOption::IAAddr(ia_addr) = sub {
                        saw_addr = true;
                        on_link &= network.contains(ia_addr.addr);
                    }
                }
            }
        }
        // nothing to confirm: stay silent per RFC 8415 §18.3.3
        if !saw_addr {
            return Action::NoResponse;
        }
        let Some(resp) = ctx.resp_msg_mut() else {
            return Action::NoResponse;
        };
        let (status, text) = if on_link {
            (Status::Success, "all addresses on-link")
        } else {
            (Status::NotOnLink, "address not on-link")
        };
        resp.opts_mut().insert(DhcpOption::StatusCode {
            status,
            msg: text.to_owned(),
        });
        ctx.populate_opts(&v6::DhcpOptions::new());
        Action::Respond
    }

    /// RELEASE: give the bindings back
    async fn release(
        &self,
        ctx: &mut MsgContext<Message>,
        client_msg: &Message,
        duid: &[u8],
    ) -> Action {
        if ctx.dispatch(CalloutPoint::LeaseRelease).await == CalloutAction::Skip {
            return Action::NoResponse;
        }
        let now = Utc::now();
        for opt in client_msg.opts().get_all(OptionCode::IANA) {
            if let DhcpOption::IANA(ia) = opt {
                for sub in ia.opts.iter() {
                    if let DhcpOption::IAAddr(ia_addr) = sub {
                        match self.engine.release6(duid, ia.id, ia_addr.addr, now) {
                            Ok(Some(_)) => debug!(addr = %ia_addr.addr, "released v6 lease"),
                            Ok(None) => {
                                debug!(addr = %ia_addr.addr, "release for a lease we don't hold")
                            }
                            Err(err) => error!(?err, "error releasing v6 lease"),
                        }
                    }
                }
            }
        }
        if let Some(resp) = ctx.resp_msg_mut() {
            resp.opts_mut().insert(DhcpOption::StatusCode {
                status: Status::Success,
                msg: "released".to_owned(),
            });
        }
        ctx.populate_opts(&v6::DhcpOptions::new());
        Action::Respond
    }

    /// DECLINE: quarantine addresses the client saw in use elsewhere
    async fn decline(
        &self,
        ctx: &mut MsgContext<Message>,
        network: &Network,
        client_msg: &Message,
        duid: &[u8],
    ) -> Action {
        if ctx.dispatch(CalloutPoint::LeaseDecline).await == CalloutAction::Skip {
            return Action::NoResponse;
        }
        let now = Utc::now();
        // v6 probation follows the valid lifetime of the subnet
        let probation = std::time::Duration::from_secs(u64::from(network.valid_lifetime()));
        for opt in client_msg.opts().get_all(OptionCode::IANA) {
            if let DhcpOption::IANA(ia) = opt {
                for sub in ia.opts.iter() {
                    if let DhcpOption::IAAddr(ia_addr) = sub {
                        match self
                            .engine
                            .decline6(duid, ia.id, ia_addr.addr, probation, now)
                        {
                            Ok(()) => {
                                ctx.state().stats().inc("declined-addresses");
                                debug!(addr = %ia_addr.addr, "declined v6 address");
                            }
                            Err(err) => {
                                debug!(?err, addr = %ia_addr.addr, "decline for a lease we don't hold")
                            }
                        }
                    }
                }
            }
        }
        if let Some(resp) = ctx.resp_msg_mut() {
            resp.opts_mut().insert(DhcpOption::StatusCode {
                status: Status::Success,
                msg: "declined".to_owned(),
            });
        }
        Action::Respond
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::server::msg::SerialMsg;
    use hearth_core::unix_udp_sock::RecvMeta;
    use lease_store::LeaseStore;

    const YAML: &str = r#"
networks:
  - subnet: 192.0.2.0/24
    pools:
      - start: 192.0.2.100
        end: 192.0.2.199
v6:
  server_duid: "00:01:00:01:aa:bb:cc:dd:ee:ff"
  networks:
    - subnet: 2001:db8::/64
      rapid_commit: true
      preferred_lifetime: 3000
      valid_lifetime: 4000
      pools:
        - start: 2001:db8::100
          end: 2001:db8::1ff
"#;

    struct Fixture {
        cfg: Arc<DhcpConfig>,
        plugin: LeasesV6,
    }

    fn fixture() -> Fixture {
        let cfg = Arc::new(DhcpConfig::parse_str(YAML).unwrap());
        let engine = Arc::new(AllocEngine::new(Arc::new(LeaseStore::new()), None));
        Fixture {
            plugin: LeasesV6::new(Arc::clone(&cfg), engine),
            cfg,
        }
    }

    fn solicit_msg(rapid: bool) -> Message {
        let mut msg = Message::new_with_id(MessageType::Solicit, [1, 2, 3]);
        msg.opts_mut()
            .insert(DhcpOption::ClientId(vec![0, 1, 0, 1, 1, 2, 3, 4]));
        msg.opts_mut().insert(DhcpOption::ElapsedTime(0));
        msg.opts_mut().insert(DhcpOption::IANA(IANA {
            id: 42,
            t1: 0,
            t2: 0,
            opts: v6::DhcpOptions::new(),
        }));
        if rapid {
            msg.opts_mut().insert(DhcpOption::RapidCommit);
        }
        msg
    }

    fn ctx_for(fix: &Fixture, msg: &Message) -> MsgContext<Message> {
        let addr: std::net::SocketAddr = "[fe80::1]:546".parse().unwrap();
        let state = Arc::new(hearth_core::server::State::new(
            10,
            Arc::new(hearth_core::stats::StatsMgr::new()),
            Arc::new(
                hearth_core::perfmon::MonitoredDurationStore::new(
                    hearth_core::perfmon::Family::V6,
                    hearth_core::chrono::TimeDelta::seconds(60),
                )
                .unwrap(),
            ),
        ));
        let meta = RecvMeta {
            addr,
            ..RecvMeta::default()
        };
        let mut ctx: MsgContext<Message> = MsgContext::new(
            SerialMsg::new(proto::Encodable::to_vec(msg).unwrap().into(), addr),
            meta,
            state,
            None,
        )
        .unwrap();
        // what the accept stage would have stashed and scaffolded
        let network = &fix.cfg.v6().networks()[0];
        ctx.set_local(SelectedSubnet(network.subnet_id()));
        let mut resp = Message::new_with_id(MessageType::Reply, msg.innermost().xid());
        resp.opts_mut()
            .insert(DhcpOption::ServerId(fix.cfg.v6().server_id().to_vec()));
        ctx.set_resp_msg(resp);
        ctx
    }

    #[tokio::test]
    async fn solicit_without_rapid_commit_advertises() {
        let fix = fixture();
        let mut ctx = ctx_for(&fix, &solicit_msg(false));
        let action = fix.plugin.handle(&mut ctx).await.unwrap();
        assert_eq!(action, Action::Respond);
        let resp = ctx.resp_msg().unwrap();
        assert_eq!(resp.msg_type(), MessageType::Advertise);
        let DhcpOption::IANA(ia) = resp.opts().get(OptionCode::IANA).unwrap() else {
            panic!("advertise must carry an IA_NA");
        };
        assert!(matches!(
            ia.opts.get(OptionCode::IAAddr),
            Some(DhcpOption::IAAddr(addr)) if addr.valid_life == 4000
        ));
    }

    #[tokio::test]
    async fn solicit_with_rapid_commit_replies_and_commits() {
        let fix = fixture();
        let mut ctx = ctx_for(&fix, &solicit_msg(true));
        let action = fix.plugin.handle(&mut ctx).await.unwrap();
        assert_eq!(action, Action::Respond);
        let resp = ctx.resp_msg().unwrap();
        // REPLY, not ADVERTISE, with the rapid-commit option echoed
        assert_eq!(resp.msg_type(), MessageType::Reply);
        assert!(resp.opts().get(OptionCode::RapidCommit).is_some());

        // and the lease is committed at the full lifetime
        let lease = fix
            .plugin
            .engine
            .store()
            .get_by_address6(
                lease_store::LeaseType6::IaNa,
                "2001:db8::100".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(lease.valid_lifetime, 4000);
    }

    #[tokio::test]
    async fn exhausted_pool_answers_with_status_code() {
        let fix = fixture();
        // drain the pool: 256 addresses
        let now = Utc::now();
        let network = &fix.cfg.v6().networks()[0];
        for n in 0..256u32 {
            fix.plugin
                .engine
                .allocate6(network, &n.to_be_bytes(), 1, None, None, true, now)
                .unwrap();
        }

        let mut ctx = ctx_for(&fix, &solicit_msg(false));
        let action = fix.plugin.handle(&mut ctx).await.unwrap();
        // allocation failure is a status-code reply, not a drop
        assert_eq!(action, Action::Respond);
        let resp = ctx.resp_msg().unwrap();
        let DhcpOption::IANA(ia) = resp.opts().get(OptionCode::IANA).unwrap() else {
            panic!("reply must carry the IA_NA");
        };
        assert!(matches!(
            ia.opts.get(OptionCode::StatusCode),
            Some(DhcpOption::StatusCode { status: Status::NoAddrsAvail, .. })
        ));
        assert_eq!(ctx.state().stats().get_integer("v6-allocation-fail"), 1);
    }

    #[tokio::test]
    async fn release_marks_bindings_released() {
        let fix = fixture();
        // commit a lease via rapid solicit
        let mut ctx = ctx_for(&fix, &solicit_msg(true));
        fix.plugin.handle(&mut ctx).await.unwrap();

        // release it
        let mut msg = Message::new_with_id(MessageType::Release, [4, 5, 6]);
        msg.opts_mut()
            .insert(DhcpOption::ClientId(vec![0, 1, 0, 1, 1, 2, 3, 4]));
        msg.opts_mut()
            .insert(DhcpOption::ServerId(fix.cfg.v6().server_id().to_vec()));
        let mut ia_opts = v6::DhcpOptions::new();
        ia_opts.insert(DhcpOption::IAAddr(IAAddr {
            addr: "2001:db8::100".parse().unwrap(),
            preferred_life: 0,
            valid_life: 0,
            opts: v6::DhcpOptions::new(),
        }));
        msg.opts_mut().insert(DhcpOption::IANA(IANA {
            id: 42,
            t1: 0,
            t2: 0,
            opts: ia_opts,
        }));
        let mut ctx = ctx_for(&fix, &msg);
        let action = fix.plugin.handle(&mut ctx).await.unwrap();
        assert_eq!(action, Action::Respond);

        let lease = fix
            .plugin
            .engine
            .store()
            .get_by_address6(
                lease_store::LeaseType6::IaNa,
                "2001:db8::100".parse().unwrap(),
            )
            .unwrap();
        assert_eq!(lease.state, lease_store::LeaseState::Released);
    }
}
