#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

//! Accept/classify stage. Runs first: screens the query, evaluates client
//! classes, selects the subnet, and scaffolds the response message that
//! later plugins fill in.

use hearth_core::{
    prelude::*,
    proto::{
        v4::{self, DhcpOption, Message, MessageType, Opcode, OptionCode},
        v6,
    },
    server::context::SelectedSubnet,
    tracing::{instrument, warn},
};
use std::net::Ipv4Addr;

use config::{DhcpConfig, client_classes, v4::SubnetSelect};
use hosts::HostScope;

/// client classes the query matched, in config order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedClasses(pub Vec<String>);

/// which DHCPv4 REQUEST flavor this query is (RFC 2131 §4.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// server-id present: answering our OFFER
    Selecting,
    /// no server-id, ciaddr zero, requested-address set
    InitReboot,
    /// no server-id, ciaddr set
    Renewing,
}

#[derive(Debug)]
pub struct MsgType {
    cfg: Arc<DhcpConfig>,
}

impl MsgType {
    pub fn new(cfg: Arc<DhcpConfig>) -> Result<Self> {
        Ok(Self { cfg })
    }
}

impl hearth_core::Register<Message> for MsgType {
    fn register(self, srv: &mut hearth_core::Server<Message>) {
        srv.plugin(self);
    }
}

impl hearth_core::Register<v6::Message> for MsgType {
    fn register(self, srv: &mut hearth_core::Server<v6::Message>) {
        srv.plugin(self);
    }
}

#[async_trait]
impl Plugin<Message> for MsgType {
    #[instrument(level = "debug", skip_all)]
    async fn handle(&self, ctx: &mut MsgContext<Message>) -> Result<Action> {
        // set the interface, using data from config
        // MsgType plugin must run first because future plugins use this data
        let meta = ctx.meta();
        if let Some(interface) = self.cfg.v4().get_interface(meta.ifindex) {
            ctx.set_interface(interface);
        }

        let req = ctx.msg();
        let msg_type = req.opts().msg_type();

        if req.opcode() == Opcode::BootReply {
            debug!("BootReply not supported");
            return Ok(Action::NoResponse);
        }
        let msg_type = match msg_type {
            Some(t) => t,
            None => {
                debug!("no option 53 (message type) found");
                drop_query(ctx);
                return Ok(Action::NoResponse);
            }
        };

        // class evaluation happens before subnet selection so
        // class-guarded subnets can admit the client
        let classes = client_classes::classify(self.cfg.v4().classes(), req);
        // deferred options are only interpreted once the class is known.
        // a re-parse failure is logged and the query continues.
        if self
            .cfg
            .v4()
            .deferred_options()
            .contains(&u8::from(OptionCode::VendorExtensions))
        {
            if let Some(Err(err)) = ctx.msg().parse_vendor_suboptions() {
                warn!(?err, "deferred vendor option re-parse failed, continuing");
            }
        }
        if !classes.is_empty() {
            trace!(?classes, "client matched classes");
        }

        let select = SubnetSelect::new(
            ctx.subnet_hint(),
            ctx.msg().giaddr(),
            ctx.interface().map(|int| int.ip()),
        );
        let class_ref = (!classes.is_empty()).then(|| classes.clone());
        let network = match self.cfg.v4().select_network(select, class_ref.as_deref()) {
            Some(network) => network,
            // a global reservation can still pin the query to a subnet
            None => match self.global_reservation_network(ctx, class_ref.as_deref()) {
                Some(network) => network,
                None => {
                    debug!(?select, "no subnet matched the query");
                    drop_query(ctx);
                    return Ok(Action::NoResponse);
                }
            },
        };
        let subnet_id = network.subnet_id();
        let subnet_ip = network.subnet().addr();
        let authoritative = network.authoritative();
        ctx.set_local(SelectedSubnet(subnet_id));
        ctx.set_local(MatchedClasses(classes));

        if ctx.dispatch(CalloutPoint::SubnetSelect).await == CalloutAction::Drop {
            drop_query(ctx);
            return Ok(Action::NoResponse);
        }

        // otherwise our interface IP as the id
        let server_id = self
            .cfg
            .v4()
            .server_id(meta.ifindex, subnet_ip)
            .context("cannot find server_id")?;

        // if there is a server identifier it must match ours
        let req = ctx.msg();
        let req_sid = match req.opts().get(OptionCode::ServerIdentifier) {
            Some(DhcpOption::ServerIdentifier(id)) if !id.is_unspecified() => Some(*id),
            _ => None,
        };
        if matches!(req_sid, Some(id) if id != server_id) {
            debug!(?server_id, "server identifier in msg doesn't match");
            return Ok(Action::NoResponse);
        }

        // message that will be returned
        let mut resp = util::new_msg(req, server_id);
        resp.opts_mut()
            .insert(DhcpOption::ServerIdentifier(server_id));

        match msg_type {
            MessageType::Discover => {
                resp.opts_mut()
                    .insert(DhcpOption::MessageType(MessageType::Offer));
            }
            MessageType::Request => {
                let state = self.request_state(ctx, req_sid);
                // INIT-REBOOT for an address we don't own is a silent
                // drop, not a NAK (RFC 2131 §4.3.2)
                if state == RequestState::InitReboot {
                    let requested = ctx.requested_ip();
                    if !matches!(requested, Some(ip) if self.cfg.v4().network(ip).is_some()) {
                        debug!(?requested, "init-reboot for a foreign address, dropping");
                        drop_query(ctx);
                        return Ok(Action::NoResponse);
                    }
                }
                ctx.set_local(state);
                if !ctx.msg().giaddr().is_unspecified() {
                    let flags = ctx.msg().flags();
                    resp.set_flags(flags.set_broadcast());
                }
                resp.opts_mut()
                    .insert(DhcpOption::MessageType(MessageType::Ack));
            }
            // got INFORM & we are authoritative, give a response
            MessageType::Inform if authoritative => {
                resp.opts_mut()
                    .insert(DhcpOption::MessageType(MessageType::Ack));
                let ciaddr = ctx.msg().ciaddr();
                let addr = if !ciaddr.is_unspecified() {
                    ciaddr
                } else {
                    subnet_ip
                };
                if let Some(network) = self.cfg.v4().network(addr) {
                    let classes = ctx.get_local::<MatchedClasses>().map(|c| c.0.to_owned());
                    if let Some(pool) = network.pool_for(addr, classes.as_deref()) {
                        let opts = network.collect_opts(pool);
                        ctx.set_resp_msg(resp);
                        // options only, no lease and no lease time
                        ctx.populate_opts(&opts);
                        return Ok(Action::Respond);
                    }
                    // no pool: serve the network-level options
                    let opts = network.opts().clone();
                    ctx.set_resp_msg(resp);
                    ctx.populate_opts(&opts);
                    return Ok(Action::Respond);
                }
                warn!(msg_type = ?MessageType::Inform, "couldn't match appropriate range with INFORM message");
                return Ok(Action::NoResponse);
            }
            MessageType::Release => {
                // a release never gets a reply; the leases plugin updates
                // the store
                return Ok(Action::Continue);
            }
            MessageType::Decline => {
                if let Some(DhcpOption::RequestedIpAddress(ip)) =
                    ctx.msg().opts().get(OptionCode::RequestedIpAddress)
                {
                    debug!(declined_ip = ?ip, "got DECLINE");
                    return Ok(Action::Continue);
                }
                error!("got DECLINE with no option 50 (requested IP)");
                return Ok(Action::NoResponse);
            }
            _ => {
                debug!("unsupported message type");
                return Ok(Action::NoResponse);
            }
        }

        ctx.set_resp_msg(resp);
        Ok(Action::Continue)
    }
}

impl MsgType {
    /// RFC 2131 §4.3.2 request classification
    fn request_state(
        &self,
        ctx: &MsgContext<Message>,
        req_sid: Option<Ipv4Addr>,
    ) -> RequestState {
        let req = ctx.msg();
        if req_sid.is_some() {
            RequestState::Selecting
        } else if req.ciaddr().is_unspecified()
            && req
                .opts()
                .get(OptionCode::RequestedIpAddress)
                .is_some()
        {
            RequestState::InitReboot
        } else {
            RequestState::Renewing
        }
    }

    /// when `reservations_lookup_first` is set, a global reservation with
    /// an address pins the query to that address's subnet even though
    /// normal selection failed
    fn global_reservation_network(
        &self,
        ctx: &MsgContext<Message>,
        classes: Option<&[String]>,
    ) -> Option<&config::v4::Network> {
        if !self.cfg.v4().reservations_lookup_first() {
            return None;
        }
        let idents = util::identifiers(self.cfg.v4(), ctx.msg());
        let res = self.cfg.hosts().find_first(HostScope::Global, &idents, classes)?;
        let addr = res.v4_address()?;
        debug!(%addr, "global reservation selected the subnet");
        self.cfg.v4().network(addr)
    }
}

pub mod util {
    use super::*;
    use hosts::ClientIdentifier;

    /// response scaffold mirroring the query header
    pub fn new_msg(req: &Message, siaddr: Ipv4Addr) -> Message {
        let mut msg = Message::new_with_id(
            req.xid(),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            siaddr,
            req.giaddr(),
            req.chaddr(),
        );
        msg.set_opcode(Opcode::BootReply)
            .set_htype(req.htype())
            .set_flags(req.flags());
        msg
    }

    /// a response to a relayed v6 query goes back through the relay: wrap
    /// it in a relay-reply mirroring the relay header and interface-id
    pub fn maybe_wrap_relay(req: &v6::Message, resp: v6::Message) -> v6::Message {
        let Some(header) = req.relay_header() else {
            return resp;
        };
        let mut wrapped = v6::Message::new_relay(v6::MessageType::RelayRepl, header);
        if let Some(id) = req.opts().get(v6::OptionCode::InterfaceId) {
            wrapped.opts_mut().insert(id.clone());
        }
        wrapped
            .opts_mut()
            .insert(v6::DhcpOption::RelayMsg(Box::new(resp)));
        wrapped
    }

    /// every identifier this query presents, for reservation lookup
    pub fn identifiers(cfg: &config::v4::Config, msg: &Message) -> Vec<ClientIdentifier> {
        let mut idents = Vec::with_capacity(2);
        if !msg.chaddr().is_empty() {
            idents.push(ClientIdentifier::HwAddress {
                hwtype: msg.htype(),
                bytes: msg.chaddr().to_vec(),
            });
        }
        if !cfg.chaddr_only() {
            if let Some(v4::DhcpOption::ClientIdentifier(id)) =
                msg.opts().get(v4::OptionCode::ClientIdentifier)
            {
                idents.push(ClientIdentifier::ClientId(id.clone()));
            }
        }
        idents
    }
}

fn drop_query(ctx: &MsgContext<Message>) {
    ctx.state().stats().inc("pkt4-receive-drop");
}

fn drop_query6(ctx: &MsgContext<v6::Message>) {
    ctx.state().stats().inc("pkt6-receive-drop");
}

#[async_trait]
impl Plugin<v6::Message> for MsgType {
    #[instrument(level = "debug", skip_all)]
    async fn handle(&self, ctx: &mut MsgContext<v6::Message>) -> Result<Action> {
        // import message type variants
        use v6::MessageType::*;
        // set the interface, using data from config
        let meta = ctx.meta();
        if let Some(interface) = self.cfg.v6().get_interface_link_local(meta.ifindex) {
            ctx.set_interface(interface);
        }
        if let Some(global_unicast) = self.cfg.v6().get_interface_global(meta.ifindex) {
            ctx.set_global(global_unicast);
        }

        // a relayed query carries the client message inside option 9
        let link_addr = ctx.msg().relay_header().map(|hdr| hdr.link_addr);
        let interface_id = match ctx.msg().opts().get(v6::OptionCode::InterfaceId) {
            Some(v6::DhcpOption::InterfaceId(id)) => Some(id.clone()),
            _ => None,
        };
        let client_msg = ctx.msg().innermost().clone();
        let msg_type = client_msg.msg_type();

        debug!(
            %msg_type,
            src_addr = %ctx.src_addr(),
            relayed = ctx.msg().is_relay(),
            req = %client_msg,
        );

        let network = self.cfg.v6().select_network(
            link_addr,
            interface_id.as_deref(),
            ctx.global().map(|net| net.ip()),
        );
        let network = match network {
            Some(network) => network,
            None => {
                debug!("no v6 subnet matched the query");
                drop_query6(ctx);
                return Ok(Action::NoResponse);
            }
        };
        ctx.set_local(SelectedSubnet(network.subnet_id()));

        if ctx.dispatch(CalloutPoint::SubnetSelect).await == CalloutAction::Drop {
            drop_query6(ctx);
            return Ok(Action::NoResponse);
        }

        let server_id = self.cfg.v6().server_id();
        let req_sid = client_msg.opts().get(v6::OptionCode::ServerId);
        // if the request includes a server id, it must match our server id
        if matches!(req_sid, Some(v6::DhcpOption::ServerId(id)) if id != server_id) {
            debug!("server identifier in msg doesn't match");
            return Ok(Action::NoResponse);
        }

        // create initial response with reply type; SOLICIT handling may
        // downgrade it to an ADVERTISE
        let mut resp = v6::Message::new_with_id(Reply, client_msg.xid());
        resp.opts_mut()
            .insert(v6::DhcpOption::ServerId(server_id.to_vec()));

        match msg_type {
            // discard if it has these types but NO server id
            // https://www.rfc-editor.org/rfc/rfc8415#section-16.6
            Request | Renew | Decline | Release if req_sid.is_none() => {
                return Ok(Action::NoResponse);
            }
            // solicit must NOT carry a server id
            Solicit if req_sid.is_some() => {
                return Ok(Action::NoResponse);
            }
            InformationRequest => {
                // options only; no lease state is touched
                ctx.set_resp_msg(resp);
                ctx.populate_opts(&v6::DhcpOptions::new());
                return Ok(Action::Respond);
            }
            Solicit | Request | Renew | Rebind | Confirm | Release | Decline => {}
            _ => {
                debug!("currently unsupported message type");
                return Ok(Action::NoResponse);
            }
        }

        ctx.set_resp_msg(resp);
        Ok(Action::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_state_classification() {
        let cfg = Arc::new(
            DhcpConfig::parse_str(
                r#"
networks:
  - subnet: 192.0.2.0/24
    pools:
      - start: 192.0.2.100
        end: 192.0.2.199
"#,
            )
            .unwrap(),
        );
        let plugin = MsgType::new(cfg).unwrap();

        let uns = Ipv4Addr::UNSPECIFIED;
        let mut msg = Message::new(uns, uns, uns, uns, &[1, 2, 3, 4, 5, 6]);
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Request));
        msg.opts_mut()
            .insert(DhcpOption::RequestedIpAddress([192, 0, 2, 100].into()));

        // no server id, ciaddr 0, requested set: INIT-REBOOT
        let ctx = test_ctx(&msg);
        assert_eq!(
            plugin.request_state(&ctx, None),
            RequestState::InitReboot
        );
        // with a server id it's SELECTING
        assert_eq!(
            plugin.request_state(&ctx, Some([192, 0, 2, 1].into())),
            RequestState::Selecting
        );

        // ciaddr set, no server id: RENEWING
        let mut renew = Message::new(
            [192, 0, 2, 100].into(),
            uns,
            uns,
            uns,
            &[1, 2, 3, 4, 5, 6],
        );
        renew
            .opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Request));
        let ctx = test_ctx(&renew);
        assert_eq!(plugin.request_state(&ctx, None), RequestState::Renewing);
    }

    fn test_ctx(msg: &Message) -> MsgContext<Message> {
        use hearth_core::server::msg::SerialMsg;
        use hearth_core::unix_udp_sock::RecvMeta;
        let addr: std::net::SocketAddr = "192.0.2.50:68".parse().unwrap();
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
            SerialMsg::new(proto::Encodable::to_vec(msg).unwrap().into(), addr),
            meta,
            state,
            None,
        )
        .unwrap()
    }
}
