//! context of current server message
use chrono::{DateTime, TimeDelta, Utc};
use pnet::ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use proto::{Decodable, Encodable, v4, v6};
use tracing::trace;
use unix_udp_sock::RecvMeta;

use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use crate::{
    hook::{CalloutAction, CalloutPoint, HookRegistry},
    metrics::{self, RECV_TYPE_COUNT, SENT_TYPE_COUNT, V6_RECV_TYPE_COUNT, V6_SENT_TYPE_COUNT},
    server::{State, msg::SerialMsg, typemap::TypeMap},
};

/// event label: datagram pulled off the socket
pub const EVENT_RECEIVED: &str = "socket_received";
/// event label: a worker began the transaction
pub const EVENT_PROCESS_STARTED: &str = "process_started";
/// event label: the transaction finished building its response
pub const EVENT_PROCESS_COMPLETED: &str = "process_completed";
/// event label: the response hit the wire
pub const EVENT_RESPONSE_SENT: &str = "response_sent";

/// one timestamped lifecycle event on a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PktEvent {
    /// which stage boundary this marks
    pub label: &'static str,
    /// when it happened
    pub at: DateTime<Utc>,
}

/// the subnet id a query was matched to, stashed by the selection stage
/// for everything downstream (allocation, statistics, timing)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedSubnet(pub u32);

/// key a transaction by its wire transaction id (parking lot)
pub trait XidKey {
    /// the transaction id widened to 32 bits
    fn xid_key(&self) -> u32;
}

impl XidKey for v4::Message {
    fn xid_key(&self) -> u32 {
        self.xid()
    }
}

impl XidKey for v6::Message {
    fn xid_key(&self) -> u32 {
        self.xid_num()
    }
}

/// Context is what will be passed to the [handler] traits and mutated by
/// the plugins to enrich with data.
///
/// [handler]: crate::handler
pub struct MsgContext<T> {
    /// underlying byte message and address. msg_buf.addr is the address
    /// we received the message from.
    msg_buf: SerialMsg,
    /// address received. This is initially set to the address of the
    /// UDP packet, but can be overridden with `set_src_addr`.
    src_addr: SocketAddr,
    /// address response sent to
    dst_addr: Option<SocketAddr>,
    /// time this context was created
    time: DateTime<Utc>,
    /// decoded from msg
    msg: T,
    /// decoded response msg -- **CAREFUL** do not call `take()` on this
    /// before logging the query (or we won't have the data for logging)
    resp_msg: Option<T>,
    /// the encoded response, set just before the send syscall so the
    /// buffer-send callouts can see the final bytes
    resp_buf: Option<SerialMsg>,
    /// a type map for use by plugins to store values
    type_map: TypeMap,
    /// unique id we assign to each `MsgContext`
    id: u64,
    /// reference to `State`
    state: Arc<State>,
    /// callouts to dispatch at named lifecycle points
    hooks: Option<Arc<HookRegistry<T>>>,
    /// whether the `MsgContext` counts towards `state.live_msgs`
    is_live: bool,
    /// metadata about the packet we received
    meta: RecvMeta,
    /// contains ip/mask/broadcast where we received msg from
    interface: Option<IpNetwork>,
    /// global unicast address
    global: Option<IpNetwork>,
    /// stage-boundary timestamps, fed to the duration monitor after the
    /// response is sent
    events: Vec<PktEvent>,
}

impl<T: fmt::Debug> fmt::Debug for MsgContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgContext")
            .field("src_addr", &self.src_addr)
            .field("dst_addr", &self.dst_addr)
            .field("time", &self.time)
            .field("id", &self.id)
            .field("is_live", &self.is_live)
            .field("msg", &self.msg)
            .field("resp_msg", &self.resp_msg)
            .field("interface", &self.interface)
            .finish()
    }
}

impl<T> Drop for MsgContext<T> {
    fn drop(&mut self) {
        if self.is_live {
            self.state.dec_live_msgs();
        }
    }
}

impl<T> MsgContext<T> {
    /// Get the id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the `SerialMsg` bytes by shared ref
    pub fn bytes(&self) -> &[u8] {
        self.msg_buf.bytes()
    }
    /// return meta data associated with recv'd packet
    pub fn meta(&self) -> RecvMeta {
        self.meta
    }

    /// Get `Serial` message by shared ref
    pub fn msg_buf(&self) -> &SerialMsg {
        &self.msg_buf
    }

    /// Get the `DateTime` that we first created this `MsgContext`
    ///
    /// [`DateTime`]: chrono::DateTime
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// reference to the shared server state
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// record a lifecycle event at the current instant
    pub fn add_event(&mut self, label: &'static str) {
        self.events.push(PktEvent {
            label,
            at: Utc::now(),
        });
    }

    /// every recorded event, in order
    pub fn events(&self) -> &[PktEvent] {
        &self.events
    }

    /// elapsed time between two recorded events
    pub fn duration_between(&self, start: &str, end: &str) -> Option<TimeDelta> {
        let start = self.events.iter().find(|ev| ev.label == start)?.at;
        let end = self.events.iter().find(|ev| ev.label == end)?.at;
        (end >= start).then(|| end - start)
    }

    /// Store a value in the current `MsgContext` based on a type.
    /// This value will be available across any step in the lifecycle of a
    /// request
    ///
    /// If this type already exists, it will be returned
    pub fn set_local<U: Send + Sync + 'static>(&mut self, val: U) -> Option<U> {
        self.type_map.insert(val)
    }

    /// Return a value in the current `MsgContext` based on a type, or `None` if
    /// no such value is present.
    pub fn get_local<U: Send + Sync + 'static>(&self) -> Option<&U> {
        self.type_map.get::<U>()
    }

    /// Return a mutable reference to a value in the current `MsgContext` based
    /// on a type, or `None` if no such value is present.
    pub fn get_mut_local<U: Send + Sync + 'static>(&mut self) -> Option<&mut U> {
        self.type_map.get_mut::<U>()
    }

    /// Removes an item from the type map, returning it.
    pub fn remove_local<U: Send + Sync + 'static>(&mut self) -> Option<U> {
        self.type_map.remove::<U>()
    }

    /// Return the source address and port.
    pub fn src_addr(&self) -> SocketAddr {
        self.src_addr
    }

    /// Overrides the `src_addr` with a new address/port.
    pub fn set_src_addr(&mut self, addr: SocketAddr) {
        self.src_addr = addr;
    }

    /// Return the destination address and port IF it has been set.
    ///
    /// `dst_addr` is determined when a response is sent. It will most
    /// often be the IP of the DHCP relay (giaddr).
    pub fn dst_addr(&self) -> Option<SocketAddr> {
        self.dst_addr
    }

    /// Overrides the `dst_addr` with a new address/port.
    pub fn set_dst_addr(&mut self, addr: SocketAddr) {
        self.dst_addr = Some(addr);
    }

    /// the encoded response, present only between encode and send
    pub fn resp_buf(&self) -> Option<&SerialMsg> {
        self.resp_buf.as_ref()
    }

    /// store the encoded response for the buffer-send callouts
    pub fn set_resp_buf(&mut self, buf: SerialMsg) {
        self.resp_buf = Some(buf);
    }

    /// Decrement the `state.live_msgs` counter and mark this as not live
    /// This gets done before passing the `MsgContext` to the postresponse
    /// plugins.
    pub fn mark_as_not_live(&mut self) {
        if self.is_live {
            self.state.dec_live_msgs();
            self.is_live = false;
        }
    }
}

impl<T: Send + Sync + 'static> MsgContext<T> {
    /// run the callouts registered at `point`, if any
    pub async fn dispatch(&mut self, point: CalloutPoint) -> CalloutAction {
        let hooks = match &self.hooks {
            Some(hooks) => Arc::clone(hooks),
            None => return CalloutAction::Continue,
        };
        hooks.dispatch(point, self).await
    }
}

impl<T: Encodable + Decodable> MsgContext<T> {
    /// Decode a received buffer into a `MsgContext`
    pub fn new(
        msg_buf: SerialMsg,
        meta: RecvMeta,
        state: Arc<State>,
        hooks: Option<Arc<HookRegistry<T>>>,
    ) -> Result<Self, proto::DecodeError> {
        let msg = msg_buf.to_msg()?;
        let mut ctx = Self {
            msg_buf,
            src_addr: meta.addr,
            meta,
            dst_addr: None,
            time: Utc::now(),
            msg,
            type_map: TypeMap::new(),
            resp_msg: None,
            resp_buf: None,
            id: state.inc_id(),
            state,
            hooks,
            is_live: true,
            interface: None,
            global: None,
            events: Vec::with_capacity(4),
        };
        ctx.add_event(EVENT_RECEIVED);
        Ok(ctx)
    }

    /// Takes the decoded response message, encodes into a `SerialMsg`
    pub fn encode_resp_msg(&mut self) -> io::Result<SerialMsg> {
        let msg = self
            .resp_msg
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no response message"))?;
        SerialMsg::from_msg(msg, self.msg_buf.addr())
    }

    /// The deserialized contents of `msg`
    pub fn msg(&self) -> &T {
        &self.msg
    }

    /// The mutable deserialized contents of `msg`
    pub fn msg_mut(&mut self) -> &mut T {
        &mut self.msg
    }

    /// The contents of `resp_msg`
    pub fn resp_msg(&self) -> Option<&T> {
        self.resp_msg.as_ref()
    }

    /// sets the resp_msg with a `Message`
    pub fn set_resp_msg(&mut self, msg: T) {
        self.resp_msg = Some(msg);
    }
    /// take response message and replace with None
    pub fn resp_msg_take(&mut self) -> Option<T> {
        self.resp_msg.take()
    }
    /// The mutable deserialized contents of `resp_msg`
    pub fn resp_msg_mut(&mut self) -> Option<&mut T> {
        self.resp_msg.as_mut()
    }
    /// set the interface for the message
    pub fn set_interface<I: Into<IpNetwork>>(&mut self, interface: I) {
        self.interface = Some(interface.into());
    }
    /// set the global unicast address associated with the interface the message was received on
    pub fn set_global<I: Into<IpNetwork>>(&mut self, global: I) {
        self.global = Some(global.into());
    }
}

// v4 specific functions
impl MsgContext<v4::Message> {
    /// get the interface for the message. this should always be set
    pub fn interface(&self) -> Option<Ipv4Network> {
        self.interface.and_then(|int| match int {
            IpNetwork::V4(int) => Some(int),
            _ => None,
        })
    }

    /// determine the response addr based on request. Sets response giaddr
    /// if we are talking to a relay.
    //
    /// From RFC 2131:
    //
    // 1. If 'giaddr' is non-zero, send any return messages to the
    //    'DHCP server' port on the relay whose address appears in 'giaddr'.
    // 2. If 'giaddr' is zero and 'ciaddr' is nonzero, unicast to 'ciaddr'.
    // 3. Otherwise broadcast to 0xffffffff. (Folding in the
    //    yiaddr-unicast case: without an ARP injection path the broadcast
    //    is what every client hears.)
    pub fn resp_addr(&mut self, default_port: bool) -> SocketAddr {
        let req = self.msg();
        let giaddr = req.giaddr();
        let ciaddr = req.ciaddr();

        if !default_port {
            trace!("using non-default port for response");
            // if we are not on the default v4 port, send the response
            // back to the source ip:port as unicast.
            // This is useful for testing
            self.msg_buf().addr()
        } else if !giaddr.is_unspecified() {
            trace!("responding using giaddr");
            if let Some(resp) = self.resp_msg.as_mut() {
                resp.set_giaddr(giaddr);
            }
            (giaddr, v4::SERVER_PORT).into()
        } else if !ciaddr.is_unspecified() {
            trace!("responding using ciaddr");
            (ciaddr, v4::CLIENT_PORT).into()
        } else {
            trace!("use broadcast addr");
            (Ipv4Addr::BROADCAST, v4::CLIENT_PORT).into()
        }
    }

    /// records metrics for recvd DHCP message
    pub fn recv_metrics(&self) {
        metrics::DHCPV4_BYTES_RECV.inc_by(self.bytes().len() as u64);
        self.state.stats().inc("pkt4-received");
        match self.msg().opts().msg_type() {
            Some(v4::MessageType::Discover) => RECV_TYPE_COUNT.discover.inc(),
            Some(v4::MessageType::Request) => RECV_TYPE_COUNT.request.inc(),
            Some(v4::MessageType::Decline) => RECV_TYPE_COUNT.decline.inc(),
            Some(v4::MessageType::Release) => RECV_TYPE_COUNT.release.inc(),
            Some(v4::MessageType::Offer) => RECV_TYPE_COUNT.offer.inc(),
            Some(v4::MessageType::Ack) => RECV_TYPE_COUNT.ack.inc(),
            Some(v4::MessageType::Nak) => RECV_TYPE_COUNT.nak.inc(),
            Some(v4::MessageType::Inform) => RECV_TYPE_COUNT.inform.inc(),
            _ => RECV_TYPE_COUNT.unknown.inc(),
        }
    }

    /// records metrics for sent DHCP message
    pub fn sent_metrics(&self) {
        match self.resp_msg().and_then(|resp| resp.opts().msg_type()) {
            Some(v4::MessageType::Offer) => SENT_TYPE_COUNT.offer.inc(),
            Some(v4::MessageType::Ack) => SENT_TYPE_COUNT.ack.inc(),
            Some(v4::MessageType::Nak) => SENT_TYPE_COUNT.nak.inc(),
            Some(_) => SENT_TYPE_COUNT.unknown.inc(),
            None => {}
        }
    }

    /// replace `resp_msg` with a new message type
    /// should clear/update corresponding fields in the msg.
    /// for example, if switched to Nak, yiaddr/siaddr/ciaddr will be cleared
    pub fn update_resp_msg(&mut self, msg_type: v4::MessageType) -> Option<()> {
        let resp = self.resp_msg_mut()?;
        let server_id = resp.opts().get(v4::OptionCode::ServerIdentifier).cloned();
        let client_id = resp.opts().get(v4::OptionCode::ClientIdentifier).cloned();

        #[allow(clippy::single_match)]
        match msg_type {
            v4::MessageType::Nak => {
                let giaddr = resp.giaddr();
                resp.clear_addrs();
                resp.clear_fname();
                resp.clear_sname();
                resp.set_giaddr(giaddr);
                // remove all opts and add back the identifiers
                resp.opts_mut().clear();
                if let Some(server_opt) = server_id {
                    resp.opts_mut().insert(server_opt);
                }
                if let Some(client_id) = client_id {
                    resp.opts_mut().insert(client_id);
                }
            }
            _ => {}
        };
        resp.opts_mut()
            .insert(v4::DhcpOption::MessageType(msg_type));
        Some(())
    }

    /// Look in the `msg` and see if there was a lease time requested
    pub fn requested_lease_time(&self) -> Option<Duration> {
        if let Some(v4::DhcpOption::AddressLeaseTime(secs)) =
            self.msg().opts().get(v4::OptionCode::AddressLeaseTime)
        {
            Some(Duration::from_secs(u64::from(*secs)))
        } else {
            None
        }
    }

    /// Determine what the requested IP is
    /// If `ciaddr` is not unspecified, return it
    /// else if opts has `RequestedIpAddress`, return it,
    /// otherwise return None, there is no requested IP
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        let req = self.msg();
        if !req.ciaddr().is_unspecified() {
            // renew or rebind
            Some(req.ciaddr())
        } else if let Some(v4::DhcpOption::RequestedIpAddress(ip)) =
            req.opts().get(v4::OptionCode::RequestedIpAddress)
        {
            Some(*ip)
        } else {
            None
        }
    }

    /// The explicit subnet hint carried by the query, per RFC 3527:
    ///
    /// > In the event that a DHCP server receives a packet that contains
    /// > both a subnet-selection option, as well as a link-selection
    /// > sub-option, the information contained in the link-selection
    /// > sub-option MUST be used [..] in preference to the information
    /// > contained in the subnet-selection option.
    pub fn subnet_hint(&self) -> Option<Ipv4Addr> {
        use proto::v4::{
            DhcpOption, OptionCode,
            relay::{RelayCode, RelayInfo},
        };
        self.msg
            .opts()
            .get(OptionCode::RelayAgentInformation)
            .and_then(|opt| {
                if let DhcpOption::RelayAgentInformation(info) = opt {
                    if let Some(RelayInfo::LinkSelection(ip)) = info.get(RelayCode::LinkSelection) {
                        return Some(*ip);
                    }
                }
                None
            })
            .or_else(|| match self.msg.opts().get(OptionCode::SubnetSelection) {
                Some(DhcpOption::SubnetSelection(ip)) => Some(*ip),
                _ => None,
            })
    }

    /// determine the correct subnet of a DHCP message from hint, relay,
    /// or client address
    ///
    /// # Returns
    /// returns an Err if no link/subnet/giaddr/ciaddr available
    pub fn relay_subnet(&self) -> io::Result<Ipv4Addr> {
        let giaddr = self.msg().giaddr();
        let ciaddr = self.msg().ciaddr();

        if let Some(ip) = self.subnet_hint() {
            Ok(ip)
        } else if !giaddr.is_unspecified() {
            Ok(giaddr)
        } else if !ciaddr.is_unspecified() {
            Ok(ciaddr)
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "We can't determine which subnet to apply because:
                 - has no link selection relay info
                 - has no subnet selection option
                 - its giaddr is unspecified
                 - ciaddr is unspecified",
            ))
        }
    }

    /// tries to determine the subnet for this MsgContext. calls `relay_subnet` first,
    /// and if there is no relay information, falls back on the IP of the interface
    /// the message was recv'd on
    pub fn subnet(&self) -> io::Result<Ipv4Addr> {
        self.relay_subnet().or_else(|_| {
            self.interface().map(|int| int.ip()).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no interface set for MsgContext",
                )
            })
        })
    }

    /// looks in `msg` for `DhcpOption::ParameterRequestList` and provides any options
    /// in `resp_msg` that match both in `opts` and in the param req list
    ///
    /// Copies over options from request that should be present on response
    /// Also, looks at `interface` and adds subnetmask/broadcast. If provided by `param_opts`
    /// these will be overwritten.
    pub fn populate_opts(&mut self, param_opts: &v4::DhcpOptions) -> Option<()> {
        use proto::v4::{DhcpOption, OptionCode};
        let subnet = self.subnet();
        // https://datatracker.ietf.org/doc/html/rfc3046#section-2.2
        // copy opt 82 (relay agent) into response
        let resp = self.resp_msg.as_mut()?;
        if let Some(info) = self.msg.opts().get(OptionCode::RelayAgentInformation) {
            resp.opts_mut().insert(info.clone());
        }

        // https://datatracker.ietf.org/doc/html/rfc6842#section-3
        // copy client id
        if let Some(id) = self.msg.opts().get(OptionCode::ClientIdentifier) {
            resp.opts_mut().insert(id.clone());
        }
        let mut interface_match = false;
        // insert router/netmask
        // if the config provides these also, they will be overwritten
        if let Some(IpNetwork::V4(interface)) = self.interface {
            // if we populate from interface, interface must be on same subnet as packet (local)
            if matches!(subnet, Ok(subnet) if interface.contains(subnet)) {
                resp.opts_mut()
                    .insert(DhcpOption::Router(vec![interface.ip()]));
                resp.opts_mut()
                    .insert(DhcpOption::SubnetMask(interface.mask()));
                interface_match = true;
            }
            // configured router/netmask will override interface
            if let Some(v) = param_opts.get(OptionCode::Router) {
                resp.opts_mut().insert(v.clone());
            }
            if let Some(v) = param_opts.get(OptionCode::SubnetMask) {
                resp.opts_mut().insert(v.clone());
            }
        }

        if let Some(DhcpOption::ParameterRequestList(requested)) =
            self.msg.opts().get(OptionCode::ParameterRequestList)
        {
            // if broadcast addr is requested, try to fill from interface
            if let Some(IpNetwork::V4(interface)) = self.interface {
                if requested.contains(&v4::OptionCode::BroadcastAddr) && interface_match {
                    resp.opts_mut()
                        .insert(DhcpOption::BroadcastAddr(interface.broadcast()));
                }
            }
            // look in the requested list of params
            for code in requested {
                // if we have that option, add it to the response
                if let Some(v) = param_opts.get(*code) {
                    resp.opts_mut().insert(v.clone());
                }
            }
        }
        Some(())
    }

    /// Populate the opts with lease times
    /// looks in `msg` for `DhcpOption::ParameterRequestList` and provides any options
    /// in `resp_msg` that match both in `opts` and in the param req list
    pub fn populate_opts_lease(
        &mut self,
        param_opts: &v4::DhcpOptions,
        lease: Duration,
        renew: Duration,
        rebind: Duration,
    ) -> Option<()> {
        self.populate_opts(param_opts)?;
        let resp = self.resp_msg.as_mut()?;
        resp.opts_mut()
            .insert(v4::DhcpOption::AddressLeaseTime(whole_seconds(lease)));
        resp.opts_mut()
            .insert(v4::DhcpOption::Renewal(whole_seconds(renew)));
        resp.opts_mut()
            .insert(v4::DhcpOption::Rebinding(whole_seconds(rebind)));
        Some(())
    }
}

fn whole_seconds(t: Duration) -> u32 {
    if t.subsec_millis() >= 500 {
        t.as_secs() as u32 + 1
    } else {
        t.as_secs() as u32
    }
}

impl MsgContext<v6::Message> {
    /// get the global unicast addr associated with the received interface
    pub fn global(&self) -> Option<Ipv6Network> {
        self.global.and_then(|int| match int {
            IpNetwork::V6(int) => Some(int),
            _ => None,
        })
    }
    /// get the interface for the message. this should always be set
    pub fn interface(&self) -> Option<Ipv6Network> {
        self.interface.and_then(|int| match int {
            IpNetwork::V6(int) => Some(int),
            _ => None,
        })
    }

    /// get the response address to send the message to
    pub fn resp_addr(&mut self, default_port: bool) -> SocketAddr {
        if !default_port {
            trace!("using non-default port for response");
            self.msg_buf().addr()
        } else {
            let mut src = self.src_addr();
            src.set_port(v6::CLIENT_PORT);
            src
        }
    }

    /// Looks in `msg` for `DhcpOption::ORO` and provides any options
    /// in `resp_msg` that are in `param_opts`.
    /// include the client identifier *if it was present* in the original message
    pub fn populate_opts(&mut self, param_opts: &v6::DhcpOptions) -> Option<()> {
        use proto::v6::{DhcpOption, OptionCode};
        // the client's options live on the innermost message of a relay
        // chain
        let client_msg = self.msg.innermost().clone();
        let resp = self.resp_msg.as_mut()?;

        // copy client id https://www.rfc-editor.org/rfc/rfc8415.html#section-18.3.9
        if let Some(id) = client_msg.opts().get(OptionCode::ClientId) {
            resp.opts_mut().insert(id.clone());
        }

        if let Some(DhcpOption::ORO(requested)) = client_msg.opts().get(OptionCode::ORO) {
            trace!(?requested, "requested opts");
            // look in the requested list of params
            for code in &requested.opts {
                // if we have that option, add it to the response
                if let Some(v) = param_opts.get(*code) {
                    resp.opts_mut().insert(v.clone());
                }
            }
        }
        Some(())
    }

    /// records metrics for recvd DHCP message
    pub fn recv_metrics(&self) {
        metrics::DHCPV6_BYTES_RECV.inc_by(self.bytes().len() as u64);
        self.state.stats().inc("pkt6-received");
        match self.msg().msg_type() {
            v6::MessageType::Solicit => V6_RECV_TYPE_COUNT.solicit.inc(),
            v6::MessageType::Advertise => V6_RECV_TYPE_COUNT.advertise.inc(),
            v6::MessageType::Request => V6_RECV_TYPE_COUNT.request.inc(),
            v6::MessageType::Confirm => V6_RECV_TYPE_COUNT.confirm.inc(),
            v6::MessageType::Renew => V6_RECV_TYPE_COUNT.renew.inc(),
            v6::MessageType::Rebind => V6_RECV_TYPE_COUNT.rebind.inc(),
            v6::MessageType::Reply => V6_RECV_TYPE_COUNT.reply.inc(),
            v6::MessageType::Release => V6_RECV_TYPE_COUNT.release.inc(),
            v6::MessageType::Decline => V6_RECV_TYPE_COUNT.decline.inc(),
            v6::MessageType::Reconfigure => V6_RECV_TYPE_COUNT.reconf.inc(),
            v6::MessageType::InformationRequest => V6_RECV_TYPE_COUNT.inforeq.inc(),
            v6::MessageType::RelayForw => V6_RECV_TYPE_COUNT.relayforw.inc(),
            v6::MessageType::RelayRepl => V6_RECV_TYPE_COUNT.relayrepl.inc(),
            _ => V6_RECV_TYPE_COUNT.unknown.inc(),
        }
    }

    /// records metrics for sent DHCP message
    pub fn sent_metrics(&self) {
        match self.resp_msg().map(|resp| resp.msg_type()) {
            Some(v6::MessageType::Advertise) => V6_SENT_TYPE_COUNT.advertise.inc(),
            Some(v6::MessageType::Reply) => V6_SENT_TYPE_COUNT.reply.inc(),
            Some(v6::MessageType::RelayRepl) => V6_SENT_TYPE_COUNT.relayrepl.inc(),
            Some(_) => V6_SENT_TYPE_COUNT.unknown.inc(),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::TimeDelta;
    use perfmon::{Family, MonitoredDurationStore};
    use stats::StatsMgr;

    use super::*;

    fn test_state() -> Arc<State> {
        Arc::new(State::new(
            10,
            Arc::new(StatsMgr::new()),
            Arc::new(MonitoredDurationStore::new(Family::V4, TimeDelta::seconds(60)).unwrap()),
        ))
    }

    fn blank_msg() -> (v4::Message, SocketAddr, Arc<State>) {
        let msg = v4::Message::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &[0, 1, 2, 3, 4, 5],
        );
        let addr = "1.2.3.4:67".parse().unwrap();
        (msg, addr, test_state())
    }

    fn ctx_for(msg: &v4::Message, addr: SocketAddr, state: Arc<State>) -> MsgContext<v4::Message> {
        let meta = RecvMeta {
            addr,
            ..RecvMeta::default()
        };
        MsgContext::new(
            SerialMsg::new(Bytes::from(msg.to_vec().unwrap()), addr),
            meta,
            state,
            None,
        )
        .unwrap()
    }

    fn assert_opt(ctx: &MsgContext<v4::Message>, opt: v4::DhcpOption) {
        assert_eq!(
            &opt,
            ctx.resp_msg()
                .unwrap()
                .opts()
                .get(v4::OptionCode::from(&opt))
                .unwrap()
        );
    }

    #[test]
    fn test_subnet_giaddr() {
        let (mut msg, addr, state) = blank_msg();
        msg.set_giaddr([1, 2, 3, 4]);
        let ctx = ctx_for(&msg, addr, state);
        assert_eq!(ctx.relay_subnet().unwrap(), Ipv4Addr::new(1, 2, 3, 4));
    }

    #[test]
    fn test_subnet_subnet_selection() {
        let (mut msg, addr, state) = blank_msg();
        msg.opts_mut()
            .insert(v4::DhcpOption::SubnetSelection([1, 2, 3, 4].into()));
        let ctx = ctx_for(&msg, addr, state);
        assert_eq!(ctx.relay_subnet().unwrap(), Ipv4Addr::new(1, 2, 3, 4));
    }

    #[test]
    fn test_subnet_relay_link_selection() {
        use v4::relay::{RelayAgentInformation, RelayInfo};
        let (mut msg, addr, state) = blank_msg();
        let mut info = RelayAgentInformation::default();
        info.insert(RelayInfo::LinkSelection([1, 2, 3, 4].into()));
        msg.opts_mut()
            .insert(v4::DhcpOption::RelayAgentInformation(info));
        // link selection beats even an explicit option 118
        msg.opts_mut()
            .insert(v4::DhcpOption::SubnetSelection([9, 9, 9, 9].into()));
        let ctx = ctx_for(&msg, addr, state);
        assert_eq!(ctx.relay_subnet().unwrap(), Ipv4Addr::new(1, 2, 3, 4));
    }

    #[test]
    fn test_giaddr_unspecified() {
        let (msg, addr, state) = blank_msg();
        let ctx = ctx_for(&msg, addr, state);
        assert!(ctx.relay_subnet().is_err());
    }

    // tests that the parameters in `msg` get fulfilled with a given
    // `opts` and placed in `resp_msg`
    #[test]
    fn test_param_req_list() {
        let (mut msg, addr, state) = blank_msg();
        // opt codes we are requesting
        msg.opts_mut()
            .insert(v4::DhcpOption::ParameterRequestList(vec![
                v4::OptionCode::Router,
            ]));
        // opts used to serve requests
        let mut opts = v4::DhcpOptions::default();
        opts.insert(v4::DhcpOption::Router(vec![[1, 2, 3, 4].into()]));
        opts.insert(v4::DhcpOption::DomainNameServer(vec![[1, 2, 3, 4].into()]));
        let mut ctx = ctx_for(&msg, addr, state);
        ctx.set_resp_msg(v4::Message::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &[1, 2, 3, 4, 5, 6],
        ));
        // parse param req list, supplying opts
        ctx.populate_opts_lease(
            &opts,
            Duration::from_secs(3600),
            Duration::from_secs(3600 / 2),
            Duration::from_secs(3600 * 7 / 8),
        );
        // expect Router to be avail in ctx, but not the unrequested DNS
        assert_opt(&ctx, v4::DhcpOption::Router(vec![[1, 2, 3, 4].into()]));
        assert_opt(&ctx, v4::DhcpOption::AddressLeaseTime(3600));
        assert_opt(&ctx, v4::DhcpOption::Renewal(3600 / 2));
        assert_opt(&ctx, v4::DhcpOption::Rebinding(3600 * 7 / 8));
        assert!(ctx
            .resp_msg()
            .unwrap()
            .opts()
            .get(v4::OptionCode::DomainNameServer)
            .is_none());
    }

    #[test]
    fn test_relay_agent_resp() {
        let (mut msg, addr, state) = blank_msg();

        let mut rinfo = v4::relay::RelayAgentInformation::default();
        rinfo.insert(v4::relay::RelayInfo::LinkSelection([4, 5, 6, 7].into()));
        let backup = rinfo.clone();
        // add relay agent info to received msg
        msg.opts_mut()
            .insert(v4::DhcpOption::RelayAgentInformation(rinfo));
        let mut ctx = ctx_for(&msg, addr, state);
        ctx.set_resp_msg(v4::Message::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &[1, 2, 3, 4, 5, 6],
        ));
        let opts = v4::DhcpOptions::default();
        ctx.populate_opts(&opts);

        // expect relay agent to be in resp
        assert_opt(&ctx, v4::DhcpOption::RelayAgentInformation(backup));
    }

    #[test]
    fn test_nak_clears_response() {
        let (msg, addr, state) = blank_msg();
        let mut ctx = ctx_for(&msg, addr, state);
        let mut resp = v4::Message::new(
            Ipv4Addr::UNSPECIFIED,
            [192, 0, 2, 100].into(),
            [192, 0, 2, 1].into(),
            Ipv4Addr::UNSPECIFIED,
            &[1, 2, 3, 4, 5, 6],
        );
        resp.opts_mut()
            .insert(v4::DhcpOption::ServerIdentifier([192, 0, 2, 1].into()));
        resp.opts_mut()
            .insert(v4::DhcpOption::Router(vec![[192, 0, 2, 1].into()]));
        ctx.set_resp_msg(resp);

        ctx.update_resp_msg(v4::MessageType::Nak).unwrap();
        let resp = ctx.resp_msg().unwrap();
        assert!(resp.yiaddr().is_unspecified());
        assert!(resp.opts().has_msg_type(v4::MessageType::Nak));
        // server id survives the sweep, everything else goes
        assert!(resp.opts().get(v4::OptionCode::ServerIdentifier).is_some());
        assert!(resp.opts().get(v4::OptionCode::Router).is_none());
    }

    #[test]
    fn test_event_durations() {
        let (msg, addr, state) = blank_msg();
        let mut ctx = ctx_for(&msg, addr, state);
        ctx.add_event(EVENT_PROCESS_STARTED);
        ctx.add_event(EVENT_PROCESS_COMPLETED);
        assert!(ctx
            .duration_between(EVENT_RECEIVED, EVENT_PROCESS_COMPLETED)
            .is_some());
        assert!(ctx
            .duration_between(EVENT_RECEIVED, EVENT_RESPONSE_SENT)
            .is_none());
    }
}
