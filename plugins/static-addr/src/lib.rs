#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

//! Host-reservation stage. Looks the client up in the reservation store
//! and stashes the match for the allocation stage, which prefers a
//! reserved address over everything else.

use hearth_core::{
    prelude::*,
    proto::v4::Message,
    server::context::SelectedSubnet,
};

use config::DhcpConfig;
use hosts::{HostScope, Reservation};
use message_type::{MatchedClasses, MsgType, util};

/// the reservation this query matched, if any
#[derive(Debug, Clone, PartialEq)]
pub struct ReservedHost(pub Reservation);

#[derive(Debug)]
pub struct StaticAddr {
    cfg: Arc<DhcpConfig>,
}

impl StaticAddr {
    pub fn new(cfg: Arc<DhcpConfig>) -> Result<Self> {
        Ok(Self { cfg })
    }
}

impl hearth_core::Register<Message> for StaticAddr {
    fn register(self, srv: &mut hearth_core::Server<Message>) {
        srv.plugin_order(self, &[std::any::TypeId::of::<MsgType>()]);
    }
}

#[async_trait]
impl Plugin<Message> for StaticAddr {
    #[instrument(level = "debug", skip_all)]
    async fn handle(&self, ctx: &mut MsgContext<Message>) -> Result<Action> {
        let Some(SelectedSubnet(subnet_id)) = ctx.get_local::<SelectedSubnet>().copied() else {
            // selection stage didn't run; nothing to look up against
            return Ok(Action::Continue);
        };
        let classes = ctx.get_local::<MatchedClasses>().map(|c| c.0.to_owned());
        let classes = classes.as_deref();

        let idents = util::identifiers(self.cfg.v4(), ctx.msg());
        if idents.is_empty() {
            return Ok(Action::Continue);
        }

        let hosts = self.cfg.hosts();
        // lookup-first puts the global table ahead of the subnet's own
        let scopes = if self.cfg.v4().reservations_lookup_first() {
            [HostScope::Global, HostScope::Subnet(subnet_id)]
        } else {
            [HostScope::Subnet(subnet_id), HostScope::Global]
        };
        let matched = scopes
            .iter()
            .find_map(|scope| hosts.find_first(*scope, &idents, classes));

        if let Some(res) = matched {
            debug!(
                addr = ?res.v4_address(),
                hostname = ?res.hostname,
                "client has a host reservation"
            );
            ctx.set_local(ReservedHost(res.clone()));
        }
        Ok(Action::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_core::proto::v4::{DhcpOption, MessageType};
    use hearth_core::server::msg::SerialMsg;
    use hearth_core::unix_udp_sock::RecvMeta;
    use std::net::Ipv4Addr;

    const YAML: &str = r#"
networks:
  - subnet: 192.0.2.0/24
    pools:
      - start: 192.0.2.100
        end: 192.0.2.199
    reservations:
      - mac: "aa:bb:cc:00:00:01"
        ip: 192.0.2.10
        hostname: printer
"#;

    fn ctx(msg: &Message, cfg: &Arc<DhcpConfig>) -> MsgContext<Message> {
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
        let mut ctx = MsgContext::new(
            SerialMsg::new(proto::Encodable::to_vec(msg).unwrap().into(), addr),
            meta,
            state,
            None,
        )
        .unwrap();
        let subnet_id = cfg.v4().network([192, 0, 2, 1]).unwrap().subnet_id();
        ctx.set_local(SelectedSubnet(subnet_id));
        ctx
    }

    #[tokio::test]
    async fn reservation_is_stashed_for_allocation() {
        let cfg = Arc::new(DhcpConfig::parse_str(YAML).unwrap());
        let plugin = StaticAddr::new(Arc::clone(&cfg)).unwrap();

        let uns = Ipv4Addr::UNSPECIFIED;
        let mut msg = Message::new(uns, uns, uns, uns, &[0xaa, 0xbb, 0xcc, 0, 0, 1]);
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Discover));
        let mut ctx = ctx(&msg, &cfg);
        plugin.handle(&mut ctx).await.unwrap();
        let reserved = ctx.get_local::<ReservedHost>().unwrap();
        assert_eq!(reserved.0.v4_address(), Some([192, 0, 2, 10].into()));

        // an unreserved client stashes nothing
        let msg = Message::new(uns, uns, uns, uns, &[9, 9, 9, 9, 9, 9]);
        let mut ctx = ctx_unreserved(&msg, &cfg);
        plugin.handle(&mut ctx).await.unwrap();
        assert!(ctx.get_local::<ReservedHost>().is_none());
    }

    fn ctx_unreserved(msg: &Message, cfg: &Arc<DhcpConfig>) -> MsgContext<Message> {
        ctx(msg, cfg)
    }
}
