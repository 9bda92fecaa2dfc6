//! hearth prelude

pub use crate::{
    anyhow::{self, Context, Result},
    async_trait,
    handler::{Action, Plugin},
    hook::{CalloutAction, CalloutPoint},
    pnet::datalink::{MacAddr, NetworkInterface},
    pnet::ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network},
    proto,
    server::{context::MsgContext, state::State},
    tokio,
    tracing::{self, debug, error, info, instrument, trace},
    unix_udp_sock,
};

pub use std::{io, sync::Arc};
