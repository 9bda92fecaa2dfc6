#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! prometheus transport metrics. The named server statistics (the ones the
//! control channel serves) live in the `stats` crate; what's here is the
//! process-level view scraped over HTTP.
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum MsgType {
        discover,
        request,
        decline,
        release,
        offer,
        ack,
        nak,
        inform,
        unknown,
    }
    pub struct RecvStats: IntCounter {
        "message_type" => MsgType
    }
    pub struct SentStats: IntCounter {
        "message_type" => MsgType
    }
    pub label_enum V6MsgType {
        solicit,
        advertise,
        request,
        confirm,
        renew,
        rebind,
        reply,
        release,
        decline,
        reconf,
        inforeq,
        relayforw,
        relayrepl,
        unknown,
    }
    pub struct V6RecvStats: IntCounter {
        "v6_message_type" => V6MsgType
    }
    pub struct V6SentStats: IntCounter {
        "v6_message_type" => V6MsgType
    }
}

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();

    /// bytes recv DHCPv4
    pub static ref DHCPV4_BYTES_RECV: IntCounter = register_int_counter!("dhcpv4_bytes_recv", "DHCPv4 bytes recv").unwrap();
    /// bytes recv DHCPv6
    pub static ref DHCPV6_BYTES_RECV: IntCounter = register_int_counter!("dhcpv6_bytes_recv", "DHCPv6 bytes recv").unwrap();

    pub static ref RECV_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "recv_type_counts",
        "Recv Type Counts",
        &["message_type"]
    )
    .unwrap();
    pub static ref SENT_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "sent_type_counts",
        "Sent Type Counts",
        &["message_type"]
    )
    .unwrap();

    /// aggregate count of all recv'd messages types
    pub static ref RECV_TYPE_COUNT: RecvStats = RecvStats::from(&RECV_COUNT_VEC);

    /// aggregate count of all sent messages types
    pub static ref SENT_TYPE_COUNT: SentStats = SentStats::from(&SENT_COUNT_VEC);

    pub static ref V6_RECV_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "v6_recv_type_counts",
        "V6 Recv Type Counts",
        &["v6_message_type"]
    )
    .unwrap();
    pub static ref V6_SENT_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "v6_sent_type_counts",
        "V6 Sent Type Counts",
        &["v6_message_type"]
    )
    .unwrap();

    /// aggregate count of all recv'd messages types
    pub static ref V6_RECV_TYPE_COUNT: V6RecvStats = V6RecvStats::from(&V6_RECV_COUNT_VEC);

    /// aggregate count of all sent messages types
    pub static ref V6_SENT_TYPE_COUNT: V6SentStats = V6SentStats::from(&V6_SENT_COUNT_VEC);

    /// # of in flight msgs
    pub static ref IN_FLIGHT: IntGauge =
        register_int_gauge!("in_flight", "count of currently processing messages").unwrap();

    /// buffers dropped because the ingress queue was full
    pub static ref QUEUE_FULL_DROPS: IntCounter =
        register_int_counter!("queue_full_drops", "buffers dropped, ingress queue full").unwrap();

    /// # of transactions currently parked by hooks
    pub static ref PARKED: IntGauge =
        register_int_gauge!("parked", "count of transactions parked by hooks").unwrap();

    /// # of total addrs available
    pub static ref TOTAL_AVAILABLE_ADDRS: IntGauge =
        register_int_gauge!("total_available_addrs", "count of total available addresses").unwrap();
    /// server uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "server uptime (seconds)").unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::{QUEUE_FULL_DROPS, RECV_TYPE_COUNT};

    #[test]
    fn counters_are_registered_and_exposed() {
        RECV_TYPE_COUNT.discover.inc();
        QUEUE_FULL_DROPS.inc();

        let families = gather();
        let names = families
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();

        assert!(
            names.contains("recv_type_counts"),
            "registered metric families: {names:?}"
        );
        assert!(
            names.contains("queue_full_drops"),
            "registered metric families: {names:?}"
        );
    }
}
