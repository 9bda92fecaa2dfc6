//! The packet ingress queue.
//!
//! A single reactor task owns the socket and feeds raw datagrams into a
//! bounded channel; worker tasks drain it. When the queue is full the
//! datagram is dropped on the floor and counted, which is the server's
//! backpressure: better to shed new queries than to answer all of them
//! late.
use bytes::BytesMut;
use stats::StatsMgr;
use tokio_stream::StreamExt;
use tokio_util::codec::BytesCodec;
use tracing::{error, trace};
use unix_udp_sock::{RecvMeta, UdpSocket, framed::UdpFramed};

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{metrics, server::msg::SerialMsg};

/// one raw datagram off the wire, not yet decoded
#[derive(Debug)]
pub(crate) struct Ingress {
    pub(crate) msg: SerialMsg,
    pub(crate) meta: RecvMeta,
}

/// Read datagrams off the socket into the bounded ingress queue until the
/// socket errors out or every receiver is gone. Runs as its own task; the
/// queue bound is the only place backpressure is applied.
pub(crate) async fn reactor(soc: Arc<UdpSocket>, tx: mpsc::Sender<Ingress>, stats: Arc<StatsMgr>) {
    let mut stream: UdpFramed<BytesCodec, _> = UdpFramed::new(soc, BytesCodec::new());
    while let Some(res) = stream.next().await {
        match res {
            Ok((buf, meta)) => {
                let buf: BytesMut = buf;
                let msg = SerialMsg::new(buf.freeze(), meta.addr);
                match tx.try_send(Ingress { msg, meta }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!("ingress queue full, dropping datagram");
                        stats.inc("pkt-queue-full");
                        metrics::QUEUE_FULL_DROPS.inc();
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        // workers are gone, we're shutting down
                        return;
                    }
                }
            }
            Err(err) => {
                error!(?err, "error reading from socket");
            }
        }
    }
}
