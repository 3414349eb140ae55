//! UDP multicast ingress for HTCP purge notifications.

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::htcp;
use crate::metrics::Metrics;

/// Port HTCP purge notifications arrive on.
const HTCP_PORT: u16 = 4827;

/// Sized to the largest datagram the feed produces.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 4096;

/// Joins the configured multicast groups and feeds decoded URLs into the
/// ingress channel.
pub struct MulticastReader {
    pub max_datagram_size: usize,
    /// How big we try to set the kernel buffer via setsockopt().
    pub kbuf_size: usize,
    pub mcast_addrs: Vec<Ipv4Addr>,
}

impl MulticastReader {
    /// Continuously read datagrams, extract URLs to be purged and quickly
    /// offload them to the bounded ingress channel. Returns only on a fatal
    /// bind/join failure or once every consumer is gone.
    pub async fn read(self, urls: mpsc::Sender<String>, metrics: Arc<Metrics>) -> Result<()> {
        let socket = self.bind().context("setting up the HTCP multicast socket")?;
        info!(
            "reading from {:?} with maximum datagram size {}",
            self.mcast_addrs, self.max_datagram_size
        );

        let mut buffer = vec![0u8; self.max_datagram_size];
        loop {
            let (n, src) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(err) => {
                    // Transient; exiting here would lose the whole feed.
                    warn!("error while reading datagram: {err}");
                    continue;
                }
            };
            metrics.add_udp_bytes(n as u64);

            match htcp::extract_url(&buffer, n, &metrics) {
                Ok(url) => {
                    if urls.send(url.to_string()).await.is_err() {
                        return Ok(());
                    }
                }
                Err(err) => debug!("dropping datagram from {src}: {err}"),
            }
        }
    }

    fn bind(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket
            .set_recv_buffer_size(self.kbuf_size)
            .context("setting the kernel receive buffer")?;

        let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, HTCP_PORT).into();
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("binding UDP port {HTCP_PORT}"))?;

        for group in &self.mcast_addrs {
            socket
                .join_multicast_v4(group, &Ipv4Addr::UNSPECIFIED)
                .with_context(|| format!("joining multicast group {group}"))?;
        }

        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into()).context("registering the socket with the runtime")
    }
}
