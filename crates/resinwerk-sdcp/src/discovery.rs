// SPDX-License-Identifier: MIT
//
// UDP discovery and the broker-redirect side channel.
//
// Printers answer `M99999` on UDP 3000 with a JSON descriptor, replying
// from an ephemeral port of their own.  `M66666 <port>` tells a printer
// to open an MQTT connection back to the sender on that port.

use std::net::{IpAddr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use resinwerk_core::{
    DISCOVERY_MAGIC, DiscoveryConfig, Error, PrinterDescriptor, REDIRECT_MAGIC, Result,
    SDCP_UDP_PORT,
};

/// A printer found on the network: where it answered from, plus its
/// descriptor snapshot.
#[derive(Debug, Clone)]
pub struct DiscoveredPrinter {
    pub addr: IpAddr,
    pub descriptor: PrinterDescriptor,
}

/// Broadcast `M99999` and collect descriptor replies until the timeout.
///
/// An empty result is not an error — it is logged and returned as-is.
/// Malformed replies are warned about and skipped.
pub async fn discover(
    broadcast: IpAddr,
    config: &DiscoveryConfig,
) -> Result<Vec<DiscoveredPrinter>> {
    let socket = bound_socket().await?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::Discovery(format!("set broadcast: {e}")))?;
    socket
        .send_to(DISCOVERY_MAGIC, (broadcast, config.port))
        .await
        .map_err(|e| Error::Discovery(format!("broadcast send: {e}")))?;

    let mut printers = Vec::new();
    let deadline = Instant::now() + config.broadcast_timeout;
    let mut buf = [0u8; 4096];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => return Err(Error::Discovery(format!("recv: {e}"))),
            Ok(Ok((n, from))) => {
                if let Some(printer) = parse_reply(&buf[..n], from) {
                    info!(
                        addr = %printer.addr,
                        printer = %printer.descriptor.describe(),
                        "printer discovered"
                    );
                    printers.push(printer);
                }
            }
        }
    }
    if printers.is_empty() {
        debug!(broadcast = %broadcast, "no printers answered discovery");
    }
    Ok(printers)
}

/// Unicast `M99999` to one printer; yields a fresh descriptor or `None`
/// if it stays silent.
pub async fn probe(addr: IpAddr, config: &DiscoveryConfig) -> Result<Option<DiscoveredPrinter>> {
    let socket = bound_socket().await?;
    socket
        .send_to(DISCOVERY_MAGIC, (addr, config.port))
        .await
        .map_err(|e| Error::Discovery(format!("probe send: {e}")))?;

    let mut buf = [0u8; 4096];
    match tokio::time::timeout(config.probe_timeout, socket.recv_from(&mut buf)).await {
        Err(_) => {
            debug!(addr = %addr, "probe timed out");
            Ok(None)
        }
        Ok(Err(e)) => Err(Error::Discovery(format!("recv: {e}"))),
        Ok(Ok((n, from))) => Ok(parse_reply(&buf[..n], from)),
    }
}

/// Send the `M66666 <port>` redirect datagram: the printer will open an
/// MQTT connection to this host on `broker_port`.
pub async fn send_broker_redirect(addr: IpAddr, broker_port: u16) -> Result<()> {
    send_broker_redirect_to(addr, SDCP_UDP_PORT, broker_port).await
}

/// As [`send_broker_redirect`], with an explicit destination UDP port.
pub async fn send_broker_redirect_to(
    addr: IpAddr,
    udp_port: u16,
    broker_port: u16,
) -> Result<()> {
    let socket = bound_socket().await?;
    let payload = format!("{REDIRECT_MAGIC} {broker_port}");
    socket
        .send_to(payload.as_bytes(), (addr, udp_port))
        .await
        .map_err(|e| Error::Connection(format!("redirect send: {e}")))?;
    debug!(addr = %addr, broker_port, "broker redirect sent");
    Ok(())
}

async fn bound_socket() -> Result<UdpSocket> {
    UdpSocket::bind(("0.0.0.0", 0))
        .await
        .map_err(|e| Error::Discovery(format!("bind: {e}")))
}

fn parse_reply(data: &[u8], from: SocketAddr) -> Option<DiscoveredPrinter> {
    match serde_json::from_slice::<PrinterDescriptor>(data) {
        Ok(descriptor) => Some(DiscoveredPrinter {
            addr: from.ip(),
            descriptor,
        }),
        Err(e) => {
            warn!(from = %from, error = %e, "discarding malformed discovery reply");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
