//! Announcement broadcast.
//!
//! Every interval, serializes a snapshot of the local catalog into one
//! announcement datagram and sends it to the LAN broadcast address on
//! the configured broadcast port. An empty catalog sends nothing —
//! peers with no resources stay silent.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use cairn_core::wire::{self, AnnouncedResource, Announcement};
use cairn_services::LocalCatalog;

/// Create the broadcast sender socket, bound to `(0.0.0.0, sender_port)`
/// with broadcast permission. Separate from the loop so a bind failure
/// surfaces at startup rather than inside a spawned task.
pub fn bind(sender_port: u16) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_broadcast(true).context("SO_BROADCAST")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, sender_port);
    socket.bind(&addr.into()).context("bind()")?;
    UdpSocket::from_std(socket.into()).context("failed to register broadcast socket")
}

/// Broadcast the catalog on a regular interval until cancelled.
///
/// A failed send is logged and the loop carries on; the next tick
/// re-announces everything anyway.
pub async fn broadcast_loop(
    catalog: LocalCatalog,
    node_id: u32,
    socket: UdpSocket,
    dest: SocketAddrV4,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    tracing::info!(%dest, interval_secs = interval.as_secs(), "announcement broadcast starting");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let snapshot = catalog.snapshot();
        if snapshot.is_empty() {
            tracing::trace!("catalog empty, skipping announcement");
            continue;
        }

        let announcement = Announcement {
            timestamp_ns: unix_now_ns(),
            sender_id: node_id,
            resources: snapshot
                .into_iter()
                .map(|(name, info)| AnnouncedResource {
                    name,
                    size: info.size,
                })
                .collect(),
        };
        let datagram = match wire::encode_announcement(&announcement) {
            Ok(datagram) => datagram,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode announcement");
                continue;
            }
        };
        match socket.send_to(&datagram, SocketAddr::V4(dest)).await {
            Ok(n) => tracing::debug!(
                bytes = n,
                resources = announcement.resources.len(),
                "announcement sent"
            ),
            Err(e) => tracing::warn!(error = %e, "announcement send failed"),
        }
    }
}

fn unix_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn scratch_file(tag: &str, len: usize) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cairn-bcast-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![1u8; len]).unwrap();
        path
    }

    async fn loopback_sniffer() -> (UdpSocket, SocketAddrV4) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[tokio::test]
    async fn empty_catalog_sends_no_datagrams() {
        let (sniffer, dest) = loopback_sniffer().await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(broadcast_loop(
            LocalCatalog::new(),
            1,
            bind(0).unwrap(),
            dest,
            Duration::from_millis(20),
            cancel.clone(),
        ));

        let mut buf = [0u8; 128];
        let heard = tokio::time::timeout(Duration::from_millis(200), sniffer.recv_from(&mut buf));
        assert!(heard.await.is_err(), "silent peer must not announce");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn announces_the_catalog_snapshot() {
        let path = scratch_file("announce", 12);
        let catalog = LocalCatalog::new();
        catalog.add("test", &path).unwrap();

        let (sniffer, dest) = loopback_sniffer().await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(broadcast_loop(
            catalog,
            7,
            bind(0).unwrap(),
            dest,
            Duration::from_millis(20),
            cancel.clone(),
        ));

        let mut buf = [0u8; wire::MAX_DATAGRAM_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), sniffer.recv_from(&mut buf))
            .await
            .expect("announcement expected within the window")
            .unwrap();

        let announcement = wire::parse_announcement(&buf[..len]).unwrap();
        assert_eq!(announcement.sender_id, 7);
        assert_eq!(
            announcement.resources,
            vec![AnnouncedResource {
                name: "test".into(),
                size: 12
            }]
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
