//! Announcement listener.
//!
//! Binds the broadcast port and decodes announcement datagrams from
//! peers into the peer registry. Datagrams carrying our own node id are
//! the broadcaster's self-echo (both ends bind the LAN broadcast port on
//! the same host) and are dropped. Malformed datagrams are dropped whole
//! without touching the registry. A separate reaper task evicts peers
//! whose announcements have gone stale.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use cairn_core::wire;
use cairn_services::{PeerRegistry, RemoteResource};

/// Create the listener socket, bound to `(0.0.0.0, broadcast_port)`.
/// Address reuse lets several nodes share one host.
pub fn bind(broadcast_port: u16) -> Result<UdpSocket> {
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, broadcast_port);
    socket.bind(&addr.into()).context("bind()")?;
    UdpSocket::from_std(socket.into()).context("failed to register listener socket")
}

/// Receive announcements and populate the peer registry until cancelled.
pub async fn listener_loop(
    registry: PeerRegistry,
    node_id: u32,
    socket: UdpSocket,
    cancel: CancellationToken,
) -> Result<()> {
    let mut buf = vec![0u8; wire::MAX_DATAGRAM_SIZE];
    tracing::info!(
        port = socket.local_addr().map(|a| a.port()).unwrap_or(0),
        "announcement listener starting"
    );

    loop {
        let (len, src) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
            },
        };

        let src = match src {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                tracing::trace!("ignoring IPv6 datagram on the announcement port");
                continue;
            }
        };
        process_datagram(&registry, node_id, src, &buf[..len]);
    }
}

/// Decode one datagram and fold it into the registry. Self-echo and
/// malformed datagrams leave the registry untouched.
fn process_datagram(registry: &PeerRegistry, node_id: u32, src: SocketAddrV4, datagram: &[u8]) {
    let announcement = match wire::parse_announcement(datagram) {
        Ok(announcement) => announcement,
        Err(e) => {
            tracing::debug!(%src, error = %e, "dropping malformed announcement");
            return;
        }
    };
    if announcement.sender_id == node_id {
        tracing::trace!("ignoring own announcement");
        return;
    }

    tracing::debug!(
        %src,
        sender = announcement.sender_id,
        resources = announcement.resources.len(),
        sender_clock_ns = announcement.timestamp_ns,
        "peer announcement accepted"
    );
    let resources = announcement
        .resources
        .into_iter()
        .map(|r| RemoteResource {
            name: r.name,
            size: r.size,
        })
        .collect();
    registry.upsert(src, resources, announcement.timestamp_ns);
}

/// Remove registry entries that have not been refreshed within the TTL.
pub async fn reaper_loop(
    registry: PeerRegistry,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let evicted = registry.cleanup(ttl);
        if evicted > 0 {
            tracing::debug!(evicted, "expired stale peers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::wire::{encode_announcement, AnnouncedResource, Announcement};

    fn datagram(sender_id: u32, names: &[(&str, u64)]) -> Vec<u8> {
        encode_announcement(&Announcement {
            timestamp_ns: 42,
            sender_id,
            resources: names
                .iter()
                .map(|(name, size)| AnnouncedResource {
                    name: (*name).to_owned(),
                    size: *size,
                })
                .collect(),
        })
        .unwrap()
    }

    fn src() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 45_000)
    }

    #[test]
    fn valid_datagram_is_upserted_by_source_address() {
        let registry = PeerRegistry::new();
        process_datagram(&registry, 1, src(), &datagram(2, &[("test", 12)]));

        assert_eq!(registry.len(), 1);
        assert!(registry.has(src(), "test"));
        let all = registry.all();
        assert_eq!(all[0].0, src());
        assert_eq!(all[0].1.size, 12);
    }

    #[test]
    fn self_echo_is_suppressed() {
        let registry = PeerRegistry::new();
        process_datagram(&registry, 7, src(), &datagram(7, &[("test", 12)]));
        assert!(registry.is_empty());
    }

    #[test]
    fn malformed_datagram_never_mutates_the_registry() {
        let registry = PeerRegistry::new();
        let mut corrupted = datagram(2, &[("test", 12)]);
        corrupted.truncate(corrupted.len() - 1);
        process_datagram(&registry, 1, src(), &corrupted);
        process_datagram(&registry, 1, src(), &[]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn listener_folds_received_datagrams_into_the_registry() {
        let registry = PeerRegistry::new();
        let socket = bind(0).unwrap();
        let port = socket.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener_loop(registry.clone(), 1, socket, cancel.clone()));

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        sender
            .send_to(
                &datagram(2, &[("remote.bin", 99)]),
                (Ipv4Addr::LOCALHOST, port),
            )
            .await
            .unwrap();

        // The listener runs on its own task; poll until the upsert lands.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let nodes = registry.find_nodes_with("remote.bin");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].port(), sender.local_addr().unwrap().port());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn broadcast_to_listener_lands_in_the_other_nodes_registry() {
        use crate::announce::broadcast;
        use std::io::Write;

        let dir = std::env::temp_dir().join(format!("cairn-twonode-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 12])
            .unwrap();
        let catalog = cairn_services::LocalCatalog::new();
        catalog.add("test", &path).unwrap();

        // Node 2 listens; node 1 broadcasts its one-entry catalog at it.
        let registry = PeerRegistry::new();
        let socket = bind(0).unwrap();
        let port = socket.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listener_loop(registry.clone(), 2, socket, cancel.clone()));
        let broadcaster = tokio::spawn(broadcast::broadcast_loop(
            catalog,
            1,
            broadcast::bind(0).unwrap(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let all = registry.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1, RemoteResource { name: "test".into(), size: 12 });

        cancel.cancel();
        listener.await.unwrap().unwrap();
        broadcaster.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn own_broadcasts_never_populate_the_registry() {
        use crate::announce::broadcast;
        use std::io::Write;

        let dir = std::env::temp_dir().join(format!("cairn-echo-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 12])
            .unwrap();
        let catalog = cairn_services::LocalCatalog::new();
        catalog.add("test", &path).unwrap();

        let registry = PeerRegistry::new();
        let socket = bind(0).unwrap();
        let port = socket.local_addr().unwrap().port();
        let cancel = CancellationToken::new();

        // Same node id on both ends, aimed at ourselves: everything the
        // listener hears is self-echo.
        let listener = tokio::spawn(listener_loop(registry.clone(), 7, socket, cancel.clone()));
        let broadcaster = tokio::spawn(broadcast::broadcast_loop(
            catalog,
            7,
            broadcast::bind(0).unwrap(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        listener.await.unwrap().unwrap();
        broadcaster.await.unwrap().unwrap();
    }
}
