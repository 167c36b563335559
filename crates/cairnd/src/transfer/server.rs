//! TCP transfer server.
//!
//! Accepts stream connections and answers one resource request per
//! connection: parse the length-prefixed request, resolve the name in
//! the local catalog, then stream the file from the requested offset to
//! the end in fixed-size chunks. The server keeps no state between
//! requests; a failed connection affects nobody else.
//!
//! Per-connection state machine:
//! `ReadHeader → ReadBody → Resolve → {NotFound | StreamFile} → Closed`.

use std::io::SeekFrom;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use cairn_core::wire;
use cairn_services::LocalCatalog;

pub struct TransferServer {
    catalog: LocalCatalog,
    listener: TcpListener,
    /// Fault injection: half-close the connection after this many chunks.
    drop_frequency: Option<u64>,
}

impl TransferServer {
    /// Create the listening socket on `(0.0.0.0, port)` with address
    /// reuse and the given backlog. Port 0 picks an ephemeral port;
    /// [`local_addr`](Self::local_addr) reports the result.
    pub fn bind(
        catalog: LocalCatalog,
        port: u16,
        backlog: i32,
        drop_frequency: Option<u64>,
    ) -> Result<Self> {
        let socket =
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).context("socket()")?;
        socket.set_reuse_address(true).context("SO_REUSEADDR")?;
        socket.set_nonblocking(true).context("set_nonblocking")?;
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&addr.into()).context("bind()")?;
        socket.listen(backlog).context("listen()")?;
        let listener = TcpListener::from_std(socket.into())
            .context("failed to register transfer listener")?;
        Ok(Self {
            catalog,
            listener,
            drop_frequency,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("transfer listener has no local address")
    }

    /// Accept connections until cancelled, one handler task each.
    /// Finished handlers are reaped between accepts; on shutdown the
    /// remaining ones are drained before returning.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let mut handlers = JoinSet::new();
        tracing::info!(addr = %self.local_addr()?, "transfer server listening");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = handlers.join_next(), if !handlers.is_empty() => {}
                conn = self.listener.accept() => {
                    let (stream, peer) = match conn {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::info!(%peer, "connection accepted");
                    let catalog = self.catalog.clone();
                    let drop_frequency = self.drop_frequency;
                    handlers.spawn(async move {
                        if let Err(e) = handle_connection(stream, catalog, drop_frequency).await {
                            tracing::warn!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }

        while handlers.join_next().await.is_some() {}
        tracing::info!("transfer server stopped");
        Ok(())
    }
}

/// Serve one connection. Any error path closes the connection without
/// further response; the accept loop and other connections are
/// unaffected.
async fn handle_connection(
    mut stream: TcpStream,
    catalog: LocalCatalog,
    drop_frequency: Option<u64>,
) -> Result<()> {
    // ReadHeader: the leading message_length frames the rest.
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("failed to read request length")?;
    let message_length = u32::from_le_bytes(len_buf);
    let body_len = wire::request_body_len(message_length)?;

    // ReadBody: exactly message_length - 4 more bytes, sized from the
    // length field and nothing else.
    let mut body = vec![0u8; body_len];
    stream
        .read_exact(&mut body)
        .await
        .context("failed to read request body")?;
    let request = wire::parse_request(message_length, &body)?;

    // Resolve.
    let Some(info) = catalog.get(&request.name) else {
        stream
            .write_all(&[wire::STATUS_NOT_FOUND])
            .await
            .context("failed to send not-found status")?;
        tracing::debug!(name = %request.name, "resource not found");
        return Ok(());
    };

    let mut file = tokio::fs::File::open(&info.path)
        .await
        .with_context(|| format!("failed to open resource file {}", info.path.display()))?;
    let file_size = file
        .metadata()
        .await
        .context("failed to stat resource file")?
        .len();
    if request.offset > file_size {
        anyhow::bail!(
            "requested offset {} beyond resource size {}",
            request.offset,
            file_size
        );
    }
    file.seek(SeekFrom::Start(request.offset))
        .await
        .context("failed to seek to requested offset")?;

    // StreamFile: status, total size, then file_size - offset payload
    // bytes in fixed chunks.
    stream
        .write_all(&[wire::STATUS_FOUND])
        .await
        .context("failed to send status")?;
    stream
        .write_all(&file_size.to_le_bytes())
        .await
        .context("failed to send file size")?;

    let mut chunk = [0u8; wire::CHUNK_SIZE];
    let mut sent: u64 = 0;
    let mut chunks: u64 = 0;
    loop {
        let n = file
            .read(&mut chunk)
            .await
            .context("failed to read resource file")?;
        if n == 0 {
            break;
        }
        stream
            .write_all(&chunk[..n])
            .await
            .context("failed to send chunk")?;
        sent += n as u64;
        chunks += 1;

        if let Some(frequency) = drop_frequency {
            if chunks % frequency == 0 {
                let _ = stream.shutdown().await;
                anyhow::bail!("injected connection drop after {sent} bytes");
            }
        }
    }

    tracing::debug!(
        name = %request.name,
        offset = request.offset,
        bytes = sent,
        "transfer complete"
    );
    Ok(())
}
