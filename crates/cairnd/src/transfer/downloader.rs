//! Resource download client.
//!
//! Connects to a peer's transfer server, requests a resource from an
//! offset, and streams the response into the download directory. A
//! transfer that ends early — the server dropped the connection, a read
//! deadline passed — is retried from the highest byte received, up to a
//! bounded number of attempts; whatever progress was made is returned to
//! the caller either way.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

use cairn_core::wire::{self, WireError};

/// Snapshot handed to the progress callback after each received chunk.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub resource: String,
    pub received: u64,
    pub total: u64,
    pub percent: u8,
    /// Throughput of the current attempt, in MiB/s.
    pub speed_mbps: f64,
    pub completed: bool,
}

type ProgressCallback = Box<dyn Fn(&DownloadProgress) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("failed to connect: {0}")]
    Connect(std::io::Error),

    #[error("failed to send request: {0}")]
    SendRequest(std::io::Error),

    #[error("transfer failed: {0}")]
    Transfer(std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to open {path}: {source}")]
    OpenOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed response: {0}")]
    Protocol(&'static str),

    #[error(transparent)]
    BadRequest(#[from] WireError),
}

impl DownloadError {
    /// Only failures during data transfer feed the retry loop. Resolve
    /// and connect failures happen before the transfer starts and abort
    /// the download immediately.
    fn is_recoverable(&self) -> bool {
        matches!(self, DownloadError::Transfer(_) | DownloadError::Timeout(_))
    }
}

/// What one connection attempt achieved.
enum Attempt {
    /// The server answered `status = 0`. Never retried.
    NotFound,
    /// Bytes flowed; `received == total` means the transfer is complete,
    /// anything less means the stream ended early.
    Progress { received: u64, total: u64 },
}

pub struct Downloader {
    download_dir: PathBuf,
    socket_timeout: Duration,
    max_retries: u32,
    progress: Option<ProgressCallback>,
}

impl Downloader {
    pub fn new(download_dir: impl Into<PathBuf>, socket_timeout: Duration, max_retries: u32) -> Self {
        Self {
            download_dir: download_dir.into(),
            socket_timeout,
            max_retries,
            progress: None,
        }
    }

    /// Install a progress callback, invoked whenever the integer
    /// percentage advances.
    pub fn with_progress(mut self, callback: impl Fn(&DownloadProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Download `name` from the peer's transfer server, starting at
    /// `offset`, into `download_dir / name`.
    ///
    /// Returns `(received, total)`:
    ///   * `(0, 0)` — the server does not have the resource;
    ///   * `received == total` — complete;
    ///   * `received < total` — every attempt ended early; the caller may
    ///     call again with `offset = received`.
    ///
    /// Failures before the payload starts flowing — resolve, connect,
    /// sending the request, opening the output file — are errors, never
    /// one of the pairs above.
    pub async fn download(
        &self,
        host: &str,
        port: u16,
        offset: u64,
        name: &str,
    ) -> Result<(u64, u64), DownloadError> {
        let mut received = offset;
        let mut total = 0u64;
        let mut reached_payload = false;
        let max_attempts = self.max_retries.max(1);

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tracing::info!(attempt, offset = received, name, "retrying download");
            }
            match self.attempt(host, port, received, name).await {
                Ok(Attempt::NotFound) => {
                    tracing::info!(name, "peer does not have the resource");
                    return Ok((0, 0));
                }
                Ok(Attempt::Progress {
                    received: now_received,
                    total: now_total,
                }) => {
                    received = now_received;
                    total = now_total;
                    reached_payload = true;
                    if received == total {
                        tracing::info!(name, bytes = total, "download complete");
                        return Ok((received, total));
                    }
                    tracing::warn!(name, received, total, "transfer ended early");
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(name, attempt, error = %e, "download attempt failed");
                    // Exhausting retries without ever reaching the payload
                    // must not fabricate a (received, 0) pair.
                    if attempt == max_attempts && !reached_payload {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok((received, total))
    }

    /// One connection: resolve, connect, request, stream to disk.
    async fn attempt(
        &self,
        host: &str,
        port: u16,
        offset: u64,
        name: &str,
    ) -> Result<Attempt, DownloadError> {
        // Resolution is per attempt — a peer that moved between retries
        // is picked up at its new address.
        let addr = lookup_host((host, port))
            .await
            .map_err(|source| DownloadError::Resolve {
                host: host.to_owned(),
                port,
                source,
            })?
            .next()
            .ok_or_else(|| DownloadError::Resolve {
                host: host.to_owned(),
                port,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
            })?;

        // A connect or request-send failure aborts the download; their
        // deadlines map to the fatal variants, not the retryable Timeout.
        let mut stream = match timeout(self.socket_timeout, TcpStream::connect(addr)).await {
            Ok(connected) => connected.map_err(DownloadError::Connect)?,
            Err(_) => {
                return Err(DownloadError::Connect(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )))
            }
        };

        let request = wire::encode_request(offset, name)?;
        match timeout(self.socket_timeout, stream.write_all(&request)).await {
            Ok(sent) => sent.map_err(DownloadError::SendRequest)?,
            Err(_) => {
                return Err(DownloadError::SendRequest(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "request send timed out",
                )))
            }
        }

        let mut status = [0u8; 1];
        self.deadline(stream.read_exact(&mut status))
            .await?
            .map_err(DownloadError::Transfer)?;
        match status[0] {
            wire::STATUS_NOT_FOUND => return Ok(Attempt::NotFound),
            wire::STATUS_FOUND => {}
            _ => return Err(DownloadError::Protocol("unknown status byte")),
        }

        let mut size_buf = [0u8; 8];
        self.deadline(stream.read_exact(&mut size_buf))
            .await?
            .map_err(DownloadError::Transfer)?;
        let file_size = u64::from_le_bytes(size_buf);
        if offset > file_size {
            return Err(DownloadError::Protocol("offset beyond resource size"));
        }

        let path = self.download_dir.join(name);
        let mut file = self.open_output(&path, offset).await?;

        // The payload is file_size - offset bytes: the response carries
        // the TOTAL size, not the remaining byte count.
        let started = std::time::Instant::now();
        let mut received = offset;
        let mut last_percent: Option<u8> = None;
        let mut chunk = [0u8; wire::CHUNK_SIZE];
        while received < file_size {
            let want = std::cmp::min(chunk.len() as u64, file_size - received) as usize;
            let n = match self.deadline(stream.read(&mut chunk[..want])).await {
                Ok(Ok(n)) => n,
                // Mid-payload failures are progress, not errors: the
                // retry loop resumes from what already hit the disk.
                Ok(Err(e)) => {
                    tracing::warn!(name, received, error = %e, "stream failed mid-transfer");
                    break;
                }
                Err(e) => {
                    tracing::warn!(name, received, error = %e, "stream stalled mid-transfer");
                    break;
                }
            };
            if n == 0 {
                break;
            }
            file.write_all(&chunk[..n])
                .await
                .map_err(|source| DownloadError::WriteOutput {
                    path: path.clone(),
                    source,
                })?;
            received += n as u64;

            let percent = ((received * 100) / file_size.max(1)) as u8;
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                tracing::debug!(name, received, total = file_size, percent, "downloading");
                if let Some(callback) = &self.progress {
                    let secs = started.elapsed().as_secs_f64();
                    let speed_mbps = if secs > 0.0 {
                        (received - offset) as f64 / (1024.0 * 1024.0) / secs
                    } else {
                        0.0
                    };
                    callback(&DownloadProgress {
                        resource: name.to_owned(),
                        received,
                        total: file_size,
                        percent,
                        speed_mbps,
                        completed: received == file_size,
                    });
                }
            }
        }

        file.flush()
            .await
            .map_err(|source| DownloadError::WriteOutput {
                path: path.clone(),
                source,
            })?;
        Ok(Attempt::Progress {
            received,
            total: file_size,
        })
    }

    /// Open the output file: truncate for a fresh download, append when
    /// resuming (the file already holds the first `offset` bytes).
    async fn open_output(
        &self,
        path: &Path,
        offset: u64,
    ) -> Result<tokio::fs::File, DownloadError> {
        let mut options = tokio::fs::OpenOptions::new();
        if offset > 0 {
            options.append(true);
        } else {
            options.write(true).create(true).truncate(true);
        }
        options
            .open(path)
            .await
            .map_err(|source| DownloadError::OpenOutput {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn deadline<F, T>(&self, future: F) -> Result<T, DownloadError>
    where
        F: std::future::Future<Output = T>,
    {
        timeout(self.socket_timeout, future)
            .await
            .map_err(|_| DownloadError::Timeout(self.socket_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::server::TransferServer;
    use cairn_services::LocalCatalog;
    use std::io::Write;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cairn-dl-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    async fn start_server(
        served: &[(&str, &[u8])],
        drop_frequency: Option<u64>,
        dir: &Path,
    ) -> (SocketAddr, CancellationToken) {
        let catalog = LocalCatalog::new();
        for (name, contents) in served {
            let path = dir.join(name);
            std::fs::File::create(&path).unwrap().write_all(contents).unwrap();
            catalog.add(name, &path).unwrap();
        }
        let server = TransferServer::bind(catalog, 0, 10, drop_frequency).unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));
        (addr, cancel)
    }

    #[tokio::test]
    async fn full_download_is_byte_identical() {
        let serve_dir = scratch_dir("full-src");
        let download_dir = scratch_dir("full-dst");
        let contents = patterned(133 * 1024);
        let (addr, cancel) = start_server(&[("f", &contents)], None, &serve_dir).await;

        let downloader = Downloader::new(&download_dir, Duration::from_secs(5), 5);
        let (received, total) = downloader
            .download("127.0.0.1", addr.port(), 0, "f")
            .await
            .unwrap();

        assert_eq!((received, total), (136_192, 136_192));
        assert_eq!(std::fs::read(download_dir.join("f")).unwrap(), contents);
        cancel.cancel();
    }

    #[tokio::test]
    async fn missing_resource_returns_zero_pair_and_writes_nothing() {
        let serve_dir = scratch_dir("missing-src");
        let download_dir = scratch_dir("missing-dst");
        let (addr, cancel) = start_server(&[], None, &serve_dir).await;

        let downloader = Downloader::new(&download_dir, Duration::from_secs(5), 5);
        let (received, total) = downloader
            .download("127.0.0.1", addr.port(), 0, "absent")
            .await
            .unwrap();

        assert_eq!((received, total), (0, 0));
        assert!(!download_dir.join("absent").exists());
        cancel.cancel();
    }

    #[tokio::test]
    async fn retries_resume_from_the_highest_received_byte() {
        let serve_dir = scratch_dir("resume-src");
        let download_dir = scratch_dir("resume-dst");
        // 16 chunks, dropped after every 5: completes on the 4th attempt.
        let contents = patterned(wire::CHUNK_SIZE * 16);
        let (addr, cancel) = start_server(&[("big", &contents)], Some(5), &serve_dir).await;

        let downloader = Downloader::new(&download_dir, Duration::from_secs(5), 5);
        let (received, total) = downloader
            .download("127.0.0.1", addr.port(), 0, "big")
            .await
            .unwrap();

        assert_eq!((received, total), (contents.len() as u64, contents.len() as u64));
        assert_eq!(std::fs::read(download_dir.join("big")).unwrap(), contents);
        cancel.cancel();
    }

    #[tokio::test]
    async fn single_attempt_surfaces_the_partial_and_a_second_call_resumes() {
        let serve_dir = scratch_dir("partial-src");
        let download_dir = scratch_dir("partial-dst");
        let contents = patterned(wire::CHUNK_SIZE * 12);
        let (addr, cancel) = start_server(&[("f", &contents)], Some(5), &serve_dir).await;

        let downloader = Downloader::new(&download_dir, Duration::from_secs(5), 1);
        let total = contents.len() as u64;
        let (first, declared) = downloader
            .download("127.0.0.1", addr.port(), 0, "f")
            .await
            .unwrap();
        assert_eq!(declared, total);
        assert!(first > 0 && first < total, "expected a partial, got {first}");

        // Resume where the first call stopped; repeat until complete.
        let mut received = first;
        let mut calls = 0;
        while received < total {
            calls += 1;
            assert!(calls <= 5, "resume did not converge");
            let (now, _) = downloader
                .download("127.0.0.1", addr.port(), received, "f")
                .await
                .unwrap();
            assert!(now >= received);
            received = now;
        }
        assert_eq!(std::fs::read(download_dir.join("f")).unwrap(), contents);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_error_not_a_result_pair() {
        let download_dir = scratch_dir("noserver-dst");
        // Bind-then-drop: nothing listens on this port afterwards.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let downloader = Downloader::new(&download_dir, Duration::from_millis(500), 2);

        // A fresh download must not report the not-found pair for a peer
        // it never reached.
        let fresh = downloader.download("127.0.0.1", port, 0, "f").await;
        assert!(matches!(fresh, Err(DownloadError::Connect(_))), "{fresh:?}");

        // A resumed call must not echo the caller's offset back as a
        // bogus (offset, 0) pair either.
        let resumed = downloader.download("127.0.0.1", port, 500, "f").await;
        assert!(matches!(resumed, Err(DownloadError::Connect(_))), "{resumed:?}");

        assert!(!download_dir.join("f").exists());
    }

    #[tokio::test]
    async fn progress_percentages_are_monotonic() {
        let serve_dir = scratch_dir("progress-src");
        let download_dir = scratch_dir("progress-dst");
        let contents = patterned(wire::CHUNK_SIZE * 8);
        let (addr, cancel) = start_server(&[("f", &contents)], None, &serve_dir).await;

        let high_water = Arc::new(AtomicU64::new(0));
        let watermark = high_water.clone();
        let downloader = Downloader::new(&download_dir, Duration::from_secs(5), 5)
            .with_progress(move |progress| {
                let previous = watermark.swap(progress.percent as u64, Ordering::SeqCst);
                assert!(progress.percent as u64 >= previous, "progress went backwards");
            });

        downloader
            .download("127.0.0.1", addr.port(), 0, "f")
            .await
            .unwrap();
        assert_eq!(high_water.load(Ordering::SeqCst), 100);
        cancel.cancel();
    }
}
