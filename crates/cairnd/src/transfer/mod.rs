//! Transfer plane — the TCP server that streams byte-ranged resource
//! reads out of the local catalog, and the client that downloads from
//! other peers with automatic resume.

pub mod downloader;
pub mod server;

pub use downloader::{DownloadError, DownloadProgress, Downloader};
pub use server::TransferServer;
