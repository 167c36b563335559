//! cairn-services — the shared state layer.
//!
//! Two concurrent indexes live here: the catalog of resources this peer
//! offers, and the registry of what every other peer on the LAN has
//! announced. Each sits behind its own readers–writer lock; nothing ever
//! holds both, so the lock order is trivially acyclic.

pub mod catalog;
pub mod registry;

pub use catalog::{CatalogError, LocalCatalog, ResourceInfo};
pub use registry::{PeerRegistry, PeerView, RemoteResource};
