//! Announcement plane — periodic UDP broadcast of the local catalog, the
//! listener that builds the peer registry from other peers' broadcasts,
//! and the reaper that evicts peers gone silent.

pub mod broadcast;
pub mod listener;
