//! cairnd — the cairn peer daemon, as a library.
//!
//! The binary in `main.rs` wires these pieces together; they are exposed
//! here so an embedding UI (and the tests) can drive the same surface:
//! the announcement plane in [`announce`] and the transfer plane in
//! [`transfer`].

pub mod announce;
pub mod transfer;
