//! cairn wire format — on-wire records for discovery and transfer.
//!
//! These types ARE the protocol. Every integer on the wire is
//! little-endian, regardless of host order, enforced by the zerocopy
//! byteorder types on the fixed record heads and the `_le` accessors on
//! the variable sections.
//!
//! Two records travel between peers:
//!
//!   * the announcement datagram (UDP) — a fixed header followed by one
//!     `{name_length, name, size}` entry per advertised resource;
//!   * the transfer request (TCP) — a self-describing length-prefixed
//!     record naming a resource and a resume offset, answered by a status
//!     byte, the total file size, and the remaining payload bytes.
//!
//! Both sides of the announcement path are untrusted: every variable
//! read is bounds-checked against the datagram, and a malformed datagram
//! is rejected whole.

use bytes::{Buf, BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

type U32Le = U32<LittleEndian>;
type U64Le = U64<LittleEndian>;

// ── Limits ────────────────────────────────────────────────────────────────────

/// Largest UDP payload that fits a single IPv4 datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Maximum resource name length in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// Maximum resource path length in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum size of a single shared resource: 1 GiB.
pub const MAX_RESOURCE_SIZE: u64 = 1024 * 1024 * 1024;

/// Maximum number of entries in the local catalog.
pub const MAX_CATALOG_ENTRIES: usize = 1000;

/// Transfer streaming chunk size.
pub const CHUNK_SIZE: usize = 4096;

// ── Announcement ──────────────────────────────────────────────────────────────

/// Fixed head of an announcement datagram.
///
/// `datagram_length` counts every byte of the datagram including this
/// header; the receiver rejects any datagram whose received length
/// disagrees. `resource_count` entries follow the header back to back.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct AnnounceHeader {
    /// Total datagram length in bytes, header included.
    pub datagram_length: U32Le,
    /// Sender wall clock at send time, nanoseconds since the epoch.
    /// Informational only — receivers must not order peers by it.
    pub timestamp_ns: U64Le,
    /// Operator-assigned node id of the sender, used to drop self-echo.
    pub sender_id: U32Le,
    /// Number of resource entries that follow.
    pub resource_count: U32Le,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(AnnounceHeader, [u8; 20]);

/// Byte length of [`AnnounceHeader`] on the wire.
pub const ANNOUNCE_HEADER_LEN: usize = std::mem::size_of::<AnnounceHeader>();

/// Smallest possible resource entry: empty would still carry two u32s.
const ENTRY_MIN_LEN: usize = 8;

/// One advertised resource inside an announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedResource {
    pub name: String,
    pub size: u64,
}

/// A decoded announcement datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub timestamp_ns: u64,
    pub sender_id: u32,
    pub resources: Vec<AnnouncedResource>,
}

/// Encode an announcement into a single datagram.
///
/// Fails if a name breaks the length rules, a size does not fit the u32
/// wire field, or the total would not fit one datagram.
pub fn encode_announcement(announcement: &Announcement) -> Result<Vec<u8>, WireError> {
    let mut total = ANNOUNCE_HEADER_LEN;
    for resource in &announcement.resources {
        if resource.name.is_empty() {
            return Err(WireError::EmptyName);
        }
        if resource.name.len() > MAX_NAME_LEN {
            return Err(WireError::NameTooLong(resource.name.len()));
        }
        if resource.size > u32::MAX as u64 {
            return Err(WireError::SizeOverflow(resource.size));
        }
        total += ENTRY_MIN_LEN + resource.name.len();
    }
    if total > MAX_DATAGRAM_SIZE {
        return Err(WireError::DatagramTooLarge(total));
    }

    let header = AnnounceHeader {
        datagram_length: U32Le::new(total as u32),
        timestamp_ns: U64Le::new(announcement.timestamp_ns),
        sender_id: U32Le::new(announcement.sender_id),
        resource_count: U32Le::new(announcement.resources.len() as u32),
    };

    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(header.as_bytes());
    for resource in &announcement.resources {
        buf.put_u32_le(resource.name.len() as u32);
        buf.put_slice(resource.name.as_bytes());
        buf.put_u32_le(resource.size as u32);
    }
    Ok(buf.to_vec())
}

/// Decode one announcement datagram.
///
/// `datagram` must be exactly the bytes received — the declared
/// `datagram_length` is checked against it. Any violation rejects the
/// whole datagram; partial decodes are never returned.
pub fn parse_announcement(datagram: &[u8]) -> Result<Announcement, WireError> {
    let header = AnnounceHeader::read_from_prefix(datagram).ok_or(WireError::Truncated)?;
    if header.datagram_length.get() as usize != datagram.len() {
        return Err(WireError::LengthMismatch {
            declared: header.datagram_length.get(),
            actual: datagram.len(),
        });
    }

    let count = header.resource_count.get() as usize;
    let mut rest = &datagram[ANNOUNCE_HEADER_LEN..];
    // Each entry is at least 8 bytes, so a count the buffer cannot hold is
    // rejected before any allocation is sized from it.
    if count > rest.len() / ENTRY_MIN_LEN {
        return Err(WireError::Truncated);
    }

    let mut resources = Vec::with_capacity(count);
    for _ in 0..count {
        if rest.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let name_len = rest.get_u32_le() as usize;
        if name_len == 0 {
            return Err(WireError::EmptyName);
        }
        if name_len > MAX_NAME_LEN {
            return Err(WireError::NameTooLong(name_len));
        }
        if rest.remaining() < name_len + 4 {
            return Err(WireError::Truncated);
        }
        let name = std::str::from_utf8(&rest[..name_len])
            .map_err(|_| WireError::InvalidName)?
            .to_owned();
        rest.advance(name_len);
        let size = rest.get_u32_le() as u64;
        resources.push(AnnouncedResource { name, size });
    }
    if rest.has_remaining() {
        return Err(WireError::TrailingBytes(rest.remaining()));
    }

    Ok(Announcement {
        timestamp_ns: header.timestamp_ns.get(),
        sender_id: header.sender_id.get(),
        resources,
    })
}

// ── Transfer request ──────────────────────────────────────────────────────────

/// Byte length of the fixed part of a transfer request:
/// `message_length` + `name_length` + `offset`.
pub const REQUEST_HEAD_LEN: usize = 4 + 4 + 8;

/// A decoded transfer request: "send me `name`, starting at `offset`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub offset: u64,
    pub name: String,
}

/// Encode a transfer request.
///
/// Layout: `message_length: u32` (whole record, this field included),
/// `name_length: u32`, `offset: u64`, then the name bytes.
pub fn encode_request(offset: u64, name: &str) -> Result<Vec<u8>, WireError> {
    if name.is_empty() {
        return Err(WireError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name.len()));
    }
    let total = REQUEST_HEAD_LEN + name.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32_le(total as u32);
    buf.put_u32_le(name.len() as u32);
    buf.put_u64_le(offset);
    buf.put_slice(name.as_bytes());
    Ok(buf.to_vec())
}

/// Validate a request's leading `message_length` and return the number of
/// bytes that follow it on the stream.
///
/// The record is a parsed data structure with an explicit length field;
/// the allocation for the body is derived from here and nowhere else.
pub fn request_body_len(message_length: u32) -> Result<usize, WireError> {
    let len = message_length as usize;
    if len < REQUEST_HEAD_LEN || len > REQUEST_HEAD_LEN + MAX_NAME_LEN {
        return Err(WireError::BadRequestLength(message_length));
    }
    Ok(len - 4)
}

/// Decode the body of a transfer request (everything after the leading
/// `message_length` field, which the caller has already framed with).
pub fn parse_request(message_length: u32, body: &[u8]) -> Result<ResourceRequest, WireError> {
    if body.len() + 4 != message_length as usize {
        return Err(WireError::LengthMismatch {
            declared: message_length,
            actual: body.len() + 4,
        });
    }
    let mut rest = body;
    if rest.remaining() < REQUEST_HEAD_LEN - 4 {
        return Err(WireError::Truncated);
    }
    let name_len = rest.get_u32_le() as usize;
    let offset = rest.get_u64_le();
    if name_len == 0 {
        return Err(WireError::EmptyName);
    }
    if name_len > MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name_len));
    }
    if name_len != rest.remaining() {
        return Err(WireError::Truncated);
    }
    let name = std::str::from_utf8(rest)
        .map_err(|_| WireError::InvalidName)?
        .to_owned();
    Ok(ResourceRequest { offset, name })
}

// ── Transfer response ─────────────────────────────────────────────────────────

/// Response status: the named resource is not on this peer. Nothing
/// follows; the connection closes.
pub const STATUS_NOT_FOUND: u8 = 0;

/// Response status: found. Followed by `file_size: u64` — the TOTAL size
/// of the resource, not the remaining bytes — and then exactly
/// `file_size - offset` payload bytes.
pub const STATUS_FOUND: u8 = 1;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("record truncated")]
    Truncated,

    #[error("declared length {declared} does not match received length {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("resource name is empty")]
    EmptyName,

    #[error("resource name length {0} exceeds maximum {}", MAX_NAME_LEN)]
    NameTooLong(usize),

    #[error("resource name is not valid UTF-8")]
    InvalidName,

    #[error("resource size {0} does not fit the wire encoding")]
    SizeOverflow(u64),

    #[error("datagram size {0} exceeds maximum {}", MAX_DATAGRAM_SIZE)]
    DatagramTooLarge(usize),

    #[error("{0} trailing bytes after the last resource entry")]
    TrailingBytes(usize),

    #[error("request length {0} is out of range")]
    BadRequestLength(u32),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
