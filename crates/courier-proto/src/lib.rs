//! Wire envelope for the Courier message bus.
//!
//! Requests and replies share one self-describing binary representation
//! (CBOR). A request envelope is a map with single-letter keys fixed by the
//! peer implementation:
//!
//! | Key | Field | Notes |
//! |-----|-------|-------|
//! | `c` | created timestamp | fractional Unix seconds |
//! | `i` | request id | 32 lower-hex characters |
//! | `m` | message blob | empty CBOR map when unused |
//! | `p` | properties | handler payload, opaque bytes |
//! | `r` | return result | 1 when the caller awaits a reply |
//! | `t` | timeout | seconds |
//!
//! A reply is always a single CBOR map with `req_id` plus either a nested
//! `result` value or an `error` / `error_class` pair.

mod envelope;
mod error;

pub use ciborium::Value;
pub use envelope::{encode_result, TransportRequest, TransportResponse, EMPTY_CBOR_MAP};
pub use error::ProtocolError;
