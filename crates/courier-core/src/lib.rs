//! Request/response message bus over a log-structured streaming store.
//!
//! Callers dispatch CBOR-encoded commands and queries onto named streams
//! (`domain.query.module.Name`); one consumer task per stream decodes the
//! envelope, runs the registered handler and pushes the correlated reply
//! onto a list keyed by the request id. Same-process callers receive the
//! reply through a waiter channel without a broker round-trip.
//!
//! The broker surface is the [`StreamBroker`] trait; [`ValkeyBroker`] backs
//! it with a Valkey/Redis pool and [`MemoryBroker`] keeps everything
//! in-process for tests and local development.

mod broker;
mod bus;
mod error;
mod factory;
mod serialiser;

pub use broker::{BrokerError, MemoryBroker, RecordedReply, StreamBroker, StreamEntry, ValkeyBroker};
pub use bus::{Bus, Publisher, Subscriber, RESPONSE_STREAM_SUFFIX};
pub use error::{BusError, HandlerError};
pub use factory::{HandlerConstructor, HandlerFactory, Repository};
pub use serialiser::{BrokerSerialiser, FlatFieldSerialiser};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
