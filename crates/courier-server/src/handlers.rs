//! Demonstration query handlers served by the host.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use courier_core::{Bus, BusError, HandlerError, HandlerFactory, Repository, Subscriber};
use courier_proto::Value;

/// Liveness query stream.
pub const PING_STREAM: &str = "courier.query.diagnostics.Ping";

/// Echo query stream.
pub const ECHO_STREAM: &str = "courier.query.diagnostics.Echo";

/// Registers the demonstration handlers on the factory and their streams on
/// the bus.
pub fn register(bus: &Bus, factory: &HandlerFactory) {
    factory.register_handler(PING_STREAM, ping_constructor);
    factory.register_handler(ECHO_STREAM, echo_constructor);
    bus.register(PING_STREAM);
    bus.register(ECHO_STREAM);
}

/// Replies `{"pong": true}` to any payload.
struct PingQuery;

#[async_trait]
impl Subscriber for PingQuery {
    async fn handle(&self, _cancel: CancellationToken) -> Result<Option<Value>, HandlerError> {
        Ok(Some(Value::Map(vec![(
            Value::Text("pong".to_owned()),
            Value::Bool(true),
        )])))
    }
}

fn ping_constructor(
    _payload: &[u8],
    _repository: Option<Arc<dyn Repository>>,
) -> Result<Box<dyn Subscriber>, BusError> {
    Ok(Box::new(PingQuery))
}

#[derive(Debug, Deserialize)]
struct EchoProperties {
    text: String,
}

/// Returns the request's `text` property back to the caller.
struct EchoQuery {
    text: String,
}

#[async_trait]
impl Subscriber for EchoQuery {
    async fn handle(&self, _cancel: CancellationToken) -> Result<Option<Value>, HandlerError> {
        Ok(Some(Value::Map(vec![(
            Value::Text("text".to_owned()),
            Value::Text(self.text.clone()),
        )])))
    }
}

fn echo_constructor(
    payload: &[u8],
    _repository: Option<Arc<dyn Repository>>,
) -> Result<Box<dyn Subscriber>, BusError> {
    let properties: EchoProperties =
        ciborium::from_reader(payload).map_err(|e| BusError::Construction(e.to_string()))?;
    Ok(Box::new(EchoQuery {
        text: properties.text,
    }))
}
