//! Bus core: dispatch, per-stream consumers and response routing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use courier_proto::{
    ProtocolError, TransportRequest, TransportResponse, Value, EMPTY_CBOR_MAP,
};

use crate::broker::{StreamBroker, StreamEntry};
use crate::error::{BusError, HandlerError};
use crate::factory::HandlerFactory;
use crate::serialiser::{BrokerSerialiser, FlatFieldSerialiser};
use crate::DEFAULT_TIMEOUT_SECS;

/// Reserved suffix for per-stream response channels.
///
/// The implemented protocol delivers replies on a list keyed by the request
/// id; the suffix is kept for wire compatibility with the peer.
pub const RESPONSE_STREAM_SUFFIX: &str = ":responses";

/// Cursor meaning "entries appended from now on".
const NEW_ENTRIES_CURSOR: &str = "$";

/// Wall-clock limit for one reply pipeline.
const REPLY_PIPELINE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an unread reply survives under its request-id key.
const REPLY_TTL: Duration = Duration::from_secs(30);

/// How long reply delivery waits for a local waiter to accept it.
const WAITER_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Message producer: names its stream and serialises its own payload.
pub trait Publisher: Send + Sync {
    /// Stream the message is dispatched on.
    fn stream(&self) -> &str;

    /// Payload bytes in the binary object representation.
    fn serialise(&self) -> Result<Vec<u8>, ProtocolError>;
}

/// Message consumer, instantiated per envelope by the handler factory.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Runs the handler.
    ///
    /// `Ok(None)` suppresses the reply entirely. The token is detached from
    /// both the caller's context and the bus lifecycle: a caller abandoning
    /// its wait does not abort server-side work.
    async fn handle(&self, cancel: CancellationToken) -> Result<Option<Value>, HandlerError>;
}

impl std::fmt::Debug for dyn Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Subscriber")
    }
}

/// Request/response message bus over a log-structured streaming store.
///
/// One consumer task per registered stream reads envelopes in arrival order
/// and runs handlers sequentially; different streams run concurrently.
/// Replies travel on a list keyed by the request id, with a same-process
/// shortcut through the waiter registry.
pub struct Bus {
    shared: Arc<Shared>,
    consumers: TaskTracker,
}

struct Shared {
    broker: Arc<dyn StreamBroker>,
    serialiser: RwLock<Arc<dyn BrokerSerialiser>>,
    factory: RwLock<Option<Arc<HandlerFactory>>>,
    streams: RwLock<BTreeSet<String>>,
    waiters: RwLock<HashMap<String, mpsc::Sender<TransportResponse>>>,
    cancel: CancellationToken,
}

impl Bus {
    /// Creates a bus over the given broker with the flat-field serialiser.
    #[must_use]
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self {
            shared: Arc::new(Shared {
                broker,
                serialiser: RwLock::new(Arc::new(FlatFieldSerialiser)),
                factory: RwLock::new(None),
                streams: RwLock::new(BTreeSet::new()),
                waiters: RwLock::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
            consumers: TaskTracker::new(),
        }
    }

    /// Swaps the broker serialisation strategy.
    pub fn set_serialiser(&self, serialiser: Arc<dyn BrokerSerialiser>) {
        *self
            .shared
            .serialiser
            .write()
            .expect("serialiser lock poisoned") = serialiser;
    }

    /// Installs the handler factory consulted by consumer tasks.
    pub fn set_factory(&self, factory: Arc<HandlerFactory>) {
        *self.shared.factory.write().expect("factory slot poisoned") = Some(factory);
    }

    /// Records a stream for consumption.
    ///
    /// The constructor itself lives in the factory; the bus only needs the
    /// set of stream names.
    pub fn register(&self, stream: impl Into<String>) {
        let stream = stream.into();
        info!(stream = %stream, "registered stream");
        self.shared
            .streams
            .write()
            .expect("stream registry poisoned")
            .insert(stream);
    }

    /// Dispatches a request and waits for its correlated reply.
    ///
    /// Fails when `ctx` is cancelled or no reply arrives within the default
    /// window. The remote handler keeps running either way; an unread reply
    /// expires with its key.
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        publisher: &dyn Publisher,
    ) -> Result<TransportResponse, BusError> {
        let shared = self.shared.as_ref();
        let stream = publisher.stream();
        let request = build_request(publisher.serialise()?, 1);
        let request_id = request.request_id.clone();
        let fields = shared.serialiser().serialise(&request)?;

        let (sender, mut receiver) = mpsc::channel(1);
        shared
            .waiters
            .write()
            .expect("waiter registry poisoned")
            .insert(request_id.clone(), sender);
        let _guard = WaiterGuard {
            shared,
            request_id: request_id.clone(),
        };

        let entry_id = tokio::select! {
            appended = shared.broker.xadd(stream, &fields) => {
                appended.map_err(BusError::Append)?
            }
            () = ctx.cancelled() => return Err(BusError::Cancelled),
        };
        debug!(
            stream = %stream,
            entry_id = %entry_id,
            request_id = %request_id,
            "request dispatched"
        );

        tokio::select! {
            response = receiver.recv() => match response {
                Some(response) => Ok(response),
                // Sender dropped without delivering; only possible when the
                // registry entry is gone, so treat it as a cancelled wait.
                None => Err(BusError::Cancelled),
            },
            () = ctx.cancelled() => Err(BusError::Cancelled),
            () = tokio::time::sleep(Duration::from_secs(DEFAULT_TIMEOUT_SECS)) => {
                Err(BusError::ResponseTimeout { request_id })
            }
        }
    }

    /// Dispatches a fire-and-forget message.
    ///
    /// No waiter is registered and no reply is ever read.
    pub async fn emit(
        &self,
        ctx: &CancellationToken,
        publisher: &dyn Publisher,
    ) -> Result<(), BusError> {
        let shared = self.shared.as_ref();
        let stream = publisher.stream();
        let request = build_request(publisher.serialise()?, 0);
        let fields = shared.serialiser().serialise(&request)?;

        let entry_id = tokio::select! {
            appended = shared.broker.xadd(stream, &fields) => {
                appended.map_err(BusError::Append)?
            }
            () = ctx.cancelled() => return Err(BusError::Cancelled),
        };
        debug!(
            stream = %stream,
            entry_id = %entry_id,
            request_id = %request.request_id,
            "message emitted"
        );
        Ok(())
    }

    /// Starts one consumer task per registered stream.
    ///
    /// A bus with no registered streams is a logged no-op.
    pub fn run(&self) {
        let streams: Vec<String> = {
            let streams = self
                .shared
                .streams
                .read()
                .expect("stream registry poisoned");
            streams.iter().cloned().collect()
        };
        if streams.is_empty() {
            warn!("no streams registered, nothing to run");
            return;
        }

        info!(streams = streams.len(), "starting stream consumers");
        for stream in streams {
            let shared = Arc::clone(&self.shared);
            self.consumers.spawn(shared.consume_stream(stream));
        }
    }

    /// Stops all consumer tasks and waits for them to drain.
    ///
    /// In-flight `handle` calls are not pre-empted; a consumer observes the
    /// cancellation at its next blocking read.
    pub async fn stop(&self) {
        info!("stopping bus");
        self.shared.cancel.cancel();
        self.consumers.close();
        self.consumers.wait().await;
        info!("bus stopped");
    }
}

impl Shared {
    fn serialiser(&self) -> Arc<dyn BrokerSerialiser> {
        self.serialiser
            .read()
            .expect("serialiser lock poisoned")
            .clone()
    }

    async fn consume_stream(self: Arc<Self>, stream: String) {
        let mut last_id = NEW_ENTRIES_CURSOR.to_owned();
        loop {
            let entries = tokio::select! {
                () = self.cancel.cancelled() => break,
                read = self.broker.xread(&stream, &last_id, 1) => match read {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!(stream = %stream, error = %e, "stream read failed");
                        continue;
                    }
                },
            };

            for entry in entries {
                // Advance past everything actually read; an entry that fails
                // to decode is logged and left in place, not replayed.
                last_id.clone_from(&entry.id);
                let entry_id = entry.id.clone();

                let request = match self.decode_entry(entry) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(
                            stream = %stream,
                            entry_id = %entry_id,
                            error = %e,
                            "failed to decode envelope"
                        );
                        continue;
                    }
                };

                let handler = match self.create_handler(&stream, &request) {
                    Ok(handler) => handler,
                    Err(e) => {
                        warn!(
                            stream = %stream,
                            request_id = %request.request_id,
                            error = %e,
                            "failed to create handler"
                        );
                        continue;
                    }
                };

                let outcome = handler.handle(CancellationToken::new()).await;
                self.dispatch_response(&stream, &request, outcome).await;
            }
        }
        debug!(stream = %stream, "stream consumer stopped");
    }

    /// Rebuilds an envelope from a stream entry.
    ///
    /// The blob dialect (single `data` field) is tried first, then the flat
    /// dialect through the configured serialiser. The broker-assigned entry
    /// id is stamped either way.
    fn decode_entry(&self, entry: StreamEntry) -> Result<TransportRequest, BusError> {
        let mut request = match entry.fields.get("data") {
            Some(blob) => TransportRequest::decode(blob)?,
            None => self.serialiser().deserialise(&entry.fields)?,
        };
        request.entry_id = entry.id;
        Ok(request)
    }

    fn create_handler(
        &self,
        stream: &str,
        request: &TransportRequest,
    ) -> Result<Box<dyn Subscriber>, BusError> {
        let factory = self.factory.read().expect("factory slot poisoned").clone();
        let Some(factory) = factory else {
            return Err(BusError::MissingConstructor(stream.to_owned()));
        };
        factory.create_handler(stream, &request.properties)
    }

    async fn dispatch_response(
        &self,
        stream: &str,
        request: &TransportRequest,
        outcome: Result<Option<Value>, HandlerError>,
    ) {
        if !request.needs_response() {
            return;
        }
        let response = match outcome {
            // Nothing to say: no reply key, no deletion.
            Ok(None) => return,
            Ok(Some(value)) => TransportResponse::success(request.request_id.clone(), value),
            Err(e) => TransportResponse::failure(request.request_id.clone(), e.class, e.message),
        };
        self.send_response(stream, &request.entry_id, response)
            .await;
    }

    /// Publishes a reply: one pipeline pushing the blob under the request-id
    /// key with a bounded TTL and deleting the consumed entry, then an
    /// optional hand-off to a same-process waiter.
    async fn send_response(&self, stream: &str, entry_id: &str, response: TransportResponse) {
        let request_id = response.req_id.clone();
        let payload = match response.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(request_id = %request_id, error = %e, "failed to encode reply");
                return;
            }
        };

        let delivery = self
            .broker
            .deliver_reply(stream, entry_id, &request_id, &payload, REPLY_TTL);
        match timeout(REPLY_PIPELINE_TIMEOUT, delivery).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(request_id = %request_id, error = %e, "failed to deliver reply");
            }
            Err(_) => warn!(request_id = %request_id, "reply delivery timed out"),
        }

        let waiter = {
            let waiters = self.waiters.read().expect("waiter registry poisoned");
            waiters.get(&request_id).cloned()
        };
        if let Some(waiter) = waiter {
            match waiter.send_timeout(response, WAITER_SEND_TIMEOUT).await {
                Ok(()) => debug!(request_id = %request_id, "reply handed to local waiter"),
                Err(_) => warn!(request_id = %request_id, "local waiter did not accept reply"),
            }
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").finish_non_exhaustive()
    }
}

/// Removes the waiter entry, and with it the send side of the channel, when
/// the wait ends for any reason.
///
/// Removal happens under the registry write lock, so a delivery can never
/// observe a closed-but-still-registered channel.
struct WaiterGuard<'a> {
    shared: &'a Shared,
    request_id: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.shared
            .waiters
            .write()
            .expect("waiter registry poisoned")
            .remove(&self.request_id);
    }
}

fn build_request(payload: Vec<u8>, return_result: u8) -> TransportRequest {
    TransportRequest {
        created_timestamp: unix_timestamp(),
        request_id: fresh_request_id(),
        message: EMPTY_CBOR_MAP.to_vec(),
        properties: payload,
        return_result,
        timeout: DEFAULT_TIMEOUT_SECS,
        entry_id: String::new(),
    }
}

/// 16 random bytes, hex-encoded to 32 characters.
fn fresh_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
