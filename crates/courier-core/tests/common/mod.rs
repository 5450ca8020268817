//! Shared fixtures for the bus integration suite.

// Each integration binary uses a different slice of these fixtures.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use courier_core::{
    Bus, BusError, HandlerError, HandlerFactory, MemoryBroker, Publisher, Repository, StreamBroker,
    Subscriber,
};
use courier_proto::{ProtocolError, Value, EMPTY_CBOR_MAP};

/// A bus wired to a fresh in-memory broker and an empty factory.
pub struct TestBus {
    pub bus: Arc<Bus>,
    pub broker: Arc<MemoryBroker>,
    pub factory: Arc<HandlerFactory>,
}

pub fn test_bus() -> TestBus {
    let broker = Arc::new(MemoryBroker::new());
    let bus = Arc::new(Bus::new(Arc::clone(&broker) as Arc<dyn StreamBroker>));
    let factory = Arc::new(HandlerFactory::new());
    bus.set_factory(Arc::clone(&factory));
    TestBus {
        bus,
        broker,
        factory,
    }
}

/// Gives freshly spawned consumers time to park in their first read.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Polls until a reply shows up under `key` or the deadline passes.
pub async fn wait_for_reply(
    broker: &MemoryBroker,
    key: &str,
) -> Option<courier_core::RecordedReply> {
    for _ in 0..100 {
        let replies = broker.replies(key);
        if let Some(reply) = replies.into_iter().next() {
            return Some(reply);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// Publisher sending the empty CBOR map to a fixed stream.
pub struct EmptyPayload {
    stream: String,
}

impl EmptyPayload {
    pub fn new(stream: &str) -> Self {
        Self {
            stream: stream.to_owned(),
        }
    }
}

impl Publisher for EmptyPayload {
    fn stream(&self) -> &str {
        &self.stream
    }

    fn serialise(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(EMPTY_CBOR_MAP.to_vec())
    }
}

/// Publisher sending a CBOR text label to a fixed stream.
pub struct LabelledPayload {
    stream: String,
    label: String,
}

impl LabelledPayload {
    pub fn new(stream: &str, label: &str) -> Self {
        Self {
            stream: stream.to_owned(),
            label: label.to_owned(),
        }
    }
}

impl Publisher for LabelledPayload {
    fn stream(&self) -> &str {
        &self.stream
    }

    fn serialise(&self) -> Result<Vec<u8>, ProtocolError> {
        courier_proto::encode_result(&Value::Text(self.label.clone()))
    }
}

/// Handler replying `{"pong": true}`.
pub struct Pong;

#[async_trait]
impl Subscriber for Pong {
    async fn handle(&self, _cancel: CancellationToken) -> Result<Option<Value>, HandlerError> {
        Ok(Some(Value::Map(vec![(
            Value::Text("pong".to_owned()),
            Value::Bool(true),
        )])))
    }
}

pub fn pong_constructor(
    _payload: &[u8],
    _repository: Option<Arc<dyn Repository>>,
) -> Result<Box<dyn Subscriber>, BusError> {
    Ok(Box::new(Pong))
}

/// Handler failing with a fixed typed error.
pub struct Boom;

#[async_trait]
impl Subscriber for Boom {
    async fn handle(&self, _cancel: CancellationToken) -> Result<Option<Value>, HandlerError> {
        Err(HandlerError::new("HandlerError", "boom"))
    }
}

pub fn boom_constructor(
    _payload: &[u8],
    _repository: Option<Arc<dyn Repository>>,
) -> Result<Box<dyn Subscriber>, BusError> {
    Ok(Box::new(Boom))
}

/// Handler returning neither result nor error.
pub struct Silent;

#[async_trait]
impl Subscriber for Silent {
    async fn handle(&self, _cancel: CancellationToken) -> Result<Option<Value>, HandlerError> {
        Ok(None)
    }
}

pub fn silent_constructor(
    _payload: &[u8],
    _repository: Option<Arc<dyn Repository>>,
) -> Result<Box<dyn Subscriber>, BusError> {
    Ok(Box::new(Silent))
}

/// Counts invocations across handler instances.
#[derive(Default)]
pub struct InvocationCounter {
    count: AtomicUsize,
}

impl InvocationCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Polls until the counter reaches `expected` or the deadline passes.
    pub async fn wait_for(&self, expected: usize) -> bool {
        for _ in 0..100 {
            if self.count() >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub struct Counting {
    counter: Arc<InvocationCounter>,
}

#[async_trait]
impl Subscriber for Counting {
    async fn handle(&self, _cancel: CancellationToken) -> Result<Option<Value>, HandlerError> {
        self.counter.count.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Value::Bool(true)))
    }
}

pub fn counting_constructor(
    counter: Arc<InvocationCounter>,
) -> impl Fn(&[u8], Option<Arc<dyn Repository>>) -> Result<Box<dyn Subscriber>, BusError> {
    move |_payload, _repository| {
        Ok(Box::new(Counting {
            counter: Arc::clone(&counter),
        }))
    }
}

/// Records handler execution order and whether any two executions
/// overlapped in time.
#[derive(Default)]
pub struct SequenceProbe {
    active: AtomicUsize,
    overlapped: AtomicBool,
    order: Mutex<Vec<String>>,
}

impl SequenceProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().expect("probe lock poisoned").clone()
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    /// Polls until `expected` executions completed or the deadline passes.
    pub async fn wait_for(&self, expected: usize) -> bool {
        for _ in 0..200 {
            if self.order().len() >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub struct Sequenced {
    label: String,
    probe: Arc<SequenceProbe>,
}

#[async_trait]
impl Subscriber for Sequenced {
    async fn handle(&self, _cancel: CancellationToken) -> Result<Option<Value>, HandlerError> {
        if self.probe.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.probe.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.probe
            .order
            .lock()
            .expect("probe lock poisoned")
            .push(self.label.clone());
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        Ok(None)
    }
}

pub fn sequenced_constructor(
    probe: Arc<SequenceProbe>,
) -> impl Fn(&[u8], Option<Arc<dyn Repository>>) -> Result<Box<dyn Subscriber>, BusError> {
    move |payload, _repository| {
        let label = match ciborium_text(payload) {
            Some(label) => label,
            None => return Err(BusError::Construction("payload is not a text label".to_owned())),
        };
        Ok(Box::new(Sequenced {
            label,
            probe: Arc::clone(&probe),
        }))
    }
}

fn ciborium_text(payload: &[u8]) -> Option<String> {
    match ciborium::from_reader(payload).ok()? {
        Value::Text(label) => Some(label),
        _ => None,
    }
}
