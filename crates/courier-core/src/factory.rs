//! Handler registry: constructors and optional repositories per stream.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::bus::Subscriber;
use crate::error::BusError;

/// Opaque capability bag handed to handler constructors.
///
/// The bus never inspects it; concrete capabilities are defined by the
/// handlers that consume them.
pub trait Repository: Send + Sync {}

/// Builds a subscriber from the envelope's payload bytes and an optional
/// repository.
pub type HandlerConstructor = Arc<
    dyn Fn(&[u8], Option<Arc<dyn Repository>>) -> Result<Box<dyn Subscriber>, BusError>
        + Send
        + Sync,
>;

#[derive(Default)]
struct Registry {
    constructors: HashMap<String, HandlerConstructor>,
    repositories: HashMap<String, Arc<dyn Repository>>,
}

/// Registry of handler constructors and their repositories, keyed by stream
/// name.
///
/// Both maps sit behind one reader/writer lock: lookups take the read side,
/// registrations the write side.
#[derive(Default)]
pub struct HandlerFactory {
    registry: RwLock<Registry>,
}

impl HandlerFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the constructor for a stream.
    pub fn register_handler<F>(&self, stream: impl Into<String>, constructor: F)
    where
        F: Fn(&[u8], Option<Arc<dyn Repository>>) -> Result<Box<dyn Subscriber>, BusError>
            + Send
            + Sync
            + 'static,
    {
        let stream = stream.into();
        info!(stream = %stream, "registered handler constructor");
        self.registry
            .write()
            .expect("factory registry poisoned")
            .constructors
            .insert(stream, Arc::new(constructor));
    }

    /// Registers (or replaces) the repository for a stream.
    pub fn register_repository(&self, stream: impl Into<String>, repository: Arc<dyn Repository>) {
        let stream = stream.into();
        info!(stream = %stream, "registered repository");
        self.registry
            .write()
            .expect("factory registry poisoned")
            .repositories
            .insert(stream, repository);
    }

    /// Instantiates a handler for one message.
    ///
    /// The repository is optional; a stream without one gets `None`.
    pub fn create_handler(
        &self,
        stream: &str,
        payload: &[u8],
    ) -> Result<Box<dyn Subscriber>, BusError> {
        let (constructor, repository) = {
            let registry = self.registry.read().expect("factory registry poisoned");
            (
                registry.constructors.get(stream).cloned(),
                registry.repositories.get(stream).cloned(),
            )
        };

        let Some(constructor) = constructor else {
            return Err(BusError::MissingConstructor(stream.to_owned()));
        };
        if repository.is_none() {
            debug!(stream = %stream, "no repository registered, creating handler without one");
        }
        constructor(payload, repository)
    }

    /// Returns true if a constructor is registered for the stream.
    #[must_use]
    pub fn has_handler(&self, stream: &str) -> bool {
        self.registry
            .read()
            .expect("factory registry poisoned")
            .constructors
            .contains_key(stream)
    }

    /// All stream names with a registered constructor.
    #[must_use]
    pub fn streams(&self) -> Vec<String> {
        self.registry
            .read()
            .expect("factory registry poisoned")
            .constructors
            .keys()
            .cloned()
            .collect()
    }
}
