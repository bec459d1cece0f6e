//! Operation dispatcher: at most one handler per operation name.
//!
//! Generic over the context handed to handlers so the primary channel and
//! direct links share one registry.

use std::collections::HashMap;

use crate::error::Error;
use crate::protocol::LogicalMessage;

pub type Handler<C> = Box<dyn FnMut(&mut C, &LogicalMessage) -> Result<(), Error> + Send>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("operation {0} already has a handler")]
    DuplicateHandler(String),
}

#[derive(Debug)]
pub enum Dispatched {
    Handled,
    /// No handler registered; caller reports it, never drops silently.
    Unhandled(String),
    /// Handler ran and failed.
    Failed(Error),
}

pub struct Dispatcher<C> {
    handlers: HashMap<String, Handler<C>>,
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, operation: &str, handler: Handler<C>) -> Result<(), DispatchError> {
        if self.handlers.contains_key(operation) {
            return Err(DispatchError::DuplicateHandler(operation.to_string()));
        }
        self.handlers.insert(operation.to_string(), handler);
        Ok(())
    }

    /// Remove the handler. Returns whether one was registered.
    pub fn unregister(&mut self, operation: &str) -> bool {
        self.handlers.remove(operation).is_some()
    }

    pub fn is_registered(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    pub fn dispatch(&mut self, ctx: &mut C, message: &LogicalMessage) -> Dispatched {
        let Some(handler) = self.handlers.get_mut(&message.operation) else {
            return Dispatched::Unhandled(message.operation.clone());
        };
        match handler(ctx, message) {
            Ok(()) => Dispatched::Handled,
            Err(e) => Dispatched::Failed(e),
        }
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}
