use std::collections::HashMap;
use std::sync::Arc;

use arena_core::error::CoreError;
use arena_core::registry::Registry;
use arena_core::AppState;
use arena_models::gateway::EnvelopeType;
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::connection::Connection;

/// Everything a handler may touch while processing one inbound message.
pub struct EventContext<'a> {
    pub state: &'a AppState,
    pub registry: &'a Registry,
    pub connection: &'a Arc<Connection>,
    pub connection_id: &'a str,
    /// The message exactly as received.
    pub raw: &'a str,
}

pub type HandlerFuture<'a> = BoxFuture<'a, Result<bool, CoreError>>;

/// Resolves to whether the handler acted on the message.
pub type Handler = for<'a> fn(EventContext<'a>) -> HandlerFuture<'a>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid message")]
    Malformed,
    #[error("missing message type")]
    MissingType,
    #[error("{event_type} failed: {source}")]
    Handler {
        event_type: String,
        #[source]
        source: CoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub event_type: String,
    pub handled: bool,
}

/// Routing table from message type to handler. Built once at startup.
#[derive(Default)]
pub struct EventRouter {
    routes: HashMap<&'static str, Handler>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, event_type: &'static str, handler: Handler) -> Self {
        self.routes.insert(event_type, handler);
        self
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }

    pub async fn dispatch(
        &self,
        state: &AppState,
        connection: &Arc<Connection>,
        connection_id: &str,
        raw: &str,
    ) -> Result<Dispatched, DispatchError> {
        let envelope: EnvelopeType =
            serde_json::from_str(raw).map_err(|_| DispatchError::Malformed)?;
        let event_type = envelope.event_type.trim().to_string();
        if event_type.is_empty() {
            return Err(DispatchError::MissingType);
        }
        let Some(handler) = self.routes.get(event_type.as_str()) else {
            return Ok(Dispatched {
                event_type,
                handled: false,
            });
        };
        let ctx = EventContext {
            state,
            registry: state.registry.as_ref(),
            connection,
            connection_id,
            raw,
        };
        match handler(ctx).await {
            Ok(handled) => Ok(Dispatched {
                event_type,
                handled,
            }),
            Err(source) => Err(DispatchError::Handler { event_type, source }),
        }
    }
}
