use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub type WsSink = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// A room subscription held by a connection.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u64,
    pub token: CancellationToken,
}

/// Write half of a gateway socket plus everything whose lifetime is bound to it.
///
/// The read loop and every forwarding task write through `send_text`, which
/// holds the sink for exactly one frame.
pub struct Connection {
    id: String,
    sink: Mutex<WsSink>,
    cancel: CancellationToken,
    subscriptions: std::sync::Mutex<HashMap<String, Subscription>>,
    next_subscription: AtomicU64,
}

impl Connection {
    pub fn new<S>(id: String, sink: S) -> Self
    where
        S: Sink<Message, Error = axum::Error> + Send + 'static,
    {
        Self {
            id,
            sink: Mutex::new(Box::pin(sink)),
            cancel: CancellationToken::new(),
            subscriptions: std::sync::Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn send_text(&self, text: String) -> Result<(), axum::Error> {
        self.sink.lock().await.send(Message::Text(text.into())).await
    }

    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), axum::Error> {
        let text = serde_json::to_string(value).map_err(axum::Error::new)?;
        self.send_text(text).await
    }

    /// Best-effort close frame.
    pub async fn close(&self, code: u16, reason: &str) {
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        }));
        let _ = self.sink.lock().await.send(frame).await;
    }

    /// Ends every task bound to this connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.subscriptions.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once `shutdown` has been called.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Registers a subscription to `code`. Returns `None` when one is already
    /// active or the connection is shutting down.
    pub fn track_subscription(&self, code: &str) -> Option<Subscription> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = subscriptions.get(code) {
            if !existing.token.is_cancelled() {
                return None;
            }
        }
        let subscription = Subscription {
            id: self.next_subscription.fetch_add(1, Ordering::Relaxed),
            token: self.cancel.child_token(),
        };
        subscriptions.insert(code.to_string(), subscription.clone());
        Some(subscription)
    }

    /// Cancels the subscription to `code`, if any.
    pub fn end_subscription(&self, code: &str) {
        let removed = self
            .subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(code);
        if let Some(subscription) = removed {
            subscription.token.cancel();
        }
    }

    /// Forgets a subscription that ended on its own, unless it was replaced.
    pub fn release_subscription(&self, code: &str, id: u64) {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
        if subscriptions.get(code).is_some_and(|s| s.id == id) {
            subscriptions.remove(code);
        }
    }

    pub fn subscribed_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        rooms.sort();
        rooms
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    use super::Connection;

    /// A connection whose outgoing frames land in the returned receiver.
    pub fn recording_connection(id: &str) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = futures_util::sink::unfold(tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(axum::Error::new)?;
            Ok::<_, axum::Error>(tx)
        });
        (Arc::new(Connection::new(id.to_string(), sink)), rx)
    }

    pub fn text(msg: Message) -> serde_json::Value {
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_are_written_whole_and_in_order() {
        let (connection, mut rx) = recording_connection("c1");
        let writers: Vec<_> = (0..20)
            .map(|i| {
                let connection = connection.clone();
                tokio::spawn(async move { connection.send_json(&json!({"n": i})).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            seen.push(text(msg)["n"].as_i64().unwrap());
        }
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn one_subscription_per_room() {
        let (connection, _rx) = recording_connection("c1");
        let first = connection.track_subscription("ABC234").unwrap();
        assert!(connection.track_subscription("ABC234").is_none());
        assert!(connection.track_subscription("XYZ789").is_some());

        connection.end_subscription("ABC234");
        assert!(first.token.is_cancelled());
        assert!(connection.track_subscription("ABC234").is_some());
    }

    #[tokio::test]
    async fn release_ignores_replaced_subscription() {
        let (connection, _rx) = recording_connection("c1");
        let first = connection.track_subscription("ABC234").unwrap();
        connection.end_subscription("ABC234");
        let second = connection.track_subscription("ABC234").unwrap();

        connection.release_subscription("ABC234", first.id);
        assert_eq!(connection.subscribed_rooms(), vec!["ABC234"]);
        connection.release_subscription("ABC234", second.id);
        assert!(connection.subscribed_rooms().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_child_tokens() {
        let (connection, _rx) = recording_connection("c1");
        let subscription = connection.track_subscription("ABC234").unwrap();
        connection.shutdown();
        assert!(subscription.token.is_cancelled());
        assert!(connection.is_closed());
        assert!(connection.track_subscription("XYZ789").is_none());
    }
}
