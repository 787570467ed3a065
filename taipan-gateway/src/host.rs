//! Embedder-supplied collaborators.
//!
//! The connection core owns no object model. Tokens, intents, event fan-out,
//! and member-chunk sinks are injected through these traits; processors are
//! looked up by name at runtime so the embedder can register handlers late.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::intents::Intents;
use crate::payload::PresenceUpdate;
use crate::socket::SocketConnector;

/// A late-bound event processor: `(payload_json, raw_event_name) -> future`.
pub type EventProcessor = Arc<dyn Fn(Value, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives GUILD_MEMBERS_CHUNK payloads for one guild.
#[async_trait]
pub trait MemberChunkSink: Send + Sync {
    async fn process_member_chunk(&self, chunk: Value);
}

/// The embedding client, as seen by gateway sessions.
pub trait GatewayHost: Send + Sync + 'static {
    /// Socket factory, normally backed by the embedder's HTTP client.
    fn connector(&self) -> Arc<dyn SocketConnector>;

    /// Bot token used for IDENTIFY and RESUME.
    fn token(&self) -> String;

    fn intents(&self) -> Intents;

    /// Presence advertised in IDENTIFY.
    fn presence(&self) -> Option<PresenceUpdate> {
        None
    }

    /// Gateway URL, usually fetched from `/gateway/bot`.
    fn gateway_url(&self) -> String;

    /// One-shot event emit toward the embedder's dispatcher.
    fn dispatch(&self, event: &str, payload: Value);

    /// Look up a `raw_<event>` processor by name.
    fn processor(&self, name: &str) -> Option<EventProcessor> {
        let _ = name;
        None
    }

    /// Member-chunk sink for a guild, if the embedder caches it.
    fn guild_chunk_sink(&self, guild_id: u64) -> Option<Arc<dyn MemberChunkSink>> {
        let _ = guild_id;
        None
    }
}

/// Name-to-handler registry hosts can hang their processors on.
#[derive(Default)]
pub struct ProcessorRegistry {
    handlers: DashMap<String, EventProcessor>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, handler: EventProcessor) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<EventProcessor> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_resolves_handlers_by_name() {
        let registry = ProcessorRegistry::new();
        let (tx, rx) = flume::unbounded::<String>();

        registry.insert(
            "raw_message_create",
            Arc::new(move |_payload, name| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(name);
                })
            }),
        );

        assert!(registry.get("raw_typing_start").is_none());
        let handler = registry.get("raw_message_create").expect("registered");
        handler(Value::Null, "raw_message_create".to_string()).await;
        assert_eq!(rx.recv().unwrap(), "raw_message_create");
    }
}
