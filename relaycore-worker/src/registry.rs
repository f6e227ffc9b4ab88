//! Handler registry (§4.I, §7 REDESIGN FLAGS): explicit registration in
//! place of runtime reflection. Each handler module calls
//! `registry.register::<SomeCommand, _, _>(|cmd| async move { ... })` at
//! startup; ambiguity (two handlers claiming the same tag) is a startup
//! error, not a runtime one.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use relaycore_shared::errors::{PlatformError, PlatformResult};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Marker trait for typed command payloads. The registry tag is the type
/// name with the `Command` suffix stripped (§4.I), e.g. `CreateUserCommand`
/// registers under `CreateUser`.
pub trait DomainCommand: DeserializeOwned + Send + Sync + 'static {
    fn tag() -> String {
        let full = std::any::type_name::<Self>();
        let short = full.rsplit("::").next().unwrap_or(full);
        short.strip_suffix("Command").unwrap_or(short).to_string()
    }
}

/// A domain event a handler wants appended to the outbox as one `event`
/// row, in the same transaction as the command's success outcome (§4.H
/// step 4, "handlers expose events via a collector bound to the
/// transaction").
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub event_type: String,
    pub payload: Value,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// What a successful handler invocation produced: the reply `data` map
/// and zero or more domain events to publish alongside it.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub data: HashMap<String, Value>,
    pub events: Vec<DomainEvent>,
}

impl HandlerOutcome {
    pub fn new(data: HashMap<String, Value>) -> Self {
        Self { data, events: Vec::new() }
    }

    pub fn with_event(mut self, event: DomainEvent) -> Self {
        self.events.push(event);
        self
    }
}

impl From<HashMap<String, Value>> for HandlerOutcome {
    fn from(data: HashMap<String, Value>) -> Self {
        Self::new(data)
    }
}

/// What the executor actually dispatches to: payload in, [`HandlerOutcome`]
/// out. A thrown error becomes a failed reply (§4.I); the executor
/// classifies it as retryable or not via [`relaycore_shared::errors::PlatformError::is_retryable_by_default`]
/// unless the handler overrides classification in its own error mapping.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn tag(&self) -> &str;
    async fn handle(&self, payload: Value) -> PlatformResult<HandlerOutcome>;
}

struct TypedHandler<T, F> {
    tag: String,
    func: F,
    _marker: PhantomData<fn(T)>,
}

#[async_trait]
impl<T, F, Fut> CommandHandler for TypedHandler<T, F>
where
    T: DomainCommand,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = PlatformResult<HandlerOutcome>> + Send,
{
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn handle(&self, payload: Value) -> PlatformResult<HandlerOutcome> {
        let command: T = serde_json::from_value(payload)?;
        (self.func)(command).await
    }
}

/// Built once at startup by calling `register` for every known command
/// type, then shared read-only across every worker task (§5 "no ambient
/// mutable singleton" — mutation is confined to the startup phase).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("tags", &self.handlers.iter().map(|e| e.key().clone()).collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `T`. Fails if a handler for `T::tag()` is
    /// already registered (§4.I ambiguity check).
    pub fn register<T, F, Fut>(&self, func: F) -> PlatformResult<()>
    where
        T: DomainCommand,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PlatformResult<HandlerOutcome>> + Send + 'static,
    {
        let tag = T::tag();
        if self.handlers.contains_key(&tag) {
            return Err(PlatformError::Config(format!(
                "ambiguous handler registration: a handler for command tag {tag} is already registered"
            )));
        }
        self.handlers.insert(
            tag.clone(),
            Arc::new(TypedHandler {
                tag,
                func,
                _marker: PhantomData,
            }),
        );
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(tag).map(|entry| entry.value().clone())
    }

    /// Every registered tag, so a consumer can be started per queue
    /// without the worker binary enumerating command types itself.
    pub fn tags(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct CreateUserCommand {
        #[allow(dead_code)]
        username: String,
    }
    impl DomainCommand for CreateUserCommand {}

    #[test]
    fn tag_strips_the_command_suffix() {
        assert_eq!(CreateUserCommand::tag(), "CreateUser");
    }

    #[tokio::test]
    async fn registering_the_same_tag_twice_is_an_error() {
        let registry = HandlerRegistry::new();
        registry
            .register::<CreateUserCommand, _, _>(|_cmd| async { Ok(HandlerOutcome::default()) })
            .unwrap();
        let result = registry.register::<CreateUserCommand, _, _>(|_cmd| async { Ok(HandlerOutcome::default()) });
        assert!(matches!(result, Err(PlatformError::Config(_))));
    }

    #[tokio::test]
    async fn a_registered_handler_is_dispatched_by_tag() {
        let registry = HandlerRegistry::new();
        registry
            .register::<CreateUserCommand, _, _>(|cmd| async move {
                let mut data = HashMap::new();
                data.insert("username".to_string(), Value::String(cmd.username.clone()));
                Ok(HandlerOutcome::new(data).with_event(DomainEvent::new("UserCreated", serde_json::json!({ "username": cmd.username }))))
            })
            .unwrap();

        let handler = registry.get("CreateUser").expect("handler registered");
        let result = handler.handle(serde_json::json!({ "username": "u1" })).await.unwrap();
        assert_eq!(result.data.get("username").unwrap(), "u1");
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].event_type, "UserCreated");
    }
}
