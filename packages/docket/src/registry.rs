//! Handler registry for decoding and executing jobs.
//!
//! The registry maps job names (e.g. `"send-digest"`) to handlers. A handler
//! advertises its name and executes a payload; the typed adapter
//! [`FnHandler`] reconstructs the declared payload shape from the stored
//! generic map before invoking the handler logic, so workers can dispatch
//! claimed jobs without knowing the concrete types.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::Error;

/// A job handler: a name plus an execute operation that may fail.
///
/// Failures are ordinary `anyhow` errors; the engine counts them in
/// `fail_count` and reschedules per the retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job name this handler executes.
    fn name(&self) -> &str;

    /// Execute one run with the job's stored payload (`Null` when absent).
    async fn execute(&self, payload: serde_json::Value) -> Result<()>;
}

type BoxedHandler = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// Adapter turning an async closure over a declared payload type into a
/// [`JobHandler`].
///
/// # Example
///
/// ```ignore
/// #[derive(Deserialize)]
/// struct DigestPayload { member_id: Uuid }
///
/// let handler = FnHandler::new("send-digest", |payload: DigestPayload| async move {
///     send_digest(payload.member_id).await
/// });
/// ```
pub struct FnHandler {
    name: String,
    handler: BoxedHandler,
}

impl FnHandler {
    /// Wrap a typed async closure. The payload is decoded with serde before
    /// the closure runs; a decode failure is a handler failure.
    pub fn new<P, F, Fut>(name: impl Into<String>, handler: F) -> Arc<dyn JobHandler>
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handler_name = name.clone();
        let boxed: BoxedHandler = Box::new(move |value| {
            let handler = handler.clone();
            let handler_name = handler_name.clone();
            Box::pin(async move {
                let payload: P = serde_json::from_value(value).map_err(|e| {
                    anyhow!("failed to decode payload for {}: {}", handler_name, e)
                })?;
                handler(payload).await
            })
        });

        Arc::new(FnHandler { name, handler: boxed })
    }
}

#[async_trait]
impl JobHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, payload: serde_json::Value) -> Result<()> {
        (self.handler)(payload).await
    }
}

/// Registry that maps job names to handlers.
///
/// Names are unique within a registry; a duplicate at construction is fatal.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Build a registry from a list of handlers.
    pub fn new(
        handlers: impl IntoIterator<Item = Arc<dyn JobHandler>>,
    ) -> Result<Self, Error> {
        let mut map = HashMap::new();
        for handler in handlers {
            let name = handler.name().to_string();
            if map.insert(name.clone(), handler).is_some() {
                return Err(Error::DuplicateHandler(name));
            }
        }
        Ok(Self { handlers: map })
    }

    /// Look up the handler for a job name.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn JobHandler>, Error> {
        self.handlers
            .get(name)
            .ok_or_else(|| Error::UnknownHandler(name.to_string()))
    }

    /// Check if a job name has a handler.
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// All registered job names.
    pub fn registered_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Deserialize)]
    struct TestPayload {
        id: String,
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_executes() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let handler = FnHandler::new("test-job", move |payload: TestPayload| {
            let seen = seen.clone();
            async move {
                assert_eq!(payload.id, "A1");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let registry = HandlerRegistry::new([handler]).unwrap();
        registry
            .get("test-job")
            .unwrap()
            .execute(serde_json::json!({"id": "A1"}))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn payload_decode_failure_is_a_handler_failure() {
        let handler = FnHandler::new("test-job", |_payload: TestPayload| async move { Ok(()) });
        let registry = HandlerRegistry::new([handler]).unwrap();

        let result = registry
            .get("test-job")
            .unwrap()
            .execute(serde_json::json!({"wrong": true}))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_names_fail_construction() {
        let a = FnHandler::new("same", |_: serde_json::Value| async move { Ok(()) });
        let b = FnHandler::new("same", |_: serde_json::Value| async move { Ok(()) });

        assert!(matches!(
            HandlerRegistry::new([a, b]),
            Err(Error::DuplicateHandler(name)) if name == "same"
        ));
    }

    #[test]
    fn unknown_name_fails_lookup() {
        let registry = HandlerRegistry::new([]).unwrap();
        assert!(matches!(
            registry.get("missing"),
            Err(Error::UnknownHandler(name)) if name == "missing"
        ));
        assert!(!registry.is_registered("missing"));
    }

    #[test]
    fn registered_names_lists_handlers() {
        let handler = FnHandler::new("only", |_: serde_json::Value| async move { Ok(()) });
        let registry = HandlerRegistry::new([handler]).unwrap();
        assert_eq!(registry.registered_names(), vec!["only"]);
    }
}
