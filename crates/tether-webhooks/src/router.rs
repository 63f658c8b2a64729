use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use tether_types::CoreResult;

use crate::verifier::{error_codes, Verification, WebhookRequest, WebhookVerifier};

/// A verified, parsed webhook ready for handlers.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub provider: String,
    pub path: String,
    pub payload: Value,
    pub metadata: Value,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    fn name(&self) -> &str {
        "handler"
    }
    async fn handle(&self, event: &WebhookEvent) -> CoreResult<()>;
}

/// Middleware wraps dispatch: `before` may veto, `after` observes the
/// outcome.
#[async_trait]
pub trait WebhookMiddleware: Send + Sync {
    async fn before(&self, _event: &WebhookEvent) -> CoreResult<()> {
        Ok(())
    }
    async fn after(&self, _event: &WebhookEvent, _success: bool) {}
}

struct Route {
    verifier: Arc<dyn WebhookVerifier>,
    handlers: Vec<Arc<dyn WebhookHandler>>,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub success: bool,
    pub provider: String,
    pub verification: Verification,
    pub event: Option<Value>,
    pub error: Option<String>,
    pub handler_errors: Vec<String>,
    pub duration_ms: u64,
}

/// Routes verified webhooks to handlers. One handler's error never stops
/// the remaining handlers; unknown paths fall back to the default route
/// when configured.
pub struct WebhookRouter {
    routes: RwLock<HashMap<String, Route>>,
    global_handlers: RwLock<Vec<Arc<dyn WebhookHandler>>>,
    middleware: RwLock<Vec<Arc<dyn WebhookMiddleware>>>,
    default_path: RwLock<Option<String>>,
}

impl WebhookRouter {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            global_handlers: RwLock::new(Vec::new()),
            middleware: RwLock::new(Vec::new()),
            default_path: RwLock::new(None),
        }
    }

    pub async fn add_route(
        &self,
        path: impl Into<String>,
        verifier: Arc<dyn WebhookVerifier>,
        handlers: Vec<Arc<dyn WebhookHandler>>,
    ) {
        self.routes
            .write()
            .await
            .insert(path.into(), Route { verifier, handlers });
    }

    pub async fn add_global_handler(&self, handler: Arc<dyn WebhookHandler>) {
        self.global_handlers.write().await.push(handler);
    }

    pub async fn add_middleware(&self, middleware: Arc<dyn WebhookMiddleware>) {
        self.middleware.write().await.push(middleware);
    }

    /// Route unknown paths to this already-registered path.
    pub async fn set_default_route(&self, path: impl Into<String>) {
        *self.default_path.write().await = Some(path.into());
    }

    pub async fn dispatch(&self, path: &str, request: &WebhookRequest) -> DispatchResult {
        let started = Instant::now();

        let routes = self.routes.read().await;
        let route = match routes.get(path) {
            Some(route) => route,
            None => {
                let fallback = self.default_path.read().await.clone();
                match fallback.as_deref().and_then(|p| routes.get(p)) {
                    Some(route) => route,
                    None => {
                        return DispatchResult {
                            success: false,
                            provider: String::new(),
                            verification: Verification::fail(
                                "",
                                error_codes::NO_ROUTE,
                                format!("no route registered for `{path}`"),
                            ),
                            event: None,
                            error: Some(format!("no route registered for `{path}`")),
                            handler_errors: Vec::new(),
                            duration_ms: started.elapsed().as_millis() as u64,
                        }
                    }
                }
            }
        };

        let verification = route.verifier.verify(request);
        let provider = verification.provider.clone();
        if !verification.valid {
            let error = verification.error.clone();
            return DispatchResult {
                success: false,
                provider,
                verification,
                event: None,
                error,
                handler_errors: Vec::new(),
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }

        let payload = verification
            .event
            .clone()
            .or_else(|| request.json_body())
            .unwrap_or(Value::Null);
        let event = WebhookEvent {
            provider: provider.clone(),
            path: path.to_string(),
            payload,
            metadata: verification.metadata.clone(),
            received_at: Utc::now(),
        };

        for middleware in self.middleware.read().await.iter() {
            if let Err(err) = middleware.before(&event).await {
                return DispatchResult {
                    success: false,
                    provider,
                    verification,
                    event: Some(event.payload),
                    error: Some(format!("middleware rejected dispatch: {err}")),
                    handler_errors: Vec::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        }

        let mut handler_errors = Vec::new();
        let globals = self.global_handlers.read().await.clone();
        for handler in route.handlers.iter().chain(globals.iter()) {
            if let Err(err) = handler.handle(&event).await {
                warn!(
                    provider = %provider,
                    handler = handler.name(),
                    error = %err,
                    "webhook handler failed"
                );
                handler_errors.push(format!("{}: {err}", handler.name()));
            }
        }

        let success = true;
        for middleware in self.middleware.read().await.iter() {
            middleware.after(&event, success).await;
        }

        DispatchResult {
            success,
            provider,
            verification,
            event: Some(event.payload),
            error: None,
            handler_errors,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

impl Default for WebhookRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic::{GenericHmacConfig, GenericHmacVerifier};
    use parking_lot::Mutex;
    use tether_types::CoreError;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl WebhookHandler for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        async fn handle(&self, event: &WebhookEvent) -> CoreResult<()> {
            self.seen.lock().push(format!("{}:{}", self.name, event.provider));
            if self.fail {
                return Err(CoreError::Storage("handler boom".to_string()));
            }
            Ok(())
        }
    }

    fn verifier() -> (GenericHmacVerifier, WebhookRequest) {
        let verifier = GenericHmacVerifier::new(GenericHmacConfig::new("acme", "secret"));
        let body = r#"{"kind": "ping"}"#;
        let signature = verifier.expected_signature(None, body);
        let request =
            WebhookRequest::new("u", body).with_header("x-webhook-signature", signature);
        (verifier, request)
    }

    #[tokio::test]
    async fn handler_errors_do_not_stop_later_handlers() {
        let router = WebhookRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (verifier, request) = verifier();
        router
            .add_route(
                "/hooks/acme",
                Arc::new(verifier),
                vec![
                    Arc::new(Recorder {
                        name: "first",
                        seen: seen.clone(),
                        fail: true,
                    }),
                    Arc::new(Recorder {
                        name: "second",
                        seen: seen.clone(),
                        fail: false,
                    }),
                ],
            )
            .await;
        router
            .add_global_handler(Arc::new(Recorder {
                name: "global",
                seen: seen.clone(),
                fail: false,
            }))
            .await;

        let result = router.dispatch("/hooks/acme", &request).await;
        assert!(result.success);
        assert_eq!(result.handler_errors.len(), 1);
        assert_eq!(
            seen.lock().clone(),
            vec!["first:acme", "second:acme", "global:acme"]
        );
    }

    #[tokio::test]
    async fn unknown_route_without_default_is_no_route() {
        let router = WebhookRouter::new();
        let (_, request) = verifier();
        let result = router.dispatch("/nowhere", &request).await;
        assert!(!result.success);
        assert_eq!(
            result.verification.error_code.as_deref(),
            Some(error_codes::NO_ROUTE)
        );
    }

    #[tokio::test]
    async fn unknown_route_falls_back_to_default() {
        let router = WebhookRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (verifier, request) = verifier();
        router
            .add_route(
                "/hooks/default",
                Arc::new(verifier),
                vec![Arc::new(Recorder {
                    name: "default",
                    seen: seen.clone(),
                    fail: false,
                })],
            )
            .await;
        router.set_default_route("/hooks/default").await;

        let result = router.dispatch("/hooks/unknown", &request).await;
        assert!(result.success);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn invalid_signature_short_circuits_handlers() {
        let router = WebhookRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (verifier, _) = verifier();
        router
            .add_route(
                "/hooks/acme",
                Arc::new(verifier),
                vec![Arc::new(Recorder {
                    name: "never",
                    seen: seen.clone(),
                    fail: false,
                })],
            )
            .await;

        let bad = WebhookRequest::new("u", "{}").with_header("x-webhook-signature", "nope");
        let result = router.dispatch("/hooks/acme", &bad).await;
        assert!(!result.success);
        assert!(seen.lock().is_empty());
    }

    struct Veto;
    #[async_trait]
    impl WebhookMiddleware for Veto {
        async fn before(&self, _event: &WebhookEvent) -> CoreResult<()> {
            Err(CoreError::PolicyDenied("quiet period".to_string()))
        }
    }

    #[tokio::test]
    async fn middleware_can_veto_dispatch() {
        let router = WebhookRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (verifier, request) = verifier();
        router
            .add_route(
                "/hooks/acme",
                Arc::new(verifier),
                vec![Arc::new(Recorder {
                    name: "never",
                    seen: seen.clone(),
                    fail: false,
                })],
            )
            .await;
        router.add_middleware(Arc::new(Veto)).await;

        let result = router.dispatch("/hooks/acme", &request).await;
        assert!(!result.success);
        assert!(seen.lock().is_empty());
        assert!(result.error.unwrap().contains("middleware"));
    }
}
