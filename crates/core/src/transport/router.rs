use super::{InboundStanza, StanzaHandler, StanzaKind};
use crate::protocol::{element_name, ElementName};
use ibb_common::{Condition, StanzaError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Stanza kind plus payload name a handler is registered for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub kind: StanzaKind,
    pub name: ElementName,
}

/// Routes inbound stanzas to handlers by stanza kind and payload name
#[derive(Default)]
pub struct Router {
    routes: RwLock<HashMap<RouteKey, Arc<dyn StanzaHandler>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same key
    pub fn register(&self, kind: StanzaKind, name: ElementName, handler: Arc<dyn StanzaHandler>) {
        debug!("Registering {:?} route for {}", kind, name);
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(RouteKey { kind, name }, handler);
    }

    pub fn is_registered(&self, kind: StanzaKind, name: &ElementName) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&RouteKey {
                kind,
                name: name.clone(),
            })
    }

    /// Hand a stanza to its handler
    pub async fn dispatch(&self, stanza: InboundStanza) -> Result<(), StanzaError> {
        let name = element_name(&stanza.payload).map_err(|e| {
            warn!("Dropping unparseable {:?} payload from {}: {}", stanza.kind, stanza.from, e);
            StanzaError::cancel(Condition::BadRequest)
        })?;

        let handler = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&RouteKey {
                kind: stanza.kind,
                name: name.clone(),
            })
            .cloned();

        match handler {
            Some(handler) => handler.handle_stanza(stanza).await,
            None => {
                debug!("No handler for {:?} {}", stanza.kind, name);
                Err(StanzaError::cancel(Condition::ServiceUnavailable))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl StanzaHandler for Counter {
        async fn handle_stanza(&self, _stanza: InboundStanza) -> Result<(), StanzaError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn stanza(kind: StanzaKind, payload: &str) -> InboundStanza {
        InboundStanza {
            kind,
            from: "a@example.net/x".parse().unwrap(),
            to: "b@example.net/y".parse().unwrap(),
            payload: payload.to_string(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_kind_and_name() {
        let router = Router::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        router.register(
            StanzaKind::Iq,
            ElementName::new("urn:example", "ping"),
            counter.clone(),
        );

        router
            .dispatch(stanza(StanzaKind::Iq, r#"<ping xmlns="urn:example"/>"#))
            .await
            .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let err = router
            .dispatch(stanza(StanzaKind::Message, r#"<ping xmlns="urn:example"/>"#))
            .await
            .unwrap_err();
        assert_eq!(err.condition, Condition::ServiceUnavailable);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_garbage_is_bad_request() {
        let router = Router::new();
        let err = router
            .dispatch(stanza(StanzaKind::Iq, "not xml <"))
            .await
            .unwrap_err();
        assert_eq!(err.condition, Condition::BadRequest);
    }
}
