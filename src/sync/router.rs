//! Routes the received messages to the handlers of the matching subscriptions.

use core::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use fnv::FnvHashMap;
use tracing::{debug, trace};

use crate::v3::{publish::Publish, topic, QoS};

/// Callback invoked for each message received on a matching subscription.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Application message received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
    dup: bool,
}

impl Message {
    /// Returns the topic the message was published on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the message payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the QoS the message was delivered with.
    #[must_use]
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Returns `true` if the message was retained by the server.
    #[must_use]
    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Returns `true` if the message is a re-delivery.
    #[must_use]
    pub fn dup(&self) -> bool {
        self.dup
    }
}

impl From<Publish> for Message {
    fn from(value: Publish) -> Self {
        let qos = value.qos();
        let retain = value.retain();
        let (topic, payload) = value.into_parts();

        Self {
            topic,
            payload,
            qos: qos.level(),
            retain,
            dup: qos.dup(),
        }
    }
}

#[derive(Clone)]
struct Route {
    qos: QoS,
    handler: Option<MessageHandler>,
}

impl Debug for Route {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Route")
            .field("qos", &self.qos)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Topic filters of the subscriptions and their handlers.
#[derive(Debug, Default)]
pub(crate) struct Router {
    routes: RwLock<FnvHashMap<String, Route>>,
}

impl Router {
    /// Registers a granted subscription.
    ///
    /// An existing handler is kept if none is given.
    pub(crate) fn register(&self, filter: &str, qos: QoS, handler: Option<MessageHandler>) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);

        let route = routes.entry(filter.to_string()).or_insert(Route {
            qos,
            handler: None,
        });

        route.qos = qos;

        if handler.is_some() {
            route.handler = handler;
        }

        trace!(filter, %qos, "registered route");
    }

    /// Installs or overrides the handler for a filter.
    pub(crate) fn set_route(&self, filter: &str, handler: MessageHandler) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);

        routes
            .entry(filter.to_string())
            .and_modify(|route| route.handler = Some(Arc::clone(&handler)))
            .or_insert_with(|| Route {
                qos: QoS::AtMostOnce,
                handler: Some(Arc::clone(&handler)),
            });
    }

    /// Removes the route for the filter.
    pub(crate) fn unregister(&self, filter: &str) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);

        routes.remove(filter).is_some()
    }

    /// Invokes every handler whose filter matches the topic of the message.
    ///
    /// Returns the number of handlers invoked.
    pub(crate) fn dispatch(&self, message: &Message) -> usize {
        let handlers: Vec<MessageHandler> = {
            let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);

            routes
                .iter()
                .filter(|(filter, _)| topic::matches(filter, message.topic()))
                .filter_map(|(_, route)| route.handler.clone())
                .collect()
        };

        if handlers.is_empty() {
            debug!(topic = message.topic(), "no route for the message");
        }

        for handler in &handlers {
            handler(message);
        }

        handlers.len()
    }

    #[cfg(test)]
    pub(crate) fn qos(&self, filter: &str) -> Option<QoS> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);

        routes.get(filter).map(|route| route.qos)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use crate::v3::publish::PublishQos;

    use super::*;

    fn message(topic: &str) -> Message {
        Publish::new(topic, PublishQos::AtMostOnce, false, b"data".to_vec())
            .unwrap()
            .into()
    }

    fn counter() -> (Arc<AtomicUsize>, MessageHandler) {
        let count = Arc::new(AtomicUsize::new(0));

        let handler: MessageHandler = {
            let count = Arc::clone(&count);

            Arc::new(move |_msg: &Message| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        (count, handler)
    }

    #[test]
    fn should_dispatch_to_matching_routes() {
        let router = Router::default();

        let (sport, sport_handler) = counter();
        let (tennis, tennis_handler) = counter();
        let (other, other_handler) = counter();

        router.register("sport/#", QoS::AtLeastOnce, Some(sport_handler));
        router.register("sport/tennis/+", QoS::AtMostOnce, Some(tennis_handler));
        router.register("finance", QoS::AtMostOnce, Some(other_handler));

        assert_eq!(router.dispatch(&message("sport/tennis/player1")), 2);
        assert_eq!(router.dispatch(&message("sport")), 1);

        assert_eq!(sport.load(Ordering::SeqCst), 2);
        assert_eq!(tennis.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn should_skip_routes_without_handler() {
        let router = Router::default();

        router.register("a/b", QoS::AtLeastOnce, None);

        assert_eq!(router.dispatch(&message("a/b")), 0);
    }

    #[test]
    fn should_override_handler_with_set_route() {
        let router = Router::default();

        let (first, first_handler) = counter();
        let (second, second_handler) = counter();

        router.register("a/+", QoS::AtLeastOnce, Some(first_handler));
        router.set_route("a/+", second_handler);

        assert_eq!(router.dispatch(&message("a/b")), 1);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(router.qos("a/+"), Some(QoS::AtLeastOnce));
    }

    #[test]
    fn should_keep_handler_on_register_without_one() {
        let router = Router::default();

        let (count, handler) = counter();

        router.set_route("a/b", handler);
        router.register("a/b", QoS::AtLeastOnce, None);

        router.dispatch(&message("a/b"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(router.qos("a/b"), Some(QoS::AtLeastOnce));
    }

    #[test]
    fn should_unregister() {
        let router = Router::default();

        let (count, handler) = counter();

        router.register("a/b", QoS::AtMostOnce, Some(handler));

        assert!(router.unregister("a/b"));
        assert!(!router.unregister("a/b"));

        assert_eq!(router.dispatch(&message("a/b")), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn should_allow_handlers_to_change_routes() {
        let router = Arc::new(Router::default());

        let handler: MessageHandler = {
            let router = Arc::clone(&router);

            Arc::new(move |_msg: &Message| {
                router.unregister("a/b");
            })
        };

        router.register("a/b", QoS::AtMostOnce, Some(handler));

        assert_eq!(router.dispatch(&message("a/b")), 1);
        assert_eq!(router.qos("a/b"), None);
    }
}
