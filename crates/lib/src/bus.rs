//! In-process event bus used to decouple the connection, health and UI layers.
//!
//! Handlers are keyed by channel name and run synchronously, in subscription
//! order, on the publishing thread. A panicking handler is logged and skipped.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::EndpointDescriptor;
use crate::health::HealthStatus;

pub const SERVER_READY: &str = "server-ready";
pub const SERVER_DISCONNECTED: &str = "server-disconnected";
pub const CONNECTION_STATUS_CHANGED: &str = "connection-status-changed";
pub const HEALTH_STATUS_CHANGED: &str = "health-status-changed";

/// Everything published on the bus. The variant determines the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A backend process is serving at the given endpoint.
    ServerReady(EndpointDescriptor),
    /// The backend process exited. `None` when it was killed by a signal.
    ServerDisconnected { exit_code: Option<i32> },
    /// The registry's connected flag flipped.
    ConnectionStatusChanged(bool),
    /// Result of the latest health probe.
    HealthStatusChanged(HealthStatus),
}

impl BusEvent {
    /// Channel name this event is delivered on.
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::ServerReady(_) => SERVER_READY,
            BusEvent::ServerDisconnected { .. } => SERVER_DISCONNECTED,
            BusEvent::ConnectionStatusChanged(_) => CONNECTION_STATUS_CHANGED,
            BusEvent::HealthStatusChanged(_) => HEALTH_STATUS_CHANGED,
        }
    }
}

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Vec<(SubscriptionId, Handler)>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe<F>(&self, event_name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.channels()
            .entry(event_name.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Subscribe for the lifetime of the returned guard.
    pub fn subscribe_scoped<F>(self: &Arc<Self>, event_name: &str, handler: F) -> ScopedSubscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = self.subscribe(event_name, handler);
        ScopedSubscription {
            bus: Arc::clone(self),
            event_name: event_name.to_string(),
            id,
        }
    }

    /// Remove one handler. The channel entry is dropped with its last handler.
    pub fn unsubscribe(&self, event_name: &str, id: SubscriptionId) -> bool {
        let mut channels = self.channels();
        let Some(handlers) = channels.get_mut(event_name) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            channels.remove(event_name);
        }
        removed
    }

    /// Deliver `event` to every handler of its channel; returns how many ran to completion.
    pub fn publish(&self, event: &BusEvent) -> usize {
        let name = event.name();
        // Snapshot so handlers may subscribe, unsubscribe or publish re-entrantly.
        let handlers: Vec<Handler> = match self.channels().get(name) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return 0,
        };
        let mut delivered = 0;
        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    log::error!("handler for {} panicked: {}", name, panic_message(&*payload));
                }
            }
        }
        delivered
    }

    /// Drop all handlers of one channel, or of every channel when `None`.
    pub fn clear(&self, event_name: Option<&str>) {
        let mut channels = self.channels();
        match event_name {
            Some(name) => {
                channels.remove(name);
            }
            None => channels.clear(),
        }
    }

    pub fn handler_count(&self, event_name: &str) -> usize {
        self.channels().get(event_name).map_or(0, Vec::len)
    }

    /// Number of channels that currently hold at least one handler.
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }
}

/// Unsubscribes when dropped.
pub struct ScopedSubscription {
    bus: Arc<EventBus>,
    event_name: String,
    id: SubscriptionId,
}

impl Drop for ScopedSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.event_name, self.id);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type BoxedHandler = Box<dyn Fn(&BusEvent) + Send + Sync>;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> BoxedHandler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for = Arc::clone(&log);
        let make = move |tag: &str| -> BoxedHandler {
            let log = Arc::clone(&log_for);
            let tag = tag.to_string();
            Box::new(move |_| log.lock().unwrap().push(tag.clone()))
        };
        (log, make)
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.subscribe(CONNECTION_STATUS_CHANGED, make("a"));
        bus.subscribe(CONNECTION_STATUS_CHANGED, make("b"));
        bus.subscribe(CONNECTION_STATUS_CHANGED, make("c"));
        assert_eq!(bus.publish(&BusEvent::ConnectionStatusChanged(true)), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_later_handlers() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.subscribe(CONNECTION_STATUS_CHANGED, make("first"));
        bus.subscribe(CONNECTION_STATUS_CHANGED, |_| panic!("boom"));
        bus.subscribe(CONNECTION_STATUS_CHANGED, make("last"));
        let delivered = bus.publish(&BusEvent::ConnectionStatusChanged(false));
        assert_eq!(delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "last"]);
    }

    #[test]
    fn events_only_reach_their_channel() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        bus.subscribe(SERVER_DISCONNECTED, make("gone"));
        bus.publish(&BusEvent::ConnectionStatusChanged(true));
        assert!(log.lock().unwrap().is_empty());
        bus.publish(&BusEvent::ServerDisconnected { exit_code: Some(1) });
        assert_eq!(*log.lock().unwrap(), vec!["gone"]);
    }

    #[test]
    fn unsubscribing_last_handler_releases_channel() {
        let bus = EventBus::new();
        let a = bus.subscribe(SERVER_READY, |_| {});
        let b = bus.subscribe(SERVER_READY, |_| {});
        assert_eq!(bus.channel_count(), 1);
        assert!(bus.unsubscribe(SERVER_READY, a));
        assert_eq!(bus.handler_count(SERVER_READY), 1);
        assert!(bus.unsubscribe(SERVER_READY, b));
        assert_eq!(bus.channel_count(), 0);
        assert!(!bus.unsubscribe(SERVER_READY, b));
    }

    #[test]
    fn churn_does_not_grow_storage() {
        let bus = EventBus::new();
        for _ in 0..1000 {
            let id = bus.subscribe(HEALTH_STATUS_CHANGED, |_| {});
            bus.unsubscribe(HEALTH_STATUS_CHANGED, id);
        }
        assert_eq!(bus.channel_count(), 0);
    }

    #[test]
    fn scoped_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        {
            let _sub = bus.subscribe_scoped(SERVER_READY, |_| {});
            assert_eq!(bus.handler_count(SERVER_READY), 1);
        }
        assert_eq!(bus.handler_count(SERVER_READY), 0);
    }

    #[test]
    fn clear_one_channel_or_all() {
        let bus = EventBus::new();
        bus.subscribe(SERVER_READY, |_| {});
        bus.subscribe(SERVER_DISCONNECTED, |_| {});
        bus.clear(Some(SERVER_READY));
        assert_eq!(bus.handler_count(SERVER_READY), 0);
        assert_eq!(bus.handler_count(SERVER_DISCONNECTED), 1);
        bus.clear(None);
        assert_eq!(bus.channel_count(), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself_while_publishing() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let bus_ref = Arc::clone(&bus);
        let slot_ref = Arc::clone(&slot);
        let id = bus.subscribe(SERVER_READY, move |_| {
            if let Some(id) = slot_ref.lock().unwrap().take() {
                bus_ref.unsubscribe(SERVER_READY, id);
            }
        });
        *slot.lock().unwrap() = Some(id);
        let endpoint = EndpointDescriptor::new("http://127.0.0.1:1", 1);
        assert_eq!(bus.publish(&BusEvent::ServerReady(endpoint)), 1);
        assert_eq!(bus.channel_count(), 0);
    }
}
