//! In-process event bus with channel-keyed fan-out
//!
//! Channels are plain strings (`containers`, `container-stats:<id>`,
//! `proxy:<ruleId>`, `proxy-analytics:<ruleId>`, `system`). Subscribing to
//! the wildcard member of a family (`proxy:*`) receives every publish to
//! that family. Delivery is synchronous and in subscription order; a
//! failing sink is logged and skipped so it never blocks the rest.
//!
//! Sinks are opaque callbacks. They hold no reference back to the
//! connection that registered them; a connection's subscriptions are
//! removed in one pass at disconnect via `drop_connection`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Well-known channel names and constructors
pub mod channels {
    pub const CONTAINERS: &str = "containers";
    pub const SYSTEM: &str = "system";

    pub fn proxy(rule_id: &str) -> String {
        format!("proxy:{}", rule_id)
    }

    pub fn proxy_analytics(rule_id: &str) -> String {
        format!("proxy-analytics:{}", rule_id)
    }

    pub fn container_stats(container_id: &str) -> String {
        format!("container-stats:{}", container_id)
    }
}

/// An event delivered to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    /// Event name, e.g. "rule:created" or "proxy:apply-failed"
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Callback invoked for each delivered event
///
/// Must not perform blocking I/O; push into a queue or channel instead.
pub type EventSink = Arc<dyn Fn(&str, &BusEvent) -> Result<()> + Send + Sync>;

struct SubscriberEntry {
    conn: String,
    sink: EventSink,
}

#[derive(Default)]
struct BusInner {
    /// channel -> subscribers in subscription order
    subscribers: HashMap<String, Vec<SubscriberEntry>>,
    /// connection -> channels it holds subscriptions on
    connections: HashMap<String, HashSet<String>>,
}

/// Channel-keyed publish/subscribe registry
#[derive(Default)]
pub struct EventBus {
    inner: RwLock<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for a channel on behalf of a connection
    ///
    /// Idempotent: a second subscribe for the same (connection, channel)
    /// pair is a no-op and keeps the original sink.
    pub fn subscribe(&self, conn: &str, channel: &str, sink: EventSink) {
        let mut inner = self.inner.write();

        let entries = inner.subscribers.entry(channel.to_string()).or_default();
        if entries.iter().any(|e| e.conn == conn) {
            debug!(conn, channel, "Already subscribed");
            return;
        }

        entries.push(SubscriberEntry {
            conn: conn.to_string(),
            sink,
        });
        inner
            .connections
            .entry(conn.to_string())
            .or_default()
            .insert(channel.to_string());

        debug!(conn, channel, "Subscribed");
    }

    /// Remove a connection's subscription on one channel; no-op if absent
    pub fn unsubscribe(&self, conn: &str, channel: &str) {
        let mut inner = self.inner.write();

        if let Some(entries) = inner.subscribers.get_mut(channel) {
            entries.retain(|e| e.conn != conn);
            if entries.is_empty() {
                inner.subscribers.remove(channel);
            }
        }

        let drop_conn = if let Some(chans) = inner.connections.get_mut(conn) {
            chans.remove(channel);
            chans.is_empty()
        } else {
            false
        };
        if drop_conn {
            inner.connections.remove(conn);
        }
    }

    /// Remove every subscription held by a connection in one pass
    pub fn drop_connection(&self, conn: &str) {
        let mut inner = self.inner.write();

        let Some(channels) = inner.connections.remove(conn) else {
            return;
        };

        for channel in &channels {
            if let Some(entries) = inner.subscribers.get_mut(channel) {
                entries.retain(|e| e.conn != conn);
                if entries.is_empty() {
                    inner.subscribers.remove(channel);
                }
            }
        }

        debug!(conn, channels = channels.len(), "Connection dropped");
    }

    /// Deliver an event to the channel's subscribers and to wildcard
    /// subscribers of the channel family
    ///
    /// Sinks run synchronously with the registry lock released, exact
    /// subscribers first and wildcard subscribers after, each group in
    /// subscription order. A sink error is contained to that subscriber.
    pub fn publish(&self, channel: &str, event: &BusEvent) {
        let targets: Vec<(String, EventSink)> = {
            let inner = self.inner.read();
            let mut targets = Vec::new();

            if let Some(entries) = inner.subscribers.get(channel) {
                for e in entries {
                    targets.push((e.conn.clone(), Arc::clone(&e.sink)));
                }
            }

            if let Some(wildcard) = family_wildcard(channel) {
                if let Some(entries) = inner.subscribers.get(&wildcard) {
                    for e in entries {
                        targets.push((e.conn.clone(), Arc::clone(&e.sink)));
                    }
                }
            }

            targets
        };

        for (conn, sink) in targets {
            if let Err(e) = sink(channel, event) {
                warn!(conn, channel, event = event.event, error = %e, "Event sink failed");
            }
        }
    }

    /// Number of subscribers currently attached to a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .read()
            .subscribers
            .get(channel)
            .map(|e| e.len())
            .unwrap_or(0)
    }
}

/// The wildcard channel covering a keyed channel, if it belongs to a family
///
/// "proxy:r1" -> Some("proxy:*"); "system" -> None; a publish directly to a
/// wildcard channel has no broader family.
fn family_wildcard(channel: &str) -> Option<String> {
    let (family, key) = channel.split_once(':')?;
    if key == "*" {
        return None;
    }
    Some(format!("{}:*", family))
}
