//! Flow model and the bounded flow registry.
//!
//! A [`Flow`] is one observed request/response transaction through the proxy.
//! The [`FlowStore`] assigns monotonically increasing ids starting at 1 and
//! evicts the oldest entries once its capacity is exceeded, so memory stays
//! bounded no matter how long the proxy runs.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Default number of flows retained before eviction kicks in.
pub const DEFAULT_CAPACITY: usize = 2000;

/// URL scheme of an observed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    /// Plain HTTP.
    #[default]
    Http,
    /// HTTPS (tunneled or terminated).
    Https,
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

/// One half of an HTTP exchange: ordered headers plus an opaque body.
///
/// Headers preserve arrival order; lookups are case-insensitive and emission
/// may re-case names.
#[derive(Debug, Clone)]
pub struct Message {
    /// Header (name, value) pairs in arrival order.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes.
    pub body: Bytes,
    /// Protocol version, e.g. "1.1".
    pub http_version: String,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            body: Bytes::new(),
            http_version: "1.1".to_string(),
        }
    }
}

/// The unit of observation: one request/response transaction.
///
/// A flow is created once a request line and its headers have parsed, mutated
/// only by the connection handler that owns it, and finalized when that
/// handler exits.
#[derive(Debug, Clone)]
pub struct Flow {
    /// Unique id, monotonically increasing per process, starting at 1.
    pub id: u64,
    /// HTTP method.
    pub method: String,
    /// URL scheme.
    pub scheme: Scheme,
    /// Target host (without port).
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Request target as received on the request line.
    pub path: String,
    /// Response status, once known.
    pub status_code: Option<u16>,
    /// When the flow entered the pipeline.
    pub started_at: DateTime<Utc>,
    /// When the owning handler exited, on any path.
    pub finished_at: Option<DateTime<Utc>>,
    /// The request message.
    pub request: Message,
    /// The response message.
    pub response: Message,
    /// Terminal error, if the flow did not complete normally.
    pub error: Option<String>,
    /// Response body size in bytes.
    pub size: usize,
}

impl Flow {
    fn new(id: u64) -> Self {
        Self {
            id,
            method: String::new(),
            scheme: Scheme::Http,
            host: String::new(),
            port: 80,
            path: "/".to_string(),
            status_code: None,
            started_at: Utc::now(),
            finished_at: None,
            request: Message::default(),
            response: Message::default(),
            error: None,
            size: 0,
        }
    }

    /// Elapsed milliseconds between start and finish, or until now for a
    /// flow still in flight.
    pub fn duration_ms(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds()
    }
}

/// Bounded registry of observed flows.
///
/// Keeps an id-to-flow map plus an insertion-ordered id list. The map's id
/// domain always equals the order list's, the list never exceeds capacity,
/// and ids are never reused.
#[derive(Debug)]
pub struct FlowStore {
    capacity: usize,
    next_id: u64,
    flows: HashMap<u64, Flow>,
    order: VecDeque<u64>,
}

impl Default for FlowStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl FlowStore {
    /// Create a store that evicts its oldest flow beyond `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: 1,
            flows: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Allocate the next id and register a fresh flow at the tail of the
    /// access order, evicting from the head while over capacity.
    pub fn new_flow(&mut self) -> Flow {
        let id = self.next_id;
        self.next_id += 1;
        let flow = Flow::new(id);
        self.flows.insert(id, flow.clone());
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.flows.remove(&old);
            }
        }
        flow
    }

    /// Look up a flow by id.
    pub fn get(&self, id: u64) -> Option<&Flow> {
        self.flows.get(&id)
    }

    /// All retained flows in current access order.
    pub fn all(&self) -> Vec<&Flow> {
        self.order.iter().filter_map(|id| self.flows.get(id)).collect()
    }

    /// Replace the stored record for `flow.id` and mark it most recently
    /// touched. A flow that has been evicted is not re-inserted.
    pub fn update(&mut self, flow: Flow) {
        if !self.flows.contains_key(&flow.id) {
            return;
        }
        self.order.retain(|id| *id != flow.id);
        self.order.push_back(flow.id);
        self.flows.insert(flow.id, flow);
    }

    /// Number of retained flows.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let mut store = FlowStore::new(10);
        let ids: Vec<u64> = (0..5).map(|_| store.new_flow().id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn eviction_drops_oldest() {
        let mut store = FlowStore::new(3);
        for _ in 0..5 {
            store.new_flow();
        }
        let ids: Vec<u64> = store.all().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert!(store.get(1).is_none());
        assert!(store.get(2).is_none());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn ids_are_not_reused_after_eviction() {
        let mut store = FlowStore::new(2);
        for _ in 0..4 {
            store.new_flow();
        }
        assert_eq!(store.new_flow().id, 5);
    }

    #[test]
    fn update_replaces_record_and_moves_to_tail() {
        let mut store = FlowStore::new(10);
        let mut first = store.new_flow();
        store.new_flow();
        first.method = "POST".to_string();
        store.update(first);

        let ids: Vec<u64> = store.all().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(store.get(1).map(|f| f.method.as_str()), Some("POST"));
    }

    #[test]
    fn update_of_evicted_flow_is_ignored() {
        let mut store = FlowStore::new(1);
        let evicted = store.new_flow();
        store.new_flow();
        store.update(evicted);
        assert!(store.get(1).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duration_uses_finish_timestamp_when_set() {
        let mut flow = Flow::new(1);
        flow.finished_at = Some(flow.started_at + chrono::Duration::milliseconds(250));
        assert_eq!(flow.duration_ms(), 250);
    }
}
