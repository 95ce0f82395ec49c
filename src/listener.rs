//! Listener interface and fan-out registry.
//!
//! Every decoded event is broadcast to all registered listeners in
//! registration order. Listeners implement only the callbacks they care about;
//! every method has a no-op default.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::error;

use crate::model::{ExportResponse, Row, ServerInfo};

/// Observer of inspector events.
///
/// Callbacks run on the connection's worker thread, one frame at a time. Slow
/// listeners delay the processing of later frames, so heavy work should be
/// handed off.
pub trait InspectorListener: Send + Sync {
    /// The protocol handshake completed and requests can be sent.
    fn on_ready(&self) {}

    /// The connection has been closed.
    fn on_closed(&self) {}

    fn on_server_info(&self, _server_info: &ServerInfo) {}

    fn on_filter_data(
        &self,
        _database_id: &str,
        _request_id: &str,
        _rows: &[Row],
        _columns: &[String],
    ) {
    }

    fn on_update_result(&self, _database_id: &str, _request_id: &str, _num_updated: i64) {}

    fn on_bulk_update_result(&self, _request_id: &str) {}

    /// The server rejected the request with the given id.
    fn on_error(&self, _request_id: &str, _message: &str) {}

    fn on_export_result(&self, _database_id: &str, _request_id: &str, _export: &ExportResponse) {}
}

/// A decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum InspectorEvent {
    Ready,
    Closed,
    ServerInfo(ServerInfo),
    FilterData {
        database_id: String,
        request_id: String,
        rows: Vec<Row>,
        columns: Vec<String>,
    },
    UpdateResult {
        database_id: String,
        request_id: String,
        num_updated: i64,
    },
    BulkUpdateResult {
        request_id: String,
    },
    Error {
        request_id: String,
        message: String,
    },
    ExportResult(ExportResponse),
}

impl InspectorEvent {
    /// Deliver this event to the matching callback of `listener`.
    pub fn dispatch(&self, listener: &dyn InspectorListener) {
        match self {
            InspectorEvent::Ready => listener.on_ready(),
            InspectorEvent::Closed => listener.on_closed(),
            InspectorEvent::ServerInfo(info) => listener.on_server_info(info),
            InspectorEvent::FilterData {
                database_id,
                request_id,
                rows,
                columns,
            } => listener.on_filter_data(database_id, request_id, rows, columns),
            InspectorEvent::UpdateResult {
                database_id,
                request_id,
                num_updated,
            } => listener.on_update_result(database_id, request_id, *num_updated),
            InspectorEvent::BulkUpdateResult { request_id } => {
                listener.on_bulk_update_result(request_id)
            }
            InspectorEvent::Error {
                request_id,
                message,
            } => listener.on_error(request_id, message),
            InspectorEvent::ExportResult(export) => {
                listener.on_export_result(&export.database_id, &export.request_id, export)
            }
        }
    }

    /// The request id this event answers, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            InspectorEvent::FilterData { request_id, .. }
            | InspectorEvent::UpdateResult { request_id, .. }
            | InspectorEvent::BulkUpdateResult { request_id }
            | InspectorEvent::Error { request_id, .. } => Some(request_id),
            InspectorEvent::ExportResult(export) => Some(&export.request_id),
            InspectorEvent::Ready | InspectorEvent::Closed | InspectorEvent::ServerInfo(_) => None,
        }
    }
}

/// Thread-safe ordered set of listeners.
///
/// Registration is deduplicated by `Arc` identity: registering the same
/// listener twice keeps a single entry, so it receives each event once.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<dyn InspectorListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Returns `false` if it was already registered.
    pub fn register(&self, listener: Arc<dyn InspectorListener>) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister(&self, listener: &Arc<dyn InspectorListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    fn is_registered(&self, listener: &Arc<dyn InspectorListener>) -> bool {
        self.listeners
            .lock()
            .iter()
            .any(|l| Arc::ptr_eq(l, listener))
    }

    /// Deliver `event` to every listener registered when the broadcast starts.
    ///
    /// The lock is not held while callbacks run, so listeners may register or
    /// unregister from inside a callback. A listener removed mid-broadcast is
    /// skipped from that point on. A panicking listener is logged and skipped.
    pub fn broadcast(&self, event: &InspectorEvent) {
        let snapshot: Vec<Arc<dyn InspectorListener>> = self.listeners.lock().clone();

        for listener in snapshot {
            if !self.is_registered(&listener) {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| event.dispatch(listener.as_ref())));
            if result.is_err() {
                error!("Listener panicked while handling {}", event_name(event));
            }
        }
    }
}

fn event_name(event: &InspectorEvent) -> &'static str {
    match event {
        InspectorEvent::Ready => "ready",
        InspectorEvent::Closed => "closed",
        InspectorEvent::ServerInfo(_) => "serverInfo",
        InspectorEvent::FilterData { .. } => "filterResult",
        InspectorEvent::UpdateResult { .. } => "updateResult",
        InspectorEvent::BulkUpdateResult { .. } => "bulkResponse",
        InspectorEvent::Error { .. } => "error",
        InspectorEvent::ExportResult(_) => "exportResult",
    }
}

/// Listener that forwards every event into a channel.
///
/// Useful for hosts that poll events from their own loop instead of reacting
/// inside callbacks.
pub struct ChannelListener {
    tx: UnboundedSender<InspectorEvent>,
}

impl ChannelListener {
    pub fn channel() -> (Arc<Self>, UnboundedReceiver<InspectorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, event: InspectorEvent) {
        // Receiver dropped means nobody is interested anymore.
        let _ = self.tx.send(event);
    }
}

impl InspectorListener for ChannelListener {
    fn on_ready(&self) {
        self.forward(InspectorEvent::Ready);
    }

    fn on_closed(&self) {
        self.forward(InspectorEvent::Closed);
    }

    fn on_server_info(&self, server_info: &ServerInfo) {
        self.forward(InspectorEvent::ServerInfo(server_info.clone()));
    }

    fn on_filter_data(&self, database_id: &str, request_id: &str, rows: &[Row], columns: &[String]) {
        self.forward(InspectorEvent::FilterData {
            database_id: database_id.to_string(),
            request_id: request_id.to_string(),
            rows: rows.to_vec(),
            columns: columns.to_vec(),
        });
    }

    fn on_update_result(&self, database_id: &str, request_id: &str, num_updated: i64) {
        self.forward(InspectorEvent::UpdateResult {
            database_id: database_id.to_string(),
            request_id: request_id.to_string(),
            num_updated,
        });
    }

    fn on_bulk_update_result(&self, request_id: &str) {
        self.forward(InspectorEvent::BulkUpdateResult {
            request_id: request_id.to_string(),
        });
    }

    fn on_error(&self, request_id: &str, message: &str) {
        self.forward(InspectorEvent::Error {
            request_id: request_id.to_string(),
            message: message.to_string(),
        });
    }

    fn on_export_result(&self, _database_id: &str, _request_id: &str, export: &ExportResponse) {
        self.forward(InspectorEvent::ExportResult(export.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        ready: AtomicUsize,
        errors: AtomicUsize,
    }

    impl InspectorListener for CountingListener {
        fn on_ready(&self) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _request_id: &str, _message: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Records the order in which listeners were called.
    struct OrderListener {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl InspectorListener for OrderListener {
        fn on_ready(&self) {
            self.log.lock().push(self.id);
        }
    }

    #[test]
    fn test_broadcast_reaches_all_in_registration_order() {
        let registry = ListenerRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            registry.register(Arc::new(OrderListener {
                id,
                log: Arc::clone(&log),
            }));
        }

        registry.broadcast(&InspectorEvent::Ready);

        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicate_registration_delivers_once() {
        let registry = ListenerRegistry::new();
        let listener = Arc::new(CountingListener::default());
        let as_dyn: Arc<dyn InspectorListener> = listener.clone();

        assert!(registry.register(Arc::clone(&as_dyn)));
        assert!(!registry.register(Arc::clone(&as_dyn)));
        assert_eq!(registry.len(), 1);

        registry.broadcast(&InspectorEvent::Ready);
        assert_eq!(listener.ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_stops_delivery() {
        let registry = ListenerRegistry::new();
        let listener = Arc::new(CountingListener::default());
        let as_dyn: Arc<dyn InspectorListener> = listener.clone();
        registry.register(Arc::clone(&as_dyn));

        assert!(registry.unregister(&as_dyn));
        assert!(!registry.unregister(&as_dyn));
        registry.broadcast(&InspectorEvent::Ready);

        assert_eq!(listener.ready.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    /// Unregisters another listener while handling the event.
    struct RemovingListener {
        registry: Arc<ListenerRegistry>,
        victim: Arc<dyn InspectorListener>,
    }

    impl InspectorListener for RemovingListener {
        fn on_ready(&self) {
            self.registry.unregister(&self.victim);
        }
    }

    #[test]
    fn test_unregister_during_broadcast_skips_removed_listener() {
        let registry = Arc::new(ListenerRegistry::new());
        let victim = Arc::new(CountingListener::default());
        let victim_dyn: Arc<dyn InspectorListener> = victim.clone();

        registry.register(Arc::new(RemovingListener {
            registry: Arc::clone(&registry),
            victim: Arc::clone(&victim_dyn),
        }));
        registry.register(Arc::clone(&victim_dyn));

        registry.broadcast(&InspectorEvent::Ready);

        assert_eq!(victim.ready.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 1);
    }

    /// Registers a new listener while handling the event.
    struct AddingListener {
        registry: Arc<ListenerRegistry>,
        added: Arc<CountingListener>,
    }

    impl InspectorListener for AddingListener {
        fn on_ready(&self) {
            self.registry.register(self.added.clone());
        }
    }

    #[test]
    fn test_register_during_broadcast_is_not_partially_delivered() {
        let registry = Arc::new(ListenerRegistry::new());
        let added = Arc::new(CountingListener::default());
        registry.register(Arc::new(AddingListener {
            registry: Arc::clone(&registry),
            added: Arc::clone(&added),
        }));

        registry.broadcast(&InspectorEvent::Ready);
        assert_eq!(added.ready.load(Ordering::SeqCst), 0);

        registry.broadcast(&InspectorEvent::Ready);
        assert_eq!(added.ready.load(Ordering::SeqCst), 1);
    }

    struct PanickingListener;

    impl InspectorListener for PanickingListener {
        fn on_ready(&self) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_panicking_listener_does_not_stop_broadcast() {
        let registry = ListenerRegistry::new();
        let listener = Arc::new(CountingListener::default());
        registry.register(Arc::new(PanickingListener));
        registry.register(listener.clone());

        registry.broadcast(&InspectorEvent::Ready);

        assert_eq!(listener.ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_methods_are_noops() {
        let listener = CountingListener::default();
        InspectorEvent::BulkUpdateResult {
            request_id: "r".to_string(),
        }
        .dispatch(&listener);
        InspectorEvent::Error {
            request_id: "r".to_string(),
            message: "boom".to_string(),
        }
        .dispatch(&listener);

        assert_eq!(listener.ready.load(Ordering::SeqCst), 0);
        assert_eq!(listener.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_listener_forwards_events() {
        let (listener, mut rx) = ChannelListener::channel();
        listener.on_update_result("db", "req-1", 3);
        listener.on_closed();

        assert_eq!(
            rx.try_recv().unwrap(),
            InspectorEvent::UpdateResult {
                database_id: "db".to_string(),
                request_id: "req-1".to_string(),
                num_updated: 3,
            }
        );
        assert_eq!(rx.try_recv().unwrap(), InspectorEvent::Closed);
        assert_eq!(InspectorEvent::Closed.request_id(), None);
    }
}
