//! Request/response registry.
//!
//! Outbound requests with a non-negative timeout are tracked by rid until
//! either a matching response arrives or the deadline passes. The completion
//! handler is invoked **exactly once**, with `Some(response)` on a match and
//! with `None` as the timeout/cancellation sentinel, never both.
//!
//! Fire-and-forget requests (`timeout < 0`) are never tracked.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

use crate::wire::{Request, Response};

/// Completion callback. `None` signals timeout/cancellation.
pub type Handler = Box<dyn FnOnce(Option<Response>) + Send>;

struct Pending {
    issued: Instant,
    timeout: Duration,
    handler: Option<Handler>,
}

/// Pending-request index, owned and touched only by its connection's loop.
#[derive(Default)]
pub struct RequestMap {
    pending: HashMap<String, Pending>,
}

impl RequestMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a request with a fresh rid and, when `timeout_secs >= 0`, track
    /// it with `handler`. Returns the request ready to be sent.
    pub fn prepare(
        &mut self,
        name: &str,
        payload: Value,
        timeout_secs: i64,
        handler: Option<Handler>,
    ) -> Request {
        let rid = Uuid::new_v4().to_string();
        if timeout_secs >= 0 {
            self.pending.insert(
                rid.clone(),
                Pending {
                    issued: Instant::now(),
                    timeout: Duration::from_secs(timeout_secs as u64),
                    handler,
                },
            );
        }
        Request {
            rid,
            timeout: timeout_secs,
            name: name.to_string(),
            payload,
        }
    }

    /// Resolve a response against its pending entry. Unsolicited responses
    /// are logged and discarded.
    pub fn dispatch(&mut self, response: Response) {
        match self.pending.remove(&response.rid) {
            Some(entry) => {
                if let Some(handler) = entry.handler {
                    handler(Some(response));
                }
            }
            None => log::warn!("received unsolicited response, ignored"),
        }
    }

    /// Expire entries past their deadline, invoking each handler with the
    /// `None` sentinel. Called once per loop tick.
    pub fn scan_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.issued) > p.timeout)
            .map(|(rid, _)| rid.clone())
            .collect();
        for rid in expired {
            if let Some(entry) = self.pending.remove(&rid) {
                match entry.handler {
                    Some(handler) => handler(None),
                    None => log::error!("request {rid} timeout"),
                }
            }
        }
    }

    /// Drop every pending entry without invoking handlers. Used on reset,
    /// when the connection the responses would have arrived on is gone.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_handler(count: Arc<AtomicUsize>, expect_some: bool) -> Handler {
        Box::new(move |resp| {
            assert_eq!(resp.is_some(), expect_some);
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fire_and_forget_is_not_tracked() {
        let mut map = RequestMap::new();
        map.prepare("clear_to_upload", Value::Null, -1, None);
        assert!(map.is_empty());
    }

    #[test]
    fn response_resolves_exactly_once() {
        let mut map = RequestMap::new();
        let count = Arc::new(AtomicUsize::new(0));
        let req = map.prepare(
            "ping",
            Value::Null,
            60,
            Some(counting_handler(count.clone(), true)),
        );
        assert_eq!(map.len(), 1);

        map.dispatch(Response {
            rid: req.rid.clone(),
            status: Status::Success,
            payload: Value::Null,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(map.is_empty());

        // A second response (or later scan) must not fire again.
        map.dispatch(Response {
            rid: req.rid,
            status: Status::Success,
            payload: Value::Null,
        });
        map.scan_timeouts();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_timeout_expires_with_none() {
        let mut map = RequestMap::new();
        let count = Arc::new(AtomicUsize::new(0));
        map.prepare(
            "ping",
            Value::Null,
            0,
            Some(counting_handler(count.clone(), false)),
        );
        // Deadline is now; a strictly-later scan expires it.
        std::thread::sleep(Duration::from_millis(20));
        map.scan_timeouts();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn unexpired_entry_survives_scan() {
        let mut map = RequestMap::new();
        let count = Arc::new(AtomicUsize::new(0));
        map.prepare(
            "register",
            Value::Null,
            60,
            Some(counting_handler(count.clone(), true)),
        );
        map.scan_timeouts();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn clear_drops_without_invoking() {
        let mut map = RequestMap::new();
        let count = Arc::new(AtomicUsize::new(0));
        map.prepare(
            "ping",
            Value::Null,
            60,
            Some(Box::new({
                let count = count.clone();
                move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })),
        );
        map.clear();
        assert!(map.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rids_are_unique() {
        let mut map = RequestMap::new();
        let a = map.prepare("a", Value::Null, 10, None);
        let b = map.prepare("b", Value::Null, 10, None);
        assert_ne!(a.rid, b.rid);
        assert_eq!(map.len(), 2);
    }
}
