//! Pending request/reply table.
//!
//! Each outstanding request is keyed by the request's message id. A reply
//! carrying that id as `ResponseMessageId` is decoded and handed to the
//! request's reply callback; once `endpoints_count` replies were processed
//! the entry is removed and its completion callback runs. Requests without
//! an expected count stay open until they are removed on timeout.
//!
//! A reply that comes back through the retry queue keeps its `MessageId`
//! and is counted once. Callbacks run outside the table's locks, so they may
//! issue new requests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{codec, Message};

type ReplyFn = Box<dyn FnMut(&[u8]) -> Result<(), serde_json::Error> + Send + Sync>;
type CompleteFn = Box<dyn FnOnce() + Send + Sync>;

/// One outstanding request.
pub(crate) struct RequestConfiguration {
    /// Replies expected; `None` means unbounded.
    endpoints_count: Option<usize>,
    processed_count: usize,
    processed_ids: HashSet<Uuid>,
    on_reply: ReplyFn,
    on_complete: Option<CompleteFn>,
}

impl RequestConfiguration {
    pub(crate) fn new<P, R, C>(endpoints_count: Option<usize>, mut on_reply: R, on_complete: C) -> Self
    where
        P: Message,
        R: FnMut(P) + Send + Sync + 'static,
        C: FnOnce() + Send + Sync + 'static,
    {
        Self {
            endpoints_count,
            processed_count: 0,
            processed_ids: HashSet::new(),
            on_reply: Box::new(move |body: &[u8]| {
                on_reply(codec::deserialize::<P>(body)?);
                Ok(())
            }),
            on_complete: Some(Box::new(on_complete)),
        }
    }

    fn is_complete(&self) -> bool {
        self.endpoints_count == Some(self.processed_count)
    }
}

type SharedRequest = Arc<Mutex<RequestConfiguration>>;

fn lock(request: &SharedRequest) -> MutexGuard<'_, RequestConfiguration> {
    request.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outstanding requests of one bus.
#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: DashMap<Uuid, SharedRequest>,
}

impl PendingRequests {
    pub(crate) fn insert(&self, request_id: Uuid, request: RequestConfiguration) {
        self.entries.insert(request_id, Arc::new(Mutex::new(request)));
    }

    pub(crate) fn remove(&self, request_id: Uuid) -> bool {
        self.entries.remove(&request_id).is_some()
    }

    pub(crate) fn contains(&self, request_id: Uuid) -> bool {
        self.entries.contains_key(&request_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Match a reply. Returns `false` when no request is waiting for it.
    ///
    /// `reply_id` is the reply's own `MessageId`; a reply already counted
    /// under that id is acknowledged without running the callback again.
    pub(crate) fn reply(
        &self,
        request_id: Uuid,
        reply_id: Option<Uuid>,
        body: &[u8],
    ) -> Result<bool, serde_json::Error> {
        // No shard lock may be held while callbacks run.
        let Some(request) = self.entries.get(&request_id).map(|e| Arc::clone(e.value())) else {
            return Ok(false);
        };

        let on_complete = {
            let mut entry = lock(&request);
            if entry.is_complete() {
                return Ok(false);
            }
            if let Some(id) = reply_id {
                if entry.processed_ids.contains(&id) {
                    debug!(request_id = %request_id, reply_id = %id, "Duplicate reply ignored");
                    return Ok(true);
                }
            }
            (entry.on_reply)(body)?;
            entry.processed_count += 1;
            if let Some(id) = reply_id {
                entry.processed_ids.insert(id);
            }
            debug!(
                request_id = %request_id,
                processed = entry.processed_count,
                expected = ?entry.endpoints_count,
                "Reply matched"
            );
            if entry.is_complete() {
                entry.on_complete.take()
            } else {
                None
            }
        };

        if let Some(on_complete) = on_complete {
            self.entries.remove(&request_id);
            on_complete();
        }
        Ok(true)
    }

    /// Remove `request_id` after `timeout` if it is still pending.
    pub(crate) fn expire_after(self: &Arc<Self>, request_id: Uuid, timeout: Duration) {
        let pending = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if pending.remove(request_id) {
                warn!(request_id = %request_id, "Request expired before all replies arrived");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Counter, PaymentReceived};

    fn reply_body(order_id: &str) -> Vec<u8> {
        codec::serialize(&PaymentReceived {
            correlation_id: Uuid::new_v4(),
            order_id: order_id.into(),
        })
        .unwrap()
    }

    #[test]
    fn test_completes_after_expected_replies() {
        let pending = PendingRequests::default();
        let replies = Arc::new(Mutex::new(Vec::new()));
        let completed = Counter::new();
        let id = Uuid::new_v4();

        let sink = replies.clone();
        let done = completed.clone();
        pending.insert(
            id,
            RequestConfiguration::new(
                Some(2),
                move |reply: PaymentReceived| sink.lock().unwrap().push(reply.order_id),
                move || done.incr(),
            ),
        );

        assert!(pending.reply(id, None, &reply_body("b")).unwrap());
        assert_eq!(completed.get(), 0);
        assert!(pending.contains(id));

        assert!(pending.reply(id, None, &reply_body("a")).unwrap());
        assert_eq!(completed.get(), 1);
        assert!(!pending.contains(id));
        assert_eq!(*replies.lock().unwrap(), vec!["b", "a"]);

        assert!(!pending.reply(id, None, &reply_body("late")).unwrap());
        assert_eq!(completed.get(), 1);
    }

    #[test]
    fn test_redelivered_reply_is_counted_once() {
        let pending = PendingRequests::default();
        let replies = Arc::new(Mutex::new(Vec::new()));
        let completed = Counter::new();
        let id = Uuid::new_v4();

        let sink = replies.clone();
        let done = completed.clone();
        pending.insert(
            id,
            RequestConfiguration::new(
                Some(2),
                move |reply: PaymentReceived| sink.lock().unwrap().push(reply.order_id),
                move || done.incr(),
            ),
        );

        let first = Some(Uuid::new_v4());
        assert!(pending.reply(id, first, &reply_body("a")).unwrap());
        assert!(pending.reply(id, first, &reply_body("a")).unwrap());
        assert_eq!(completed.get(), 0);
        assert!(pending.contains(id));

        assert!(pending
            .reply(id, Some(Uuid::new_v4()), &reply_body("b"))
            .unwrap());
        assert_eq!(completed.get(), 1);
        assert_eq!(*replies.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_callbacks_may_use_the_table() {
        let pending = Arc::new(PendingRequests::default());
        let id = Uuid::new_v4();
        let follow_up = Uuid::new_v4();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let table = pending.clone();
        let sink = seen.clone();
        let on_reply = move |_: PaymentReceived| {
            sink.lock().unwrap().push(table.len());
            table.insert(
                follow_up,
                RequestConfiguration::new(Some(1), |_: PaymentReceived| {}, || {}),
            );
        };
        let table = pending.clone();
        let sink = seen.clone();
        let on_complete = move || sink.lock().unwrap().push(table.len());
        pending.insert(id, RequestConfiguration::new(Some(1), on_reply, on_complete));

        assert!(pending.reply(id, None, &reply_body("a")).unwrap());
        assert_eq!(*seen.lock().unwrap(), vec![1, 1]);
        assert!(!pending.contains(id));
        assert!(pending.contains(follow_up));
    }

    #[test]
    fn test_unbounded_request_never_completes() {
        let pending = PendingRequests::default();
        let completed = Counter::new();
        let done = completed.clone();
        let id = Uuid::new_v4();
        pending.insert(
            id,
            RequestConfiguration::new(None, |_: PaymentReceived| {}, move || done.incr()),
        );

        for _ in 0..5 {
            pending.reply(id, None, &reply_body("x")).unwrap();
        }
        assert_eq!(completed.get(), 0);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_undecodable_reply_is_not_counted() {
        let pending = PendingRequests::default();
        let id = Uuid::new_v4();
        pending.insert(
            id,
            RequestConfiguration::new(Some(1), |_: PaymentReceived| {}, || {}),
        );
        assert!(pending.reply(id, None, b"garbage").is_err());
        assert!(pending.contains(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_request_is_removed() {
        let pending = Arc::new(PendingRequests::default());
        let id = Uuid::new_v4();
        pending.insert(
            id,
            RequestConfiguration::new(Some(1), |_: PaymentReceived| {}, || {}),
        );
        pending.expire_after(id, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!pending.contains(id));
    }
}
