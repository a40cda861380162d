use crate::errors::{CallError, PostmanError, PostmanResult};
use crate::messages::Response;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome delivered to a caller waiting on a [`PendingReply`].
pub type Reply = Result<Response, CallError>;

#[derive(Debug)]
struct PendingCall {
    deadline: Instant,
    sink: oneshot::Sender<Reply>,
}

impl PendingCall {
    fn signal(self, id: &str, reply: Reply) {
        if self.sink.send(reply).is_err() {
            debug!("Caller of {} is gone", id);
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    calls: HashMap<String, PendingCall>,
    closed: bool,
}

/// Pairs outbound request ids with the callers waiting for their responses.
///
/// Every registered call ends in exactly one of: completed, cancelled,
/// timed out or connection closed. The terminal transition removes the entry
/// under the lock, so whichever transition takes the lock first wins and the
/// others find nothing to do.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    pending: Mutex<Pending>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        CorrelationRegistry::default()
    }

    pub fn register<STR: Into<String>>(
        &self,
        id: STR,
        deadline: Instant,
    ) -> PostmanResult<PendingReply> {
        let id = id.into();
        let mut pending = self.pending.lock();
        if pending.closed {
            return Err(PostmanError::Call(CallError::ConnectionClosed));
        }
        if pending.calls.contains_key(&id) {
            debug!("Pending call for id {} already exists", id);
            return Err(PostmanError::DuplicateRequestId(id));
        }
        let (sink, receiver) = oneshot::channel();
        pending
            .calls
            .insert(id.clone(), PendingCall { deadline, sink });
        Ok(PendingReply { id, receiver })
    }

    /// Hands `response` to the caller waiting on `id`. Returns `false` for
    /// late or duplicate responses, which are dropped.
    pub fn complete(&self, id: &str, response: Response) -> bool {
        let call = self.pending.lock().calls.remove(id);
        match call {
            Some(call) => {
                call.signal(id, Ok(response));
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, id: &str) -> bool {
        let call = self.pending.lock().calls.remove(id);
        match call {
            Some(call) => {
                debug!("Cancelling call {}", id);
                call.signal(id, Err(CallError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Times out every call whose deadline is not after `now`.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(String, PendingCall)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .calls
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.calls.remove(&id).map(|call| (id, call)))
                .collect()
        };
        let count = expired.len();
        for (id, call) in expired {
            debug!("Call {} timed out", id);
            call.signal(&id, Err(CallError::Timeout));
        }
        count
    }

    /// Fails all pending calls with [`CallError::ConnectionClosed`] and
    /// refuses new registrations.
    pub fn close_all(&self) -> usize {
        let calls: Vec<(String, PendingCall)> = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            pending.calls.drain().collect()
        };
        let count = calls.len();
        for (id, call) in calls {
            call.signal(&id, Err(CallError::ConnectionClosed));
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.lock().calls.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().calls.is_empty()
    }
}

/// Caller side of a registered call.
#[derive(Debug, Getters)]
pub struct PendingReply {
    #[get = "pub"]
    id: String,
    receiver: oneshot::Receiver<Reply>,
}

impl PendingReply {
    pub async fn wait(self) -> Reply {
        self.receiver
            .await
            .unwrap_or(Err(CallError::ConnectionClosed))
    }
}

/// Background task expiring overdue calls.
pub struct Reaper;

impl Reaper {
    pub fn spawn(
        registry: Arc<CorrelationRegistry>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!("Starting reaper ({:?} tick)", interval);
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = registry.expire(Instant::now());
                        if expired > 0 {
                            trace!("Reaper expired {} calls", expired);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("Reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::STATUS_OK;
    use tokio_test::*;

    fn response(id: &str) -> Response {
        Response::new(id, STATUS_OK, "pong")
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn completes_waiting_call() {
        // Given
        let registry = CorrelationRegistry::new();
        let reply = registry.register("X", later()).unwrap();

        // When
        let completed = registry.complete("X", response("X"));

        // Then
        assert!(completed);
        assert!(registry.is_empty());
        assert_eq!(Ok(response("X")), block_on(reply.wait()));
    }

    #[test]
    fn unknown_response_is_dropped() {
        let registry = CorrelationRegistry::new();
        let reply = registry.register("X", later()).unwrap();

        assert!(!registry.complete("Z", response("Z")));
        assert!(registry.contains("X"));
        assert!(registry.cancel("X"));
        assert_eq!(Err(CallError::Cancelled), block_on(reply.wait()));
    }

    #[test]
    fn duplicate_id_is_refused() {
        let registry = CorrelationRegistry::new();
        let _reply = registry.register("X", later()).unwrap();

        assert_eq!(
            PostmanError::DuplicateRequestId("X".to_string()),
            registry.register("X", later()).unwrap_err()
        );
        assert_eq!(1, registry.len());
    }

    #[test]
    fn late_response_after_cancel_is_noop() {
        let registry = CorrelationRegistry::new();
        let reply = registry.register("X", later()).unwrap();

        assert!(registry.cancel("X"));
        assert!(!registry.complete("X", response("X")));
        assert!(!registry.cancel("X"));
        assert_eq!(Err(CallError::Cancelled), block_on(reply.wait()));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_only_overdue_calls() {
        // Given
        let registry = CorrelationRegistry::new();
        let short = registry
            .register("short", Instant::now() + Duration::from_millis(50))
            .unwrap();
        let long = registry.register("long", later()).unwrap();

        // When
        tokio::time::advance(Duration::from_millis(50)).await;
        let expired = registry.expire(Instant::now());

        // Then
        assert_eq!(1, expired);
        assert_eq!(Err(CallError::Timeout), short.wait().await);
        assert!(registry.contains("long"));
        assert!(registry.complete("long", response("long")));
        assert_ok!(long.wait().await);
    }

    #[test]
    fn close_all_fails_pending_and_future_calls() {
        let registry = CorrelationRegistry::new();
        let replies: Vec<PendingReply> = (0..5)
            .map(|i| registry.register(i.to_string(), later()).unwrap())
            .collect();

        assert_eq!(5, registry.close_all());
        assert_eq!(0, registry.close_all());

        for reply in replies {
            assert_eq!(Err(CallError::ConnectionClosed), block_on(reply.wait()));
        }
        assert_eq!(
            PostmanError::Call(CallError::ConnectionClosed),
            registry.register("late", later()).unwrap_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_times_out_calls() {
        // Given
        let registry = Arc::new(CorrelationRegistry::new());
        let shutdown = CancellationToken::new();
        let reaper = Reaper::spawn(registry.clone(), Duration::from_millis(100), shutdown.clone());
        let reply = registry
            .register("Y", Instant::now() + Duration::from_millis(50))
            .unwrap();

        // When
        let outcome = reply.wait().await;

        // Then
        assert_eq!(Err(CallError::Timeout), outcome);
        shutdown.cancel();
        assert_ok!(reaper.await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_transitions_signal_each_call_once() {
        // Given
        let registry = Arc::new(CorrelationRegistry::new());
        let ids: Vec<String> = (0..1000).map(|i| format!("call-{}", i)).collect();
        let replies: Vec<PendingReply> = ids
            .iter()
            .map(|id| registry.register(id.clone(), Instant::now()).unwrap())
            .collect();

        // When
        let completer = {
            let (registry, ids) = (registry.clone(), ids.clone());
            tokio::spawn(async move {
                let mut won = 0usize;
                for id in ids.iter() {
                    if registry.complete(id, response(id)) {
                        won += 1;
                    }
                    tokio::task::yield_now().await;
                }
                won
            })
        };
        let canceller = {
            let (registry, ids) = (registry.clone(), ids.clone());
            tokio::spawn(async move {
                let mut won = 0usize;
                for id in ids.iter().rev() {
                    if registry.cancel(id) {
                        won += 1;
                    }
                    tokio::task::yield_now().await;
                }
                won
            })
        };
        let expirer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let mut won = 0usize;
                for _ in 0..10 {
                    won += registry.expire(Instant::now());
                    tokio::task::yield_now().await;
                }
                won
            })
        };
        let closer = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                registry.close_all()
            })
        };
        let completed = completer.await.unwrap();
        let cancelled = canceller.await.unwrap();
        let expired = expirer.await.unwrap();
        let closed = closer.await.unwrap();

        // Then
        assert_eq!(ids.len(), completed + cancelled + expired + closed);
        let mut outcomes = HashMap::new();
        for reply in replies {
            let outcome = match reply.wait().await {
                Ok(_) => "completed",
                Err(CallError::Cancelled) => "cancelled",
                Err(CallError::Timeout) => "expired",
                Err(CallError::ConnectionClosed) => "closed",
            };
            *outcomes.entry(outcome).or_insert(0usize) += 1;
        }
        assert_eq!(completed, outcomes.get("completed").copied().unwrap_or(0));
        assert_eq!(cancelled, outcomes.get("cancelled").copied().unwrap_or(0));
        assert_eq!(expired, outcomes.get("expired").copied().unwrap_or(0));
        assert_eq!(closed, outcomes.get("closed").copied().unwrap_or(0));
        assert!(registry.is_empty());
    }
}

