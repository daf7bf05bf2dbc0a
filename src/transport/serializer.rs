//! Single-flight operation queue for links that can only process one operation at a time.
//!
//! Work is submitted with a start function. Items are started strictly in submission order and
//! only after the previous one has been completed, either by the transport reporting completion,
//! by the item's own timer, or by the start function refusing to dispatch. Each item resolves
//! exactly once; completions that arrive for an item that is no longer current are dropped.
//!
//! One serializer belongs to one connection. [`TransportSerializer::lost_link`] fails everything
//! outstanding but keeps accepting work (so the owner can queue a reconnect), while
//! [`TransportSerializer::close`] additionally rejects all further submissions.

use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::metrics;

pub type WorkId = u64;

type StartFn = Box<dyn FnOnce(WorkId) -> bool + Send>;
type Completion<T> = oneshot::Sender<Result<T, TransportError>>;

struct WorkItem<T> {
    id: WorkId,
    tag: String,
    start: StartFn,
    timeout: Option<Duration>,
    completion: Completion<T>,
}

struct Current<T> {
    id: WorkId,
    tag: String,
    completion: Completion<T>,
    timer: Option<JoinHandle<()>>,
}

struct Inner<T> {
    queue: VecDeque<WorkItem<T>>,
    current: Option<Current<T>>,
    next_id: WorkId,
    closed: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    handle: Handle,
}

pub struct TransportSerializer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TransportSerializer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Future for one submitted item.
pub struct PendingWork<T> {
    id: WorkId,
    rx: oneshot::Receiver<Result<T, TransportError>>,
}

impl<T> PendingWork<T> {
    pub fn id(&self) -> WorkId {
        self.id
    }
}

impl<T> Future for PendingWork<T> {
    type Output = Result<T, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> TransportSerializer<T> {
    /// Must be called from within a tokio runtime; per-item timers are spawned on it.
    pub fn new() -> Self {
        Self::with_handle(Handle::current())
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    current: None,
                    next_id: 1,
                    closed: false,
                }),
                handle,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an operation. `start` runs when the item becomes current and returns whether the
    /// operation was handed to the link. The item is queued immediately; awaiting the returned
    /// future only observes the result.
    pub fn submit<F>(
        &self,
        tag: impl Into<String>,
        start: F,
        timeout: Option<Duration>,
    ) -> PendingWork<T>
    where
        F: FnOnce(WorkId) -> bool + Send + 'static,
    {
        let tag = tag.into();
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            if inner.closed {
                let _ = tx.send(Err(TransportError::Closed));
                return PendingWork { id, rx };
            }
            trace!("queue work id={} tag={} depth={}", id, tag, inner.queue.len());
            inner.queue.push_back(WorkItem {
                id,
                tag,
                start: Box::new(start),
                timeout: timeout.filter(|d| !d.is_zero()),
                completion: tx,
            });
            id
        };
        self.pump();
        PendingWork { id, rx }
    }

    /// Submit and wait at most `bound` for the result. An elapsed bound reports a timeout to the
    /// caller but leaves the item to its own completion or timer.
    pub async fn submit_bounded<F>(
        &self,
        tag: impl Into<String>,
        start: F,
        timeout: Option<Duration>,
        bound: Duration,
    ) -> Result<T, TransportError>
    where
        F: FnOnce(WorkId) -> bool + Send + 'static,
    {
        let tag = tag.into();
        let work = self.submit(tag.clone(), start, timeout);
        match tokio::time::timeout(bound, work).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(tag)),
        }
    }

    /// Start queued items until one is in flight or the queue is empty.
    fn pump(&self) {
        loop {
            let (id, tag, start, timeout) = {
                let mut inner = self.lock();
                if inner.current.is_some() || inner.closed {
                    return;
                }
                let Some(item) = inner.queue.pop_front() else {
                    return;
                };
                inner.current = Some(Current {
                    id: item.id,
                    tag: item.tag.clone(),
                    completion: item.completion,
                    timer: None,
                });
                (item.id, item.tag, item.start, item.timeout)
            };

            debug!("start work id={} tag={}", id, tag);
            metrics::inc_transport_dispatched();
            if !start(id) {
                warn!("work id={} tag={} refused by link", id, tag);
                self.complete(id, Err(TransportError::DispatchFailed(tag)));
                continue;
            }

            if let Some(timeout) = timeout {
                let mut inner = self.lock();
                if let Some(current) = inner.current.as_mut().filter(|c| c.id == id) {
                    current.timer = Some(self.arm_timer(id, tag, timeout));
                }
            }
            // Either the item is in flight, or it completed synchronously and the nested
            // completion already started its successor.
            return;
        }
    }

    fn arm_timer(&self, id: WorkId, tag: String, timeout: Duration) -> JoinHandle<()> {
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        self.shared.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                warn!("work id={} tag={} timed out after {:?}", id, tag, timeout);
                metrics::inc_transport_timed_out();
                TransportSerializer { shared }.complete(id, Err(TransportError::Timeout(tag)));
            }
        })
    }

    /// Resolve item `id` if it is still current. Returns whether it was.
    pub fn complete(&self, id: WorkId, result: Result<T, TransportError>) -> bool {
        let current = {
            let mut inner = self.lock();
            let in_flight = inner.current.as_ref().map(|c| (c.id, c.tag.clone()));
            match in_flight {
                Some((cid, _)) if cid == id => inner.current.take(),
                Some((cid, tag)) => {
                    warn!(
                        "ignoring completion for id={} (current id={} tag={})",
                        id, cid, tag
                    );
                    None
                }
                None => {
                    warn!("ignoring completion for id={} with nothing in flight", id);
                    None
                }
            }
        };
        let Some(current) = current else {
            return false;
        };
        if let Some(timer) = current.timer {
            timer.abort();
        }
        match &result {
            Ok(_) => trace!("work id={} tag={} done", id, current.tag),
            Err(e) => {
                if !e.is_timeout() {
                    metrics::inc_transport_failed();
                }
                debug!("work id={} tag={} failed: {}", id, current.tag, e);
            }
        }
        let _ = current.completion.send(result);
        self.pump();
        true
    }

    /// Resolve whatever is in flight; for links that cannot correlate completions.
    pub fn complete_current(&self, result: Result<T, TransportError>) -> bool {
        let id = self.lock().current.as_ref().map(|c| c.id);
        match id {
            Some(id) => self.complete(id, result),
            None => {
                warn!("completion reported with nothing in flight");
                false
            }
        }
    }

    /// Map a link status onto the current item: 0 succeeds with `value`, anything else fails.
    pub fn complete_current_status(&self, status: i32, value: T) -> bool {
        if status == 0 {
            self.complete_current(Ok(value))
        } else {
            self.complete_current(Err(TransportError::Status(status)))
        }
    }

    /// Fail every queued and in-flight item. Submissions are still accepted afterwards.
    pub fn lost_link(&self, reason: &str) {
        let (current, queued) = {
            let mut inner = self.lock();
            (inner.current.take(), std::mem::take(&mut inner.queue))
        };
        if current.is_some() || !queued.is_empty() {
            debug!(
                "lost link ({}): failing {} queued + {} in flight",
                reason,
                queued.len(),
                usize::from(current.is_some())
            );
        }
        if let Some(current) = current {
            if let Some(timer) = current.timer {
                timer.abort();
            }
            let _ = current
                .completion
                .send(Err(TransportError::LinkClosing(reason.to_string())));
        }
        for item in queued {
            let _ = item
                .completion
                .send(Err(TransportError::LinkClosing(reason.to_string())));
        }
    }

    /// Fail everything and refuse further work.
    pub fn close(&self) {
        self.lock().closed = true;
        self.lost_link("closing");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.lock();
        inner.current.is_none() && inner.queue.is_empty()
    }

    /// Queued items plus the one in flight.
    pub fn pending_len(&self) -> usize {
        let inner = self.lock();
        inner.queue.len() + usize::from(inner.current.is_some())
    }

    pub fn current_id(&self) -> Option<WorkId> {
        self.lock().current.as_ref().map(|c| c.id)
    }
}

impl<T: Send + 'static> Default for TransportSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn completes_in_fifo_order() {
        let ser: TransportSerializer<u32> = TransportSerializer::new();
        let a = ser.submit("a", |_| true, None);
        let b = ser.submit("b", |_| true, None);
        assert_eq!(ser.current_id(), Some(a.id()));
        assert!(ser.complete_current(Ok(1)));
        assert_eq!(ser.current_id(), Some(b.id()));
        assert!(ser.complete_current(Ok(2)));
        assert_eq!(a.await, Ok(1));
        assert_eq!(b.await, Ok(2));
        assert!(ser.is_idle());
    }

    #[tokio::test]
    async fn refused_start_fails_and_advances() {
        let ser: TransportSerializer<()> = TransportSerializer::new();
        let started = Arc::new(AtomicUsize::new(0));
        let s2 = started.clone();
        let a = ser.submit("refused", |_| false, None);
        let b = ser.submit(
            "next",
            move |_| {
                s2.fetch_add(1, Ordering::SeqCst);
                true
            },
            None,
        );
        let err = a.await.unwrap_err();
        assert_eq!(err.status(), Some(crate::error::STATUS_DISPATCH_FAILED));
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(ser.current_id(), Some(b.id()));
    }

    #[tokio::test]
    async fn stale_completion_is_ignored() {
        let ser: TransportSerializer<()> = TransportSerializer::new();
        let a = ser.submit("a", |_| true, None);
        let id = a.id();
        assert!(ser.complete(id, Ok(())));
        assert!(!ser.complete(id, Err(TransportError::Status(1))));
        assert_eq!(a.await, Ok(()));
    }

    #[tokio::test]
    async fn closed_serializer_rejects_work() {
        let ser: TransportSerializer<()> = TransportSerializer::new();
        let inflight = ser.submit("a", |_| true, None);
        ser.close();
        assert!(matches!(inflight.await, Err(TransportError::LinkClosing(_))));
        assert_eq!(
            ser.submit("late", |_| true, None).await,
            Err(TransportError::Closed)
        );
    }
}
