use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::Future;
use futures_timer::Delay;

struct Inner<T> {
    tokens: f64,
    bucket_size: f64,
    token_cost: f64,
    paused: bool,
    waiters: VecDeque<(u64, oneshot::Sender<T>)>,
    pending: VecDeque<T>,
    next_waiter_id: u64,
    /// Whether a refill loop is currently spawned for this pacer. Mirrors
    /// `tbq.py`'s `delayed_call is not None` check so `resume()` never
    /// spawns a second, redundant loop.
    tick_running: bool,
}

impl<T> Inner<T> {
    /// While there's a waiter, a pending item, and enough tokens, debit
    /// and deliver. Mirrors the drain loop `tbq.py` runs after every
    /// refill and after every `put`.
    fn drain(&mut self) {
        while !self.paused
            && self.tokens >= self.token_cost
            && !self.waiters.is_empty()
            && !self.pending.is_empty()
        {
            let (_, tx) = self.waiters.pop_front().unwrap();
            let item = self.pending.pop_front().unwrap();
            self.tokens -= self.token_cost;
            // the waiter may have been cancelled (future dropped); a send
            // failure there is not our problem.
            let _ = tx.send(item);
        }
    }
}

/// A FIFO token-bucket pacer: callers `put` items and `get` them back out
/// no faster than `token_rate` per second, independent of how bursty the
/// callers are.
///
/// Grounded in `txHA`'s `TokenBucketQueue`: the same `tokens`/`waiters`/
/// `pending` state machine, adapted from Twisted's `callLater` to a
/// `tokio::spawn`ed refill loop.
pub struct Pacer<T> {
    inner: Arc<Mutex<Inner<T>>>,
    token_rate: f64,
}

impl<T> Clone for Pacer<T> {
    fn clone(&self) -> Self {
        Pacer { inner: self.inner.clone(), token_rate: self.token_rate }
    }
}

impl<T: Send + 'static> Pacer<T> {
    /// `token_rate` is tokens granted per second; `bucket_size` is the
    /// maximum number of tokens held at once; `token_cost` is how many
    /// tokens a single `get()` debits.
    pub fn new(token_rate: f64, bucket_size: f64, token_cost: f64, start_paused: bool) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            tokens: 0.0,
            bucket_size,
            token_cost,
            paused: start_paused,
            waiters: VecDeque::new(),
            pending: VecDeque::new(),
            next_waiter_id: 0,
            tick_running: !start_paused,
        }));

        if !start_paused {
            Self::spawn_refill(inner.clone(), token_rate);
        }

        Pacer { inner, token_rate }
    }

    /// Run the refill loop: add a token and drain immediately on spawn,
    /// then once every `1 / token_rate` seconds after that, until paused.
    fn spawn_refill(inner: Arc<Mutex<Inner<T>>>, token_rate: f64) {
        let interval = Duration::from_secs_f64(1.0 / token_rate);
        tokio::spawn(async move {
            loop {
                {
                    let mut guard = inner.lock().unwrap();
                    if guard.paused {
                        guard.tick_running = false;
                        return;
                    }
                    guard.tokens = (guard.tokens + 1.0).min(guard.bucket_size);
                    guard.drain();
                }
                Delay::new(interval).await;
            }
        });
    }

    /// Submit an item. Handed straight to the oldest waiter if tokens
    /// and queue order allow; otherwise queued for the next `get()`.
    pub fn put(&self, item: T) {
        let mut guard = self.inner.lock().unwrap();
        guard.pending.push_back(item);
        guard.drain();
    }

    /// Wait for the next paced item. Dropping the returned future before
    /// it resolves cancels the wait without disturbing other waiters.
    pub fn get(&self) -> PacerGetFuture<T> {
        let mut guard = self.inner.lock().unwrap();
        let id = guard.next_waiter_id;
        guard.next_waiter_id += 1;

        let (tx, rx) = oneshot::channel();
        guard.waiters.push_back((id, tx));
        guard.drain();

        PacerGetFuture { id, inner: self.inner.clone(), rx: Some(rx) }
    }

    /// Suspend refill. Outstanding `get()` futures remain pending and no
    /// new debits occur until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    /// Re-enable refill, restarting the refill loop if it had stopped.
    pub fn resume(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.paused = false;
        let need_spawn = !guard.tick_running;
        if need_spawn {
            guard.tick_running = true;
        }
        drop(guard);
        if need_spawn {
            Self::spawn_refill(self.inner.clone(), self.token_rate);
        }
    }

    /// Pause and drop every item still waiting for a consumer, returning
    /// them to the caller. Used when a session's transport dies so
    /// commands queued for a dead connection don't linger forever.
    pub fn pause_and_drain(&self) -> Vec<T> {
        let mut guard = self.inner.lock().unwrap();
        guard.paused = true;
        guard.pending.drain(..).collect()
    }
}

pub struct PacerGetFuture<T> {
    id: u64,
    inner: Arc<Mutex<Inner<T>>>,
    rx: Option<oneshot::Receiver<T>>,
}

impl<T> Future for PacerGetFuture<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let rx = self.rx.as_mut().expect("PacerGetFuture polled after completion");
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(item)) => Poll::Ready(item),
            // The sender can only be dropped if `drain` already sent to it
            // (impossible without a ready value) or the Pacer itself was
            // dropped; either way there is nothing left to deliver.
            Poll::Ready(Err(_)) => Poll::Pending,
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for PacerGetFuture<T> {
    fn drop(&mut self) {
        let mut guard = self.inner.lock().unwrap();
        guard.waiters.retain(|(id, _)| *id != self.id);
    }
}
