use {
    crate::error::Error,
    futures::future::poll_fn,
    parking_lot::{Condvar, Mutex},
    std::{
        fmt,
        future::Future,
        mem,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll, Waker},
        time::{Duration, Instant},
    },
};

///
/// Why a deferred completed without its producer delivering a result.
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Broken {
    #[error("deferred result abandoned before completion")]
    Abandoned,
    #[error("continuation panicked: {0}")]
    Panicked(String),
}

enum Slot<T, E> {
    Pending,
    Ready(Result<T, E>),
    Broken(Broken),
    Taken,
}

struct State<T, E> {
    slot: Slot<T, E>,
    consumer_waker: Option<Waker>,
    producer_waker: Option<Waker>,
    consumer_alive: bool,
}

struct Shared<T, E> {
    state: Mutex<State<T, E>>,
    ready: Condvar,
}

impl<T, E> Shared<T, E> {
    fn complete(&self, slot: Slot<T, E>) {
        let waker = {
            let mut state = self.state.lock();
            if !matches!(state.slot, Slot::Pending) {
                return;
            }
            state.slot = slot;
            state.consumer_waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

///
/// Producer half of a deferred result.
///
/// Dropping a promise without fulfilling it completes the paired [`Deferred`] with [`Broken::Abandoned`].
///
pub struct Promise<T, E = Error> {
    shared: Option<Arc<Shared<T, E>>>,
}

///
/// A value that becomes available later.
///
/// Supports timed readiness probing ([`Deferred::wait_for`]), blocking retrieval ([`Deferred::wait`])
/// and `.await`. The result is retrieved exactly once.
///
pub struct Deferred<T, E = Error> {
    shared: Arc<Shared<T, E>>,
}

///
/// Creates a connected promise/deferred pair.
///
pub fn channel<T, E>() -> (Promise<T, E>, Deferred<T, E>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            slot: Slot::Pending,
            consumer_waker: None,
            producer_waker: None,
            consumer_alive: true,
        }),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Some(shared.clone()),
        },
        Deferred { shared },
    )
}

impl<T, E> Promise<T, E> {
    pub fn set(mut self, result: Result<T, E>) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Slot::Ready(result));
        }
    }

    pub fn set_value(self, value: T) {
        self.set(Ok(value))
    }

    pub fn set_error(self, err: E) {
        self.set(Err(err))
    }

    pub(crate) fn set_broken(mut self, broken: Broken) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Slot::Broken(broken));
        }
    }

    ///
    /// Returns true once the consumer dropped its [`Deferred`]: whatever is set from now on is discarded.
    ///
    pub fn is_canceled(&self) -> bool {
        match &self.shared {
            Some(shared) => !shared.state.lock().consumer_alive,
            None => true,
        }
    }

    ///
    /// Waits until the consumer dropped its [`Deferred`].
    ///
    pub async fn canceled(&mut self) {
        poll_fn(|cx| {
            let Some(shared) = &self.shared else {
                return Poll::Ready(());
            };
            let mut state = shared.state.lock();
            if !state.consumer_alive {
                return Poll::Ready(());
            }
            let stale = state
                .producer_waker
                .as_ref()
                .map_or(true, |waker| !waker.will_wake(cx.waker()));
            if stale {
                state.producer_waker = Some(cx.waker().clone());
            }
            Poll::Pending
        })
        .await
    }
}

impl<T, E> Drop for Promise<T, E> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Slot::Broken(Broken::Abandoned));
        }
    }
}

impl<T, E> Deferred<T, E> {
    pub fn ready(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    pub fn failed(err: E) -> Self {
        Self::from_result(Err(err))
    }

    pub fn from_result(result: Result<T, E>) -> Self {
        let (promise, deferred) = channel();
        promise.set(result);
        deferred
    }

    pub fn is_ready(&self) -> bool {
        !matches!(self.shared.state.lock().slot, Slot::Pending)
    }

    ///
    /// Waits at most `timeout` for the result to become available, without consuming it.
    ///
    /// A zero timeout only checks the current state.
    ///
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if !matches!(state.slot, Slot::Pending) {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        while matches!(state.slot, Slot::Pending) {
            if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        !matches!(state.slot, Slot::Pending)
    }
}

impl<T, E: From<Broken>> Deferred<T, E> {
    ///
    /// Blocks the calling thread until the result is available.
    ///
    pub fn wait(self) -> Result<T, E> {
        let mut state = self.shared.state.lock();
        while matches!(state.slot, Slot::Pending) {
            self.shared.ready.wait(&mut state);
        }
        take(&mut state.slot)
    }
}

fn take<T, E: From<Broken>>(slot: &mut Slot<T, E>) -> Result<T, E> {
    match mem::replace(slot, Slot::Taken) {
        Slot::Ready(result) => result,
        Slot::Broken(broken) => Err(broken.into()),
        // Retrieval is exactly-once, a second poll sees nothing left.
        Slot::Pending | Slot::Taken => Err(Broken::Abandoned.into()),
    }
}

impl<T, E: From<Broken>> Future for Deferred<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if matches!(state.slot, Slot::Pending) {
            let stale = state
                .consumer_waker
                .as_ref()
                .map_or(true, |waker| !waker.will_wake(cx.waker()));
            if stale {
                state.consumer_waker = Some(cx.waker().clone());
            }
            return Poll::Pending;
        }
        Poll::Ready(take(&mut state.slot))
    }
}

impl<T, E> Drop for Deferred<T, E> {
    fn drop(&mut self) {
        let waker = {
            let mut state = self.shared.state.lock();
            state.consumer_alive = false;
            state.consumer_waker = None;
            state.producer_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.shared.state.lock().slot {
            Slot::Pending => "pending",
            Slot::Ready(Ok(_)) => "ready",
            Slot::Ready(Err(_)) => "failed",
            Slot::Broken(_) => "broken",
            Slot::Taken => "taken",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
