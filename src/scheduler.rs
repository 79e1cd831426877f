use {
    crate::{
        deferred::{self, Broken, Deferred, Promise},
        queue::BlockingQueue,
    },
    parking_lot::{Condvar, Mutex},
    serde::{Deserialize, Serialize},
    std::{
        any::Any,
        cell::Cell,
        io,
        mem,
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
    tracing::{debug, error, trace, warn},
};

// Back-off between two fruitless polling passes when readiness checks do not wait at all.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

///
/// Worker pool settings, fixed at construction.
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    ///
    /// Size of the worker pool.
    ///
    pub number_of_threads: usize,

    ///
    /// Maximum number of pending continuations a worker polls between two queue fetches.
    ///
    pub objects_per_thread: usize,

    ///
    /// Per-continuation readiness wait, in milliseconds.
    ///
    pub wait_for_object_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            number_of_threads: 1,
            objects_per_thread: 10,
            wait_for_object_ms: 20,
        }
    }
}

impl SchedulerConfig {
    pub fn wait_for_object(&self) -> Duration {
        Duration::from_millis(self.wait_for_object_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to spawn worker thread")]
    Spawn(#[from] io::Error),
}

///
/// Pending continuation: a readiness check on its input and the action to run once ready.
///
trait Continuation: Send {
    fn is_ready(&self, timeout: Duration) -> bool;

    fn run(self: Box<Self>);
}

type Pending = Box<dyn Continuation>;

struct Then<T, E, U, E2, F> {
    input: Deferred<T, E>,
    output: Promise<U, E2>,
    func: F,
}

impl<T, E, U, E2, F> Continuation for Then<T, E, U, E2, F>
where
    T: Send,
    E: Send,
    U: Send,
    E2: Send,
    F: FnOnce(Deferred<T, E>) -> Result<U, E2> + Send,
{
    fn is_ready(&self, timeout: Duration) -> bool {
        self.input.wait_for(timeout)
    }

    fn run(self: Box<Self>) {
        let Then {
            input,
            output,
            func,
        } = *self;
        match panic::catch_unwind(AssertUnwindSafe(move || func(input))) {
            Ok(result) => {
                if output.is_canceled() {
                    trace!("continuation result discarded, output deferred was dropped");
                }
                output.set(result);
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!("continuation panicked: {msg}");
                output.set_broken(Broken::Panicked(msg));
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "continuation panicked".to_string()
    }
}

struct Inner {
    queue: BlockingQueue<Pending>,
    active_workers: AtomicUsize,
    exit_lock: Mutex<()>,
    exit_cv: Condvar,
    config: SchedulerConfig,
}

thread_local! {
    // Address of the `Inner` owned by the scheduler this thread works for, if any.
    static WORKER_OF: Cell<usize> = const { Cell::new(0) };
}

impl Inner {
    fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn worker_exited(&self) {
        if self.active_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.exit_lock.lock();
            self.exit_cv.notify_all();
        }
    }

    fn wait_for_workers(&self) {
        let mut guard = self.exit_lock.lock();
        while self.active_workers.load(Ordering::Acquire) > 0 {
            self.exit_cv.wait(&mut guard);
        }
    }
}

///
/// Continuation scheduler: a fixed pool of worker threads sharing one [`BlockingQueue`].
///
/// Each worker keeps up to `objects_per_thread` pending continuations and polls them in turn with
/// a `wait_for_object_ms` timeout. A worker blocks on the queue only when it has nothing picked,
/// so it never waits unboundedly on a single deferred.
///
/// Dropping the scheduler closes the queue, lets the workers drain every continuation already
/// submitted, and returns once all of them exited. Schedulers are independent of each other.
///
/// Examples
///
/// ```
/// use rust_coordkv::{deferred, Error, Scheduler, SchedulerConfig};
///
/// let scheduler = Scheduler::new(SchedulerConfig::default()).expect("failed to start scheduler");
/// let (promise, input) = deferred::channel::<u64, Error>();
///
/// let doubled = scheduler.then(input, |ready| ready.wait().map(|v| v * 2));
/// promise.set_value(21);
///
/// assert_eq!(doubled.wait(), Ok(42));
/// ```
///
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        if config.number_of_threads == 0 {
            return Err(SchedulerError::InvalidConfig(
                "number_of_threads must be at least 1",
            ));
        }
        if config.objects_per_thread == 0 {
            return Err(SchedulerError::InvalidConfig(
                "objects_per_thread must be at least 1",
            ));
        }
        let number_of_threads = config.number_of_threads;
        let scheduler = Self {
            inner: Arc::new(Inner {
                queue: BlockingQueue::new(),
                active_workers: AtomicUsize::new(0),
                exit_lock: Mutex::new(()),
                exit_cv: Condvar::new(),
                config,
            }),
        };
        for n in 0..number_of_threads {
            // On failure, dropping `scheduler` stops the workers spawned so far.
            scheduler.spawn_worker(n)?;
        }
        debug!("scheduler started with {number_of_threads} worker(s)");
        Ok(scheduler)
    }

    fn spawn_worker(&self, n: usize) -> Result<(), SchedulerError> {
        let inner = self.inner.clone();
        self.inner.active_workers.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("coordkv-worker-{n}"))
            .spawn(move || run_worker(inner));
        match spawned {
            // Workers are detached, shutdown relies on the active worker counter.
            Ok(_detached) => Ok(()),
            Err(e) => {
                self.inner.worker_exited();
                Err(e.into())
            }
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::Acquire)
    }

    ///
    /// Schedules `func` to run on a worker once `input` is ready, and returns the deferred of its result.
    ///
    /// A failure returned by `func` reaches the output as is. A panic inside `func` fails the output
    /// with [`Broken::Panicked`]. Dropping the output does not stop `func` from running, its result is
    /// discarded.
    ///
    pub fn then<T, E, U, E2, F>(&self, input: Deferred<T, E>, func: F) -> Deferred<U, E2>
    where
        T: Send + 'static,
        E: Send + 'static,
        U: Send + 'static,
        E2: Send + 'static,
        F: FnOnce(Deferred<T, E>) -> Result<U, E2> + Send + 'static,
    {
        let (output, deferred) = deferred::channel();
        let pending: Pending = Box::new(Then {
            input,
            output,
            func,
        });
        if let Err(closed) = self.inner.queue.put(pending) {
            warn!("continuation submitted to a scheduler that is shutting down");
            // Dropping the refused continuation abandons its output.
            drop(closed.into_inner());
        }
        deferred
    }

    ///
    /// Closes the queue and waits until every worker drained its work and exited.
    ///
    pub fn shutdown(self) {
        drop(self)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.queue.close();
        if WORKER_OF.with(Cell::get) == self.inner.id() {
            warn!("scheduler dropped from one of its own workers, not waiting for shutdown");
            return;
        }
        self.inner.wait_for_workers();
        debug!("scheduler stopped");
    }
}

fn run_worker(inner: Arc<Inner>) {
    WORKER_OF.with(|w| w.set(inner.id()));
    let objects_per_thread = inner.config.objects_per_thread;
    let poll_timeout = inner.config.wait_for_object();
    let mut picked: Vec<Pending> = Vec::with_capacity(objects_per_thread);
    let mut scratch: Vec<Pending> = Vec::with_capacity(objects_per_thread);
    trace!("worker started");

    loop {
        let max_count = objects_per_thread - picked.len();
        let require = picked.is_empty();
        if !inner.queue.get_batch(&mut picked, max_count, require) {
            break;
        }
        let progressed = poll_picked(&mut picked, &mut scratch, poll_timeout);
        if progressed || picked.is_empty() {
            continue;
        }
        if picked.len() == objects_per_thread && !inner.queue.is_empty() {
            // Give waiting work a turn instead of starving it behind a long-pending deferred.
            inner.queue.requeue(picked.remove(0));
        }
        if poll_timeout.is_zero() {
            thread::sleep(IDLE_BACKOFF);
        }
    }

    trace!("worker exiting");
    WORKER_OF.with(|w| w.set(0));
    inner.worker_exited();
}

///
/// Polls every picked continuation once and runs the ready ones.
///
/// Not-ready items are compacted back into `picked` in their original order. Returns true when at
/// least one continuation ran.
///
fn poll_picked(picked: &mut Vec<Pending>, scratch: &mut Vec<Pending>, timeout: Duration) -> bool {
    mem::swap(picked, scratch);
    let mut progressed = false;
    for item in scratch.drain(..) {
        if item.is_ready(timeout) {
            item.run();
            progressed = true;
        } else {
            picked.push(item);
        }
    }
    progressed
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::error::Error,
        std::{
            collections::HashSet,
            sync::atomic::AtomicBool,
            time::Instant,
        },
    };

    fn config(threads: usize, objects: usize, wait_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            number_of_threads: threads,
            objects_per_thread: objects,
            wait_for_object_ms: wait_ms,
        }
    }

    #[test]
    fn default_config_matches_documented_values() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.number_of_threads, 1);
        assert_eq!(cfg.objects_per_thread, 10);
        assert_eq!(cfg.wait_for_object(), Duration::from_millis(20));
    }

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let cfg: SchedulerConfig =
            serde_json::from_str(r#"{"number_of_threads": 4}"#).expect("valid config");
        assert_eq!(cfg, config(4, 10, 20));
    }

    #[test]
    fn zero_sized_pools_are_rejected() {
        assert!(matches!(
            Scheduler::new(config(0, 10, 20)),
            Err(SchedulerError::InvalidConfig(_))
        ));
        assert!(matches!(
            Scheduler::new(config(1, 0, 20)),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn continuation_runs_after_input_is_ready() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler");
        let (promise, input) = deferred::channel::<u64, Error>();
        let output = scheduler.then(input, |d| d.wait().map(|v| v + 1));
        assert!(!output.wait_for(Duration::from_millis(30)));
        promise.set_value(1);
        assert_eq!(output.wait(), Ok(2));
    }

    #[test]
    fn continuation_error_reaches_output_verbatim() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler");
        let output: Deferred<(), Error> = scheduler.then(Deferred::<(), Error>::ready(()), |_| {
            Err(Error::ServiceError("user failure".to_string()))
        });
        assert_eq!(output.wait(), Err(Error::ServiceError("user failure".to_string())));
    }

    #[test]
    fn input_failure_is_visible_to_the_continuation() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler");
        let input = Deferred::<u64, Error>::failed(Error::NoEntry);
        let output = scheduler.then(input, |d| match d.wait() {
            Err(Error::NoEntry) => Ok::<_, Error>("missing"),
            other => Ok(if other.is_ok() { "present" } else { "other" }),
        });
        assert_eq!(output.wait(), Ok("missing"));
    }

    #[test]
    fn panicking_continuation_fails_output_and_keeps_worker_alive() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler");
        let output: Deferred<(), Error> =
            scheduler.then(Deferred::<(), Error>::ready(()), |_| panic!("boom"));
        assert_eq!(output.wait(), Err(Error::ServiceError("boom".to_string())));

        let after = scheduler.then(Deferred::<u8, Error>::ready(1), |d| d.wait());
        assert_eq!(after.wait(), Ok(1));
        assert_eq!(scheduler.active_workers(), 1);
    }

    #[test]
    fn chained_continuations_run_in_chain_order() {
        let scheduler = Scheduler::new(config(4, 10, 5)).expect("scheduler");
        let f_returned = Arc::new(AtomicBool::new(false));
        let (promise, d1) = deferred::channel::<u64, Error>();

        let flag = f_returned.clone();
        let d2 = scheduler.then(d1, move |d| {
            thread::sleep(Duration::from_millis(20));
            let v = d.wait()?;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, Error>(v * 10)
        });
        let flag = f_returned.clone();
        let d3 = scheduler.then(d2, move |d| {
            assert!(flag.load(Ordering::SeqCst), "g ran before f returned");
            d.wait().map(|v| v + 1)
        });

        promise.set_value(4);
        assert_eq!(d3.wait(), Ok(41));
    }

    #[test]
    fn single_object_per_thread_still_makes_progress() {
        let scheduler = Scheduler::new(config(1, 1, 1)).expect("scheduler");
        let (never, stuck) = deferred::channel::<(), Error>();
        let stuck_out = scheduler.then(stuck, |d| d.wait());
        let outputs: Vec<_> = (0..20u32)
            .map(|i| scheduler.then(Deferred::<u32, Error>::ready(i), |d| d.wait()))
            .collect();
        for (i, out) in outputs.into_iter().enumerate() {
            assert_eq!(out.wait(), Ok(i as u32));
        }
        assert!(!stuck_out.is_ready());
        drop(never);
        assert_eq!(stuck_out.wait(), Err(Error::ConnectionLoss));
    }

    #[test]
    fn partially_filled_buffer_keeps_taking_new_work() {
        let scheduler = Scheduler::new(config(1, 4, 5)).expect("scheduler");
        let stuck: Vec<_> = (0..2)
            .map(|_| {
                let (promise, input) = deferred::channel::<(), Error>();
                (promise, scheduler.then(input, |d| d.wait()))
            })
            .collect();
        let outputs: Vec<_> = (0..50u32)
            .map(|i| scheduler.then(Deferred::<u32, Error>::ready(i), |d| d.wait().map(|v| v + 1)))
            .collect();
        for (i, out) in outputs.into_iter().enumerate() {
            assert_eq!(out.wait(), Ok(i as u32 + 1));
        }
        for (promise, out) in stuck {
            assert!(!out.is_ready());
            promise.set_value(());
            assert_eq!(out.wait(), Ok(()));
        }
    }

    #[test]
    fn zero_readiness_wait_does_not_spin() {
        let scheduler = Scheduler::new(config(1, 10, 0)).expect("scheduler");
        let (promise, input) = deferred::channel::<(), Error>();
        let polls = Arc::new(AtomicUsize::new(0));

        struct CountingInput {
            input: Deferred<(), Error>,
            polls: Arc<AtomicUsize>,
        }
        impl Continuation for CountingInput {
            fn is_ready(&self, timeout: Duration) -> bool {
                self.polls.fetch_add(1, Ordering::Relaxed);
                self.input.wait_for(timeout)
            }
            fn run(self: Box<Self>) {}
        }

        let pending: Pending = Box::new(CountingInput {
            input,
            polls: polls.clone(),
        });
        scheduler.inner.queue.put(pending).map_err(|_| "closed").expect("put");
        thread::sleep(Duration::from_millis(100));
        promise.set_value(());
        drop(scheduler);
        // With a 1ms back-off, 100ms of idling stays far below a spinning loop's poll count.
        assert!(polls.load(Ordering::Relaxed) < 1_000);
    }

    #[test]
    fn drop_drains_queue_and_stops_every_worker() {
        let scheduler = Scheduler::new(config(3, 2, 5)).expect("scheduler");
        let inner = scheduler.inner.clone();
        let ran = Arc::new(AtomicUsize::new(0));
        let mut promises = vec![];
        let mut outputs = vec![];
        for _ in 0..50 {
            let (p, d) = deferred::channel::<(), Error>();
            let ran = ran.clone();
            outputs.push(scheduler.then(d, move |d| {
                ran.fetch_add(1, Ordering::SeqCst);
                d.wait()
            }));
            promises.push(p);
        }
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            for p in promises {
                p.set_value(());
            }
        });

        drop(scheduler);

        assert_eq!(ran.load(Ordering::SeqCst), 50);
        assert_eq!(inner.active_workers.load(Ordering::SeqCst), 0);
        assert!(inner.queue.is_empty());
        for out in outputs {
            assert_eq!(out.wait(), Ok(()));
        }
        producer.join().expect("producer panicked");
    }

    #[test]
    fn dropped_output_does_not_prevent_execution() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let output = scheduler.then(Deferred::<(), Error>::ready(()), move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, Error>(())
        });
        drop(output);
        drop(scheduler);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn schedulers_are_independent() {
        let a = Scheduler::new(SchedulerConfig::default()).expect("scheduler a");
        let b = Scheduler::new(SchedulerConfig::default()).expect("scheduler b");
        let (pending_on_a, stuck) = deferred::channel::<(), Error>();
        let stuck_on_a = a.then(stuck, |d| d.wait());
        let started = Instant::now();
        let on_b = b.then(Deferred::<u8, Error>::ready(3), |d| d.wait());
        assert_eq!(on_b.wait(), Ok(3));
        drop(b);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(a.active_workers(), 1);
        assert!(!stuck_on_a.is_ready());
        drop(pending_on_a);
        assert_eq!(stuck_on_a.wait(), Err(Error::ConnectionLoss));
    }

    #[test]
    fn workers_run_on_at_most_number_of_threads_threads() {
        let scheduler = Scheduler::new(config(2, 4, 2)).expect("scheduler");
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let outputs: Vec<_> = (0..64)
            .map(|_| {
                let seen = seen.clone();
                scheduler.then(Deferred::<(), Error>::ready(()), move |_| {
                    seen.lock().insert(thread::current().id());
                    Ok::<_, Error>(())
                })
            })
            .collect();
        for out in outputs {
            out.wait().expect("continuation failed");
        }
        assert!(seen.lock().len() <= 2);
    }
}
