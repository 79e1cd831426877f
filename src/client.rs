use {
    crate::{
        backend::Backend,
        deferred::Deferred,
        error::{translate, Error},
        result::{CasResult, CreateResult, ExistsResult, GetResult, SetResult, TransactionResult},
        scheduler::{Scheduler, SchedulerConfig, SchedulerError},
        txn::Transaction,
        Version,
    },
    tracing::trace,
};

///
/// Coordination client over a backend `B`.
///
/// Each operation asks the backend for a native deferred and returns a deferred carrying the
/// canonical [`Error`]. Results already available are translated on the spot, the others are
/// translated by a continuation on the client's [`Scheduler`] once the backend completes them.
///
/// Dropping a returned deferred does not cancel the backend operation, its outcome is discarded.
///
/// Examples
///
/// ```
/// use rust_coordkv::{backend::memory::MemoryBackend, Client, Error};
///
/// let client = Client::new(MemoryBackend::new()).expect("client");
///
/// let created = client.create("/a", "v1").wait()?;
/// let fetched = client.get("/a", false).wait()?;
/// assert_eq!(fetched.value, b"v1");
/// assert_eq!(fetched.version, created.version);
///
/// assert_eq!(client.get("/missing", false).wait().unwrap_err(), Error::NoEntry);
/// # Ok::<(), Error>(())
/// ```
///
pub struct Client<B: Backend> {
    // Declared first so queued continuations drain before the backend goes away.
    scheduler: Scheduler,
    backend: B,
}

impl<B: Backend> Client<B> {
    pub fn new(backend: B) -> Result<Self, SchedulerError> {
        Self::with_config(backend, SchedulerConfig::default())
    }

    pub fn with_config(backend: B, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Ok(Self {
            scheduler: Scheduler::new(config)?,
            backend,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn adapt<T: Send + 'static>(&self, native: Deferred<T, B::Error>) -> Deferred<T> {
        if native.is_ready() {
            return Deferred::from_result(native.wait().map_err(translate));
        }
        trace!("routing pending backend result through the scheduler");
        self.scheduler
            .then(native, |ready| ready.wait().map_err(translate))
    }

    pub fn create(&self, key: &str, value: impl AsRef<[u8]>) -> Deferred<CreateResult> {
        self.adapt(self.backend.create(key, value.as_ref(), false))
    }

    ///
    /// Creates an entry bound to the client session: it is removed when the session ends.
    ///
    pub fn create_leased(&self, key: &str, value: impl AsRef<[u8]>) -> Deferred<CreateResult> {
        self.adapt(self.backend.create(key, value.as_ref(), true))
    }

    ///
    /// Writes `value`. On an absent key the backend's [`crate::SetPolicy`] decides between creating
    /// it and failing with [`Error::NoEntry`].
    ///
    pub fn set(&self, key: &str, value: impl AsRef<[u8]>) -> Deferred<SetResult> {
        self.adapt(self.backend.set(key, value.as_ref()))
    }

    ///
    /// Writes `value` only if the key is at `expected`. A miss resolves to `success = false` with the
    /// observed version, it is not an error.
    ///
    pub fn cas(&self, key: &str, value: impl AsRef<[u8]>, expected: Version) -> Deferred<CasResult> {
        self.adapt(self.backend.cas(key, value.as_ref(), expected))
    }

    pub fn get(&self, key: &str, watch: bool) -> Deferred<GetResult> {
        self.adapt(self.backend.get(key, watch))
    }

    pub fn exists(&self, key: &str, watch: bool) -> Deferred<ExistsResult> {
        self.adapt(self.backend.exists(key, watch))
    }

    ///
    /// Erases the key and its descendants, `expected = 0` meaning any version.
    ///
    pub fn erase(&self, key: &str, expected: Version) -> Deferred<()> {
        self.adapt(self.backend.erase(key, expected))
    }

    ///
    /// Commits every operation atomically or none of them.
    ///
    /// A failed transaction reports the canonical kind of its first failing operation.
    ///
    pub fn transaction(&self, txn: impl Into<Transaction>) -> Deferred<TransactionResult> {
        self.adapt(self.backend.commit(txn.into()))
    }

    ///
    /// Runs `func` on the client's scheduler once `input` is ready.
    ///
    /// See [`Scheduler::then`].
    ///
    pub fn then<T, U, F>(&self, input: Deferred<T>, func: F) -> Deferred<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: FnOnce(Deferred<T>) -> Result<U, Error> + Send + 'static,
    {
        self.scheduler.then(input, func)
    }
}
