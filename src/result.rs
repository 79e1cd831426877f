use {
    crate::{
        deferred::{self, Deferred, Promise},
        error::Error,
        txn::OpKind,
        Version,
    },
    std::{
        future::Future,
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    },
};

///
/// Anything that carries the post-operation [`Version`].
///
pub trait Versioned {
    fn version(&self) -> Version;
}

///
/// One-shot notification that a watched key changed.
///
/// The handle is owned by the caller of the operation that produced it. Dropping it releases the
/// backend subscription: the adapter observes the drop through its [`WatchTrigger`].
///
/// Awaiting yields `Ok(())` when the key changed and [`Error::ConnectionLoss`] when the backend
/// gave up on the subscription.
///
#[derive(Debug)]
pub struct WatchHandle {
    inner: Deferred<()>,
}

///
/// Backend side of a [`WatchHandle`].
///
#[derive(Debug)]
pub struct WatchTrigger {
    promise: Promise<()>,
}

impl WatchHandle {
    pub fn channel() -> (WatchTrigger, WatchHandle) {
        let (promise, inner) = deferred::channel();
        (WatchTrigger { promise }, WatchHandle { inner })
    }

    pub fn has_fired(&self) -> bool {
        self.inner.is_ready()
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.inner.wait_for(timeout)
    }

    pub fn wait(self) -> Result<(), Error> {
        self.inner.wait()
    }

    pub fn into_deferred(self) -> Deferred<()> {
        self.inner
    }
}

impl Future for WatchHandle {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl WatchTrigger {
    pub fn fire(self) {
        self.promise.set_value(())
    }

    pub fn fail(self, err: Error) {
        self.promise.set_error(err)
    }

    ///
    /// Returns true when the caller dropped the [`WatchHandle`].
    ///
    pub fn is_abandoned(&self) -> bool {
        self.promise.is_canceled()
    }

    ///
    /// Waits until the caller dropped the [`WatchHandle`].
    ///
    pub async fn abandoned(&mut self) {
        self.promise.canceled().await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateResult {
    pub version: Version,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetResult {
    pub version: Version,
}

///
/// Outcome of `exists`. `version` is meaningful only when `exists` is true.
///
/// The optional watch fires on any state change of the key: creation, deletion or value change.
///
#[derive(Debug, Default)]
pub struct ExistsResult {
    pub exists: bool,
    pub version: Version,
    pub watch: Option<WatchHandle>,
}

impl ExistsResult {
    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn take_watch(&mut self) -> Option<WatchHandle> {
        self.watch.take()
    }
}

///
/// Outcome of `get`: the stored value and its version.
///
/// The optional watch fires on value change or deletion.
///
#[derive(Debug, Default)]
pub struct GetResult {
    pub version: Version,
    pub value: Vec<u8>,
    pub watch: Option<WatchHandle>,
}

impl GetResult {
    pub fn take_watch(&mut self) -> Option<WatchHandle> {
        self.watch.take()
    }
}

///
/// Outcome of a compare-and-swap.
///
/// On success `version` is the new version, on failure the one observed at comparison time.
///
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CasResult {
    pub success: bool,
    pub version: Version,
}

impl CasResult {
    pub fn succeeded(&self) -> bool {
        self.success
    }
}

macro_rules! impl_versioned {
    ($($ty:ty),*) => {
        $(
            impl Versioned for $ty {
                fn version(&self) -> Version {
                    self.version
                }
            }
        )*
    };
}

impl_versioned!(CreateResult, SetResult, ExistsResult, GetResult, CasResult);

///
/// Per-operation result of a committed transaction, one arm per [`OpKind`].
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Check { version: Version },
    Create(CreateResult),
    Set(SetResult),
    Erase,
}

impl OpResult {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Check { .. } => OpKind::Check,
            Self::Create(_) => OpKind::Create,
            Self::Set(_) => OpKind::Set,
            Self::Erase => OpKind::Erase,
        }
    }

    pub fn version(&self) -> Option<Version> {
        match self {
            Self::Check { version } => Some(*version),
            Self::Create(res) => Some(res.version),
            Self::Set(res) => Some(res.version),
            Self::Erase => None,
        }
    }
}

///
/// Results of a committed transaction, parallel to its operation list.
///
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionResult {
    op_results: Vec<OpResult>,
}

impl TransactionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: OpResult) {
        self.op_results.push(result);
    }

    pub fn get(&self, index: usize) -> Option<&OpResult> {
        self.op_results.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OpResult> {
        self.op_results.iter()
    }

    pub fn len(&self) -> usize {
        self.op_results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.op_results.is_empty()
    }
}

impl From<Vec<OpResult>> for TransactionResult {
    fn from(op_results: Vec<OpResult>) -> Self {
        Self { op_results }
    }
}

impl FromIterator<OpResult> for TransactionResult {
    fn from_iter<I: IntoIterator<Item = OpResult>>(iter: I) -> Self {
        Self {
            op_results: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for TransactionResult {
    type Item = OpResult;
    type IntoIter = std::vec::IntoIter<OpResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.op_results.into_iter()
    }
}

impl<'a> IntoIterator for &'a TransactionResult {
    type Item = &'a OpResult;
    type IntoIter = std::slice::Iter<'a, OpResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.op_results.iter()
    }
}
