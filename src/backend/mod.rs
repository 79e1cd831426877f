use {
    crate::{
        deferred::{Broken, Deferred},
        error::Translate,
        result::{CasResult, CreateResult, ExistsResult, GetResult, SetResult, TransactionResult},
        txn::Transaction,
        Version,
    },
    serde::{Deserialize, Serialize},
};

///
/// In-process backend, resolves every operation immediately.
///
pub mod memory;

///
/// etcd backend built on `etcd-client`.
///
pub mod etcd;

///
/// What `set` does when the key is absent.
///
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetPolicy {
    ///
    /// Create the key.
    ///
    #[default]
    Upsert,

    ///
    /// Fail with `NoEntry`.
    ///
    RequireExisting,
}

///
/// Interface a coordination backend exposes to the core.
///
/// Every operation returns a native deferred result immediately. Failures are expressed in the
/// adapter's own vocabulary, [`Backend::Error`], which the [`crate::Client`] converts through
/// [`Translate`] before they reach callers.
///
/// Versions returned by an adapter strictly increase per key within a session. Erase removes the key
/// and every hierarchical descendant (`key/...`).
///
pub trait Backend: Send + Sync + 'static {
    type Error: Translate + From<Broken>;

    fn set_policy(&self) -> SetPolicy;

    fn create(&self, key: &str, value: &[u8], leased: bool) -> Deferred<CreateResult, Self::Error>;

    fn set(&self, key: &str, value: &[u8]) -> Deferred<SetResult, Self::Error>;

    ///
    /// Writes `value` if the key's version is `expected`.
    ///
    /// An `expected` of `0` means "create if absent". A mismatch is not a failure: it yields
    /// `success = false` and the observed version.
    ///
    fn cas(&self, key: &str, value: &[u8], expected: Version) -> Deferred<CasResult, Self::Error>;

    fn get(&self, key: &str, watch: bool) -> Deferred<GetResult, Self::Error>;

    fn exists(&self, key: &str, watch: bool) -> Deferred<ExistsResult, Self::Error>;

    ///
    /// Erases the key if its version is `expected`, `0` meaning any version.
    ///
    fn erase(&self, key: &str, expected: Version) -> Deferred<(), Self::Error>;

    fn commit(&self, txn: Transaction) -> Deferred<TransactionResult, Self::Error>;
}

///
/// Keys are absolute slash-separated paths: a leading `/`, no trailing `/` (except the root) and no
/// empty segment.
///
pub(crate) fn is_valid_key(key: &str) -> bool {
    key.starts_with('/') && !(key.len() > 1 && key.ends_with('/')) && !key.contains("//")
}

///
/// Hierarchical descendants of `key` share the `key/` prefix. Every other key descends from the root.
///
pub(crate) fn is_descendant(key: &str, candidate: &str) -> bool {
    if key == "/" {
        return candidate.len() > 1 && candidate.starts_with('/');
    }
    candidate.len() > key.len() + 1
        && candidate.starts_with(key)
        && candidate.as_bytes()[key.len()] == b'/'
}
