use {
    super::{is_descendant, is_valid_key, Backend, SetPolicy},
    crate::{
        deferred::{Broken, Deferred},
        error::{ErrorKind, Translate},
        result::{
            CasResult, CreateResult, ExistsResult, GetResult, OpResult, SetResult,
            TransactionResult, WatchHandle, WatchTrigger,
        },
        txn::{Transaction, TxnOp},
        Version,
    },
    parking_lot::Mutex,
    std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
    },
    tracing::trace,
};

///
/// Native failure vocabulary of [`MemoryBackend`].
///
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("node does not exist")]
    NoNode,
    #[error("node already exists")]
    NodeExists,
    #[error("bad version")]
    BadVersion,
    #[error("bad key: {0:?}")]
    BadKey(String),
    #[error("session disconnected")]
    Disconnected,
    #[error(transparent)]
    Broken(#[from] Broken),
    #[error("{0}")]
    Internal(String),
}

impl Translate for MemoryError {
    fn classify(&self) -> Option<ErrorKind> {
        match self {
            Self::NoNode => Some(ErrorKind::NoEntry),
            Self::NodeExists => Some(ErrorKind::EntryExists),
            Self::BadVersion => Some(ErrorKind::VersionMismatch),
            Self::BadKey(_) => Some(ErrorKind::InvalidKey),
            Self::Disconnected | Self::Broken(Broken::Abandoned) => Some(ErrorKind::ConnectionLoss),
            Self::Broken(Broken::Panicked(_)) | Self::Internal(_) => None,
        }
    }
}

struct Entry {
    value: Vec<u8>,
    version: Version,
    leased: bool,
}

#[derive(Default)]
struct Store {
    entries: BTreeMap<String, Entry>,
    revision: Version,
    watches: HashMap<String, Vec<WatchTrigger>>,
    disconnected: bool,
    injected: Option<MemoryError>,
}

fn validate_key(key: &str) -> Result<(), MemoryError> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(MemoryError::BadKey(key.to_string()))
    }
}

impl Store {
    fn enter(&mut self, key: &str) -> Result<(), MemoryError> {
        if let Some(err) = self.injected.take() {
            return Err(err);
        }
        if self.disconnected {
            return Err(MemoryError::Disconnected);
        }
        validate_key(key)
    }

    fn bump(&mut self) -> Version {
        self.revision += 1;
        self.revision
    }

    fn version_of(&self, key: &str) -> Option<Version> {
        self.entries.get(key).map(|e| e.version)
    }

    fn watch(&mut self, key: &str) -> WatchHandle {
        let (trigger, handle) = WatchHandle::channel();
        self.watches.retain(|_, triggers| {
            triggers.retain(|t| !t.is_abandoned());
            !triggers.is_empty()
        });
        self.watches.entry(key.to_string()).or_default().push(trigger);
        handle
    }

    fn notify(&mut self, key: &str) {
        if let Some(triggers) = self.watches.remove(key) {
            trace!("firing {} watch(es) on {key}", triggers.len());
            for trigger in triggers {
                trigger.fire();
            }
        }
    }

    fn put(&mut self, key: &str, value: Vec<u8>, version: Version, leased: Option<bool>) {
        let entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: Vec::new(),
            version,
            leased: false,
        });
        entry.value = value;
        entry.version = version;
        if let Some(leased) = leased {
            entry.leased = leased;
        }
        self.notify(key);
    }

    ///
    /// Stored keys of `key` and its descendants.
    ///
    fn subtree(&self, key: &str) -> Vec<String> {
        self.entries
            .range(key.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(key))
            .filter(|k| k.as_str() == key || is_descendant(key, k))
            .cloned()
            .collect()
    }

    fn remove_tree(&mut self, key: &str) {
        for k in self.subtree(key) {
            self.entries.remove(&k);
            self.notify(&k);
        }
    }

    fn create(&mut self, key: &str, value: &[u8], leased: bool) -> Result<CreateResult, MemoryError> {
        self.enter(key)?;
        if self.entries.contains_key(key) {
            return Err(MemoryError::NodeExists);
        }
        let version = self.bump();
        self.put(key, value.to_vec(), version, Some(leased));
        Ok(CreateResult { version })
    }

    fn set(&mut self, key: &str, value: &[u8], policy: SetPolicy) -> Result<SetResult, MemoryError> {
        self.enter(key)?;
        if policy == SetPolicy::RequireExisting && !self.entries.contains_key(key) {
            return Err(MemoryError::NoNode);
        }
        let version = self.bump();
        self.put(key, value.to_vec(), version, None);
        Ok(SetResult { version })
    }

    fn cas(&mut self, key: &str, value: &[u8], expected: Version) -> Result<CasResult, MemoryError> {
        self.enter(key)?;
        match self.version_of(key) {
            None if expected == 0 => {
                let version = self.bump();
                self.put(key, value.to_vec(), version, Some(false));
                Ok(CasResult {
                    success: true,
                    version,
                })
            }
            None => Err(MemoryError::NoNode),
            Some(observed) if expected == 0 || observed != expected => Ok(CasResult {
                success: false,
                version: observed,
            }),
            Some(_) => {
                let version = self.bump();
                self.put(key, value.to_vec(), version, None);
                Ok(CasResult {
                    success: true,
                    version,
                })
            }
        }
    }

    fn get(&mut self, key: &str, watch: bool) -> Result<GetResult, MemoryError> {
        self.enter(key)?;
        let (version, value) = match self.entries.get(key) {
            Some(entry) => (entry.version, entry.value.clone()),
            None => return Err(MemoryError::NoNode),
        };
        let watch = watch.then(|| self.watch(key));
        Ok(GetResult {
            version,
            value,
            watch,
        })
    }

    fn exists(&mut self, key: &str, watch: bool) -> Result<ExistsResult, MemoryError> {
        self.enter(key)?;
        let version = self.version_of(key);
        let watch = watch.then(|| self.watch(key));
        Ok(ExistsResult {
            exists: version.is_some(),
            version: version.unwrap_or_default(),
            watch,
        })
    }

    fn erase(&mut self, key: &str, expected: Version) -> Result<(), MemoryError> {
        self.enter(key)?;
        match self.version_of(key) {
            None => Err(MemoryError::NoNode),
            Some(observed) if expected != 0 && observed != expected => Err(MemoryError::BadVersion),
            Some(_) => {
                self.remove_tree(key);
                Ok(())
            }
        }
    }

    ///
    /// Validates every operation against the state left by the preceding ones, then applies them all
    /// under a single new revision.
    ///
    fn commit(&mut self, txn: Transaction, policy: SetPolicy) -> Result<TransactionResult, MemoryError> {
        self.enter("/")?;
        let next = self.revision + 1;
        let mut overlay: HashMap<String, Option<Version>> = HashMap::new();
        for op in txn.iter() {
            let key = op.key();
            validate_key(key)?;
            let current = match overlay.get(key) {
                Some(staged) => *staged,
                None => self.version_of(key),
            };
            match (op, current) {
                (TxnOp::Check { .. }, None) | (TxnOp::Erase { .. }, None) => {
                    return Err(MemoryError::NoNode)
                }
                (TxnOp::Check { version, .. }, Some(v)) | (TxnOp::Erase { version, .. }, Some(v))
                    if *version != 0 && *version != v =>
                {
                    return Err(MemoryError::BadVersion)
                }
                (TxnOp::Create { .. }, Some(_)) => return Err(MemoryError::NodeExists),
                (TxnOp::Set { .. }, None) if policy == SetPolicy::RequireExisting => {
                    return Err(MemoryError::NoNode)
                }
                (TxnOp::Check { .. }, Some(_)) => {}
                (TxnOp::Erase { .. }, Some(_)) => {
                    // The whole subtree goes, including keys staged by earlier ops.
                    let staged: Vec<String> = overlay
                        .keys()
                        .filter(|k| is_descendant(key, k))
                        .cloned()
                        .collect();
                    for k in staged.into_iter().chain(self.subtree(key)) {
                        overlay.insert(k, None);
                    }
                    overlay.insert(key.to_string(), None);
                }
                (TxnOp::Create { .. }, None) | (TxnOp::Set { .. }, _) => {
                    overlay.insert(key.to_string(), Some(next));
                }
            }
        }

        let mutates = txn.iter().any(|op| !matches!(op, TxnOp::Check { .. }));
        let version = if mutates { self.bump() } else { self.revision };
        let mut results = TransactionResult::new();
        for op in txn {
            let result = match op {
                TxnOp::Check { key, .. } => OpResult::Check {
                    version: self.version_of(&key).unwrap_or_default(),
                },
                TxnOp::Create { key, value, leased } => {
                    self.put(&key, value, version, Some(leased));
                    OpResult::Create(CreateResult { version })
                }
                TxnOp::Set { key, value } => {
                    self.put(&key, value, version, None);
                    OpResult::Set(SetResult { version })
                }
                TxnOp::Erase { key, .. } => {
                    self.remove_tree(&key);
                    OpResult::Erase
                }
            };
            results.push(result);
        }
        Ok(results)
    }
}

///
/// Coordination backend kept entirely in process memory.
///
/// Versions come from one counter bumped on every mutation, so they strictly increase per key.
/// Leased entries live until [`MemoryBackend::expire_session`]. Cloning shares the same store.
///
/// Examples
///
/// ```
/// use rust_coordkv::{backend::memory::MemoryBackend, Backend};
///
/// let backend = MemoryBackend::new();
/// let created = backend.create("/a", b"v1", false).wait().expect("create failed");
/// let fetched = backend.get("/a", false).wait().expect("get failed");
///
/// assert_eq!(fetched.value, b"v1");
/// assert_eq!(fetched.version, created.version);
/// ```
///
#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
    set_policy: SetPolicy,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set_policy(set_policy: SetPolicy) -> Self {
        Self {
            store: Default::default(),
            set_policy,
        }
    }

    ///
    /// Ends the client session: every leased entry is removed and its watches fire.
    ///
    pub fn expire_session(&self) {
        let mut store = self.store.lock();
        let leased: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, e)| e.leased)
            .map(|(k, _)| k.clone())
            .collect();
        for key in leased {
            store.remove_tree(&key);
        }
    }

    ///
    /// Simulates a transport failure: operations fail until [`MemoryBackend::reconnect`] and pending
    /// watches are abandoned.
    ///
    pub fn disconnect(&self) {
        let mut store = self.store.lock();
        store.disconnected = true;
        store.watches.clear();
    }

    pub fn reconnect(&self) {
        self.store.lock().disconnected = false;
    }

    ///
    /// Makes the next operation fail with `err`.
    ///
    pub fn fail_next(&self, err: MemoryError) {
        self.store.lock().injected = Some(err);
    }
}

impl Backend for MemoryBackend {
    type Error = MemoryError;

    fn set_policy(&self) -> SetPolicy {
        self.set_policy
    }

    fn create(&self, key: &str, value: &[u8], leased: bool) -> Deferred<CreateResult, MemoryError> {
        Deferred::from_result(self.store.lock().create(key, value, leased))
    }

    fn set(&self, key: &str, value: &[u8]) -> Deferred<SetResult, MemoryError> {
        Deferred::from_result(self.store.lock().set(key, value, self.set_policy))
    }

    fn cas(&self, key: &str, value: &[u8], expected: Version) -> Deferred<CasResult, MemoryError> {
        Deferred::from_result(self.store.lock().cas(key, value, expected))
    }

    fn get(&self, key: &str, watch: bool) -> Deferred<GetResult, MemoryError> {
        Deferred::from_result(self.store.lock().get(key, watch))
    }

    fn exists(&self, key: &str, watch: bool) -> Deferred<ExistsResult, MemoryError> {
        Deferred::from_result(self.store.lock().exists(key, watch))
    }

    fn erase(&self, key: &str, expected: Version) -> Deferred<(), MemoryError> {
        Deferred::from_result(self.store.lock().erase(key, expected))
    }

    fn commit(&self, txn: Transaction) -> Deferred<TransactionResult, MemoryError> {
        Deferred::from_result(self.store.lock().commit(txn, self.set_policy))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    #[test]
    fn versions_strictly_increase_per_key() {
        let backend = MemoryBackend::new();
        let v1 = backend.create("/k", b"a", false).wait().expect("create").version;
        let v2 = backend.set("/k", b"b").wait().expect("set").version;
        let v3 = backend.cas("/k", b"c", v2).wait().expect("cas").version;
        assert!(v1 < v2 && v2 < v3);
    }

    #[test]
    fn create_on_existing_key_is_node_exists() {
        let backend = MemoryBackend::new();
        backend.create("/k", b"a", false).wait().expect("create");
        assert_eq!(
            backend.create("/k", b"b", false).wait(),
            Err(MemoryError::NodeExists)
        );
    }

    #[test]
    fn set_policy_decides_absent_key_behavior() {
        let upsert = MemoryBackend::new();
        assert!(upsert.set("/new", b"x").wait().is_ok());

        let strict = MemoryBackend::with_set_policy(SetPolicy::RequireExisting);
        assert_eq!(strict.set("/new", b"x").wait(), Err(MemoryError::NoNode));
    }

    #[test]
    fn cas_with_zero_version_creates_when_absent() {
        let backend = MemoryBackend::new();
        let first = backend.cas("/k", b"a", 0).wait().expect("cas");
        assert!(first.succeeded());
        let second = backend.cas("/k", b"b", 0).wait().expect("cas");
        assert!(!second.succeeded());
        assert_eq!(second.version, first.version);
    }

    #[test]
    fn erase_removes_descendants_only() {
        let backend = MemoryBackend::new();
        for key in ["/a", "/a/b", "/a/b/c", "/ab"] {
            backend.create(key, b"", false).wait().expect("create");
        }
        backend.erase("/a", 0).wait().expect("erase");
        for key in ["/a", "/a/b", "/a/b/c"] {
            assert!(!backend.exists(key, false).wait().expect("exists").exists());
        }
        assert!(backend.exists("/ab", false).wait().expect("exists").exists());
    }

    #[test]
    fn erase_with_stale_version_is_bad_version() {
        let backend = MemoryBackend::new();
        let v = backend.create("/k", b"", false).wait().expect("create").version;
        assert_eq!(backend.erase("/k", v + 1).wait(), Err(MemoryError::BadVersion));
        assert_eq!(backend.erase("/missing", 0).wait(), Err(MemoryError::NoNode));
    }

    #[test]
    fn exists_watch_fires_on_creation() {
        let backend = MemoryBackend::new();
        let mut absent = backend.exists("/k", true).wait().expect("exists");
        let watch = absent.take_watch().expect("watch requested");
        assert!(!watch.wait_for(Duration::ZERO));
        backend.create("/k", b"", false).wait().expect("create");
        assert!(watch.wait_for(Duration::ZERO));
    }

    #[test]
    fn dropped_watches_are_pruned() {
        let backend = MemoryBackend::new();
        backend.create("/k", b"", false).wait().expect("create");
        for _ in 0..10 {
            drop(backend.get("/k", true).wait().expect("get"));
        }
        let _kept = backend.get("/k", true).wait().expect("get");
        assert_eq!(backend.store.lock().watches["/k"].len(), 1);
    }

    #[test]
    fn dropped_watches_on_other_keys_are_pruned() {
        let backend = MemoryBackend::new();
        for i in 0..100 {
            let key = format!("/k{i}");
            backend.create(&key, b"", false).wait().expect("create");
            drop(backend.get(&key, true).wait().expect("get"));
        }
        let _kept = backend.exists("/other", true).wait().expect("exists");
        let store = backend.store.lock();
        assert_eq!(store.watches.len(), 1);
        assert_eq!(store.watches["/other"].len(), 1);
    }

    #[test]
    fn expire_session_removes_leased_entries() {
        let backend = MemoryBackend::new();
        backend.create("/eph", b"", true).wait().expect("create");
        backend.create("/keep", b"", false).wait().expect("create");
        let mut res = backend.exists("/eph", true).wait().expect("exists");
        let watch = res.take_watch().expect("watch");
        backend.expire_session();
        assert!(watch.wait_for(Duration::ZERO));
        assert!(!backend.exists("/eph", false).wait().expect("exists").exists());
        assert!(backend.exists("/keep", false).wait().expect("exists").exists());
    }

    #[test]
    fn transaction_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        let v = backend.create("/d", b"", false).wait().expect("create").version;
        let txn = Transaction::new().set("/e", "x").check("/d", v + 100);
        assert_eq!(backend.commit(txn).wait(), Err(MemoryError::BadVersion));
        assert_eq!(backend.get("/e", false).wait().map(|r| r.value), Err(MemoryError::NoNode));
    }

    #[test]
    fn transaction_sees_effects_of_preceding_ops() {
        let backend = MemoryBackend::new();
        let txn = Transaction::new().create("/p", "1").set("/p", "2").erase("/p", 0);
        let result = backend.commit(txn).wait().expect("commit");
        assert_eq!(result.len(), 3);
        assert!(!backend.exists("/p", false).wait().expect("exists").exists());

        let txn = Transaction::new().create("/q", "1").create("/q", "2");
        assert_eq!(backend.commit(txn).wait(), Err(MemoryError::NodeExists));
    }

    #[test]
    fn transaction_erase_hides_the_subtree_from_later_ops() {
        let backend = MemoryBackend::new();
        backend.create("/a", b"", false).wait().expect("create");
        backend.create("/a/b", b"", false).wait().expect("create");

        let txn = Transaction::new().erase("/a", 0).check("/a/b", 0);
        assert_eq!(backend.commit(txn).wait(), Err(MemoryError::NoNode));
        assert!(backend.exists("/a", false).wait().expect("exists").exists());
        assert!(backend.exists("/a/b", false).wait().expect("exists").exists());

        let txn = Transaction::new().erase("/a", 0).create("/a/b", "x");
        let result = backend.commit(txn).wait().expect("commit");
        assert_eq!(result.len(), 2);
        assert!(!backend.exists("/a", false).wait().expect("exists").exists());
        assert_eq!(backend.get("/a/b", false).wait().expect("get").value, b"x");
    }

    #[test]
    fn transaction_erase_drops_keys_staged_below_it() {
        let backend = MemoryBackend::new();
        backend.create("/a", b"", false).wait().expect("create");
        let txn = Transaction::new()
            .create("/a/new", "x")
            .erase("/a", 0)
            .check("/a/new", 0);
        assert_eq!(backend.commit(txn).wait(), Err(MemoryError::NoNode));
        assert!(!backend.exists("/a/new", false).wait().expect("exists").exists());
    }

    #[test]
    fn erasing_the_root_clears_the_store() {
        let backend = MemoryBackend::new();
        for key in ["/", "/a", "/a/b", "/z"] {
            backend.create(key, b"", false).wait().expect("create");
        }
        let mut res = backend.exists("/a/b", true).wait().expect("exists");
        let watch = res.take_watch().expect("watch requested");
        backend.erase("/", 0).wait().expect("erase");
        for key in ["/", "/a", "/a/b", "/z"] {
            assert!(!backend.exists(key, false).wait().expect("exists").exists());
        }
        assert!(watch.wait_for(Duration::ZERO));
    }

    #[test]
    fn keys_must_be_absolute_paths() {
        let backend = MemoryBackend::new();
        for bad in ["", "relative", "/trailing/", "/double//slash"] {
            assert!(matches!(
                backend.get(bad, false).wait(),
                Err(MemoryError::BadKey(_))
            ));
        }
    }
}
