use {
    super::{is_valid_key, Backend, SetPolicy},
    crate::{
        deferred::{self, Broken, Deferred},
        error::{ErrorKind, Translate},
        lease::{LeaseError, ManagedLease, ManagedLeaseFactory},
        result::{
            CasResult, CreateResult, ExistsResult, GetResult, OpResult, SetResult,
            TransactionResult,
        },
        retry::{is_transient, retry_etcd_get, RetryPolicy},
        txn::{Transaction, TxnOp},
        watcher::KeyWatchExt,
        Version,
    },
    etcd_client::{
        Compare, CompareOp, DeleteOptions, GetResponse, KeyValue, PutOptions, ResponseHeader, Txn,
        TxnOp as EtcdOp, TxnOpResponse,
    },
    parking_lot::Mutex,
    serde::{Deserialize, Serialize},
    std::{future::Future, time::Duration},
    tracing::{error, trace},
};

///
/// Connection settings of [`EtcdBackend`].
///
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,

    ///
    /// Time-to-live of the session lease backing leased entries.
    ///
    pub session_ttl_secs: u64,

    ///
    /// Renewal interval of the session lease, half the ttl when unset.
    ///
    pub keepalive_interval_ms: Option<u64>,

    pub set_policy: SetPolicy,
    pub retry_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            session_ttl_secs: 10,
            keepalive_interval_ms: None,
            set_policy: SetPolicy::default(),
            retry_attempts: 3,
            retry_base_delay_ms: 10,
        }
    }
}

impl EtcdConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base_delay_ms: self.retry_base_delay_ms,
        }
    }
}

///
/// Native failure vocabulary of [`EtcdBackend`].
///
#[derive(Debug, thiserror::Error)]
pub enum EtcdError {
    #[error(transparent)]
    Client(#[from] etcd_client::Error),
    #[error("key not found")]
    KeyNotFound,
    #[error("key already exists")]
    KeyExists,
    #[error("compare failed")]
    CompareFailed,
    #[error("bad key: {0:?}")]
    BadKey(String),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Broken(#[from] Broken),
}

fn classify_client_error(err: &etcd_client::Error) -> Option<ErrorKind> {
    match err {
        etcd_client::Error::InvalidUri(_) => Some(ErrorKind::InvalidAddress),
        etcd_client::Error::GRpcStatus(status)
            if status.code() == tonic::Code::InvalidArgument
                && status.message().contains("key") =>
        {
            Some(ErrorKind::InvalidKey)
        }
        err if is_transient(err) => Some(ErrorKind::ConnectionLoss),
        _ => None,
    }
}

impl Translate for EtcdError {
    fn classify(&self) -> Option<ErrorKind> {
        match self {
            Self::Client(err) | Self::Lease(LeaseError::Etcd(err)) => classify_client_error(err),
            Self::KeyNotFound => Some(ErrorKind::NoEntry),
            Self::KeyExists => Some(ErrorKind::EntryExists),
            Self::CompareFailed => Some(ErrorKind::VersionMismatch),
            Self::BadKey(_) => Some(ErrorKind::InvalidKey),
            Self::Lease(LeaseError::FactoryStopped) | Self::Broken(Broken::Abandoned) => {
                Some(ErrorKind::ConnectionLoss)
            }
            Self::Lease(LeaseError::InvalidTtl) | Self::Broken(Broken::Panicked(_)) => None,
        }
    }
}

fn header_revision(header: Option<&ResponseHeader>) -> Version {
    header.map(|h| h.revision()).unwrap_or_default() as Version
}

fn first_kv(mut resp: GetResponse) -> Option<KeyValue> {
    resp.take_kvs().into_iter().next()
}

fn range_response(resp: Option<TxnOpResponse>) -> Option<KeyValue> {
    match resp {
        Some(TxnOpResponse::Get(get)) => first_kv(get),
        _ => None,
    }
}

///
/// Range prefix covering every descendant of `key`.
///
fn descendant_prefix(key: &str) -> String {
    if key == "/" {
        key.to_string()
    } else {
        format!("{key}/")
    }
}

fn subtree_delete(key: &str) -> Vec<EtcdOp> {
    let descendants = EtcdOp::delete(descendant_prefix(key), Some(DeleteOptions::new().with_prefix()));
    if key == "/" {
        // The root prefix already matches the root key itself.
        vec![descendants]
    } else {
        vec![EtcdOp::delete(key, None), descendants]
    }
}

///
/// Guard of `expected` on `key`: any version when `0`, otherwise an exact `mod_revision`.
///
fn version_guard(key: &str, expected: Version) -> Compare {
    if expected == 0 {
        Compare::version(key, CompareOp::Greater, 0)
    } else {
        Compare::mod_revision(key, CompareOp::Equal, expected as i64)
    }
}

///
/// Finds why `op` could not apply, given the state of its key before the transaction.
///
fn violation(op: &TxnOp, policy: SetPolicy, current: Option<&KeyValue>) -> Option<EtcdError> {
    match (op, current) {
        (TxnOp::Check { .. }, None) | (TxnOp::Erase { .. }, None) => Some(EtcdError::KeyNotFound),
        (TxnOp::Check { version, .. }, Some(kv)) | (TxnOp::Erase { version, .. }, Some(kv))
            if *version != 0 && kv.mod_revision() as Version != *version =>
        {
            Some(EtcdError::CompareFailed)
        }
        (TxnOp::Create { .. }, Some(_)) => Some(EtcdError::KeyExists),
        (TxnOp::Set { .. }, None) if policy == SetPolicy::RequireExisting => {
            Some(EtcdError::KeyNotFound)
        }
        _ => None,
    }
}

///
/// Coordination backend served by an etcd cluster.
///
/// An entry's version is its `mod_revision`. Leased entries are attached to a session lease kept
/// alive in the background for as long as the backend lives: they disappear once it is dropped or
/// the lease expires.
///
/// Every operation is spawned on the tokio runtime the backend was connected from and completes
/// the returned deferred from there.
///
/// Transactions are evaluated by etcd against the state before the transaction, and etcd rejects
/// a transaction that writes the same key twice.
///
pub struct EtcdBackend {
    etcd: etcd_client::Client,
    rt: tokio::runtime::Handle,
    config: EtcdConfig,
    session_lease_id: i64,
    // Dropping the lease revokes it.
    _session: Mutex<ManagedLease>,
}

impl EtcdBackend {
    pub async fn connect(config: EtcdConfig) -> Result<Self, EtcdError> {
        let etcd = etcd_client::Client::connect(config.endpoints.clone(), None).await?;
        Self::from_client(etcd, config).await
    }

    ///
    /// Builds the backend over an existing client and opens its session lease.
    ///
    pub async fn from_client(
        etcd: etcd_client::Client,
        config: EtcdConfig,
    ) -> Result<Self, EtcdError> {
        let rt = tokio::runtime::Handle::current();
        let (lease_factory, _) = ManagedLeaseFactory::spawn_on(etcd.clone(), rt.clone());
        let session = lease_factory
            .new_lease(
                Duration::from_secs(config.session_ttl_secs),
                config.keepalive_interval_ms.map(Duration::from_millis),
            )
            .await?;
        let session_lease_id = session.lease_id();
        let expired = session.get_lease_expire_notify();
        rt.spawn(async move {
            expired.recv().await;
            trace!("session lease {session_lease_id:?} is gone");
        });
        Ok(Self {
            etcd,
            rt,
            config,
            session_lease_id,
            _session: Mutex::new(session),
        })
    }

    pub fn session_lease_id(&self) -> i64 {
        self.session_lease_id
    }

    pub fn etcd(&self) -> &etcd_client::Client {
        &self.etcd
    }

    pub fn config(&self) -> &EtcdConfig {
        &self.config
    }

    fn dispatch<T, F, Fut>(&self, key: &str, f: F) -> Deferred<T, EtcdError>
    where
        T: Send + 'static,
        F: FnOnce(etcd_client::Client, String) -> Fut,
        Fut: Future<Output = Result<T, EtcdError>> + Send + 'static,
    {
        if !is_valid_key(key) {
            return Deferred::failed(EtcdError::BadKey(key.to_string()));
        }
        let (promise, deferred) = deferred::channel();
        let fut = f(self.etcd.clone(), key.to_string());
        self.rt.spawn(async move {
            promise.set(fut.await);
        });
        deferred
    }

    fn lease_opts(&self, leased: bool) -> Option<PutOptions> {
        leased.then(|| PutOptions::new().with_lease(self.session_lease_id))
    }
}

async fn read_key(
    etcd: etcd_client::Client,
    policy: RetryPolicy,
    key: String,
) -> Result<(Option<KeyValue>, Version), EtcdError> {
    let resp = retry_etcd_get(etcd, policy, key, None).await?;
    let revision = header_revision(resp.header());
    Ok((first_kv(resp), revision))
}

async fn commit_txn(
    mut etcd: etcd_client::Client,
    etcd_txn: Txn,
    txn: Transaction,
    policy: SetPolicy,
) -> Result<TransactionResult, EtcdError> {
    let resp = etcd.txn(etcd_txn).await?;
    let mut responses = resp.op_responses().into_iter();
    if !resp.succeeded() {
        for op in txn.iter() {
            let current = range_response(responses.next());
            if let Some(err) = violation(op, policy, current.as_ref()) {
                trace!("transaction failed on {} {}", op.kind(), op.key());
                return Err(err);
            }
        }
        return Err(EtcdError::CompareFailed);
    }
    let version = header_revision(resp.header());
    let mut results = TransactionResult::new();
    for op in txn.iter() {
        let result = match op {
            TxnOp::Check { .. } => OpResult::Check {
                version: range_response(responses.next())
                    .map(|kv| kv.mod_revision() as Version)
                    .unwrap_or_default(),
            },
            TxnOp::Create { .. } => {
                responses.next();
                OpResult::Create(CreateResult { version })
            }
            TxnOp::Set { .. } => {
                responses.next();
                OpResult::Set(SetResult { version })
            }
            TxnOp::Erase { .. } => {
                responses.nth(1);
                OpResult::Erase
            }
        };
        results.push(result);
    }
    Ok(results)
}

impl Backend for EtcdBackend {
    type Error = EtcdError;

    fn set_policy(&self) -> SetPolicy {
        self.config.set_policy
    }

    fn create(&self, key: &str, value: &[u8], leased: bool) -> Deferred<CreateResult, EtcdError> {
        let value = value.to_vec();
        let put_opts = self.lease_opts(leased);
        self.dispatch(key, move |mut etcd, key| async move {
            let txn = Txn::new()
                .when(vec![Compare::version(key.as_str(), CompareOp::Equal, 0)])
                .and_then(vec![EtcdOp::put(key.as_str(), value, put_opts)]);
            let resp = etcd.txn(txn).await?;
            if !resp.succeeded() {
                return Err(EtcdError::KeyExists);
            }
            Ok(CreateResult {
                version: header_revision(resp.header()),
            })
        })
    }

    fn set(&self, key: &str, value: &[u8]) -> Deferred<SetResult, EtcdError> {
        let value = value.to_vec();
        let policy = self.config.set_policy;
        self.dispatch(key, move |mut etcd, key| async move {
            let version = match policy {
                SetPolicy::Upsert => {
                    let resp = etcd.put(key, value, None).await?;
                    header_revision(resp.header())
                }
                SetPolicy::RequireExisting => {
                    let txn = Txn::new()
                        .when(vec![Compare::version(key.as_str(), CompareOp::Greater, 0)])
                        .and_then(vec![EtcdOp::put(key.as_str(), value, None)]);
                    let resp = etcd.txn(txn).await?;
                    if !resp.succeeded() {
                        return Err(EtcdError::KeyNotFound);
                    }
                    header_revision(resp.header())
                }
            };
            Ok(SetResult { version })
        })
    }

    fn cas(&self, key: &str, value: &[u8], expected: Version) -> Deferred<CasResult, EtcdError> {
        let value = value.to_vec();
        self.dispatch(key, move |mut etcd, key| async move {
            let guard = if expected == 0 {
                Compare::version(key.as_str(), CompareOp::Equal, 0)
            } else {
                Compare::mod_revision(key.as_str(), CompareOp::Equal, expected as i64)
            };
            let txn = Txn::new()
                .when(vec![guard])
                .and_then(vec![EtcdOp::put(key.as_str(), value, None)])
                .or_else(vec![EtcdOp::get(key.as_str(), None)]);
            let resp = etcd.txn(txn).await?;
            if resp.succeeded() {
                return Ok(CasResult {
                    success: true,
                    version: header_revision(resp.header()),
                });
            }
            match range_response(resp.op_responses().into_iter().next()) {
                Some(kv) => Ok(CasResult {
                    success: false,
                    version: kv.mod_revision() as Version,
                }),
                None => Err(EtcdError::KeyNotFound),
            }
        })
    }

    fn get(&self, key: &str, watch: bool) -> Deferred<GetResult, EtcdError> {
        let policy = self.config.retry_policy();
        self.dispatch(key, move |etcd, key| async move {
            let (kv, revision) = read_key(etcd.clone(), policy, key.clone()).await?;
            let kv = kv.ok_or(EtcdError::KeyNotFound)?;
            let watch = watch.then(|| etcd.watch_once(key, revision as i64 + 1, policy));
            Ok(GetResult {
                version: kv.mod_revision() as Version,
                value: kv.value().to_vec(),
                watch,
            })
        })
    }

    fn exists(&self, key: &str, watch: bool) -> Deferred<ExistsResult, EtcdError> {
        let policy = self.config.retry_policy();
        self.dispatch(key, move |etcd, key| async move {
            let (kv, revision) = read_key(etcd.clone(), policy, key.clone()).await?;
            let watch = watch.then(|| etcd.watch_once(key, revision as i64 + 1, policy));
            Ok(ExistsResult {
                exists: kv.is_some(),
                version: kv.map(|kv| kv.mod_revision() as Version).unwrap_or_default(),
                watch,
            })
        })
    }

    fn erase(&self, key: &str, expected: Version) -> Deferred<(), EtcdError> {
        self.dispatch(key, move |mut etcd, key| async move {
            let txn = Txn::new()
                .when(vec![version_guard(&key, expected)])
                .and_then(subtree_delete(&key))
                .or_else(vec![EtcdOp::get(key.as_str(), None)]);
            let resp = etcd.txn(txn).await?;
            if resp.succeeded() {
                return Ok(());
            }
            match range_response(resp.op_responses().into_iter().next()) {
                Some(_) => Err(EtcdError::CompareFailed),
                None => Err(EtcdError::KeyNotFound),
            }
        })
    }

    fn commit(&self, txn: Transaction) -> Deferred<TransactionResult, EtcdError> {
        if let Some(op) = txn.iter().find(|op| !is_valid_key(op.key())) {
            return Deferred::failed(EtcdError::BadKey(op.key().to_string()));
        }
        let policy = self.config.set_policy;
        let mut compares = Vec::new();
        let mut success_ops = Vec::new();
        let mut failure_ops = Vec::new();
        for op in txn.iter() {
            let key = op.key();
            match op {
                TxnOp::Check { version, .. } => {
                    compares.push(version_guard(key, *version));
                    success_ops.push(EtcdOp::get(key, None));
                }
                TxnOp::Create { value, leased, .. } => {
                    compares.push(Compare::version(key, CompareOp::Equal, 0));
                    success_ops.push(EtcdOp::put(key, value.clone(), self.lease_opts(*leased)));
                }
                TxnOp::Set { value, .. } => {
                    if policy == SetPolicy::RequireExisting {
                        compares.push(Compare::version(key, CompareOp::Greater, 0));
                    }
                    success_ops.push(EtcdOp::put(key, value.clone(), None));
                }
                TxnOp::Erase { version, .. } => {
                    compares.push(version_guard(key, *version));
                    success_ops.extend(subtree_delete(key));
                }
            }
            failure_ops.push(EtcdOp::get(key, None));
        }
        let etcd_txn = Txn::new()
            .when(compares)
            .and_then(success_ops)
            .or_else(failure_ops);

        let (promise, deferred) = deferred::channel();
        let etcd = self.etcd.clone();
        self.rt.spawn(async move {
            let result = commit_txn(etcd, etcd_txn, txn, policy).await;
            if let Err(e) = &result {
                if !matches!(
                    e,
                    EtcdError::KeyNotFound | EtcdError::KeyExists | EtcdError::CompareFailed
                ) {
                    error!("transaction commit failed: {e:?}");
                }
            }
            promise.set(result);
        });
        deferred
    }
}
