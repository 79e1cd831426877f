#![allow(dead_code)]

use {
    rust_coordkv::{
        backend::memory::{MemoryBackend, MemoryError},
        deferred, Backend, CasResult, CreateResult, Deferred, ExistsResult, GetResult, SetPolicy,
        SetResult, Transaction, TransactionResult, Version,
    },
    std::time::Duration,
};

pub async fn get_etcd_client() -> etcd_client::Client {
    etcd_client::Client::connect(["http://localhost:2379"], None)
        .await
        .expect("failed to connect to etcd")
}

pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

///
/// Memory backend whose results become ready only after `delay`, completed from tokio timers.
///
/// Every operation is applied to the store right away: only its result is held back.
///
#[derive(Clone)]
pub struct DelayedBackend {
    pub inner: MemoryBackend,
    delay: Duration,
    rt: tokio::runtime::Handle,
}

impl DelayedBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryBackend::new(),
            delay,
            rt: tokio::runtime::Handle::current(),
        }
    }

    fn delayed<T: Send + 'static>(
        &self,
        native: Deferred<T, MemoryError>,
    ) -> Deferred<T, MemoryError> {
        let (promise, deferred) = deferred::channel();
        let delay = self.delay;
        self.rt.spawn(async move {
            tokio::time::sleep(delay).await;
            promise.set(native.await);
        });
        deferred
    }
}

impl Backend for DelayedBackend {
    type Error = MemoryError;

    fn set_policy(&self) -> SetPolicy {
        self.inner.set_policy()
    }

    fn create(&self, key: &str, value: &[u8], leased: bool) -> Deferred<CreateResult, MemoryError> {
        self.delayed(self.inner.create(key, value, leased))
    }

    fn set(&self, key: &str, value: &[u8]) -> Deferred<SetResult, MemoryError> {
        self.delayed(self.inner.set(key, value))
    }

    fn cas(&self, key: &str, value: &[u8], expected: Version) -> Deferred<CasResult, MemoryError> {
        self.delayed(self.inner.cas(key, value, expected))
    }

    fn get(&self, key: &str, watch: bool) -> Deferred<GetResult, MemoryError> {
        self.delayed(self.inner.get(key, watch))
    }

    fn exists(&self, key: &str, watch: bool) -> Deferred<ExistsResult, MemoryError> {
        self.delayed(self.inner.exists(key, watch))
    }

    fn erase(&self, key: &str, expected: Version) -> Deferred<(), MemoryError> {
        self.delayed(self.inner.erase(key, expected))
    }

    fn commit(&self, txn: Transaction) -> Deferred<TransactionResult, MemoryError> {
        self.delayed(self.inner.commit(txn))
    }
}
