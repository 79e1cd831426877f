use {
    retry::delay::Exponential,
    serde::{Deserialize, Serialize},
    std::{error::Error, future::Future, time::Duration},
    tracing::{error, warn},
};

///
/// Returns true for failures caused by "outside" forces, such as a network partition, that may go
/// away if the call is repeated.
///
pub fn is_transient(err: &etcd_client::Error) -> bool {
    match err {
        etcd_client::Error::GRpcStatus(status) => match status.code() {
            tonic::Code::Ok => false,
            tonic::Code::Cancelled => false,
            tonic::Code::Unknown => status.source().is_none(),
            tonic::Code::InvalidArgument => false,
            tonic::Code::DeadlineExceeded => true,
            tonic::Code::NotFound => false,
            tonic::Code::AlreadyExists => false,
            tonic::Code::PermissionDenied => false,
            tonic::Code::ResourceExhausted => true,
            tonic::Code::FailedPrecondition => false,
            tonic::Code::Aborted => false,
            tonic::Code::OutOfRange => false,
            tonic::Code::Unimplemented => false,
            tonic::Code::Internal => true,
            tonic::Code::Unavailable => true,
            tonic::Code::DataLoss => true,
            tonic::Code::Unauthenticated => false,
        },
        etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => true,
        _ => false,
    }
}

///
/// Exponential back-off used when repeating idempotent etcd calls.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    ///
    /// Retries after the first attempt.
    ///
    pub attempts: usize,

    ///
    /// First delay in milliseconds, multiplied by ten on each retry.
    ///
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 10,
        }
    }
}

impl RetryPolicy {
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        Exponential::from_millis_with_factor(self.base_delay_ms, 10.0).take(self.attempts)
    }
}

///
/// Retry an etcd operation by captures a reusable args and a closure that compute the future to try.
///
/// Only transient failures (see [`is_transient`]) are retried, with the delays of `policy`. A gRPC
/// "Not found" for example is returned right away.
///
/// Examples
///
/// ```no_run
/// # async fn run() -> Result<(), etcd_client::Error> {
/// use rust_coordkv::retry::{retry_etcd, RetryPolicy};
///
/// let etcd = etcd_client::Client::connect(["http://localhost:2379"], None).await?;
///
/// let resp = retry_etcd(
///     etcd.clone(),
///     RetryPolicy::default(),
///     ("/my/key".to_string(),),
///     move |etcd, (key,)| async move { etcd.kv_client().get(key, None).await },
/// )
/// .await?;
/// # let _ = resp;
/// # Ok(())
/// # }
/// ```
///
pub async fn retry_etcd<A, T, F, Fut>(
    etcd: etcd_client::Client,
    policy: RetryPolicy,
    reusable_args: A,
    mut f: F,
) -> Result<T, etcd_client::Error>
where
    A: Clone + Send + 'static,
    Fut: Future<Output = Result<T, etcd_client::Error>> + Send + 'static,
    F: FnMut(etcd_client::Client, A) -> Fut,
    T: Send + 'static,
{
    let mut delays = policy.delays();
    loop {
        match f(etcd.clone(), reusable_args.clone()).await {
            Ok(o) => return Ok(o),
            Err(e) => {
                if is_transient(&e) {
                    warn!("failed due to transient state {:?}", e);
                    match delays.next() {
                        Some(duration) => {
                            tokio::time::sleep(duration).await;
                        }
                        None => return Err(e),
                    }
                } else {
                    error!("failed due to non-transient state: {:?}", e);
                    return Err(e);
                }
            }
        }
    }
}

pub async fn retry_etcd_get(
    etcd: etcd_client::Client,
    policy: RetryPolicy,
    key: String,
    opts: Option<etcd_client::GetOptions>,
) -> Result<etcd_client::GetResponse, etcd_client::Error> {
    retry_etcd(etcd, policy, (key, opts), move |etcd, (key, opts)| async move {
        etcd.kv_client().get(key, opts).await
    })
    .await
}
