use {
    crate::retry::{retry_etcd, RetryPolicy},
    futures::StreamExt,
    std::time::Duration,
    tokio::{
        sync::{broadcast, mpsc, oneshot},
        task::{JoinHandle, JoinSet},
        time::{self, MissedTickBehavior},
    },
    tracing::{debug, error, warn},
};

///
/// Managed lease instance that will keep the lease alive until it is dropped.
///
/// Keys written with this lease are the session's ephemeral entries: they disappear once the lease
/// is revoked or expires.
///
/// See [`ManagedLeaseFactory::new_lease`] for more information.
///
pub struct ManagedLease {
    etcd: etcd_client::Client,
    pub lease_id: i64,
    // Let this field dead, because when drop it will trigger a task to wake up and gracefully revoke lease.
    #[allow(dead_code)]
    _tx_terminate: oneshot::Sender<()>,

    rx_lease_expire: broadcast::Receiver<()>,
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease operation failed: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("invalid lease ttl, must be at least 2 seconds")]
    InvalidTtl,
    #[error("invalid keepalive interval, must be non-zero and shorter than the ttl")]
    InvalidKeepAlive,
    #[error("managed lease factory is stopped")]
    FactoryStopped,
}

impl ManagedLease {
    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }

    pub fn get_lease_expire_notify(&self) -> LeaseExpiredNotify {
        LeaseExpiredNotify {
            inner: self.rx_lease_expire.resubscribe(),
        }
    }

    pub async fn is_alive(&self) -> Result<bool, etcd_client::Error> {
        let result = retry_etcd(
            self.etcd.clone(),
            RetryPolicy::default(),
            (self.lease_id,),
            |etcd, (lease_id,)| async move {
                let resp = etcd.lease_client().time_to_live(lease_id, None).await?;
                Ok(resp.ttl() > 0)
            },
        )
        .await;

        match result {
            Err(etcd_client::Error::GRpcStatus(status))
                if status.code() == tonic::Code::NotFound =>
            {
                Ok(false)
            }
            other => other,
        }
    }
}

///
/// Managed lease factory that will create a new lease and keep it alive until it is dropped.
///
#[derive(Clone)]
pub struct ManagedLeaseFactory {
    cnc_tx: mpsc::Sender<CreateLeaseCommand>,
}

///
/// Notify when the lease has expired.
///
pub struct LeaseExpiredNotify {
    inner: broadcast::Receiver<()>,
}

impl LeaseExpiredNotify {
    ///
    /// Wait until the lease has expired.
    ///
    pub async fn recv(mut self) {
        let _ = self.inner.recv().await;
    }
}

impl Clone for LeaseExpiredNotify {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.resubscribe(),
        }
    }
}

struct CreateLeaseCommand {
    ttl: Duration,
    keepalive_interval: Option<Duration>,
    callback: oneshot::Sender<Result<ManagedLease, LeaseError>>,
}

///
/// Managed lease factory runtime that will handle the lease creation and keep alive.
/// This is a separate task that will run in the background.
///
struct ManagedLeaseFactoryRuntime {
    etcd: etcd_client::Client,
    rt: tokio::runtime::Handle,
    js: JoinSet<()>,
    cnc_rx: mpsc::Receiver<CreateLeaseCommand>,
}

///
/// Outcome of one keep-alive stream.
///
enum Renewal {
    // The lease owner was dropped.
    Stopped,
    // etcd no longer renews the lease, its ephemeral keys are gone.
    Lost,
    // The stream broke while the lease may still be alive.
    Reopen,
}

///
/// Renews the session lease every `every` until the owner stops it or etcd gives it up, then
/// revokes it when stopped.
///
async fn keep_alive_loop(
    client: etcd_client::Client,
    lease_id: i64,
    every: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        match renew(&client, lease_id, every, &mut stop_rx).await {
            Renewal::Reopen => continue,
            Renewal::Lost => return,
            Renewal::Stopped => {
                revoke(client, lease_id).await;
                return;
            }
        }
    }
}

async fn renew(
    client: &etcd_client::Client,
    lease_id: i64,
    every: Duration,
    stop_rx: &mut oneshot::Receiver<()>,
) -> Renewal {
    let opened = retry_etcd(
        client.clone(),
        RetryPolicy::default(),
        (lease_id,),
        |mut client, (lease_id,)| async move { client.lease_keep_alive(lease_id).await },
    )
    .await;
    let (mut keeper, mut responses) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            error!("cannot renew session lease {lease_id}: {e:?}");
            return Renewal::Lost;
        }
    };

    let mut ticks = time::interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => {}
            _ = &mut *stop_rx => return Renewal::Stopped,
        }
        if let Err(e) = keeper.keep_alive().await {
            warn!("session lease {lease_id} renewal failed: {e:?}");
            return Renewal::Reopen;
        }
        match responses.next().await {
            Some(Ok(resp)) if resp.ttl() > 0 => {}
            Some(Ok(_)) => {
                error!("session lease {lease_id} expired");
                return Renewal::Lost;
            }
            Some(Err(e)) => {
                warn!("session lease {lease_id} renewal stream failed: {e:?}");
                return Renewal::Reopen;
            }
            None => return Renewal::Reopen,
        }
    }
}

async fn revoke(client: etcd_client::Client, lease_id: i64) {
    let revoked = retry_etcd(
        client,
        RetryPolicy::default(),
        (lease_id,),
        |mut client, (lease_id,)| async move {
            match client.lease_revoke(lease_id).await {
                Ok(_) => Ok(()),
                // Already expired on the server side.
                Err(etcd_client::Error::GRpcStatus(status))
                    if status.code() == tonic::Code::NotFound =>
                {
                    Ok(())
                }
                Err(e) => Err(e),
            }
        },
    )
    .await;
    match revoked {
        Ok(()) => debug!("session lease {lease_id} revoked"),
        Err(e) => error!("failed to revoke session lease {lease_id}: {e:?}"),
    }
}

impl ManagedLeaseFactoryRuntime {
    async fn handle_create_lease(&mut self, cmd: CreateLeaseCommand) {
        let CreateLeaseCommand {
            ttl,
            keepalive_interval,
            callback,
        } = cmd;
        let ttl_secs = ttl.as_secs() as i64;
        let lease_result = retry_etcd(
            self.etcd.clone(),
            RetryPolicy::default(),
            (),
            move |mut etcd, _| async move { etcd.lease_grant(ttl_secs, None).await },
        )
        .await;
        let lease_id = match lease_result {
            Ok(lease) => lease.id(),
            Err(e) => {
                let _ = callback.send(Err(e.into()));
                return;
            }
        };
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let client = self.etcd.clone();
        let (tx_expired, rx_expired) = broadcast::channel(1);
        let keepalive_interval =
            keepalive_interval.unwrap_or(Duration::from_secs((ttl_secs / 2) as u64));
        self.js.spawn_on(
            async move {
                keep_alive_loop(client, lease_id, keepalive_interval, stop_rx).await;
                let _ = tx_expired.send(());
            },
            &self.rt,
        );
        let lease = ManagedLease {
            etcd: self.etcd.clone(),
            lease_id,
            _tx_terminate: stop_tx,
            rx_lease_expire: rx_expired,
        };
        let _ = callback.send(Ok(lease));
    }

    async fn run(mut self) {
        loop {
            // Loops ends when both the command channel and the join set are closed.
            // When command-and-control channel is closed, it means no `ManagedLeaseFactory` exists anymore.
            // However, the join set may still have tasks running, we must wait for them to finish.
            tokio::select! {
                Some(cmd) = self.cnc_rx.recv() => {
                    self.handle_create_lease(cmd).await;
                }
                Some(res) = self.js.join_next() => {
                    match res {
                        Ok(_) => {
                            tracing::trace!("managed lease task completed");
                        }
                        Err(e) => {
                            tracing::warn!("task failed: {e:?}");
                        }
                    }
                }
                else => {
                    break;
                }
            }
        }
        tracing::trace!("managed lease factory runtime exiting");
    }
}

impl ManagedLeaseFactory {
    ///
    /// Create a new managed lease factory.
    /// This will spawn a new task that will handle the lease creation and keep alive.
    ///
    pub fn spawn(etcd: etcd_client::Client) -> (Self, JoinHandle<()>) {
        Self::spawn_on(etcd, tokio::runtime::Handle::current())
    }

    ///
    /// Create a new managed lease factory.
    /// This will spawn a new task that will handle the lease creation and keep alive.
    ///
    /// Arguments:
    /// * `etcd` - The etcd client to use.
    /// * `rt` - The runtime handle to spawn tasks on.
    pub fn spawn_on(
        etcd: etcd_client::Client,
        rt: tokio::runtime::Handle,
    ) -> (Self, JoinHandle<()>) {
        let (cnc_tx, cnc_rx) = mpsc::channel(100);
        let lease_rt = ManagedLeaseFactoryRuntime {
            etcd,
            rt: rt.clone(),
            js: JoinSet::new(),
            cnc_rx,
        };
        let jh = rt.spawn(lease_rt.run());
        (Self { cnc_tx }, jh)
    }

    ///
    /// Create a new managed lease with the given time-to-live (TTL) and keepalive interval.
    ///
    /// Managed lease have automatic keep alive mechanism that will keep the lease alive until it is dropped.
    ///
    /// The ttl must be at least two (2) seconds.
    ///
    /// Keepalive interval is optional, if not provided it will be half of the ttl.
    ///
    pub async fn new_lease(
        &self,
        ttl: Duration,
        keepalive_interval: Option<Duration>,
    ) -> Result<ManagedLease, LeaseError> {
        if ttl.as_secs() < 2 {
            return Err(LeaseError::InvalidTtl);
        }
        if keepalive_interval.is_some_and(|every| every.is_zero() || every >= ttl) {
            return Err(LeaseError::InvalidKeepAlive);
        }
        let (callback_tx, callback_rx) = oneshot::channel();
        let command = CreateLeaseCommand {
            ttl,
            keepalive_interval,
            callback: callback_tx,
        };
        self.cnc_tx
            .send(command)
            .await
            .map_err(|_| LeaseError::FactoryStopped)?;

        callback_rx.await.map_err(|_| LeaseError::FactoryStopped)?
    }
}
