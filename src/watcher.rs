use {
    crate::{
        error::Error,
        result::{WatchHandle, WatchTrigger},
        retry::{retry_etcd, RetryPolicy},
    },
    etcd_client::WatchOptions,
    tokio_stream::StreamExt,
    tracing::{error, trace, warn},
};

pub trait KeyWatchExt {
    fn get_etcd_client(&self) -> etcd_client::Client;

    ///
    /// Returns a handle that fires on the first change of `key` at or after `start_revision`.
    ///
    /// Pass the header revision of the read that produced the watch, plus one, so that no change
    /// made after the read is missed. The watch runs on the current tokio runtime.
    ///
    /// Dropping the handle cancels the etcd watch. A broken stream is reopened from
    /// `start_revision` at most `policy.attempts` times before the handle fails with
    /// [`Error::ConnectionLoss`].
    ///
    fn watch_once(&self, key: String, start_revision: i64, policy: RetryPolicy) -> WatchHandle {
        let etcd = self.get_etcd_client();
        let (trigger, handle) = WatchHandle::channel();
        tokio::spawn(notify_on_change(etcd, key, start_revision, policy, trigger));
        handle
    }
}

async fn notify_on_change(
    etcd: etcd_client::Client,
    key: String,
    start_revision: i64,
    policy: RetryPolicy,
    mut trigger: WatchTrigger,
) {
    let mut reopens = 0;
    'outer: loop {
        let opened = tokio::select! {
            opened = retry_etcd(
                etcd.clone(),
                policy,
                (key.clone(), start_revision),
                |mut etcd, (key, rev)| async move {
                    let wopts = WatchOptions::new().with_start_revision(rev);
                    etcd.watch(key, Some(wopts)).await
                },
            ) => opened,
            _ = trigger.abandoned() => {
                trace!("watch on {key} abandoned before it was opened");
                return;
            }
        };

        let (mut watcher, mut stream) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                error!("failed to open watch on {key}: {e:?}");
                trigger.fail(Error::ConnectionLoss);
                return;
            }
        };

        'inner: loop {
            tokio::select! {
                watch_resp = stream.next() => match watch_resp {
                    Some(Ok(watch_resp)) => {
                        if !watch_resp.events().is_empty() {
                            let _ = watcher.cancel().await;
                            trigger.fire();
                            return;
                        }
                        if watch_resp.canceled() {
                            // This is probably because the compaction_revision < start revision
                            error!("watch on {key} cancelled: {watch_resp:?}");
                            trigger.fail(Error::ConnectionLoss);
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("watch stream error on {key}: {e:?}");
                        break 'inner;
                    }
                    None => {
                        warn!("watch stream on {key} ended");
                        break 'inner;
                    }
                },
                _ = trigger.abandoned() => {
                    trace!("watch on {key} abandoned");
                    let _ = watcher.cancel().await;
                    return;
                }
            }
        }

        let _ = watcher.cancel().await;
        reopens += 1;
        if reopens > policy.attempts {
            error!("giving up on watch on {key} after {reopens} attempts");
            break 'outer;
        }
    }
    trigger.fail(Error::ConnectionLoss);
}

impl KeyWatchExt for etcd_client::Client {
    fn get_etcd_client(&self) -> etcd_client::Client {
        self.clone()
    }
}
