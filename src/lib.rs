///
/// Canonical error vocabulary and the translation rule from backend-native failures.
///
pub mod error;

///
/// One-shot deferred results: the producer half is a [`deferred::Promise`], the consumer half a [`deferred::Deferred`].
///
pub mod deferred;

///
/// Result carriers returned by every coordination operation.
pub mod result;

///
/// Transaction operations and builder.
pub mod txn;

///
/// Thread-safe, closable multi-producer/multi-consumer queue.
///
pub mod queue;

///
/// Small worker pool that runs continuations once the deferred they wait on becomes ready.
///
/// A worker polls a handful of pending deferreds with a short timeout each, so many in-flight
/// operations share a few OS threads.
///
pub mod scheduler;

///
/// Public asynchronous surface over any [`backend::Backend`].
pub mod client;

///
/// Backend adapters and the interface they expose to the core.
///
pub mod backend;

///
/// Provides an API over "managed" lease
///
pub mod lease;

///
/// Utility function to manage various transient errors.
pub mod retry;

///
/// One-shot key watches over etcd
pub mod watcher;

///
/// Opaque per-key version, strictly increasing on every successful mutation.
///
/// `0` never names a stored version: guarded operations read it as "any version".
pub type Version = u64;

pub use {
    backend::{Backend, SetPolicy},
    client::Client,
    deferred::{Broken, Deferred, Promise},
    error::{Error, ErrorKind},
    result::{
        CasResult, CreateResult, ExistsResult, GetResult, OpResult, SetResult, TransactionResult,
        Versioned, WatchHandle,
    },
    scheduler::{Scheduler, SchedulerConfig},
    txn::{OpKind, Transaction, TxnOp},
};
