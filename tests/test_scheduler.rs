use {
    parking_lot::Mutex,
    rand::Rng,
    rust_coordkv::{deferred, Deferred, Error, Scheduler, SchedulerConfig},
    std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
};

mod common;

///
/// Returns a deferred completed by a tokio timer after `delay`.
///
fn timer(delay: Duration, value: usize) -> Deferred<usize, Error> {
    let (promise, deferred) = deferred::channel();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        promise.set_value(value);
    });
    deferred
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fan_out_completes_on_a_fixed_pool() {
    common::init_tracing();
    let scheduler = Scheduler::new(SchedulerConfig {
        number_of_threads: 4,
        ..Default::default()
    })
    .expect("scheduler");

    let threads = Arc::new(Mutex::new(HashSet::new()));
    let outputs: Vec<_> = {
        let mut rng = rand::thread_rng();
        (0..1000)
            .map(|i| {
                let input = timer(Duration::from_millis(rng.gen_range(1..=50)), i);
                let threads = Arc::clone(&threads);
                scheduler.then(input, move |ready| {
                    threads.lock().insert(thread::current().id());
                    ready.wait().map(|v| v * 2)
                })
            })
            .collect()
    };

    for (i, output) in outputs.into_iter().enumerate() {
        assert_eq!(output.await, Ok(i * 2));
    }

    let threads = threads.lock();
    assert!(!threads.is_empty());
    assert!(threads.len() <= 4, "observed {} threads", threads.len());
    assert_eq!(scheduler.active_workers(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_thread_single_object_completes_every_chain() {
    common::init_tracing();
    let scheduler = Scheduler::new(SchedulerConfig {
        number_of_threads: 1,
        objects_per_thread: 1,
        wait_for_object_ms: 1,
    })
    .expect("scheduler");

    // The first input is the slowest: later ones must not wait behind it.
    let slow = scheduler.then(timer(Duration::from_millis(300), 0), |d| d.wait());
    let fast: Vec<_> = (1..=5)
        .map(|i| scheduler.then(timer(Duration::from_millis(5), i), |d| d.wait()))
        .collect();

    for (i, output) in fast.into_iter().enumerate() {
        let value = tokio::time::timeout(Duration::from_millis(250), output)
            .await
            .expect("fast chain starved behind the slow one");
        assert_eq!(value, Ok(i + 1));
    }
    assert_eq!(slow.await, Ok(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_queued_continuations() {
    common::init_tracing();
    let scheduler = Scheduler::new(SchedulerConfig {
        number_of_threads: 2,
        ..Default::default()
    })
    .expect("scheduler");

    let ran = Arc::new(AtomicUsize::new(0));
    let outputs: Vec<_> = (0..20)
        .map(|i| {
            let ran = Arc::clone(&ran);
            scheduler.then(timer(Duration::from_millis(30), i), move |d| {
                ran.fetch_add(1, Ordering::SeqCst);
                d.wait()
            })
        })
        .collect();

    tokio::task::spawn_blocking(move || scheduler.shutdown())
        .await
        .expect("shutdown");

    assert_eq!(ran.load(Ordering::SeqCst), 20);
    for (i, output) in outputs.into_iter().enumerate() {
        assert_eq!(output.await, Ok(i));
    }
}
