use rust_coordkv::{backend::memory::MemoryBackend, Client, Transaction};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let client = Client::new(MemoryBackend::new()).expect("failed to build client");

    let created = client.create("/a", "v1").wait().expect("failed to create /a");
    let fetched = client.get("/a", false).wait().expect("failed to get /a");
    println!(
        "/a = {:?} at version {} (created at {})",
        String::from_utf8_lossy(&fetched.value),
        fetched.version,
        created.version
    );

    let v0 = client.create("/b", "v0").wait().expect("failed to create /b").version;
    let cas = client.cas("/b", "v1", v0 + 1).wait().expect("cas failed");
    println!("cas on /b with a stale version: success={}, observed version {}", cas.success, cas.version);

    client.create("/c", "v0").wait().expect("failed to create /c");
    let mut res = client.get("/c", true).wait().expect("failed to get /c");
    let watch = res.take_watch().expect("watch requested");
    client.set("/c", "v1").wait().expect("failed to set /c");
    watch.wait().expect("watch failed");
    println!("watch on /c fired");

    match client.get("/missing", false).wait() {
        Ok(_) => println!("/missing unexpectedly exists"),
        Err(e) => println!("get /missing failed: {e}"),
    }

    let txn = Transaction::new().check("/b", 42).set("/e", "x");
    match client.transaction(txn).wait() {
        Ok(_) => println!("transaction unexpectedly committed"),
        Err(e) => println!("transaction aborted: {e}"),
    }
}
