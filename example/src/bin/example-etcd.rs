use {
    rust_coordkv::{
        backend::etcd::{EtcdBackend, EtcdConfig},
        Client,
    },
    std::time::Duration,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let backend = EtcdBackend::connect(EtcdConfig::default())
        .await
        .expect("failed to connect to etcd");
    println!("session lease: {}", backend.session_lease_id());
    let client = Client::new(backend).expect("failed to build client");

    let owner = "/example/owner";
    // Leased entries are removed by etcd once this process is gone.
    match client.create_leased(owner, "example-etcd").await {
        Ok(res) => println!("{owner} created at version {}", res.version),
        Err(e) => println!("failed to claim {owner}: {e}"),
    }

    let mut res = client
        .exists("/example/config", true)
        .await
        .expect("exists failed");
    println!("/example/config exists: {}", res.exists());
    let watch = res.take_watch().expect("watch requested");

    println!("Waiting up to 30 seconds for /example/config to change...");
    tokio::select! {
        fired = watch => println!("watch fired: {fired:?}"),
        _ = tokio::time::sleep(Duration::from_secs(30)) => println!("no change"),
        _ = tokio::signal::ctrl_c() => println!("interrupted"),
    }

    client.erase(owner, 0).await.ok();
    tokio::task::spawn_blocking(move || drop(client))
        .await
        .expect("failed to stop client");
    println!("Finished!");
}
