#[cfg(not(target_arch = "wasm32"))]
#[cfg(feature = "server")]
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::{env, net::SocketAddr, sync::Arc, time::Duration};

    use teleconsult_signalling::{
        config::{STORE_ADDR_ENV, STORE_WEB_ADDR_ENV},
        MemoryStore, DEFAULT_NATIVE_SERVER_ADDR,
    };

    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

    pretty_env_logger::try_init()?;

    let addr: SocketAddr = env::var(STORE_ADDR_ENV)
        .unwrap_or_else(|_| DEFAULT_NATIVE_SERVER_ADDR.to_string())
        .parse()?;
    let store = Arc::new(MemoryStore::new());

    // create server futures
    let serve_fut = teleconsult_signalling::server::serve(
        store.clone(),
        addr,
        Some(KEEPALIVE_INTERVAL),
        None,
        None,
    );
    #[cfg(feature = "server-web")]
    let serve_web_fut = {
        let web_addr: SocketAddr = env::var(STORE_WEB_ADDR_ENV)
            .unwrap_or_else(|_| teleconsult_signalling::DEFAULT_WEB_SERVER_ADDR.to_string())
            .parse()?;
        teleconsult_signalling::server::serve_web(store, web_addr, Some(KEEPALIVE_INTERVAL), None, None)
    };
    #[cfg(not(feature = "server-web"))]
    let serve_web_fut = {
        if env::var(STORE_WEB_ADDR_ENV).is_ok() {
            log::warn!("{STORE_WEB_ADDR_ENV} is set but the `server-web` feature is disabled");
        }
        drop(store);
        async { Ok::<(), tonic::transport::Error>(()) }
    };
    // run servers concurrently
    tokio::try_join!(serve_fut, serve_web_fut)?;
    Ok(())
}

#[cfg(not(target_arch = "wasm32"))]
#[cfg(not(feature = "server"))]
fn main() {
    println!("Must enable 'server' feature to run the `teleconsult-signalling` store server!");
}

#[cfg(target_arch = "wasm32")]
fn main() {
    println!("Cannot run the `teleconsult-signalling` store server on web architecture!");
}
