use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ringproxy::backend::TcpDatastore;
use ringproxy::core::conn::ConnRole;
use ringproxy::core::socket::make_reuseport_listener;
use ringproxy::protocol::ListenerTransport;
use ringproxy::{LocalRouter, ProcessContext, ProxyConfig, Worker, spawn_workers};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let listen: SocketAddr = std::env::var("RINGPROXY_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:8102".into())
        .parse()
        .context("bad RINGPROXY_LISTEN")?;
    let datastore: SocketAddr = std::env::var("RINGPROXY_DATASTORE")
        .unwrap_or_else(|_| "127.0.0.1:6379".into())
        .parse()
        .context("bad RINGPROXY_DATASTORE")?;
    let peer_listen = std::env::var("RINGPROXY_PEER_LISTEN")
        .ok()
        .map(|s| s.parse::<SocketAddr>())
        .transpose()
        .context("bad RINGPROXY_PEER_LISTEN")?;

    let cores = core_affinity::get_core_ids().map_or(1, |c| c.len());
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(cores)
        .min(cores);

    let mut config = ProxyConfig::default()
        .with_workers(workers)
        .with_listen(listen)
        .with_datastore(datastore);
    if let Some(addr) = peer_listen {
        config = config.with_peer_listen(addr);
    }

    info!(
        listen = %config.listen,
        peer_listen = ?config.peer_listen,
        datastore = %config.datastore,
        workers = config.workers,
        "starting ringproxy"
    );

    let ctx = Arc::new(ProcessContext::new(
        config.clone(),
        Box::new(LocalRouter),
        Box::new(TcpDatastore::new(config.datastore, config.io_buffer_capacity)),
    ));

    let mut workers = Worker::init_all(&ctx).context("worker init failed")?;
    for worker in &mut workers {
        let listener = make_reuseport_listener(config.listen)
            .with_context(|| format!("bind {}", config.listen))?;
        let transport =
            ListenerTransport::new(listener, ConnRole::Proxy, true, config.io_buffer_capacity)?;
        worker.attach(ConnRole::Proxy, Box::new(transport), true)?;

        if let Some(addr) = config.peer_listen {
            let listener =
                make_reuseport_listener(addr).with_context(|| format!("bind {addr}"))?;
            let transport = ListenerTransport::new(
                listener,
                ConnRole::PeerProxy,
                true,
                config.io_buffer_capacity,
            )?;
            worker.attach(ConnRole::PeerProxy, Box::new(transport), true)?;
        }
    }

    let handles = spawn_workers(workers).context("failed to start workers")?;

    let mut failed = false;
    for h in handles {
        match h.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(%e, "worker exited with error");
                failed = true;
            }
            Err(_) => {
                error!("worker panicked");
                failed = true;
            }
        }
    }
    // one worker down takes the process down
    ctx.shutdown();
    for (counter, value) in ctx.stats.snapshot() {
        info!(counter, value, "final stat");
    }
    if failed {
        anyhow::bail!("worker failure");
    }
    Ok(())
}
