use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ringproxy::core::conn::{ConnRole, Transport};
use ringproxy::protocol::LineTransport;
use ringproxy::{Datastore, LocalRouter, ProcessContext, ProxyConfig, Worker, spawn_workers};

/// Backend links as socket pairs, remembered by the thread that opened them.
#[derive(Clone, Default)]
struct PairDatastore {
    remotes: Arc<Mutex<Vec<(String, UnixStream)>>>,
}

impl PairDatastore {
    fn take_for(&self, thread: &str) -> Option<UnixStream> {
        let mut remotes = self.remotes.lock().unwrap();
        let idx = remotes.iter().position(|(name, _)| name == thread)?;
        Some(remotes.remove(idx).1)
    }
}

impl Datastore for PairDatastore {
    fn connect(&self) -> io::Result<Box<dyn Transport>> {
        let (local, remote) = UnixStream::pair()?;
        let name = std::thread::current().name().unwrap_or("?").to_string();
        self.remotes.lock().unwrap().push((name, remote));
        Ok(Box::new(LineTransport::new(local, ConnRole::Server, 256)?))
    }
}

fn read_line(s: &mut UnixStream) -> String {
    s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut line = Vec::new();
    let mut byte = [0u8];
    loop {
        if s.read(&mut byte).unwrap() == 0 || byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap()
}

#[test]
fn workers_serve_until_shutdown() {
    let ds = PairDatastore::default();
    let mut config = ProxyConfig::default()
        .with_workers(2)
        .with_timeouts(1_000, 50)
        .with_channel_capacity(64);
    config.ring_size = 64;

    let ctx = Arc::new(ProcessContext::new(
        config,
        Box::new(LocalRouter),
        Box::new(ds.clone()),
    ));
    let mut workers = match Worker::init_all(&ctx) {
        Ok(w) => w,
        Err(e) => {
            if std::env::var_os("RINGPROXY_REQUIRE_URING").is_some() {
                panic!("io_uring required but unavailable: {e}");
            }
            eprintln!("skipping: io_uring unavailable ({e})");
            return;
        }
    };

    let (local, mut client) = UnixStream::pair().unwrap();
    let transport = LineTransport::new(local, ConnRole::Client, 256).unwrap();
    workers[0]
        .attach(ConnRole::Client, Box::new(transport), true)
        .unwrap();

    let handles = spawn_workers(workers).unwrap();
    // startup waits for every worker's preconnect
    let mut backend = ds.take_for("worker-0").expect("worker 0 preconnected");
    assert!(ds.take_for("worker-1").is_some());

    client.write_all(b"get k\n").unwrap();
    assert_eq!(read_line(&mut backend), "get k");
    backend.write_all(b"hello\n").unwrap();
    assert_eq!(read_line(&mut client), "hello");

    ctx.shutdown();
    for h in handles {
        h.join().unwrap().unwrap();
    }

    // teardown closed the links
    let mut buf = [0u8; 1];
    backend.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(backend.read(&mut buf).unwrap(), 0);
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(client.read(&mut buf).unwrap(), 0);
}
