#![allow(dead_code)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::process;
use std::thread::sleep;
use std::time::Duration;

use redcache::{CachingProxy, ProxyConfig};

pub fn get_random_available_port() -> u16 {
    // this is technically a race but we can't do better with
    // the tools that redis gives us :(
    let listener = TcpListener::bind("127.0.0.1:0").expect("no free port");
    listener.local_addr().unwrap().port()
}

/// A throwaway redis-server process bound to a random port.
pub struct RedisServer {
    pub process: process::Child,
    pub port: u16,
    tempdir: tempfile::TempDir,
    log_file: PathBuf,
}

impl RedisServer {
    /// Spawns a server, or returns `None` when no `redis-server` binary
    /// is available so callers can skip.
    pub fn try_new() -> Option<RedisServer> {
        let port = get_random_available_port();
        Self::try_new_on_port(port)
    }

    pub fn try_new_on_port(port: u16) -> Option<RedisServer> {
        let tempdir = tempfile::Builder::new()
            .prefix("redcache")
            .tempdir()
            .expect("failed to create tempdir");
        let log_file = tempdir.path().join("redis.log");
        let mut cmd = process::Command::new("redis-server");
        cmd.arg("--port")
            .arg(port.to_string())
            .arg("--bind")
            .arg("127.0.0.1")
            .arg("--logfile")
            .arg(&log_file)
            .arg("--save")
            .arg("")
            .stdout(process::Stdio::null())
            .stderr(process::Stdio::null());
        let process = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                eprintln!("cannot spawn redis-server: {err}");
                return None;
            }
        };
        let server = RedisServer {
            process,
            port,
            tempdir,
            log_file,
        };
        if server.wait_until_ready() {
            Some(server)
        } else {
            eprintln!("redis-server did not come up on port {port}");
            None
        }
    }

    fn wait_until_ready(&self) -> bool {
        let client = redis::Client::open(self.url()).unwrap();
        for _ in 0..200 {
            if let Ok(mut conn) = client.get_connection() {
                if redis::cmd("PING").query::<String>(&mut conn).is_ok() {
                    return true;
                }
            }
            sleep(Duration::from_millis(10));
        }
        false
    }

    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}/", self.port)
    }

    pub fn log_file_contents(&self) -> Option<String> {
        std::fs::read_to_string(&self.log_file).ok()
    }

    pub fn stop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

impl Drop for RedisServer {
    fn drop(&mut self) {
        self.stop()
    }
}

pub struct TestContext {
    pub server: RedisServer,
    pub proxy: CachingProxy,
}

impl TestContext {
    /// Spawns a server and opens a proxy against it; `None` means the
    /// environment cannot run integration tests and the caller should
    /// skip.
    pub fn new() -> Option<TestContext> {
        Self::with_config(ProxyConfig::new())
    }

    pub fn with_config(config: ProxyConfig) -> Option<TestContext> {
        let server = RedisServer::try_new()?;
        let proxy = CachingProxy::open(server.url(), config).expect("invalid connection params");
        Some(TestContext { server, proxy })
    }

    /// Connects the proxy's invalidation listener, skipping (returns
    /// false) on servers without RESP3 client tracking.
    pub async fn connect_caching(&self) -> bool {
        match self.proxy.connect(Duration::from_secs(5)).await {
            Ok(()) => true,
            Err(err) => {
                eprintln!("skipping: server does not support client tracking: {err}");
                false
            }
        }
    }

    /// A plain multiplexed connection to the same server, bypassing the
    /// proxy — "some other client" in invalidation tests.
    pub async fn raw_connection(&self) -> redis::aio::MultiplexedConnection {
        redis::Client::open(self.server.url())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .expect("cannot open raw connection")
    }
}

/// Polls an async condition until it holds or the deadline passes. The
/// invalidation path is asynchronous by design, so tests wait for
/// delivery instead of assuming it.
#[allow(unused_macros)]
macro_rules! wait_for {
    ($cond:expr) => {{
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if $cond {
                break true;
            }
            if std::time::Instant::now() > deadline {
                break false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }};
}
