//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use toolguard::observability::AuditSink;
use toolguard::{GuardConfig, GuardContext, GuardServer, Shutdown};

/// A guard server bound to an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: GuardContext,
    pub shutdown: Shutdown,
    handle: JoinHandle<()>,
}

#[allow(dead_code)]
impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Trigger shutdown and wait for the server task to finish.
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

/// Start a server with `config` and an in-memory audit sink.
pub async fn start_server(config: GuardConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ctx = GuardContext::new(config, AuditSink::new(512, false));
    let shutdown = Shutdown::new();
    let server = GuardServer::new(ctx.clone(), shutdown.clone());
    let handle = tokio::spawn(async move {
        let _ = server.run(listener).await;
    });

    TestServer {
        addr,
        ctx,
        shutdown,
        handle,
    }
}

/// Config for exercising credentials: loopback is not trusted.
#[allow(dead_code)]
pub fn remote_config() -> GuardConfig {
    let mut config = GuardConfig::default();
    config.auth.local_only = false;
    config
}

/// HTTP client that never reuses connections or consults proxies.
#[allow(dead_code)]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
