// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};

use intercept_http::ca::CertificateAuthority;
use intercept_http::proxy::{Proxy, ProxyConfig, UpstreamClient};
use intercept_http::repo::InMemoryRepository;
use intercept_http::reqlog::{RequestLogConfig, RequestLogService, DEFAULT_MAX_CAPTURE_BYTES};
use intercept_http::scope::Scope;

pub struct TestProxy {
    pub addr: SocketAddr,
    pub handle: tokio::task::JoinHandle<()>,
    pub repo: Arc<InMemoryRepository>,
    pub reqlog: RequestLogService,
    pub scope: Arc<Scope>,
    pub ca: Arc<CertificateAuthority>,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
}

impl TestProxy {
    pub async fn cleanup(self) {
        self.handle.abort();
        let _ = self.handle.await;
        let _ = tokio::fs::remove_file(&self.ca_cert_path).await;
        let _ = tokio::fs::remove_file(&self.ca_key_path).await;
    }
}

/// Start a proxy with the request logger attached and wait until it accepts
/// connections. `upstream_client` overrides the upstream HTTPS client so
/// tests can trust their own upstream CA.
pub async fn start_proxy(upstream_client: Option<UpstreamClient>) -> anyhow::Result<TestProxy> {
    let temp_dir = std::env::temp_dir();
    let test_id = uuid::Uuid::new_v4();
    let ca_cert_path = temp_dir.join(format!("intercept_integ_ca_{}.crt", test_id));
    let ca_key_path = temp_dir.join(format!("intercept_integ_ca_{}.key", test_id));

    let ca = CertificateAuthority::load_or_generate(&ca_cert_path, &ca_key_path).await?;

    let repo = Arc::new(InMemoryRepository::new());
    let scope = Arc::new(Scope::default());
    let reqlog = RequestLogService::new(RequestLogConfig {
        repository: repo.clone(),
        scope: scope.clone(),
        max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
    });

    let mut proxy = Proxy::new(ProxyConfig {
        ca: ca.clone(),
        upstream_client,
    });
    proxy.use_request_modifier(reqlog.request_modifier());
    proxy.use_response_modifier(reqlog.response_modifier());

    // Choose a free port by binding then dropping.
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let handle = tokio::spawn(async move {
        if let Err(e) = proxy.run(addr).await {
            eprintln!("proxy run failed: {}", e);
        }
    });

    // Wait for the server to accept connections.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            return Err(anyhow::anyhow!("timeout waiting for proxy to start"));
        }
        if let Ok(mut s) = tokio::net::TcpStream::connect(addr).await {
            let _ = s.shutdown().await;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    Ok(TestProxy {
        addr,
        handle,
        repo,
        reqlog,
        scope,
        ca,
        ca_cert_path,
        ca_key_path,
    })
}

/// Send a raw HTTP/1.1 request over a fresh connection and read until the
/// server closes it (requests should carry `Connection: close`).
pub async fn send_raw_request(addr: SocketAddr, request: &str) -> anyhow::Result<Vec<u8>> {
    let mut stream = tokio::net::TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 4096];
    loop {
        if Instant::now() > deadline {
            break;
        }
        match timeout(Duration::from_millis(500), stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                if !response.is_empty() {
                    break;
                }
            }
        }
    }
    Ok(response)
}

/// Absolute-form GET through the proxy over a raw socket.
pub async fn proxy_get(addr: SocketAddr, url: &str, host: &str) -> anyhow::Result<Vec<u8>> {
    let request = format!(
        "GET {url} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
    );
    send_raw_request(addr, &request).await
}
