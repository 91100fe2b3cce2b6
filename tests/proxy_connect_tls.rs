// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Client, Response};
use rustls::{ClientConfig, RootCertStore, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use ulid::Ulid;

mod common;
use common::start_proxy;

use intercept_http::ca::CertificateAuthority;
use intercept_http::proxy::UpstreamClient;
use intercept_http::repo::Repository;
use intercept_http::reqlog::FindRequestsFilter;
use intercept_http::scope::Scope;

fn client_config_trusting(ca_pem: &str) -> anyhow::Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    let certs = rustls_pemfile::certs(&mut ca_pem.as_bytes())?;
    root_store.add_parsable_certificates(&certs);
    Ok(ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Perform a CONNECT against the proxy, complete a TLS handshake for
/// `server_name` trusting `ca_pem`, and optionally send one inner request,
/// returning the raw response bytes.
async fn connect_and_tls(
    proxy_addr: SocketAddr,
    connect_host: &str,
    connect_port: u16,
    ca_pem: &str,
    server_name: &str,
    inner_request: Option<&str>,
) -> anyhow::Result<Option<Vec<u8>>> {
    let mut stream = tokio::net::TcpStream::connect(proxy_addr).await?;

    let connect = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
        host = connect_host,
        port = connect_port
    );
    stream.write_all(connect.as_bytes()).await?;

    // Read response headers until \r\n\r\n.
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if Instant::now() > deadline {
            return Err(anyhow::anyhow!("timeout reading CONNECT response"));
        }
        let n = match timeout(Duration::from_millis(500), stream.read(&mut tmp)).await {
            Ok(Ok(0)) => return Err(anyhow::anyhow!("unexpected EOF reading CONNECT response")),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        };
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let hdrs = String::from_utf8_lossy(&buf);
    if !hdrs.starts_with("HTTP/1.1 2") {
        return Err(anyhow::anyhow!("CONNECT not successful: {}", hdrs));
    }

    let client_cfg = client_config_trusting(ca_pem)?;
    let connector = TlsConnector::from(Arc::new(client_cfg));
    let name = ServerName::try_from(server_name)
        .map_err(|_| anyhow::anyhow!("invalid server name"))?;
    let mut tls = connector.connect(name, stream).await?;

    let resp_opt = if let Some(req) = inner_request {
        tls.write_all(req.as_bytes()).await?;

        let mut resp = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if Instant::now() > deadline {
                break;
            }
            let mut tmp = [0u8; 1024];
            match timeout(Duration::from_millis(500), tls.read(&mut tmp)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => resp.extend_from_slice(&tmp[..n]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    if !resp.is_empty() {
                        break;
                    }
                }
            }
        }
        Some(resp)
    } else {
        None
    };

    Ok(resp_opt)
}

/// Start an HTTPS upstream on an ephemeral port that answers every request
/// with 204, using a leaf minted by `ca` for "localhost".
async fn start_https_upstream(
    ca: Arc<CertificateAuthority>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server_config = ca.sni_server_config("localhost".to_string())?;

    let handle = tokio::spawn(async move {
        loop {
            let (conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let acceptor = TlsAcceptor::from(server_config.clone());
            tokio::spawn(async move {
                let tls = match acceptor.accept(conn).await {
                    Ok(tls) => tls,
                    Err(_) => return,
                };
                let service = service_fn(|_req| async {
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(204)
                            .body(Body::empty())
                            .unwrap(),
                    )
                });
                let _ = Http::new().serve_connection(tls, service).await;
            });
        }
    });

    Ok((addr, handle))
}

fn upstream_client_trusting(ca_pem: &str) -> anyhow::Result<UpstreamClient> {
    let tls = client_config_trusting(ca_pem)?;
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .build();
    Ok(Client::builder().build(https))
}

#[tokio::test]
async fn connect_tls_intercepts_and_logs_https_request() -> anyhow::Result<()> {
    // Upstream HTTPS server with its own CA; the proxy's upstream client
    // trusts it.
    let temp_dir = std::env::temp_dir();
    let test_id = uuid::Uuid::new_v4();
    let upstream_ca_cert = temp_dir.join(format!("upstream_ca_{}.crt", test_id));
    let upstream_ca_key = temp_dir.join(format!("upstream_ca_{}.key", test_id));
    let upstream_ca =
        CertificateAuthority::load_or_generate(&upstream_ca_cert, &upstream_ca_key).await?;
    let (upstream_addr, upstream_handle) = start_https_upstream(upstream_ca.clone()).await?;

    let client = upstream_client_trusting(&upstream_ca.ca_cert_pem())?;
    let tp = start_proxy(Some(client)).await?;
    let project = Ulid::new();
    tp.reqlog.set_active_project_id(project);

    let inner = format!(
        "GET /x HTTP/1.1\r\nHost: localhost:{port}\r\nConnection: close\r\n\r\n",
        port = upstream_addr.port()
    );
    let response = connect_and_tls(
        tp.addr,
        "localhost",
        upstream_addr.port(),
        &tp.ca.ca_cert_pem(),
        "localhost",
        Some(&inner),
    )
    .await?
    .expect("inner response bytes");
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 204"));

    // One request log with the absolutized https URL.
    let expected_url = format!("https://localhost:{}/x", upstream_addr.port());
    let mut found = None;
    for _ in 0..100u32 {
        let filter = FindRequestsFilter {
            project_id: project,
            ..Default::default()
        };
        let logs = tp.repo.find_request_logs(filter, &Scope::default()).await?;
        if logs.len() == 1 && logs[0].response.is_some() {
            found = Some(logs.into_iter().next().unwrap());
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    let log = found.expect("request log persisted");
    assert_eq!(log.method, "GET");
    assert_eq!(log.url, expected_url);
    assert_eq!(log.response.as_ref().map(|r| r.status), Some(204));

    upstream_handle.abort();
    tp.cleanup().await;
    let _ = tokio::fs::remove_file(&upstream_ca_cert).await;
    let _ = tokio::fs::remove_file(&upstream_ca_key).await;
    Ok(())
}

#[tokio::test]
async fn connect_mints_leaf_for_sni_not_authority() -> anyhow::Result<()> {
    let tp = start_proxy(None).await?;

    // CONNECT names example.com, the handshake SNI names other.test. The
    // handshake only succeeds if the leaf was minted for the SNI value,
    // because the client validates the certificate against it.
    let result = connect_and_tls(
        tp.addr,
        "example.com",
        443,
        &tp.ca.ca_cert_pem(),
        "other.test",
        None,
    )
    .await;
    assert!(result.is_ok(), "handshake failed: {:?}", result.err());

    // Nothing was proxied, nothing is logged.
    sleep(Duration::from_millis(100)).await;
    assert!(tp.repo.is_empty());

    tp.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn connect_handshake_fails_without_ca_trust() -> anyhow::Result<()> {
    let tp = start_proxy(None).await?;

    // A client that trusts a different CA must reject the minted leaf.
    let temp_dir = std::env::temp_dir();
    let test_id = uuid::Uuid::new_v4();
    let other_cert = temp_dir.join(format!("other_ca_{}.crt", test_id));
    let other_key = temp_dir.join(format!("other_ca_{}.key", test_id));
    let other_ca = CertificateAuthority::load_or_generate(&other_cert, &other_key).await?;

    let result = connect_and_tls(
        tp.addr,
        "example.com",
        443,
        &other_ca.ca_cert_pem(),
        "example.com",
        None,
    )
    .await;
    assert!(result.is_err());

    tp.cleanup().await;
    let _ = tokio::fs::remove_file(&other_cert).await;
    let _ = tokio::fs::remove_file(&other_key).await;
    Ok(())
}
