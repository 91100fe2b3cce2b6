// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting proxy engine.
//!
//! Plain requests are forwarded upstream through a shared client after the
//! request modifier chain runs; the response modifier chain runs before the
//! response is written back. CONNECT requests are answered with `200 OK`,
//! the transport is taken over, TLS-terminated with an on-the-fly leaf
//! certificate, and the engine's own handler serves the decrypted requests
//! inside the tunnel.

use crate::ca::CertificateAuthority;
use crate::middleware::{
    ExchangeContext, InterceptedRequest, InterceptedResponse, ModifierPipeline, RequestModifyFn,
    RequestModifyMiddleware, ResponseModifyFn, ResponseModifyMiddleware,
};
use crate::tunnel::{AlreadyAccepted, OnceAccept};
use anyhow::Context;
use hyper::client::HttpConnector;
use hyper::server::conn::Http;
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::OnUpgrade;
use hyper::{Body, Client, Method, Request, Response, Server, StatusCode, Uri};
use hyper_rustls::HttpsConnector;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>>;

pub struct ProxyConfig {
    pub ca: Arc<CertificateAuthority>,
    /// Override for the upstream client; `None` builds one over webpki
    /// roots. Tests inject a client trusting their own upstream CA.
    pub upstream_client: Option<UpstreamClient>,
}

/// The proxy engine. Middlewares are registered before serving; `run`
/// composes them and starts accepting connections.
pub struct Proxy {
    ca: Arc<CertificateAuthority>,
    client: UpstreamClient,
    pipeline: ModifierPipeline,
}

/// Where a request entered the engine. Inside a CONNECT tunnel relative
/// URLs absolutize to `https://` with the tunnel target as the authority.
#[derive(Clone)]
enum RequestOrigin {
    Plain,
    Tunnel { host: String },
}

struct Shared {
    ca: Arc<CertificateAuthority>,
    client: UpstreamClient,
    request_chain: RequestModifyFn,
    response_chain: ResponseModifyFn,
}

impl Proxy {
    pub fn new(cfg: ProxyConfig) -> Self {
        let client = cfg.upstream_client.unwrap_or_else(default_client);
        Self {
            ca: cfg.ca,
            client,
            pipeline: ModifierPipeline::new(),
        }
    }

    pub fn use_request_modifier(&mut self, middleware: RequestModifyMiddleware) {
        self.pipeline.use_request_modifier(middleware);
    }

    pub fn use_response_modifier(&mut self, middleware: ResponseModifyMiddleware) {
        self.pipeline.use_response_modifier(middleware);
    }

    fn into_shared(self) -> Arc<Shared> {
        Arc::new(Shared {
            ca: self.ca,
            client: self.client,
            request_chain: self.pipeline.compose_request(),
            response_chain: self.pipeline.compose_response(),
        })
    }

    pub async fn run(self, listen: SocketAddr) -> anyhow::Result<()> {
        let shared = self.into_shared();
        let make_svc = make_service_fn(move |_conn| {
            let shared = shared.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle_request(req, shared.clone())))
            }
        });

        let server = Server::try_bind(&listen)?.serve(make_svc);
        info!(%listen, "listening");
        server.await?;
        Ok(())
    }
}

fn default_client() -> UpstreamClient {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    Client::builder().build(https)
}

async fn handle_request(
    req: Request<Body>,
    shared: Arc<Shared>,
) -> Result<Response<Body>, Infallible> {
    if req.method() == Method::CONNECT {
        handle_connect(req, shared)
    } else {
        proxy_request(req, shared, RequestOrigin::Plain).await
    }
}

/// Answer a CONNECT with `200 OK`, then take over the transport, terminate
/// TLS with a leaf minted for the handshake SNI (CONNECT host when SNI is
/// absent) and serve the decrypted requests with this engine.
fn handle_connect(
    mut req: Request<Body>,
    shared: Arc<Shared>,
) -> Result<Response<Body>, Infallible> {
    let host = match req.uri().authority().map(|a| a.host().to_string()) {
        Some(host) => host,
        None => {
            warn!(uri = %req.uri(), "CONNECT request without authority");
            return Ok(status_response(StatusCode::BAD_REQUEST));
        }
    };

    if req.extensions().get::<OnUpgrade>().is_none() {
        error!(%host, "transport cannot be taken over for CONNECT tunnel");
        return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE));
    }

    let server_config = match shared.ca.clone().sni_server_config(host.clone()) {
        Ok(config) => config,
        Err(err) => {
            error!(%host, %err, "failed to prepare tunnel certificate");
            return Ok(status_response(StatusCode::SERVICE_UNAVAILABLE));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let tls = match TlsAcceptor::from(server_config).accept(upgraded).await {
                    Ok(tls) => tls,
                    // The 200 is already on the wire; log and drop.
                    Err(err) => {
                        error!(%host, %err, "securing client connection failed");
                        return;
                    }
                };
                serve_tunnel(tls, shared, host).await;
            }
            Err(err) => error!(%host, %err, "taking over client connection failed"),
        }
    });

    // 200 OK with no body; the TLS handshake follows on the raw socket.
    Ok(Response::new(Body::empty()))
}

/// Serve the single TLS connection inside the tunnel. The accept adapter
/// makes the loop one-shot; `AlreadyAccepted` is the clean exit.
async fn serve_tunnel(
    tls: tokio_rustls::server::TlsStream<hyper::upgrade::Upgraded>,
    shared: Arc<Shared>,
    host: String,
) {
    let mut tunnel = OnceAccept::new(tls);
    loop {
        let conn = match tunnel.accept() {
            Ok(conn) => conn,
            Err(AlreadyAccepted) => break,
        };
        let shared = shared.clone();
        let host = host.clone();
        let service = service_fn(move |req| {
            proxy_request(
                req,
                shared.clone(),
                RequestOrigin::Tunnel { host: host.clone() },
            )
        });
        if let Err(err) = Http::new().serve_connection(conn, service).await {
            error!(%err, "serving tunneled connection failed");
        }
    }
}

async fn proxy_request(
    mut req: Request<Body>,
    shared: Arc<Shared>,
    origin: RequestOrigin,
) -> Result<Response<Body>, Infallible> {
    if req.method() == Method::CONNECT {
        // Nested tunnels are not supported.
        warn!(uri = %req.uri(), "CONNECT inside an established tunnel");
        return Ok(status_response(StatusCode::BAD_REQUEST));
    }

    if let Err(err) = absolutize_uri(&mut req, &origin) {
        warn!(%err, "failed to absolutize request URI");
        return Ok(status_response(StatusCode::BAD_REQUEST));
    }

    // The upstream must not learn the client address unless a middleware
    // explicitly adds one.
    req.headers_mut().remove("x-forwarded-for");

    let ctx = ExchangeContext::new();
    let ireq = (shared.request_chain)(InterceptedRequest {
        req,
        ctx: ctx.clone(),
    })
    .await;

    let upstream_res = match shared.client.request(ireq.req).await {
        Ok(res) => res,
        Err(err) => return Ok(upstream_error_response(err)),
    };

    match (shared.response_chain)(InterceptedResponse {
        res: upstream_res,
        ctx,
    })
    .await
    {
        Ok(ires) => Ok(ires.res),
        Err(err) => {
            error!(%err, "response modifier failed");
            Ok(status_response(StatusCode::BAD_GATEWAY))
        }
    }
}

/// Requests arriving without a scheme (origin-form) get an absolute URL so
/// middlewares and the upstream client see scheme, host, path and query.
fn absolutize_uri(req: &mut Request<Body>, origin: &RequestOrigin) -> anyhow::Result<()> {
    if req.uri().scheme().is_some() {
        return Ok(());
    }

    let scheme = match origin {
        RequestOrigin::Plain => "http",
        RequestOrigin::Tunnel { .. } => "https",
    };
    let authority = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| match origin {
            RequestOrigin::Tunnel { host } => Some(host.clone()),
            RequestOrigin::Plain => None,
        })
        .context("request has no Host header")?;
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri = Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .context("building absolute request URI")?;
    *req.uri_mut() = uri;
    Ok(())
}

fn upstream_error_response(err: hyper::Error) -> Response<Body> {
    if err.is_canceled() {
        debug!(%err, "upstream request canceled by client");
    } else {
        error!(%err, "failed to proxy request");
    }
    status_response(StatusCode::BAD_GATEWAY)
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::from(status.canonical_reason().unwrap_or_default()));
    *res.status_mut() = status;
    res
}
