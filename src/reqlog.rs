// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Request logging service, attached to the proxy as one request-side and
//! one response-side middleware.
//!
//! The request side runs after the rest of the chain (so it records the
//! fully-mutated request), captures the body, decides bypass, and persists
//! a request log keyed by a fresh ULID. The response side captures the
//! (decoded) response body and persists it out-of-band against that ULID so
//! the client is never held waiting on storage.

use crate::capture;
use crate::middleware::{
    InterceptedRequest, InterceptedResponse, ReqLogId, RequestModifyFn, RequestModifyMiddleware,
    ResponseModifyFn, ResponseModifyMiddleware,
};
use crate::repo::{Repository, RepositoryError};
use crate::scope::{RequestView, Scope};
use crate::search;
use anyhow::anyhow;
use bytes::Bytes;
use hyper::{HeaderMap, Version};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};
use ulid::Ulid;

/// Marks an exchange whose logging was skipped (no active project, scope
/// mismatch, or an earlier logging failure). Read by the response side.
#[derive(Debug, Clone, Copy)]
pub struct LogBypassed;

pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Persisted record of a proxied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: Ulid,
    pub project_id: Ulid,
    pub method: String,
    pub url: String,
    pub proto: String,
    #[serde(
        serialize_with = "crate::serde_helpers::serialize_headers",
        deserialize_with = "crate::serde_helpers::deserialize_headers"
    )]
    pub headers: HeaderMap,
    pub body: Bytes,
    pub body_truncated: bool,
    pub response: Option<ResponseLog>,
}

/// Persisted record of the response to a logged request; keyed by the
/// request log's id, it has no identifier of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseLog {
    pub proto: String,
    pub status: u16,
    pub reason: String,
    #[serde(
        serialize_with = "crate::serde_helpers::serialize_headers",
        deserialize_with = "crate::serde_helpers::deserialize_headers"
    )]
    pub headers: HeaderMap,
    pub body: Bytes,
    pub body_truncated: bool,
}

/// Read-side filter for stored request logs.
#[derive(Debug, Clone)]
pub struct FindRequestsFilter {
    pub project_id: Ulid,
    pub only_in_scope: bool,
    pub search_expr: Option<search::Expression>,
}

impl Default for FindRequestsFilter {
    fn default() -> Self {
        Self {
            project_id: Ulid::nil(),
            only_in_scope: false,
            search_expr: None,
        }
    }
}

struct LoggerState {
    active_project_id: Ulid,
    bypass_out_of_scope: bool,
    find_reqs_filter: FindRequestsFilter,
}

impl Default for LoggerState {
    fn default() -> Self {
        Self {
            active_project_id: Ulid::nil(),
            bypass_out_of_scope: false,
            find_reqs_filter: FindRequestsFilter::default(),
        }
    }
}

pub struct RequestLogConfig {
    pub repository: Arc<dyn Repository>,
    pub scope: Arc<Scope>,
    pub max_capture_bytes: usize,
}

/// Cloneable handle to the logging service; clones share state, so one
/// handle can be registered as middleware while another drives the
/// control-plane setters and the read side.
#[derive(Clone)]
pub struct RequestLogService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    repo: Arc<dyn Repository>,
    scope: Arc<Scope>,
    state: RwLock<LoggerState>,
    max_capture_bytes: usize,
}

impl RequestLogService {
    pub fn new(cfg: RequestLogConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                repo: cfg.repository,
                scope: cfg.scope,
                state: RwLock::new(LoggerState::default()),
                max_capture_bytes: cfg.max_capture_bytes,
            }),
        }
    }

    pub fn set_active_project_id(&self, id: Ulid) {
        match self.inner.state.write() {
            Ok(mut state) => state.active_project_id = id,
            Err(_) => warn!("logger state lock poisoned during write"),
        }
    }

    pub fn active_project_id(&self) -> Ulid {
        match self.inner.state.read() {
            Ok(state) => state.active_project_id,
            Err(_) => {
                warn!("logger state lock poisoned during read");
                Ulid::nil()
            }
        }
    }

    pub fn set_bypass_out_of_scope(&self, bypass: bool) {
        match self.inner.state.write() {
            Ok(mut state) => state.bypass_out_of_scope = bypass,
            Err(_) => warn!("logger state lock poisoned during write"),
        }
    }

    pub fn bypass_out_of_scope(&self) -> bool {
        match self.inner.state.read() {
            Ok(state) => state.bypass_out_of_scope,
            Err(_) => {
                warn!("logger state lock poisoned during read");
                false
            }
        }
    }

    pub fn set_find_reqs_filter(&self, filter: FindRequestsFilter) {
        match self.inner.state.write() {
            Ok(mut state) => state.find_reqs_filter = filter,
            Err(_) => warn!("logger state lock poisoned during write"),
        }
    }

    pub fn find_reqs_filter(&self) -> FindRequestsFilter {
        match self.inner.state.read() {
            Ok(state) => state.find_reqs_filter.clone(),
            Err(_) => {
                warn!("logger state lock poisoned during read");
                FindRequestsFilter::default()
            }
        }
    }

    pub async fn find_requests(&self) -> Result<Vec<RequestLog>, RepositoryError> {
        self.inner
            .repo
            .find_request_logs(self.find_reqs_filter(), &self.inner.scope)
            .await
    }

    pub async fn find_request_log_by_id(&self, id: Ulid) -> Result<RequestLog, RepositoryError> {
        self.inner.repo.find_request_log_by_id(id).await
    }

    pub async fn clear_requests(&self, project_id: Ulid) -> Result<(), RepositoryError> {
        self.inner.repo.clear_request_logs(project_id).await
    }

    /// Request-side middleware. Runs the rest of the chain first, then
    /// captures and (unless bypassed) persists the request.
    pub fn request_modifier(&self) -> RequestModifyMiddleware {
        let svc = self.clone();
        Box::new(move |next: RequestModifyFn| {
            let svc = svc.clone();
            Arc::new(move |ireq: InterceptedRequest| {
                let svc = svc.clone();
                let next = Arc::clone(&next);
                Box::pin(async move {
                    let mut ireq = next(ireq).await;
                    svc.log_request(&mut ireq).await;
                    ireq
                })
            })
        })
    }

    /// Response-side middleware. Runs the rest of the chain first, then
    /// captures the body and persists the response out-of-band.
    pub fn response_modifier(&self) -> ResponseModifyMiddleware {
        let svc = self.clone();
        Box::new(move |next: ResponseModifyFn| {
            let svc = svc.clone();
            Arc::new(move |ires: InterceptedResponse| {
                let svc = svc.clone();
                let next = Arc::clone(&next);
                Box::pin(async move {
                    let mut ires = next(ires).await?;
                    svc.log_response(&mut ires).await?;
                    Ok(ires)
                })
            })
        })
    }

    async fn log_request(&self, ireq: &mut InterceptedRequest) {
        let captured =
            match capture::capture_request_body(&mut ireq.req, self.inner.max_capture_bytes).await {
                Ok(captured) => captured,
                Err(err) => {
                    error!(%err, "failed to read request body for logging");
                    ireq.ctx.insert(LogBypassed);
                    return;
                }
            };

        let (active_project_id, bypass_out_of_scope) = match self.inner.state.read() {
            Ok(state) => (state.active_project_id, state.bypass_out_of_scope),
            Err(_) => {
                warn!("logger state lock poisoned during read");
                ireq.ctx.insert(LogBypassed);
                return;
            }
        };

        if active_project_id.is_nil() {
            ireq.ctx.insert(LogBypassed);
            debug!(url = %ireq.req.uri(), "bypassed logging: no active project");
            return;
        }

        let url = ireq.req.uri().to_string();

        if bypass_out_of_scope {
            let in_scope = self.inner.scope.matches(RequestView {
                url: &url,
                headers: ireq.req.headers(),
                body: &captured.bytes,
            });
            if !in_scope {
                ireq.ctx.insert(LogBypassed);
                debug!(url = %url, "bypassed logging: request does not match any scope rule");
                return;
            }
        }

        let log = RequestLog {
            id: Ulid::new(),
            project_id: active_project_id,
            method: ireq.req.method().to_string(),
            url,
            proto: version_str(ireq.req.version()).to_string(),
            headers: ireq.req.headers().clone(),
            body: captured.bytes,
            body_truncated: captured.truncated,
            response: None,
        };
        let id = log.id;

        if let Err(err) = self.inner.repo.store_request_log(log).await {
            error!(%err, "failed to store request log");
            // Without a stored request the response side has nothing to
            // attach to; treat the exchange as bypassed.
            ireq.ctx.insert(LogBypassed);
            return;
        }

        debug!(req_log_id = %id, "stored request log");
        ireq.ctx.insert(ReqLogId(id));
    }

    async fn log_response(&self, ires: &mut InterceptedResponse) -> anyhow::Result<()> {
        if ires.ctx.contains::<LogBypassed>() {
            return Ok(());
        }

        let ReqLogId(req_log_id) = ires
            .ctx
            .get::<ReqLogId>()
            .ok_or_else(|| anyhow!("response exchange is missing its request log id"))?;

        let captured =
            capture::capture_response_body(&mut ires.res, self.inner.max_capture_bytes).await?;

        let log = ResponseLog {
            proto: version_str(ires.res.version()).to_string(),
            status: ires.res.status().as_u16(),
            reason: ires
                .res
                .status()
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            headers: ires.res.headers().clone(),
            body: captured.bytes,
            body_truncated: captured.truncated,
        };

        // Persist on a detached task: client cancellation must not abort
        // the write, and the client response must not wait on it.
        let repo = Arc::clone(&self.inner.repo);
        tokio::spawn(async move {
            match repo.store_response_log(req_log_id, log).await {
                Ok(()) => debug!(req_log_id = %req_log_id, "stored response log"),
                Err(err) => {
                    error!(%err, req_log_id = %req_log_id, "failed to store response log")
                }
            }
        });

        Ok(())
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}
