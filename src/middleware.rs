// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Ordered modifier pipelines for requests and responses.
//!
//! Middlewares are higher-order functions: each one receives the "next"
//! callable and returns a new callable wrapping it. Installation composes
//! the registered middlewares right-to-left over a no-op leaf, so the first
//! registered middleware runs outermost: its pre-`next` code runs first on
//! the way in, its post-`next` code runs last on the way out.

use futures::future::BoxFuture;
use http::Extensions;
use hyper::{Body, Request, Response};
use std::sync::{Arc, Mutex};
use ulid::Ulid;

/// Correlation identifier of the stored request log, set on the exchange
/// context by the request-side logger and read by the response side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqLogId(pub Ulid);

/// Key-value map scoped to one request/response exchange.
///
/// Created when a request is admitted; the response carries a handle to the
/// same map so response middlewares can read what request middlewares wrote.
#[derive(Clone, Default)]
pub struct ExchangeContext {
    inner: Arc<Mutex<Extensions>>,
}

impl ExchangeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&self, value: T) {
        if let Ok(mut ext) = self.inner.lock() {
            ext.insert(value);
        }
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner.lock().ok().and_then(|ext| ext.get::<T>().cloned())
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.inner
            .lock()
            .map(|ext| ext.get::<T>().is_some())
            .unwrap_or(false)
    }
}

/// A request travelling through the pipeline, with its exchange context.
pub struct InterceptedRequest {
    pub req: Request<Body>,
    pub ctx: ExchangeContext,
}

/// A response travelling through the pipeline. `ctx` is the same handle the
/// originating request carried.
pub struct InterceptedResponse {
    pub res: Response<Body>,
    pub ctx: ExchangeContext,
}

pub type RequestModifyFn =
    Arc<dyn Fn(InterceptedRequest) -> BoxFuture<'static, InterceptedRequest> + Send + Sync>;

pub type ResponseModifyFn = Arc<
    dyn Fn(InterceptedResponse) -> BoxFuture<'static, anyhow::Result<InterceptedResponse>>
        + Send
        + Sync,
>;

pub type RequestModifyMiddleware = Box<dyn Fn(RequestModifyFn) -> RequestModifyFn + Send + Sync>;

pub type ResponseModifyMiddleware =
    Box<dyn Fn(ResponseModifyFn) -> ResponseModifyFn + Send + Sync>;

/// Holds the registered middlewares. Registration happens before serving;
/// the composed callables are immutable afterwards and cheap to clone per
/// request.
#[derive(Default)]
pub struct ModifierPipeline {
    req_modifiers: Vec<RequestModifyMiddleware>,
    res_modifiers: Vec<ResponseModifyMiddleware>,
}

impl ModifierPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_request_modifier(&mut self, middleware: RequestModifyMiddleware) {
        self.req_modifiers.push(middleware);
    }

    pub fn use_response_modifier(&mut self, middleware: ResponseModifyMiddleware) {
        self.res_modifiers.push(middleware);
    }

    /// Compose the request chain. The first registered middleware decides
    /// when (and whether) to call into the rest of the chain.
    pub fn compose_request(&self) -> RequestModifyFn {
        let mut chain: RequestModifyFn =
            Arc::new(|ireq: InterceptedRequest| Box::pin(futures::future::ready(ireq)));
        for middleware in self.req_modifiers.iter().rev() {
            chain = middleware(chain);
        }
        chain
    }

    /// Compose the response chain. An error from any middleware
    /// short-circuits and is rendered as a 502 by the engine.
    pub fn compose_response(&self) -> ResponseModifyFn {
        let mut chain: ResponseModifyFn =
            Arc::new(|ires: InterceptedResponse| Box::pin(futures::future::ready(Ok(ires))));
        for middleware in self.res_modifiers.iter().rev() {
            chain = middleware(chain);
        }
        chain
    }
}
