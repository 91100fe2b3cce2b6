// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Body buffering for middlewares that need to inspect message bodies.
//!
//! A capture drains the streaming body into memory and puts a fresh
//! in-memory body back in its place, so downstream consumers (the upstream
//! dial for requests, the client write for responses) see the same bytes a
//! middleware observed. Gzipped response bodies are decoded during capture;
//! the decoded form is what flows downstream.

use anyhow::Context;
use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::{Body, Request, Response};
use std::io::Read;

/// Bytes captured from a message body.
///
/// `bytes` is the copy intended for persistence and is cut at the capture
/// limit; the live body is always restored in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedBody {
    pub bytes: Bytes,
    pub truncated: bool,
}

impl CapturedBody {
    fn bounded(bytes: Bytes, max_capture: usize) -> Self {
        if bytes.len() > max_capture {
            Self {
                bytes: bytes.slice(..max_capture),
                truncated: true,
            }
        } else {
            Self {
                bytes,
                truncated: false,
            }
        }
    }
}

/// Drain the request body, restore it as a re-readable in-memory body, and
/// return the captured bytes. A missing body captures as an empty buffer.
///
/// On a read error the live body is left empty; the caller decides whether
/// the request still flows upstream.
pub async fn capture_request_body(
    req: &mut Request<Body>,
    max_capture: usize,
) -> anyhow::Result<CapturedBody> {
    let body = std::mem::replace(req.body_mut(), Body::empty());
    let bytes = hyper::body::to_bytes(body)
        .await
        .context("reading request body")?;
    *req.body_mut() = Body::from(bytes.clone());
    Ok(CapturedBody::bounded(bytes, max_capture))
}

/// Drain the response body, decoding `Content-Encoding: gzip` on the way,
/// restore the (decoded) bytes as the live body, and return the capture.
///
/// After a gzip decode the header map is fixed up to describe the decoded
/// body: `Content-Encoding` is removed and `Content-Length` rewritten.
pub async fn capture_response_body(
    res: &mut Response<Body>,
    max_capture: usize,
) -> anyhow::Result<CapturedBody> {
    let body = std::mem::replace(res.body_mut(), Body::empty());
    let raw = hyper::body::to_bytes(body)
        .await
        .context("reading response body")?;

    let is_gzip = res
        .headers()
        .get(CONTENT_ENCODING)
        .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
        .unwrap_or(false);

    let bytes = if is_gzip {
        let mut decoded = Vec::new();
        MultiGzDecoder::new(raw.as_ref())
            .read_to_end(&mut decoded)
            .context("decoding gzipped response body")?;
        res.headers_mut().remove(CONTENT_ENCODING);
        res.headers_mut().remove(TRANSFER_ENCODING);
        res.headers_mut()
            .insert(CONTENT_LENGTH, hyper::header::HeaderValue::from(decoded.len()));
        Bytes::from(decoded)
    } else {
        raw
    };

    *res.body_mut() = Body::from(bytes.clone());
    Ok(CapturedBody::bounded(bytes, max_capture))
}
