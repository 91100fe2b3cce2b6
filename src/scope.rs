// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Regex-based scope matching over request URL, headers and body.
//!
//! The scope decides what counts as "in scope" for the active project: a
//! request matches when any configured rule matches it. Rules are replaced
//! atomically as a whole set by control-plane code.

use hyper::HeaderMap;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use std::sync::RwLock;
use tracing::warn;

/// Matches a single header pair. When both parts are present, a pair must
/// satisfy both; a missing part is unconstrained.
#[derive(Debug, Clone, Default)]
pub struct HeaderRule {
    pub key: Option<Regex>,
    pub value: Option<Regex>,
}

impl HeaderRule {
    fn matches(&self, headers: &HeaderMap) -> bool {
        if self.key.is_none() && self.value.is_none() {
            return false;
        }
        headers.iter().any(|(name, value)| {
            let key_ok = self
                .key
                .as_ref()
                .map(|re| re.is_match(name.as_str()))
                .unwrap_or(true);
            let value_ok = self
                .value
                .as_ref()
                .map(|re| value.to_str().map(|v| re.is_match(v)).unwrap_or(false))
                .unwrap_or(true);
            key_ok && value_ok
        })
    }
}

/// A single scope rule; the rule matches when any of its populated parts
/// matches the request.
#[derive(Debug, Clone, Default)]
pub struct ScopeRule {
    pub url: Option<Regex>,
    pub header: Option<HeaderRule>,
    pub body: Option<BytesRegex>,
}

impl ScopeRule {
    fn matches(&self, req: RequestView<'_>) -> bool {
        if let Some(re) = &self.url {
            if re.is_match(req.url) {
                return true;
            }
        }
        if let Some(rule) = &self.header {
            if rule.matches(req.headers) {
                return true;
            }
        }
        if let Some(re) = &self.body {
            if re.is_match(req.body) {
                return true;
            }
        }
        false
    }
}

/// Borrowed view of the request fields a scope decision looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub url: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// Set of scope rules shared between the proxy pipeline and the read side.
#[derive(Debug, Default)]
pub struct Scope {
    rules: RwLock<Vec<ScopeRule>>,
}

impl Scope {
    pub fn new(rules: Vec<ScopeRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Replace the rule set as a whole.
    pub fn set_rules(&self, rules: Vec<ScopeRule>) {
        match self.rules.write() {
            Ok(mut guard) => *guard = rules,
            Err(_) => warn!("scope rules lock poisoned during write"),
        }
    }

    pub fn rules(&self) -> Vec<ScopeRule> {
        match self.rules.read() {
            Ok(guard) => guard.clone(),
            Err(_) => {
                warn!("scope rules lock poisoned during read");
                Vec::new()
            }
        }
    }

    /// True when any rule matches. An empty rule set matches nothing.
    pub fn matches(&self, req: RequestView<'_>) -> bool {
        match self.rules.read() {
            Ok(guard) => guard.iter().any(|rule| rule.matches(req)),
            Err(_) => {
                warn!("scope rules lock poisoned during match");
                false
            }
        }
    }
}
