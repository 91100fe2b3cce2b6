// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Search expressions evaluated against stored request logs.
//!
//! This module carries only the evaluator contract the repository needs;
//! building expressions (e.g. from a query language) happens elsewhere.

use crate::reqlog::RequestLog;
use regex::Regex;

/// Request-log field a leaf expression tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Method,
    Url,
    Proto,
    RequestHeader,
    RequestBody,
    ResponseStatus,
    ResponseBody,
}

/// Boolean combination of regex tests over request-log fields.
#[derive(Debug, Clone)]
pub enum Expression {
    All(Vec<Expression>),
    Any(Vec<Expression>),
    Not(Box<Expression>),
    Field { field: SearchField, pattern: Regex },
}

impl Expression {
    /// Convenience constructor for a leaf test.
    pub fn field(field: SearchField, pattern: Regex) -> Self {
        Expression::Field { field, pattern }
    }

    pub fn eval(&self, log: &RequestLog) -> bool {
        match self {
            Expression::All(exprs) => exprs.iter().all(|e| e.eval(log)),
            Expression::Any(exprs) => exprs.iter().any(|e| e.eval(log)),
            Expression::Not(expr) => !expr.eval(log),
            Expression::Field { field, pattern } => field_matches(*field, pattern, log),
        }
    }
}

fn field_matches(field: SearchField, pattern: &Regex, log: &RequestLog) -> bool {
    match field {
        SearchField::Method => pattern.is_match(&log.method),
        SearchField::Url => pattern.is_match(&log.url),
        SearchField::Proto => pattern.is_match(&log.proto),
        SearchField::RequestHeader => log.headers.iter().any(|(name, value)| {
            value
                .to_str()
                .map(|v| pattern.is_match(&format!("{}: {}", name.as_str(), v)))
                .unwrap_or(false)
        }),
        SearchField::RequestBody => pattern.is_match(&String::from_utf8_lossy(&log.body)),
        SearchField::ResponseStatus => log
            .response
            .as_ref()
            .map(|res| pattern.is_match(&res.status.to_string()))
            .unwrap_or(false),
        SearchField::ResponseBody => log
            .response
            .as_ref()
            .map(|res| pattern.is_match(&String::from_utf8_lossy(&res.body)))
            .unwrap_or(false),
    }
}
