// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Persistence boundary for request/response logs.
//!
//! The proxy core only depends on the [`Repository`] trait; the bundled
//! [`InMemoryRepository`] keeps logs in an id-ordered map and is what the
//! binary and the tests use.

use crate::reqlog::{FindRequestsFilter, RequestLog, ResponseLog};
use crate::scope::{RequestView, Scope};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("request log not found")]
    RequestNotFound,

    #[error("project ID must be set")]
    ProjectIdMustBeSet,

    #[error("storage failed: {0}")]
    Storage(String),
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Persist a request log. Rejects logs without a project id.
    async fn store_request_log(&self, log: RequestLog) -> Result<(), RepositoryError>;

    /// Attach a response log to an existing request log.
    async fn store_response_log(
        &self,
        req_log_id: Ulid,
        log: ResponseLog,
    ) -> Result<(), RepositoryError>;

    /// Find logs for the filter's project, id-ascending (time-ascending).
    async fn find_request_logs(
        &self,
        filter: FindRequestsFilter,
        scope: &Scope,
    ) -> Result<Vec<RequestLog>, RepositoryError>;

    async fn find_request_log_by_id(&self, id: Ulid) -> Result<RequestLog, RepositoryError>;

    /// Delete all logs belonging to a project.
    async fn clear_request_logs(&self, project_id: Ulid) -> Result<(), RepositoryError>;
}

/// Id-ordered in-memory log store.
///
/// ULID ordering is creation-time ordering, so iterating the map yields
/// logs oldest-first without an extra sort.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    store: RwLock<BTreeMap<Ulid, RequestLog>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored request logs, across all projects.
    pub fn len(&self) -> usize {
        self.store.read().map(|store| store.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn store_request_log(&self, log: RequestLog) -> Result<(), RepositoryError> {
        if log.project_id.is_nil() {
            return Err(RepositoryError::ProjectIdMustBeSet);
        }
        let mut store = self
            .store
            .write()
            .map_err(|_| RepositoryError::Storage("log store lock poisoned".into()))?;
        store.insert(log.id, log);
        Ok(())
    }

    async fn store_response_log(
        &self,
        req_log_id: Ulid,
        log: ResponseLog,
    ) -> Result<(), RepositoryError> {
        let mut store = self
            .store
            .write()
            .map_err(|_| RepositoryError::Storage("log store lock poisoned".into()))?;
        let entry = store
            .get_mut(&req_log_id)
            .ok_or(RepositoryError::RequestNotFound)?;
        entry.response = Some(log);
        Ok(())
    }

    async fn find_request_logs(
        &self,
        filter: FindRequestsFilter,
        scope: &Scope,
    ) -> Result<Vec<RequestLog>, RepositoryError> {
        if filter.project_id.is_nil() {
            return Ok(Vec::new());
        }
        let store = self
            .store
            .read()
            .map_err(|_| RepositoryError::Storage("log store lock poisoned".into()))?;
        let logs = store
            .values()
            .filter(|log| log.project_id == filter.project_id)
            .filter(|log| {
                if !filter.only_in_scope {
                    return true;
                }
                scope.matches(RequestView {
                    url: &log.url,
                    headers: &log.headers,
                    body: &log.body,
                })
            })
            .filter(|log| {
                filter
                    .search_expr
                    .as_ref()
                    .map(|expr| expr.eval(log))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        Ok(logs)
    }

    async fn find_request_log_by_id(&self, id: Ulid) -> Result<RequestLog, RepositoryError> {
        let store = self
            .store
            .read()
            .map_err(|_| RepositoryError::Storage("log store lock poisoned".into()))?;
        store
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::RequestNotFound)
    }

    async fn clear_request_logs(&self, project_id: Ulid) -> Result<(), RepositoryError> {
        let mut store = self
            .store
            .write()
            .map_err(|_| RepositoryError::Storage("log store lock poisoned".into()))?;
        store.retain(|_, log| log.project_id != project_id);
        Ok(())
    }
}
