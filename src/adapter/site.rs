// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timeout-enforcing wrapper around a node adapter.
//!
//! Every call made by the engine and the workers goes through [`SiteAdapter`]:
//! - availability probes are bounded by the connect timeout (timeout = unavailable)
//! - every other call, and every item pulled from a query stream, is bounded
//!   by the receive timeout (timeout = [`AdapterError::Timeout`])
//! - the system name is fetched once and cached
//! - `close()` is forwarded at most once

use super::NodeAdapter;
use crate::config::{AdapterTimeouts, Site};
use crate::error::{AdapterError, AdapterResult};
use crate::model::{
    CreateRequest, CreateStorageRequest, DeleteRequest, Metadata, QueryRequest, QueryResponse,
    ResourceRequest, ResourceResponse, UpdateRequest, UpdateStorageRequest,
};
use futures::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

/// A connected adapter for one site.
pub struct SiteAdapter {
    site: Site,
    inner: Arc<dyn NodeAdapter>,
    connect_timeout: Duration,
    receive_timeout: Duration,
    system_name: OnceCell<String>,
    closed: AtomicBool,
}

impl SiteAdapter {
    pub fn new(site: Site, inner: Arc<dyn NodeAdapter>, timeouts: &AdapterTimeouts) -> Self {
        Self {
            site,
            inner,
            connect_timeout: timeouts.connect(),
            receive_timeout: timeouts.receive(),
            system_name: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = AdapterResult<T>>,
    ) -> AdapterResult<T> {
        if self.is_closed() {
            return Err(AdapterError::Closed {
                site: self.site.id.clone(),
            });
        }
        match tokio::time::timeout(self.receive_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                debug!(site = %self.site.id, operation, "Adapter call timed out");
                Err(AdapterError::Timeout {
                    site: self.site.id.clone(),
                    operation: operation.to_string(),
                    timeout_ms: self.receive_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Liveness probe bounded by the connect timeout.
    pub async fn is_available(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        tokio::time::timeout(self.connect_timeout, self.inner.is_available())
            .await
            .unwrap_or(false)
    }

    /// Remote system name, cached after the first successful call.
    pub async fn system_name(&self) -> AdapterResult<String> {
        self.system_name
            .get_or_try_init(|| self.call("system_name", self.inner.system_name()))
            .await
            .cloned()
    }

    /// Run a query. Each item pulled from the result is bounded by the
    /// receive timeout; a timed-out pull yields one error and ends the stream.
    pub async fn query(&self, request: QueryRequest) -> AdapterResult<QueryResponse> {
        let response = self.call("query", self.inner.query(request)).await?;

        let site = self.site.id.clone();
        let limit = self.receive_timeout;
        let timed = futures::stream::unfold(Some(response.into_stream()), move |state| {
            let site = site.clone();
            async move {
                let mut items = state?;
                match tokio::time::timeout(limit, items.next()).await {
                    Ok(Some(item)) => Some((item, Some(items))),
                    Ok(None) => None,
                    Err(_) => Some((
                        Err(AdapterError::Timeout {
                            site,
                            operation: "query_next".to_string(),
                            timeout_ms: limit.as_millis() as u64,
                        }),
                        None,
                    )),
                }
            }
        });

        Ok(QueryResponse::new(Box::pin(timed)))
    }

    pub async fn exists(&self, metadata: &Metadata) -> AdapterResult<bool> {
        self.call("exists", self.inner.exists(metadata)).await
    }

    pub async fn create_record(&self, request: CreateRequest) -> AdapterResult<bool> {
        self.call("create_record", self.inner.create_record(request)).await
    }

    pub async fn update_record(&self, request: UpdateRequest) -> AdapterResult<bool> {
        self.call("update_record", self.inner.update_record(request)).await
    }

    pub async fn delete_record(&self, request: DeleteRequest) -> AdapterResult<bool> {
        self.call("delete_record", self.inner.delete_record(request)).await
    }

    pub async fn read_resource(&self, request: ResourceRequest) -> AdapterResult<ResourceResponse> {
        self.call("read_resource", self.inner.read_resource(request)).await
    }

    pub async fn create_resource(&self, request: CreateStorageRequest) -> AdapterResult<bool> {
        self.call("create_resource", self.inner.create_resource(request)).await
    }

    pub async fn update_resource(&self, request: UpdateStorageRequest) -> AdapterResult<bool> {
        self.call("update_resource", self.inner.update_resource(request)).await
    }

    /// Close the underlying adapter. Safe to call more than once.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.inner.close().await;
            debug!(site = %self.site.id, "Adapter closed");
        }
    }
}
