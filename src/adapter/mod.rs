// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node adapter contract.
//!
//! One implementation per remote protocol (CSW, REST, filesystem, ...). The
//! engine never talks to a protocol directly. It gets a [`SiteAdapter`] from
//! the [`AdapterRegistry`], which wraps whatever [`NodeAdapter`] the
//! registered [`AdapterFactory`] produced and applies the configured timeouts.
//!
//! # Example
//!
//! ```rust,no_run
//! use catalog_replication::adapter::{AdapterFuture, NodeAdapter};
//! use catalog_replication::model::*;
//! use std::future::Future;
//! use std::pin::Pin;
//!
//! struct EmptySite;
//!
//! impl NodeAdapter for EmptySite {
//!     fn is_available(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
//!         Box::pin(async { true })
//!     }
//!     fn system_name(&self) -> AdapterFuture<'_, String> {
//!         Box::pin(async { Ok("empty".to_string()) })
//!     }
//!     fn query(&self, _request: QueryRequest) -> AdapterFuture<'_, QueryResponse> {
//!         Box::pin(async { Ok(QueryResponse::empty()) })
//!     }
//!     fn exists<'a>(&'a self, _metadata: &'a Metadata) -> AdapterFuture<'a, bool> {
//!         Box::pin(async { Ok(false) })
//!     }
//!     fn create_record(&self, _r: CreateRequest) -> AdapterFuture<'_, bool> {
//!         Box::pin(async { Ok(true) })
//!     }
//!     fn update_record(&self, _r: UpdateRequest) -> AdapterFuture<'_, bool> {
//!         Box::pin(async { Ok(true) })
//!     }
//!     fn delete_record(&self, _r: DeleteRequest) -> AdapterFuture<'_, bool> {
//!         Box::pin(async { Ok(true) })
//!     }
//!     fn read_resource(&self, r: ResourceRequest) -> AdapterFuture<'_, ResourceResponse> {
//!         Box::pin(async move {
//!             Err(catalog_replication::AdapterError::communication("empty", format!("no resource for {}", r.metadata.id)))
//!         })
//!     }
//!     fn create_resource(&self, _r: CreateStorageRequest) -> AdapterFuture<'_, bool> {
//!         Box::pin(async { Ok(false) })
//!     }
//!     fn update_resource(&self, _r: UpdateStorageRequest) -> AdapterFuture<'_, bool> {
//!         Box::pin(async { Ok(false) })
//!     }
//!     fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
//!         Box::pin(async {})
//!     }
//! }
//! ```

pub mod memory;
mod registry;
mod site;

pub use memory::{MemoryAdapter, MemoryAdapterFactory};
pub use registry::{AdapterFactory, AdapterRegistry, SiteConnections};
pub use site::SiteAdapter;

use crate::error::AdapterResult;
use crate::model::{
    CreateRequest, CreateStorageRequest, DeleteRequest, Metadata, QueryRequest, QueryResponse,
    ResourceRequest, ResourceResponse, UpdateRequest, UpdateStorageRequest,
};
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed adapter futures (reduces trait signature complexity).
pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = AdapterResult<T>> + Send + 'a>>;

/// Capability set every remote site is normalized into.
///
/// Record and resource writes return `Ok(false)` for a well-formed rejection
/// (e.g. remote validation failed) and `Err` only for communication failure.
/// All calls may block on network I/O.
pub trait NodeAdapter: Send + Sync + 'static {
    /// Cheap liveness probe. Never fails; an unreachable site is `false`.
    fn is_available(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Stable identity of the remote site. Used for lineage and exclusion.
    fn system_name(&self) -> AdapterFuture<'_, String>;

    /// Records matching the request. Must honor excluded sites, failed ids,
    /// the `modified_after` cursor and pagination.
    fn query(&self, request: QueryRequest) -> AdapterFuture<'_, QueryResponse>;

    /// Whether a record with this id exists at the site.
    fn exists<'a>(&'a self, metadata: &'a Metadata) -> AdapterFuture<'a, bool>;

    fn create_record(&self, request: CreateRequest) -> AdapterFuture<'_, bool>;

    fn update_record(&self, request: UpdateRequest) -> AdapterFuture<'_, bool>;

    fn delete_record(&self, request: DeleteRequest) -> AdapterFuture<'_, bool>;

    /// Open the resource for a record. The returned content is read once.
    fn read_resource(&self, request: ResourceRequest) -> AdapterFuture<'_, ResourceResponse>;

    fn create_resource(&self, request: CreateStorageRequest) -> AdapterFuture<'_, bool>;

    fn update_resource(&self, request: UpdateStorageRequest) -> AdapterFuture<'_, bool>;

    /// Release resources. Idempotent; no further calls are valid afterward.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}
