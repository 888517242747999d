// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Value types describing a replicable record and its binary payload.
//!
//! A [`Metadata`] record is identified by an `id` that is stable across sites.
//! It may point at a [`Resource`] (the product file) through `resource_uri`.
//! Resources carry a single-use content stream: moving the [`ResourceContent`]
//! out of a resource consumes it, so a transfer attempt can read it only once.
//!
//! # Lineage
//!
//! Every record remembers the ordered list of sites it passed through. Before
//! a record is written to a destination, [`Metadata::prepare_for_transfer`]
//! appends the source site and cuts any loop back to the destination:
//!
//! ```text
//! lineage [A, B, C], source C, destination B  →  [A]  + C  →  [A, C]
//! lineage [A],       source B, destination C  →  [A, B]
//! ```

use crate::error::AdapterResult;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Tag marking a record deleted at its source.
pub const DELETED_TAG: &str = "deleted";

/// Tag added to every record written by replication.
pub const REPLICATED_TAG: &str = "replicated";

/// Opaque record payload plus the descriptor needed to interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayload {
    /// e.g. "application/xml", "application/json"
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl RawPayload {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A replicable metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Stable identifier, the join key across sites.
    pub id: String,
    /// Schema/class tag of the payload.
    pub metadata_type: String,
    pub payload: RawPayload,
    pub tags: BTreeSet<String>,
    /// Sites this record passed through, oldest first.
    pub lineage: Vec<String>,
    pub metadata_modified: DateTime<Utc>,
    pub resource_uri: Option<String>,
    pub resource_size: Option<u64>,
    pub resource_modified: Option<DateTime<Utc>>,
}

impl Metadata {
    /// Create a record with no tags, lineage or resource.
    pub fn new(
        id: impl Into<String>,
        metadata_type: impl Into<String>,
        payload: RawPayload,
        metadata_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            metadata_type: metadata_type.into(),
            payload,
            tags: BTreeSet::new(),
            lineage: Vec::new(),
            metadata_modified,
            resource_uri: None,
            resource_size: None,
            resource_modified: None,
        }
    }

    /// Attach a resource reference.
    pub fn with_resource(mut self, uri: impl Into<String>, size: u64, modified: DateTime<Utc>) -> Self {
        self.resource_uri = Some(uri.into());
        self.resource_size = Some(size);
        self.resource_modified = Some(modified);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.tags.contains(DELETED_TAG)
    }

    pub fn has_resource(&self) -> bool {
        self.resource_uri.is_some()
    }

    /// Size in bytes of the raw payload, used for transfer accounting.
    pub fn metadata_size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Stamp lineage and the replicated tag before writing to `destination`.
    ///
    /// If `destination` already appears in the lineage the record has looped
    /// back, and everything from that point on is dropped.
    pub fn prepare_for_transfer(&mut self, source: &str, destination: &str) {
        if let Some(pos) = self.lineage.iter().position(|site| site == destination) {
            self.lineage.truncate(pos);
        }
        if self.lineage.last().map(String::as_str) != Some(source) {
            self.lineage.push(source.to_string());
        }
        self.tags.insert(REPLICATED_TAG.to_string());
    }
}

/// Single-use async byte stream for resource content.
pub struct ResourceContent {
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl ResourceContent {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
        }
    }

    /// Content held fully in memory.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(std::io::Cursor::new(bytes.into()))
    }

    /// Consume the handle, returning the underlying reader.
    pub fn into_reader(self) -> Box<dyn AsyncRead + Send + Unpin> {
        self.reader
    }

    /// Consume the handle, reading it to the end.
    pub async fn read_all(self) -> std::io::Result<Vec<u8>> {
        let mut reader = self.reader;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl fmt::Debug for ResourceContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResourceContent(..)")
    }
}

/// Binary payload belonging to exactly one metadata record.
#[derive(Debug)]
pub struct Resource {
    pub id: String,
    pub name: String,
    pub uri: String,
    /// Sub-resource designator, e.g. "thumbnail".
    pub qualifier: Option<String>,
    pub mime_type: String,
    pub size: u64,
    pub metadata: Metadata,
    pub content: ResourceContent,
}

/// Selection sent to a source adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    pub predicate: String,
    /// Records whose lineage includes any of these site names are skipped.
    pub excluded_sites: Vec<String>,
    /// Ids re-included regardless of `modified_after`.
    pub failed_item_ids: Vec<String>,
    /// Only records modified strictly after this instant (plus failed ids).
    pub modified_after: Option<DateTime<Utc>>,
    pub start_index: usize,
    pub page_size: usize,
}

impl QueryRequest {
    /// Check whether a record satisfies the request's cursor, failure list
    /// and exclusion rules. The predicate itself is the adapter's business.
    pub fn admits(&self, metadata: &Metadata) -> bool {
        if metadata
            .lineage
            .iter()
            .any(|site| self.excluded_sites.contains(site))
        {
            return false;
        }
        if self.failed_item_ids.contains(&metadata.id) {
            return true;
        }
        match self.modified_after {
            Some(after) => metadata.metadata_modified > after,
            None => true,
        }
    }
}

/// Lazy, finite, single-pass sequence of query results.
pub struct QueryResponse {
    items: BoxStream<'static, AdapterResult<Metadata>>,
}

impl QueryResponse {
    pub fn new(items: BoxStream<'static, AdapterResult<Metadata>>) -> Self {
        Self { items }
    }

    /// Response over records already in memory.
    pub fn from_items(items: Vec<Metadata>) -> Self {
        Self::new(Box::pin(stream::iter(items.into_iter().map(Ok))))
    }

    pub fn empty() -> Self {
        Self::from_items(Vec::new())
    }

    pub fn into_stream(self) -> BoxStream<'static, AdapterResult<Metadata>> {
        self.items
    }
}

impl fmt::Debug for QueryResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueryResponse(..)")
    }
}

/// Create one or more records at a destination.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub metadata: Vec<Metadata>,
}

/// Update one or more records at a destination.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub metadata: Vec<Metadata>,
}

/// Delete one or more records at a destination.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub metadata: Vec<Metadata>,
}

/// Fetch the resource belonging to a record.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub metadata: Metadata,
}

#[derive(Debug)]
pub struct ResourceResponse {
    pub resource: Resource,
}

/// Store a new resource (and its record) at a destination.
#[derive(Debug)]
pub struct CreateStorageRequest {
    pub resources: Vec<Resource>,
}

/// Replace an existing resource at a destination.
#[derive(Debug)]
pub struct UpdateStorageRequest {
    pub resources: Vec<Resource>,
}
