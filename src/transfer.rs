// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Execute one record operation against a destination.
//!
//! Shared by direct-mode cycles and queue workers, so both paths write
//! records the same way:
//!
//! | Operation | Resource URI | Calls |
//! |-----------|--------------|-------|
//! | DELETE | any | `delete_record` |
//! | CREATE | yes | source `read_resource` → `create_resource` |
//! | UPDATE | yes | source `read_resource` → `update_resource` |
//! | CREATE | no | `create_record` |
//! | UPDATE | no | `update_record` |
//!
//! Lineage and the replicated tag are stamped before any write.

use crate::adapter::SiteAdapter;
use crate::error::AdapterResult;
use crate::model::{
    CreateRequest, CreateStorageRequest, DeleteRequest, Metadata, ResourceRequest, UpdateRequest,
    UpdateStorageRequest,
};
use crate::queue::Operation;
use tracing::{debug, trace};

/// What one transfer did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOutcome {
    /// False when the destination rejected a well-formed request.
    pub accepted: bool,
    pub resource_bytes: u64,
    pub metadata_bytes: u64,
}

impl TransferOutcome {
    fn rejected() -> Self {
        Self::default()
    }
}

/// Pick the operation for a record from its tags and whether the destination
/// already holds it.
pub fn classify(metadata: &Metadata, exists_at_destination: bool) -> Operation {
    if metadata.is_deleted() {
        Operation::Delete
    } else if exists_at_destination {
        Operation::Update
    } else {
        Operation::Create
    }
}

/// Write `metadata` to `destination`.
///
/// `source_name` and `destination_name` are the sites' system names, used for
/// lineage.
pub async fn execute(
    source: &SiteAdapter,
    destination: &SiteAdapter,
    source_name: &str,
    destination_name: &str,
    mut metadata: Metadata,
    operation: Operation,
) -> AdapterResult<TransferOutcome> {
    metadata.prepare_for_transfer(source_name, destination_name);
    let metadata_bytes = metadata.metadata_size();
    let id = metadata.id.clone();

    let outcome = match operation {
        Operation::Delete => {
            let accepted = destination
                .delete_record(DeleteRequest {
                    metadata: vec![metadata],
                })
                .await?;
            TransferOutcome {
                accepted,
                resource_bytes: 0,
                metadata_bytes: 0,
            }
        }
        Operation::Create | Operation::Update if metadata.has_resource() => {
            let response = source
                .read_resource(ResourceRequest {
                    metadata: metadata.clone(),
                })
                .await?;
            let mut resource = response.resource;
            let resource_bytes = resource.size;
            resource.metadata = metadata;

            let accepted = if operation == Operation::Create {
                destination
                    .create_resource(CreateStorageRequest {
                        resources: vec![resource],
                    })
                    .await?
            } else {
                destination
                    .update_resource(UpdateStorageRequest {
                        resources: vec![resource],
                    })
                    .await?
            };
            if !accepted {
                return Ok(TransferOutcome::rejected());
            }
            TransferOutcome {
                accepted,
                resource_bytes,
                metadata_bytes,
            }
        }
        Operation::Create => {
            let accepted = destination
                .create_record(CreateRequest {
                    metadata: vec![metadata],
                })
                .await?;
            TransferOutcome {
                accepted,
                resource_bytes: 0,
                metadata_bytes: if accepted { metadata_bytes } else { 0 },
            }
        }
        Operation::Update => {
            let accepted = destination
                .update_record(UpdateRequest {
                    metadata: vec![metadata],
                })
                .await?;
            TransferOutcome {
                accepted,
                resource_bytes: 0,
                metadata_bytes: if accepted { metadata_bytes } else { 0 },
            }
        }
    };

    if outcome.accepted {
        trace!(
            metadata_id = %id,
            %operation,
            source = source_name,
            destination = destination_name,
            "Transfer accepted"
        );
    } else {
        debug!(
            metadata_id = %id,
            %operation,
            destination = destination_name,
            "Destination rejected transfer"
        );
    }
    Ok(outcome)
}
