use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::instrument;

use flowrelay_core::{FlowDocument, FlowId};

use crate::error::StoreError;

struct StoredFlow {
    document: Arc<FlowDocument>,
    saved_at: DateTime<Utc>,
}

/// Returned by [`FlowStore::save`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SaveAck {
    pub id: FlowId,
    pub revision: u64,
}

/// In-memory flow slots. Documents are replaced wholesale, never patched.
///
/// Readers get an `Arc` to the document that was current when they looked,
/// so a concurrent save can never expose a half-written flow.
#[derive(Default)]
pub struct FlowStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    flows: HashMap<FlowId, StoredFlow>,
    revision: u64,
}

impl FlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the `current` slot.
    pub fn save(&self, flow: FlowDocument) -> SaveAck {
        self.save_as(FlowId::current(), flow)
    }

    #[instrument(
        skip(self, flow),
        fields(flow_id = %id, nodes = flow.nodes.len(), edges = flow.edges.len())
    )]
    pub fn save_as(&self, id: FlowId, flow: FlowDocument) -> SaveAck {
        let stored = StoredFlow {
            document: Arc::new(flow),
            saved_at: Utc::now(),
        };

        let mut inner = self.inner.write();
        inner.revision += 1;
        let revision = inner.revision;
        inner.flows.insert(id.clone(), stored);
        drop(inner);

        tracing::debug!(revision, "Flow saved");
        SaveAck { id, revision }
    }

    #[instrument(skip(self))]
    pub fn load(&self, id: &str) -> Result<Arc<FlowDocument>, StoreError> {
        self.inner
            .read()
            .flows
            .get(id)
            .map(|stored| Arc::clone(&stored.document))
            .ok_or_else(|| StoreError::NotFound(FlowId::from_raw(id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().flows.contains_key(id)
    }

    /// Number of stored flows.
    pub fn len(&self) -> usize {
        self.inner.read().flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time of the most recent save across all slots.
    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .flows
            .values()
            .map(|stored| stored.saved_at)
            .max()
    }
}
