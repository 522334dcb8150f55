//! The pair of store adapters the engine coordinates.

use std::sync::Arc;

use duplex_core::workflow::StoreKind;
use duplex_store::StoreAdapter;

/// Both adapters, selectable by [`StoreKind`].
#[derive(Clone)]
pub struct StorePair {
    /// The relational store.
    pub relational: Arc<dyn StoreAdapter>,
    /// The document store.
    pub document: Arc<dyn StoreAdapter>,
}

impl StorePair {
    /// The adapter a step's action targets.
    #[must_use]
    pub fn adapter(&self, kind: StoreKind) -> &dyn StoreAdapter {
        match kind {
            StoreKind::Relational => self.relational.as_ref(),
            StoreKind::Document => self.document.as_ref(),
        }
    }
}
