use std::sync::Arc;

use crate::error::SelectionError;
use crate::models::BenchmarkEntry;
use crate::store::RowStore;

// First pass plus the single retry after clearing markers.
const MAX_ATTEMPTS: usize = 2;

#[derive(Clone)]
pub struct EntrySelector {
    store: Arc<dyn RowStore>,
}

impl EntrySelector {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    pub async fn fetch_unused_entry(&self) -> Result<BenchmarkEntry, SelectionError> {
        for attempt in 1..=MAX_ATTEMPTS {
            if let Some(entry) = self.store.claim_random_unconsumed().await? {
                return Ok(entry);
            }
            if attempt < MAX_ATTEMPTS {
                tracing::info!("all entries consumed, clearing markers");
                self.store.clear_all_consumed_markers().await?;
            }
        }
        Err(SelectionError::Exhausted)
    }
}
