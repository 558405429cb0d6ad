use crate::domain::IndexSpec;
use crate::guard::ErrorPolicy;
use crate::ports::DocumentStore;
use shared::Result;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOutcome {
    Created,
    AlreadyPresent,
    /// Creation failed and the failure was tolerated
    Skipped,
}

/// Create `index` unless an index with the same name is already there.
/// Failures follow the error-tolerance setting of the calling storage.
pub async fn ensure_index(
    store: &dyn DocumentStore,
    index: &IndexSpec,
    ignore_errors: bool,
) -> Result<IndexOutcome> {
    let policy = ErrorPolicy::new("INDEX_BOOTSTRAP", ignore_errors);
    let result = try_ensure_index(store, index).await;
    policy.settle("ensure_index", result, || IndexOutcome::Skipped)
}

async fn try_ensure_index(store: &dyn DocumentStore, index: &IndexSpec) -> Result<IndexOutcome> {
    if store.index_names().await?.iter().any(|name| name == &index.name) {
        debug!("Index {} already present", index.name);
        return Ok(IndexOutcome::AlreadyPresent);
    }

    store.create_index(index).await?;
    info!("Created index {}", index.name);
    Ok(IndexOutcome::Created)
}
