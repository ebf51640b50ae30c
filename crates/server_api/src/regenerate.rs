use shared::domain::{FactoryId, Node};
use storage::Storage;
use tracing::debug;

use crate::random::random_in_range;

/// Atomically replaces every node of a factory with fresh random values drawn
/// from the factory's current bounds. `None` keeps the current population size.
pub async fn regenerate(
    storage: &Storage,
    factory_id: FactoryId,
    count: Option<usize>,
) -> storage::Result<Vec<Node>> {
    let nodes = storage
        .regenerate_nodes(factory_id, count, random_in_range)
        .await?;
    debug!(
        factory_id = factory_id.0,
        count = nodes.len(),
        "regenerated factory nodes"
    );
    Ok(nodes)
}
