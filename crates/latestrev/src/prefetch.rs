use std::sync::Arc;

use anyhow::{Context, Result};

use latestrev_service::config::Config;
use latestrev_service::coordinator::ReleaseCoordinator;
use latestrev_service::snapshot::Snapshot;

/// Resolves the published release and all of its items, then prints the snapshot id.
///
/// With a `cache_dir` configured, this leaves everything in the file system cache so that a
/// server started afterwards can serve it without reaching the content API.
pub fn prefetch(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("latestrev-prefetch")
        .enable_all()
        .build()?;

    let coordinator =
        ReleaseCoordinator::from_config(&config).context("failed to create the content sources")?;
    let snapshot = runtime.block_on(prefetch_published(&coordinator))?;

    println!("{}", snapshot.id());
    Ok(())
}

async fn prefetch_published(coordinator: &ReleaseCoordinator) -> Result<Arc<Snapshot>> {
    let snapshot = coordinator
        .refresh_published()
        .await
        .context("failed to resolve the published release")?;

    for collection_id in snapshot.manifest().collections.keys() {
        let items = snapshot
            .get_items(collection_id)
            .await
            .with_context(|| format!("failed to resolve collection `{collection_id}`"))?;
        tracing::info!(
            snapshot = snapshot.id(),
            collection = %collection_id,
            items = items.len(),
            "Prefetched collection"
        );
    }

    Ok(snapshot)
}
