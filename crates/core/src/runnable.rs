use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An active component. `run` returns once `ctx` is cancelled.
#[async_trait]
pub trait Runnable: Send + Sync {
    fn name(&self) -> &str;

    async fn run(self: Arc<Self>, ctx: CancellationToken);
}

/// Runs every component concurrently and returns when all have returned.
pub async fn run_all(components: Vec<Arc<dyn Runnable>>, ctx: CancellationToken) {
    let runs = components.into_iter().map(|c| {
        let ctx = ctx.clone();
        async move {
            let name = c.name().to_string();
            c.run(ctx).await;
            debug!(component = %name, "component stopped");
        }
    });
    futures::future::join_all(runs).await;
}
