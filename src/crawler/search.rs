use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing::{debug, info};

use crate::crawler::context::{BranchGuard, CrawlContext};
use crate::crawler::links::same_page;
use crate::crawler::trace::Trace;

/// Launch a branch search task on the runtime.
///
/// The branch is counted before it is spawned, so the counter cannot reach
/// zero between a parent deciding to branch and the child starting.
pub fn spawn_branch(context: &Arc<CrawlContext>, trace: Trace, url: String, depth: u32) {
    let guard = context.branch_started();
    let context = Arc::clone(context);
    tokio::spawn(async move {
        context.metrics().record_branch().await;
        search(context, guard, trace, url, depth).await;
    });
}

/// One branch: visit `url` at `depth`, look for the target among its links,
/// and branch into every unvisited link while under the depth bound.
///
/// Branches only stop cooperatively. A branch that has already started a
/// fetch finishes it even when another branch has won in the meantime.
fn search(
    context: Arc<CrawlContext>,
    guard: BranchGuard,
    trace: Trace,
    url: String,
    depth: u32,
) -> BoxFuture<'static, ()> {
    async move {
        let _guard = guard;

        if context.is_settled() {
            return;
        }

        let trace = trace.extended(url.clone(), depth);

        let links = match context.fetch_links(&url).await {
            Ok(links) => links,
            Err(e) => {
                debug!(url = %url, depth, error = %e, "Branch ended on fetch error");
                return;
            }
        };

        for link in links {
            if same_page(&link, context.target_url()) {
                if context.try_claim(trace.extended(link, depth + 1)) {
                    info!(url = %url, depth, "Target found");
                }
                return;
            }

            if context.is_settled() {
                return;
            }

            if depth < context.max_depth() && !trace.contains(&link) {
                spawn_branch(&context, trace.clone(), link, depth + 1);
            }
        }
    }
    .boxed()
}
