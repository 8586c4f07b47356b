//! Scheduler-task collaborator seam.

use std::sync::Arc;

use crate::{RouteCacheKey, RouteTree};

/// A prefetch task owned by the external scheduler.
///
/// The cache never drives tasks. It pings them when an entry they were
/// blocked on resolves, and asks whether an invalidation makes them dirty.
pub trait PrefetchTask: Send + Sync {
    /// The navigation target this task is prefetching.
    fn key(&self) -> &RouteCacheKey;

    /// Request re-evaluation by the scheduler.
    fn ping(&self);

    /// Fired when an invalidation affects this task.
    fn on_invalidate(&self);

    /// Whether this task's target is affected by the new ambient URL/tree.
    fn is_dirty(&self, next_url: Option<&str>, tree: Option<&RouteTree>) -> bool;
}

/// Ask the scheduler to re-evaluate `task`.
pub fn ping_prefetch_task(task: &Arc<dyn PrefetchTask>) {
    task.ping();
}

/// Dirtiness predicate, forwarded to the task's owner.
pub fn is_prefetch_task_dirty(
    task: &dyn PrefetchTask,
    next_url: Option<&str>,
    tree: Option<&RouteTree>,
) -> bool {
    task.is_dirty(next_url, tree)
}
