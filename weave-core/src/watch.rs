//! Watch/Dispatch (§4.6): a glob-filtered view over the Blackboard's event
//! channel, delivered at-least-once.

use crate::store::{glob_match, Subscription};
use crate::types::Event;

/// A subscription to Events matching a single glob pattern.
///
/// Backpressure is per-subscriber: a slow [`Watcher`] never blocks other
/// watchers or the publisher, because each holds its own bounded channel
/// from the underlying [`Subscription`].
pub struct Watcher {
    subscription: Subscription,
    pattern: String,
}

impl Watcher {
    pub(crate) fn new(subscription: Subscription, pattern: String) -> Self {
        Self { subscription, pattern }
    }

    /// Await the next Event matching this watcher's pattern, skipping any
    /// that don't match. Returns `None` once the underlying subscription has
    /// permanently stopped delivering.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            let message = self.subscription.recv().await?;
            match serde_json::from_slice::<Event>(&message.payload) {
                Ok(event) if glob_match(&self.pattern, &event.key) => return Some(event),
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(?err, "dropping malformed event payload");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::Blackboard;
    use crate::store::InMemoryStoreAdapter;
    use crate::types::ArtifactType;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn watcher_filters_by_prefix_pattern() {
        let bb = Blackboard::new(Arc::new(InMemoryStoreAdapter::new()));
        let mut watcher = bb.watch("agent:*").await.unwrap();

        bb.write("other:1", json!(1), ArtifactType::Context, None, true)
            .await
            .unwrap();
        bb.write("agent:1", json!(2), ArtifactType::Context, None, true)
            .await
            .unwrap();

        let event = watcher.next().await.unwrap();
        assert_eq!(event.key, "agent:1");
    }

    #[tokio::test]
    async fn two_watchers_both_receive_events() {
        let bb = Blackboard::new(Arc::new(InMemoryStoreAdapter::new()));
        let mut a = bb.watch("*").await.unwrap();
        let mut b = bb.watch("*").await.unwrap();

        bb.write("k", json!(1), ArtifactType::Context, None, true)
            .await
            .unwrap();

        assert_eq!(a.next().await.unwrap().key, "k");
        assert_eq!(b.next().await.unwrap().key, "k");
    }
}
