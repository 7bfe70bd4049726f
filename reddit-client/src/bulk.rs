use crate::api::MAX_PAGE_SIZE;
use crate::RedditClient;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use votewatch_core::{CoreError, Fullname, Item};

/// A lookup batch that failed as a whole.
#[derive(Debug)]
pub struct BatchFailure {
    pub batch: usize,
    pub ids: Vec<Fullname>,
    pub error: CoreError,
}

/// Best-effort result of [`RedditClient::fetch_many`].
#[derive(Debug, Default)]
pub struct BulkFetch {
    pub items: HashMap<Fullname, Item>,
    pub failures: Vec<BatchFailure>,
    /// Requested ids the platform left out of otherwise successful batches,
    /// usually because the thing was deleted
    pub missing: Vec<Fullname>,
}

impl BulkFetch {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.missing.is_empty()
    }

    pub fn failed_ids(&self) -> usize {
        self.failures.iter().map(|f| f.ids.len()).sum()
    }
}

struct BatchOutcome {
    batch: usize,
    ids: Vec<Fullname>,
    result: Result<Vec<Item>, CoreError>,
}

impl RedditClient {
    /// Looks up the current state of `ids`, a hundred per call with every
    /// call in flight at once. The limiter is charged for the whole set up
    /// front. Failed batches are reported, not fatal.
    pub async fn fetch_many(&self, ids: &[Fullname]) -> BulkFetch {
        let mut fetch = BulkFetch::default();
        if ids.is_empty() {
            return fetch;
        }

        let batches: Vec<Vec<Fullname>> = ids.chunks(MAX_PAGE_SIZE).map(<[_]>::to_vec).collect();
        let total_batches = batches.len();

        let reservation = self.rate_limiter.acquire(total_batches as u32).await;
        debug!(
            "Reserved {} permits for {} ids after {:?}",
            reservation.permits,
            ids.len(),
            reservation.queue_wait_time
        );

        let (tx, mut rx) = mpsc::channel(total_batches);
        for (batch, batch_ids) in batches.into_iter().enumerate() {
            let tx = tx.clone();
            let api = Arc::clone(&self.api);
            tokio::spawn(async move {
                let result = api.lookup(&batch_ids).await;
                let outcome = BatchOutcome {
                    batch,
                    ids: batch_ids,
                    result,
                };
                if tx.send(outcome).await.is_err() {
                    error!("Bulk fetch batch {} finished after its fetch was dropped", batch);
                }
            });
        }
        // the channel closes once every batch task has reported or died
        drop(tx);

        let mut settled = HashSet::new();
        let mut received = 0;
        while let Some(outcome) = rx.recv().await {
            received += 1;
            match outcome.result {
                Ok(items) => {
                    debug!(
                        "Batch {}/{} returned {} of {} ids",
                        outcome.batch + 1,
                        total_batches,
                        items.len(),
                        outcome.ids.len()
                    );
                    settled.extend(outcome.ids);
                    for item in items {
                        fetch.items.insert(item.fullname(), item);
                    }
                }
                Err(e) => {
                    error!(
                        "Batch {}/{} of {} ids failed: {}",
                        outcome.batch + 1,
                        total_batches,
                        outcome.ids.len(),
                        e
                    );
                    fetch.failures.push(BatchFailure {
                        batch: outcome.batch,
                        ids: outcome.ids,
                        error: e,
                    });
                }
            }
        }
        if received < total_batches {
            error!(
                "Only {} of {} bulk fetch batches reported back",
                received, total_batches
            );
        }

        // the platform may answer with things nobody asked for
        fetch.items.retain(|id, _| settled.contains(id));

        for id in ids {
            if settled.contains(id) && !fetch.items.contains_key(id) {
                warn!("Item {} was requested but not returned", id);
                fetch.missing.push(id.clone());
            }
        }

        info!(
            "Fetched {} of {} items in {} batches ({} failed, {} missing)",
            fetch.items.len(),
            ids.len(),
            total_batches,
            fetch.failures.len(),
            fetch.missing.len()
        );
        fetch
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{client_over, numbered_link, numbered_links, ScriptedApi};
    use std::sync::Arc;
    use votewatch_core::Fullname;

    fn ids_of(from: u32, to: u32) -> Vec<Fullname> {
        (from..to).map(|n| numbered_link(n).fullname()).collect()
    }

    #[tokio::test]
    async fn test_fetch_many_batches_by_hundred() {
        let api = Arc::new(ScriptedApi::new());
        api.publish("demo", numbered_links(0, 250));
        let client = client_over(api.clone());
        let ids = ids_of(0, 250);

        let fetch = client.fetch_many(&ids).await;

        let mut sizes: Vec<usize> = api.lookup_calls().iter().map(Vec::len).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![50, 100, 100]);
        assert_eq!(fetch.items.len(), 250);
        assert!(fetch.items.keys().all(|id| ids.contains(id)));
        assert!(fetch.is_complete());

        // the reservation covers one permit per batch
        let status = client.rate_limiter().get_rate_limit_status().await;
        assert_eq!(status.current_window_requests, 3);
    }

    #[tokio::test]
    async fn test_fetch_many_returns_fresh_state() {
        let api = Arc::new(ScriptedApi::new());
        api.publish("demo", numbered_links(0, 3));
        let mut changed = numbered_link(1);
        changed.upvotes = 420;
        changed.comments = 17;
        changed.queried_at = 5000;
        api.update(changed.clone());

        let fetch = client_over(api).fetch_many(&ids_of(0, 3)).await;

        assert_eq!(fetch.items.get(&changed.fullname()), Some(&changed));
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_sink_the_rest() {
        let api = Arc::new(ScriptedApi::new());
        api.publish("demo", numbered_links(0, 250));
        let poisoned = numbered_link(120).fullname();
        api.fail_lookups_of(&poisoned);
        let client = client_over(api.clone());

        let fetch = client.fetch_many(&ids_of(0, 250)).await;

        assert_eq!(api.lookup_calls().len(), 3);
        assert_eq!(fetch.failures.len(), 1);
        let failure = &fetch.failures[0];
        assert_eq!(failure.batch, 1);
        assert!(failure.ids.contains(&poisoned));
        assert_eq!(fetch.failed_ids(), 100);
        assert_eq!(fetch.items.len(), 150);
        // ids of a failed batch are not reported as missing
        assert!(fetch.missing.is_empty());
        assert!(!fetch.is_complete());
    }

    #[tokio::test]
    async fn test_missing_ids_are_reported() {
        let api = Arc::new(ScriptedApi::new());
        api.publish("demo", numbered_links(0, 10));
        let deleted = numbered_link(4).fullname();
        api.remove(&deleted);

        let fetch = client_over(api).fetch_many(&ids_of(0, 10)).await;

        assert_eq!(fetch.items.len(), 9);
        assert_eq!(fetch.missing, vec![deleted]);
        assert!(fetch.failures.is_empty());
    }

    #[tokio::test]
    async fn test_empty_request_makes_no_calls() {
        let api = Arc::new(ScriptedApi::new());
        let client = client_over(api.clone());

        let fetch = client.fetch_many(&[]).await;

        assert!(fetch.items.is_empty());
        assert!(api.calls().is_empty());
        let status = client.rate_limiter().get_rate_limit_status().await;
        assert_eq!(status.current_window_requests, 0);
    }
}
