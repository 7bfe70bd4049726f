use crate::api::MAX_PAGE_SIZE;
use crate::feed::{Disposition, Feed};
use crate::RedditClient;
use tracing::{debug, info, warn};
use votewatch_core::{CoreError, Item};

/// Items a walk found ahead of the feed's cursor, newest first.
#[derive(Debug, Clone)]
pub struct FeedWalk {
    pub feed: String,
    pub items: Vec<Item>,
    pub disposition: Disposition,
}

impl FeedWalk {
    pub fn is_delta(&self) -> bool {
        self.disposition == Disposition::Delta
    }
}

impl RedditClient {
    /// Pages through `feed` newest first, collecting up to `target_count`
    /// items and stopping at the feed's cursor, at an empty page or when the
    /// listing runs out. On success the cursor moves to the newest item
    /// returned; on error the feed is left as it was.
    pub async fn walk(&self, feed: &mut Feed, target_count: usize) -> Result<FeedWalk, CoreError> {
        let last_seen = feed.cursor().cloned();
        let max_calls = target_count.div_ceil(MAX_PAGE_SIZE);

        let mut items: Vec<Item> = Vec::new();
        let mut after: Option<String> = None;

        'pages: for call in 0..max_calls {
            let limit = (target_count - items.len()).min(MAX_PAGE_SIZE);
            if limit == 0 {
                break;
            }
            if max_calls > 1 {
                info!(
                    "Walking r/{}: call {}/{}, {} items so far",
                    feed.name(),
                    call + 1,
                    max_calls,
                    items.len()
                );
            }

            let page = self
                .api
                .list_new(feed.name(), limit, after.as_deref())
                .await?;

            if page.items.is_empty() {
                warn!(
                    "r/{} returned an empty page; it may not exist or have no posts",
                    feed.name()
                );
                break;
            }

            for item in page.items {
                if last_seen.as_ref() == Some(&item.fullname()) {
                    debug!("Reached last seen item {} in r/{}", item.fullname(), feed.name());
                    break 'pages;
                }
                items.push(item);
                if items.len() == target_count {
                    break 'pages;
                }
            }

            match page.after {
                Some(next) => after = Some(next),
                None => break,
            }
        }

        let disposition = feed.record_walk(&items);
        debug!(
            "Walk of r/{} found {} items ({:?})",
            feed.name(),
            items.len(),
            disposition
        );

        Ok(FeedWalk {
            feed: feed.name().to_string(),
            items,
            disposition,
        })
    }
}
