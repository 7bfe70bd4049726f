use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use votewatch_core::{Fullname, Item};

/// How far discovery has progressed in a feed.
///
/// A feed's first walk only sees whatever already existed, so its items are
/// a baseline rather than newly created listings. Keeping that explicit
/// stops a first run from persisting a backlog as fresh discoveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    /// No cursor yet
    Unseeded,
    /// Cursor set by a baseline walk; nothing discovered since
    SeededWithBaseline,
    /// At least one walk past the baseline has found new items
    SeededWithDeltas,
}

/// Whether a walk's items are newly created listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// First items ever seen in the feed; not to be tracked or persisted
    Baseline,
    /// Items created since the previous walk
    Delta,
}

#[derive(Debug, Clone)]
pub struct Feed {
    name: String,
    cursor: Option<Fullname>,
    status: FeedStatus,
}

impl Feed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cursor: None,
            status: FeedStatus::Unseeded,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The newest item seen so far, which the next walk stops at.
    pub fn cursor(&self) -> Option<&Fullname> {
        self.cursor.as_ref()
    }

    pub fn status(&self) -> FeedStatus {
        self.status
    }

    /// Advances the cursor past a completed walk and classifies its items.
    /// `items` are newest first; an empty walk leaves the feed untouched.
    pub fn record_walk(&mut self, items: &[Item]) -> Disposition {
        let disposition = match self.status {
            FeedStatus::Unseeded => Disposition::Baseline,
            FeedStatus::SeededWithBaseline | FeedStatus::SeededWithDeltas => Disposition::Delta,
        };

        let Some(newest) = items.first() else {
            return disposition;
        };
        self.cursor = Some(newest.fullname());

        let next = match self.status {
            FeedStatus::Unseeded => FeedStatus::SeededWithBaseline,
            FeedStatus::SeededWithBaseline | FeedStatus::SeededWithDeltas => {
                FeedStatus::SeededWithDeltas
            }
        };
        if next != self.status {
            info!("r/{} is now {}", self.name, next);
            self.status = next;
        }
        disposition
    }
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FeedStatus::Unseeded => "unseeded",
            FeedStatus::SeededWithBaseline => "seeded with baseline",
            FeedStatus::SeededWithDeltas => "seeded with deltas",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use votewatch_core::ContentKind;

    fn item(id: &str) -> Item {
        Item {
            kind: ContentKind::Link,
            id: id.to_string(),
            title: String::new(),
            upvotes: 1,
            comments: 0,
            created_utc: 0,
            queried_at: 0,
        }
    }

    #[test]
    fn test_new_feed_is_unseeded() {
        let feed = Feed::new("demo");
        assert_eq!(feed.name(), "demo");
        assert!(feed.cursor().is_none());
        assert_eq!(feed.status(), FeedStatus::Unseeded);
    }

    #[test]
    fn test_status_progression() {
        let mut feed = Feed::new("demo");

        assert_eq!(
            feed.record_walk(&[item("bbbbbb"), item("aaaaaa")]),
            Disposition::Baseline
        );
        assert_eq!(feed.status(), FeedStatus::SeededWithBaseline);
        assert_eq!(feed.cursor().map(Fullname::as_str), Some("t3_bbbbbb"));

        // nothing new: still only a baseline
        assert_eq!(feed.record_walk(&[]), Disposition::Delta);
        assert_eq!(feed.status(), FeedStatus::SeededWithBaseline);
        assert_eq!(feed.cursor().map(Fullname::as_str), Some("t3_bbbbbb"));

        assert_eq!(feed.record_walk(&[item("cccccc")]), Disposition::Delta);
        assert_eq!(feed.status(), FeedStatus::SeededWithDeltas);
        assert_eq!(feed.cursor().map(Fullname::as_str), Some("t3_cccccc"));

        assert_eq!(feed.record_walk(&[item("dddddd")]), Disposition::Delta);
        assert_eq!(feed.status(), FeedStatus::SeededWithDeltas);
    }

    #[test]
    fn test_empty_first_walk_stays_unseeded() {
        let mut feed = Feed::new("empty");
        assert_eq!(feed.record_walk(&[]), Disposition::Baseline);
        assert_eq!(feed.status(), FeedStatus::Unseeded);
        assert!(feed.cursor().is_none());
    }
}
