use crate::error::CoreError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static FULLNAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^t[1-6]_[a-z0-9]{6}$").expect("fullname pattern is a valid regex"));

/// Reddit "thing" kinds. Every kind shares one listing shape; fields that make
/// no sense for a kind (a comment's title) are left blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentKind {
    #[serde(rename = "t1")]
    Comment,
    #[serde(rename = "t2")]
    Account,
    #[serde(rename = "t3")]
    Link,
    #[serde(rename = "t4")]
    Message,
    #[serde(rename = "t5")]
    Subreddit,
    #[serde(rename = "t6")]
    Award,
}

impl ContentKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ContentKind::Comment => "t1",
            ContentKind::Account => "t2",
            ContentKind::Link => "t3",
            ContentKind::Message => "t4",
            ContentKind::Subreddit => "t5",
            ContentKind::Award => "t6",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "t1" => Some(ContentKind::Comment),
            "t2" => Some(ContentKind::Account),
            "t3" => Some(ContentKind::Link),
            "t4" => Some(ContentKind::Message),
            "t5" => Some(ContentKind::Subreddit),
            "t6" => Some(ContentKind::Award),
            _ => None,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// The key Reddit identifies any thing by: `{kind}_{id}`, e.g. `t3_62sjuh`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fullname(String);

impl Fullname {
    pub fn new(kind: ContentKind, id: &str) -> Self {
        Self(format!("{}_{}", kind.as_tag(), id))
    }

    /// Wraps a raw string without checking it. Storage may hand back keys
    /// that were never produced by this process; check them with
    /// [`Fullname::is_valid`] before trusting them.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let fullname = Self(raw.to_string());
        if fullname.is_valid() {
            Ok(fullname)
        } else {
            Err(CoreError::InvalidInput {
                message: format!("\"{}\" is not a valid fullname", raw),
            })
        }
    }

    pub fn is_valid(&self) -> bool {
        FULLNAME_PATTERN.is_match(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fullname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fullname {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Fullname {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// One snapshot of a tracked listing. `queried_at` is when Reddit served
/// this snapshot, so two snapshots of the same listing order by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub kind: ContentKind,
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub upvotes: i64,
    pub comments: u32,
    /// Unix seconds
    pub created_utc: i64,
    /// Unix seconds
    pub queried_at: i64,
}

impl Item {
    pub fn fullname(&self) -> Fullname {
        Fullname::new(self.kind, &self.id)
    }
}
