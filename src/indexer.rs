//! Long-form (kind 30023) post indexing.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    client::RelayClient,
    event::{self, Event, KIND_LONG_FORM},
    relay::Filter,
};

/// Posts shorter than this are not indexed.
pub const MIN_CONTENT_CHARS: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LongFormEntry {
    pub event_id: String,
    pub pubkey: String,
    pub identifier: String,
    pub title: String,
    pub summary: Option<String>,
    pub version: u32,
    pub status: String,
    pub supersedes: Option<String>,
    pub topics: Vec<String>,
    pub published_at: u64,
    pub content: String,
}

impl LongFormEntry {
    /// Parse a long-form event. `None` when it is not kind 30023, lacks a
    /// `d` or `title` tag, or carries too little content.
    ///
    /// Single-valued tags take their last occurrence.
    pub fn from_event(ev: &Event) -> Option<Self> {
        if ev.kind != KIND_LONG_FORM || ev.content.chars().count() < MIN_CONTENT_CHARS {
            return None;
        }
        let last = |name: &str| ev.tag_values(name).last().map(str::to_string);
        let identifier = last("d").filter(|d| !d.is_empty())?;
        let title = last("title").filter(|t| !t.is_empty())?;
        Some(Self {
            event_id: ev.id.clone(),
            pubkey: ev.pubkey.clone(),
            identifier,
            title,
            summary: last("summary"),
            version: last("version").and_then(|v| v.trim().parse().ok()).unwrap_or(0),
            status: last("status").unwrap_or_else(|| "published".to_string()),
            supersedes: last("supersedes"),
            topics: ev.tag_values("t").map(str::to_string).collect(),
            published_at: last("published_at")
                .and_then(|v| v.parse().ok())
                .unwrap_or(ev.created_at),
            content: ev.content.clone(),
        })
    }
}

/// Every parsed revision, grouped by identifier.
#[derive(Debug, Clone, Default)]
pub struct LongFormIndex {
    by_identifier: BTreeMap<String, Vec<LongFormEntry>>,
}

impl LongFormIndex {
    /// Add one revision. A second event for the same identifier and version
    /// is ignored.
    pub fn insert(&mut self, entry: LongFormEntry) -> bool {
        let revisions = self.by_identifier.entry(entry.identifier.clone()).or_default();
        if revisions.iter().any(|r| r.version == entry.version) {
            return false;
        }
        let pos = revisions
            .iter()
            .position(|r| r.version > entry.version)
            .unwrap_or(revisions.len());
        revisions.insert(pos, entry);
        true
    }

    /// Highest version of each identifier.
    pub fn latest_versions(&self) -> Vec<&LongFormEntry> {
        self.by_identifier.values().filter_map(|revs| revs.last()).collect()
    }

    /// Revisions of `identifier`, oldest version first.
    pub fn revisions(&self, identifier: &str) -> &[LongFormEntry] {
        self.by_identifier
            .get(identifier)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_identifier.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identifier.is_empty()
    }
}

/// Fetch long-form posts and index the ones that verify and parse.
pub async fn index_long_form(
    client: &RelayClient,
    relays: &[String],
    since: Option<u64>,
    limit: usize,
) -> LongFormIndex {
    let mut filter = Filter::new().kinds([KIND_LONG_FORM]).limit(limit);
    if let Some(since) = since {
        filter = filter.since(since);
    }
    let events = client.fetch_events(&[filter], relays, None).await;
    let fetched = events.len();
    let mut index = LongFormIndex::default();
    for ev in events {
        if !event::verify(&ev) {
            tracing::debug!(id = %ev.id, "dropping unverified long-form event");
            continue;
        }
        if let Some(entry) = LongFormEntry::from_event(&ev) {
            index.insert(entry);
        }
    }
    tracing::info!(fetched, indexed = index.len(), "indexed long-form posts");
    index
}
