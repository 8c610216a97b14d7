//! Comment threads: relay notes merged with the durability cache, with
//! deletions flagged, blocked authors removed and replies nested.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use serde::Serialize;

use crate::{
    cache::TtlCache,
    client::{select_relays, Published, RelayClient},
    error::Result,
    event::{self, unix_now, Event, EventDraft, Tag, KIND_DELETION, KIND_NOTE},
    relay::Filter,
    signer::Signer,
    store::{BlockList, DurabilityStore},
};

/// One comment and its direct replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comment {
    pub id: String,
    pub pubkey: String,
    pub content: String,
    pub created_at: u64,
    /// Comment this one answers; `None` for top-level comments.
    pub parent_id: Option<String>,
    pub root_id: String,
    pub tags: Vec<Tag>,
    /// A deletion request targets this comment. It stays in the tree.
    pub deleted: bool,
    pub replies: Vec<Comment>,
}

impl Comment {
    /// This comment plus every nested reply.
    pub fn count(&self) -> usize {
        let mut total = 0;
        let mut stack = vec![self];
        while let Some(c) = stack.pop() {
            total += 1;
            stack.extend(c.replies.iter());
        }
        total
    }
}

#[derive(Debug, Clone)]
pub struct CommentConfig {
    /// Relays consulted per thread fetch.
    pub max_relays: usize,
    pub fetch_timeout: Duration,
    /// Durability rows older than this are ignored.
    pub local_cache_ttl: Duration,
    /// Lifetime of assembled threads.
    pub thread_cache_ttl: Duration,
    pub limit: usize,
}

impl Default for CommentConfig {
    fn default() -> Self {
        Self {
            max_relays: 5,
            fetch_timeout: Duration::from_secs(3),
            local_cache_ttl: Duration::from_secs(600),
            thread_cache_ttl: Duration::from_secs(30),
            limit: 100,
        }
    }
}

type ThreadKey = (String, Option<String>);

pub struct CommentService {
    client: Arc<RelayClient>,
    store: Arc<dyn DurabilityStore>,
    blocks: Arc<dyn BlockList>,
    threads: TtlCache<ThreadKey, Vec<Comment>>,
    config: CommentConfig,
}

impl CommentService {
    pub fn new(
        client: Arc<RelayClient>,
        store: Arc<dyn DurabilityStore>,
        blocks: Arc<dyn BlockList>,
        config: CommentConfig,
    ) -> Self {
        Self {
            threads: TtlCache::new(config.thread_cache_ttl),
            client,
            store,
            blocks,
            config,
        }
    }

    /// Thread under `root_id` as seen by `viewer`.
    ///
    /// `related_ids` widens the `#e` lookup, e.g. to every version of an
    /// essay; when empty only `root_id` is used. Never fails: relay and
    /// store problems degrade to whatever could be read.
    pub async fn fetch_thread(
        &self,
        root_id: &str,
        related_ids: &[String],
        until: Option<u64>,
        viewer: Option<&str>,
        relays: &[String],
    ) -> Vec<Comment> {
        let key = (root_id.to_string(), viewer.map(str::to_string));
        if let Some(hit) = self.threads.get(&key) {
            tracing::debug!(root = root_id, viewer, "thread served from cache");
            return hit;
        }
        let started = tokio::time::Instant::now();
        let relays = select_relays(relays, self.config.max_relays);
        let referenced = if related_ids.is_empty() {
            vec![root_id.to_string()]
        } else {
            related_ids.to_vec()
        };
        let mut filter = Filter::new()
            .kinds([KIND_NOTE])
            .events(referenced)
            .limit(self.config.limit);
        filter.until = until;

        let relay_events = if relays.is_empty() {
            Vec::new()
        } else {
            self.client
                .fetch_events(&[filter], &relays, Some(self.config.fetch_timeout))
                .await
        };
        let relay_events = relay_events
            .into_iter()
            .filter(|ev| ev.kind == KIND_NOTE && event::verify(ev));

        let cutoff = unix_now().saturating_sub(self.config.local_cache_ttl.as_secs());
        let local_events = self.store.load_root(root_id, cutoff).unwrap_or_else(|e| {
            tracing::warn!(root = root_id, error = %e, "durability cache unavailable");
            Vec::new()
        });

        let mut seen = HashSet::new();
        let merged: Vec<Event> = relay_events
            .chain(local_events)
            .filter(|ev| !ev.id.is_empty() && seen.insert(ev.id.clone()))
            .collect();

        let deleted = self.deleted_ids(&merged, &relays).await;
        let blocked = match viewer {
            Some(v) => self.blocks.blocked_for(v).unwrap_or_else(|e| {
                tracing::warn!(viewer = v, error = %e, "block list unavailable");
                HashSet::new()
            }),
            None => HashSet::new(),
        };

        let thread = build_thread(merged, root_id, &deleted, &blocked);
        tracing::debug!(
            root = root_id,
            viewer,
            count = thread.len(),
            blocked = blocked.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "assembled thread"
        );
        self.threads.insert(key, thread.clone());
        thread
    }

    /// Ids targeted by deletion requests; their durability rows are dropped.
    async fn deleted_ids(&self, comments: &[Event], relays: &[String]) -> HashSet<String> {
        let mut deleted = HashSet::new();
        if comments.is_empty() || relays.is_empty() {
            return deleted;
        }
        let ids: Vec<String> = comments.iter().map(|ev| ev.id.clone()).collect();
        let filter = Filter::new().kinds([KIND_DELETION]).events(ids);
        let deletions = self
            .client
            .fetch_events(&[filter], relays, Some(self.config.fetch_timeout))
            .await;
        for d in deletions.iter().filter(|d| d.kind == KIND_DELETION && event::verify(d)) {
            for target in d.tag_values("e") {
                if deleted.insert(target.to_string()) {
                    if let Err(e) = self.store.remove(target) {
                        tracing::warn!(id = target, error = %e, "failed to drop deleted row");
                    }
                }
            }
        }
        deleted
    }

    /// Draft a kind-1 comment on `root_id`, optionally replying to `parent`.
    pub fn draft_comment(
        &self,
        pubkey: &str,
        root_id: &str,
        root_author: &str,
        content: &str,
        parent: Option<&str>,
    ) -> EventDraft {
        let mut tags = vec![
            Tag::new(["e", root_id, "", "root"]),
            Tag::new(["p", root_author]),
        ];
        if let Some(parent) = parent {
            tags.push(Tag::new(["e", parent, "", "reply"]));
        }
        EventDraft::new(pubkey, KIND_NOTE, tags, content)
    }

    /// Sign and publish a comment, cache it locally and refresh the thread.
    pub async fn publish_comment(
        &self,
        signer: &Signer,
        root_id: &str,
        root_author: &str,
        content: &str,
        parent: Option<&str>,
        relays: &[String],
    ) -> Result<Published> {
        let draft = self.draft_comment(signer.public_key(), root_id, root_author, content, parent);
        let signed = signer.sign_event(&draft).await?;
        Ok(self.distribute(root_id, signed, relays).await)
    }

    /// Accept a comment signed in the browser for `draft`.
    pub async fn publish_signed_comment(
        &self,
        draft: &EventDraft,
        signed: Event,
        root_id: &str,
        relays: &[String],
    ) -> Result<Published> {
        event::validate_client_signed(draft, &signed)?;
        Ok(self.distribute(root_id, signed, relays).await)
    }

    async fn distribute(&self, root_id: &str, signed: Event, relays: &[String]) -> Published {
        let statuses = self.client.publish(&signed, relays).await;
        if let Err(e) = self.store.store(root_id, &signed) {
            tracing::warn!(root = root_id, id = %signed.id, error = %e, "failed to cache comment");
        }
        self.invalidate(root_id);
        tracing::debug!(root = root_id, id = %signed.id, relays = statuses.len(), "comment published");
        Published {
            event: signed,
            relays: statuses,
        }
    }

    /// Publish a deletion request for `comment_id` and forget the local copy.
    pub async fn delete_comment(
        &self,
        signer: &Signer,
        comment_id: &str,
        root_id: &str,
        relays: &[String],
    ) -> Result<Published> {
        let draft = EventDraft::new(
            signer.public_key(),
            KIND_DELETION,
            vec![Tag::new(["e", comment_id])],
            "",
        );
        let signed = signer.sign_event(&draft).await?;
        let statuses = self.client.publish(&signed, relays).await;
        if let Err(e) = self.store.remove(comment_id) {
            tracing::warn!(id = comment_id, error = %e, "failed to drop deleted row");
        }
        self.invalidate(root_id);
        tracing::debug!(id = comment_id, root = root_id, "comment deleted");
        Ok(Published {
            event: signed,
            relays: statuses,
        })
    }

    /// Forget assembled threads for `root_id`, for every viewer.
    pub fn invalidate(&self, root_id: &str) {
        self.threads.invalidate_where(|(root, _)| root == root_id);
    }

    /// Forget every thread assembled for `viewer`, e.g. after a block change.
    pub fn invalidate_viewer(&self, viewer: &str) {
        self.threads
            .invalidate_where(|(_, v)| v.as_deref() == Some(viewer));
    }
}

/// Nest `events` into a thread rooted at `root_id`.
///
/// Authors in `blocked` are dropped first. Replies hang under the comment
/// named by their `reply` marker and are ordered by creation time, as are
/// top-level comments. Replies whose parent is missing, and reply cycles,
/// are left out. Runs in one pass over an id map without recursion.
pub fn build_thread(
    events: Vec<Event>,
    root_id: &str,
    deleted: &HashSet<String>,
    blocked: &HashSet<String>,
) -> Vec<Comment> {
    let mut nodes: HashMap<String, Comment> = HashMap::new();
    for ev in events {
        if blocked.contains(&ev.pubkey) || nodes.contains_key(&ev.id) {
            continue;
        }
        let (parent_id, thread_root) = thread_markers(&ev);
        let comment = Comment {
            deleted: deleted.contains(&ev.id),
            id: ev.id,
            pubkey: ev.pubkey,
            content: ev.content,
            created_at: ev.created_at,
            parent_id,
            root_id: thread_root.unwrap_or_else(|| root_id.to_string()),
            tags: ev.tags,
            replies: Vec::new(),
        };
        nodes.insert(comment.id.clone(), comment);
    }

    // A reply to a root that is not itself in the set is top-level.
    let present: HashSet<String> = nodes.keys().cloned().collect();
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for node in nodes.values_mut() {
        let Some(parent) = node.parent_id.clone() else {
            continue;
        };
        if present.contains(&parent) {
            children.entry(parent).or_default().push(node.id.clone());
        } else if parent == root_id || parent == node.root_id {
            node.parent_id = None;
        }
    }

    let mut queue: VecDeque<String> = nodes
        .values()
        .filter(|c| c.parent_id.is_none())
        .map(|c| c.id.clone())
        .collect();
    let mut order = Vec::new();
    let mut reached = HashSet::new();
    while let Some(id) = queue.pop_front() {
        if !reached.insert(id.clone()) {
            continue;
        }
        if let Some(kids) = children.get(&id) {
            queue.extend(kids.iter().cloned());
        }
        order.push(id);
    }

    // Children come after their parent in `order`, so walking it backwards
    // finishes every subtree before it is attached.
    let mut top = Vec::new();
    for id in order.iter().rev() {
        let Some(mut node) = nodes.remove(id) else {
            continue;
        };
        sort_by_time(&mut node.replies);
        let parent = node.parent_id.clone();
        match parent.and_then(|p| nodes.get_mut(&p)) {
            Some(parent) => parent.replies.push(node),
            None => top.push(node),
        }
    }
    sort_by_time(&mut top);
    top
}

/// Parent and thread root named by an event's marked `e` tags.
fn thread_markers(ev: &Event) -> (Option<String>, Option<String>) {
    let mut parent = None;
    let mut root = None;
    for tag in &ev.tags {
        if tag.name() != Some("e") {
            continue;
        }
        match (tag.value(), tag.get(3)) {
            (Some(id), Some("reply")) => parent = Some(id.to_string()),
            (Some(id), Some("root")) => root = Some(id.to_string()),
            _ => {}
        }
    }
    (parent, root)
}

fn sort_by_time(comments: &mut [Comment]) {
    comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
