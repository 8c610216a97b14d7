//! Nostr event model, canonical serialization, signing and verification.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Short text note, used for comments.
pub const KIND_NOTE: u32 = 1;
/// NIP-09 deletion request.
pub const KIND_DELETION: u32 = 5;
/// NIP-25 reaction.
pub const KIND_REACTION: u32 = 7;
/// NIP-57 zap request.
pub const KIND_ZAP_REQUEST: u32 = 9734;
/// NIP-57 zap receipt.
pub const KIND_ZAP_RECEIPT: u32 = 9735;
/// NIP-23 long-form article.
pub const KIND_LONG_FORM: u32 = 30023;

/// Topic every long-form post published from this instance carries.
pub const IMPRINT_TOPIC: &str = "imprint";

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `e` – links to another event ID, optionally with a relay hint and a
///   `root`/`reply` marker
/// - `p` – references another author's public key
/// - `d` – unique identifier for replaceable events
/// - `t` – free-form topic or hashtag
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved, and
/// tag order is part of the event id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from its parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(parts.into_iter().map(Into::into).collect())
    }

    /// Tag name (first element).
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Element at `index`, if present.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    /// First value (second element).
    pub fn value(&self) -> Option<&str> {
        self.get(1)
    }
}

/// Signed Nostr event as exchanged with relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "17162c92...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["e", "root-id", "", "root"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tags.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Event content body.
    #[serde(default)]
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Values of every tag named `name`, in order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// First value of the tag named `name`.
    pub fn first_tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next()
    }

    /// The unsigned fields of this event.
    pub fn draft(&self) -> EventDraft {
        EventDraft {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// See [`verify`].
    pub fn verify(&self) -> bool {
        verify(self)
    }
}

/// Unsigned event fields awaiting an id and signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventDraft {
    /// Author public key (hex). Replaced by the signing key's own key on sign.
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub content: String,
}

impl EventDraft {
    /// Draft stamped with the current time.
    pub fn new(pubkey: impl Into<String>, kind: u32, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }

    /// Hex id this draft would have once signed.
    pub fn id(&self) -> Result<String> {
        let bytes = canonical_serialize(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        Ok(hex::encode(compute_id(&bytes)))
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Canonical signing payload `[0,pubkey,created_at,kind,tags,content]`.
///
/// Compact separators, non-ASCII content emitted as raw UTF-8.
pub fn canonical_serialize(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&(0, pubkey, created_at, kind, tags, content))?)
}

/// SHA-256 of the canonical payload.
pub fn compute_id(serialized: &[u8]) -> [u8; 32] {
    Sha256::digest(serialized).into()
}

/// Recompute the Nostr event hash from its fields.
pub(crate) fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let data = canonical_serialize(&ev.pubkey, ev.created_at, ev.kind, &ev.tags, &ev.content)?;
    Ok(compute_id(&data))
}

/// Sign a draft with `secret`, producing a complete event.
///
/// The event's `pubkey` is always the one derived from `secret`.
pub fn sign(secret: &SecretKey, draft: &EventDraft) -> Result<Event> {
    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, secret);
    let mut ev = Event {
        id: String::new(),
        pubkey: hex::encode(keypair.x_only_public_key().0.serialize()),
        kind: draft.kind,
        created_at: draft.created_at,
        tags: draft.tags.clone(),
        content: draft.content.clone(),
        sig: String::new(),
    };
    let hash = event_hash(&ev)?;
    ev.id = hex::encode(hash);
    let sig = secp.sign_schnorr(&Message::from_digest(hash), &keypair);
    ev.sig = hex::encode(sig.as_ref());
    Ok(ev)
}

/// Check an event's id and Schnorr signature. Fails closed on any malformed
/// field.
pub fn verify(ev: &Event) -> bool {
    match check_event(ev) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(id = %ev.id, error = %e, "event failed verification");
            false
        }
    }
}

/// Verify an event's ID and Schnorr signature, reporting why it failed.
pub fn check_event(ev: &Event) -> Result<()> {
    if !is_hex_of_len(&ev.id, 64) || !is_hex_of_len(&ev.pubkey, 64) || !is_hex_of_len(&ev.sig, 128) {
        return Err(Error::SignatureInvalid("malformed hex field".into()));
    }
    let hash = event_hash(ev)?;
    if hex::encode(hash) != ev.id {
        return Err(Error::SignatureInvalid("id mismatch".into()));
    }
    let bad = |e: secp256k1::Error| Error::SignatureInvalid(e.to_string());
    let sig_bytes = hex::decode(&ev.sig).map_err(|e| Error::SignatureInvalid(e.to_string()))?;
    let pk_bytes = hex::decode(&ev.pubkey).map_err(|e| Error::SignatureInvalid(e.to_string()))?;
    let sig = Signature::from_slice(&sig_bytes).map_err(bad)?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes).map_err(bad)?;
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &Message::from_digest(hash), &pk)
        .map_err(bad)
}

/// Accept an event signed in the browser for a draft prepared on the server.
///
/// The submitted id must be the draft's own id, so a client cannot swap in
/// different content under a valid signature.
pub fn validate_client_signed(draft: &EventDraft, signed: &Event) -> Result<()> {
    if signed.id != draft.id()? || signed.pubkey != draft.pubkey {
        return Err(Error::EventMismatch);
    }
    check_event(signed)
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Fields of a long-form (kind 30023) post.
#[derive(Debug, Clone, Default)]
pub struct LongFormParams {
    pub identifier: String,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub version: u32,
    pub status: String,
    pub supersedes: Option<String>,
    pub topics: Vec<String>,
}

/// Build a long-form draft, ensuring the instance topic appears exactly once.
pub fn long_form_draft(pubkey: &str, params: &LongFormParams) -> EventDraft {
    let created_at = unix_now();
    let mut tags = vec![
        Tag::new(["d", params.identifier.as_str()]),
        Tag::new(["title", params.title.as_str()]),
        Tag::new(["published_at".to_string(), created_at.to_string()]),
        Tag::new(["version".to_string(), params.version.to_string()]),
        Tag::new(["status", params.status.as_str()]),
    ];
    if let Some(summary) = params.summary.as_deref().filter(|s| !s.is_empty()) {
        tags.push(Tag::new(["summary", summary]));
    }
    if let Some(prev) = params.supersedes.as_deref() {
        tags.push(Tag::new(["supersedes", prev]));
    }
    for topic in with_imprint_topic(&params.topics) {
        tags.push(Tag::new(["t".to_string(), topic]));
    }
    EventDraft {
        pubkey: pubkey.to_string(),
        created_at,
        kind: KIND_LONG_FORM,
        tags,
        content: params.content.clone(),
    }
}

fn with_imprint_topic(topics: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for topic in topics {
        if !topic.is_empty() && !out.contains(topic) {
            out.push(topic.clone());
        }
    }
    if !out.iter().any(|t| t == IMPRINT_TOPIC) {
        out.push(IMPRINT_TOPIC.to_string());
    }
    out
}
