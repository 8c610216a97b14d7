//! Signing capabilities held by a session.

use std::{fmt, time::Duration};

use futures_util::{SinkExt, StreamExt};
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use crate::{
    error::{Error, Result},
    event::{self, Event, EventDraft},
    keys,
    relay::connect_ws,
};

/// Default wait for a remote bunker to answer.
pub const BUNKER_TIMEOUT: Duration = Duration::from_secs(10);

/// How a session authenticated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Browsing only, no signing.
    #[default]
    Readonly,
    /// The instance key held by this process.
    Local,
    /// Browser extension signer (NIP-07).
    Nip07,
    /// Remote bunker signer (NIP-46).
    Nip46,
}

/// Credential fields a session layer may hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    #[serde(default)]
    pub mode: SessionMode,
    #[serde(default)]
    pub pubkey_hex: Option<String>,
    #[serde(default)]
    pub signer_pubkey: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub relay: Option<String>,
}

/// Remote signer reached through a relay.
#[derive(Clone)]
pub struct RemoteBunker {
    pub signer_pubkey: String,
    pub relay: String,
    pub client_secret: String,
    pub timeout: Duration,
}

impl fmt::Debug for RemoteBunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBunker")
            .field("signer_pubkey", &self.signer_pubkey)
            .field("relay", &self.relay)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// One of the mutually exclusive ways a session can sign.
#[derive(Debug, Clone)]
pub enum Signer {
    Local { secret: SecretKey, pubkey: String },
    /// Signing happens in the browser; only the pubkey is known here.
    BrowserDelegated { pubkey: String },
    RemoteBunker(RemoteBunker),
}

impl Signer {
    pub fn local(secret: SecretKey) -> Self {
        let pubkey = keys::derive_public_key_hex(&secret);
        Signer::Local { secret, pubkey }
    }

    /// Pick the signer matching the session's credentials.
    ///
    /// `local_secret` is the instance key, used only by `local` sessions.
    /// Read-only sessions and sessions missing their mode's fields fail
    /// with [`Error::UnsupportedSessionForSigning`].
    pub fn from_session(creds: &SessionCredentials, local_secret: Option<&SecretKey>) -> Result<Self> {
        let unsupported = |why: &str| Error::UnsupportedSessionForSigning(why.to_string());
        match creds.mode {
            SessionMode::Readonly => Err(unsupported("read-only session")),
            SessionMode::Local => local_secret
                .map(|sk| Signer::local(*sk))
                .ok_or_else(|| unsupported("no local key configured")),
            SessionMode::Nip07 => match creds.pubkey_hex.as_deref() {
                Some(pk) if is_pubkey_hex(pk) => Ok(Signer::BrowserDelegated {
                    pubkey: pk.to_string(),
                }),
                _ => Err(unsupported("browser session without a public key")),
            },
            SessionMode::Nip46 => match (
                creds.signer_pubkey.as_deref(),
                creds.client_secret.as_deref(),
                creds.relay.as_deref(),
            ) {
                (Some(pk), Some(secret), Some(relay))
                    if is_pubkey_hex(pk) && !secret.is_empty() && !relay.is_empty() =>
                {
                    Ok(Signer::RemoteBunker(RemoteBunker {
                        signer_pubkey: pk.to_string(),
                        relay: relay.to_string(),
                        client_secret: secret.to_string(),
                        timeout: BUNKER_TIMEOUT,
                    }))
                }
                _ => Err(unsupported("remote signer session is incomplete")),
            },
        }
    }

    /// Hex public key events from this signer carry.
    pub fn public_key(&self) -> &str {
        match self {
            Signer::Local { pubkey, .. } | Signer::BrowserDelegated { pubkey } => pubkey,
            Signer::RemoteBunker(b) => &b.signer_pubkey,
        }
    }

    /// Sign `draft` as this signer's public key.
    pub async fn sign_event(&self, draft: &EventDraft) -> Result<Event> {
        let mut draft = draft.clone();
        draft.pubkey = self.public_key().to_string();
        match self {
            Signer::Local { secret, .. } => event::sign(secret, &draft),
            Signer::BrowserDelegated { .. } => Err(Error::SigningMustHappenClientSide),
            Signer::RemoteBunker(bunker) => bunker.sign(&draft).await,
        }
    }
}

impl RemoteBunker {
    async fn sign(&self, draft: &EventDraft) -> Result<Event> {
        let request_id = draft.id()?;
        let request = serde_json::json!({
            "id": request_id,
            "method": "sign_event",
            "params": [draft],
        });
        let started = tokio::time::Instant::now();
        let reply = timeout(self.timeout, self.round_trip(&request_id, request.to_string()))
            .await
            .map_err(|_| Error::RemoteSignerUnavailable(format!("no answer from {} in time", self.relay)))??;
        tracing::debug!(
            relay = %self.relay,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "remote signer answered"
        );
        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            let msg = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
            return Err(Error::RemoteSignerError(msg));
        }
        let result = reply
            .get("result")
            .cloned()
            .ok_or_else(|| Error::RemoteSignerError("response without result".into()))?;
        let signed: Event = serde_json::from_value(result)
            .map_err(|e| Error::RemoteSignerError(format!("unusable event: {e}")))?;
        event::validate_client_signed(draft, &signed).map_err(|e| Error::RemoteSignerError(e.to_string()))?;
        Ok(signed)
    }

    /// Send the request and wait for the reply carrying `request_id`.
    async fn round_trip(&self, request_id: &str, frame: String) -> Result<Value> {
        let unavailable = |e: Error| Error::RemoteSignerUnavailable(e.to_string());
        let mut ws = connect_ws(&self.relay, None).await.map_err(unavailable)?;
        ws.send(Message::Text(frame))
            .await
            .map_err(|e| Error::RemoteSignerUnavailable(e.to_string()))?;
        while let Some(msg) = ws.next().await {
            let msg = msg.map_err(|e| Error::RemoteSignerUnavailable(e.to_string()))?;
            let Message::Text(txt) = msg else {
                continue;
            };
            let Ok(val) = serde_json::from_str::<Value>(&txt) else {
                continue;
            };
            if val.get("id").and_then(Value::as_str) == Some(request_id) {
                let _ = ws.close(None).await;
                return Ok(val);
            }
        }
        Err(Error::RemoteSignerUnavailable(format!("{} closed the connection", self.relay)))
    }
}

fn is_pubkey_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
