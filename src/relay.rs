//! NIP-01 wire protocol: filters, client and relay frames, and connection
//! setup.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::{
    error::{Error, Result},
    event::Event,
};

/// Subscription filter sent inside `REQ`.
///
/// Unset fields are omitted on the wire. Several filters in one `REQ` are
/// OR-ed by the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    /// Referenced event ids.
    #[serde(rename = "#e", skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<String>>,
    /// Referenced pubkeys.
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub pubkeys: Option<Vec<String>>,
    #[serde(rename = "#t", skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(rename = "#d", skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    /// Restrict to events tagging any of `ids` with an `e` tag.
    pub fn events(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.events = Some(ids.into_iter().collect());
        self
    }

    pub fn pubkeys(mut self, pubkeys: impl IntoIterator<Item = String>) -> Self {
        self.pubkeys = Some(pubkeys.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Frames sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage<'a> {
    /// `["EVENT", <event>]`
    Event(&'a Event),
    /// `["REQ", <sub id>, <filter>...]`
    Req {
        subscription_id: &'a str,
        filters: &'a [Filter],
    },
    /// `["CLOSE", <sub id>]`
    Close { subscription_id: &'a str },
}

impl ClientMessage<'_> {
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Event(ev) => {
                Value::Array(vec![Value::String("EVENT".into()), serde_json::to_value(ev)?])
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![
                    Value::String("REQ".into()),
                    Value::String(subscription_id.to_string()),
                ];
                for f in filters.iter() {
                    arr.push(serde_json::to_value(f)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => serde_json::json!(["CLOSE", subscription_id]),
        };
        Ok(value.to_string())
    }
}

/// Frames received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <sub id>, <event>]`
    Event { subscription_id: String, event: Event },
    /// `["OK", <event id>, <accepted>, <message>]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", <sub id>]`
    Eose { subscription_id: String },
    /// `["CLOSED", <sub id>, <message>]`
    Closed { subscription_id: String, message: String },
    /// `["NOTICE", <message>]`
    Notice { message: String },
}

impl RelayMessage {
    /// Parse a relay frame. Unknown or malformed frames yield `None`; relays
    /// are untrusted so nothing here is an error.
    pub fn parse(txt: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(txt).ok()?;
        let arr = val.as_array()?;
        let text = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
        match arr.first().and_then(|v| v.as_str())? {
            "EVENT" if arr.len() >= 3 => {
                let event = serde_json::from_value::<Event>(arr[2].clone()).ok()?;
                Some(RelayMessage::Event {
                    subscription_id: text(1)?,
                    event,
                })
            }
            "OK" if arr.len() >= 3 => Some(RelayMessage::Ok {
                event_id: text(1)?,
                accepted: arr[2].as_bool()?,
                message: text(3).unwrap_or_default(),
            }),
            "EOSE" => Some(RelayMessage::Eose {
                subscription_id: text(1)?,
            }),
            "CLOSED" => Some(RelayMessage::Closed {
                subscription_id: text(1)?,
                message: text(2).unwrap_or_default(),
            }),
            "NOTICE" => Some(RelayMessage::Notice {
                message: text(1).unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// Blanket trait for boxed async read/write streams.
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

pub(crate) type RelayStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy. `wss://`
/// URLs are wrapped in TLS.
pub(crate) async fn connect_ws(relay: &str, socks: Option<&str>) -> Result<RelayStream> {
    let url = Url::parse(relay).map_err(|e| Error::relay(relay, e))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(Error::relay(relay, format!("unsupported scheme {}", url.scheme())));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::relay(relay, "missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::relay(relay, "missing port"))?;
    let req = relay
        .into_client_request()
        .map_err(|e| Error::relay(relay, e))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::relay(relay, e))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::relay(relay, e))?,
        )
    };
    let (ws, _) = client_async_tls(req, stream)
        .await
        .map_err(|e| Error::relay(relay, e))?;
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Tag, KIND_NOTE};

    fn sample_event() -> Event {
        Event {
            id: "aa11".into(),
            pubkey: "p".into(),
            kind: KIND_NOTE,
            created_at: 1,
            tags: vec![Tag::new(["e", "root", "", "root"])],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn filter_omits_unset_fields() {
        let f = Filter::new().kinds([1, 5]).events(["abc".to_string()]).limit(10);
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(json, r##"{"kinds":[1,5],"#e":["abc"],"limit":10}"##);
        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn req_frame_carries_all_filters() {
        let filters = [Filter::new().kinds([1]), Filter::new().kinds([5]).since(3)];
        let txt = ClientMessage::Req {
            subscription_id: "s1",
            filters: &filters,
        }
        .to_json()
        .unwrap();
        assert_eq!(txt, r#"["REQ","s1",{"kinds":[1]},{"kinds":[5],"since":3}]"#);
    }

    #[test]
    fn event_and_close_frames() {
        let ev = sample_event();
        let txt = ClientMessage::Event(&ev).to_json().unwrap();
        let val: Value = serde_json::from_str(&txt).unwrap();
        assert_eq!(val[0], "EVENT");
        assert_eq!(val[1]["id"], "aa11");
        let close = ClientMessage::Close { subscription_id: "s" }.to_json().unwrap();
        assert_eq!(close, r#"["CLOSE","s"]"#);
    }

    #[test]
    fn parses_relay_frames() {
        let ev = sample_event();
        let txt = serde_json::json!(["EVENT", "s", ev]).to_string();
        assert_eq!(
            RelayMessage::parse(&txt),
            Some(RelayMessage::Event {
                subscription_id: "s".into(),
                event: ev
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["EOSE","s"]"#),
            Some(RelayMessage::Eose {
                subscription_id: "s".into()
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["OK","aa",false,"blocked: spam"]"#),
            Some(RelayMessage::Ok {
                event_id: "aa".into(),
                accepted: false,
                message: "blocked: spam".into()
            })
        );
        assert_eq!(
            RelayMessage::parse(r#"["NOTICE","slow down"]"#),
            Some(RelayMessage::Notice {
                message: "slow down".into()
            })
        );
    }

    #[test]
    fn ignores_garbage() {
        for txt in [
            "not json",
            "{}",
            "[]",
            r#"["EVENT","s",{"id":1}]"#,
            r#"["AUTH","challenge"]"#,
            r#"["EOSE"]"#,
        ] {
            assert_eq!(RelayMessage::parse(txt), None, "{txt}");
        }
    }

    #[tokio::test]
    async fn connect_rejects_bad_urls() {
        for url in ["http://example.com", "not a url", "ws://"] {
            assert!(matches!(
                connect_ws(url, None).await,
                Err(Error::RelayConnection { .. })
            ));
        }
    }
}
