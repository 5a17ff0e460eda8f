//! # Control Message Packets
//!
//! This module defines the envelope every node exchanges (a Control Message
//! Packet, CMP) and its text codec.
//!
//! ## Protocol Types
//!
//! | Wire tag | Payload type | Handler module |
//! |----------|--------------|----------------|
//! | `TRACEROUTE` | [`TraceroutePayload`] | `traceroute` |
//! | `FTP` | [`FtpPayload`] | `ftp` |
//! | `PING` | [`PingPayload`] | `ping` |
//! | `SND_MSG` | [`SendMessagePayload`] | `send_message` |
//! | `TOR` | [`TorPayload`] | `tor` |
//! | `ADVERTISE` | [`AdvertisePayload`] | `advertise` |
//! | `CLOCKSYNC` | [`ClockSyncPayload`] | `clocksync` |
//!
//! ## Wire Format
//!
//! Envelopes travel as JSON objects. Binary fields (FTP bodies, onion blobs,
//! wrapped keys) are base64 strings. Decoding validates on construction: a
//! known tag with a payload that does not fit its schema is rejected, while an
//! unknown tag is preserved as [`Payload::Unrecognized`] so the dispatcher can
//! report it instead of failing the codec.
//!
//! ## Immutability
//!
//! Handlers take envelopes by value and return fresh ones. Once an envelope
//! has been handed to the transport it is owned by the transport, so a hop
//! boundary always produces a new value.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::identity::Contact;

/// Value written into the hop-budget field of every rebuilt envelope.
/// The field is carried for the transport; no handler decrements or enforces it.
pub const RESET_HOP_BUDGET: u32 = 0;

/// Largest encoded envelope accepted by [`decode_envelope`] (8 MiB).
/// SECURITY: checked before parsing so a hostile sender cannot force
/// an unbounded allocation.
pub const MAX_ENVELOPE_SIZE: usize = 8 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmpType {
    Traceroute,
    Ftp,
    Ping,
    SendMessage,
    Tor,
    Advertise,
    ClockSync,
}

impl CmpType {
    pub const ALL: [CmpType; 7] = [
        CmpType::Traceroute,
        CmpType::Ftp,
        CmpType::Ping,
        CmpType::SendMessage,
        CmpType::Tor,
        CmpType::Advertise,
        CmpType::ClockSync,
    ];

    pub fn as_tag(&self) -> &'static str {
        match self {
            CmpType::Traceroute => "TRACEROUTE",
            CmpType::Ftp => "FTP",
            CmpType::Ping => "PING",
            CmpType::SendMessage => "SND_MSG",
            CmpType::Tor => "TOR",
            CmpType::Advertise => "ADVERTISE",
            CmpType::ClockSync => "CLOCKSYNC",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_tag() == tag)
    }
}

impl std::fmt::Display for CmpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

// ============================================================================
// Per-protocol payloads
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceroutePayload {
    #[serde(rename = "HOPCOUNT", default)]
    pub hop_count: u32,
    /// Accumulated `"<hop> <host> <delay_ms>\n"` lines.
    #[serde(default)]
    pub data: String,
    /// Logical time (ms) at which the previous hop handled the probe.
    #[serde(default)]
    pub last_hop_time: i64,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub failure: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FtpPayload {
    /// Directory on the receiving node the file is written into.
    #[serde(rename = "FPATH")]
    pub fpath: String,
    pub file_name: String,
    /// Declared size of the file body in bytes.
    pub size: u64,
    /// Base64 file body. Present only on the outbound leg.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub unique_id: String,
    #[serde(rename = "SEQ_ID", default)]
    pub seq_id: u64,
    #[serde(default)]
    pub complete: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub message: String,
    /// Declared message length in characters.
    pub size: usize,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub failure: bool,
}

/// Key material for one onion layer, each value RSA-wrapped then base64-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encryption {
    pub key: String,
    pub iv: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TorPayload {
    /// Base64 AES-128-CBC ciphertext of this layer.
    #[serde(rename = "TOR")]
    pub blob: String,
    /// Travels as the envelope-level `encryption` field on the wire.
    #[serde(skip)]
    pub encryption: Option<Encryption>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvertisePayload {
    /// Subscription id.
    pub unique_id: String,
    /// Fixed, ordered member list the advertisement must cover.
    pub node_list: Vec<String>,
    #[serde(default)]
    pub visited: Vec<String>,
    #[serde(default)]
    pub prev: Option<String>,
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub complete: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockSyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_time: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Traceroute(TraceroutePayload),
    Ftp(FtpPayload),
    Ping(PingPayload),
    SendMessage(SendMessagePayload),
    Tor(TorPayload),
    Advertise(AdvertisePayload),
    ClockSync(ClockSyncPayload),
    /// A type tag this node does not implement. Kept verbatim.
    Unrecognized { tag: String, body: Value },
}

impl Payload {
    pub fn cmp_type(&self) -> Option<CmpType> {
        match self {
            Payload::Traceroute(_) => Some(CmpType::Traceroute),
            Payload::Ftp(_) => Some(CmpType::Ftp),
            Payload::Ping(_) => Some(CmpType::Ping),
            Payload::SendMessage(_) => Some(CmpType::SendMessage),
            Payload::Tor(_) => Some(CmpType::Tor),
            Payload::Advertise(_) => Some(CmpType::Advertise),
            Payload::ClockSync(_) => Some(CmpType::ClockSync),
            Payload::Unrecognized { .. } => None,
        }
    }

    pub fn type_tag(&self) -> &str {
        match self {
            Payload::Unrecognized { tag, .. } => tag,
            other => other.cmp_type().map(|t| t.as_tag()).unwrap_or_default(),
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Addressing and timing shared by every protocol.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub source: Contact,
    pub destination: Contact,
    pub hop_budget: u32,
    /// Sender's logical clock (seconds) when the exchange started.
    pub time_sent: f64,
}

impl Route {
    pub fn new(source: Contact, destination: Contact, time_sent: f64) -> Self {
        Self {
            source,
            destination,
            hop_budget: RESET_HOP_BUDGET,
            time_sent,
        }
    }

    #[inline]
    pub fn is_addressed_to(&self, name: &str) -> bool {
        self.destination.is(name)
    }

    /// A route from `here` back to this route's source.
    pub fn back_to_source(&self, here: &Contact, time_sent: f64) -> Route {
        Route::new(here.clone(), self.source.clone(), time_sent)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct Envelope {
    pub route: Route,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(route: Route, payload: Payload) -> Self {
        Self { route, payload }
    }

    #[inline]
    pub fn cmp_type(&self) -> Option<CmpType> {
        self.payload.cmp_type()
    }

    #[inline]
    pub fn source_name(&self) -> &str {
        &self.route.source.name
    }

    #[inline]
    pub fn destination_name(&self) -> &str {
        &self.route.destination.name
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let route = &self.route;
        let mut s = serializer.serialize_struct("Envelope", 9)?;
        s.serialize_field("source_name", &route.source.name)?;
        s.serialize_field("source_ip", &route.source.addr)?;
        s.serialize_field("destination_name", &route.destination.name)?;
        s.serialize_field("destination_ip", &route.destination.addr)?;
        s.serialize_field("ttl", &route.hop_budget)?;
        s.serialize_field("type", self.payload.type_tag())?;
        match &self.payload {
            Payload::Traceroute(p) => s.serialize_field("payload", p)?,
            Payload::Ftp(p) => s.serialize_field("payload", p)?,
            Payload::Ping(p) => s.serialize_field("payload", p)?,
            Payload::SendMessage(p) => s.serialize_field("payload", p)?,
            Payload::Tor(p) => s.serialize_field("payload", p)?,
            Payload::Advertise(p) => s.serialize_field("payload", p)?,
            Payload::ClockSync(p) => s.serialize_field("payload", p)?,
            Payload::Unrecognized { body, .. } => s.serialize_field("payload", body)?,
        }
        s.serialize_field("time_sent", &route.time_sent)?;
        match &self.payload {
            Payload::Tor(TorPayload { encryption: Some(enc), .. }) => {
                s.serialize_field("encryption", enc)?
            }
            _ => s.skip_field("encryption")?,
        }
        s.end()
    }
}

/// Loosely-typed wire shape; [`Envelope`] is validated out of it.
#[derive(Deserialize)]
struct WireEnvelope {
    source_name: String,
    #[serde(default)]
    source_ip: Option<String>,
    destination_name: String,
    #[serde(default)]
    destination_ip: Option<String>,
    #[serde(default)]
    ttl: u32,
    #[serde(rename = "type")]
    cmp_type: String,
    #[serde(default)]
    payload: Value,
    time_sent: f64,
    #[serde(default)]
    encryption: Option<Encryption>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = DecodeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        fn typed<T: serde::de::DeserializeOwned>(tag: &str, body: Value) -> Result<T, DecodeError> {
            serde_json::from_value(body).map_err(|e| DecodeError::InvalidPayload {
                tag: tag.to_string(),
                reason: e.to_string(),
            })
        }

        let tag = wire.cmp_type;
        let body = wire.payload;
        let payload = match CmpType::from_tag(&tag) {
            Some(CmpType::Traceroute) => Payload::Traceroute(typed(&tag, body)?),
            Some(CmpType::Ftp) => Payload::Ftp(typed(&tag, body)?),
            Some(CmpType::Ping) => Payload::Ping(typed(&tag, body)?),
            Some(CmpType::SendMessage) => Payload::SendMessage(typed(&tag, body)?),
            Some(CmpType::Tor) => {
                let mut tor: TorPayload = typed(&tag, body)?;
                tor.encryption = wire.encryption;
                Payload::Tor(tor)
            }
            Some(CmpType::Advertise) => Payload::Advertise(typed(&tag, body)?),
            Some(CmpType::ClockSync) => Payload::ClockSync(typed(&tag, body)?),
            None => Payload::Unrecognized { tag, body },
        };

        Ok(Envelope {
            route: Route {
                source: Contact {
                    name: wire.source_name,
                    addr: wire.source_ip,
                },
                destination: Contact {
                    name: wire.destination_name,
                    addr: wire.destination_ip,
                },
                hop_budget: wire.ttl,
                time_sent: wire.time_sent,
            },
            payload,
        })
    }
}

// ============================================================================
// Codec
// ============================================================================

#[derive(Debug)]
pub enum DecodeError {
    /// Encoded envelope is larger than the configured limit.
    TooLarge { len: usize, limit: usize },
    /// A known type tag whose payload does not match its schema.
    InvalidPayload { tag: String, reason: String },
    /// Not JSON, or missing envelope-level fields.
    Json(serde_json::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::TooLarge { len, limit } => {
                write!(f, "envelope of {} bytes exceeds limit of {}", len, limit)
            }
            DecodeError::InvalidPayload { tag, reason } => {
                write!(f, "invalid {} payload: {}", tag, reason)
            }
            DecodeError::Json(e) => write!(f, "malformed envelope: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

pub fn encode_envelope(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Decode with the default [`MAX_ENVELOPE_SIZE`] bound.
pub fn decode_envelope(text: &str) -> Result<Envelope, DecodeError> {
    decode_envelope_bounded(text, MAX_ENVELOPE_SIZE)
}

pub fn decode_envelope_bounded(text: &str, limit: usize) -> Result<Envelope, DecodeError> {
    if text.len() > limit {
        return Err(DecodeError::TooLarge {
            len: text.len(),
            limit,
        });
    }
    serde_json::from_str(text).map_err(DecodeError::Json)
}

pub fn encode_blob(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a base64 field. Embedded line breaks are tolerated since older
/// encoders wrap at 60 columns.
pub fn decode_blob(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if text.contains(['\n', '\r']) {
        let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        return BASE64.decode(compact);
    }
    BASE64.decode(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Route {
        Route::new(Contact::new("A", "10.0.0.1"), Contact::new("C", "10.0.0.3"), 12.5)
    }

    #[test]
    fn every_tag_maps_back_to_its_type() {
        for cmp_type in CmpType::ALL {
            assert_eq!(CmpType::from_tag(cmp_type.as_tag()), Some(cmp_type));
        }
        assert_eq!(CmpType::from_tag("GOSSIP"), None);
        assert_eq!(CmpType::SendMessage.to_string(), "SND_MSG");
    }

    #[test]
    fn wire_keys_follow_protocol_names() {
        let envelope = Envelope::new(
            route(),
            Payload::Traceroute(TraceroutePayload {
                hop_count: 2,
                data: "1 B 4\n".into(),
                last_hop_time: 12_500,
                ..Default::default()
            }),
        );

        let value: Value = serde_json::from_str(&encode_envelope(&envelope).unwrap()).unwrap();
        assert_eq!(value["type"], "TRACEROUTE");
        assert_eq!(value["source_name"], "A");
        assert_eq!(value["destination_ip"], "10.0.0.3");
        assert_eq!(value["ttl"], 0);
        assert_eq!(value["payload"]["HOPCOUNT"], 2);
        assert_eq!(value["payload"]["last_hop_time"], 12_500);
        assert!(value.get("encryption").is_none());
    }

    #[test]
    fn tor_encryption_travels_at_envelope_level() {
        let envelope = Envelope::new(
            route(),
            Payload::Tor(TorPayload {
                blob: "AAAA".into(),
                encryption: Some(Encryption {
                    key: "a2V5".into(),
                    iv: "aXY=".into(),
                }),
            }),
        );

        let text = encode_envelope(&envelope).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["payload"]["TOR"], "AAAA");
        assert_eq!(value["encryption"]["key"], "a2V5");

        assert_eq!(decode_envelope(&text).unwrap(), envelope);
    }

    #[test]
    fn unknown_type_is_preserved_not_rejected() {
        let text = r#"{"source_name":"A","destination_name":"B","type":"GOSSIP",
                      "payload":{"x":1},"time_sent":0.0}"#;
        let envelope = decode_envelope(text).unwrap();

        assert_eq!(envelope.cmp_type(), None);
        assert_eq!(envelope.payload.type_tag(), "GOSSIP");
        match envelope.payload {
            Payload::Unrecognized { body, .. } => assert_eq!(body["x"], 1),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn known_type_with_wrong_schema_is_rejected() {
        let text = r#"{"source_name":"A","destination_name":"B","type":"PING",
                      "payload":{"SEQ_ID":"one"},"time_sent":0.0}"#;
        let err = decode_envelope(text).unwrap_err();
        assert!(err.to_string().contains("PING"), "got {}", err);
    }

    #[test]
    fn oversized_input_rejected_before_parsing() {
        let err = decode_envelope_bounded(&"x".repeat(64), 16).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge { len: 64, limit: 16 }));
    }

    #[test]
    fn ftp_body_omitted_once_cleared() {
        let envelope = Envelope::new(
            route(),
            Payload::Ftp(FtpPayload {
                fpath: "/tmp".into(),
                file_name: "f.bin".into(),
                size: 3,
                data: None,
                complete: true,
                ..Default::default()
            }),
        );
        let value: Value = serde_json::from_str(&encode_envelope(&envelope).unwrap()).unwrap();
        assert!(value["payload"].get("data").is_none());
        assert_eq!(value["payload"]["complete"], true);
    }

    #[test]
    fn blob_decoding_tolerates_wrapped_lines() {
        let encoded = encode_blob(&[7u8; 80]);
        let wrapped = format!("{}\n{}\n", &encoded[..60], &encoded[60..]);
        assert_eq!(decode_blob(&wrapped).unwrap(), vec![7u8; 80]);
        assert!(decode_blob("not base64!").is_err());
    }

    #[test]
    fn reply_route_points_back_at_source() {
        let here = Contact::new("C", "10.0.0.3");
        let back = route().back_to_source(&here, 12.5);
        assert_eq!(back.source, here);
        assert_eq!(back.destination.name, "A");
        assert_eq!(back.time_sent, 12.5);
        assert_eq!(back.hop_budget, RESET_HOP_BUDGET);
    }
}
