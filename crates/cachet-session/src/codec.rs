//! Session state serialization.
//!
//! Codecs only ever produce the closed [`SessionValue`] shapes. Opaque
//! application values pass through as bytes, and only under type tags named
//! on the [`TypeAllowList`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use cachet_types::{CodecError, ConfigError, SessionState, SessionValue};
use serde::{Deserialize, Serialize};

/// Format version written as the first byte (TLV) or `v` field (JSON).
const FORMAT_VERSION: u8 = 1;

/// Nesting limit for lists and maps.
const MAX_DEPTH: usize = 64;

/// Converts session state to and from stored bytes.
pub trait SessionCodec: Send + Sync {
    fn name(&self) -> &str;

    /// Encode `state`, or the null marker for `None`.
    fn encode(&self, state: Option<&SessionState>) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes written by [`SessionCodec::encode`].
    fn decode(&self, bytes: &[u8]) -> Result<Option<SessionState>, CodecError>;

    /// The encoding of "no state". Must never fail.
    fn null_marker(&self) -> Vec<u8>;
}

/// Type tags that may travel inside [`SessionValue::Opaque`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeAllowList {
    tags: BTreeSet<String>,
}

impl TypeAllowList {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn permits(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Reject any opaque value in `state` whose tag is not listed.
    pub fn check_state(&self, state: &SessionState) -> Result<(), CodecError> {
        state
            .items
            .values()
            .try_for_each(|value| self.check_value(value, 0))
    }

    fn check_value(&self, value: &SessionValue, depth: usize) -> Result<(), CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::Malformed(format!(
                "nesting deeper than {MAX_DEPTH}"
            )));
        }
        match value {
            SessionValue::Opaque { type_tag, .. } if !self.permits(type_tag) => {
                Err(CodecError::DisallowedType(type_tag.clone()))
            }
            SessionValue::List(items) => items
                .iter()
                .try_for_each(|v| self.check_value(v, depth + 1)),
            SessionValue::Map(entries) => entries
                .values()
                .try_for_each(|v| self.check_value(v, depth + 1)),
            _ => Ok(()),
        }
    }
}

// --- TLV ---

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_MAP: u8 = 0x07;
const TAG_OPAQUE: u8 = 0x08;

const ABSENT: u8 = 0;
const PRESENT: u8 = 1;

/// Tagged-length-value binary codec.
///
/// ```text
/// version:u8 presence:u8 [items deleted]
/// items   = count:u32 (key:str value)*
/// deleted = count:u32 key:str*
/// str     = len:u32 utf8
/// value   = tag:u8 payload
/// ```
///
/// Integers are big-endian; floats are IEEE-754 bits.
#[derive(Debug, Clone, Default)]
pub struct TlvCodec {
    allowed: TypeAllowList,
}

impl TlvCodec {
    pub fn new(allowed: TypeAllowList) -> Self {
        Self { allowed }
    }
}

impl SessionCodec for TlvCodec {
    fn name(&self) -> &str {
        "tlv"
    }

    fn encode(&self, state: Option<&SessionState>) -> Result<Vec<u8>, CodecError> {
        let Some(state) = state else {
            return Ok(self.null_marker());
        };
        self.allowed.check_state(state)?;

        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u8(PRESENT);
        put_len(&mut buf, state.items.len())?;
        for (key, value) in &state.items {
            put_str(&mut buf, key)?;
            put_value(&mut buf, value)?;
        }
        put_len(&mut buf, state.deleted.len())?;
        for key in &state.deleted {
            put_str(&mut buf, key)?;
        }
        Ok(buf.to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Option<SessionState>, CodecError> {
        let mut buf = bytes;
        need(&buf, 2)?;
        let version = buf.get_u8();
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let state = match buf.get_u8() {
            ABSENT => None,
            PRESENT => {
                let mut state = SessionState::new();
                for _ in 0..get_len(&mut buf)? {
                    let key = get_str(&mut buf)?;
                    let value = get_value(&mut buf, &self.allowed, 0)?;
                    state.items.insert(key, value);
                }
                for _ in 0..get_len(&mut buf)? {
                    state.deleted.insert(get_str(&mut buf)?);
                }
                Some(state)
            }
            other => {
                return Err(CodecError::Malformed(format!(
                    "invalid presence byte {other}"
                )));
            }
        };
        if buf.has_remaining() {
            return Err(CodecError::Malformed(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }
        Ok(state)
    }

    fn null_marker(&self) -> Vec<u8> {
        vec![FORMAT_VERSION, ABSENT]
    }
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), CodecError> {
    let len = u32::try_from(len).map_err(|_| CodecError::TooLarge(len))?;
    buf.put_u32(len);
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    put_bytes(buf, s.as_bytes())
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) -> Result<(), CodecError> {
    put_len(buf, bytes.len())?;
    buf.put_slice(bytes);
    Ok(())
}

fn put_value(buf: &mut BytesMut, value: &SessionValue) -> Result<(), CodecError> {
    match value {
        SessionValue::Null => buf.put_u8(TAG_NULL),
        SessionValue::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*b));
        }
        SessionValue::Int(n) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*n);
        }
        SessionValue::Float(f) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_f64(*f);
        }
        SessionValue::Text(s) => {
            buf.put_u8(TAG_TEXT);
            put_str(buf, s)?;
        }
        SessionValue::Bytes(bytes) => {
            buf.put_u8(TAG_BYTES);
            put_bytes(buf, bytes)?;
        }
        SessionValue::List(items) => {
            buf.put_u8(TAG_LIST);
            put_len(buf, items.len())?;
            for item in items {
                put_value(buf, item)?;
            }
        }
        SessionValue::Map(entries) => {
            buf.put_u8(TAG_MAP);
            put_len(buf, entries.len())?;
            for (key, item) in entries {
                put_str(buf, key)?;
                put_value(buf, item)?;
            }
        }
        SessionValue::Opaque { type_tag, bytes } => {
            buf.put_u8(TAG_OPAQUE);
            put_str(buf, type_tag)?;
            put_bytes(buf, bytes)?;
        }
    }
    Ok(())
}

fn need(buf: &&[u8], needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn get_len(buf: &mut &[u8]) -> Result<usize, CodecError> {
    need(buf, 4)?;
    Ok(buf.get_u32() as usize)
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = get_len(buf)?;
    need(buf, len)?;
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn get_str(buf: &mut &[u8]) -> Result<String, CodecError> {
    String::from_utf8(get_bytes(buf)?)
        .map_err(|e| CodecError::Malformed(format!("invalid UTF-8: {e}")))
}

fn get_value(
    buf: &mut &[u8],
    allowed: &TypeAllowList,
    depth: usize,
) -> Result<SessionValue, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::Malformed(format!(
            "nesting deeper than {MAX_DEPTH}"
        )));
    }
    need(buf, 1)?;
    let value = match buf.get_u8() {
        TAG_NULL => SessionValue::Null,
        TAG_BOOL => {
            need(buf, 1)?;
            match buf.get_u8() {
                0 => SessionValue::Bool(false),
                1 => SessionValue::Bool(true),
                other => {
                    return Err(CodecError::Malformed(format!("invalid bool byte {other}")));
                }
            }
        }
        TAG_INT => {
            need(buf, 8)?;
            SessionValue::Int(buf.get_i64())
        }
        TAG_FLOAT => {
            need(buf, 8)?;
            SessionValue::Float(buf.get_f64())
        }
        TAG_TEXT => SessionValue::Text(get_str(buf)?),
        TAG_BYTES => SessionValue::Bytes(get_bytes(buf)?),
        TAG_LIST => {
            let count = get_len(buf)?;
            // Each element is at least one byte; don't trust the count for allocation
            let mut items = Vec::with_capacity(count.min(buf.remaining()));
            for _ in 0..count {
                items.push(get_value(buf, allowed, depth + 1)?);
            }
            SessionValue::List(items)
        }
        TAG_MAP => {
            let mut entries = BTreeMap::new();
            for _ in 0..get_len(buf)? {
                let key = get_str(buf)?;
                entries.insert(key, get_value(buf, allowed, depth + 1)?);
            }
            SessionValue::Map(entries)
        }
        TAG_OPAQUE => {
            let type_tag = get_str(buf)?;
            if !allowed.permits(&type_tag) {
                return Err(CodecError::DisallowedType(type_tag));
            }
            SessionValue::Opaque {
                type_tag,
                bytes: get_bytes(buf)?,
            }
        }
        other => return Err(CodecError::UnknownTag(other)),
    };
    Ok(value)
}

// --- JSON ---

#[derive(Serialize)]
struct JsonEnvelopeRef<'a> {
    v: u8,
    state: Option<&'a SessionState>,
}

#[derive(Deserialize)]
struct JsonEnvelope {
    v: u8,
    state: Option<SessionState>,
}

/// JSON codec. Readable in `redis-cli`, larger than TLV.
///
/// Floats must be finite: JSON has no spelling for NaN or infinity.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    allowed: TypeAllowList,
}

impl JsonCodec {
    pub fn new(allowed: TypeAllowList) -> Self {
        Self { allowed }
    }
}

impl SessionCodec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, state: Option<&SessionState>) -> Result<Vec<u8>, CodecError> {
        if let Some(state) = state {
            self.allowed.check_state(state)?;
            state.items.values().try_for_each(check_finite)?;
        }
        let envelope = JsonEnvelopeRef {
            v: FORMAT_VERSION,
            state,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Option<SessionState>, CodecError> {
        let envelope: JsonEnvelope = serde_json::from_slice(bytes)?;
        if envelope.v != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(envelope.v));
        }
        if let Some(state) = &envelope.state {
            self.allowed.check_state(state)?;
        }
        Ok(envelope.state)
    }

    fn null_marker(&self) -> Vec<u8> {
        format!(r#"{{"v":{FORMAT_VERSION},"state":null}}"#).into_bytes()
    }
}

fn check_finite(value: &SessionValue) -> Result<(), CodecError> {
    match value {
        SessionValue::Float(f) if !f.is_finite() => Err(CodecError::Malformed(format!(
            "non-finite float {f} cannot be stored as JSON"
        ))),
        SessionValue::List(items) => items.iter().try_for_each(check_finite),
        SessionValue::Map(entries) => entries.values().try_for_each(check_finite),
        _ => Ok(()),
    }
}

// --- Registry ---

/// Named codecs, resolved once at startup.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn SessionCodec>>,
}

impl CodecRegistry {
    /// Registry with the built-in `tlv` and `json` codecs.
    pub fn with_builtins(allowed: TypeAllowList) -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
        };
        registry.register("tlv", Arc::new(TlvCodec::new(allowed.clone())));
        registry.register("json", Arc::new(JsonCodec::new(allowed)));
        registry
    }

    /// Add or replace a codec.
    pub fn register(&mut self, name: impl Into<String>, codec: Arc<dyn SessionCodec>) {
        self.codecs.insert(name.into(), codec);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn SessionCodec>, ConfigError> {
        self.codecs
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownCodec {
                name: name.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Encode, falling back to the null marker on failure.
pub fn encode_or_warn(codec: &dyn SessionCodec, state: Option<&SessionState>) -> Vec<u8> {
    match codec.encode(state) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Failed to encode session state with {}: {e}", codec.name());
            codec.null_marker()
        }
    }
}

/// Decode, treating failure as absent state.
pub fn decode_or_warn(codec: &dyn SessionCodec, bytes: &[u8]) -> Option<SessionState> {
    match codec.decode(bytes) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!("Failed to decode session state with {}: {e}", codec.name());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> SessionState {
        let mut state = SessionState::new();
        state.insert("user", "alice");
        state.insert("visits", 42i64);
        state.insert("admin", false);
        state.insert("ratio", SessionValue::Float(0.25));
        state.insert("nothing", SessionValue::Null);
        state.insert("avatar", SessionValue::Bytes(vec![0, 1, 2, 255]));
        state.insert(
            "cart",
            SessionValue::List(vec![
                SessionValue::from("sku-1"),
                SessionValue::Map(BTreeMap::from([
                    ("sku".to_string(), SessionValue::from("sku-2")),
                    ("qty".to_string(), SessionValue::Int(3)),
                ])),
            ]),
        );
        state.insert(
            "prefs",
            SessionValue::Opaque {
                type_tag: "app.Preferences".into(),
                bytes: b"{\"theme\":\"dark\"}".to_vec(),
            },
        );
        state.deleted.insert("coupon".into());
        state
    }

    fn allowed() -> TypeAllowList {
        TypeAllowList::new(["app.Preferences"])
    }

    fn codecs() -> Vec<Box<dyn SessionCodec>> {
        vec![
            Box::new(TlvCodec::new(allowed())),
            Box::new(JsonCodec::new(allowed())),
        ]
    }

    #[test]
    fn full_state_round_trips() {
        let state = sample_state();
        for codec in codecs() {
            let bytes = codec.encode(Some(&state)).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), Some(state.clone()), "{}", codec.name());
        }
    }

    #[test]
    fn inexact_floats_round_trip_bit_for_bit() {
        let values = [
            0.1 + 0.2,
            1.0715660391465826e-75,
            std::f64::consts::PI,
            -2.2250738585072014e-308,
            f64::MAX,
            f64::MIN_POSITIVE,
            5e-324,
            123_456_789.123_456_79,
        ];
        let mut state = SessionState::new();
        for (i, f) in values.iter().enumerate() {
            state.insert(format!("f{i}"), SessionValue::Float(*f));
        }
        state.insert("nested", SessionValue::List(values.map(SessionValue::Float).to_vec()));

        for codec in codecs() {
            let bytes = codec.encode(Some(&state)).unwrap();
            let decoded = codec.decode(&bytes).unwrap().unwrap();
            for (i, f) in values.iter().enumerate() {
                match decoded.get(&format!("f{i}")) {
                    Some(SessionValue::Float(g)) => {
                        assert_eq!(g.to_bits(), f.to_bits(), "{} f{i}", codec.name())
                    }
                    other => panic!("{}: expected float, got {other:?}", codec.name()),
                }
            }
            assert_eq!(decoded, state, "{}", codec.name());
        }
    }

    #[test]
    fn empty_state_is_not_null() {
        for codec in codecs() {
            let bytes = codec.encode(Some(&SessionState::new())).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), Some(SessionState::new()));
        }
    }

    #[test]
    fn null_marker_decodes_to_none() {
        for codec in codecs() {
            let bytes = codec.encode(None).unwrap();
            assert_eq!(bytes, codec.null_marker());
            assert_eq!(codec.decode(&bytes).unwrap(), None, "{}", codec.name());
        }
    }

    #[test]
    fn disallowed_opaque_rejected_on_encode() {
        let mut state = SessionState::new();
        state.insert(
            "nested",
            SessionValue::List(vec![SessionValue::Opaque {
                type_tag: "System.Diagnostics.Process".into(),
                bytes: vec![],
            }]),
        );
        for codec in codecs() {
            assert!(matches!(
                codec.encode(Some(&state)),
                Err(CodecError::DisallowedType(tag)) if tag == "System.Diagnostics.Process"
            ));
        }
    }

    #[test]
    fn disallowed_opaque_rejected_on_decode() {
        let state = sample_state();
        let permissive = TlvCodec::new(allowed());
        let strict = TlvCodec::new(TypeAllowList::default());
        let bytes = permissive.encode(Some(&state)).unwrap();
        assert!(matches!(
            strict.decode(&bytes),
            Err(CodecError::DisallowedType(_))
        ));

        let permissive = JsonCodec::new(allowed());
        let strict = JsonCodec::new(TypeAllowList::default());
        let bytes = permissive.encode(Some(&state)).unwrap();
        assert!(matches!(
            strict.decode(&bytes),
            Err(CodecError::DisallowedType(_))
        ));
    }

    #[test]
    fn tlv_layout() {
        let mut state = SessionState::new();
        state.insert("k", true);
        let bytes = TlvCodec::default().encode(Some(&state)).unwrap();
        assert_eq!(
            bytes,
            vec![
                1, 1, // version, present
                0, 0, 0, 1, // one item
                0, 0, 0, 1, b'k', // key
                TAG_BOOL, 1, // value
                0, 0, 0, 0, // no deletions
            ]
        );
    }

    #[test]
    fn tlv_rejects_bad_input() {
        let codec = TlvCodec::default();
        assert!(matches!(
            codec.decode(&[]),
            Err(CodecError::Truncated { needed: 2, remaining: 0 })
        ));
        assert!(matches!(
            codec.decode(&[9, 1]),
            Err(CodecError::UnsupportedVersion(9))
        ));
        assert!(matches!(codec.decode(&[1, 7]), Err(CodecError::Malformed(_))));
        assert!(matches!(
            codec.decode(&[1, 1, 0, 0, 0, 1, 0, 0, 0, 1, b'k', 0x42]),
            Err(CodecError::UnknownTag(0x42))
        ));
        // Claims a 100-byte key with 1 byte left
        assert!(matches!(
            codec.decode(&[1, 1, 0, 0, 0, 1, 0, 0, 0, 100, b'k']),
            Err(CodecError::Truncated { needed: 100, remaining: 1 })
        ));
        let mut trailing = codec.null_marker();
        trailing.push(0);
        assert!(matches!(codec.decode(&trailing), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn tlv_rejects_deep_nesting() {
        let mut bytes = vec![1, 1, 0, 0, 0, 1, 0, 0, 0, 1, b'k'];
        for _ in 0..=MAX_DEPTH + 1 {
            bytes.extend_from_slice(&[TAG_LIST, 0, 0, 0, 1]);
        }
        bytes.push(TAG_NULL);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            TlvCodec::default().decode(&bytes),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn json_rejects_non_finite_floats() {
        let mut state = SessionState::new();
        state.insert("bad", SessionValue::Float(f64::NAN));
        assert!(matches!(
            JsonCodec::default().encode(Some(&state)),
            Err(CodecError::Malformed(_))
        ));
        // TLV carries the bits unchanged
        let bytes = TlvCodec::default().encode(Some(&state)).unwrap();
        let decoded = TlvCodec::default().decode(&bytes).unwrap().unwrap();
        assert!(matches!(decoded.get("bad"), Some(SessionValue::Float(f)) if f.is_nan()));
    }

    #[test]
    fn json_rejects_wrong_version() {
        assert!(matches!(
            JsonCodec::default().decode(br#"{"v":2,"state":null}"#),
            Err(CodecError::UnsupportedVersion(2))
        ));
        assert!(matches!(
            JsonCodec::default().decode(b"not json"),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn registry_resolves_builtins() {
        let registry = CodecRegistry::with_builtins(TypeAllowList::default());
        assert_eq!(registry.names(), vec!["json", "tlv"]);
        assert_eq!(registry.resolve("tlv").unwrap().name(), "tlv");
        assert_eq!(registry.resolve("json").unwrap().name(), "json");
        assert!(matches!(
            registry.resolve("binaryformatter"),
            Err(ConfigError::UnknownCodec { name }) if name == "binaryformatter"
        ));
    }

    #[test]
    fn registry_accepts_external_codec() {
        let mut registry = CodecRegistry::with_builtins(TypeAllowList::default());
        registry.register("compact", Arc::new(TlvCodec::default()));
        assert!(registry.resolve("compact").is_ok());
    }

    #[test]
    fn helpers_degrade_to_absent() {
        let codec = TlvCodec::default();
        assert_eq!(decode_or_warn(&codec, b"\xff\xff"), None);

        let mut state = SessionState::new();
        state.insert(
            "x",
            SessionValue::Opaque {
                type_tag: "unlisted".into(),
                bytes: vec![],
            },
        );
        assert_eq!(encode_or_warn(&codec, Some(&state)), codec.null_marker());
        assert_eq!(
            decode_or_warn(&codec, &encode_or_warn(&codec, Some(&sample_plain()))),
            Some(sample_plain())
        );
    }

    fn sample_plain() -> SessionState {
        let mut state = SessionState::new();
        state.insert("a", 1i64);
        state
    }
}
