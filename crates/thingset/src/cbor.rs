//! Binary (CBOR) encoding.
//!
//! Request: `<method byte><CBOR text node>[<CBOR payload>]`
//! Response: `<status byte>[<CBOR payload>]`
//!
//! Payloads cross the gateway as JSON text and are transcoded at this
//! boundary in both directions.

use base64::Engine;
use minicbor::data::Type;
use minicbor::encode::{self, Write};
use minicbor::{Decoder, Encoder};
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};
use crate::method::Method;
use crate::uri::UriElements;

const GROW_STEP: usize = 128;
const MAX_DEPTH: usize = 32;

/// Allocation failed while growing a [`QueryBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

/// Output buffer sized from a JSON length estimate.
///
/// Doubles take nine bytes in CBOR regardless of their JSON spelling, so the
/// estimate can come up short. Writes that do not fit grow the buffer in
/// place, keeping everything already written.
#[derive(Debug)]
pub struct QueryBuffer {
    buf: Vec<u8>,
}

impl QueryBuffer {
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity).map_err(|_| Error::OutOfMemory)?;
        Ok(Self { buf })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for QueryBuffer {
    type Error = Exhausted;

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), Exhausted> {
        let free = self.buf.capacity() - self.buf.len();
        if bytes.len() > free {
            let grow = bytes.len().max(free + GROW_STEP);
            self.buf.try_reserve_exact(grow).map_err(|_| Exhausted)?;
            tracing::trace!(capacity = self.buf.capacity(), "grew query buffer");
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}

fn exhausted<E>(_: encode::Error<E>) -> Error {
    Error::OutOfMemory
}

/// Builds a binary request. The payload, if any, must be valid JSON.
pub fn build_query(method: Method, uri: &UriElements<'_>) -> Result<Vec<u8>> {
    let node = uri.target_node.as_deref().ok_or(Error::MissingTarget)?;
    let node = if uri.is_root_listing() { "/" } else { node };
    let payload = uri.payload.map(serde_json::from_str::<Value>).transpose()?;

    // method byte, string header, node, and JSON length as a CBOR estimate
    let estimate = 1 + 1 + node.len() + uri.payload.map_or(0, str::len);
    let mut buf = QueryBuffer::with_capacity(estimate)?;
    buf.write_all(&[method.code()]).map_err(|_| Error::OutOfMemory)?;

    let mut e = Encoder::new(buf);
    e.str(node).map_err(exhausted)?;
    if let Some(value) = &payload {
        encode_json(&mut e, value).map_err(exhausted)?;
    }
    let query = e.into_writer().into_inner();
    tracing::trace!(len = query.len(), estimate, "built binary query");
    Ok(query)
}

/// Builds a request from a raw method code. Unknown codes give the single
/// zero byte older callers expect.
pub fn build_query_compat(code: u8, uri: &UriElements<'_>) -> Result<Vec<u8>> {
    match Method::from_code(code) {
        Some(method) => build_query(method, uri),
        None => Ok(vec![0]),
    }
}

/// Transcodes a JSON document to CBOR.
pub fn json_to_cbor(json: &str) -> Result<Vec<u8>> {
    let value: Value = serde_json::from_str(json)?;
    let mut e = Encoder::new(QueryBuffer::with_capacity(json.len())?);
    encode_json(&mut e, &value).map_err(exhausted)?;
    Ok(e.into_writer().into_inner())
}

fn encode_json<W: Write>(e: &mut Encoder<W>, value: &Value) -> Result<(), encode::Error<W::Error>> {
    match value {
        Value::Null => {
            e.null()?;
        }
        Value::Bool(b) => {
            e.bool(*b)?;
        }
        Value::String(s) => {
            e.str(s)?;
        }
        Value::Number(n) => encode_number(e, n)?,
        Value::Array(items) => {
            e.array(items.len() as u64)?;
            for item in items {
                encode_json(e, item)?;
            }
        }
        Value::Object(members) => {
            e.map(members.len() as u64)?;
            for (key, item) in members {
                e.str(key)?;
                encode_json(e, item)?;
            }
        }
    }
    Ok(())
}

// Integral values go out as CBOR integers, everything else as a double.
fn encode_number<W: Write>(e: &mut Encoder<W>, n: &Number) -> Result<(), encode::Error<W::Error>> {
    if let Some(i) = n.as_i64() {
        e.i64(i)?;
    } else if let Some(u) = n.as_u64() {
        e.u64(u)?;
    } else {
        let f = n.as_f64().unwrap_or(f64::NAN);
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
            e.i64(f as i64)?;
        } else {
            e.f64(f)?;
        }
    }
    Ok(())
}

/// Transcodes one CBOR data item to compact JSON.
///
/// Byte strings become base64url text, tags are dropped, and undefined,
/// simple values and non-finite floats become `null`. Map keys that are not
/// strings are written as their JSON text.
pub fn decode_payload(cbor: &[u8]) -> Result<String> {
    if cbor.is_empty() {
        return Err(Error::Cbor("empty payload".into()));
    }
    let mut d = Decoder::new(cbor);
    let value = read_value(&mut d, 0)?;
    if d.position() < cbor.len() {
        tracing::debug!(trailing = cbor.len() - d.position(), "ignoring bytes after CBOR item");
    }
    Ok(serde_json::to_string(&value)?)
}

fn read_value(d: &mut Decoder<'_>, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::Cbor("nesting too deep".into()));
    }
    let value = match d.datatype()? {
        Type::Bool => Value::Bool(d.bool()?),
        Type::Null | Type::Undefined => {
            d.skip()?;
            Value::Null
        }
        Type::Simple => {
            d.simple()?;
            Value::Null
        }
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => Value::from(d.u64()?),
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => Value::from(d.i64()?),
        Type::Int => {
            let i = i128::from(d.int()?);
            match i64::try_from(i) {
                Ok(v) => Value::from(v),
                Err(_) => float(i as f64),
            }
        }
        Type::F16 => float(f64::from(d.f16()?)),
        Type::F32 => float(f64::from(d.f32()?)),
        Type::F64 => float(d.f64()?),
        Type::String => Value::String(d.str()?.to_string()),
        Type::StringIndef => {
            let mut s = String::new();
            for chunk in d.str_iter()? {
                s.push_str(chunk?);
            }
            Value::String(s)
        }
        Type::Bytes => Value::String(base64url(d.bytes()?)),
        Type::BytesIndef => {
            let mut bytes = Vec::new();
            for chunk in d.bytes_iter()? {
                bytes.extend_from_slice(chunk?);
            }
            Value::String(base64url(&bytes))
        }
        Type::Array | Type::ArrayIndef => {
            let mut items = Vec::new();
            match d.array()? {
                Some(n) => {
                    for _ in 0..n {
                        items.push(read_value(d, depth + 1)?);
                    }
                }
                None => {
                    while !at_break(d)? {
                        items.push(read_value(d, depth + 1)?);
                    }
                }
            }
            Value::Array(items)
        }
        Type::Map | Type::MapIndef => {
            let mut members = Map::new();
            match d.map()? {
                Some(n) => {
                    for _ in 0..n {
                        let (k, v) = read_member(d, depth)?;
                        members.insert(k, v);
                    }
                }
                None => {
                    while !at_break(d)? {
                        let (k, v) = read_member(d, depth)?;
                        members.insert(k, v);
                    }
                }
            }
            Value::Object(members)
        }
        Type::Tag => {
            d.tag()?;
            read_value(d, depth + 1)?
        }
        other => return Err(Error::Cbor(format!("unexpected {other:?} at {}", d.position()))),
    };
    Ok(value)
}

fn read_member(d: &mut Decoder<'_>, depth: usize) -> Result<(String, Value)> {
    let key = match read_value(d, depth + 1)? {
        Value::String(s) => s,
        other => other.to_string(),
    };
    Ok((key, read_value(d, depth + 1)?))
}

fn at_break(d: &mut Decoder<'_>) -> Result<bool> {
    if matches!(d.datatype()?, Type::Break) {
        d.set_position(d.position() + 1);
        return Ok(true);
    }
    Ok(false)
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

fn base64url(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Status byte of a binary response.
pub fn response_status(block: &[u8]) -> Option<u8> {
    block.first().copied()
}

/// Consumes a binary response block and returns its payload as JSON.
///
/// Read the status with [`response_status`] first; the block is gone after
/// this call. A block without payload bytes gives `None`.
pub fn response_payload(block: Vec<u8>) -> Result<Option<String>> {
    match block.get(1..) {
        Some(payload) if !payload.is_empty() => decode_payload(payload).map(Some),
        _ => Ok(None),
    }
}

/// A decoded binary request, as seen by a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub method: u8,
    pub node: String,
    /// Payload transcoded to JSON.
    pub payload: Option<String>,
}

pub fn parse_request(query: &[u8]) -> Result<Request> {
    let (&method, rest) = query
        .split_first()
        .ok_or_else(|| Error::Cbor("empty request".into()))?;
    let mut d = Decoder::new(rest);
    let node = d.str()?.to_string();
    let payload = match rest.get(d.position()..) {
        Some(tail) if !tail.is_empty() => Some(decode_payload(tail)?),
        _ => None,
    };
    Ok(Request { method, node, payload })
}

/// Builds a binary response from a status and an optional JSON payload.
pub fn encode_response(status: u8, payload: Option<&str>) -> Result<Vec<u8>> {
    let mut block = vec![status];
    if let Some(json) = payload {
        block.extend_from_slice(&json_to_cbor(json)?);
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::{parse_uri, ListSubnodes};

    #[test]
    fn test_post_config_bytes() {
        let uri = UriElements::node("config").with_payload(Some("{\"loadEn\": true}"));
        let query = build_query(Method::Post, &uri).unwrap();
        let mut expected = vec![0x02, 0x66];
        expected.extend_from_slice(b"config");
        expected.extend_from_slice(&[0xA1, 0x66]);
        expected.extend_from_slice(b"loadEn");
        expected.push(0xF5);
        assert_eq!(query, expected);
    }

    #[test]
    fn test_get_without_payload() {
        let query = build_query(Method::Get, &UriElements::node("info")).unwrap();
        assert_eq!(query, [0x01, 0x64, b'i', b'n', b'f', b'o']);
    }

    #[test]
    fn test_root_listing_sends_slash() {
        let uri = UriElements {
            target_node: Some(String::new()),
            list_subnodes: ListSubnodes::Yes,
            ..Default::default()
        };
        assert_eq!(build_query(Method::Get, &uri).unwrap(), [0x01, 0x61, b'/']);
    }

    #[test]
    fn test_invalid_json_fails_whole_query() {
        let uri = UriElements::node("conf").with_payload(Some("{loadEn: true"));
        assert!(matches!(build_query(Method::Patch, &uri), Err(Error::InvalidPayload(_))));
        assert!(matches!(build_query(Method::Get, &parse_uri(None)), Err(Error::MissingTarget)));
    }

    #[test]
    fn test_compat_unknown_method() {
        let uri = UriElements::node("info");
        assert_eq!(build_query_compat(0x05, &uri).unwrap(), vec![0]);
        assert_eq!(build_query_compat(0x04, &uri).unwrap()[0], 0x04);
    }

    #[test]
    fn test_doubles_outgrow_estimate() {
        let json = "[0.1,0.2,0.3,0.4]";
        let uri = UriElements::node("x").with_payload(Some(json));
        let query = build_query(Method::Patch, &uri).unwrap();
        // 1 method + 2 node + 1 array header + 4 * 9 doubles
        assert_eq!(query.len(), 40);
        assert!(query.len() > 1 + 1 + 1 + json.len());
        assert_eq!(query[4], 0xFB);
        assert_eq!(decode_payload(&query[3..]).unwrap(), json);
    }

    #[test]
    fn test_integral_float_is_integer() {
        let query = build_query(Method::Patch, &UriElements::node("x").with_payload(Some("5.0"))).unwrap();
        assert_eq!(&query[3..], [0x05]);
        let query = build_query(Method::Patch, &UriElements::node("x").with_payload(Some("-300"))).unwrap();
        assert_eq!(&query[3..], [0x39, 0x01, 0x2B]);
    }

    #[test]
    fn test_roundtrip_without_floats() {
        let json = r#"{"b":[1,-2,"x",null,true],"a":{"d":300,"e":{}},"c":"z"}"#;
        let uri = UriElements::node("x").with_payload(Some(json));
        let query = build_query(Method::Patch, &uri).unwrap();
        assert_eq!(decode_payload(&query[3..]).unwrap(), json);
    }

    #[test]
    fn test_decode_special_items() {
        // h'0102ff' -> base64url
        assert_eq!(decode_payload(&[0x43, 0x01, 0x02, 0xFF]).unwrap(), "\"AQL_\"");
        // undefined
        assert_eq!(decode_payload(&[0xF7]).unwrap(), "null");
        // tag 1 (epoch time) around 1000
        assert_eq!(decode_payload(&[0xC1, 0x19, 0x03, 0xE8]).unwrap(), "1000");
        // indefinite array [1, 2]
        assert_eq!(decode_payload(&[0x9F, 0x01, 0x02, 0xFF]).unwrap(), "[1,2]");
        // {1: "a"}
        assert_eq!(decode_payload(&[0xA1, 0x01, 0x61, b'a']).unwrap(), "{\"1\":\"a\"}");
        // half-precision 1.5 and NaN
        assert_eq!(decode_payload(&[0xF9, 0x3E, 0x00]).unwrap(), "1.5");
        assert_eq!(decode_payload(&[0xF9, 0x7E, 0x00]).unwrap(), "null");
    }

    #[test]
    fn test_decode_malformed() {
        assert!(decode_payload(&[]).is_err());
        // text string of length 5 with 2 bytes
        assert!(decode_payload(&[0x65, b'a', b'b']).is_err());
        // array of 2 with one item
        assert!(decode_payload(&[0x82, 0x01]).is_err());
        // lone break
        assert!(decode_payload(&[0xFF]).is_err());
    }

    #[test]
    fn test_decode_depth_limit() {
        let mut deep = vec![0x81; MAX_DEPTH + 2];
        deep.push(0x01);
        assert!(matches!(decode_payload(&deep), Err(Error::Cbor(_))));
    }

    #[test]
    fn test_response_status_then_payload() {
        let block = encode_response(0x85, Some("{\"Bat_V\":12}")).unwrap();
        assert_eq!(response_status(&block), Some(0x85));
        assert_eq!(response_payload(block).unwrap().as_deref(), Some("{\"Bat_V\":12}"));

        let block = vec![0x84];
        assert_eq!(response_status(&block), Some(0x84));
        assert_eq!(response_payload(block).unwrap(), None);
        assert_eq!(response_status(&[]), None);
    }

    #[test]
    fn test_parse_request() {
        let uri = UriElements::node("conf").with_payload(Some("{\"a\":1}"));
        let req = parse_request(&build_query(Method::Patch, &uri).unwrap()).unwrap();
        assert_eq!(req.method, 0x07);
        assert_eq!(req.node, "conf");
        assert_eq!(req.payload.as_deref(), Some("{\"a\":1}"));

        let req = parse_request(&[0x01, 0x64, b'i', b'n', b'f', b'o']).unwrap();
        assert_eq!(req.payload, None);
        assert!(parse_request(&[]).is_err());
    }

    #[test]
    fn test_buffer_growth_keeps_bytes() {
        let mut buf = QueryBuffer::with_capacity(2).unwrap();
        buf.write_all(&[1, 2]).unwrap();
        buf.write_all(&[3; 10]).unwrap();
        assert!(buf.capacity() >= 2 + GROW_STEP);
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf.into_inner()[..3], [1, 2, 3]);
    }
}
