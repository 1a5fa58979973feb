//! Line-oriented text encoding.
//!
//! Request: `<method char><node>[ <payload>]\n`
//! Response: `:<status hex> <description>. <payload>`

use crate::error::{Error, Result};
use crate::method::Method;
use crate::uri::UriElements;

/// Builds a text request.
///
/// `line_terminated` appends `\n`; CAN links carry the request in a single
/// ISO-TP message and leave it off.
pub fn build_query(method: Method, uri: &UriElements<'_>, line_terminated: bool) -> Result<String> {
    let node = uri.target_node.as_deref().ok_or(Error::MissingTarget)?;
    let node = if uri.is_root_listing() { "/" } else { node };

    let len = 1
        + node.len()
        + uri.payload.map_or(0, |p| p.len() + 1)
        + usize::from(line_terminated);
    let mut query = String::with_capacity(len);
    query.push(method.text_char(node));
    query.push_str(node);
    if let Some(payload) = uri.payload {
        query.push(' ');
        query.push_str(payload);
    }
    if line_terminated {
        query.push('\n');
    }
    debug_assert_eq!(query.len(), len);
    tracing::trace!(%query, "built text query");
    Ok(query)
}

/// Builds a request from a raw method code, keeping the historical no-op
/// output: unknown codes and missing targets give an empty string.
pub fn build_query_compat(code: u8, uri: &UriElements<'_>, line_terminated: bool) -> String {
    Method::from_code(code)
        .and_then(|m| build_query(m, uri, line_terminated).ok())
        .unwrap_or_default()
}

/// Splits a text response into status code and payload.
///
/// Anything not starting with `:` is not a response. The payload begins after
/// the first `". "` following the status and is absent if there is none.
pub fn parse_response(raw: &str) -> (Option<u8>, Option<&str>) {
    let Some(rest) = raw.strip_prefix(':') else {
        return (None, None);
    };
    let digits = rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_hexdigit())
        .map_or(rest.len(), |(i, _)| i);
    let status = if digits == 0 {
        None
    } else {
        // more than two digits saturates out of range and is rejected
        u8::from_str_radix(&rest[..digits], 16).ok()
    };
    let payload = rest.find(". ").map(|i| &rest[i + 2..]);
    (status, payload)
}

/// Status byte of a text response, if it has one.
pub fn response_status(raw: &str) -> Option<u8> {
    parse_response(raw).0
}
