/// Request method codes (same numbering as CoAP).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    Get = 0x01,
    Post = 0x02,
    Delete = 0x04,
    /// iPATCH in CoAP terms
    Patch = 0x07,
}

/// FETCH is part of the code space but not issued by this gateway.
pub const FETCH_CODE: u8 = 0x05;

/// Code of an unsolicited publication message.
pub const PUBMSG_CODE: u8 = 0x1F;

impl Method {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Method::Get),
            0x02 => Some(Method::Post),
            0x04 => Some(Method::Delete),
            0x07 => Some(Method::Patch),
            _ => None,
        }
    }

    /// Maps an HTTP method name; anything unrecognized becomes GET.
    pub fn from_http(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "POST" => Method::Post,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            _ => Method::Get,
        }
    }

    /// Lead character of a text-mode request for this method.
    ///
    /// POST is ambiguous on the wire: it either executes a function or
    /// creates an element, depending on the addressed node.
    pub fn text_char(self, node: &str) -> char {
        match self {
            Method::Get => '?',
            Method::Patch => '=',
            Method::Delete => '-',
            Method::Post if is_exec_node(node) => '!',
            Method::Post => '+',
        }
    }
}

/// Nodes whose POST means "execute" rather than "create".
pub fn is_exec_node(node: &str) -> bool {
    ["auth", "exec", "dfu"].iter().any(|k| node.contains(k))
}
