use core::fmt;

/// Response status codes (CoAP-like numbering plus ThingSet extensions).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Created = 0x81,
    Deleted = 0x82,
    Valid = 0x83,
    Changed = 0x84,
    Content = 0x85,
    BadRequest = 0xA0,
    Unauthorized = 0xA1,
    Forbidden = 0xA3,
    NotFound = 0xA4,
    MethodNotAllowed = 0xA5,
    RequestIncomplete = 0xA8,
    Conflict = 0xA9,
    RequestTooLarge = 0xAD,
    UnsupportedFormat = 0xAF,
    InternalServerError = 0xC0,
    NotImplemented = 0xC1,
    ResponseTooLarge = 0xE1,
}

impl StatusCode {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        use StatusCode::*;
        Some(match code {
            0x81 => Created,
            0x82 => Deleted,
            0x83 => Valid,
            0x84 => Changed,
            0x85 => Content,
            0xA0 => BadRequest,
            0xA1 => Unauthorized,
            0xA3 => Forbidden,
            0xA4 => NotFound,
            0xA5 => MethodNotAllowed,
            0xA8 => RequestIncomplete,
            0xA9 => Conflict,
            0xAD => RequestTooLarge,
            0xAF => UnsupportedFormat,
            0xC0 => InternalServerError,
            0xC1 => NotImplemented,
            0xE1 => ResponseTooLarge,
            _ => return None,
        })
    }

    pub fn is_success(self) -> bool {
        (0x80..0xA0).contains(&self.code())
    }

    pub fn is_client_error(self) -> bool {
        (0xA0..0xC0).contains(&self.code())
    }

    pub fn is_server_error(self) -> bool {
        self.code() >= 0xC0
    }

    /// Text following the hex code in a text-mode response.
    pub fn description(self) -> &'static str {
        use StatusCode::*;
        match self {
            Created => "Created",
            Deleted => "Deleted",
            Valid => "Valid",
            Changed => "Changed",
            Content => "Content",
            BadRequest => "Bad Request",
            Unauthorized => "Unauthorized",
            Forbidden => "Forbidden",
            NotFound => "Not Found",
            MethodNotAllowed => "Method Not Allowed",
            RequestIncomplete => "Request Entity Incomplete",
            Conflict => "Conflict",
            RequestTooLarge => "Request Entity Too Large",
            UnsupportedFormat => "Unsupported Content-Format",
            InternalServerError => "Internal Server Error",
            NotImplemented => "Not Implemented",
            ResponseTooLarge => "Response Too Large",
        }
    }

    /// HTTP status the route layer answers with.
    pub fn to_http(self) -> u16 {
        use StatusCode::*;
        match self {
            Created => 201,
            Valid | Content => 200,
            Changed | Deleted => 204,
            BadRequest | RequestIncomplete => 400,
            Unauthorized => 401,
            Forbidden => 403,
            NotFound => 404,
            MethodNotAllowed => 405,
            Conflict => 409,
            RequestTooLarge => 413,
            UnsupportedFormat => 415,
            InternalServerError | ResponseTooLarge => 500,
            NotImplemented => 501,
        }
    }
}

/// HTTP translation for a raw status byte; unknown codes map to 500.
pub fn http_status(code: u8) -> u16 {
    StatusCode::from_u8(code).map_or(500, StatusCode::to_http)
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X} {}", self.code(), self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_families() {
        assert!(StatusCode::Content.is_success());
        assert!(StatusCode::NotFound.is_client_error());
        assert!(StatusCode::NotImplemented.is_server_error());
        assert!(StatusCode::ResponseTooLarge.is_server_error());
        assert!(!StatusCode::Changed.is_client_error());
    }

    #[test]
    fn test_http_table() {
        assert_eq!(http_status(0x81), 201);
        assert_eq!(http_status(0x83), 200);
        assert_eq!(http_status(0x85), 200);
        assert_eq!(http_status(0x82), 204);
        assert_eq!(http_status(0x84), 204);
        assert_eq!(http_status(0xA8), 400);
        assert_eq!(http_status(0xA1), 401);
        assert_eq!(http_status(0xA3), 403);
        assert_eq!(http_status(0xA5), 405);
        assert_eq!(http_status(0xA9), 409);
        assert_eq!(http_status(0xAD), 413);
        assert_eq!(http_status(0xAF), 415);
        assert_eq!(http_status(0xC1), 501);
        assert_eq!(http_status(0xE1), 500);
        assert_eq!(http_status(0x42), 500);
    }

    #[test]
    fn test_from_u8_covers_taxonomy() {
        for code in [0x81u8, 0x82, 0x83, 0x84, 0x85, 0xA0, 0xA1, 0xA3, 0xA4, 0xA5, 0xA8, 0xA9, 0xAD, 0xAF, 0xC0, 0xC1, 0xE1] {
            assert_eq!(StatusCode::from_u8(code).map(StatusCode::code), Some(code));
        }
        assert_eq!(StatusCode::from_u8(0xA2), None);
    }
}
