//! Shared protocol constants for the GETFILE front end and the cache IPC

// GETFILE header constants
pub const SCHEME: &str = "GETFILE";
pub const METHOD_GET: &str = "GET";
pub const HEADER_END: &[u8; 4] = b"\r\n\r\n";

// Maximum request header size - a client that sends more without a terminator is INVALID
pub const MAX_REQUEST_HEADER: usize = 4096;

// Maximum request path length accepted from clients; keeps every control
// message well under the queue's message size
pub const MAX_PATH_LEN: usize = 256;

// Control channel defaults (shared by gfproxy and gfcached)
pub mod control {
    // Well-known queue name; producer creates it, consumers open it
    pub const QUEUE_NAME: &str = "/proxy_cache_requests";

    // Maximum encoded message size in bytes
    pub const MAX_MSG_SIZE: usize = 4096;

    // Maximum number of queued, undelivered messages
    pub const MAX_MSG_NUM: usize = 10;

    // Every message starts with this tag: "Request: <id> <region_size> <path>"
    pub const TAG: &str = "Request:";
}

// Shared segment defaults
pub mod segment {
    // Segment i is the shared memory object "<PREFIX><i>"
    pub const PREFIX: &str = "/proxy_cache_";

    // file_size value written by the daemon when the path does not resolve
    pub const NOT_FOUND: i64 = -1;
}

// Socket timeouts for the GETFILE front end
pub mod timeouts {
    // A client has this long to deliver its request header (ms)
    pub const REQUEST_READ_MS: u64 = 30_000;

    // Connection establishment timeout for the client helper (ms)
    pub const CONNECT_MS: u64 = 2_000;
}

/// GETFILE response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfStatus {
    Ok,
    FileNotFound,
    Error,
    Invalid,
}

impl GfStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GfStatus::Ok => "OK",
            GfStatus::FileNotFound => "FILE_NOT_FOUND",
            GfStatus::Error => "ERROR",
            GfStatus::Invalid => "INVALID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OK" => Some(GfStatus::Ok),
            "FILE_NOT_FOUND" => Some(GfStatus::FileNotFound),
            "ERROR" => Some(GfStatus::Error),
            "INVALID" => Some(GfStatus::Invalid),
            _ => None,
        }
    }
}

impl std::fmt::Display for GfStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build a response header. Only OK carries a length.
pub fn response_header(status: GfStatus, len: u64) -> String {
    match status {
        GfStatus::Ok => format!("{} {} {}\r\n\r\n", SCHEME, status, len),
        _ => format!("{} {}\r\n\r\n", SCHEME, status),
    }
}

/// Build a request header for `path`.
pub fn request_header(path: &str) -> String {
    format!("{} {} {}\r\n\r\n", SCHEME, METHOD_GET, path)
}

/// Parse a request header (terminator included or not).
/// Returns the requested path, or None when the request is INVALID.
pub fn parse_request(header: &str) -> Option<&str> {
    let line = header.strip_suffix("\r\n\r\n").unwrap_or(header);
    let mut parts = line.split(' ');
    if parts.next()? != SCHEME || parts.next()? != METHOD_GET {
        return None;
    }
    let path = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if !path.starts_with('/') || path.len() > MAX_PATH_LEN {
        return None;
    }
    if path.chars().any(|c| c.is_whitespace() || c == '\0') {
        return None;
    }
    Some(path)
}

/// Parse a response header. Returns the status and declared length (0 for non-OK).
pub fn parse_response(header: &str) -> Option<(GfStatus, u64)> {
    let line = header.strip_suffix("\r\n\r\n").unwrap_or(header);
    let mut parts = line.split_whitespace();
    if parts.next()? != SCHEME {
        return None;
    }
    let status = GfStatus::parse(parts.next()?)?;
    let len = match status {
        GfStatus::Ok => parts.next()?.parse().ok()?,
        _ => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((status, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parsing_accepts_plain_paths() {
        assert_eq!(parse_request("GETFILE GET /a/b.txt\r\n\r\n"), Some("/a/b.txt"));
        assert_eq!(parse_request(&request_header("/x")), Some("/x"));
    }

    #[test]
    fn request_parsing_rejects_malformed_headers() {
        assert_eq!(parse_request("GETFILE PUT /a\r\n\r\n"), None);
        assert_eq!(parse_request("GETFILE GET a.txt\r\n\r\n"), None);
        assert_eq!(parse_request("GETFILE GET /a b\r\n\r\n"), None);
        assert_eq!(parse_request("HTTP GET /a\r\n\r\n"), None);
        assert_eq!(parse_request("GETFILE GET\r\n\r\n"), None);
        let long = format!("GETFILE GET /{}\r\n\r\n", "x".repeat(MAX_PATH_LEN));
        assert_eq!(parse_request(&long), None);
    }

    #[test]
    fn response_headers() {
        assert_eq!(response_header(GfStatus::Ok, 25), "GETFILE OK 25\r\n\r\n");
        assert_eq!(
            response_header(GfStatus::FileNotFound, 99),
            "GETFILE FILE_NOT_FOUND\r\n\r\n"
        );
        assert_eq!(parse_response("GETFILE OK 0\r\n\r\n"), Some((GfStatus::Ok, 0)));
        assert_eq!(
            parse_response("GETFILE INVALID\r\n\r\n"),
            Some((GfStatus::Invalid, 0))
        );
        assert_eq!(parse_response("GETFILE OK\r\n\r\n"), None);
        assert_eq!(parse_response("GETFILE MAYBE\r\n\r\n"), None);
    }
}
