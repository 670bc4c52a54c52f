use base64::{Engine as _, engine::general_purpose::STANDARD as b64};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_PROTOCOL, UPGRADE};
use httparse::Status;
use memchr::memmem::Finder;
use rand::RngCore;
use sha1::{Digest, Sha1};
use smallvec::SmallVec;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_HEADERS: usize = 32;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UpgradeErr {
    #[error("eof during handshake")]
    Eof,
    #[error("oversized handshake")]
    Oversized,
    #[error("non-101 status line ({0})")]
    Status(u16),
    #[error("missing upgrade headers ({0})")]
    Headers(&'static str),
    #[error("bad Sec-WebSocket-Accept")]
    Accept,
    #[error("server selected a sub-protocol that was not requested: {0}")]
    Protocol(String),
    #[error("malformed response: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("header value is not utf-8")]
    Utf8,
    #[error("i/o failure: {0}")]
    Io(std::io::ErrorKind),
}

#[derive(Debug, Clone)]
pub struct ClientKey {
    pub sec_websocket_key: String,
    pub expected_accept: String,
}

/// Outcome of scanning the bytes accumulated so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// No terminator yet; resume scanning at `scan_from` once more bytes arrive.
    NeedMore { scan_from: usize },
    /// A verified 101 response. Bytes from `header_len` on are already payload.
    Complete {
        header_len: usize,
        protocol: Option<String>,
    },
}

pub fn generate_client_key() -> ClientKey {
    let mut key_bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut key_bytes);
    let sec_websocket_key = b64.encode(key_bytes);
    let expected_accept = accept_key(&sec_websocket_key);

    ClientKey {
        sec_websocket_key,
        expected_accept,
    }
}

/// base64(SHA-1(key ++ GUID)), the value a server must echo back.
pub fn accept_key(sec_websocket_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(sec_websocket_key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    b64.encode(sha1.finalize())
}

pub struct RequestParts<'a> {
    pub host: &'a str,
    pub path_and_query: &'a str,
    pub sec_websocket_key: &'a str,
    pub protocols: &'a [String],
    pub extra_headers: &'a [(String, String)],
}

pub fn write_request(parts: &RequestParts<'_>) -> SmallVec<[u8; 512]> {
    const REQUEST_PREFIX: &[u8] = b"GET ";
    const REQUEST_SUFFIX: &[u8] = b" HTTP/1.1\r\nHost: ";
    const UPGRADE_HEADERS: &[u8] =
        b"\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n";
    const HEADER_SEPARATOR: &[u8] = b": ";
    const CRLF: &[u8] = b"\r\n";

    let mut buffer = SmallVec::<[u8; 512]>::new();
    buffer.extend_from_slice(REQUEST_PREFIX);
    buffer.extend_from_slice(parts.path_and_query.as_bytes());
    buffer.extend_from_slice(REQUEST_SUFFIX);
    buffer.extend_from_slice(parts.host.as_bytes());
    buffer.extend_from_slice(UPGRADE_HEADERS);

    let mut header = |name: &str, value: &str| {
        buffer.extend_from_slice(name.as_bytes());
        buffer.extend_from_slice(HEADER_SEPARATOR);
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(CRLF);
    };

    header("Sec-WebSocket-Key", parts.sec_websocket_key);
    if !parts.protocols.is_empty() {
        header("Sec-WebSocket-Protocol", &parts.protocols.join(", "));
    }
    for (k, v) in parts.extra_headers {
        header(k, v);
    }

    buffer.extend_from_slice(CRLF);
    buffer
}

/// Looks for the end of the response head. Returns the offset just past the
/// terminator.
pub fn find_terminator(buf: &[u8], scan_from: usize) -> Option<usize> {
    let start = scan_from.min(buf.len());
    Finder::new(TERMINATOR)
        .find(&buf[start..])
        .map(|i| start + i + TERMINATOR.len())
}

/// Scans `buf` (everything received so far) for a complete response head and
/// verifies it against `key` and the requested `protocols`.
pub fn read_response(
    buf: &[u8],
    scan_from: usize,
    key: &ClientKey,
    protocols: &[String],
) -> Result<Parsed, UpgradeErr> {
    match find_terminator(buf, scan_from) {
        None => Ok(Parsed::NeedMore {
            scan_from: buf.len().saturating_sub(TERMINATOR.len() - 1),
        }),
        Some(end) => {
            let protocol = verify_response(&buf[..end], &key.expected_accept, protocols)?;
            Ok(Parsed::Complete {
                header_len: end,
                protocol,
            })
        }
    }
}

pub fn verify_response(
    head: &[u8],
    expected_accept: &str,
    protocols: &[String],
) -> Result<Option<String>, UpgradeErr> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(head)? {
        Status::Complete(_) => {}
        Status::Partial => return Err(UpgradeErr::Headers("incomplete head")),
    }

    let code = response.code.unwrap_or(0);
    if code != 101 {
        return Err(UpgradeErr::Status(code));
    }

    let connection =
        find_header(response.headers, CONNECTION.as_str()).ok_or(UpgradeErr::Headers("Connection"))?;
    if !header_has_token(connection, "upgrade")? {
        return Err(UpgradeErr::Headers("Connection"));
    }

    let upgrade =
        find_header(response.headers, UPGRADE.as_str()).ok_or(UpgradeErr::Headers("Upgrade"))?;
    if !header_has_token(upgrade, "websocket")? {
        return Err(UpgradeErr::Headers("Upgrade"));
    }

    let accept = find_header(response.headers, SEC_WEBSOCKET_ACCEPT.as_str())
        .ok_or(UpgradeErr::Headers("Sec-WebSocket-Accept"))?;
    let accept_str = std::str::from_utf8(accept).map_err(|_| UpgradeErr::Utf8)?;
    if accept_str.trim() != expected_accept {
        return Err(UpgradeErr::Accept);
    }

    match find_header(response.headers, SEC_WEBSOCKET_PROTOCOL.as_str()) {
        None => Ok(None),
        Some(value) => {
            let selected = std::str::from_utf8(value)
                .map_err(|_| UpgradeErr::Utf8)?
                .trim();
            if protocols.iter().any(|p| p == selected) {
                Ok(Some(selected.to_owned()))
            } else {
                Err(UpgradeErr::Protocol(selected.to_owned()))
            }
        }
    }
}

fn find_header<'a>(headers: &'a [httparse::Header<'a>], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value)
}

fn header_has_token(value: &[u8], token: &str) -> Result<bool, UpgradeErr> {
    let text = std::str::from_utf8(value).map_err(|_| UpgradeErr::Utf8)?;
    Ok(text
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token)))
}
