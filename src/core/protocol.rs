//! Relay header protocol
//!
//! The client sends exactly one header line right after connecting:
//!
//! ```text
//! transport@host$port\r
//! ```
//!
//! - `transport` is `udp` for the UDP tunnel; anything else means TCP
//! - every `$` after the `@` stands for `:` in the target address
//! - the line ends with a carriage return (byte 13)
//!
//! Nothing is ever written back: the relay either starts forwarding or closes.

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Header line terminator
pub const HEADER_DELIMITER: u8 = b'\r';

/// Separator between header fields
pub const FIELD_SEPARATOR: char = '@';

/// Stand-in for `:` inside the target field
pub const PORT_PLACEHOLDER: char = '$';

/// Default cap on the header line length
pub const DEFAULT_MAX_HEADER_SIZE: usize = 4096;

/// Transport requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// `udp` selects UDP; every other value falls back to TCP
    pub fn from_field(field: &str) -> Self {
        if field == "udp" {
            Transport::Udp
        } else {
            Transport::Tcp
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHeader {
    pub transport: Transport,
    /// Target in `host:port` form
    pub target: String,
}

/// Why a header was not accepted
#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("connection closed before any header byte")]
    Empty,

    #[error("header exceeds {0} bytes without a delimiter")]
    TooLarge(usize),

    #[error("header is not valid UTF-8")]
    InvalidUtf8,

    #[error("header has fewer than two '@'-separated fields")]
    TooFewFields,

    #[error("header read failed: {0}")]
    Io(#[from] io::Error),
}

/// Decode the bytes that preceded the delimiter
pub fn parse_header(line: &[u8]) -> Result<RelayHeader, HeaderError> {
    let text = std::str::from_utf8(line).map_err(|_| HeaderError::InvalidUtf8)?;

    let mut fields = text.split(FIELD_SEPARATOR);
    let (transport, target) = match (fields.next(), fields.next()) {
        (Some(transport), Some(target)) => (transport, target),
        _ => return Err(HeaderError::TooFewFields),
    };

    Ok(RelayHeader {
        transport: Transport::from_field(transport),
        target: target.replace(PORT_PLACEHOLDER, ":"),
    })
}

/// Read one header line from the client and decode it.
///
/// Reads up to `max_len` bytes looking for the delimiter. Bytes after the
/// delimiter stay buffered in `reader`. If the stream ends first, whatever
/// was read is taken as the header line in full. The relay this crate
/// replaces dropped the final byte in that case; here it is kept.
pub async fn read_header<R>(reader: &mut R, max_len: usize) -> Result<RelayHeader, HeaderError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(128);
    let n = reader
        .take(max_len as u64)
        .read_until(HEADER_DELIMITER, &mut line)
        .await?;

    if n == 0 {
        return Err(HeaderError::Empty);
    }

    match line.last() {
        Some(&HEADER_DELIMITER) => {
            line.pop();
        }
        _ if n >= max_len => return Err(HeaderError::TooLarge(max_len)),
        _ => {}
    }

    parse_header(&line)
}

/// Named substring rules applied to the decoded target before anything else.
///
/// Independent of the destination block list: a match rejects the request
/// regardless of what the target resolves to.
#[derive(Debug, Clone)]
pub struct TargetPolicy {
    forbidden_substrings: Vec<String>,
}

/// The rule the relay always shipped with
pub const TEMP_MAIL_RULE: &str = "temp-mail.org";

impl Default for TargetPolicy {
    fn default() -> Self {
        Self::new([TEMP_MAIL_RULE])
    }
}

impl TargetPolicy {
    pub fn new<I, S>(forbidden_substrings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            forbidden_substrings: forbidden_substrings
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        }
    }

    /// First rule matching `target`, if any
    pub fn violated_rule(&self, target: &str) -> Option<&str> {
        self.forbidden_substrings
            .iter()
            .find(|rule| target.contains(rule.as_str()))
            .map(String::as_str)
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts
pub fn split_host_port(target: &str) -> Option<(String, u16)> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        (host, after.strip_prefix(':')?)
    } else {
        let (host, port) = target.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };

    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_parse_tcp_header() {
        let header = parse_header(b"tcp@93.184.216.34$80").unwrap();
        assert_eq!(header.transport, Transport::Tcp);
        assert_eq!(header.target, "93.184.216.34:80");
    }

    #[test]
    fn test_parse_udp_header() {
        let header = parse_header(b"udp@example.com$53").unwrap();
        assert_eq!(header.transport, Transport::Udp);
        assert_eq!(header.target, "example.com:53");
    }

    #[test]
    fn test_unknown_transport_defaults_to_tcp() {
        assert_eq!(parse_header(b"UDP@a$1").unwrap().transport, Transport::Tcp);
        assert_eq!(parse_header(b"garbage@a$1").unwrap().transport, Transport::Tcp);
        assert_eq!(parse_header(b"@a$1").unwrap().transport, Transport::Tcp);
    }

    #[test]
    fn test_every_placeholder_replaced() {
        let header = parse_header(b"tcp@[2001$db8$$1]$443").unwrap();
        assert_eq!(header.target, "[2001:db8::1]:443");
    }

    #[test]
    fn test_too_few_fields() {
        assert!(matches!(parse_header(b"tcp"), Err(HeaderError::TooFewFields)));
        assert!(matches!(parse_header(b""), Err(HeaderError::TooFewFields)));
    }

    #[test]
    fn test_extra_fields_ignored() {
        let header = parse_header(b"tcp@host$80@trailing").unwrap();
        assert_eq!(header.target, "host:80");
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(matches!(
            parse_header(b"tcp@\xff\xfe$80"),
            Err(HeaderError::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn test_read_header_keeps_trailing_bytes() {
        let data: &[u8] = b"tcp@example.com$80\rGET / HTTP/1.1";
        let mut reader = BufReader::new(data);
        let header = read_header(&mut reader, DEFAULT_MAX_HEADER_SIZE).await.unwrap();
        assert_eq!(header.target, "example.com:80");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"GET / HTTP/1.1");
    }

    #[tokio::test]
    async fn test_read_header_empty_stream() {
        let data: &[u8] = b"";
        let mut reader = BufReader::new(data);
        assert!(matches!(
            read_header(&mut reader, DEFAULT_MAX_HEADER_SIZE).await,
            Err(HeaderError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_read_header_immediate_delimiter() {
        let data: &[u8] = b"\r";
        let mut reader = BufReader::new(data);
        assert!(matches!(
            read_header(&mut reader, DEFAULT_MAX_HEADER_SIZE).await,
            Err(HeaderError::TooFewFields)
        ));
    }

    #[tokio::test]
    async fn test_read_header_eof_without_delimiter() {
        let data: &[u8] = b"udp@example.com$53";
        let mut reader = BufReader::new(data);
        let header = read_header(&mut reader, DEFAULT_MAX_HEADER_SIZE).await.unwrap();
        assert_eq!(header.transport, Transport::Udp);
        assert_eq!(header.target, "example.com:53");
    }

    #[tokio::test]
    async fn test_read_header_too_large() {
        let data = vec![b'a'; 64];
        let mut reader = BufReader::new(data.as_slice());
        assert!(matches!(
            read_header(&mut reader, 16).await,
            Err(HeaderError::TooLarge(16))
        ));
    }

    #[tokio::test]
    async fn test_read_header_delimiter_at_limit() {
        let data: &[u8] = b"tcp@h$1\r";
        let mut reader = BufReader::new(data);
        let header = read_header(&mut reader, data.len()).await.unwrap();
        assert_eq!(header.target, "h:1");
    }

    #[test]
    fn test_target_policy_default_rule() {
        let policy = TargetPolicy::default();
        assert_eq!(policy.violated_rule("temp-mail.org:443"), Some(TEMP_MAIL_RULE));
        assert_eq!(policy.violated_rule("api.temp-mail.org:80"), Some(TEMP_MAIL_RULE));
        assert_eq!(policy.violated_rule("example.com:443"), None);
    }

    #[test]
    fn test_target_policy_ignores_empty_rules() {
        let policy = TargetPolicy::new(["", "blocked.test"]);
        assert_eq!(policy.violated_rule("anything:80"), None);
        assert_eq!(policy.violated_rule("x.blocked.test:80"), Some("blocked.test"));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("93.184.216.34:80"),
            Some(("93.184.216.34".to_string(), 80))
        );
        assert_eq!(
            split_host_port("example.com:53"),
            Some(("example.com".to_string(), 53))
        );
        assert_eq!(split_host_port("[::1]:443"), Some(("::1".to_string(), 443)));
    }

    #[test]
    fn test_split_host_port_failures() {
        assert_eq!(split_host_port("example.com"), None);
        assert_eq!(split_host_port("::1:443"), None);
        assert_eq!(split_host_port("[::1]443"), None);
        assert_eq!(split_host_port(":80"), None);
        assert_eq!(split_host_port("host:http"), None);
        assert_eq!(split_host_port("host:70000"), None);
    }
}
