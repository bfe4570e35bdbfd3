//! Line-framed control protocol between an agent and the broker.
//!
//! The wire format is deliberately simple: ASCII text, `\n`-terminated,
//! `\r` ignored, no field containing `\n`, no line exceeding
//! [`MAX_LINE_BYTES`] (including the terminator). There is no
//! length-prefixed binary framing here — a protocol upgrade to one is
//! explicitly out of scope for this crate.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default TCP port the broker listens on for agent control connections.
pub const CONTROL_PORT: u16 = 9999;

/// Maximum number of bytes in one line, including the trailing `\n`.
///
/// A line of exactly this many bytes (content + `\n`) is accepted; one
/// byte longer closes the connection without a reply.
pub const MAX_LINE_BYTES: usize = 512;

/// Failure reading or writing a control-protocol line.
#[derive(Debug)]
pub enum FramingError {
    /// The peer's line (including `\n`) exceeded [`MAX_LINE_BYTES`].
    LineTooLong,
    /// The peer closed the connection before sending a complete line.
    Eof,
    /// The line was not valid UTF-8.
    InvalidUtf8,
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::LineTooLong => write!(f, "line exceeded {MAX_LINE_BYTES} bytes"),
            FramingError::Eof => write!(f, "connection closed before a complete line arrived"),
            FramingError::InvalidUtf8 => write!(f, "line was not valid UTF-8"),
            FramingError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for FramingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FramingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FramingError {
    fn from(err: std::io::Error) -> Self {
        FramingError::Io(err)
    }
}

/// Read one `\n`-terminated line, enforcing [`MAX_LINE_BYTES`] as the
/// bytes are read (not after the fact, so a hostile peer can't make us
/// buffer an unbounded line). A trailing `\r` is stripped.
pub async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, FramingError> {
    let mut content = Vec::with_capacity(64);
    let mut total = 0usize;
    loop {
        let byte = reader.read_u8().await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                FramingError::Eof
            } else {
                FramingError::Io(err)
            }
        })?;
        total += 1;
        if total > MAX_LINE_BYTES {
            return Err(FramingError::LineTooLong);
        }
        if byte == b'\n' {
            break;
        }
        content.push(byte);
    }
    if content.last() == Some(&b'\r') {
        content.pop();
    }
    String::from_utf8(content).map_err(|_| FramingError::InvalidUtf8)
}

/// Write one line followed by `\n`. `line` must not itself contain `\n`.
pub async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    line: &str,
) -> Result<(), FramingError> {
    debug_assert!(!line.contains('\n'), "protocol line must not embed a newline");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Prefix marking the first line of a data connection: `DATA:<conn_id>`.
pub const DATA_PREFIX: &str = "DATA:";

/// Prefix marking a successful authentication reply.
pub const SUCCESS_PREFIX: &str = "SUCCESS:";

/// Prefix marking a failed authentication or setup reply.
pub const ERROR_PREFIX: &str = "ERROR:";

/// The line that announces a pending external connection, always
/// immediately followed by a [`format_conn_id`] line on the same write.
pub const CONNECT_LINE: &str = "CONNECT";

/// Prefix of the line carrying the connection id for a `CONNECT`.
pub const CONN_ID_PREFIX: &str = "CONN_ID:";

/// Build the `SUCCESS:<tunnel_id>:<public_port>` reply line.
pub fn format_success(tunnel_id: uuid::Uuid, public_port: u16) -> String {
    format!("{SUCCESS_PREFIX}{tunnel_id}:{public_port}")
}

/// Build the `ERROR:<reason>` reply line. `reason` must not contain `\n`.
pub fn format_error(reason: &str) -> String {
    format!("{ERROR_PREFIX}{reason}")
}

/// Build the `CONNECT` line (send before [`format_conn_id`]).
pub fn format_connect() -> &'static str {
    CONNECT_LINE
}

/// Build the `CONN_ID:<conn_id>` line.
pub fn format_conn_id(conn_id: &str) -> String {
    format!("{CONN_ID_PREFIX}{conn_id}")
}

/// Parse a first line as a data-channel announcement, returning the
/// connection id if the line is `DATA:<conn_id>`.
pub fn parse_data_line(line: &str) -> Option<&str> {
    line.strip_prefix(DATA_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_a_simple_line() {
        let mut cursor = Cursor::new(b"hello\n".to_vec());
        let line = read_line(&mut cursor).await.unwrap();
        assert_eq!(line, "hello");
    }

    #[tokio::test]
    async fn strips_trailing_cr() {
        let mut cursor = Cursor::new(b"hello\r\n".to_vec());
        let line = read_line(&mut cursor).await.unwrap();
        assert_eq!(line, "hello");
    }

    #[tokio::test]
    async fn accepts_exactly_max_line_bytes() {
        // 511 bytes of content + '\n' == 512 bytes total.
        let mut data = vec![b'a'; MAX_LINE_BYTES - 1];
        data.push(b'\n');
        let mut cursor = Cursor::new(data);
        let line = read_line(&mut cursor).await.unwrap();
        assert_eq!(line.len(), MAX_LINE_BYTES - 1);
    }

    #[tokio::test]
    async fn rejects_one_byte_over_max() {
        let mut data = vec![b'a'; MAX_LINE_BYTES];
        data.push(b'\n');
        let mut cursor = Cursor::new(data);
        let err = read_line(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::LineTooLong));
    }

    #[tokio::test]
    async fn eof_before_newline_is_an_error() {
        let mut cursor = Cursor::new(b"no newline here".to_vec());
        let err = read_line(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FramingError::Eof));
    }

    #[test]
    fn parses_data_channel_line() {
        assert_eq!(parse_data_line("DATA:abc-123"), Some("abc-123"));
        assert_eq!(parse_data_line("tok_ok"), None);
    }

    #[test]
    fn formats_success_and_error_lines() {
        let id = uuid::Uuid::nil();
        assert_eq!(format_success(id, 12345), format!("SUCCESS:{id}:12345"));
        assert_eq!(format_error("bad"), "ERROR:bad");
    }
}
