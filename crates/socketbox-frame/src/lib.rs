// STOMP 1.2 wire codec: frames in, frames out.
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("incomplete frame")]
    Incomplete,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    BadHeader(String),
    #[error("invalid escape sequence in header")]
    BadEscape,
    #[error("body not NUL-terminated")]
    MissingNul,
    #[error("frame is not valid utf-8")]
    Utf8,
}

/// STOMP 1.2 commands, client and server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Disconnect,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Disconnect => "DISCONNECT",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "CONNECT" => Ok(Command::Connect),
            "STOMP" => Ok(Command::Stomp),
            "CONNECTED" => Ok(Command::Connected),
            "DISCONNECT" => Ok(Command::Disconnect),
            "SEND" => Ok(Command::Send),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "ACK" => Ok(Command::Ack),
            "NACK" => Ok(Command::Nack),
            "BEGIN" => Ok(Command::Begin),
            "COMMIT" => Ok(Command::Commit),
            "ABORT" => Ok(Command::Abort),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }
}

/// A parsed STOMP frame.
///
/// Headers keep wire order; lookups return the **first** occurrence of a
/// name, matching the STOMP duplicate-header rule.
///
/// ```
/// use socketbox_frame::{Command, Message};
///
/// let mut message = Message::new(Command::Send);
/// message.set_header("destination", "direct/room");
/// assert_eq!(message.header("destination"), Some("direct/room"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// First value for `name`, if any.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Replace the first occurrence of `name`, or append when absent.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.headers.iter_mut().find(|(key, _)| *key == name) {
            entry.1 = value;
        } else {
            self.headers.push((name, value));
        }
    }

    /// Append without de-duplicating; used by the parser to keep wire order.
    pub fn push_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Remove every occurrence of `name`.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(key, _)| key != name);
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Body as UTF-8, lossy for display/debug use.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Serialize to the STOMP wire form, NUL-terminated.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.body.len());
        buf.extend_from_slice(self.command.as_str().as_bytes());
        buf.extend_from_slice(b"\n");
        for (name, value) in &self.headers {
            escape_into(name, &mut buf);
            buf.extend_from_slice(b":");
            escape_into(value, &mut buf);
            buf.extend_from_slice(b"\n");
        }
        buf.extend_from_slice(b"\n");
        buf.extend_from_slice(&self.body);
        buf.extend_from_slice(b"\0");
        buf.freeze()
    }
}

/// Outcome of parsing one inbound unit from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Frame(Message),
    /// Empty frame: the client-side heart-beat. Answered with [`HEARTBEAT`].
    HeartBeat,
}

/// The one-byte reply to a client heart-beat.
pub const HEARTBEAT: &[u8] = b"\n";

/// Parse a single STOMP frame from `input`.
///
/// `input` must hold a complete frame (the transport delivers whole
/// WebSocket messages). An empty input or a bare EOL is a heart-beat.
pub fn parse(input: &[u8]) -> Result<Parsed> {
    if input.is_empty() || input == b"\n" || input == b"\r\n" {
        return Ok(Parsed::HeartBeat);
    }

    let (line, mut rest) = read_line(input)?;
    let command = Command::from_str(as_utf8(line)?)?;
    let mut message = Message::new(command);

    loop {
        let (line, remainder) = read_line(rest)?;
        rest = remainder;
        if line.is_empty() {
            break;
        }
        let split = line
            .iter()
            .position(|&byte| byte == b':')
            .ok_or_else(|| Error::BadHeader(String::from_utf8_lossy(line).into_owned()))?;
        let name = unescape(&line[..split])?;
        let value = unescape(&line[split + 1..])?;
        message.push_header(name, value);
    }

    // content-length bounds the body; otherwise it runs to the first NUL.
    message.body = match message
        .header("content-length")
        .and_then(|value| value.parse::<usize>().ok())
    {
        Some(length) => {
            if rest.len() < length + 1 {
                return Err(Error::Incomplete);
            }
            if rest[length] != 0 {
                return Err(Error::MissingNul);
            }
            Bytes::copy_from_slice(&rest[..length])
        }
        None => {
            let end = rest
                .iter()
                .position(|&byte| byte == 0)
                .ok_or(Error::MissingNul)?;
            Bytes::copy_from_slice(&rest[..end])
        }
    };

    Ok(Parsed::Frame(message))
}

// Splits off one line; tolerates CRLF as STOMP 1.2 allows.
fn read_line(input: &[u8]) -> Result<(&[u8], &[u8])> {
    let end = input
        .iter()
        .position(|&byte| byte == b'\n')
        .ok_or(Error::Incomplete)?;
    let mut line = &input[..end];
    if line.ends_with(b"\r") {
        line = &line[..line.len() - 1];
    }
    Ok((line, &input[end + 1..]))
}

fn as_utf8(input: &[u8]) -> Result<&str> {
    std::str::from_utf8(input).map_err(|_| Error::Utf8)
}

// Header octet decoding: \n \r \c \\ per the STOMP 1.2 escaping table.
fn unescape(input: &[u8]) -> Result<String> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.iter();
    while let Some(&byte) = bytes.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b'c') => out.push(b':'),
            Some(b'\\') => out.push(b'\\'),
            _ => return Err(Error::BadEscape),
        }
    }
    String::from_utf8(out).map_err(|_| Error::Utf8)
}

fn escape_into(input: &str, buf: &mut BytesMut) {
    for &byte in input.as_bytes() {
        match byte {
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            b':' => buf.extend_from_slice(b"\\c"),
            b'\\' => buf.extend_from_slice(b"\\\\"),
            other => buf.extend_from_slice(&[other]),
        }
    }
}
