//! STOMP 1.2 frame model and text codec for the realtime chat transport.
//!
//! This crate owns the wire representation spoken over the chat WebSocket.
//! It performs no I/O: callers hand it the text of one WebSocket message and
//! get back the frames and heart-beats it carried, or hand it a frame and get
//! back the text to send.
//!
//! WIRE SHAPE
//! ==========
//! ```text
//! COMMAND\n
//! name:value\n
//! ...\n
//! \n
//! body\0
//! ```
//! A bare EOL between frames is a heart-beat. Header names and values are
//! escaped (`\\`, `\n`, `\r`, `\c`) on every command except CONNECT and
//! CONNECTED.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Text sent on the wire as an outgoing heart-beat.
pub const HEARTBEAT: &str = "\n";

/// Protocol versions offered in CONNECT.
pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

/// Error returned by [`decode`] and [`HeartBeat::parse`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// The command line does not name a STOMP command.
    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),
    /// The input ended before the header block was complete.
    #[error("truncated frame")]
    Truncated,
    /// A header line has no `:` separator.
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    /// A header contains an escape sequence STOMP 1.2 does not define.
    #[error("invalid header escape in: {0}")]
    InvalidEscape(String),
    /// The `content-length` header is not a number or overruns the input.
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
    /// The body is not followed by the NUL terminator.
    #[error("frame is missing its NUL terminator")]
    MissingTerminator,
    /// The `heart-beat` header is not of the form `cx,cy`.
    #[error("invalid heart-beat header: {0}")]
    InvalidHeartBeat(String),
}

// =============================================================================
// COMMAND
// =============================================================================

/// STOMP frame command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are exchanged before the version is
    /// agreed, so they are never escaped.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Self::Connect),
            "STOMP" => Ok(Self::Stomp),
            "CONNECTED" => Ok(Self::Connected),
            "SEND" => Ok(Self::Send),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "ACK" => Ok(Self::Ack),
            "NACK" => Ok(Self::Nack),
            "BEGIN" => Ok(Self::Begin),
            "COMMIT" => Ok(Self::Commit),
            "ABORT" => Ok(Self::Abort),
            "DISCONNECT" => Ok(Self::Disconnect),
            "MESSAGE" => Ok(Self::Message),
            "RECEIPT" => Ok(Self::Receipt),
            "ERROR" => Ok(Self::Error),
            other => Err(CodecError::UnknownCommand(other.to_owned())),
        }
    }
}

// =============================================================================
// FRAME
// =============================================================================

/// A single STOMP frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    /// Headers in wire order. Repeated names are allowed; the first wins.
    pub headers: Vec<(String, String)>,
    /// Frame body (empty for most client frames).
    pub body: String,
}

impl Frame {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header value. Per STOMP 1.2 the first occurrence wins.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Build a CONNECT frame. `extra` carries login or authorization headers.
    #[must_use]
    pub fn connect(host: &str, heart_beat: HeartBeat, extra: &[(String, String)]) -> Self {
        let mut frame = Self::new(Command::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("host", host)
            .with_header("heart-beat", heart_beat.header_value());
        frame.headers.extend(extra.iter().cloned());
        frame
    }

    /// Build a SUBSCRIBE frame with automatic acknowledgement.
    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).with_header("id", id)
    }

    /// Build a SEND frame carrying a JSON body.
    #[must_use]
    pub fn send_json(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    #[must_use]
    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).with_header("receipt", receipt)
    }

    /// Human-readable reason carried by an ERROR frame.
    #[must_use]
    pub fn error_message(&self) -> String {
        match self.header("message") {
            Some(message) => message.to_owned(),
            None if !self.body.is_empty() => self.body.clone(),
            None => "broker error".to_owned(),
        }
    }
}

/// One unit decoded from a WebSocket message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A bare EOL between frames.
    Heartbeat,
    /// A complete frame.
    Frame(Frame),
}

// =============================================================================
// HEART-BEAT
// =============================================================================

/// Heart-beat intervals in milliseconds; zero disables a direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartBeat {
    /// How often this side promises to send something.
    pub outgoing: u64,
    /// How often this side wants to receive something.
    pub incoming: u64,
}

impl HeartBeat {
    #[must_use]
    pub fn new(outgoing: u64, incoming: u64) -> Self {
        Self { outgoing, incoming }
    }

    /// Parse a `heart-beat` header value (`cx,cy`).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidHeartBeat`] if the value is not two
    /// comma-separated integers.
    pub fn parse(value: &str) -> Result<Self, CodecError> {
        let invalid = || CodecError::InvalidHeartBeat(value.to_owned());
        let (out, inc) = value.split_once(',').ok_or_else(invalid)?;
        let outgoing = out.trim().parse::<u64>().map_err(|_| invalid())?;
        let incoming = inc.trim().parse::<u64>().map_err(|_| invalid())?;
        Ok(Self { outgoing, incoming })
    }

    #[must_use]
    pub fn header_value(self) -> String {
        format!("{},{}", self.outgoing, self.incoming)
    }

    /// Agree on effective intervals from the client's offer and the
    /// server's CONNECTED reply.
    #[must_use]
    pub fn negotiate(client: Self, server: Self) -> Self {
        let outgoing = if client.outgoing == 0 || server.incoming == 0 {
            0
        } else {
            client.outgoing.max(server.incoming)
        };
        let incoming = if client.incoming == 0 || server.outgoing == 0 {
            0
        } else {
            client.incoming.max(server.outgoing)
        };
        Self { outgoing, incoming }
    }

    #[must_use]
    pub fn outgoing_interval(self) -> Option<Duration> {
        (self.outgoing > 0).then(|| Duration::from_millis(self.outgoing))
    }

    #[must_use]
    pub fn incoming_interval(self) -> Option<Duration> {
        (self.incoming > 0).then(|| Duration::from_millis(self.incoming))
    }
}

// =============================================================================
// ENCODE
// =============================================================================

/// Encode a frame into its wire text, NUL terminator included.
///
/// A `content-length` header is added for non-empty bodies unless the
/// caller already set one.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(64 + frame.body.len());
    out.push_str(frame.command.as_str());
    out.push('\n');

    for (name, value) in &frame.headers {
        if escape {
            out.push_str(&escape_header(name));
            out.push(':');
            out.push_str(&escape_header(value));
        } else {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
        }
        out.push('\n');
    }
    if !frame.body.is_empty() && frame.header("content-length").is_none() {
        out.push_str("content-length:");
        out.push_str(&frame.body.len().to_string());
        out.push('\n');
    }

    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

// =============================================================================
// DECODE
// =============================================================================

/// Decode the text of one WebSocket message.
///
/// A message may carry several frames and any number of heart-beat EOLs;
/// each run of EOLs between frames yields one [`Inbound::Heartbeat`].
///
/// # Errors
///
/// Returns a [`CodecError`] describing the first malformed frame. Frames
/// before it are discarded with it; callers treat the message as a unit.
pub fn decode(input: &str) -> Result<Vec<Inbound>, CodecError> {
    let mut out = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let trimmed = rest.trim_start_matches(['\n', '\r']);
        if trimmed.len() != rest.len() {
            out.push(Inbound::Heartbeat);
            rest = trimmed;
            continue;
        }
        let (frame, remaining) = decode_one(rest)?;
        out.push(Inbound::Frame(frame));
        rest = remaining;
    }

    Ok(out)
}

fn decode_one(input: &str) -> Result<(Frame, &str), CodecError> {
    let (command_line, mut rest) = split_line(input).ok_or(CodecError::Truncated)?;
    let command = command_line.parse::<Command>()?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, after) = split_line(rest).ok_or(CodecError::Truncated)?;
        rest = after;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeader(line.to_owned()))?;
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }

    let frame = Frame { command, headers, body: String::new() };
    let (body, rest) = match content_length(&frame)? {
        Some(len) => {
            let invalid = || CodecError::InvalidContentLength(len.to_string());
            let body = rest.get(..len).ok_or_else(invalid)?;
            let after = rest.get(len..).ok_or_else(invalid)?;
            let after = after.strip_prefix('\0').ok_or(CodecError::MissingTerminator)?;
            (body, after)
        }
        None => {
            let end = rest.find('\0').ok_or(CodecError::MissingTerminator)?;
            (&rest[..end], &rest[end + 1..])
        }
    };

    Ok((frame.with_body(body), rest))
}

fn split_line(input: &str) -> Option<(&str, &str)> {
    let idx = input.find('\n')?;
    let line = &input[..idx];
    let line = line.strip_suffix('\r').unwrap_or(line);
    Some((line, &input[idx + 1..]))
}

fn content_length(frame: &Frame) -> Result<Option<usize>, CodecError> {
    frame
        .header("content-length")
        .map(|raw| {
            raw.trim()
                .parse::<usize>()
                .map_err(|_| CodecError::InvalidContentLength(raw.to_owned()))
        })
        .transpose()
}

fn unescape_header(raw: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(CodecError::InvalidEscape(raw.to_owned())),
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
