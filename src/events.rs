use crate::{
    error::{CollectorError, FrameError},
    labels::valid_metric_name,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub(crate) const DELIM: &[u8] = b"\r\n";
pub(crate) const QUERY_MARKER: u8 = b'?';
const FRAME_SENTINEL: u8 = b'$';
// Sentinel plus the twenty digits of `usize::MAX`, plus the delimiter.
const MAX_HEADER_LEN: usize = 1 + 20 + 2;

/// The kind of metric being registered.
///
/// Only monotonic counters exist today; the wire carries the kind as text so
/// unknown kinds from newer peers are rejected by the registry instead of the framer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
}

impl MetricKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            other => Err(format!("unsupported metric kind {other:?}")),
        }
    }
}

/// A registry operation, sent over IPC or applied directly by the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricEvent {
    /// Declares a metric. `kind` is the textual kind, e.g. `"counter"`.
    Register {
        kind: String,
        name: String,
        description: Option<String>,
    },
    /// Adds `amount` (decimal text) to the series identified by the canonical `labels`.
    Increment {
        name: String,
        amount: String,
        labels: String,
    },
}

impl MetricEvent {
    const fn op(&self) -> &'static str {
        match self {
            Self::Register { .. } => "reg",
            Self::Increment { .. } => "inc",
        }
    }

    /// Checks that this event can be framed and applied the same way on either side of the
    /// socket.
    ///
    /// # Errors
    /// Returns [`CollectorError::InvalidName`] for names outside `[a-zA-Z_:][a-zA-Z0-9_:]*`,
    /// [`CollectorError::InvalidAmount`] for amounts that are negative, NaN or not a number,
    /// and [`CollectorError::InvalidField`] for any field containing a line break.
    pub fn validate(&self) -> Result<(), CollectorError> {
        match self {
            Self::Register {
                kind,
                name,
                description,
            } => {
                check_name(name)?;
                check_line("kind", kind)?;
                check_line("description", description.as_deref().unwrap_or_default())
            }
            Self::Increment {
                name,
                amount,
                labels,
            } => {
                check_name(name)?;
                check_line("labels", labels)?;
                match amount.parse::<f64>() {
                    Ok(value) if value >= 0.0 => Ok(()),
                    Ok(value) => Err(CollectorError::InvalidAmount(value)),
                    Err(_) => Err(CollectorError::InvalidAmount(f64::NAN)),
                }
            }
        }
    }

    /// Encodes this event as one request frame: `$<len>\r\n<op>\r\n<arg>\r\n...\r\n`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut payload: Vec<u8> = Vec::new();
        let mut push = |part: &str| {
            payload.extend_from_slice(part.as_bytes());
            payload.extend_from_slice(DELIM);
        };

        push(self.op());
        match self {
            Self::Register {
                kind,
                name,
                description,
            } => {
                push(kind.as_str());
                push(name.as_str());
                push(description.as_deref().unwrap_or_default());
            }
            Self::Increment {
                name,
                amount,
                labels,
            } => {
                push(name.as_str());
                push(amount.as_str());
                if !labels.is_empty() {
                    push(labels.as_str());
                }
            }
        }

        let mut frame = format!("{}{}", FRAME_SENTINEL as char, payload.len()).into_bytes();
        frame.extend_from_slice(DELIM);
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(DELIM);
        frame
    }

    fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| FrameError::Malformed(format!("payload is not UTF-8: {e}")))?;
        let text = text
            .strip_suffix("\r\n")
            .ok_or_else(|| FrameError::Malformed("payload is not delimiter-terminated".into()))?;

        let mut parts = text.split("\r\n");
        let op = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match (op, args.as_slice()) {
            ("reg", [kind, name]) => Ok(Self::Register {
                kind: (*kind).to_string(),
                name: (*name).to_string(),
                description: None,
            }),
            ("reg", [kind, name, description]) => Ok(Self::Register {
                kind: (*kind).to_string(),
                name: (*name).to_string(),
                description: Some((*description).to_string()).filter(|d| !d.is_empty()),
            }),
            ("inc", [name, amount]) => Ok(Self::Increment {
                name: (*name).to_string(),
                amount: (*amount).to_string(),
                labels: String::new(),
            }),
            ("inc", [name, amount, labels]) => Ok(Self::Increment {
                name: (*name).to_string(),
                amount: (*amount).to_string(),
                labels: (*labels).to_string(),
            }),
            ("reg" | "inc", args) => Err(FrameError::Malformed(format!(
                "{op} does not take {} arguments",
                args.len()
            ))),
            (op, _) => Err(FrameError::UnknownOperation(op.to_string())),
        }
    }
}

fn check_name(name: &str) -> Result<(), CollectorError> {
    if valid_metric_name(name) {
        Ok(())
    } else {
        Err(CollectorError::InvalidName(name.to_string()))
    }
}

fn check_line(field: &'static str, value: &str) -> Result<(), CollectorError> {
    if value.contains(['\r', '\n']) {
        Err(CollectorError::InvalidField(field, value.to_string()))
    } else {
        Ok(())
    }
}

/// One unit extracted from a peer's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Query,
    Event(MetricEvent),
}

/// Locates `\r\n` after a decimal length prefix starting at `start`.
///
/// Returns the parsed length and the offset just past the delimiter, or `None` when
/// the header has not fully arrived yet.
fn parse_length_header(buf: &[u8], start: usize) -> Result<Option<(usize, usize)>, FrameError> {
    let Some(pos) = buf[start..]
        .windows(DELIM.len())
        .position(|window| window == DELIM)
    else {
        if buf.len() > MAX_HEADER_LEN {
            return Err(FrameError::Malformed("length header is too long".into()));
        }
        return Ok(None);
    };

    let digits = &buf[start..start + pos];
    let len = std::str::from_utf8(digits)
        .ok()
        .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|d| d.parse::<usize>().ok())
        .ok_or_else(|| {
            FrameError::Malformed(format!(
                "non-numeric length {:?}",
                String::from_utf8_lossy(digits)
            ))
        })?;
    Ok(Some((len, start + pos + DELIM.len())))
}

/// Attempts to extract one frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, or the frame together with the number of
/// bytes it occupied. Bytes past that count belong to the next frame.
///
/// # Errors
/// Returns a [`FrameError`] if the buffer cannot be the start of a valid frame. The caller
/// should treat this as fatal for the connection and discard the buffer.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    match buf.first() {
        None => Ok(None),
        Some(&QUERY_MARKER) => Ok(Some((Frame::Query, 1))),
        Some(&FRAME_SENTINEL) => {
            let Some((len, body_start)) = parse_length_header(buf, 1)? else {
                return Ok(None);
            };
            let total = body_start
                .checked_add(len)
                .and_then(|end| end.checked_add(DELIM.len()))
                .ok_or_else(|| FrameError::Malformed("declared length overflows".into()))?;
            if buf.len() < total {
                return Ok(None);
            }
            if &buf[total - DELIM.len()..total] != DELIM {
                return Err(FrameError::Malformed("missing frame trailer".into()));
            }
            let event = MetricEvent::from_payload(&buf[body_start..body_start + len])?;
            Ok(Some((Frame::Event(event), total)))
        }
        Some(other) => Err(FrameError::Malformed(format!(
            "unexpected leading byte {other:#04x}"
        ))),
    }
}

/// Encodes a query response: `<len>\r\n<text>\r\n`.
#[must_use]
pub fn encode_response(text: &str) -> Vec<u8> {
    let mut frame = text.len().to_string().into_bytes();
    frame.extend_from_slice(DELIM);
    frame.extend_from_slice(text.as_bytes());
    frame.extend_from_slice(DELIM);
    frame
}

/// Attempts to extract a complete query response from `buf`.
///
/// # Errors
/// Returns a [`FrameError`] if the length header is not numeric or the payload is not UTF-8.
pub fn decode_response(buf: &[u8]) -> Result<Option<(String, usize)>, FrameError> {
    let Some((len, body_start)) = parse_length_header(buf, 0)? else {
        return Ok(None);
    };
    let total = body_start
        .checked_add(len)
        .and_then(|end| end.checked_add(DELIM.len()))
        .ok_or_else(|| FrameError::Malformed("declared length overflows".into()))?;
    if buf.len() < total {
        return Ok(None);
    }
    let text = std::str::from_utf8(&buf[body_start..body_start + len])
        .map_err(|e| FrameError::Malformed(format!("response is not UTF-8: {e}")))?;
    Ok(Some((text.to_string(), total)))
}
