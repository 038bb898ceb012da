//! JSON-lines protocol spoken on stdin/stdout.
//!
//! Each input line is one detector signal, witness message or command.
//! Each output line is an outgoing witness message, a membership event, or
//! the answer to a command.

use membership_core::witness::WitnessMessage;
use membership_core::{DetectionMethod, MembershipEvent, MonitorSnapshot, PeerId};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Longest input line accepted. Anything larger is dropped unparsed.
pub const MAX_LINE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Line too long: {0} bytes")]
    TooLong(usize),

    #[error("Invalid input: {0}")]
    Json(#[from] serde_json::Error),
}

/// A line read from stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InputLine {
    /// A detector lost contact with a peer
    #[serde(rename_all = "camelCase")]
    Disconnected {
        peer_id: PeerId,
        method: DetectionMethod,
        /// Milliseconds since Unix epoch; now if absent
        #[serde(default)]
        last_contact_ms: Option<u64>,
    },
    /// A detector (re-)established contact with a peer
    #[serde(rename_all = "camelCase")]
    Reconnected { peer_id: PeerId },
    /// A peer announced it is leaving
    #[serde(rename_all = "camelCase")]
    Left { peer_id: PeerId },
    /// A peer asks to be added to the realm
    #[serde(rename_all = "camelCase")]
    Join { peer_id: PeerId },
    /// A witness message from another member
    Witness { message: WitnessMessage },
    /// Administrative override of all disconnect state for a peer
    #[serde(rename_all = "camelCase")]
    ClearProtection { peer_id: PeerId },
    /// Ask for a diagnostics snapshot
    Status,
}

impl InputLine {
    pub fn parse(line: &str) -> Result<Self, InputError> {
        if line.len() > MAX_LINE_SIZE {
            return Err(InputError::TooLong(line.len()));
        }
        Ok(serde_json::from_str(line)?)
    }
}

/// One line as read off the wire, before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLine {
    Text(String),
    /// Longer than `MAX_LINE_SIZE`; the bytes were discarded
    TooLong(usize),
    InvalidUtf8,
}

/// Newline-delimited reader that never buffers more than `MAX_LINE_SIZE`
/// bytes of a line.
///
/// Cancel safe: a partly read line survives a dropped `next_line` future,
/// so it can sit in a `select!` loop.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Bytes of the current line seen so far, kept or not
    seen: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            seen: 0,
        }
    }

    /// Next line, or `None` at end of input.
    pub async fn next_line(&mut self) -> io::Result<Option<RawLine>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.seen == 0 {
                    return Ok(None);
                }
                return Ok(Some(self.finish(false)));
            }

            let (take, terminated) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            // Room for the line, a '\r' and the '\n'
            let room = (MAX_LINE_SIZE + 2).saturating_sub(self.buf.len());
            self.buf.extend_from_slice(&available[..take.min(room)]);
            self.seen += take;
            self.inner.consume(take);

            if terminated {
                return Ok(Some(self.finish(true)));
            }
        }
    }

    fn finish(&mut self, terminated: bool) -> RawLine {
        let len = self.seen - usize::from(terminated);
        self.seen = 0;
        let mut bytes = std::mem::take(&mut self.buf);

        if terminated {
            bytes.pop();
        }
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        if len > MAX_LINE_SIZE {
            return RawLine::TooLong(len);
        }

        match String::from_utf8(bytes) {
            Ok(text) => RawLine::Text(text),
            Err(_) => RawLine::InvalidUtf8,
        }
    }
}

/// A line written to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutputLine {
    /// Deliver `message` to `to`, or to every member when absent
    Witness {
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        message: WitnessMessage,
    },
    Event { event: MembershipEvent },
    #[serde(rename_all = "camelCase")]
    Admission {
        peer_id: PeerId,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Status { snapshot: MonitorSnapshot },
}

impl OutputLine {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use membership_core::ReportId;
    use membership_core::witness::Vote;

    #[test]
    fn test_parse_disconnected() {
        let line = r#"{"type":"disconnected","peerId":"a1b2c3d4e5f67890","method":"idleTimeout"}"#;
        let input = InputLine::parse(line).unwrap();
        assert_eq!(
            input,
            InputLine::Disconnected {
                peer_id: "a1b2c3d4e5f67890".parse().unwrap(),
                method: DetectionMethod::IdleTimeout,
                last_contact_ms: None,
            }
        );
    }

    #[test]
    fn test_parse_witness() {
        let report_id = ReportId::generate();
        let line = format!(
            r#"{{"type":"witness","message":{{"type":"confirmation","witnessId":"1234567890abcdef","reportId":"{}","vote":"disagree"}}}}"#,
            report_id
        );
        match InputLine::parse(&line).unwrap() {
            InputLine::Witness { message } => {
                assert_eq!(
                    message,
                    WitnessMessage::confirmation(
                        "1234567890abcdef".parse().unwrap(),
                        report_id,
                        Vote::Disagree
                    )
                );
            }
            other => panic!("Expected witness input, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(InputLine::parse(r#"{"type":"status"}"#).unwrap(), InputLine::Status);
    }

    #[test]
    fn test_rejects_bad_lines() {
        assert!(matches!(
            InputLine::parse("not json"),
            Err(InputError::Json(_))
        ));
        assert!(InputLine::parse(r#"{"type":"reconnected","peerId":"xyz"}"#).is_err());

        let long = "x".repeat(MAX_LINE_SIZE + 1);
        assert!(matches!(
            InputLine::parse(&long),
            Err(InputError::TooLong(_))
        ));
    }

    async fn read_all(input: &[u8], capacity: usize) -> Vec<RawLine> {
        let mut reader = LineReader::new(tokio::io::BufReader::with_capacity(capacity, input));
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_line_reader_splits_lines() {
        let input = b"{\"type\":\"status\"}\r\nsecond\n\nlast";
        let lines = read_all(input, 4).await;
        assert_eq!(
            lines,
            vec![
                RawLine::Text(r#"{"type":"status"}"#.to_string()),
                RawLine::Text("second".to_string()),
                RawLine::Text(String::new()),
                RawLine::Text("last".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_line_reader_survives_bad_bytes() {
        let mut input = b"first\n".to_vec();
        input.extend_from_slice(&[0xff, 0xfe, 0x80, b'\n']);
        input.extend_from_slice(b"{\"type\":\"status\"}\n");

        let lines = read_all(&input, 8).await;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], RawLine::Text("first".to_string()));
        assert_eq!(lines[1], RawLine::InvalidUtf8);
        match &lines[2] {
            RawLine::Text(text) => assert_eq!(InputLine::parse(text).unwrap(), InputLine::Status),
            other => panic!("Expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_line_reader_caps_long_lines() {
        let mut input = vec![b'x'; MAX_LINE_SIZE + 10];
        input.push(b'\n');
        input.extend_from_slice(&vec![b'y'; MAX_LINE_SIZE]);
        input.push(b'\n');

        let lines = read_all(&input, 1024).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], RawLine::TooLong(MAX_LINE_SIZE + 10));
        assert_eq!(lines[1], RawLine::Text("y".repeat(MAX_LINE_SIZE)));
    }

    #[test]
    fn test_broadcast_omits_recipient() {
        let line = OutputLine::Witness {
            to: None,
            message: WitnessMessage::result(ReportId::generate(), PeerId::from(1), true),
        }
        .to_line()
        .unwrap();

        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["type"], "witness");
        assert!(json.get("to").is_none());
        assert_eq!(json["message"]["type"], "result");
    }

    #[test]
    fn test_admission_line() {
        let line = OutputLine::Admission {
            peer_id: PeerId::from(1),
            accepted: false,
            reason: Some("flapping".to_string()),
        }
        .to_line()
        .unwrap();

        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["peerId"], "0000000000000001");
        assert_eq!(json["reason"], "flapping");
    }
}
