//! Framing for a stream that carries no length prefix.
//!
//! Requests are a JSON document followed by [`TERMINATOR`]. Replies are
//! detected by parsing the accumulated bytes: a parser that runs out of
//! input means "keep reading", any other parse failure means the reply is
//! garbage.

use serde_json::Value;

use super::protocol::{Reply, Request, TERMINATOR};
use crate::error::{QgaError, QgaResult};

/// Longest slice of a bad reply quoted in an error message.
const EXCERPT_LEN: usize = 256;

/// Serialize a request into its wire bytes.
///
/// Field order is fixed (`execute` then `arguments`, argument keys sorted),
/// so the same request always yields the same bytes.
pub fn encode(request: &Request) -> QgaResult<Vec<u8>> {
    let mut bytes = serde_json::to_vec(request).map_err(|e| {
        QgaError::protocol(format!(
            "failed to serialize {} request: {e}",
            request.command()
        ))
    })?;
    bytes.push(TERMINATOR);
    Ok(bytes)
}

/// Outcome of one accumulation step.
#[derive(Debug)]
pub enum Frame {
    Complete(Value),
    Incomplete,
    Malformed(serde_json::Error),
}

/// Bytes received so far for the reply in flight.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
}

impl FrameBuffer {
    pub const fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Append `chunk` and try to parse everything received so far.
    pub fn accumulate(&mut self, chunk: &[u8]) -> Frame {
        self.bytes.extend_from_slice(chunk);
        self.try_complete()
    }

    pub fn try_complete(&self) -> Frame {
        match serde_json::from_slice::<Value>(&self.bytes) {
            Ok(value) => Frame::Complete(value),
            Err(e) if e.is_eof() => Frame::Incomplete,
            Err(e) => Frame::Malformed(e),
        }
    }

    /// Whether the buffer looks like it holds the end of a reply: a
    /// terminator follows the start of the document, or the last
    /// significant byte closes an object. Leading whitespace never counts.
    pub fn looks_terminated(&self) -> bool {
        let Some(first) = self.bytes.iter().position(|b| !b.is_ascii_whitespace()) else {
            return false;
        };
        let last = self
            .bytes
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .unwrap_or(first);
        self.bytes[last] == b'}' || self.bytes[first..].contains(&TERMINATOR)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Leading bytes of the buffer, for error messages.
    pub fn excerpt(&self) -> String {
        let end = self.bytes.len().min(EXCERPT_LEN);
        let mut text = String::from_utf8_lossy(&self.bytes[..end]).into_owned();
        if self.bytes.len() > EXCERPT_LEN {
            text.push_str("...");
        }
        text
    }

    pub fn malformed(&self, err: &serde_json::Error) -> QgaError {
        QgaError::protocol(format!("invalid JSON reply ({err}): {}", self.excerpt()))
    }

    /// Stop reading and take whatever arrived as the whole reply.
    pub fn finish(&self) -> QgaResult<Value> {
        match self.try_complete() {
            Frame::Complete(value) => Ok(value),
            Frame::Incomplete => Err(QgaError::protocol(format!(
                "incomplete reply: {}",
                self.excerpt()
            ))),
            Frame::Malformed(e) => Err(self.malformed(&e)),
        }
    }
}

/// Classify a parsed reply document.
pub fn decode(value: Value) -> QgaResult<Reply> {
    let mut map = match value {
        Value::Object(map) => map,
        other => {
            return Err(QgaError::protocol(format!(
                "reply is not a JSON object: {other}"
            )))
        }
    };

    match (map.remove("return"), map.remove("error")) {
        (Some(value), None) => Ok(Reply::Success(value)),
        (None, Some(Value::Object(error))) => {
            let class = error
                .get("class")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let desc = error
                .get("desc")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_owned();
            Ok(Reply::Failure { class, desc })
        }
        (None, Some(other)) => Err(QgaError::protocol(format!(
            "error member is not an object: {other}"
        ))),
        (Some(_), Some(_)) => Err(QgaError::protocol(
            "reply carries both \"return\" and \"error\"",
        )),
        (None, None) => Err(QgaError::protocol(
            "reply carries neither \"return\" nor \"error\"",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn request(command: &str, arguments: Option<Value>) -> Request {
        Request::new(command, arguments).unwrap()
    }

    #[test]
    fn encode_appends_terminator() {
        let bytes = encode(&request("guest-ping", None)).unwrap();
        assert_eq!(bytes, b"{\"execute\":\"guest-ping\"}\n");
    }

    #[test]
    fn encode_is_deterministic() {
        let a = encode(&request(
            "guest-exec",
            Some(json!({"path": "/bin/ls", "capture-output": true, "arg": ["-l"]})),
        ))
        .unwrap();
        let b = encode(&request(
            "guest-exec",
            Some(json!({"arg": ["-l"], "capture-output": true, "path": "/bin/ls"})),
        ))
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn encoded_request_parses_back() {
        let args = json!({"handle": 7, "count": 4096});
        let bytes = encode(&request("guest-file-read", Some(args.clone()))).unwrap();

        let mut buffer = FrameBuffer::new();
        let Frame::Complete(value) = buffer.accumulate(&bytes) else {
            panic!("request should parse as one document");
        };
        assert_eq!(value, json!({"execute": "guest-file-read", "arguments": args}));
    }

    #[test]
    fn every_split_point_gives_same_reply() {
        let wire = b"{\"return\": {\"pid\": 1234, \"name\": \"caf\xc3\xa9\"}}\n";
        let whole = match FrameBuffer::new().accumulate(wire) {
            Frame::Complete(value) => decode(value).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        };

        for split in 1..wire.len() {
            let mut buffer = FrameBuffer::new();
            let first = buffer.accumulate(&wire[..split]);
            let value = match first {
                Frame::Complete(value) => value,
                Frame::Incomplete => match buffer.accumulate(&wire[split..]) {
                    Frame::Complete(value) => value,
                    other => panic!("split at {split}: unexpected frame {other:?}"),
                },
                Frame::Malformed(e) => panic!("split at {split}: malformed prefix: {e}"),
            };
            assert_eq!(decode(value).unwrap(), whole, "split at {split}");
        }
    }

    #[test]
    fn garbage_is_malformed() {
        let mut buffer = FrameBuffer::new();
        assert!(matches!(buffer.accumulate(b"{\"return\" 1}"), Frame::Malformed(_)));

        let mut buffer = FrameBuffer::new();
        assert!(matches!(buffer.accumulate(b"{\"return\": {}} x"), Frame::Malformed(_)));
    }

    #[test]
    fn empty_and_whitespace_are_incomplete() {
        let mut buffer = FrameBuffer::new();
        assert!(matches!(buffer.try_complete(), Frame::Incomplete));
        assert!(matches!(buffer.accumulate(b" \n"), Frame::Incomplete));
    }

    #[test]
    fn terminator_detection() {
        let mut buffer = FrameBuffer::new();
        buffer.accumulate(b"{\"return\": {\"a\": 1");
        assert!(!buffer.looks_terminated());
        buffer.accumulate(b"} ");
        assert!(buffer.looks_terminated());

        let mut buffer = FrameBuffer::new();
        buffer.accumulate(b"{\"return\":\n");
        assert!(buffer.looks_terminated());

        // A newline left over from the previous reply is not a terminator.
        let mut buffer = FrameBuffer::new();
        buffer.accumulate(b"\n");
        assert!(!buffer.looks_terminated());
        buffer.accumulate(b"{\"return\": {\"a\": 1");
        assert!(!buffer.looks_terminated());
    }

    #[test]
    fn finish_reports_truncated_reply() {
        let mut buffer = FrameBuffer::new();
        buffer.accumulate(b"{\"return\": {\"a\": {}");
        let err = buffer.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("{\"return\": {\"a\": {}"));
    }

    #[test]
    fn excerpt_is_bounded() {
        let mut buffer = FrameBuffer::new();
        buffer.accumulate(&[b'x'; 1000]);
        let excerpt = buffer.excerpt();
        assert_eq!(excerpt.len(), EXCERPT_LEN + 3);
        assert!(excerpt.ends_with("..."));
        assert_eq!(buffer.len(), 1000);
    }

    #[test]
    fn decode_success() {
        let reply = decode(json!({"return": {}})).unwrap();
        assert_eq!(reply, Reply::Success(json!({})));
    }

    #[test]
    fn decode_failure() {
        let reply = decode(json!({"error": {"class": "GenericError", "desc": "command not found"}}))
            .unwrap();
        assert_eq!(
            reply,
            Reply::Failure {
                class: Some("GenericError".into()),
                desc: "command not found".into(),
            }
        );
    }

    #[test]
    fn decode_failure_without_desc() {
        let reply = decode(json!({"error": {}})).unwrap();
        assert!(matches!(reply, Reply::Failure { desc, .. } if desc == "unknown error"));
    }

    #[test]
    fn decode_rejects_both_or_neither() {
        let both = decode(json!({"return": 1, "error": {"desc": "x"}})).unwrap_err();
        assert_eq!(both.kind(), ErrorKind::Protocol);

        let neither = decode(json!({"id": 1})).unwrap_err();
        assert_eq!(neither.kind(), ErrorKind::Protocol);

        let not_object = decode(json!([1, 2])).unwrap_err();
        assert_eq!(not_object.kind(), ErrorKind::Protocol);

        let bad_error = decode(json!({"error": "boom"})).unwrap_err();
        assert_eq!(bad_error.kind(), ErrorKind::Protocol);
    }
}
