//! SSE wire framing.
//!
//! Frames are rendered as raw `text/event-stream` blocks because the frame
//! grammar includes a non-standard `compressed: true` line browsers ignore
//! but custom clients use to detect base64+gzip payloads.

use cmp_events::{CodecError, SseFrameCodec};

/// A renderable SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// `retry:` directive setting the client reconnect delay
    Retry { millis: u64 },
    /// Comment written on the heartbeat interval; never carries an id
    Heartbeat,
    /// A delivered event: `id:`, `event:`, optional `compressed: true`,
    /// then `data:`
    Event {
        id: String,
        event: String,
        data: String,
        compressed: bool,
    },
}

impl SseFrame {
    /// Build an event frame, compressing the payload through the SSE codec
    /// when it exceeds the threshold.
    pub fn event(
        codec: &SseFrameCodec,
        id: impl Into<String>,
        event: impl Into<String>,
        json: &str,
    ) -> Result<Self, CodecError> {
        let (data, compressed) = codec.encode_payload(json)?;
        Ok(SseFrame::Event {
            id: id.into(),
            event: event.into(),
            data,
            compressed,
        })
    }

    /// Render the frame to its wire form, including the blank-line
    /// terminator.
    pub fn render(&self) -> String {
        match self {
            SseFrame::Retry { millis } => format!("retry: {millis}\n\n"),
            SseFrame::Heartbeat => ": heartbeat\n\n".to_string(),
            SseFrame::Event {
                id,
                event,
                data,
                compressed,
            } => {
                if *compressed {
                    format!("id: {id}\nevent: {event}\ncompressed: true\ndata: {data}\n\n")
                } else {
                    format!("id: {id}\nevent: {event}\ndata: {data}\n\n")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_directive() {
        assert_eq!(SseFrame::Retry { millis: 3000 }.render(), "retry: 3000\n\n");
    }

    #[test]
    fn test_heartbeat_is_comment() {
        let rendered = SseFrame::Heartbeat.render();
        assert_eq!(rendered, ": heartbeat\n\n");
        assert!(!rendered.contains("id:"));
    }

    #[test]
    fn test_event_frame_line_order() {
        let codec = SseFrameCodec::new(1024);
        let frame = SseFrame::event(&codec, "42-0", "vm-created", r#"{"vmId":"v1"}"#).unwrap();
        let rendered = frame.render();

        assert_eq!(rendered, "id: 42-0\nevent: vm-created\ndata: {\"vmId\":\"v1\"}\n\n");
        let id_pos = rendered.find("id:").unwrap();
        let event_pos = rendered.find("event:").unwrap();
        let data_pos = rendered.find("data:").unwrap();
        assert!(id_pos < event_pos && event_pos < data_pos);
    }

    #[test]
    fn test_large_event_frame_is_compressed() {
        let codec = SseFrameCodec::new(64);
        let json = serde_json::json!({"blob": "y".repeat(500)}).to_string();
        let frame = SseFrame::event(&codec, "7", "system.notification", &json).unwrap();
        let rendered = frame.render();

        assert!(rendered.contains("compressed: true\n"));
        // data line carries base64, not raw JSON
        assert!(!rendered.contains("yyyy"));

        let data_line = rendered
            .lines()
            .find(|l| l.starts_with("data: "))
            .unwrap()
            .trim_start_matches("data: ");
        let decoded = codec.decode_payload(data_line, true).unwrap();
        assert_eq!(decoded, json);
    }
}
