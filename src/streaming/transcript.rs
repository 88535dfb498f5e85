//! Transcript message decoding
//!
//! Text frames from the service carry JSON with either a final transcript
//! (`"text"`) or an interim one (`"partial"`). Anything else on the text
//! channel is a protocol error for that one message only.

use serde::Deserialize;

use super::StreamError;

/// One decoded transcript update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

#[derive(Debug, Deserialize)]
struct InboundText {
    text: Option<String>,
    partial: Option<String>,
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for frames with no usable content (empty or
/// whitespace-only transcripts), which do not count as speech activity.
/// `text` wins over `partial` when both are present.
pub fn parse_transcript(raw: &str) -> Result<Option<TranscriptEvent>, StreamError> {
    let inbound: InboundText =
        serde_json::from_str(raw).map_err(|e| StreamError::Protocol(e.to_string()))?;

    let (content, is_final) = match (inbound.text, inbound.partial) {
        (Some(text), _) => (text, true),
        (None, Some(partial)) => (partial, false),
        (None, None) => return Ok(None),
    };

    if content.trim().is_empty() {
        return Ok(None);
    }

    Ok(Some(TranscriptEvent {
        text: content,
        is_final,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_transcript() {
        let event = parse_transcript(r#"{"text":"hello world"}"#).unwrap().unwrap();
        assert_eq!(event.text, "hello world");
        assert!(event.is_final);
    }

    #[test]
    fn partial_transcript() {
        let event = parse_transcript(r#"{"partial":"hel"}"#).unwrap().unwrap();
        assert_eq!(event.text, "hel");
        assert!(!event.is_final);
    }

    #[test]
    fn text_wins_over_partial() {
        let event = parse_transcript(r#"{"text":"done","partial":"don"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event.text, "done");
        assert!(event.is_final);
    }

    #[test]
    fn empty_object_has_no_content() {
        assert_eq!(parse_transcript("{}").unwrap(), None);
    }

    #[test]
    fn whitespace_only_has_no_content() {
        assert_eq!(parse_transcript(r#"{"text":"   "}"#).unwrap(), None);
        assert_eq!(parse_transcript(r#"{"partial":""}"#).unwrap(), None);
    }

    #[test]
    fn malformed_json_is_a_protocol_error() {
        assert!(matches!(
            parse_transcript("not json"),
            Err(StreamError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let event = parse_transcript(r#"{"text":"ok","confidence":0.9}"#)
            .unwrap()
            .unwrap();
        assert_eq!(event.text, "ok");
    }
}
