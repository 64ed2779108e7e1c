//! Voice-turn wire messages
//!
//! Outbound traffic is a small fixed set of text markers plus binary audio.
//! Inbound traffic is untyped text: control messages carry a string prefix
//! and synthesized speech arrives as bare base64 with no tag at all.
//! `Inbound::parse` is the only place that interprets that format; the rest
//! of the crate works with the tagged enum.


use crate::transport::WireMessage;

pub const SESSION_PREFIX: &str = "__session__:";
pub const STREAM_PREFIX: &str = "__stream__:";
pub const MIC_PREFIX: &str = "__mic__:";
pub const END_OF_UTTERANCE: &str = "__end__";

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// First message on a link when a session id is already known
    SessionResume(String),
    /// Streaming mode: raw PCM16LE mono samples of one capture frame
    Audio(Vec<u8>),
    /// Batch mode: the whole utterance as one encoded clip
    Clip(Vec<u8>),
    EndOfUtterance,
}

impl Outbound {
    pub fn into_wire(self) -> WireMessage {
        match self {
            Outbound::SessionResume(id) => WireMessage::Text(format!("{}{}", SESSION_PREFIX, id)),
            Outbound::Audio(pcm) => WireMessage::Binary(pcm),
            Outbound::Clip(encoded) => WireMessage::Binary(encoded),
            Outbound::EndOfUtterance => WireMessage::Text(END_OF_UTTERANCE.to_string()),
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::SessionResume(_) => "session-resume",
            Outbound::Audio(_) => "audio",
            Outbound::Clip(_) => "clip",
            Outbound::EndOfUtterance => "end-of-utterance",
        }
    }
}

/// Server to client, after classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Server-issued session token
    SessionAssigned(String),
    /// Incremental reply text
    StreamToken(String),
    /// Recognized user transcript (replaces the previous one)
    MicTranscript(String),
    /// Base64-encoded synthesized speech
    AudioPayload(String),
    /// Matched nothing; carries a short description for logging
    Unrecognized(String),
}

impl Inbound {
    /// Classify a text message, checking prefixes in fixed precedence order
    pub fn parse(text: &str) -> Self {
        if let Some(id) = text.strip_prefix(SESSION_PREFIX) {
            if id.is_empty() {
                return Inbound::Unrecognized("empty session token".to_string());
            }
            return Inbound::SessionAssigned(id.to_string());
        }

        if let Some(token) = text.strip_prefix(STREAM_PREFIX) {
            return Inbound::StreamToken(token.to_string());
        }

        if let Some(transcript) = text.strip_prefix(MIC_PREFIX) {
            return Inbound::MicTranscript(transcript.to_string());
        }

        if is_base64_text(text) {
            return Inbound::AudioPayload(text.to_string());
        }

        Inbound::Unrecognized(preview(text))
    }

    pub fn from_wire(message: WireMessage) -> Self {
        match message {
            WireMessage::Text(text) => Self::parse(&text),
            WireMessage::Binary(bytes) => {
                Inbound::Unrecognized(format!("binary message ({} bytes)", bytes.len()))
            }
        }
    }
}

/// Non-empty and made only of the standard base64 alphabet
fn is_base64_text(text: &str) -> bool {
    !text.is_empty()
        && text
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

fn preview(text: &str) -> String {
    const MAX: usize = 48;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_precedence() {
        // A stream token that itself looks like a mic marker stays a stream token
        assert_eq!(
            Inbound::parse("__stream__:__mic__:x"),
            Inbound::StreamToken("__mic__:x".to_string())
        );
        assert_eq!(
            Inbound::parse("__session__:abc123"),
            Inbound::SessionAssigned("abc123".to_string())
        );
        assert_eq!(
            Inbound::parse("__mic__:what time is it"),
            Inbound::MicTranscript("what time is it".to_string())
        );
    }

    #[test]
    fn test_stream_token_keeps_whitespace() {
        assert_eq!(Inbound::parse("__stream__: world"), Inbound::StreamToken(" world".to_string()));
        assert_eq!(Inbound::parse("__stream__:"), Inbound::StreamToken(String::new()));
    }

    #[test]
    fn test_bare_base64_is_audio() {
        assert_eq!(
            Inbound::parse("UklGRiQAAABXQVZF"),
            Inbound::AudioPayload("UklGRiQAAABXQVZF".to_string())
        );
    }

    #[test]
    fn test_plain_text_is_unrecognized() {
        // A space falls outside the base64 alphabet
        assert!(matches!(Inbound::parse("hello there"), Inbound::Unrecognized(_)));
        assert!(matches!(Inbound::parse(""), Inbound::Unrecognized(_)));
        assert!(matches!(Inbound::parse("__session__:"), Inbound::Unrecognized(_)));
    }

    #[test]
    fn test_binary_inbound_is_unrecognized() {
        let inbound = Inbound::from_wire(WireMessage::Binary(vec![1, 2, 3]));
        assert_eq!(inbound, Inbound::Unrecognized("binary message (3 bytes)".to_string()));
    }

    #[test]
    fn test_outbound_wire_forms() {
        assert_eq!(
            Outbound::SessionResume("S1".to_string()).into_wire(),
            WireMessage::Text("__session__:S1".to_string())
        );
        assert_eq!(
            Outbound::EndOfUtterance.into_wire(),
            WireMessage::Text("__end__".to_string())
        );
        assert_eq!(
            Outbound::Audio(vec![1, 0]).into_wire(),
            WireMessage::Binary(vec![1, 0])
        );
    }
}
