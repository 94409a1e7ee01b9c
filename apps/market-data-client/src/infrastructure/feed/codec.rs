//! Feed Codec
//!
//! Decodes server frames into status messages and validated
//! [`StreamEvent`]s, and encodes client frames.
//!
//! Validation is per item: a malformed element is reported in
//! [`DecodedFrame::rejected`] and the rest of the frame is still delivered.
//! Only a frame that is not JSON at all fails as a whole.

use super::messages::{ClientAction, MessageError, ServerMessage, StatusMessage};
use crate::domain::streaming::StreamEvent;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is neither a JSON array nor an object.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),

    /// Element did not match any known message shape.
    #[error("malformed {kind} message: {reason}")]
    Malformed {
        /// `ev` value, or `unknown`.
        kind: String,
        /// Parse failure.
        reason: String,
    },

    /// Element parsed but failed validation.
    #[error("invalid message: {0}")]
    Invalid(#[from] MessageError),
}

impl CodecError {
    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Json(_) | Self::InvalidFormat(_) => "frame",
            Self::Malformed { .. } => "malformed",
            Self::Invalid(_) => "invalid",
        }
    }
}

/// Decoded frame element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    /// Control message.
    Status(StatusMessage),
    /// Validated market data event.
    Event(StreamEvent),
}

/// Result of decoding one frame.
#[derive(Debug, Default)]
pub struct DecodedFrame {
    /// Accepted items in frame order.
    pub items: Vec<FeedItem>,
    /// Rejected elements.
    pub rejected: Vec<CodecError>,
    /// Elements of event types this client does not consume.
    pub ignored: usize,
}

/// JSON codec for the push feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeedCodec;

impl FeedCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error only if the frame is not a JSON array or object.
    pub fn decode(&self, text: &str) -> Result<DecodedFrame, CodecError> {
        let trimmed = text.trim();
        let values: Vec<serde_json::Value> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed)?
        } else if trimmed.starts_with('{') {
            vec![serde_json::from_str(trimmed)?]
        } else {
            let preview: String = trimmed.chars().take(50).collect();
            return Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {preview}..."
            )));
        };

        let mut frame = DecodedFrame::default();
        for value in values {
            match Self::decode_item(value) {
                Ok(Some(item)) => frame.items.push(item),
                Ok(None) => frame.ignored += 1,
                Err(e) => frame.rejected.push(e),
            }
        }
        Ok(frame)
    }

    fn decode_item(value: serde_json::Value) -> Result<Option<FeedItem>, CodecError> {
        let kind = value
            .get("ev")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let message: ServerMessage =
            serde_json::from_value(value).map_err(|e| CodecError::Malformed {
                kind,
                reason: e.to_string(),
            })?;

        let event = match message {
            ServerMessage::Status(status) => return Ok(Some(FeedItem::Status(status))),
            ServerMessage::Unknown => return Ok(None),
            ServerMessage::Trade(trade) => StreamEvent::try_from(trade)?,
            ServerMessage::Quote(quote) => StreamEvent::try_from(quote)?,
            ServerMessage::Aggregate(bar) => StreamEvent::try_from(bar)?,
        };
        Ok(Some(FeedItem::Event(event)))
    }

    /// Encode a client frame.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, action: &ClientAction) -> Result<String, CodecError> {
        Ok(serde_json::to_string(action)?)
    }
}
