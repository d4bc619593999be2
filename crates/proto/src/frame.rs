//! Binary frames sent from the node to the dispatcher.
//!
//! All three frame kinds share one layout: an optional 4-byte big-endian
//! task id followed by UTF-8 payload bytes.
//!
//! - keepalive: zero-length payload, no task id
//! - partial output: task id + non-empty text
//! - end-of-stream: task id alone

use thiserror::Error;

/// Errors raised while decoding an inbound frame.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than the 4-byte task id prefix.
    #[error("frame of {0} bytes is too short to carry a task id")]
    TooShort(usize),

    /// Payload bytes were not valid UTF-8.
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,
}

/// A single node-to-dispatcher frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Empty liveness frame, sent on a fixed cadence.
    Keepalive,

    /// Newly produced text for one task.
    Text { id: u32, text: String },

    /// Explicit end-of-stream marker; always the last frame for its id.
    End { id: u32 },
}

impl Frame {
    /// Serialize into the on-wire byte layout.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Keepalive => Vec::new(),
            Frame::Text { id, text } => {
                let mut buf = Vec::with_capacity(4 + text.len());
                buf.extend_from_slice(&id.to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
                buf
            }
            Frame::End { id } => id.to_be_bytes().to_vec(),
        }
    }

    /// Decode a frame as the dispatcher does. Lives next to [`encode`] so
    /// the two halves of the codec cannot drift apart.
    ///
    /// [`encode`]: Frame::encode
    pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.is_empty() {
            return Ok(Frame::Keepalive);
        }
        if buf.len() < 4 {
            return Err(FrameError::TooShort(buf.len()));
        }
        let id = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if buf.len() == 4 {
            return Ok(Frame::End { id });
        }
        let text = std::str::from_utf8(&buf[4..])
            .map_err(|_| FrameError::InvalidUtf8)?
            .to_string();
        Ok(Frame::Text { id, text })
    }

    /// Task id carried by this frame, if any.
    pub fn task_id(&self) -> Option<u32> {
        match self {
            Frame::Keepalive => None,
            Frame::Text { id, .. } | Frame::End { id } => Some(*id),
        }
    }
}
