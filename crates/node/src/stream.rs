//! Output accumulation and the flush policy.
//!
//! Newly produced text is emitted exactly once, in order, under one of two
//! disciplines: a byte-threshold chunk buffer, or a watermark diff over
//! cumulative decoded snapshots. Completion always queues a zero-length
//! end-of-stream frame as the last frame for the task.

use std::collections::VecDeque;

use genloop_common::config::StreamMode;
use genloop_proto::Frame;
use tracing::warn;

/// Per-task emission state.
#[derive(Debug)]
pub enum StreamState {
    /// Watermark over the cumulative decoded text sent so far.
    Diff { watermark: String },

    /// Buffer of decoded fragments awaiting a flush.
    Chunk { buf: String },
}

impl StreamState {
    pub fn chunk() -> Self {
        StreamState::Chunk { buf: String::new() }
    }

    pub fn diff() -> Self {
        StreamState::Diff {
            watermark: String::new(),
        }
    }

    pub fn for_mode(mode: StreamMode) -> Self {
        match mode {
            StreamMode::Chunk => Self::chunk(),
            StreamMode::Diff => Self::diff(),
        }
    }
}

/// Queues outbound frames for the control loop to flush after each tick.
#[derive(Debug)]
pub struct OutputStreamer {
    flush_threshold: usize,
    queue: VecDeque<Frame>,
}

impl OutputStreamer {
    pub fn new(flush_threshold: usize) -> Self {
        Self {
            flush_threshold,
            queue: VecDeque::new(),
        }
    }

    /// Feed one step's text for a task.
    ///
    /// Under the chunk discipline `text` is the newly decoded fragment;
    /// under the diff discipline it is the full decoded output so far.
    pub fn push(&mut self, id: u32, state: &mut StreamState, text: &str) {
        match state {
            StreamState::Chunk { buf } => {
                buf.push_str(text);
                if buf.len() > self.flush_threshold {
                    self.queue.push_back(Frame::Text {
                        id,
                        text: std::mem::take(buf),
                    });
                }
            }
            StreamState::Diff { watermark } => {
                if text.len() <= watermark.len() {
                    // Snapshot did not grow; nothing new to emit.
                    return;
                }
                if !text.starts_with(watermark.as_str()) {
                    warn!(
                        task = id,
                        "cumulative output no longer extends the previous watermark"
                    );
                }
                match text.get(watermark.len()..) {
                    Some(diff) if !diff.is_empty() => {
                        self.queue.push_back(Frame::Text {
                            id,
                            text: diff.to_string(),
                        });
                    }
                    // Length split landed inside a multi-byte character of a
                    // divergent snapshot; skip this step rather than emit
                    // mangled bytes.
                    _ => {}
                }
                *watermark = text.to_string();
            }
        }
    }

    /// Flush any buffered remainder, then queue the end-of-stream marker.
    pub fn finish(&mut self, id: u32, state: &mut StreamState) {
        if let StreamState::Chunk { buf } = state {
            if !buf.is_empty() {
                self.queue.push_back(Frame::Text {
                    id,
                    text: std::mem::take(buf),
                });
            }
        }
        self.queue.push_back(Frame::End { id });
    }

    /// Next frame to deliver, in emission order.
    pub fn pop(&mut self) -> Option<Frame> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
