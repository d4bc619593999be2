//! Tokenizer seam.
//!
//! The core treats tokenization as an opaque text-to-ids service. The
//! concrete implementation is resolved once at startup; everything past
//! `main` only sees this trait.

use std::path::Path;

use genloop_common::{NodeError, Result};

/// Capability interface the core requires of a tokenizer.
pub trait TokenizerService: Send {
    /// Encode text into token ids, hard-truncated to `max_len`.
    fn encode(&self, text: &str, max_len: usize, add_special: bool) -> Result<Vec<u32>>;

    /// Decode token ids back into text.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// The well-known end-of-sequence id.
    fn eos_id(&self) -> u32;
}

/// Hugging Face `tokenizers`-backed implementation.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    eos_id: u32,
}

impl HfTokenizer {
    /// Load a tokenizer.json and resolve the end-of-sequence id.
    pub fn from_file(path: &Path, eos_token: &str) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            NodeError::tokenizer(format!("failed to load {}: {}", path.display(), e))
        })?;
        let eos_id = inner.token_to_id(eos_token).ok_or_else(|| {
            NodeError::tokenizer(format!("tokenizer has no {eos_token} token"))
        })?;
        Ok(Self { inner, eos_id })
    }

    /// Vocabulary size including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TokenizerService for HfTokenizer {
    fn encode(&self, text: &str, max_len: usize, add_special: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special)
            .map_err(|e| NodeError::tokenizer(e.to_string()))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(max_len);
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| NodeError::tokenizer(e.to_string()))
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }
}
