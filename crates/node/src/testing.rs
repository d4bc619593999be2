//! Deterministic doubles for the node's external seams.
//!
//! Shipped as a regular module rather than behind `cfg(test)` so the
//! crate-level scenario tests and downstream harnesses can drive a full
//! node without a dispatcher, a tokenizer file, or model weights.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use genloop_common::{NodeError, Result};

use crate::conn::{Connector, LinkTransport};
use crate::engine::{BatchView, StepEngine};
use crate::tokenizer::TokenizerService;

/// Byte-level tokenizer: one token per UTF-8 byte, with id 0 reserved as
/// both pad and end-of-sequence.
pub struct ByteTokenizer;

impl TokenizerService for ByteTokenizer {
    fn encode(&self, text: &str, max_len: usize, _add_special: bool) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = text.bytes().map(u32::from).collect();
        ids.truncate(max_len);
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id != 0)
            .map(|&id| id as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_id(&self) -> u32 {
        0
    }
}

/// Engine that replays a scripted token sequence per task id.
///
/// Each step emits logits with the scripted token as the arg-max, so a
/// greedy policy reproduces the script exactly. Exhausted scripts fall
/// back to token 0, the [`ByteTokenizer`] end-of-sequence id.
pub struct ScriptedEngine {
    vocab_size: usize,
    scripts: HashMap<u32, VecDeque<u32>>,
    /// Ids passed to `abort`, in call order.
    pub aborted: Vec<u32>,
    /// Number of `step` invocations.
    pub steps: usize,
}

impl ScriptedEngine {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            scripts: HashMap::new(),
            aborted: Vec::new(),
            steps: 0,
        }
    }

    /// Queue the tokens a task will produce, one per step.
    pub fn script(&mut self, id: u32, tokens: &[u32]) {
        self.scripts.insert(id, tokens.iter().copied().collect());
    }
}

impl StepEngine for ScriptedEngine {
    type Cache = u32;

    fn step(
        &mut self,
        batch: &BatchView<'_>,
        cache: Option<u32>,
    ) -> Result<(Vec<Vec<f32>>, u32)> {
        self.steps += 1;
        let mut rows = Vec::with_capacity(batch.slot_ids.len());
        for &id in batch.slot_ids {
            let tok = self
                .scripts
                .get_mut(&id)
                .and_then(|script| script.pop_front())
                .unwrap_or(0);
            if (tok as usize) >= self.vocab_size {
                return Err(NodeError::engine(format!("scripted token {tok} out of range")));
            }
            let mut logits = vec![0.0f32; self.vocab_size];
            logits[tok as usize] = 1.0;
            rows.push(logits);
        }
        Ok((rows, cache.map_or(1, |epoch| epoch + 1)))
    }

    fn abort(&mut self, id: u32) {
        self.aborted.push(id);
    }
}

#[derive(Default)]
struct SharedLinkInner {
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    connect_count: usize,
    fail_connects: usize,
    fail_sends: usize,
    fail_recvs: usize,
}

/// State shared between a test and its in-memory links, surviving the
/// reconnects that replace the link objects themselves.
#[derive(Clone, Default)]
pub struct SharedLink {
    inner: Arc<Mutex<SharedLinkInner>>,
}

impl SharedLink {
    /// Queue a payload the node will receive.
    pub fn push_inbound(&self, payload: Vec<u8>) {
        self.inner.lock().unwrap().inbound.push_back(payload);
    }

    /// Payloads the node delivered, in send order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.lock().unwrap().connect_count
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_connects(&self, n: usize) {
        self.inner.lock().unwrap().fail_connects = n;
    }

    /// Fail the next `n` sends.
    pub fn fail_sends(&self, n: usize) {
        self.inner.lock().unwrap().fail_sends = n;
    }

    /// Fail the next `n` receives.
    pub fn fail_recvs(&self, n: usize) {
        self.inner.lock().unwrap().fail_recvs = n;
    }
}

/// In-memory stand-in for the TCP connector.
pub struct MemoryConnector {
    shared: SharedLink,
}

impl MemoryConnector {
    pub fn new(shared: SharedLink) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Link = MemoryLink;

    async fn connect(&self) -> Result<MemoryLink> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.connect_count += 1;
        if inner.fail_connects > 0 {
            inner.fail_connects -= 1;
            return Err(NodeError::transport("scripted connect failure"));
        }
        Ok(MemoryLink {
            shared: self.shared.clone(),
        })
    }
}

/// In-memory link backed by [`SharedLink`].
pub struct MemoryLink {
    shared: SharedLink,
}

#[async_trait]
impl LinkTransport for MemoryLink {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.fail_sends > 0 {
            inner.fail_sends -= 1;
            return Err(NodeError::transport("scripted send failure"));
        }
        inner.sent.push(payload.to_vec());
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Vec<u8>>> {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.fail_recvs > 0 {
                inner.fail_recvs -= 1;
                return Err(NodeError::transport("scripted receive failure"));
            }
            if let Some(payload) = inner.inbound.pop_front() {
                return Ok(Some(payload));
            }
        }
        tokio::time::sleep(wait).await;
        Ok(None)
    }
}
