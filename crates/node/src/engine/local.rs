//! CPU reference engine.
//!
//! A deterministic stand-in for a real checkpoint: seeded embedding and
//! projection tables produce shape-correct logits from each row's last
//! token, so the node runs end-to-end without model weights. A production
//! deployment plugs a real model server in behind the same trait.

use candle_core::{Device, Tensor};
use genloop_common::{NodeError, Result};
use tracing::debug;

use super::{BatchView, StepEngine};

/// Per-slot context lengths observed at the previous step. Logits here
/// depend only on each row's final token, so this is the entire state a
/// step needs to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCache {
    context_lens: Vec<usize>,
}

/// Candle-backed engine computing `embed(last_token) @ proj` per row.
pub struct LocalEngine {
    vocab_size: usize,
    embed: Tensor,
    proj: Tensor,
    device: Device,
}

impl LocalEngine {
    pub fn new(vocab_size: usize, hidden_dim: usize, seed: u64) -> Result<Self> {
        let device = Device::Cpu;
        let embed = seeded_table(vocab_size, hidden_dim, seed, &device)?;
        let proj = seeded_table(hidden_dim, vocab_size, seed ^ 0x9e37_79b9_7f4a_7c15, &device)?;
        Ok(Self {
            vocab_size,
            embed,
            proj,
            device,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn validate(&self, batch: &BatchView<'_>, cache: Option<&LocalCache>) -> Result<()> {
        let rows = batch.slot_ids.len();
        if batch.input_ids.len() != rows
            || batch.attention_mask.len() != rows
            || batch.position_ids.len() != rows
        {
            return Err(NodeError::engine(format!(
                "batch buffers disagree on row count (slots={rows})"
            )));
        }
        for row in 0..rows {
            let cols = batch.input_ids[row].len();
            if cols == 0 {
                return Err(NodeError::engine(format!("row {row} has no input column")));
            }
            if batch.position_ids[row].len() != cols {
                return Err(NodeError::engine(format!(
                    "row {row} position width {} does not match input width {cols}",
                    batch.position_ids[row].len()
                )));
            }
            if batch.attention_mask[row].len() < cols {
                return Err(NodeError::engine(format!(
                    "row {row} mask is narrower than its input"
                )));
            }
        }
        if let Some(cache) = cache {
            // Cached state only makes sense for the slot ordering it was
            // produced under.
            if cache.context_lens.len() != rows {
                return Err(NodeError::engine(format!(
                    "cached state covers {} rows but the batch has {rows}",
                    cache.context_lens.len()
                )));
            }
        }
        Ok(())
    }
}

impl StepEngine for LocalEngine {
    type Cache = LocalCache;

    fn step(
        &mut self,
        batch: &BatchView<'_>,
        cache: Option<LocalCache>,
    ) -> Result<(Vec<Vec<f32>>, LocalCache)> {
        self.validate(batch, cache.as_ref())?;

        let rows = batch.slot_ids.len();
        let mut last_tokens = Vec::with_capacity(rows);
        for row in batch.input_ids {
            // Rows are left-padded, so the final column is always real.
            let &tok = row.last().ok_or_else(|| NodeError::engine("empty row"))?;
            if (tok as usize) >= self.vocab_size {
                return Err(NodeError::engine(format!(
                    "token {tok} outside vocabulary of {}",
                    self.vocab_size
                )));
            }
            last_tokens.push(tok);
        }

        let idx = Tensor::from_vec(last_tokens, rows, &self.device)
            .map_err(|e| NodeError::engine(e.to_string()))?;
        let hidden = self
            .embed
            .index_select(&idx, 0)
            .map_err(|e| NodeError::engine(e.to_string()))?;
        let logits = hidden
            .matmul(&self.proj)
            .map_err(|e| NodeError::engine(e.to_string()))?
            .to_vec2::<f32>()
            .map_err(|e| NodeError::engine(e.to_string()))?;

        let context_lens = batch
            .attention_mask
            .iter()
            .map(|mask| mask.iter().filter(|&&m| m == 1).count())
            .collect();
        Ok((logits, LocalCache { context_lens }))
    }

    fn abort(&mut self, id: u32) {
        // All per-task state lives in the composer-owned cache.
        debug!(task = id, "abort requested; no engine-side state to release");
    }
}

/// Deterministic pseudo-random table so two engines with one seed agree.
fn seeded_table(rows: usize, cols: usize, seed: u64, device: &Device) -> Result<Tensor> {
    let mut state = seed | 1;
    let mut data = Vec::with_capacity(rows * cols);
    for _ in 0..rows * cols {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        data.push(((state >> 40) as f32) / (1u64 << 24) as f32 - 0.5);
    }
    Tensor::from_vec(data, (rows, cols), device).map_err(|e| NodeError::engine(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch<'a>(
        slot_ids: &'a [u32],
        input_ids: &'a [Vec<u32>],
        attention_mask: &'a [Vec<u8>],
        position_ids: &'a [Vec<u32>],
    ) -> BatchView<'a> {
        BatchView {
            slot_ids,
            input_ids,
            attention_mask,
            position_ids,
        }
    }

    #[test]
    fn test_step_returns_one_logits_row_per_slot() {
        let mut engine = LocalEngine::new(32, 8, 0xbeef).unwrap();
        let slots = [1u32, 2];
        let inputs = vec![vec![0, 0, 3, 4], vec![5, 6, 7, 8]];
        let masks = vec![vec![0, 0, 1, 1], vec![1, 1, 1, 1]];
        let positions = vec![vec![1, 1, 0, 1], vec![0, 1, 2, 3]];

        let (logits, cache) = engine
            .step(&batch(&slots, &inputs, &masks, &positions), None)
            .unwrap();
        assert_eq!(logits.len(), 2);
        assert_eq!(logits[0].len(), 32);
        assert_eq!(cache.context_lens, vec![2, 4]);
    }

    #[test]
    fn test_same_seed_same_logits() {
        let mut a = LocalEngine::new(16, 4, 7).unwrap();
        let mut b = LocalEngine::new(16, 4, 7).unwrap();
        let slots = [1u32];
        let inputs = vec![vec![3]];
        let masks = vec![vec![1]];
        let positions = vec![vec![0]];

        let (la, _) = a.step(&batch(&slots, &inputs, &masks, &positions), None).unwrap();
        let (lb, _) = b.step(&batch(&slots, &inputs, &masks, &positions), None).unwrap();
        assert_eq!(la, lb);
    }

    #[test]
    fn test_stale_cache_is_rejected() {
        let mut engine = LocalEngine::new(16, 4, 7).unwrap();
        let slots = [1u32, 2];
        let inputs = vec![vec![3], vec![4]];
        let masks = vec![vec![1], vec![1]];
        let positions = vec![vec![0], vec![0]];
        let (_, cache) = engine
            .step(&batch(&slots, &inputs, &masks, &positions), None)
            .unwrap();

        // One slot left; the two-row cache no longer applies.
        let slots = [1u32];
        let inputs = vec![vec![3]];
        let masks = vec![vec![1]];
        let positions = vec![vec![0]];
        let err = engine.step(&batch(&slots, &inputs, &masks, &positions), Some(cache));
        assert!(err.is_err());
    }

    #[test]
    fn test_out_of_vocabulary_token_is_an_error() {
        let mut engine = LocalEngine::new(16, 4, 7).unwrap();
        let slots = [1u32];
        let inputs = vec![vec![99]];
        let masks = vec![vec![1]];
        let positions = vec![vec![0]];
        assert!(engine
            .step(&batch(&slots, &inputs, &masks, &positions), None)
            .is_err());
    }
}
