//! Batch composition for continuous batching.
//!
//! The composer turns the registry's current membership into the
//! rectangular buffers a step consumes: left-padded input ids, the
//! attention mask, and position ids. Steady-state decode advances those
//! buffers by one column per step; any membership or context change marks
//! the batch dirty and forces a full rebuild, discarding the engine's
//! cached state along the way.

use tracing::warn;

use crate::engine::BatchView;
use crate::task::TaskRegistry;

/// Derived batch state, generic over the engine's opaque cache.
#[derive(Debug)]
pub struct BatchComposer<C> {
    pad_id: u32,
    context_limit: usize,
    reserved_margin: usize,

    /// Task ids in row order; stable within one batch epoch.
    slot_ids: Vec<u32>,
    input_ids: Vec<Vec<u32>>,
    attention_mask: Vec<Vec<u8>>,
    position_ids: Vec<Vec<u32>>,

    /// Engine state carried between incremental steps. Valid only for the
    /// current slot ordering.
    cache: Option<C>,
    dirty: bool,
}

impl<C> BatchComposer<C> {
    pub fn new(pad_id: u32, context_limit: usize, reserved_margin: usize) -> Self {
        Self {
            pad_id,
            context_limit,
            reserved_margin,
            slot_ids: Vec::new(),
            input_ids: Vec::new(),
            attention_mask: Vec::new(),
            position_ids: Vec::new(),
            cache: None,
            dirty: true,
        }
    }

    /// Record a membership or context change. The cached engine state is
    /// invalid the moment the slot set changes, so it is dropped here, not
    /// at rebuild time.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
        self.cache = None;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn slot_ids(&self) -> &[u32] {
        &self.slot_ids
    }

    pub fn row_count(&self) -> usize {
        self.slot_ids.len()
    }

    /// Cut any task at the context ceiling down to its most recent
    /// `context_limit / 2` tokens. The cut invalidates cached state; the
    /// truncated context is re-processed from scratch on the next rebuild.
    pub fn enforce_context_window(&mut self, registry: &mut TaskRegistry) {
        let ceiling = self.context_limit - self.reserved_margin;
        let keep = self.context_limit / 2;
        let mut cut_any = false;
        for task in registry.iter_mut() {
            if task.token_ids.len() > ceiling {
                let dropped = task.token_ids.len() - keep;
                task.token_ids.drain(..dropped);
                warn!(
                    task = task.id,
                    dropped, "context ceiling reached; keeping most recent tokens"
                );
                cut_any = true;
            }
        }
        if cut_any {
            self.mark_dirty();
        }
    }

    /// Full rebuild from current registry membership.
    ///
    /// Rows are left-padded to the longest context so all rows share a
    /// trailing alignment. Position ids are the cumulative sum of the mask
    /// minus one, with pad columns clamped to 1 so they can never feed a
    /// negative position into the engine.
    pub fn compose(&mut self, registry: &TaskRegistry) {
        self.slot_ids = registry.ids();
        self.input_ids.clear();
        self.attention_mask.clear();
        self.position_ids.clear();

        let max_len = registry.iter().map(|t| t.token_ids.len()).max().unwrap_or(0);
        for task in registry.iter() {
            let len = task.token_ids.len();
            let pad = max_len - len;

            let mut row = vec![self.pad_id; pad];
            row.extend_from_slice(&task.token_ids);

            let mut mask = vec![0u8; pad];
            mask.extend(std::iter::repeat(1u8).take(len));

            let mut pos = Vec::with_capacity(max_len);
            let mut running = 0u32;
            for &m in &mask {
                if m == 1 {
                    pos.push(running);
                    running += 1;
                } else {
                    pos.push(1);
                }
            }

            self.input_ids.push(row);
            self.attention_mask.push(mask);
            self.position_ids.push(pos);
        }

        self.cache = None;
        self.dirty = false;
    }

    /// Steady-state advance after a successful step: the new token becomes
    /// the single input column, the mask grows by one, and each row's
    /// position is the previous last position plus one.
    pub fn advance(&mut self, next_tokens: &[u32], cache: C) {
        debug_assert_eq!(next_tokens.len(), self.slot_ids.len());
        for (row, &tok) in next_tokens.iter().enumerate() {
            self.input_ids[row] = vec![tok];
            self.attention_mask[row].push(1);
            let last = self.position_ids[row].last().copied().unwrap_or(0);
            self.position_ids[row] = vec![last + 1];
        }
        self.cache = Some(cache);
    }

    /// Hand the cached state to the engine for this step.
    pub fn take_cache(&mut self) -> Option<C> {
        self.cache.take()
    }

    /// Borrow the composed buffers for one step.
    pub fn view(&self) -> BatchView<'_> {
        BatchView {
            slot_ids: &self.slot_ids,
            input_ids: &self.input_ids,
            attention_mask: &self.attention_mask,
            position_ids: &self.position_ids,
        }
    }
}
