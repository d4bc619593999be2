//! The step-engine seam.
//!
//! The forward pass is opaque to the node: once per tick it receives the
//! composed batch and returns next-token logits per slot plus whatever
//! state it wants threaded into the following step. The node never
//! inspects that state; it only drops it when the batch is rebuilt.

pub mod local;

use genloop_common::Result;

pub use local::LocalEngine;

/// One composed batch, borrowed for the duration of a step.
///
/// Each buffer is rectangular on its own. On a rebuild step all three
/// share the full padded context width; on incremental steps `input_ids`
/// and `position_ids` carry a single column while `attention_mask` keeps
/// the full context width.
#[derive(Debug)]
pub struct BatchView<'a> {
    /// Task ids in row order.
    pub slot_ids: &'a [u32],
    pub input_ids: &'a [Vec<u32>],
    pub attention_mask: &'a [Vec<u8>],
    pub position_ids: &'a [Vec<u32>],
}

/// Autoregressive forward pass, invoked synchronously once per tick.
pub trait StepEngine {
    /// Engine-private state carried between incremental steps. Valid only
    /// for one slot ordering; the composer drops it on any rebuild.
    type Cache;

    /// Run one forward step. Returns one logits row per slot, in slot
    /// order, and the cache for the next step.
    fn step(
        &mut self,
        batch: &BatchView<'_>,
        cache: Option<Self::Cache>,
    ) -> Result<(Vec<Vec<f32>>, Self::Cache)>;

    /// Release engine-side state for one task (cancelled or unknown id).
    fn abort(&mut self, id: u32);
}
