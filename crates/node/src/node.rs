//! The node control loop.
//!
//! One cooperative loop owns every piece of mutable state: drain at most
//! one dispatcher message per tick (bounded wait, shorter when tasks are
//! active), apply admits and cancels, run one batch step when tasks exist,
//! then flush queued frames. Transport and admission failures are consumed
//! here; the loop itself runs indefinitely.

use std::time::Instant;

use genloop_common::config::StreamMode;
use genloop_common::{NodeConfig, Result, METRICS};
use genloop_proto::{DispatcherMessage, Frame, GenerationRequest};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use crate::batch::BatchComposer;
use crate::conn::{ConnectionManager, Connector};
use crate::engine::StepEngine;
use crate::prompt::PromptBuilder;
use crate::sampler::{self, SamplingPolicy};
use crate::stream::{OutputStreamer, StreamState};
use crate::task::{Task, TaskRegistry};
use crate::tokenizer::TokenizerService;

/// A worker node bound to one dispatcher connection.
pub struct Node<E: StepEngine, C: Connector> {
    config: NodeConfig,
    tokenizer: Box<dyn TokenizerService>,
    engine: E,
    conn: ConnectionManager<C>,
    registry: TaskRegistry,
    composer: BatchComposer<E::Cache>,
    prompts: PromptBuilder,
    streamer: OutputStreamer,
    rng: StdRng,
    last_keepalive: Option<tokio::time::Instant>,
}

impl<E: StepEngine, C: Connector> Node<E, C> {
    pub fn new(config: NodeConfig, tokenizer: Box<dyn TokenizerService>, engine: E, connector: C) -> Self {
        let conn = ConnectionManager::new(connector, config.reconnect_backoff());
        let composer = BatchComposer::new(config.pad_id, config.context_limit, config.reserved_margin);
        let prompts = PromptBuilder::new(
            config.prompt_format,
            config.context_limit,
            config.reserved_margin,
        );
        let streamer = OutputStreamer::new(config.flush_threshold);
        Self {
            config,
            tokenizer,
            engine,
            conn,
            registry: TaskRegistry::new(),
            composer,
            prompts,
            streamer,
            rng: StdRng::from_entropy(),
            last_keepalive: None,
        }
    }

    /// Reseed the sampling RNG; used by tests for reproducible draws.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Currently active task count.
    pub fn active_tasks(&self) -> usize {
        self.registry.len()
    }

    /// Rows in the current batch composition.
    pub fn batch_rows(&self) -> usize {
        self.composer.row_count()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Run the control loop indefinitely.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            node = %self.config.node_name,
            model = %self.config.advertised_model(),
            "node starting"
        );
        self.conn.try_connect().await;
        loop {
            self.tick().await;
        }
    }

    /// One pass of the control loop. Public so tests can drive the loop
    /// deterministically.
    pub async fn tick(&mut self) {
        self.keepalive_if_due().await;

        let wait = self.config.recv_timeout(!self.registry.is_empty());
        if let Some(payload) = self.conn.recv(wait).await {
            self.handle_payload(&payload);
        }

        if !self.registry.is_empty() {
            self.step_once();
        }

        self.flush().await;
    }

    /// Empty frame on a fixed cadence, independent of task activity. The
    /// first tick sends one immediately; delivery is deliver-or-retry, so
    /// a due keepalive is also what drives reconnection when idle.
    async fn keepalive_if_due(&mut self) {
        let due = self
            .last_keepalive
            .map_or(true, |at| at.elapsed() >= self.config.keepalive());
        if due {
            self.conn.send(&Frame::Keepalive.encode()).await;
            METRICS.frames_sent_total.inc();
            self.last_keepalive = Some(tokio::time::Instant::now());
        }
    }

    fn handle_payload(&mut self, payload: &[u8]) {
        match DispatcherMessage::parse(payload) {
            Ok(DispatcherMessage::Keepalive) => {}
            Ok(DispatcherMessage::Cancel { id }) => self.cancel(id),
            Ok(DispatcherMessage::Request(req)) => self.admit(*req),
            Err(e) => warn!(error = %e, "discarding malformed dispatcher message"),
        }
    }

    /// Admit a generation request. Duplicate ids and requests that fail
    /// the prompt budget are dropped without a frame; silence is the
    /// failure signal the dispatcher acts on.
    fn admit(&mut self, req: GenerationRequest) {
        if self.registry.contains(req.id) {
            debug!(task = req.id, "duplicate admit ignored");
            return;
        }

        let token_ids = match self.prompts.build(
            self.tokenizer.as_ref(),
            &req.system,
            &req.messages,
            req.max_new_tokens as usize,
        ) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(task = req.id, error = %e, "request dropped at admission");
                METRICS.tasks_rejected_total.inc();
                return;
            }
        };

        let task = Task::new(
            req.id,
            token_ids,
            req.max_new_tokens,
            SamplingPolicy::new(req.temperature),
            StreamState::for_mode(self.config.stream_mode),
        );
        info!(
            task = req.id,
            prompt_tokens = task.token_ids.len(),
            budget = req.max_new_tokens,
            temperature = req.temperature,
            "task admitted"
        );
        self.registry.insert(task);
        self.composer.mark_dirty();
        METRICS.tasks_admitted_total.inc();
        METRICS.active_tasks.set(self.registry.len() as i64);
    }

    /// Remove a task and release engine-side state. Unknown ids are a
    /// no-op.
    fn cancel(&mut self, id: u32) {
        match self.registry.remove(id) {
            Some(_) => {
                self.engine.abort(id);
                self.composer.mark_dirty();
                info!(task = id, "task cancelled");
                METRICS.tasks_cancelled_total.inc();
                METRICS.active_tasks.set(self.registry.len() as i64);
            }
            None => debug!(task = id, "cancel for unknown task ignored"),
        }
    }

    /// One batch step: recompose if dirty, invoke the engine, sample each
    /// row under its own policy, advance the batch, stream new text, and
    /// evict completed tasks.
    fn step_once(&mut self) {
        self.composer.enforce_context_window(&mut self.registry);

        if self.composer.is_dirty() {
            self.composer.compose(&self.registry);
            METRICS.batch_rebuilds_total.inc();
        }
        METRICS.batch_size.observe(self.composer.row_count() as f64);

        let started = Instant::now();
        let cache = self.composer.take_cache();
        let (logits, new_cache) = match self.engine.step(&self.composer.view(), cache) {
            Ok(out) => out,
            Err(e) => {
                error!(error = %e, "step engine failure; forcing a rebuild");
                self.composer.mark_dirty();
                return;
            }
        };
        METRICS.step_duration.observe(started.elapsed().as_secs_f64());

        let slot_ids = self.composer.slot_ids().to_vec();
        if logits.len() != slot_ids.len() {
            error!(
                rows = logits.len(),
                slots = slot_ids.len(),
                "engine returned a mismatched row count; forcing a rebuild"
            );
            self.composer.mark_dirty();
            return;
        }

        // Sample every row first; a stale slot aborts the whole step since
        // the composition no longer matches the registry.
        let mut next_tokens = Vec::with_capacity(slot_ids.len());
        let mut stale = false;
        for (row, &id) in slot_ids.iter().enumerate() {
            match self.registry.get(id) {
                Some(task) => {
                    next_tokens.push(sampler::sample(&logits[row], &task.policy, &mut self.rng));
                }
                None => {
                    warn!(task = id, "dropping step output for unknown task");
                    self.engine.abort(id);
                    stale = true;
                }
            }
        }
        if stale {
            self.composer.mark_dirty();
            return;
        }

        self.composer.advance(&next_tokens, new_cache);

        let eos = self.tokenizer.eos_id();
        let mut finished = Vec::new();
        for (&id, &tok) in slot_ids.iter().zip(&next_tokens) {
            let Some(task) = self.registry.get_mut(id) else {
                continue;
            };
            task.remaining_budget = task.remaining_budget.saturating_sub(1);
            task.tokens_generated += 1;
            METRICS.tokens_generated_total.inc();

            let hit_eos = tok == eos;
            if !hit_eos {
                task.token_ids.push(tok);
                match self.config.stream_mode {
                    StreamMode::Chunk => match self.tokenizer.decode(&[tok]) {
                        Ok(piece) => self.streamer.push(id, &mut task.stream, &piece),
                        Err(e) => warn!(task = id, error = %e, "failed to decode token"),
                    },
                    StreamMode::Diff => {
                        // Decode the cumulative generated text; after a
                        // sliding-window cut this may diverge from the
                        // watermark, which the streamer tolerates.
                        let generated = (task.tokens_generated as usize).min(task.token_ids.len());
                        let start = task.token_ids.len() - generated;
                        match self.tokenizer.decode(&task.token_ids[start..]) {
                            Ok(text) => self.streamer.push(id, &mut task.stream, &text),
                            Err(e) => warn!(task = id, error = %e, "failed to decode output"),
                        }
                    }
                }
            }

            if hit_eos || task.remaining_budget == 0 {
                finished.push(id);
            }
        }

        for id in finished {
            if let Some(mut task) = self.registry.remove(id) {
                self.streamer.finish(id, &mut task.stream);
                self.composer.mark_dirty();
                info!(
                    task = id,
                    tokens = task.tokens_generated,
                    elapsed_ms = task.created_at.elapsed().as_millis() as u64,
                    "task finished"
                );
                METRICS.tasks_completed_total.inc();
                METRICS.active_tasks.set(self.registry.len() as i64);
            }
        }
    }

    /// Deliver queued frames in emission order. Frames survive
    /// disconnection in the queue; `send` retries until each is delivered.
    async fn flush(&mut self) {
        while let Some(frame) = self.streamer.pop() {
            self.conn.send(&frame.encode()).await;
            METRICS.frames_sent_total.inc();
        }
    }
}
