//! Command Batcher
//!
//! Groups outgoing commands into network batches without reordering them.
//!
//! ## Flush triggers
//!
//! - `window_ms == 0`: every enqueue is sent on its own, no timer is armed.
//! - The first enqueue after idle arms a fixed window; expiry flushes the
//!   whole queue. Later enqueues do not extend the window.
//! - Reaching `max_batch_size` flushes immediately, ahead of the window.
//! - An immediate command type flushes the queue including itself.
//! - `flush()` flushes on demand.
//!
//! After `destroy()` nothing reaches the sink again.

use std::collections::{BTreeSet, VecDeque};
use std::mem;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::clock::{Clock, Millis};
use crate::core::scheduler::{TimerSlot, TimerToken};
use crate::game::command::BatchedCommand;

/// Default cap on commands per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 16;

/// Batching configuration.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Batch window in ms (0 = send every command on its own)
    pub window_ms: Millis,
    /// Flush as soon as this many commands are queued (clamped to at least 1)
    pub max_batch_size: usize,
    /// Command types that flush the queue, themselves included
    pub immediate_commands: BTreeSet<String>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            window_ms: 0,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            immediate_commands: BTreeSet::new(),
        }
    }
}

impl BatcherConfig {
    /// Config with a batch window.
    pub fn with_window(window_ms: Millis, max_batch_size: usize) -> Self {
        Self {
            window_ms,
            max_batch_size,
            ..Self::default()
        }
    }

    /// Mark a command type as immediate.
    pub fn immediate(mut self, command_type: impl Into<String>) -> Self {
        self.immediate_commands.insert(command_type.into());
        self
    }
}

/// A batch the sink could not send. The batch is handed back.
#[derive(Debug, Clone, Error)]
#[error("batch of {} commands not sent: {reason}", batch.len())]
pub struct SendFailure {
    /// The batch, unchanged
    pub batch: Vec<BatchedCommand>,
    /// Transport's reason
    pub reason: String,
}

impl SendFailure {
    /// Create a failure for `batch`.
    pub fn new(batch: Vec<BatchedCommand>, reason: impl Into<String>) -> Self {
        Self { batch, reason: reason.into() }
    }
}

/// Outgoing transport for batches.
pub trait BatchSink {
    /// Send one batch, in order after every earlier batch.
    fn send_batch(&mut self, batch: Vec<BatchedCommand>) -> Result<(), SendFailure>;
}

impl<F> BatchSink for F
where
    F: FnMut(Vec<BatchedCommand>) -> Result<(), SendFailure>,
{
    fn send_batch(&mut self, batch: Vec<BatchedCommand>) -> Result<(), SendFailure> {
        self(batch)
    }
}

/// Sink that holds batches in memory until drained.
#[derive(Debug, Clone, Default)]
pub struct BufferedSink {
    batches: VecDeque<Vec<BatchedCommand>>,
}

impl BufferedSink {
    /// Batches sent so far and not yet drained.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Look at buffered batches, oldest first.
    pub fn batches(&self) -> impl Iterator<Item = &Vec<BatchedCommand>> {
        self.batches.iter()
    }

    /// Take every buffered batch, oldest first.
    pub fn drain(&mut self) -> Vec<Vec<BatchedCommand>> {
        self.batches.drain(..).collect()
    }
}

impl BatchSink for BufferedSink {
    fn send_batch(&mut self, batch: Vec<BatchedCommand>) -> Result<(), SendFailure> {
        self.batches.push_back(batch);
        Ok(())
    }
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Zero window: one command per batch
    Unbatched,
    /// The batch window expired
    Window,
    /// The queue reached `max_batch_size`
    Size,
    /// An immediate command was enqueued
    Immediate,
    /// `flush()` was called
    Manual,
}

/// Ordered, windowed command batcher.
pub struct CommandBatcher<S> {
    config: BatcherConfig,
    sink: S,
    clock: Arc<dyn Clock>,
    queue: Vec<BatchedCommand>,
    timer: TimerSlot,
    undelivered: VecDeque<Vec<BatchedCommand>>,
    batches_sent: u64,
    destroyed: bool,
}

impl<S: BatchSink> CommandBatcher<S> {
    /// Create a batcher sending to `sink`.
    pub fn new(mut config: BatcherConfig, sink: S, clock: Arc<dyn Clock>) -> Self {
        config.max_batch_size = config.max_batch_size.max(1);
        Self {
            config,
            sink,
            clock,
            queue: Vec::new(),
            timer: TimerSlot::new(),
            undelivered: VecDeque::new(),
            batches_sent: 0,
            destroyed: false,
        }
    }

    /// Queue a command by type and payload.
    pub fn enqueue(&mut self, command_type: impl Into<String>, payload: Value) {
        self.push(BatchedCommand::new(command_type, payload));
    }

    /// Queue an already encoded command.
    pub fn push(&mut self, command: BatchedCommand) {
        if self.destroyed {
            debug!("Batcher destroyed, dropping {}", command.command_type);
            return;
        }

        let immediate = self.config.immediate_commands.contains(&command.command_type);
        self.queue.push(command);

        if self.config.window_ms == 0 {
            self.flush_with(FlushTrigger::Unbatched);
        } else if immediate {
            self.flush_with(FlushTrigger::Immediate);
        } else if self.queue.len() >= self.config.max_batch_size {
            self.flush_with(FlushTrigger::Size);
        } else if !self.timer.is_armed() {
            let deadline = self.clock.now_ms() + self.config.window_ms;
            self.timer.arm(deadline);
        }
    }

    /// Send whatever is queued now. No-op on an empty queue.
    pub fn flush(&mut self) {
        if !self.destroyed {
            self.flush_with(FlushTrigger::Manual);
        }
    }

    /// Flush if the window has expired. Returns true if a batch was flushed.
    pub fn poll(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        match self.timer.take_expired(self.clock.now_ms()) {
            Some(_) => {
                self.flush_with(FlushTrigger::Window);
                true
            }
            None => false,
        }
    }

    /// External timer callback. Stale tokens are ignored.
    pub fn on_timer(&mut self, token: TimerToken) -> bool {
        if self.destroyed || !self.timer.fire(token) {
            return false;
        }
        self.flush_with(FlushTrigger::Window);
        true
    }

    /// When the armed window expires, if one is armed.
    pub fn next_deadline(&self) -> Option<Millis> {
        self.timer.deadline()
    }

    /// Token of the armed window, for hosts with their own scheduler.
    pub fn timer_token(&self) -> Option<TimerToken> {
        self.timer.token()
    }

    /// Commands waiting for the next flush.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Batches handed to the sink successfully.
    pub fn batches_sent(&self) -> u64 {
        self.batches_sent
    }

    /// Batches the sink refused, waiting for a retry.
    pub fn undelivered_len(&self) -> usize {
        self.undelivered.len()
    }

    /// Resend refused batches in order. Stops at the first new failure.
    ///
    /// Returns how many batches went out.
    pub fn retry_undelivered(&mut self) -> usize {
        let mut sent = 0;
        while !self.destroyed {
            let Some(batch) = self.undelivered.pop_front() else {
                break;
            };
            match self.sink.send_batch(batch) {
                Ok(()) => {
                    self.batches_sent += 1;
                    sent += 1;
                }
                Err(failure) => {
                    warn!("Retry failed: {}", failure);
                    self.undelivered.push_front(failure.batch);
                    break;
                }
            }
        }
        sent
    }

    /// Hand refused batches back to the caller, oldest first.
    pub fn take_undelivered(&mut self) -> Vec<Vec<BatchedCommand>> {
        self.undelivered.drain(..).collect()
    }

    /// Cancel the window and discard everything queued. Final.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.timer.close();
        if !self.queue.is_empty() || !self.undelivered.is_empty() {
            debug!(
                "Batcher destroyed with {} queued commands and {} undelivered batches",
                self.queue.len(),
                self.undelivered.len()
            );
        }
        self.queue.clear();
        self.undelivered.clear();
    }

    /// Whether `destroy` was called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// The sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The sink, mutably.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn flush_with(&mut self, trigger: FlushTrigger) {
        self.timer.cancel();
        if self.queue.is_empty() {
            return;
        }
        let batch = mem::take(&mut self.queue);

        debug!("Flushing {} commands ({:?})", batch.len(), trigger);
        self.deliver(batch);
    }

    fn deliver(&mut self, batch: Vec<BatchedCommand>) {
        // Later batches may not overtake a refused one.
        if !self.undelivered.is_empty() {
            self.undelivered.push_back(batch);
            return;
        }
        match self.sink.send_batch(batch) {
            Ok(()) => self.batches_sent += 1,
            Err(failure) => {
                warn!("Batch send failed, holding for retry: {}", failure);
                self.undelivered.push_back(failure.batch);
            }
        }
    }
}

impl<S> std::fmt::Debug for CommandBatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBatcher")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .field("undelivered", &self.undelivered.len())
            .field("deadline", &self.timer.deadline())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use proptest::prelude::*;
    use serde_json::json;

    fn batcher(config: BatcherConfig) -> (CommandBatcher<BufferedSink>, ManualClock) {
        let clock = ManualClock::new(1_000);
        let batcher = CommandBatcher::new(config, BufferedSink::default(), Arc::new(clock.clone()));
        (batcher, clock)
    }

    fn types(batch: &[BatchedCommand]) -> Vec<&str> {
        batch.iter().map(|c| c.command_type.as_str()).collect()
    }

    #[test]
    fn test_zero_window_sends_singletons() {
        let (mut b, _clock) = batcher(BatcherConfig::default());
        b.enqueue("A", json!(null));
        b.enqueue("B", json!({ "n": 1 }));

        assert_eq!(b.next_deadline(), None);
        let batches = b.sink_mut().drain();
        assert_eq!(batches.len(), 2);
        assert_eq!(types(&batches[0]), vec!["A"]);
        assert_eq!(types(&batches[1]), vec!["B"]);
    }

    #[test]
    fn test_size_flush_scenario() {
        // window 50, max 2: A then B flushes [A, B] right away.
        let (mut b, _clock) = batcher(BatcherConfig::with_window(50, 2));
        b.enqueue("A", json!(null));
        assert!(b.sink().is_empty());
        assert_eq!(b.next_deadline(), Some(1_050));

        b.enqueue("B", json!(null));
        let batches = b.sink_mut().drain();
        assert_eq!(batches.len(), 1);
        assert_eq!(types(&batches[0]), vec!["A", "B"]);
        assert_eq!(b.next_deadline(), None, "size flush cancels the window");
    }

    #[test]
    fn test_immediate_flush_scenario() {
        let config = BatcherConfig::with_window(50, 10).immediate("URGENT");
        let (mut b, _clock) = batcher(config);
        b.enqueue("NORMAL_A", json!(null));
        b.enqueue("NORMAL_B", json!(null));
        b.enqueue("URGENT", json!(null));

        let batches = b.sink_mut().drain();
        assert_eq!(batches.len(), 1);
        assert_eq!(types(&batches[0]), vec!["NORMAL_A", "NORMAL_B", "URGENT"]);
        assert_eq!(b.queued_len(), 0);
        assert_eq!(b.next_deadline(), None);

        // The next command starts a fresh window.
        b.enqueue("NORMAL_C", json!(null));
        assert_eq!(b.queued_len(), 1);
        assert!(b.next_deadline().is_some());
    }

    #[test]
    fn test_window_is_fixed_from_first_enqueue() {
        let (mut b, clock) = batcher(BatcherConfig::with_window(50, 10));
        b.enqueue("A", json!(null));
        clock.advance(30);
        b.enqueue("B", json!(null));
        assert_eq!(b.next_deadline(), Some(1_050));

        clock.advance(19);
        assert!(!b.poll());
        clock.advance(1);
        assert!(b.poll());

        let batches = b.sink_mut().drain();
        assert_eq!(batches.len(), 1);
        assert_eq!(types(&batches[0]), vec!["A", "B"]);
        assert!(!b.poll());
    }

    #[test]
    fn test_external_timer_tokens() {
        let (mut b, _clock) = batcher(BatcherConfig::with_window(50, 10));
        b.enqueue("A", json!(null));
        let stale = b.timer_token().unwrap();
        b.flush();
        assert_eq!(b.sink_mut().drain().len(), 1);

        b.enqueue("B", json!(null));
        assert!(!b.on_timer(stale), "stale token must not flush");
        assert_eq!(b.queued_len(), 1);

        let live = b.timer_token().unwrap();
        assert!(b.on_timer(live));
        assert_eq!(b.sink_mut().drain().len(), 1);
    }

    #[test]
    fn test_flush_on_empty_queue_is_noop() {
        let (mut b, _clock) = batcher(BatcherConfig::with_window(50, 10));
        b.flush();
        assert!(b.sink().is_empty());
        assert_eq!(b.batches_sent(), 0);
    }

    #[test]
    fn test_destroy_discards_and_silences() {
        let (mut b, clock) = batcher(BatcherConfig::with_window(50, 10));
        b.enqueue("A", json!(null));
        let token = b.timer_token().unwrap();
        b.destroy();

        b.enqueue("B", json!(null));
        b.flush();
        clock.advance(1_000);
        assert!(!b.poll());
        assert!(!b.on_timer(token));
        assert!(b.sink().is_empty());
        assert!(b.is_destroyed());
    }

    #[test]
    fn test_refused_batches_keep_order() {
        let sink = |batch: Vec<BatchedCommand>| -> Result<(), SendFailure> {
            Err(SendFailure::new(batch, "offline"))
        };
        let mut b = CommandBatcher::new(BatcherConfig::default(), sink, Arc::new(ManualClock::new(0)));
        b.enqueue("A", json!(null));
        b.enqueue("B", json!(null));
        assert_eq!(b.undelivered_len(), 2);
        assert_eq!(b.batches_sent(), 0);

        let taken = b.take_undelivered();
        assert_eq!(taken.len(), 2);
        assert_eq!(types(&taken[0]), vec!["A"]);
        assert_eq!(types(&taken[1]), vec!["B"]);
    }

    #[test]
    fn test_retry_undelivered() {
        use std::cell::Cell;
        use std::rc::Rc;

        let online = Rc::new(Cell::new(false));
        let flag = online.clone();
        let sink = move |batch: Vec<BatchedCommand>| -> Result<(), SendFailure> {
            if flag.get() {
                Ok(())
            } else {
                Err(SendFailure::new(batch, "offline"))
            }
        };
        let mut b = CommandBatcher::new(BatcherConfig::default(), sink, Arc::new(ManualClock::new(0)));
        b.enqueue("A", json!(null));
        b.enqueue("B", json!(null));
        assert_eq!(b.retry_undelivered(), 0);
        assert_eq!(b.undelivered_len(), 2);

        online.set(true);
        assert_eq!(b.retry_undelivered(), 2);
        assert_eq!(b.undelivered_len(), 0);
        assert_eq!(b.batches_sent(), 2);
    }

    #[test]
    fn test_max_batch_size_clamped() {
        let (mut b, _clock) = batcher(BatcherConfig::with_window(50, 0));
        b.enqueue("A", json!(null));
        assert_eq!(b.sink().len(), 1);
    }

    fn command_names() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(prop::sample::select(vec!["A", "B", "C"]).prop_map(String::from), 0..40)
    }

    proptest! {
        #[test]
        fn prop_zero_window_one_batch_per_command(names in command_names()) {
            let (mut b, _clock) = batcher(BatcherConfig::default());
            for name in &names {
                b.enqueue(name.clone(), json!(null));
            }
            let batches = b.sink_mut().drain();
            prop_assert_eq!(batches.len(), names.len());
            for (batch, name) in batches.iter().zip(&names) {
                prop_assert_eq!(batch.len(), 1);
                prop_assert_eq!(&batch[0].command_type, name);
            }
        }

        #[test]
        fn prop_size_trigger_exact(names in command_names(), max in 1usize..8) {
            let (mut b, _clock) = batcher(BatcherConfig::with_window(10_000, max));
            for (i, name) in names.iter().enumerate() {
                b.enqueue(name.clone(), json!(null));
                // Flushed exactly when the queue reaches max, never before.
                prop_assert_eq!(b.sink().len(), (i + 1) / max);
            }
            prop_assert_eq!(b.queued_len(), names.len() % max);

            b.flush();
            let flat: Vec<String> = b
                .sink_mut()
                .drain()
                .into_iter()
                .flatten()
                .map(|c| c.command_type)
                .collect();
            prop_assert_eq!(flat, names);
        }

        #[test]
        fn prop_immediate_flushes_whole_prefix(prefix in command_names(), follow_up in command_names()) {
            let config = BatcherConfig::with_window(10_000, 64).immediate("URGENT");
            let (mut b, _clock) = batcher(config);
            for name in &prefix {
                b.enqueue(name.clone(), json!(null));
            }
            prop_assert!(b.sink().is_empty());

            b.enqueue("URGENT", json!(null));
            let batches = b.sink_mut().drain();
            prop_assert_eq!(batches.len(), 1);
            let mut expected: Vec<&str> = prefix.iter().map(String::as_str).collect();
            expected.push("URGENT");
            prop_assert_eq!(types(&batches[0]), expected);
            prop_assert_eq!(b.queued_len(), 0);
            prop_assert_eq!(b.next_deadline(), None);

            // Later commands open a fresh batch.
            for name in &follow_up {
                b.enqueue(name.clone(), json!(null));
            }
            prop_assert!(b.sink().is_empty());
            prop_assert_eq!(b.queued_len(), follow_up.len());
        }

        #[test]
        fn prop_destroy_silences(names in command_names(), advance in 0u64..10_000) {
            let (mut b, clock) = batcher(BatcherConfig::with_window(50, 4));
            b.destroy();
            for name in &names {
                b.enqueue(name.clone(), json!(null));
            }
            clock.advance(advance);
            b.poll();
            b.flush();
            prop_assert!(b.sink().is_empty());
        }
    }
}
