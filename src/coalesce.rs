//! Output coalescing: many rapid fragments, one delivery.
//!
//! Chat platforms throttle edits and hate ten-messages-a-second bots. The
//! coalescer buffers streamed fragments and only releases them after a
//! quiet period with no new appends, so a burst of agent output lands as
//! a single batch.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct CoalesceState {
    buffer: String,
    /// Bumped on every append and flush; a sleeping timer only fires if
    /// the epoch it captured is still current.
    epoch: u64,
}

/// Batches rapid output fragments into single deliveries on `sink`.
///
/// `append` restarts the quiet-period timer; when a timer wakes and no
/// newer append or flush has happened, the whole buffer is swapped out
/// and sent as one batch. `flush` short-circuits the wait. The swap and
/// the send happen inside one critical section (the sink is unbounded,
/// so sending never blocks), which keeps batches in append order even
/// when a timer and a forced flush race.
pub struct OutputCoalescer {
    state: Arc<Mutex<CoalesceState>>,
    quiet: Duration,
    sink: mpsc::UnboundedSender<String>,
}

impl OutputCoalescer {
    pub fn new(quiet: Duration, sink: mpsc::UnboundedSender<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoalesceState {
                buffer: String::new(),
                epoch: 0,
            })),
            quiet,
            sink,
        }
    }

    /// Buffer a fragment and arm (or re-arm) the deferred delivery.
    pub fn append(&self, fragment: &str) {
        let armed_epoch = {
            let mut state = self.state.lock();
            state.buffer.push_str(fragment);
            state.epoch += 1;
            state.epoch
        };
        let state = Arc::clone(&self.state);
        let sink = self.sink.clone();
        let quiet = self.quiet;
        tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            let mut state = state.lock();
            if state.epoch != armed_epoch || state.buffer.is_empty() {
                return; // a newer append re-armed the timer, or a flush won
            }
            state.epoch += 1;
            let batch = std::mem::take(&mut state.buffer);
            let _ = sink.send(batch);
        });
    }

    /// Deliver whatever is buffered right now and cancel any armed timer.
    /// Does nothing when the buffer is empty.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        if state.buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.buffer);
        let _ = self.sink.send(batch);
    }
}
