//! Produces 64-bit monotonic unique message IDs: a millisecond time
//! component, a worker component derived from the instance ordinal, and a
//! per-millisecond sequence counter.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Custom epoch (2024-01-01T00:00:00Z) so the 41-bit time component has
/// headroom for decades rather than being spent on the Unix epoch.
const CUSTOM_EPOCH_MS: u64 = 1_704_067_200_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER_ID: u32 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: u32 = (1 << SEQUENCE_BITS) - 1;

/// How far the clock is allowed to step backwards (in milliseconds) before
/// [`IdGenerator::next_id`] gives up waiting and returns an error instead of
/// blocking forever. The spec only says "blocks until clock recovers"; this
/// cap exists so a wedged clock doesn't hang a caller indefinitely, and a
/// caller that hits it can still retry.
const MAX_CLOCK_WAIT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum IdGenError {
    #[error("worker id {0} exceeds the maximum of {MAX_WORKER_ID}")]
    WorkerIdOutOfRange(u32),
    #[error("clock moved backwards by more than {MAX_CLOCK_WAIT_MS}ms; refusing to block further")]
    ClockRewoundTooFar,
}

struct State {
    last_ms: u64,
    sequence: u32,
}

/// A Snowflake-style 64-bit ID generator for one gateway/logic instance.
///
/// Bit layout (most to least significant): 1 unused sign bit, 41 bits of
/// milliseconds since [`CUSTOM_EPOCH_MS`], 10 bits of worker id, 12 bits of
/// per-millisecond sequence.
pub struct IdGenerator {
    worker_id: u32,
    state: Mutex<State>,
}

impl IdGenerator {
    /// # Errors
    /// Returns [`IdGenError::WorkerIdOutOfRange`] if `worker_id` doesn't fit
    /// in the reserved bit width.
    pub fn new(worker_id: u32) -> Result<Self, IdGenError> {
        if worker_id > MAX_WORKER_ID {
            return Err(IdGenError::WorkerIdOutOfRange(worker_id));
        }
        Ok(Self {
            worker_id,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        })
    }

    /// Produce the next strictly-monotonic id.
    ///
    /// # Errors
    /// Returns [`IdGenError::ClockRewoundTooFar`] if the system clock has
    /// rewound by more than [`MAX_CLOCK_WAIT_MS`] and waiting for it to
    /// catch back up would exceed that budget.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned (a prior panic while held),
    /// mirroring the rest of this codebase's "never silently continue past
    /// a broken invariant" stance.
    pub fn next_id(&self) -> Result<i64, IdGenError> {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        let mut now = current_millis();

        if now < state.last_ms {
            now = self.wait_for_clock(&mut state, now)?;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond: spin to the
                // next tick rather than emit a duplicate id.
                now = self.wait_for_next_millis(state.last_ms);
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;
        Ok(self.assemble(now, state.sequence))
    }

    fn assemble(&self, ms_since_epoch: u64, sequence: u32) -> i64 {
        let time_component = ms_since_epoch.saturating_sub(CUSTOM_EPOCH_MS);
        let id = (time_component << (WORKER_BITS + SEQUENCE_BITS))
            | (u64::from(self.worker_id) << SEQUENCE_BITS)
            | u64::from(sequence);
        // Safe: the 41+10+12 = 63-bit layout never sets the sign bit.
        id as i64
    }

    fn wait_for_clock(&self, state: &mut State, mut now: u64) -> Result<u64, IdGenError> {
        let deadline_ms = state.last_ms.saturating_sub(now);
        if deadline_ms > MAX_CLOCK_WAIT_MS {
            return Err(IdGenError::ClockRewoundTooFar);
        }
        tracing::warn!(
            rewound_ms = deadline_ms,
            "system clock moved backwards; blocking id generation until it recovers"
        );
        while now < state.last_ms {
            std::thread::sleep(std::time::Duration::from_millis(1));
            now = current_millis();
        }
        Ok(now)
    }

    fn wait_for_next_millis(&self, last_ms: u64) -> u64 {
        let mut now = current_millis();
        while now <= last_ms {
            std::thread::sleep(std::time::Duration::from_micros(100));
            now = current_millis();
        }
        now
    }
}

fn current_millis() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis() as u64
}
