//! Per-tick process-capacity accounting.
//!
//! The drone layer's capacity counter is the single shared resource in
//! the system. The dispatcher reads it once per tick into a
//! `TicketPool` and decrements per admitted start; nothing else adjusts
//! it mid-tick. An action that does not fit is deferred to a later
//! tick, never failed.

/// Remaining process-start budget for the current tick.
#[derive(Debug)]
pub struct TicketPool {
    remaining: u32,
}

impl TicketPool {
    pub fn new(remaining: u32) -> Self {
        Self { remaining }
    }

    /// Admit an action needing `processes` slots, decrementing the pool
    /// on success. Zero-process requests are always admitted.
    pub fn try_admit(&mut self, processes: u32) -> bool {
        if processes <= self.remaining {
            self.remaining -= processes;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}
