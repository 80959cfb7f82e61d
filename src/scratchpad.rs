//! Per-command scratch memory.
//!
//! A bump arena the debugger borrows for the temporaries of one command,
//! returned and emptied when the command completes. The arena keeps its
//! high-water capacity across commands, so steady state does not touch the
//! global allocator.

use bumpalo::Bump;

#[derive(Default)]
pub struct ScratchPad {
    bump: Option<Bump>,
    high_water: usize,
    total: usize,
}

impl ScratchPad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        ScratchPad {
            bump: Some(Bump::with_capacity(bytes)),
            high_water: 0,
            total: 0,
        }
    }

    /// Borrow the arena for one command.
    pub fn begin(&mut self) -> Bump {
        self.bump.take().unwrap_or_default()
    }

    /// Return the arena; its allocations are rolled back, capacity is kept.
    pub fn end(&mut self, mut bump: Bump) {
        let used = bump.allocated_bytes();
        self.high_water = self.high_water.max(used);
        self.total += used;
        bump.reset();
        self.bump = Some(bump);
    }

    /// Largest per-command usage seen so far.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Bytes allocated over the pad's lifetime.
    pub fn total(&self) -> usize {
        self.total
    }
}
