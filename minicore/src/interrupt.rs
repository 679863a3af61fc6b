//! Cooperative cancellation shared between the signal listener and the loop.
//!
//! A first interrupt asks the loop to stop before its next iteration. A
//! second one is *forced*: in-flight commands are killed as well.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Flags {
    requested: AtomicBool,
    forced: AtomicBool,
}

/// Cloneable interrupt token.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flags: Arc<Flags>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one external interrupt, escalating to forced on the second.
    pub fn signal(&self) {
        if self.flags.requested.swap(true, Ordering::SeqCst) {
            self.flags.forced.store(true, Ordering::SeqCst);
        }
    }

    /// Ask the loop to stop after the in-flight call resolves.
    pub fn request(&self) {
        self.flags.requested.store(true, Ordering::SeqCst);
    }

    /// Ask the loop to stop and in-flight commands to be killed.
    pub fn force(&self) {
        self.flags.requested.store(true, Ordering::SeqCst);
        self.flags.forced.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flags.requested.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.flags.forced.load(Ordering::SeqCst)
    }
}
