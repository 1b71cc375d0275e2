//! Synchronous observer signals.
//!
//! Handlers are values registered at startup and invoked inline on the
//! controller thread. A panicking handler is caught and logged so a
//! misbehaving observer cannot fork the chain; allocation failures abort
//! the process before reaching the catch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;
use veldt_types::{BlockId, BlockNum, SignedBlock, TransactionTrace, VoteMessage};

/// One signal: an ordered list of handlers.
pub struct Signal<T: ?Sized> {
    name: &'static str,
    handlers: Vec<Box<dyn Fn(&T)>>,
}

impl<T: ?Sized> Signal<T> {
    fn new(name: &'static str) -> Self {
        Signal { name, handlers: Vec::new() }
    }

    /// Register a handler. Registration order is invocation order.
    pub fn connect(&mut self, handler: impl Fn(&T) + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Invoke every handler inline, swallowing (and logging) panics.
    pub fn emit(&self, value: &T) {
        for handler in &self.handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(value))) {
                let what = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                error!(signal = self.name, panic = %what, "observer failed; continuing");
            }
        }
    }
}

/// The controller's signal set.
pub struct ControllerSignals {
    /// A block is about to start building (the new block's number).
    pub block_start: Signal<BlockNum>,
    /// A block header passed validation.
    pub accepted_block_header: Signal<(Arc<SignedBlock>, BlockId)>,
    /// A block was committed to the fork database.
    pub accepted_block: Signal<(Arc<SignedBlock>, BlockId)>,
    /// A block became irreversible.
    pub irreversible_block: Signal<(Arc<SignedBlock>, BlockId)>,
    /// A transaction was applied (successfully or not).
    pub applied_transaction: Signal<Arc<TransactionTrace>>,
    /// This node produced a finality vote.
    pub voted_block: Signal<VoteMessage>,
}

impl ControllerSignals {
    pub fn new() -> Self {
        ControllerSignals {
            block_start: Signal::new("block_start"),
            accepted_block_header: Signal::new("accepted_block_header"),
            accepted_block: Signal::new("accepted_block"),
            irreversible_block: Signal::new("irreversible_block"),
            applied_transaction: Signal::new("applied_transaction"),
            voted_block: Signal::new("voted_block"),
        }
    }
}

impl Default for ControllerSignals {
    fn default() -> Self {
        ControllerSignals::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn handlers_run_in_registration_order() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut signal: Signal<u32> = Signal::new("test");
        for tag in 0..3 {
            let order = order.clone();
            signal.connect(move |_| order.borrow_mut().push(tag));
        }
        signal.emit(&7);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_handler_does_not_stop_later_handlers() {
        let reached = Rc::new(Cell::new(false));
        let mut signal: Signal<u32> = Signal::new("test");
        signal.connect(|_| panic!("observer bug"));
        {
            let reached = reached.clone();
            signal.connect(move |_| reached.set(true));
        }
        signal.emit(&1);
        assert!(reached.get());
    }
}
