use std::cell::RefCell;
use std::rc::Rc;

type Action = Box<dyn FnOnce()>;

struct Inner {
    counter: usize,
    action: Option<Action>,
}

/// Fan-in counter.
///
/// The counter starts at one, held by the owner until it calls
/// [`Barrier::end_with`]. Every [`Barrier::inc`] must be matched by a
/// [`Barrier::dec`]. The action fires once the counter reaches zero.
#[derive(Clone)]
pub struct Barrier {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Barrier {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                counter: 1,
                action: None,
            })),
        }
    }

    pub fn inc(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.counter > 0 {
            inner.counter += 1;
        }
    }

    pub fn dec(&self) {
        let action = {
            let mut inner = self.inner.borrow_mut();
            if inner.counter == 0 {
                return;
            }
            inner.counter -= 1;
            if inner.counter == 0 {
                inner.action.take()
            } else {
                None
            }
        };

        if let Some(action) = action {
            action();
        }
    }

    /// Releases the owner's hold and fires `action` once nothing is pending.
    pub fn end_with(&self, action: impl FnOnce() + 'static) {
        self.inner.borrow_mut().action = Some(Box::new(action));
        self.dec();
    }

    /// Fires the registered action now, ignoring anything still pending.
    pub fn break_now(&self) {
        let action = {
            let mut inner = self.inner.borrow_mut();
            inner.counter = 0;
            inner.action.take()
        };

        if let Some(action) = action {
            action();
        }
    }

    /// True until the barrier fired.
    pub fn is_pending(&self) -> bool {
        self.inner.borrow().counter > 0
    }
}
