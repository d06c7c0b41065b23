//! Cooperative continuation executor.
//!
//! A [`Flux`] owns a stack of pending steps and a shared context. Each step is
//! a boxed closure that receives the flux and must call [`Flux::proceed`]
//! exactly once, either before returning or later from a [`Reactor`]
//! callback. A step that never proceeds leaves the flux suspended.
//!
//! Dispatch is iterative: a `proceed` issued while a step is still executing
//! only marks a continuation as pending, and the loop that invoked the step
//! picks the next one up. Long synchronous chains therefore never grow the
//! call stack.

mod barrier;
mod join;
mod once;

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::core::panic_message;
use crate::error::FluxError;
use crate::reactor::{Reactor, TimerId};

pub use barrier::Barrier;
pub use join::{Job, join_jobs, parallel};
pub use once::{Once, Resolver};

/// A single unit of work inside a [`Flux`].
pub type StepFn<C> = Box<dyn FnOnce(&Flux<C>)>;

type EndFn<C> = Box<dyn FnOnce(&Flux<C>)>;
type PanicFn<C> = Rc<dyn Fn(&Flux<C>, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxState {
    /// Steps are being pushed, nothing ran yet.
    Defining,
    Running,
    /// The time budget ran out or a step panicked.
    Aborted,
    /// The last pending step is executing.
    Finishing,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Idle,
    Executing,
    /// A step continued while it was still executing.
    Pending,
}

struct Core<C> {
    pending: Vec<StepFn<C>>,
    state: FluxState,
    dispatch: Dispatch,
    on_end: Option<EndFn<C>>,
    on_panic: Option<PanicFn<C>>,
    debug: bool,
    timer: Option<(Weak<Reactor>, TimerId)>,
}

/// Handle to a flux and its shared context.
///
/// Handles are cheap to clone. Clones taken inside a step carry the same
/// debug guard as the handle the step received.
pub struct Flux<C> {
    core: Rc<RefCell<Core<C>>>,
    context: Rc<RefCell<C>>,
    guard: Option<Rc<Guard>>,
}

#[derive(Default)]
struct Guard {
    continued: Cell<u32>,
}

impl<C> Clone for Flux<C> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            context: Rc::clone(&self.context),
            guard: self.guard.clone(),
        }
    }
}

impl<C: 'static> Flux<C> {
    pub fn new(context: C) -> Self {
        Self::with_shared_context(Rc::new(RefCell::new(context)))
    }

    /// Creates a flux operating on a context shared with other fluxes.
    pub fn with_shared_context(context: Rc<RefCell<C>>) -> Self {
        Self {
            core: Rc::new(RefCell::new(Core {
                pending: Vec::new(),
                state: FluxState::Defining,
                dispatch: Dispatch::Idle,
                on_end: None,
                on_panic: None,
                debug: false,
                timer: None,
            })),
            context,
            guard: None,
        }
    }

    /// Creates a flux, pushes `steps` and starts it.
    pub fn run(context: C, steps: impl IntoIterator<Item = StepFn<C>>) -> Self {
        let flux = Self::new(context);
        flux.set_first_elements(steps);
        flux.proceed();
        flux
    }

    pub fn state(&self) -> FluxState {
        self.core.borrow().state
    }

    pub fn pending_len(&self) -> usize {
        self.core.borrow().pending.len()
    }

    pub fn context(&self) -> Ref<'_, C> {
        self.context.borrow()
    }

    pub fn context_mut(&self) -> RefMut<'_, C> {
        self.context.borrow_mut()
    }

    /// Runs `f` with exclusive access to the context.
    pub fn with<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        f(&mut self.context.borrow_mut())
    }

    pub fn shared_context(&self) -> Rc<RefCell<C>> {
        Rc::clone(&self.context)
    }

    pub fn set_debug(&self, debug: bool) {
        self.core.borrow_mut().debug = debug;
    }

    pub fn is_debug(&self) -> bool {
        self.core.borrow().debug
    }

    /// Called once, after the last step continued or after an abort.
    pub fn on_end(&self, f: impl FnOnce(&Flux<C>) + 'static) {
        self.core.borrow_mut().on_end = Some(Box::new(f));
    }

    /// Catches panics raised by steps. Without a handler they propagate to
    /// whoever called [`Flux::proceed`].
    pub fn on_panic(&self, f: impl Fn(&Flux<C>, String) + 'static) {
        self.core.borrow_mut().on_panic = Some(Rc::new(f));
    }

    /// Pushes a batch of steps in front of the pending ones, preserving the
    /// order of the batch.
    pub fn set_first_elements(&self, steps: impl IntoIterator<Item = StepFn<C>>) {
        if let Some(guard) = &self.guard
            && guard.continued.get() > 0
        {
            panic!("{}", FluxError::PushedAfterContinue);
        }

        let mut batch: Vec<StepFn<C>> = steps.into_iter().collect();
        batch.reverse();
        self.core.borrow_mut().pending.extend(batch);
    }

    /// Pushes a single step in front of the pending ones.
    pub fn push_first(&self, step: impl FnOnce(&Flux<C>) + 'static) {
        self.set_first_elements([Box::new(step) as StepFn<C>]);
    }

    /// Continues with the next pending step, or ends the flux if none is left.
    pub fn proceed(&self) {
        if let Some(guard) = &self.guard {
            let count = guard.continued.get() + 1;
            guard.continued.set(count);
            if count > 1 {
                panic!("{}", FluxError::ContinuedTwice { count });
            }
        }

        {
            let mut core = self.core.borrow_mut();
            if core.dispatch != Dispatch::Idle {
                core.dispatch = Dispatch::Pending;
                return;
            }
            if core.state == FluxState::Defining {
                core.state = FluxState::Running;
            }
        }

        loop {
            let next = {
                let mut core = self.core.borrow_mut();
                core.dispatch = Dispatch::Executing;

                let live = matches!(core.state, FluxState::Running | FluxState::Finishing);
                match if live { core.pending.pop() } else { None } {
                    Some(step) => {
                        if core.pending.is_empty() {
                            core.state = FluxState::Finishing;
                        }
                        Some((step, core.debug, core.on_panic.clone()))
                    }
                    None => None,
                }
            };

            match next {
                Some((step, debug, on_panic)) => self.invoke(step, debug, on_panic),
                None => self.finish(),
            }

            let mut core = self.core.borrow_mut();
            if core.dispatch == Dispatch::Pending {
                continue;
            }
            core.dispatch = Dispatch::Idle;
            break;
        }
    }

    fn invoke(&self, step: StepFn<C>, debug: bool, on_panic: Option<PanicFn<C>>) {
        let handle = Flux {
            core: Rc::clone(&self.core),
            context: Rc::clone(&self.context),
            guard: debug.then(|| Rc::new(Guard::default())),
        };

        match on_panic {
            None => step(&handle),
            Some(handler) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| step(&handle))) {
                    handler(&self.unguarded(), panic_message(payload.as_ref()));
                }
            }
        }
    }

    fn finish(&self) {
        let (on_end, timer) = {
            let mut core = self.core.borrow_mut();
            if core.state != FluxState::Aborted {
                core.state = FluxState::Terminated;
            }
            (core.on_end.take(), core.timer.take())
        };

        if let Some((reactor, id)) = timer
            && let Some(reactor) = reactor.upgrade()
        {
            reactor.cancel_timer(id);
        }

        if let Some(on_end) = on_end {
            on_end(&self.unguarded());
        }
    }

    /// Drops every pending step except the bottom one and runs it.
    ///
    /// The bottom step is where a flux keeps its cleanup, so an aborted flux
    /// still reaches it. Aborting an already ended flux does nothing.
    pub fn abort(&self) {
        let bottom = {
            let mut core = self.core.borrow_mut();
            if matches!(core.state, FluxState::Aborted | FluxState::Terminated) {
                return;
            }
            core.state = FluxState::Aborted;
            let bottom = if core.pending.is_empty() {
                None
            } else {
                Some(core.pending.remove(0))
            };
            core.pending.clear();
            bottom
        };

        tracing::debug!("flux aborted");

        let handle = self.unguarded();
        match bottom {
            Some(step) => step(&handle),
            None => handle.proceed(),
        }
    }

    /// Aborts the flux if it is still running after `budget`.
    ///
    /// A zero budget aborts immediately. A flux executing its last step is
    /// left alone.
    pub fn set_time_budget(&self, reactor: &Rc<Reactor>, budget: Duration) {
        if let Some(guard) = &self.guard
            && guard.continued.get() > 0
        {
            panic!("{}", FluxError::BudgetAfterContinue);
        }

        let previous = self.core.borrow_mut().timer.take();
        if let Some((old, id)) = previous
            && let Some(old) = old.upgrade()
        {
            old.cancel_timer(id);
        }

        if matches!(self.state(), FluxState::Aborted | FluxState::Terminated) {
            return;
        }

        if budget.is_zero() {
            self.abort();
            return;
        }

        let weak = self.downgrade();
        let id = reactor.add_timer(budget, move || {
            if let Some(flux) = weak.upgrade()
                && matches!(flux.state(), FluxState::Defining | FluxState::Running)
            {
                flux.abort();
            }
        });
        self.core.borrow_mut().timer = Some((Rc::downgrade(reactor), id));
    }

    fn unguarded(&self) -> Flux<C> {
        Flux {
            core: Rc::clone(&self.core),
            context: Rc::clone(&self.context),
            guard: None,
        }
    }

    fn downgrade(&self) -> WeakFlux<C> {
        WeakFlux {
            core: Rc::downgrade(&self.core),
            context: Rc::downgrade(&self.context),
        }
    }
}

struct WeakFlux<C> {
    core: Weak<RefCell<Core<C>>>,
    context: Weak<RefCell<C>>,
}

impl<C: 'static> WeakFlux<C> {
    fn upgrade(&self) -> Option<Flux<C>> {
        Some(Flux {
            core: self.core.upgrade()?,
            context: self.context.upgrade()?,
            guard: None,
        })
    }
}

/// Boxes a closure as a [`StepFn`].
pub fn step<C: 'static>(f: impl FnOnce(&Flux<C>) + 'static) -> StepFn<C> {
    Box::new(f)
}
