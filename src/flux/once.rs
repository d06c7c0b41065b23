use std::cell::RefCell;
use std::rc::Rc;

use super::{Flux, StepFn};

type Action<C, T> = Box<dyn FnOnce(&Flux<C>, Resolver<C, T>)>;
type Apply<C, T> = Box<dyn FnOnce(&mut C, &T)>;

enum Outcome<C, T> {
    Ready(Rc<T>, Apply<C, T>),
    Parked,
    Start(Option<Action<C, T>>),
}

struct Waiter<C, T> {
    flux: Flux<C>,
    apply: Apply<C, T>,
}

enum State<C, T> {
    Idle(Option<Action<C, T>>),
    Running(Vec<Waiter<C, T>>),
    Done(Rc<T>),
}

/// A sub-flow that runs at most once and memoizes its result.
///
/// The first flux reaching [`Once::step`] starts the action. Fluxes arriving
/// while it runs are parked as observers. Once the action resolves, every
/// parked flux gets the value applied to its context and continues in arrival
/// order. Later arrivals get the stored value immediately.
pub struct Once<C, T> {
    state: Rc<RefCell<State<C, T>>>,
}

impl<C, T> Clone for Once<C, T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

/// Completes a [`Once`]. Dropping it without resolving leaves every waiter
/// suspended.
pub struct Resolver<C, T> {
    state: Rc<RefCell<State<C, T>>>,
}

impl<C: 'static, T: 'static> Resolver<C, T> {
    pub fn resolve(self, value: T) {
        let value = Rc::new(value);
        let previous = {
            let mut state = self.state.borrow_mut();
            std::mem::replace(&mut *state, State::Done(Rc::clone(&value)))
        };

        if let State::Running(waiters) = previous {
            for Waiter { flux, apply } in waiters {
                flux.with(|ctx| apply(ctx, &value));
                flux.proceed();
            }
        }
    }
}

impl<C: 'static, T: 'static> Once<C, T> {
    pub fn new(action: impl FnOnce(&Flux<C>, Resolver<C, T>) + 'static) -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Idle(Some(Box::new(action))))),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.state.borrow(), State::Done(_))
    }

    pub fn value(&self) -> Option<Rc<T>> {
        match &*self.state.borrow() {
            State::Done(value) => Some(Rc::clone(value)),
            _ => None,
        }
    }

    /// A step that waits for the memoized value and hands it to `apply`.
    pub fn step(&self, apply: impl FnOnce(&mut C, &T) + 'static) -> StepFn<C> {
        let state = Rc::clone(&self.state);
        Box::new(move |flux: &Flux<C>| {
            let apply: Apply<C, T> = Box::new(apply);

            let outcome = {
                let mut current = state.borrow_mut();
                match &mut *current {
                    State::Done(value) => Outcome::Ready(Rc::clone(value), apply),
                    State::Running(waiters) => {
                        waiters.push(Waiter {
                            flux: flux.clone(),
                            apply,
                        });
                        Outcome::Parked
                    }
                    State::Idle(action) => {
                        let action = action.take();
                        *current = State::Running(vec![Waiter {
                            flux: flux.clone(),
                            apply,
                        }]);
                        Outcome::Start(action)
                    }
                }
            };

            match outcome {
                Outcome::Ready(value, apply) => {
                    flux.with(|ctx| apply(ctx, &value));
                    flux.proceed();
                }
                Outcome::Parked | Outcome::Start(None) => {}
                Outcome::Start(Some(action)) => action(flux, Resolver {
                    state: Rc::clone(&state),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::flux::step;

    #[test]
    fn test_runs_action_once_for_sequential_callers() {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let once: Once<Vec<u32>, u32> = Once::new(move |_, resolver| {
            counter.set(counter.get() + 1);
            resolver.resolve(42);
        });

        let a = Flux::run(Vec::new(), [once.step(|ctx, v| ctx.push(*v))]);
        let b = Flux::run(Vec::new(), [once.step(|ctx, v| ctx.push(*v + 1))]);

        assert_eq!(calls.get(), 1);
        assert_eq!(*a.context(), [42]);
        assert_eq!(*b.context(), [43]);
        assert_eq!(once.value().as_deref(), Some(&42));
    }

    #[test]
    fn test_observers_are_replayed() {
        let resolver_slot: Rc<RefCell<Option<Resolver<Vec<&'static str>, &'static str>>>> =
            Rc::default();
        let slot = Rc::clone(&resolver_slot);
        let once = Once::new(move |_, resolver| {
            *slot.borrow_mut() = Some(resolver);
        });

        let tail = || {
            step(|flux: &Flux<Vec<&'static str>>| {
                flux.with(|ctx| ctx.push("after"));
                flux.proceed();
            })
        };

        let first = Flux::run(Vec::new(), [once.step(|ctx, v| ctx.push(*v)), tail()]);
        let second = Flux::run(Vec::new(), [once.step(|ctx, v| ctx.push(*v)), tail()]);
        assert!(first.context().is_empty());
        assert!(second.context().is_empty());
        assert!(!once.is_done());

        let resolver = resolver_slot.borrow_mut().take().unwrap();
        resolver.resolve("loaded");

        assert_eq!(*first.context(), ["loaded", "after"]);
        assert_eq!(*second.context(), ["loaded", "after"]);
        assert!(once.is_done());
    }
}
