use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::{Flux, StepFn};
use crate::error::ReactorError;
use crate::reactor::Reactor;

/// A step that runs every branch in its own child flux and continues once
/// all of them ended.
///
/// Children share the parent's context. They interleave cooperatively on the
/// orchestration thread, so a branch that suspends lets the next one start.
pub fn parallel<C: 'static>(branches: Vec<Vec<StepFn<C>>>) -> StepFn<C> {
    Box::new(move |flux: &Flux<C>| {
        if branches.is_empty() {
            flux.proceed();
            return;
        }

        let remaining = Rc::new(Cell::new(branches.len()));
        let debug = flux.is_debug();

        for branch in branches {
            let child = Flux::with_shared_context(flux.shared_context());
            child.set_debug(debug);

            let parent = flux.clone();
            let remaining = Rc::clone(&remaining);
            child.on_end(move |_| {
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    parent.proceed();
                }
            });

            child.set_first_elements(branch);
            child.proceed();
        }
    })
}

/// Blocking work handed to a worker thread.
pub type Job<T> = Box<dyn FnOnce() -> T + Send>;
type Collect<C, T> = Box<dyn FnOnce(&mut C, Vec<Result<T, ReactorError>>)>;

/// A step that runs `jobs` on worker threads and continues once all of them
/// returned.
///
/// Results are handed to `collect` in submission order. A panicking job shows
/// up as [`ReactorError::JobPanicked`].
pub fn join_jobs<C, T>(
    reactor: &Rc<Reactor>,
    jobs: Vec<Job<T>>,
    collect: impl FnOnce(&mut C, Vec<Result<T, ReactorError>>) + 'static,
) -> StepFn<C>
where
    C: 'static,
    T: Send + 'static,
{
    let reactor = Rc::clone(reactor);
    Box::new(move |flux: &Flux<C>| {
        if jobs.is_empty() {
            flux.with(|ctx| collect(ctx, Vec::new()));
            flux.proceed();
            return;
        }

        let total = jobs.len();
        let results: Rc<RefCell<Vec<Option<Result<T, ReactorError>>>>> =
            Rc::new(RefCell::new((0..total).map(|_| None).collect()));
        let remaining = Rc::new(Cell::new(total));
        let collect: Rc<RefCell<Option<Collect<C, T>>>> =
            Rc::new(RefCell::new(Some(Box::new(collect))));

        for (i, job) in jobs.into_iter().enumerate() {
            let flux = flux.clone();
            let results = Rc::clone(&results);
            let remaining = Rc::clone(&remaining);
            let collect = Rc::clone(&collect);

            reactor.submit(job, move |result| {
                results.borrow_mut()[i] = Some(result);
                remaining.set(remaining.get() - 1);
                if remaining.get() > 0 {
                    return;
                }

                let results = results.borrow_mut().drain(..).flatten().collect();
                if let Some(collect) = collect.borrow_mut().take() {
                    flux.with(|ctx| collect(ctx, results));
                }
                flux.proceed();
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flux::step;

    fn push(label: &'static str) -> StepFn<Vec<&'static str>> {
        step(move |flux: &Flux<Vec<&'static str>>| {
            flux.with(|log| log.push(label));
            flux.proceed();
        })
    }

    #[test]
    fn test_parallel_joins_before_next_step() {
        let flux = Flux::run(
            Vec::new(),
            [
                parallel(vec![vec![push("a1"), push("a2")], vec![push("b1")]]),
                push("joined"),
            ],
        );

        let log = flux.context();
        assert_eq!(log.len(), 4);
        assert_eq!(log.last(), Some(&"joined"));
    }

    #[test]
    fn test_parallel_without_branches() {
        let flux = Flux::run(Vec::new(), [parallel(vec![]), push("after")]);
        assert_eq!(*flux.context(), ["after"]);
    }

    #[test]
    fn test_join_jobs_keeps_submission_order() {
        let reactor = Reactor::new(2);
        let jobs: Vec<Job<u64>> = (0..16u64)
            .map(|i| {
                Box::new(move || {
                    std::thread::sleep(std::time::Duration::from_millis(16 - i));
                    i * i
                }) as Job<u64>
            })
            .collect();

        let flux = Flux::run(
            Vec::new(),
            [join_jobs(&reactor, jobs, |ctx: &mut Vec<u64>, results| {
                ctx.extend(results.into_iter().map(|r| r.unwrap()));
            })],
        );
        reactor.run();

        let expected: Vec<u64> = (0..16).map(|i| i * i).collect();
        assert_eq!(*flux.context(), expected);
    }

    #[test]
    fn test_join_jobs_reports_panics() {
        let reactor = Reactor::new(1);
        let jobs: Vec<Job<u32>> = vec![
            Box::new(|| 1u32) as Job<u32>,
            Box::new(|| -> u32 { panic!("worker died") }) as Job<u32>,
        ];

        let flux = Flux::run(
            Vec::<String>::new(),
            [join_jobs(&reactor, jobs, |ctx: &mut Vec<String>, results| {
                for result in results {
                    ctx.push(match result {
                        Ok(v) => v.to_string(),
                        Err(e) => e.to_string(),
                    });
                }
            })],
        );
        reactor.run();

        assert_eq!(*flux.context(), ["1", "job panicked: worker died"]);
    }
}
