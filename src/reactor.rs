//! Single-threaded event loop that resumes suspended fluxes.
//!
//! Blocking work runs on the rayon pool. Completions travel back over a
//! channel and their callbacks run on the thread that owns the reactor, so
//! callbacks are free to touch `Rc`/`RefCell` state.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::process::{Command, Stdio};
use std::rc::Rc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use crate::core::panic_message;
use crate::error::ReactorError;

type Payload = Box<dyn Any + Send>;
type Completion = Box<dyn FnOnce(Payload)>;
type Timer = Box<dyn FnOnce()>;
type Start = Box<dyn FnOnce()>;

/// Handle returned by [`Reactor::add_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerId {
    deadline: Instant,
    seq: u64,
}

/// Captured result of a finished child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub success: bool,
    /// Standard output followed by standard error.
    pub output: String,
}

struct Slots {
    max: usize,
    running: usize,
    waiting: VecDeque<Start>,
}

struct State {
    seq: u64,
    jobs: HashMap<u64, Completion>,
    timers: BTreeMap<TimerId, Timer>,
    slots: Slots,
}

pub struct Reactor {
    sender: Sender<(u64, Payload)>,
    receiver: Receiver<(u64, Payload)>,
    state: RefCell<State>,
}

impl Reactor {
    /// Creates a reactor allowing at most `max_processes` concurrently
    /// running child processes. Zero means the number of worker threads.
    pub fn new(max_processes: usize) -> Rc<Self> {
        let max = match max_processes {
            0 => rayon::current_num_threads(),
            n => n,
        };
        let (sender, receiver) = channel();

        Rc::new(Self {
            sender,
            receiver,
            state: RefCell::new(State {
                seq: 0,
                jobs: HashMap::new(),
                timers: BTreeMap::new(),
                slots: Slots {
                    max,
                    running: 0,
                    waiting: VecDeque::new(),
                },
            }),
        })
    }

    fn next_seq(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        state.seq += 1;
        state.seq
    }

    /// Runs `job` on a worker thread and `then` on the reactor thread once it
    /// returned.
    pub fn submit<T>(
        &self,
        job: impl FnOnce() -> T + Send + 'static,
        then: impl FnOnce(Result<T, ReactorError>) + 'static,
    ) where
        T: Send + 'static,
    {
        let id = self.next_seq();

        let completion: Completion = Box::new(move |payload| {
            let result = match payload.downcast::<Result<T, String>>() {
                Ok(result) => (*result).map_err(ReactorError::JobPanicked),
                Err(_) => Err(ReactorError::JobPanicked("mismatched completion".into())),
            };
            then(result);
        });
        self.state.borrow_mut().jobs.insert(id, completion);

        let sender = self.sender.clone();
        rayon::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job))
                .map_err(|payload| panic_message(payload.as_ref()));
            let payload: Payload = Box::new(result);
            // The receiver only disappears together with the reactor.
            let _ = sender.send((id, payload));
        });
    }

    pub fn add_timer(&self, after: Duration, f: impl FnOnce() + 'static) -> TimerId {
        let id = TimerId {
            deadline: Instant::now() + after,
            seq: self.next_seq(),
        };
        self.state.borrow_mut().timers.insert(id, Box::new(f));
        id
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.state.borrow_mut().timers.remove(&id);
    }

    /// True when no job is outstanding and no timer is armed.
    pub fn is_idle(&self) -> bool {
        let state = self.state.borrow();
        state.jobs.is_empty() && state.timers.is_empty()
    }

    /// Dispatches completions and timers until nothing is left to wait for.
    pub fn run(&self) {
        loop {
            self.fire_due_timers();

            let (outstanding, deadline) = {
                let state = self.state.borrow();
                (
                    state.jobs.len(),
                    state.timers.keys().next().map(|id| id.deadline),
                )
            };

            let received = match (outstanding, deadline) {
                (0, None) => break,
                (_, Some(deadline)) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match self.receiver.recv_timeout(timeout) {
                        Ok(message) => Some(message),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                (_, None) => match self.receiver.recv() {
                    Ok(message) => Some(message),
                    Err(_) => break,
                },
            };

            if let Some((id, payload)) = received {
                let completion = self.state.borrow_mut().jobs.remove(&id);
                if let Some(completion) = completion {
                    completion(payload);
                }
            }
        }
    }

    fn fire_due_timers(&self) {
        loop {
            let due = {
                let mut state = self.state.borrow_mut();
                match state.timers.first_key_value() {
                    Some((id, _)) if id.deadline <= Instant::now() => state.timers.pop_first(),
                    _ => None,
                }
            };

            match due {
                Some((_, timer)) => timer(),
                None => break,
            }
        }
    }

    /// Spawns `command` once a process slot is free and calls `then` with
    /// its captured output. Requests beyond the slot limit wait in FIFO
    /// order.
    pub fn spawn_process(
        self: &Rc<Self>,
        command: Command,
        then: impl FnOnce(Result<ProcessOutput, ReactorError>) + 'static,
    ) {
        let reactor = Rc::clone(self);
        let start: Start = Box::new(move || {
            let release = Rc::clone(&reactor);
            reactor.submit(
                move || run_command(command),
                move |result| {
                    release.release_slot();
                    then(result.and_then(|output| output.map_err(ReactorError::Spawn)));
                },
            );
        });

        let ready = {
            let mut state = self.state.borrow_mut();
            let slots = &mut state.slots;
            if slots.running < slots.max {
                slots.running += 1;
                Some(start)
            } else {
                slots.waiting.push_back(start);
                None
            }
        };

        if let Some(start) = ready {
            start();
        }
    }

    fn release_slot(&self) {
        let next = {
            let mut state = self.state.borrow_mut();
            let slots = &mut state.slots;
            match slots.waiting.pop_front() {
                Some(next) => Some(next),
                None => {
                    slots.running -= 1;
                    None
                }
            }
        };

        if let Some(next) = next {
            next();
        }
    }

    pub fn running_processes(&self) -> usize {
        self.state.borrow().slots.running
    }

    pub fn waiting_processes(&self) -> usize {
        self.state.borrow().slots.waiting.len()
    }
}

fn run_command(mut command: Command) -> std::io::Result<ProcessOutput> {
    let output = command.stdin(Stdio::null()).output()?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(ProcessOutput {
        code: output.status.code(),
        success: output.status.success(),
        output: text,
    })
}
