//! Running agents on other threads.
//!
//! [`ThreadedAgent`] moves an [`Agent`] onto a dedicated thread. Every
//! interaction is a [`Command`] on a channel; the thread executes commands
//! when idle and, during a run, between phases. A rule calling `(wait)`
//! puts the thread to sleep until [`ThreadedAgent::input_ready`] or the
//! wait timeout, after which the run continues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use rayon::prelude::*;

use crate::agent::Agent;
use crate::cycle::{RunOutcome, RunUnit, StopHandle, StopReason};
use crate::error::{KernelResult, RunError};

/// Default time a waiting agent sleeps before resuming on its own.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

pub type Job = Box<dyn FnOnce(&mut Agent) + Send>;

/// A request for the agent thread.
pub enum Command {
    /// Run a closure against the agent.
    Execute(Job),
    Run {
        n: u64,
        unit: RunUnit,
        reply: Option<Sender<KernelResult<RunOutcome>>>,
    },
    /// New input is available; wakes a waiting agent.
    InputReady,
    /// Stop the run in progress. Ignored while idle.
    Stop,
    Shutdown,
}

/// An agent owned by a background thread.
pub struct ThreadedAgent {
    commands: Sender<Command>,
    stop: StopHandle,
    thread: Option<JoinHandle<Agent>>,
}

impl ThreadedAgent {
    pub fn spawn(agent: Agent) -> Self {
        Self::spawn_with(agent, DEFAULT_WAIT_TIMEOUT)
    }

    pub fn spawn_with(mut agent: Agent, wait_timeout: Duration) -> Self {
        let (commands, rx) = mpsc::channel();
        let stop = agent.stop_handle();
        let rx = Arc::new(Mutex::new(rx));
        let deferred = Arc::new(Mutex::new(VecDeque::new()));
        let ready = Arc::new(AtomicBool::new(false));
        agent.set_phase_hook(drain_between_phases(
            Arc::clone(&rx),
            Arc::clone(&deferred),
            Arc::clone(&ready),
        ));
        let worker = Worker {
            agent,
            rx,
            deferred,
            ready,
            wait_timeout,
        };
        let thread = std::thread::spawn(move || worker.run());
        tracing::debug!(wait_ms = wait_timeout.as_millis() as u64, "agent thread started");
        Self {
            commands,
            stop,
            thread: Some(thread),
        }
    }

    fn send(&self, command: Command) -> KernelResult<()> {
        self.commands
            .send(command)
            .map_err(|_| RunError::Disconnected.into())
    }

    /// Run `f` on the agent thread and wait for its result.
    pub fn execute<R, F>(&self, f: F) -> KernelResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Agent) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.send(Command::Execute(Box::new(move |agent| {
            let _ = tx.send(f(agent));
        })))?;
        rx.recv().map_err(|_| RunError::Disconnected.into())
    }

    /// Queue `f` without waiting for it.
    pub fn post(&self, f: impl FnOnce(&mut Agent) + Send + 'static) -> KernelResult<()> {
        self.send(Command::Execute(Box::new(f)))
    }

    /// Start a run and return immediately.
    pub fn start(&self, n: u64, unit: RunUnit) -> KernelResult<()> {
        self.send(Command::Run { n, unit, reply: None })
    }

    /// Run and wait for the outcome.
    pub fn run_for(&self, n: u64, unit: RunUnit) -> KernelResult<RunOutcome> {
        let (tx, rx) = mpsc::channel();
        self.send(Command::Run {
            n,
            unit,
            reply: Some(tx),
        })?;
        match rx.recv() {
            Ok(result) => result,
            Err(_) => Err(RunError::Disconnected.into()),
        }
    }

    /// Stop the current run at the next phase boundary, waking the agent
    /// if it is waiting.
    pub fn stop(&self) {
        self.stop.stop();
        let _ = self.commands.send(Command::Stop);
    }

    pub fn input_ready(&self) -> KernelResult<()> {
        self.send(Command::InputReady)
    }

    /// Finish queued work, stop the thread and hand the agent back.
    pub fn shutdown(mut self) -> KernelResult<Agent> {
        self.send(Command::Shutdown)?;
        let thread = self.thread.take().ok_or(RunError::Disconnected)?;
        thread.join().map_err(|_| RunError::Disconnected.into())
    }
}

impl Drop for ThreadedAgent {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.stop();
            let _ = self.commands.send(Command::Stop);
            let _ = self.commands.send(Command::Shutdown);
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for ThreadedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedAgent")
            .field("alive", &self.thread.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Worker thread
// ---------------------------------------------------------------------------

type Shared<T> = Arc<Mutex<T>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Phase hook: execute queued closures, note input signals and set other
/// commands aside for when the run ends.
fn drain_between_phases(
    rx: Shared<Receiver<Command>>,
    deferred: Shared<VecDeque<Command>>,
    ready: Arc<AtomicBool>,
) -> impl FnMut(&mut Agent) + Send + 'static {
    move |agent: &mut Agent| {
        let rx = lock(&rx);
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Execute(job) => job(agent),
                Command::InputReady => ready.store(true, Ordering::SeqCst),
                Command::Stop => agent.stop(),
                other => lock(&deferred).push_back(other),
            }
        }
    }
}

/// A run request that may span several waits.
struct PendingRun {
    n: u64,
    unit: RunUnit,
    outcome: RunOutcome,
    reply: Option<Sender<KernelResult<RunOutcome>>>,
}

impl PendingRun {
    fn remaining(&self) -> u64 {
        let done = match self.unit {
            RunUnit::Phase => self.outcome.phases,
            RunUnit::Elaboration => self.outcome.elaborations,
            RunUnit::Decision => self.outcome.decisions,
            RunUnit::Forever => 0,
        };
        self.n.saturating_sub(done)
    }

    fn finish(self, result: KernelResult<RunOutcome>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

enum Next {
    Command(Command),
    Timeout,
    Closed,
}

struct Worker {
    agent: Agent,
    rx: Shared<Receiver<Command>>,
    deferred: Shared<VecDeque<Command>>,
    ready: Arc<AtomicBool>,
    wait_timeout: Duration,
}

impl Worker {
    fn next(&self, timeout: Option<Duration>) -> Next {
        if let Some(command) = lock(&self.deferred).pop_front() {
            return Next::Command(command);
        }
        let rx = lock(&self.rx);
        match timeout {
            None => rx.recv().map(Next::Command).unwrap_or(Next::Closed),
            Some(t) => match rx.recv_timeout(t) {
                Ok(command) => Next::Command(command),
                Err(RecvTimeoutError::Timeout) => Next::Timeout,
                Err(RecvTimeoutError::Disconnected) => Next::Closed,
            },
        }
    }

    fn run(mut self) -> Agent {
        loop {
            match self.next(None) {
                Next::Command(Command::Execute(job)) => job(&mut self.agent),
                Next::Command(Command::Run { n, unit, reply }) => {
                    let run = PendingRun {
                        n,
                        unit,
                        outcome: RunOutcome::default(),
                        reply,
                    };
                    if !self.advance(run) {
                        break;
                    }
                }
                Next::Command(Command::InputReady | Command::Stop) | Next::Timeout => {}
                Next::Command(Command::Shutdown) | Next::Closed => break,
            }
        }
        self.agent.clear_phase_hook();
        tracing::debug!("agent thread finished");
        self.agent
    }

    /// Drive a run to completion, sleeping whenever the agent waits.
    /// Returns `false` if the thread should exit.
    fn advance(&mut self, mut run: PendingRun) -> bool {
        let mut held = VecDeque::new();
        loop {
            self.ready.store(false, Ordering::SeqCst);
            let n = run.remaining();
            let result = if n == 0 && run.unit != RunUnit::Forever {
                Ok(RunOutcome {
                    stop: Some(StopReason::Completed),
                    ..RunOutcome::default()
                })
            } else {
                self.agent.run_for(n, run.unit)
            };
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    run.finish(Err(e));
                    break;
                }
            };
            run.outcome.phases += outcome.phases;
            run.outcome.elaborations += outcome.elaborations;
            run.outcome.decisions += outcome.decisions;
            run.outcome.stop = outcome.stop.clone();
            if outcome.stop != Some(StopReason::Waiting) {
                let total = run.outcome.clone();
                run.finish(Ok(total));
                break;
            }
            tracing::debug!("agent waiting for input");
            if !self.wait(&mut held) {
                let total = run.outcome.clone();
                run.finish(Ok(total));
                return false;
            }
            // The next run_for would discard a stop made while waiting.
            if self.agent.stop.take() {
                run.outcome.stop = Some(StopReason::Stopped);
                let total = run.outcome.clone();
                run.finish(Ok(total));
                break;
            }
        }
        let mut deferred = lock(&self.deferred);
        while let Some(command) = held.pop_back() {
            deferred.push_front(command);
        }
        true
    }

    /// Sleep until input is ready or the timeout passes. Closures still
    /// run while waiting; other commands are held. Returns `false` on
    /// shutdown.
    fn wait(&mut self, held: &mut VecDeque<Command>) -> bool {
        loop {
            if self.ready.swap(false, Ordering::SeqCst) {
                return true;
            }
            match self.next(Some(self.wait_timeout)) {
                Next::Command(Command::InputReady) | Next::Timeout => return true,
                Next::Command(Command::Stop) => {
                    self.agent.stop();
                    return true;
                }
                Next::Command(Command::Execute(job)) => job(&mut self.agent),
                Next::Command(run @ Command::Run { .. }) => held.push_back(run),
                Next::Command(Command::Shutdown) | Next::Closed => return false,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel runs
// ---------------------------------------------------------------------------

/// Run independent agents side by side, each for `n` units.
pub fn run_agents_parallel(agents: &mut [Agent], n: u64, unit: RunUnit) -> Vec<KernelResult<RunOutcome>> {
    agents.par_iter_mut().map(|agent| agent.run_for(n, unit)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::production::ast::{Cond, RuleDef};

    #[test]
    fn execute_returns_the_closure_result() {
        let threaded = ThreadedAgent::spawn(Agent::new(AgentConfig::default()));
        let top = threaded.execute(|agent| agent.symbols().display(agent.top_state())).unwrap();
        assert_eq!(top, "S1");
        let out = threaded.run_for(3, RunUnit::Decision).unwrap();
        assert_eq!(out.decisions, 3);
        let agent = threaded.shutdown().unwrap();
        assert_eq!(agent.stats().decisions, 3);
    }

    #[test]
    fn stop_ends_a_forever_run() {
        let threaded = ThreadedAgent::spawn(Agent::new(AgentConfig::default()));
        threaded.start(0, RunUnit::Forever).unwrap();
        threaded.stop();
        let agent = threaded.shutdown().unwrap();
        assert!(agent.stats().phases >= 1);
        assert!(!agent.stop_handle().is_requested());
    }

    #[test]
    fn stop_while_idle_is_discarded() {
        let threaded = ThreadedAgent::spawn(Agent::new(AgentConfig::default()));
        threaded.stop();
        let out = threaded.run_for(2, RunUnit::Decision).unwrap();
        assert_eq!(out.decisions, 2);
        assert_eq!(out.stop, Some(StopReason::Completed));
    }

    #[test]
    fn waiting_agent_resumes_on_input() {
        let mut agent = Agent::new(AgentConfig::default());
        let link = agent.input_link();
        let pause = agent.symbols_mut().string("pause");
        let yes = agent.symbols_mut().string("yes");
        agent.add_input_wme(link, pause, yes).unwrap();
        agent
            .add_rule(
                &RuleDef::new("pause")
                    .when(Cond::state("<s>", "io", "<io>"))
                    .when(Cond::new("<io>", "input-link", "<in>"))
                    .when(Cond::new("<in>", "pause", "yes"))
                    .then_call("wait", vec![]),
            )
            .unwrap();
        let threaded = ThreadedAgent::spawn_with(agent, Duration::from_secs(60));
        threaded.start(3, RunUnit::Decision).unwrap();
        threaded.input_ready().unwrap();
        let out = threaded.run_for(1, RunUnit::Decision).unwrap();
        assert_eq!(out.decisions, 1);
        assert_eq!(threaded.execute(|a| a.stats().decisions).unwrap(), 4);
    }

    #[test]
    fn agents_run_in_parallel() {
        let mut agents: Vec<Agent> = (0..3).map(|_| Agent::new(AgentConfig::default())).collect();
        let results = run_agents_parallel(&mut agents, 2, RunUnit::Decision);
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|o| o.decisions == 2)));
    }
}
