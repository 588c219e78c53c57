//! The decision cycle and run control.
//!
//! An agent moves through INPUT, PROPOSE, DECISION, APPLY and OUTPUT. The
//! two elaboration phases advance one wave at a time so that every run unit
//! (phase, elaboration, decision) can stop exactly where it was asked to.
//! Stop requests, halts and limit hits are only honored at phase
//! boundaries; changes made by a completed phase are never undone.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::error::{KernelResult, RunError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Input,
    Propose,
    Decision,
    Apply,
    Output,
}

impl Phase {
    pub fn next(self) -> Phase {
        match self {
            Phase::Input => Phase::Propose,
            Phase::Propose => Phase::Decision,
            Phase::Decision => Phase::Apply,
            Phase::Apply => Phase::Output,
            Phase::Output => Phase::Input,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Input => "input",
            Phase::Propose => "propose",
            Phase::Decision => "decision",
            Phase::Apply => "apply",
            Phase::Output => "output",
        })
    }
}

/// What `n` counts in [`Agent::run_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunUnit {
    Phase,
    /// Elaboration steps: one wave of firings, or one whole non-elaborating phase.
    Elaboration,
    /// Whole decision cycles, stopping before the configured stop phase.
    Decision,
    /// Until something stops the agent; `n` is ignored.
    Forever,
}

/// Why a run returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The requested amount of work was done.
    Completed,
    /// A rule called `(halt)`.
    Halted(String),
    /// A rule called `(interrupt)`.
    Interrupted(String),
    /// [`StopHandle::stop`] was called.
    Stopped,
    MaxElaborations,
    MaxDecisions,
    MaxGoalDepth,
    MaxChunks,
    RhsError(String),
    /// A rule called `(wait)`; the agent wants new input.
    Waiting,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Completed => f.write_str("Run completed."),
            StopReason::Halted(rule) => write!(f, "System halted by rule {rule}."),
            StopReason::Interrupted(rule) => write!(f, "Interrupted by rule {rule}."),
            StopReason::Stopped => f.write_str("Stopped by user."),
            StopReason::MaxElaborations => f.write_str("max elaborations exceeded"),
            StopReason::MaxDecisions => f.write_str("max decisions reached"),
            StopReason::MaxGoalDepth => f.write_str("max goal depth exceeded"),
            StopReason::MaxChunks => f.write_str("max chunks reached"),
            StopReason::RhsError(msg) => write!(f, "right-hand-side error: {msg}"),
            StopReason::Waiting => f.write_str("waiting for input"),
        }
    }
}

/// Work done by one [`Agent::run_for`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub phases: u64,
    pub elaborations: u64,
    pub decisions: u64,
    pub stop: Option<StopReason>,
}

/// Thread-safe stop request, honored at the next phase boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consume a pending request.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Result of one step of the cycle.
#[derive(Debug, Clone, Copy)]
struct Step {
    phase: Phase,
    finished_phase: bool,
}

impl Agent {
    /// Run `n` units of work.
    ///
    /// A halted agent refuses to run until [`Agent::initialize`]; a
    /// corrupted one refuses every run. A stop requested before the run
    /// starts is discarded.
    pub fn run_for(&mut self, n: u64, unit: RunUnit) -> KernelResult<RunOutcome> {
        self.check_usable()?;
        if self.halted.is_some() {
            return Err(RunError::Halted.into());
        }
        if self.running {
            return Err(RunError::Busy.into());
        }
        self.stop.take();
        self.running = true;
        self.waiting = false;
        let mut outcome = RunOutcome::default();
        let result = self.run_loop(n, unit, &mut outcome);
        self.running = false;
        match result {
            Ok(reason) => {
                tracing::debug!(
                    phases = outcome.phases,
                    decisions = outcome.decisions,
                    reason = %reason,
                    "run finished"
                );
                outcome.stop = Some(reason);
                Ok(outcome)
            }
            Err(e) => Err(self.poison(e)),
        }
    }

    fn run_loop(&mut self, n: u64, unit: RunUnit, outcome: &mut RunOutcome) -> KernelResult<StopReason> {
        if n == 0 && unit != RunUnit::Forever {
            return Ok(StopReason::Completed);
        }
        loop {
            if unit == RunUnit::Decision
                && outcome.decisions >= n
                && self.phase == self.config.stop_phase
            {
                return Ok(StopReason::Completed);
            }
            let step = self.step()?;
            outcome.elaborations += 1;
            if step.finished_phase {
                outcome.phases += 1;
                self.stats.phases += 1;
                if step.phase == Phase::Output {
                    outcome.decisions += 1;
                    self.stats.decisions += 1;
                }
                self.after_phase(step.phase);
                if let Some(reason) = self.boundary_stop(step.phase) {
                    return Ok(reason);
                }
                if unit == RunUnit::Phase && outcome.phases >= n {
                    return Ok(StopReason::Completed);
                }
            }
            if unit == RunUnit::Elaboration && outcome.elaborations >= n {
                return Ok(StopReason::Completed);
            }
        }
    }

    fn step(&mut self) -> KernelResult<Step> {
        let phase = self.phase;
        let finished_phase = match phase {
            Phase::Input => {
                self.input_phase()?;
                true
            }
            Phase::Propose | Phase::Apply => {
                if self.phase_waves >= self.config.max_elaborations {
                    tracing::warn!(
                        phase = %phase,
                        limit = self.config.max_elaborations,
                        "max elaborations exceeded; forcing phase end"
                    );
                    self.pending_stop.get_or_insert(StopReason::MaxElaborations);
                    true
                } else if self.elaborate(phase)? {
                    self.phase_waves += 1;
                    false
                } else {
                    true
                }
            }
            Phase::Decision => {
                self.decision_phase()?;
                true
            }
            Phase::Output => {
                self.output_phase()?;
                self.reclaim_identifiers();
                true
            }
        };
        if finished_phase {
            self.phase = phase.next();
            self.phase_waves = 0;
        }
        Ok(Step {
            phase,
            finished_phase,
        })
    }

    /// Deliver the phase's working-memory delta, then run the phase hook.
    fn after_phase(&mut self, phase: Phase) {
        if !self.listeners.is_empty() {
            let delta = self.wm.take_delta();
            let mut listeners = std::mem::take(&mut self.listeners);
            for listener in &mut listeners {
                listener(phase, &delta);
            }
            listeners.append(&mut self.listeners);
            self.listeners = listeners;
        }
        if let Some(mut hook) = self.phase_hook.take() {
            hook(self);
            if self.phase_hook.is_none() {
                self.phase_hook = Some(hook);
            }
        }
    }

    fn boundary_stop(&mut self, finished: Phase) -> Option<StopReason> {
        if self.stop.take() {
            return Some(StopReason::Stopped);
        }
        if let Some(reason) = self.pending_stop.take() {
            return Some(reason);
        }
        if finished == Phase::Output
            && self
                .config
                .max_decisions
                .is_some_and(|max| self.stats.decisions >= max)
        {
            return Some(StopReason::MaxDecisions);
        }
        None
    }

    /// Request a stop at the next phase boundary.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// A handle other threads can use to stop this agent.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// The phase the next step will execute.
    pub fn phase(&self) -> Phase {
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    #[test]
    fn phases_cycle_in_order() {
        let mut p = Phase::Input;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(p);
            p = p.next();
        }
        assert_eq!(p, Phase::Input);
        assert_eq!(
            seen,
            vec![Phase::Input, Phase::Propose, Phase::Decision, Phase::Apply, Phase::Output]
        );
    }

    #[test]
    fn reasons_read_like_messages() {
        assert_eq!(StopReason::Stopped.to_string(), "Stopped by user.");
        assert_eq!(StopReason::MaxElaborations.to_string(), "max elaborations exceeded");
        assert_eq!(
            StopReason::Halted("done".into()).to_string(),
            "System halted by rule done."
        );
    }

    #[test]
    fn empty_agent_runs_whole_decisions() {
        let mut agent = Agent::new(AgentConfig::default());
        let out = agent.run_for(3, RunUnit::Decision).unwrap();
        assert_eq!(out.decisions, 3);
        assert_eq!(out.phases, 15);
        assert_eq!(out.stop, Some(StopReason::Completed));
        assert_eq!(agent.phase(), Phase::Input);
    }

    #[test]
    fn phase_unit_stops_mid_cycle() {
        let mut agent = Agent::new(AgentConfig::default());
        let out = agent.run_for(2, RunUnit::Phase).unwrap();
        assert_eq!(out.phases, 2);
        assert_eq!(agent.phase(), Phase::Decision);
    }

    #[test]
    fn stop_request_is_honored_at_boundary() {
        let mut agent = Agent::new(AgentConfig::default());
        agent.set_phase_hook(|agent| agent.stop());
        let out = agent.run_for(0, RunUnit::Forever).unwrap();
        assert_eq!(out.phases, 1);
        assert_eq!(out.stop, Some(StopReason::Stopped));
    }

    #[test]
    fn stop_while_idle_does_not_cut_the_next_run() {
        let mut agent = Agent::new(AgentConfig::default());
        agent.stop();
        let out = agent.run_for(3, RunUnit::Decision).unwrap();
        assert_eq!(out.decisions, 3);
        assert_eq!(out.stop, Some(StopReason::Completed));
        assert!(!agent.stop_handle().is_requested());
    }

    #[test]
    fn max_decisions_limits_forever_runs() {
        let mut agent = Agent::new(AgentConfig {
            max_decisions: Some(4),
            ..Default::default()
        });
        let out = agent.run_for(0, RunUnit::Forever).unwrap();
        assert_eq!(out.decisions, 4);
        assert_eq!(out.stop, Some(StopReason::MaxDecisions));
    }
}
