//! The input/output boundary.
//!
//! An [`InputProvider`] runs during the INPUT phase and may add or remove
//! elements (normally under the input link). An [`OutputHandler`] runs
//! during the OUTPUT phase and sees everything reachable from the output
//! link. Listeners receive the working-memory delta of every phase.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::cycle::Phase;
use crate::error::KernelResult;
use crate::memory::WmDelta;
use crate::memory::wme::{Wme, WmeId};
use crate::symbol::Sym;

/// The identifiers of the top state's I/O structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoLinks {
    pub io: Sym,
    pub input_link: Sym,
    pub output_link: Sym,
}

pub trait InputProvider: Send {
    fn input(&mut self, agent: &mut Agent) -> KernelResult<()>;
}

impl<F> InputProvider for F
where
    F: FnMut(&mut Agent) -> KernelResult<()> + Send,
{
    fn input(&mut self, agent: &mut Agent) -> KernelResult<()> {
        self(agent)
    }
}

/// What the output phase exposes.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    /// The set of elements under the output link differs from last cycle.
    pub changed: bool,
    /// Elements reachable from the output link, oldest first.
    pub wmes: Vec<Wme>,
}

pub trait OutputHandler: Send {
    fn output(&mut self, agent: &mut Agent, event: &OutputEvent);
}

impl<F> OutputHandler for F
where
    F: FnMut(&mut Agent, &OutputEvent) + Send,
{
    fn output(&mut self, agent: &mut Agent, event: &OutputEvent) {
        self(agent, event)
    }
}

/// Per-phase working-memory change callback.
pub type WmListener = Box<dyn FnMut(Phase, &WmDelta) + Send>;

impl Agent {
    pub fn set_input_provider(&mut self, provider: impl InputProvider + 'static) {
        self.input = Some(Box::new(provider));
    }

    pub fn set_output_handler(&mut self, handler: impl OutputHandler + 'static) {
        self.output = Some(Box::new(handler));
    }

    /// Register a listener; from now on every phase's delta is recorded.
    pub fn add_wm_listener(&mut self, listener: impl FnMut(Phase, &WmDelta) + Send + 'static) {
        self.listeners.push(Box::new(listener));
        self.wm.set_record_delta(true);
    }

    pub fn clear_wm_listeners(&mut self) {
        self.listeners.clear();
        self.wm.set_record_delta(false);
    }

    pub fn io_links(&self) -> IoLinks {
        self.io
    }

    pub fn input_link(&self) -> Sym {
        self.io.input_link
    }

    pub fn output_link(&self) -> Sym {
        self.io.output_link
    }

    /// Elements reachable from `root` through identifier values.
    pub fn reachable_wmes(&self, root: Sym) -> Vec<&Wme> {
        let mut seen = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            for w in self.wm.query(id, None) {
                if !w.in_wm {
                    continue;
                }
                out.push(w);
                let v = w.fields.value;
                if self.symbols.is_identifier(v) && seen.insert(v) {
                    queue.push_back(v);
                }
            }
        }
        out.sort_by_key(|w| w.timetag);
        out
    }

    pub(crate) fn input_phase(&mut self) -> KernelResult<()> {
        if let Some(mut provider) = self.input.take() {
            let result = provider.input(self);
            if self.input.is_none() {
                self.input = Some(provider);
            }
            result?;
        }
        Ok(())
    }

    pub(crate) fn output_phase(&mut self) -> KernelResult<()> {
        let wmes: Vec<Wme> = self
            .reachable_wmes(self.io.output_link)
            .into_iter()
            .cloned()
            .collect();
        let current: BTreeSet<WmeId> = wmes.iter().map(|w| w.timetag).collect();
        let changed = current != self.last_output;
        self.last_output = current;
        if let Some(mut handler) = self.output.take() {
            let event = OutputEvent { changed, wmes };
            handler.output(self, &event);
            if self.output.is_none() {
                self.output = Some(handler);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::config::AgentConfig;
    use crate::cycle::RunUnit;

    #[test]
    fn input_provider_adds_under_input_link() {
        let mut agent = Agent::new(AgentConfig::default());
        agent.set_input_provider(|agent: &mut Agent| -> KernelResult<()> {
            let link = agent.input_link();
            let attr = agent.symbols_mut().string("sensor");
            let value = agent.symbols_mut().int(7);
            if agent.wm().find(link, attr, value).is_none() {
                agent.add_input_wme(link, attr, value)?;
            }
            Ok(())
        });
        agent.run_for(1, RunUnit::Phase).unwrap();
        let link = agent.input_link();
        assert_eq!(agent.reachable_wmes(link).len(), 1);
    }

    #[test]
    fn output_handler_sees_changes_once() {
        let mut agent = Agent::new(AgentConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        agent.set_output_handler(move |_: &mut Agent, event: &OutputEvent| {
            sink.lock().unwrap().push((event.changed, event.wmes.len()));
        });
        let link = agent.output_link();
        let attr = agent.symbols_mut().string("move");
        let value = agent.symbols_mut().string("north");
        agent.add_input_wme(link, attr, value).unwrap();
        agent.run_for(2, RunUnit::Decision).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(true, 1), (false, 1)]);
    }

    #[test]
    fn listeners_receive_phase_deltas() {
        let mut agent = Agent::new(AgentConfig::default());
        let phases = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&phases);
        agent.add_wm_listener(move |phase, delta| {
            sink.lock().unwrap().push((phase, delta.added.len()));
        });
        let link = agent.input_link();
        let attr = agent.symbols_mut().string("x");
        agent.add_input_wme(link, attr, attr).unwrap();
        agent.run_for(1, RunUnit::Phase).unwrap();
        assert_eq!(*phases.lock().unwrap(), vec![(Phase::Input, 1)]);
    }
}
