//! Walking from a result back to the super-goal elements it rests on.

use std::collections::BTreeSet;

use crate::agent::Agent;
use crate::memory::preference::InstId;
use crate::memory::wme::{WmeId, WmeSource};
use crate::production::Condition;

/// What a result depends on outside its sub-goal.
#[derive(Debug, Default)]
pub(crate) struct Backtrace {
    /// Super-goal elements, by timetag.
    pub grounds: BTreeSet<WmeId>,
    /// Negated conditions whose identifiers all lie above the sub-goal,
    /// with their bound variables already replaced.
    pub negations: Vec<Condition>,
    /// Instantiations visited.
    pub traced: usize,
}

impl Agent {
    /// Trace the instantiation `start`, fired at goal `level`, through every
    /// local instantiation that produced an element it matched.
    pub(crate) fn backtrace(&self, start: InstId, level: u32) -> Backtrace {
        let mut trace = Backtrace::default();
        let mut visited = BTreeSet::new();
        let mut work = vec![start];
        while let Some(i) = work.pop() {
            if !visited.insert(i) {
                continue;
            }
            let Some(inst) = self.wm.inst(i) else {
                continue;
            };
            trace.traced += 1;
            for (cond, w) in inst.conditions.iter().zip(&inst.match_wmes) {
                let Some(w) = w else {
                    if self.is_ground(cond, level) && !trace.negations.contains(cond) {
                        trace.negations.push(cond.clone());
                    }
                    continue;
                };
                let Some(wme) = self.wm.wme(*w) else {
                    continue;
                };
                if self.symbols.level(wme.fields.id) < level {
                    trace.grounds.insert(*w);
                    continue;
                }
                match wme.source {
                    WmeSource::Item { acceptable } => {
                        trace.grounds.insert(acceptable);
                    }
                    WmeSource::Preference(p) => {
                        if let Some(pref) = self.wm.pref(p) {
                            work.push(pref.inst);
                        }
                    }
                    // Local goal structure carries no knowledge of its own.
                    WmeSource::Architecture | WmeSource::Input => {}
                }
            }
        }
        if trace.grounds.is_empty() {
            tracing::warn!(inst = start, level, "backtrace found no super-goal conditions");
        }
        trace
    }

    /// Every identifier the condition mentions lives above `level`.
    fn is_ground(&self, cond: &Condition, level: u32) -> bool {
        let mut ground = true;
        let mut any = false;
        cond.for_each_sym(&mut |s| {
            if self.symbols.is_identifier(s) {
                any = true;
                ground &= self.symbols.level(s) < level;
            }
        });
        any && ground
    }
}
