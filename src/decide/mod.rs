//! The decision phase and the goal stack.
//!
//! Each goal's `^operator` slot is decided top-down. A decided slot selects
//! an operator and removes every goal below it; an undecidable one creates
//! (or keeps) an impasse sub-state one level down. Goals are also removed
//! when their selected operator loses support, when a goal above them
//! changes, and when an element in their goal dependency set disappears.

pub mod exploration;
pub mod semantics;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::cycle::StopReason;
use crate::error::{KernelResult, WmError};
use crate::memory::preference::{InstId, PrefId};
use crate::memory::wme::{Support, WmeFields, WmeId, WmeSource};
use crate::symbol::Sym;

use exploration::choose;
use semantics::{ImpasseKind, PrefView, Resolution, numeric_values, resolve, slot_values};

/// Why a sub-state exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impasse {
    pub kind: ImpasseKind,
    /// `operator`, or `state` for a state no-change.
    pub attribute: Sym,
    pub items: Vec<Sym>,
    /// Decision cycle in which the impasse arose (1-based).
    pub decision: u64,
}

impl Impasse {
    /// Short form used in learned rule names.
    pub fn label(&self, operator: Sym) -> &'static str {
        match self.kind {
            ImpasseKind::Tie => "tie",
            ImpasseKind::Conflict => "conflict",
            ImpasseKind::ConstraintFailure => "cfailure",
            ImpasseKind::NoChange if self.attribute == operator => "opnochange",
            ImpasseKind::NoChange => "snochange",
        }
    }
}

/// One entry of the goal stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Sym,
    /// 1 for the top state.
    pub level: u32,
    /// `None` for the top state.
    pub impasse: Option<Impasse>,
    /// Selected operator.
    pub operator: Option<Sym>,
    pub(crate) operator_wme: Option<WmeId>,
    pub(crate) arch_wmes: Vec<WmeId>,
    pub(crate) items: BTreeMap<Sym, WmeId>,
    pub(crate) item_count_wme: Option<WmeId>,
    /// Super-level elements this goal's persistent results depend on.
    pub(crate) gds: BTreeSet<WmeId>,
}

impl Goal {
    pub(crate) fn new(id: Sym, level: u32, impasse: Option<Impasse>, arch_wmes: Vec<WmeId>) -> Self {
        Self {
            id,
            level,
            impasse,
            operator: None,
            operator_wme: None,
            arch_wmes,
            items: BTreeMap::new(),
            item_count_wme: None,
            gds: BTreeSet::new(),
        }
    }

    /// Elements in the goal dependency set.
    pub fn dependencies(&self) -> impl Iterator<Item = WmeId> + '_ {
        self.gds.iter().copied()
    }
}

impl Agent {
    pub(crate) fn slot_views(&self, id: Sym, attr: Sym) -> Vec<PrefView> {
        self.wm
            .slot_prefs(id, attr)
            .into_iter()
            .map(|p| PrefView {
                kind: p.kind,
                value: p.value,
                referent: p.referent,
            })
            .collect()
    }

    /// Goal identifier at `level`, clamped to the current stack.
    pub(crate) fn goal_at(&self, level: u32) -> Sym {
        let index = (level.max(1) as usize - 1).min(self.goals.len().saturating_sub(1));
        self.goals
            .get(index)
            .map(|g| g.id)
            .unwrap_or(self.symbols.predefined().nil)
    }

    // -----------------------------------------------------------------------
    // Decision phase
    // -----------------------------------------------------------------------

    pub(crate) fn decision_phase(&mut self) -> KernelResult<()> {
        self.update_wm()?;
        let p = *self.symbols.predefined();
        let mut i = 0;
        while i < self.goals.len() {
            let goal = self.goals[i].id;
            let bottom = i + 1 == self.goals.len();
            if self.goals[i].operator.is_some() {
                if bottom {
                    self.impasse_below(i, ImpasseKind::NoChange, p.operator, Vec::new())?;
                    return Ok(());
                }
                i += 1;
                continue;
            }
            let changed = self.wm.slot(goal, p.operator).is_some_and(|s| s.changed);
            if !bottom && !changed {
                i += 1;
                continue;
            }
            self.wm.slot_mut(goal, p.operator).changed = false;
            let views = self.slot_views(goal, p.operator);
            match resolve(&views, &self.symbols) {
                Resolution::Decided(op) => {
                    self.select_operator(i, op)?;
                    return Ok(());
                }
                Resolution::Indifferent(candidates) => {
                    let scored = numeric_values(
                        &views,
                        &candidates,
                        self.config.exploration.numeric,
                        &self.symbols,
                    );
                    let picked = choose(&scored, &self.config.exploration, &mut self.rng);
                    if let Some(op) = picked.or_else(|| candidates.first().copied()) {
                        self.select_operator(i, op)?;
                    }
                    return Ok(());
                }
                Resolution::Impasse(kind, items) => {
                    if self.impasse_below(i, kind, p.operator, items)? {
                        i += 1;
                        continue;
                    }
                    return Ok(());
                }
                Resolution::Empty => {
                    if self.config.wait_on_state_no_change {
                        self.remove_goals_below(i)?;
                        return Ok(());
                    }
                    if self.impasse_below(i, ImpasseKind::NoChange, p.state, Vec::new())? {
                        i += 1;
                        continue;
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn select_operator(&mut self, index: usize, op: Sym) -> Result<(), WmError> {
        self.remove_goals_below(index)?;
        let operator = self.symbols.predefined().operator;
        let goal = self.goals[index].id;
        // Backed by the winning acceptable or require preference.
        let source = match self.representative(goal, operator, op) {
            Some(p) => WmeSource::Preference(p),
            None => WmeSource::Architecture,
        };
        let w = self.wm.add_wme(
            WmeFields::new(goal, operator, op),
            Support::Architecture,
            source,
            &self.symbols,
        )?;
        let g = &mut self.goals[index];
        g.operator = Some(op);
        g.operator_wme = Some(w);
        tracing::debug!(
            goal = %self.symbols.display(goal),
            operator = %self.symbols.display(op),
            "operator selected"
        );
        Ok(())
    }

    /// Make sure the goal below `index` is an impasse of this kind. Returns
    /// `true` if an existing sub-state was kept.
    fn impasse_below(
        &mut self,
        index: usize,
        kind: ImpasseKind,
        attribute: Sym,
        items: Vec<Sym>,
    ) -> Result<bool, WmError> {
        let same = self.goals.get(index + 1).and_then(|g| g.impasse.as_ref()).is_some_and(|imp| {
            imp.kind == kind && imp.attribute == attribute
        });
        if same {
            self.update_items(index + 1, items)?;
            return Ok(true);
        }
        self.remove_goals_below(index)?;
        self.create_substate(kind, attribute, items)?;
        Ok(false)
    }

    fn create_substate(&mut self, kind: ImpasseKind, attribute: Sym, items: Vec<Sym>) -> Result<(), WmError> {
        let depth = self.goals.len() as u32;
        if depth >= self.config.max_goal_depth {
            tracing::warn!(depth, "max goal depth exceeded; impasse not created");
            self.pending_stop.get_or_insert(StopReason::MaxGoalDepth);
            return Ok(());
        }
        let p = *self.symbols.predefined();
        let parent = self.goal_at(depth);
        let level = depth + 1;
        let s = self.symbols.new_identifier('S', level);
        self.symbols.set_goal(s, true);
        let impasse_sym = match kind {
            ImpasseKind::Tie => p.tie,
            ImpasseKind::Conflict => p.conflict,
            ImpasseKind::ConstraintFailure => p.constraint_failure,
            ImpasseKind::NoChange => p.no_change,
        };
        let choices = match kind {
            ImpasseKind::Tie | ImpasseKind::Conflict => p.multiple,
            ImpasseKind::ConstraintFailure => p.constraint_failure,
            ImpasseKind::NoChange => p.none,
        };
        let mut arch = Vec::new();
        for (attr, value) in [
            (p.r#type, p.state),
            (p.superstate, parent),
            (p.impasse, impasse_sym),
            (p.attribute, attribute),
            (p.choices, choices),
            (p.quiescence, p.t),
        ] {
            arch.push(self.wm.add_wme(
                WmeFields::new(s, attr, value),
                Support::Architecture,
                WmeSource::Architecture,
                &self.symbols,
            )?);
        }
        self.wm.slot_mut(s, p.operator).context = true;
        let impasse = Impasse {
            kind,
            attribute,
            items: Vec::new(),
            decision: self.stats.decisions + 1,
        };
        self.goals.push(Goal::new(s, level, Some(impasse), arch));
        tracing::debug!(
            goal = %self.symbols.display(s),
            superstate = %self.symbols.display(parent),
            impasse = %kind,
            level,
            "impasse"
        );
        self.update_items(self.goals.len() - 1, items)
    }

    /// Bring a sub-state's `^item` elements in line with `items`.
    fn update_items(&mut self, index: usize, items: Vec<Sym>) -> Result<(), WmError> {
        if index == 0 || index >= self.goals.len() {
            return Ok(());
        }
        let p = *self.symbols.predefined();
        let goal = self.goals[index].id;
        let parent = self.goals[index - 1].id;
        if self.goals[index].impasse.as_ref().is_some_and(|imp| imp.items == items)
            && self.goals[index].items.len() == items.len()
        {
            return Ok(());
        }
        let wanted: BTreeSet<Sym> = items.iter().copied().collect();
        let stale: Vec<(Sym, WmeId)> = self.goals[index]
            .items
            .iter()
            .filter(|(v, _)| !wanted.contains(v))
            .map(|(v, w)| (*v, *w))
            .collect();
        for (v, w) in stale {
            self.goals[index].items.remove(&v);
            self.wm.remove_wme(w, &self.symbols)?;
        }
        for v in &items {
            if self.goals[index].items.contains_key(v) {
                continue;
            }
            let acceptable = self
                .wm
                .slot(parent, p.operator)
                .and_then(|s| s.acceptable_wmes.get(v).copied())
                .filter(|w| self.wm.contains(*w));
            let source = match acceptable {
                Some(a) => WmeSource::Item { acceptable: a },
                None => WmeSource::Architecture,
            };
            let w = self.wm.add_wme(
                WmeFields::new(goal, p.item, *v),
                Support::Architecture,
                source,
                &self.symbols,
            )?;
            self.goals[index].items.insert(*v, w);
        }
        if let Some(w) = self.goals[index].item_count_wme.take() {
            self.wm.remove_wme(w, &self.symbols)?;
        }
        if !items.is_empty() {
            let count = self.symbols.int(items.len() as i64);
            let w = self.wm.add_wme(
                WmeFields::new(goal, p.item_count, count),
                Support::Architecture,
                WmeSource::Architecture,
                &self.symbols,
            )?;
            self.goals[index].item_count_wme = Some(w);
        }
        if let Some(imp) = self.goals[index].impasse.as_mut() {
            imp.items = items;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Goal removal
    // -----------------------------------------------------------------------

    /// Remove every goal below the one at `index`, bottom first.
    pub(crate) fn remove_goals_below(&mut self, index: usize) -> Result<(), WmError> {
        while self.goals.len() > index + 1 {
            self.remove_bottom_goal()?;
        }
        Ok(())
    }

    fn remove_bottom_goal(&mut self) -> Result<(), WmError> {
        let Some(goal) = self.goals.pop() else {
            return Ok(());
        };
        let operator = self.symbols.predefined().operator;
        let owned: Vec<WmeId> = goal
            .operator_wme
            .into_iter()
            .chain(goal.item_count_wme)
            .chain(goal.items.values().copied())
            .chain(goal.arch_wmes.iter().copied())
            .collect();
        for w in owned {
            self.wm.remove_wme(w, &self.symbols)?;
        }
        let doomed: Vec<PrefId> = self
            .wm
            .prefs()
            .filter(|p| p.goal == goal.id && p.in_slot)
            .map(|p| p.id)
            .collect();
        for p in doomed {
            self.wm.retract_pref(p)?;
        }
        self.refresh_slots()?;
        if self.wm.slot(goal.id, operator).is_some() {
            self.wm.slot_mut(goal.id, operator).context = false;
            self.wm.prune_slot((goal.id, operator));
        }
        self.symbols.set_goal(goal.id, false);
        tracing::debug!(goal = %self.symbols.display(goal.id), level = goal.level, "goal removed");
        Ok(())
    }

    /// Deselect operators that lost their acceptable support or were
    /// rejected, removing the goals below them.
    pub(crate) fn remove_unsupported_operators(&mut self) -> Result<(), WmError> {
        let operator = self.symbols.predefined().operator;
        let mut i = 0;
        while i < self.goals.len() {
            if let Some(op) = self.goals[i].operator {
                let goal = self.goals[i].id;
                let views = self.slot_views(goal, operator);
                if !slot_values(&views, &self.symbols).contains(&op) {
                    tracing::debug!(
                        goal = %self.symbols.display(goal),
                        operator = %self.symbols.display(op),
                        "operator lost support"
                    );
                    self.remove_goals_below(i)?;
                    if let Some(w) = self.goals[i].operator_wme.take() {
                        self.wm.remove_wme(w, &self.symbols)?;
                    }
                    self.goals[i].operator = None;
                    self.wm.mark_changed((goal, operator));
                }
            }
            i += 1;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Goal dependency sets
    // -----------------------------------------------------------------------

    /// Record what a persistent preference made by `inst` in a sub-goal
    /// depends on above that sub-goal.
    pub(crate) fn extend_gds(&mut self, inst: InstId) {
        let Some(level) = self.wm.inst(inst).map(|i| i.level) else {
            return;
        };
        let index = level as usize - 1;
        if index == 0 || index >= self.goals.len() {
            return;
        }
        let mut found = BTreeSet::new();
        let mut visited = BTreeSet::new();
        let mut work = vec![inst];
        while let Some(i) = work.pop() {
            if !visited.insert(i) {
                continue;
            }
            let Some(record) = self.wm.inst(i) else {
                continue;
            };
            for w in record.wmes() {
                let Some(wme) = self.wm.wme(w) else {
                    continue;
                };
                if self.symbols.level(wme.fields.id) < level {
                    found.insert(w);
                    continue;
                }
                match wme.source {
                    WmeSource::Preference(p) => {
                        if let Some(pref) = self.wm.pref(p).filter(|p| !p.osupport) {
                            work.push(pref.inst);
                        }
                    }
                    WmeSource::Item { acceptable } => {
                        found.insert(acceptable);
                    }
                    WmeSource::Architecture | WmeSource::Input => {}
                }
            }
        }
        self.goals[index].gds.extend(found);
    }

    /// Remove the highest goal whose dependency set lost an element.
    pub(crate) fn check_gds(&mut self) -> Result<(), WmError> {
        let violated = (1..self.goals.len())
            .find(|i| self.goals[*i].gds.iter().any(|w| !self.wm.contains(*w)));
        if let Some(i) = violated {
            tracing::debug!(
                goal = %self.symbols.display(self.goals[i].id),
                "goal dependency set changed; removing goal"
            );
            self.remove_goals_below(i - 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::cycle::RunUnit;
    use crate::production::PreferenceType;
    use crate::production::ast::{Cond, RuleDef};

    fn propose(name: &str, indifferent: bool) -> RuleDef {
        let rule = RuleDef::new(format!("propose*{name}"))
            .when(Cond::state("<s>", "superstate", "nil"))
            .then_make("<s>", "operator", "<o>")
            .then_make("<o>", "name", name);
        if indifferent {
            rule.then_prefer("<s>", "operator", "<o>", PreferenceType::UnaryIndifferent)
        } else {
            rule
        }
    }

    #[test]
    fn two_proposals_tie() {
        let mut agent = Agent::new(AgentConfig::default());
        agent.add_rule(&propose("a", false)).unwrap();
        agent.add_rule(&propose("b", false)).unwrap();
        agent.run_for(1, RunUnit::Decision).unwrap();
        let goals = agent.goals();
        assert_eq!(goals.len(), 2);
        let impasse = goals[1].impasse.as_ref().unwrap();
        assert_eq!(impasse.kind, ImpasseKind::Tie);
        assert_eq!(impasse.items.len(), 2);
        let s2 = goals[1].id;
        let item = agent.symbols().predefined().item;
        assert_eq!(agent.find_wmes(Some(s2), Some(item), None).len(), 2);
        let count = agent.symbols().predefined().item_count;
        assert_eq!(agent.find_wmes(Some(s2), Some(count), None).len(), 1);
    }

    #[test]
    fn indifferent_proposals_select_one() {
        let mut agent = Agent::new(AgentConfig::default());
        agent.add_rule(&propose("a", true)).unwrap();
        agent.add_rule(&propose("b", true)).unwrap();
        agent.run_for(1, RunUnit::Decision).unwrap();
        assert_eq!(agent.goals().len(), 1);
        let op = agent.goals()[0].operator.unwrap();
        let operator = agent.symbols().predefined().operator;
        assert!(agent.wm().find(agent.top_state(), operator, op).is_some());
    }

    #[test]
    fn no_change_stacks_until_depth_limit() {
        let mut agent = Agent::new(AgentConfig {
            max_goal_depth: 3,
            ..Default::default()
        });
        let out = agent.run_for(10, RunUnit::Decision).unwrap();
        assert_eq!(out.stop, Some(StopReason::MaxGoalDepth));
        assert_eq!(agent.goals().len(), 3);
        let snc = agent.goals()[1].impasse.as_ref().unwrap();
        assert_eq!(snc.kind, ImpasseKind::NoChange);
        assert_eq!(snc.label(agent.symbols().predefined().operator), "snochange");
    }

    #[test]
    fn waiting_on_state_no_change_creates_nothing() {
        let mut agent = Agent::new(AgentConfig {
            wait_on_state_no_change: true,
            ..Default::default()
        });
        agent.run_for(3, RunUnit::Decision).unwrap();
        assert_eq!(agent.goals().len(), 1);
    }

    #[test]
    fn removing_the_proposal_source_deselects() {
        let mut agent = Agent::new(AgentConfig::default());
        agent
            .add_rule(
                &RuleDef::new("propose*go")
                    .when(Cond::state("<s>", "io", "<io>"))
                    .when(Cond::new("<io>", "input-link", "<in>"))
                    .when(Cond::new("<in>", "go", "yes"))
                    .then_make("<s>", "operator", "<o>"),
            )
            .unwrap();
        let link = agent.input_link();
        let go = agent.symbols_mut().string("go");
        let yes = agent.symbols_mut().string("yes");
        let w = agent.add_input_wme(link, go, yes).unwrap();
        agent.run_for(1, RunUnit::Decision).unwrap();
        assert!(agent.goals()[0].operator.is_some());

        agent.remove_input_wme(w).unwrap();
        agent.run_for(1, RunUnit::Phase).unwrap();
        agent.run_for(1, RunUnit::Phase).unwrap();
        assert!(agent.goals()[0].operator.is_none());
    }
}
