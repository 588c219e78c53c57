//! Chunking: compiling sub-goal results into rules.
//!
//! When an instantiation inside a sub-goal makes a preference for a
//! super-goal, the reasoning behind it is traced back to the super-goal
//! elements it depended on. With learning on, those elements are
//! generalized into a chunk that makes the same preference directly next
//! time. With learning off (or when the trace cannot be generalized) a
//! ground justification is installed instead, so the result stays
//! supported exactly as long as its grounds do.

pub(crate) mod backtrace;
pub(crate) mod variablize;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::cycle::StopReason;
use crate::error::KernelResult;
use crate::memory::preference::{Instantiation, PrefId};
use crate::memory::wme::{WmeFields, WmeId};
use crate::production::reorder::order_conditions;
use crate::production::{Action, Condition, ProdId, Production, ProductionKind, RhsValue};
use crate::recmem::{Results, substitute_condition};
use crate::rete::{MatchEvent, TokenId};
use crate::symbol::{Sym, SymbolTable};

use backtrace::Backtrace;
use variablize::Variablizer;

/// Counters and the duplicate index for learned rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct LearnState {
    /// Rendered body of each chunk, mapped to its name.
    pub signatures: BTreeMap<String, String>,
    pub chunk_counter: u64,
    pub justification_counter: u64,
    pub template_counter: u64,
    pub last_chunk_decision: u64,
    pub chunks_this_decision: u64,
}

impl LearnState {
    /// A learned rule was excised; an identical one may be learned again.
    pub fn forget(&mut self, name: &str) {
        self.signatures.retain(|_, n| n != name);
    }
}

impl Agent {
    /// Build a chunk or justification for preferences that left a sub-goal.
    pub(crate) fn learn(&mut self, results: Results) -> KernelResult<()> {
        let Some(level) = self.wm.inst(results.inst).map(|i| i.level) else {
            return Ok(());
        };
        let target = results
            .prefs
            .iter()
            .filter_map(|p| self.wm.pref(*p))
            .map(|p| self.symbols.level(p.ident))
            .min()
            .unwrap_or(1);
        let trace = self.backtrace(results.inst, level);
        if trace.grounds.is_empty() {
            return Ok(());
        }

        let mut chunk = self.config.learning;
        if chunk && self.learned.chunk_counter >= self.config.max_chunks {
            tracing::warn!(limit = self.config.max_chunks, "max chunks reached; building a justification");
            self.pending_stop.get_or_insert(StopReason::MaxChunks);
            chunk = false;
        }
        let built = if chunk {
            match self.build(&trace, &results.prefs, false) {
                Ok(body) => Some(body),
                Err(e) => {
                    tracing::debug!(error = %e, "chunk not generalizable; building a justification");
                    None
                }
            }
        } else {
            None
        };
        let (kind, (conditions, actions)) = match built {
            Some(body) => (ProductionKind::Chunk, body),
            None => match self.build(&trace, &results.prefs, true) {
                Ok(body) => (ProductionKind::Justification, body),
                Err(e) => {
                    tracing::warn!(error = %e, "justification rejected");
                    return Ok(());
                }
            },
        };

        let signature = if kind == ProductionKind::Chunk {
            let body = Production {
                name: String::new(),
                kind,
                documentation: None,
                conditions: conditions.clone(),
                actions: actions.clone(),
                ordinal: 0,
                firing_count: 0,
            };
            let rendered = body.render(&self.symbols);
            if let Some(existing) = self.learned.signatures.get(&rendered) {
                tracing::debug!(chunk = %existing, "duplicate chunk not installed");
                return Ok(());
            }
            Some(rendered)
        } else {
            None
        };

        let name = self.learned_name(kind, level);
        let prod = Production {
            name: name.clone(),
            kind,
            documentation: None,
            conditions,
            actions,
            ordinal: 0,
            firing_count: 0,
        };
        let id = self.install(prod)?;
        if let Some(sig) = signature {
            self.learned.signatures.insert(sig, name.clone());
            self.stats.chunks += 1;
            tracing::info!(chunk = %name, grounds = trace.grounds.len(), traced = trace.traced, "chunk built");
        } else {
            self.stats.justifications += 1;
            tracing::debug!(justification = %name, grounds = trace.grounds.len(), "justification built");
        }
        self.adopt_results(id, &trace.grounds, &results.prefs, target)?;
        Ok(())
    }

    /// Conditions and actions of a learned rule, in match order.
    fn build(
        &mut self,
        trace: &Backtrace,
        prefs: &[PrefId],
        ground: bool,
    ) -> KernelResult<(Vec<Condition>, Vec<Action>)> {
        let fields: Vec<(WmeId, WmeFields)> = trace
            .grounds
            .iter()
            .filter_map(|w| self.wm.wme(*w))
            .map(|w| (w.timetag, w.fields))
            .collect();
        let elements = canonical_order(&fields, &self.symbols);

        let bound: BTreeSet<Sym> = elements
            .iter()
            .flat_map(|f| [f.id, f.value])
            .filter(|s| self.symbols.is_identifier(*s))
            .collect();
        let mut v = Variablizer::new(ground);
        let mut conditions: Vec<Condition> = elements
            .iter()
            .map(|f| v.element(*f, &mut self.symbols))
            .collect();
        for neg in &trace.negations {
            let mut covered = true;
            neg.for_each_sym(&mut |s| {
                if self.symbols.is_identifier(s) && !bound.contains(&s) {
                    covered = false;
                }
            });
            if covered {
                conditions.push(v.condition(neg, &mut self.symbols));
            }
        }

        let mut actions = Vec::new();
        for p in prefs {
            let Some(pref) = self.wm.pref(*p).cloned() else {
                continue;
            };
            let make = Action::Make {
                id: pref.ident,
                attr: RhsValue::Sym(pref.attr),
                value: RhsValue::Sym(pref.value),
                preference: pref.kind,
                referent: pref.referent.map(RhsValue::Sym),
            };
            actions.push(v.action(&make, &mut self.symbols));
        }
        let conditions = order_conditions("learned rule", conditions, &self.symbols)?;
        Ok((conditions, actions))
    }

    fn learned_name(&mut self, kind: ProductionKind, level: u32) -> String {
        if kind == ProductionKind::Justification {
            self.learned.justification_counter += 1;
            return format!("justification-{}", self.learned.justification_counter);
        }
        let decision = self.stats.decisions + 1;
        if self.learned.last_chunk_decision != decision {
            self.learned.last_chunk_decision = decision;
            self.learned.chunks_this_decision = 0;
        }
        self.learned.chunks_this_decision += 1;
        self.learned.chunk_counter += 1;
        let operator = self.symbols.predefined().operator;
        let label = self
            .goals
            .get(level as usize - 1)
            .and_then(|g| g.impasse.as_ref())
            .map(|i| i.label(operator))
            .unwrap_or("snochange");
        format!(
            "{}-{}*d{}*{}*{}",
            self.config.chunk_name_prefix,
            self.learned.chunk_counter,
            decision,
            label,
            self.learned.chunks_this_decision
        )
    }

    /// Hand the results to the new rule's match on their grounds, so the
    /// rule does not fire again for the situation it was learned from.
    fn adopt_results(
        &mut self,
        id: ProdId,
        grounds: &BTreeSet<WmeId>,
        prefs: &[PrefId],
        target: u32,
    ) -> KernelResult<()> {
        let events = self.wm.rete_mut().take_events();
        let mut rest = Vec::with_capacity(events.len());
        let mut adopted: Option<(TokenId, Vec<Option<WmeId>>)> = None;
        for event in events {
            match event {
                MatchEvent::Assert { prod, token, wmes }
                    if prod == id
                        && adopted.is_none()
                        && wmes.iter().flatten().copied().collect::<BTreeSet<_>>() == *grounds =>
                {
                    adopted = Some((token, wmes));
                }
                other => rest.push(other),
            }
        }
        self.matches.ingest(rest);
        let Some((token, wmes)) = adopted else {
            return Ok(());
        };
        let Some(prod) = self.rules.prods.get(&id).cloned() else {
            return Ok(());
        };
        let bindings = self.bind(&prod.conditions, &wmes);
        let conditions = prod
            .conditions
            .iter()
            .map(|c| substitute_condition(c, &bindings))
            .collect();
        let goal = self.goal_at(target);
        let inst = self.wm.add_inst(Instantiation {
            id: 0,
            prod: id,
            prod_name: prod.name,
            prod_kind: prod.kind,
            goal,
            level: target,
            match_wmes: wmes,
            conditions,
            bindings,
            prefs: Vec::new(),
            matched: true,
            live_prefs: 0,
            tests_operator: false,
        })?;
        for p in prefs {
            self.wm.transfer_pref(*p, inst)?;
        }
        self.matches.fired.insert(token, inst);
        Ok(())
    }
}

/// Grounds in an order that does not depend on identifier names: by
/// attribute, then by value and identifier, identifiers compared by the
/// structure below them. Timetags break remaining ties.
fn canonical_order(fields: &[(WmeId, WmeFields)], symbols: &SymbolTable) -> Vec<WmeFields> {
    let shapes = Shapes::new(fields, symbols);
    let mut keyed: Vec<(String, String, bool, String, WmeId, WmeFields)> = fields
        .iter()
        .map(|(t, f)| {
            (
                symbols.display(f.attr),
                shapes.of(f.value, symbols),
                f.acceptable,
                shapes.of(f.id, symbols),
                *t,
                *f,
            )
        })
        .collect();
    keyed.sort_by(|a, b| (&a.0, &a.1, a.2, &a.3, a.4).cmp(&(&b.0, &b.1, b.2, &b.3, b.4)));
    keyed.into_iter().map(|k| k.5).collect()
}

/// Name-independent descriptions of the identifiers in a set of grounds.
struct Shapes {
    rendered: BTreeMap<Sym, String>,
}

impl Shapes {
    /// Nesting followed below each identifier.
    const DEPTH: usize = 3;

    fn new(fields: &[(WmeId, WmeFields)], symbols: &SymbolTable) -> Self {
        let mut below: BTreeMap<Sym, Vec<WmeFields>> = BTreeMap::new();
        for (_, f) in fields {
            below.entry(f.id).or_default().push(*f);
        }
        let rendered = below
            .keys()
            .map(|id| (*id, Self::render(*id, &below, symbols, Self::DEPTH)))
            .collect();
        Self { rendered }
    }

    fn render(
        id: Sym,
        below: &BTreeMap<Sym, Vec<WmeFields>>,
        symbols: &SymbolTable,
        depth: usize,
    ) -> String {
        if depth == 0 {
            return String::new();
        }
        let mut parts: Vec<String> = below
            .get(&id)
            .into_iter()
            .flatten()
            .map(|f| {
                let value = if symbols.is_identifier(f.value) {
                    format!("[{}]", Self::render(f.value, below, symbols, depth - 1))
                } else {
                    symbols.display(f.value)
                };
                let plus = if f.acceptable { " +" } else { "" };
                format!("^{} {value}{plus}", symbols.display(f.attr))
            })
            .collect();
        parts.sort();
        parts.join(" ")
    }

    /// Constants render as themselves; identifiers as their structure.
    fn of(&self, sym: Sym, symbols: &SymbolTable) -> String {
        if !symbols.is_identifier(sym) {
            return symbols.display(sym);
        }
        let shape = self.rendered.get(&sym).map(String::as_str).unwrap_or("");
        format!("[{shape}]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(fields: &[(WmeId, WmeFields)], symbols: &mut SymbolTable) -> Vec<String> {
        let mut v = Variablizer::new(false);
        canonical_order(fields, symbols)
            .into_iter()
            .map(|f| {
                let cond = v.element(f, symbols);
                let mut out = Vec::new();
                cond.for_each_sym(&mut |s| out.push(symbols.display(s)));
                out.join(" ")
            })
            .collect()
    }

    #[test]
    fn renamed_situations_variablize_alike() {
        let mut symbols = SymbolTable::new();
        let s1 = symbols.new_identifier('S', 1);
        let o1 = symbols.new_identifier('O', 1);
        let o2 = symbols.new_identifier('O', 1);
        let (item, name) = (symbols.string("item"), symbols.string("name"));
        let (a, b) = (symbols.string("a"), symbols.string("b"));

        let first = vec![
            (1, WmeFields::new(s1, item, o1)),
            (2, WmeFields::new(s1, item, o2)),
            (3, WmeFields::new(o1, name, a)),
            (4, WmeFields::new(o2, name, b)),
        ];
        // Same structure; the identifiers trade places.
        let second = vec![
            (1, WmeFields::new(s1, item, o1)),
            (2, WmeFields::new(s1, item, o2)),
            (3, WmeFields::new(o1, name, b)),
            (4, WmeFields::new(o2, name, a)),
        ];
        assert_eq!(rendered(&first, &mut symbols), rendered(&second, &mut symbols));
    }

    #[test]
    fn forgetting_a_chunk_drops_its_signature() {
        let mut state = LearnState::default();
        state.signatures.insert("body-a".into(), "chunk-1".into());
        state.signatures.insert("body-b".into(), "chunk-2".into());
        state.forget("chunk-1");
        assert_eq!(state.signatures.len(), 1);
        assert!(state.signatures.contains_key("body-b"));
    }
}
