//! Replacing identifiers with variables.

use std::collections::{BTreeMap, BTreeSet};

use crate::memory::wme::WmeFields;
use crate::production::{Action, Condition, RhsValue, Test, Triple};
use crate::symbol::{Sym, SymbolTable, SymbolValue};

/// Maps each identifier to one variable, consistently across a rule.
///
/// A ground variablizer leaves identifiers alone; it is used for
/// justifications.
#[derive(Debug, Default)]
pub(crate) struct Variablizer {
    ground: bool,
    map: BTreeMap<Sym, Sym>,
    counters: BTreeMap<char, u32>,
    goals_tested: BTreeSet<Sym>,
}

impl Variablizer {
    pub fn new(ground: bool) -> Self {
        Self {
            ground,
            ..Default::default()
        }
    }

    pub fn symbol(&mut self, sym: Sym, symbols: &mut SymbolTable) -> Sym {
        if self.ground {
            return sym;
        }
        let letter = match symbols.get(sym) {
            Some(SymbolValue::Identifier { letter, .. }) => letter.to_ascii_lowercase(),
            _ => return sym,
        };
        if let Some(var) = self.map.get(&sym) {
            return *var;
        }
        let n = self.counters.entry(letter).or_insert(0);
        *n += 1;
        let var = symbols.variable(&format!("{letter}{n}"));
        self.map.insert(sym, var);
        var
    }

    /// Test for the identifier field of a positive condition. The first
    /// test of a goal also checks that it is a state.
    fn id_test(&mut self, sym: Sym, symbols: &mut SymbolTable) -> Test {
        let var = self.symbol(sym, symbols);
        if !self.ground && symbols.is_goal(sym) && self.goals_tested.insert(sym) {
            Test::Conjunction(vec![Test::Goal, Test::Equality(var)])
        } else {
            Test::Equality(var)
        }
    }

    fn test(&mut self, test: &Test, symbols: &mut SymbolTable) -> Test {
        match test {
            Test::Equality(s) => Test::Equality(self.symbol(*s, symbols)),
            Test::Relational(r, s) => Test::Relational(*r, self.symbol(*s, symbols)),
            Test::Disjunction(v) => Test::Disjunction(v.clone()),
            Test::Conjunction(ts) => {
                Test::Conjunction(ts.iter().map(|t| self.test(t, symbols)).collect())
            }
            Test::Goal => Test::Goal,
        }
    }

    /// The condition matching exactly this element.
    pub fn element(
        &mut self,
        fields: WmeFields,
        symbols: &mut SymbolTable,
    ) -> Condition {
        Condition::Positive(Triple {
            id: self.id_test(fields.id, symbols),
            attr: Test::Equality(self.symbol(fields.attr, symbols)),
            value: Test::Equality(self.symbol(fields.value, symbols)),
            acceptable: fields.acceptable,
        })
    }

    fn triple(&mut self, t: &Triple, symbols: &mut SymbolTable) -> Triple {
        Triple {
            id: self.test(&t.id, symbols),
            attr: self.test(&t.attr, symbols),
            value: self.test(&t.value, symbols),
            acceptable: t.acceptable,
        }
    }

    pub fn condition(&mut self, cond: &Condition, symbols: &mut SymbolTable) -> Condition {
        match cond {
            Condition::Positive(t) => Condition::Positive(self.triple(t, symbols)),
            Condition::Negative(t) => Condition::Negative(self.triple(t, symbols)),
            Condition::Ncc(cs) => {
                Condition::Ncc(cs.iter().map(|c| self.condition(c, symbols)).collect())
            }
        }
    }

    pub fn action(&mut self, action: &Action, symbols: &mut SymbolTable) -> Action {
        match action {
            Action::Make {
                id,
                attr,
                value,
                preference,
                referent,
            } => Action::Make {
                id: self.symbol(*id, symbols),
                attr: self.rhs(attr, symbols),
                value: self.rhs(value, symbols),
                preference: *preference,
                referent: referent.as_ref().map(|r| self.rhs(r, symbols)),
            },
            Action::Call { function, args } => Action::Call {
                function: function.clone(),
                args: args.iter().map(|a| self.rhs(a, symbols)).collect(),
            },
        }
    }

    fn rhs(&mut self, value: &RhsValue, symbols: &mut SymbolTable) -> RhsValue {
        match value {
            RhsValue::Sym(s) => RhsValue::Sym(self.symbol(*s, symbols)),
            RhsValue::Call { function, args } => RhsValue::Call {
                function: function.clone(),
                args: args.iter().map(|a| self.rhs(a, symbols)).collect(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_map_to_one_variable_each() {
        let mut symbols = SymbolTable::new();
        let s1 = symbols.new_identifier('S', 1);
        symbols.set_goal(s1, true);
        let o1 = symbols.new_identifier('O', 1);
        let op = symbols.string("operator");
        let name = symbols.string("name");
        let a = symbols.string("a");

        let mut v = Variablizer::new(false);
        let mut acceptable = WmeFields::new(s1, op, o1);
        acceptable.acceptable = true;
        let first = v.element(acceptable, &mut symbols);
        let second = v.element(WmeFields::new(o1, name, a), &mut symbols);
        let Condition::Positive(t1) = first else {
            panic!("expected a positive condition");
        };
        let Condition::Positive(t2) = second else {
            panic!("expected a positive condition");
        };
        assert!(t1.id.has_goal_test());
        assert!(!t2.id.has_goal_test());
        assert_eq!(t1.value, t2.id);
        assert_eq!(t2.value, Test::Equality(a));
        let var = v.symbol(o1, &mut symbols);
        assert_eq!(symbols.display(var), "<o1>");
    }

    #[test]
    fn ground_variablizer_keeps_identifiers() {
        let mut symbols = SymbolTable::new();
        let s1 = symbols.new_identifier('S', 1);
        let mut v = Variablizer::new(true);
        assert_eq!(v.symbol(s1, &mut symbols), s1);
    }
}
