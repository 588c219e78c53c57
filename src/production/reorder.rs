//! Condition validation and ordering.
//!
//! Conditions are placed greedily: among the positive conditions whose
//! identifier is already bound (or which test a state), the one expected to
//! add the fewest new bindings goes next. Negations are placed as soon as
//! every variable they share with the positive conditions is bound, so the
//! matcher never tests an unbound variable.

use std::collections::BTreeSet;

use crate::error::CompileError;
use crate::symbol::{Sym, SymbolTable};

use super::{Condition, Test, Triple};

/// Validate `conds` and return them in match order.
pub fn order_conditions(
    rule: &str,
    conds: Vec<Condition>,
    symbols: &SymbolTable,
) -> Result<Vec<Condition>, CompileError> {
    if !conds.iter().any(|c| matches!(c, Condition::Positive(_))) {
        return Err(CompileError::NoPositiveConditions {
            rule: rule.to_string(),
        });
    }
    let outer = positive_bindings(&conds, symbols);
    for c in &conds {
        match c {
            Condition::Positive(t) => {
                for v in t.relational_vars(symbols) {
                    if !outer.contains(&v) {
                        return Err(unbound_relational(rule, v, symbols));
                    }
                }
            }
            Condition::Negative(_) | Condition::Ncc(_) => {
                validate_negation(rule, c, &outer, symbols)?;
            }
        }
    }
    order(rule, conds, &BTreeSet::new(), symbols)
}

/// Variables bound by equality tests of the positive conditions in `conds`.
fn positive_bindings(conds: &[Condition], symbols: &SymbolTable) -> BTreeSet<Sym> {
    conds
        .iter()
        .filter_map(|c| match c {
            Condition::Positive(t) => Some(t.equality_vars(symbols)),
            _ => None,
        })
        .flatten()
        .collect()
}

fn validate_negation(
    rule: &str,
    cond: &Condition,
    outer: &BTreeSet<Sym>,
    symbols: &SymbolTable,
) -> Result<(), CompileError> {
    match cond {
        Condition::Positive(t) | Condition::Negative(t) => {
            check_id_bound(rule, t, outer, symbols)?;
            let local: BTreeSet<Sym> = t.equality_vars(symbols).into_iter().collect();
            for v in t.relational_vars(symbols) {
                if !outer.contains(&v) && !local.contains(&v) {
                    return Err(unbound_relational(rule, v, symbols));
                }
            }
            Ok(())
        }
        Condition::Ncc(inner) => {
            if inner.is_empty() {
                return Err(CompileError::MalformedTest {
                    rule: rule.to_string(),
                    detail: "empty conjunctive negation".into(),
                });
            }
            let mut scope = outer.clone();
            scope.extend(positive_bindings(inner, symbols));
            for c in inner {
                validate_negation(rule, c, &scope, symbols)?;
            }
            Ok(())
        }
    }
}

fn check_id_bound(
    rule: &str,
    t: &Triple,
    bound: &BTreeSet<Sym>,
    symbols: &SymbolTable,
) -> Result<(), CompileError> {
    if id_ready(t, bound, symbols) {
        return Ok(());
    }
    let var = t
        .id
        .equalities()
        .first()
        .map(|s| symbols.display(*s))
        .unwrap_or_else(|| "?".to_string());
    Err(CompileError::UnboundNegationVariable {
        rule: rule.to_string(),
        var: var.trim_matches(|c| c == '<' || c == '>').to_string(),
    })
}

fn unbound_relational(rule: &str, var: Sym, symbols: &SymbolTable) -> CompileError {
    CompileError::UnboundRelationalVariable {
        rule: rule.to_string(),
        var: symbols
            .display(var)
            .trim_matches(|c| c == '<' || c == '>')
            .to_string(),
    }
}

/// Can the identifier field be matched without a cross product?
fn id_ready(t: &Triple, bound: &BTreeSet<Sym>, symbols: &SymbolTable) -> bool {
    t.id.has_goal_test()
        || t
            .id
            .equalities()
            .iter()
            .any(|s| !symbols.is_variable(*s) || bound.contains(s))
}

fn rel_ready(t: &Triple, bound: &BTreeSet<Sym>, symbols: &SymbolTable) -> bool {
    let own = t.equality_vars(symbols);
    t.relational_vars(symbols)
        .iter()
        .all(|v| bound.contains(v) || own.contains(v))
}

fn field_bound(test: &Test, bound: &BTreeSet<Sym>, symbols: &SymbolTable) -> bool {
    test.equalities()
        .iter()
        .any(|s| !symbols.is_variable(*s) || bound.contains(s))
}

fn cost(t: &Triple, bound: &BTreeSet<Sym>, symbols: &SymbolTable) -> u8 {
    match (
        field_bound(&t.attr, bound, symbols),
        field_bound(&t.value, bound, symbols),
    ) {
        (true, true) => 0,
        (true, false) => 1,
        _ => 2,
    }
}

fn order(
    rule: &str,
    conds: Vec<Condition>,
    prebound: &BTreeSet<Sym>,
    symbols: &SymbolTable,
) -> Result<Vec<Condition>, CompileError> {
    let mut scope = prebound.clone();
    scope.extend(positive_bindings(&conds, symbols));

    let mut positives: Vec<Triple> = Vec::new();
    let mut negations: Vec<Condition> = Vec::new();
    for c in conds {
        match c {
            Condition::Positive(t) => positives.push(t),
            other => negations.push(other),
        }
    }

    let mut bound = prebound.clone();
    let mut out = Vec::new();
    place_negations(rule, &mut negations, &bound, &scope, &mut out, symbols)?;

    while !positives.is_empty() {
        let pick = positives
            .iter()
            .enumerate()
            .filter(|(_, t)| id_ready(t, &bound, symbols) && rel_ready(t, &bound, symbols))
            .min_by_key(|(i, t)| (cost(t, &bound, symbols), *i))
            .map(|(i, _)| i);
        let Some(i) = pick else {
            let first = &positives[0];
            if id_ready(first, &bound, symbols) {
                if let Some(var) = first
                    .relational_vars(symbols)
                    .into_iter()
                    .find(|v| !bound.contains(v))
                {
                    return Err(unbound_relational(rule, var, symbols));
                }
            }
            let var = first
                .id
                .equalities()
                .first()
                .map(|s| symbols.display(*s))
                .unwrap_or_else(|| "?".to_string());
            return Err(CompileError::Unconnected {
                rule: rule.to_string(),
                var: var.trim_matches(|c| c == '<' || c == '>').to_string(),
            });
        };
        let t = positives.remove(i);
        bound.extend(t.equality_vars(symbols));
        out.push(Condition::Positive(t));
        place_negations(rule, &mut negations, &bound, &scope, &mut out, symbols)?;
    }

    if let Some(left) = negations.first() {
        let missing = left
            .variables(symbols)
            .into_iter()
            .find(|v| scope.contains(v) && !bound.contains(v));
        return Err(CompileError::UnboundNegationVariable {
            rule: rule.to_string(),
            var: missing
                .map(|v| symbols.display(v))
                .unwrap_or_else(|| "?".into())
                .trim_matches(|c| c == '<' || c == '>')
                .to_string(),
        });
    }
    Ok(out)
}

/// Move every negation whose shared variables are all bound into `out`.
fn place_negations(
    rule: &str,
    negations: &mut Vec<Condition>,
    bound: &BTreeSet<Sym>,
    scope: &BTreeSet<Sym>,
    out: &mut Vec<Condition>,
    symbols: &SymbolTable,
) -> Result<(), CompileError> {
    let mut i = 0;
    while i < negations.len() {
        let ready = negations[i]
            .variables(symbols)
            .iter()
            .all(|v| !scope.contains(v) || bound.contains(v));
        if !ready {
            i += 1;
            continue;
        }
        match negations.remove(i) {
            Condition::Ncc(inner) => {
                let inner = order(rule, inner, bound, symbols)?;
                out.push(Condition::Ncc(inner));
            }
            other => out.push(other),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(t: &mut SymbolTable, id: &str, attr: &str, value: &str, goal: bool) -> Triple {
        let mut sym = |s: &str| {
            if s.starts_with('<') {
                t.variable(s)
            } else {
                t.string(s)
            }
        };
        let id_sym = sym(id);
        let id = if goal {
            Test::Conjunction(vec![Test::Goal, Test::Equality(id_sym)])
        } else {
            Test::Equality(id_sym)
        };
        Triple {
            id,
            attr: Test::Equality(sym(attr)),
            value: Test::Equality(sym(value)),
            acceptable: false,
        }
    }

    #[test]
    fn connected_chain_is_ordered_from_the_state() {
        let mut t = SymbolTable::new();
        let c1 = triple(&mut t, "<o>", "name", "foo", false);
        let c2 = triple(&mut t, "<s>", "operator", "<o>", true);
        let out = order_conditions(
            "r",
            vec![Condition::Positive(c1.clone()), Condition::Positive(c2.clone())],
            &t,
        )
        .unwrap();
        assert_eq!(out, vec![Condition::Positive(c2), Condition::Positive(c1)]);
    }

    #[test]
    fn negation_waits_for_its_bindings() {
        let mut t = SymbolTable::new();
        let neg = triple(&mut t, "<o>", "done", "yes", false);
        let c1 = triple(&mut t, "<s>", "operator", "<o>", true);
        let out = order_conditions(
            "r",
            vec![Condition::Negative(neg.clone()), Condition::Positive(c1.clone())],
            &t,
        )
        .unwrap();
        assert_eq!(out, vec![Condition::Positive(c1), Condition::Negative(neg)]);
    }

    #[test]
    fn unbound_negation_identifier_is_rejected() {
        let mut t = SymbolTable::new();
        let neg = triple(&mut t, "<x>", "done", "yes", false);
        let c1 = triple(&mut t, "<s>", "superstate", "nil", true);
        let err = order_conditions(
            "r",
            vec![Condition::Positive(c1), Condition::Negative(neg)],
            &t,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnboundNegationVariable { var, .. } if var == "x"));
    }

    #[test]
    fn rule_without_positive_conditions_is_rejected() {
        let mut t = SymbolTable::new();
        let neg = triple(&mut t, "<s>", "done", "yes", true);
        let err = order_conditions("r", vec![Condition::Negative(neg)], &t).unwrap_err();
        assert!(matches!(err, CompileError::NoPositiveConditions { .. }));
    }

    #[test]
    fn disconnected_condition_is_rejected() {
        let mut t = SymbolTable::new();
        let c1 = triple(&mut t, "<s>", "superstate", "nil", true);
        let c2 = triple(&mut t, "<x>", "color", "red", false);
        let err = order_conditions(
            "r",
            vec![Condition::Positive(c1), Condition::Positive(c2)],
            &t,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::Unconnected { var, .. } if var == "x"));
    }

    #[test]
    fn relational_variable_must_be_bound() {
        let mut t = SymbolTable::new();
        let mut c1 = triple(&mut t, "<s>", "count", "<n>", true);
        let m = t.variable("m");
        c1.value = Test::Conjunction(vec![
            Test::Equality(t.variable("n")),
            Test::Relational(crate::production::Relation::Less, m),
        ]);
        let err = order_conditions("r", vec![Condition::Positive(c1)], &t).unwrap_err();
        assert!(matches!(err, CompileError::UnboundRelationalVariable { var, .. } if var == "m"));
    }
}
