//! Turning a parsed [`RuleDef`] into a [`Production`].

use crate::error::CompileError;
use crate::rhs;
use crate::symbol::{Sym, SymbolTable};

use super::ast::{ActionDef, CondDef, RhsDef, RuleDef, Term, TestDef, TripleDef};
use super::reorder::order_conditions;
use super::{Action, Condition, PreferenceType, Production, RhsValue, Test, Triple};

/// Intern a term.
pub fn intern_term(term: &Term, symbols: &mut SymbolTable) -> Sym {
    match term {
        Term::Int(i) => symbols.int(*i),
        Term::Float(x) => symbols.float(*x),
        Term::Text(s) => match term.as_variable() {
            Some(v) => symbols.variable(v),
            None => symbols.string(s),
        },
    }
}

/// Field position, used to reject state tests outside the identifier.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Id,
    Other,
}

/// Compile a parsed rule into a production with ordered conditions.
pub fn compile_rule(
    def: &RuleDef,
    symbols: &mut SymbolTable,
    ordinal: u64,
) -> Result<Production, CompileError> {
    let rule = def.name.as_str();
    let conditions = def
        .conditions
        .iter()
        .map(|c| compile_condition(rule, c, symbols))
        .collect::<Result<Vec<_>, _>>()?;
    let actions = def
        .actions
        .iter()
        .map(|a| compile_action(rule, a, symbols))
        .collect::<Result<Vec<_>, _>>()?;
    let conditions = order_conditions(rule, conditions, symbols)?;
    Ok(Production {
        name: def.name.clone(),
        kind: def.kind,
        documentation: def.documentation.clone(),
        conditions,
        actions,
        ordinal,
        firing_count: 0,
    })
}

fn compile_condition(
    rule: &str,
    cond: &CondDef,
    symbols: &mut SymbolTable,
) -> Result<Condition, CompileError> {
    Ok(match cond {
        CondDef::Positive(t) => Condition::Positive(compile_triple(rule, t, symbols)?),
        CondDef::Negative(t) => Condition::Negative(compile_triple(rule, t, symbols)?),
        CondDef::Ncc(inner) => Condition::Ncc(
            inner
                .iter()
                .map(|c| compile_condition(rule, c, symbols))
                .collect::<Result<Vec<_>, _>>()?,
        ),
    })
}

fn compile_triple(
    rule: &str,
    t: &TripleDef,
    symbols: &mut SymbolTable,
) -> Result<Triple, CompileError> {
    Ok(Triple {
        id: compile_test(rule, &t.id, Field::Id, symbols)?,
        attr: compile_test(rule, &t.attr, Field::Other, symbols)?,
        value: compile_test(rule, &t.value, Field::Other, symbols)?,
        acceptable: t.acceptable,
    })
}

fn compile_test(
    rule: &str,
    test: &TestDef,
    field: Field,
    symbols: &mut SymbolTable,
) -> Result<Test, CompileError> {
    let malformed = |detail: &str| CompileError::MalformedTest {
        rule: rule.to_string(),
        detail: detail.to_string(),
    };
    Ok(match test {
        TestDef::Eq(term) => Test::Equality(intern_term(term, symbols)),
        TestDef::Rel(rel, term) => Test::Relational(*rel, intern_term(term, symbols)),
        TestDef::OneOf(terms) => {
            if terms.is_empty() {
                return Err(malformed("empty disjunction"));
            }
            if terms.iter().any(Term::is_variable) {
                return Err(malformed("variables are not allowed in a disjunction"));
            }
            Test::Disjunction(terms.iter().map(|t| intern_term(t, symbols)).collect())
        }
        TestDef::All(tests) => {
            if tests.is_empty() {
                return Err(malformed("empty conjunctive test"));
            }
            Test::Conjunction(
                tests
                    .iter()
                    .map(|t| compile_test(rule, t, field, symbols))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        }
        TestDef::State => {
            if field != Field::Id {
                return Err(malformed("a state test can only apply to the identifier field"));
            }
            Test::Goal
        }
    })
}

fn compile_rhs(rule: &str, v: &RhsDef, symbols: &mut SymbolTable) -> Result<RhsValue, CompileError> {
    Ok(match v {
        RhsDef::Term(term) => RhsValue::Sym(intern_term(term, symbols)),
        RhsDef::Call { function, args } => {
            if !rhs::is_known(function) {
                return Err(CompileError::UnknownFunction {
                    rule: rule.to_string(),
                    function: function.clone(),
                });
            }
            RhsValue::Call {
                function: function.clone(),
                args: args
                    .iter()
                    .map(|a| compile_rhs(rule, a, symbols))
                    .collect::<Result<Vec<_>, _>>()?,
            }
        }
    })
}

fn compile_action(
    rule: &str,
    action: &ActionDef,
    symbols: &mut SymbolTable,
) -> Result<Action, CompileError> {
    let invalid = |detail: String| CompileError::InvalidAction {
        rule: rule.to_string(),
        detail,
    };
    match action {
        ActionDef::Make {
            id,
            attr,
            value,
            preference,
            referent,
        } => {
            if !id.is_variable() {
                return Err(invalid(format!("identifier {id:?} must be a variable")));
            }
            let needs_referent =
                preference.is_binary() || *preference == PreferenceType::NumericIndifferent;
            match (needs_referent, referent.is_some()) {
                (true, false) => {
                    return Err(invalid(format!("{preference:?} preference needs a referent")));
                }
                (false, true) => {
                    return Err(invalid(format!("{preference:?} preference takes no referent")));
                }
                _ => {}
            }
            let referent = referent
                .as_ref()
                .map(|r| compile_rhs(rule, r, symbols))
                .transpose()?;
            Ok(Action::Make {
                id: intern_term(id, symbols),
                attr: compile_rhs(rule, attr, symbols)?,
                value: compile_rhs(rule, value, symbols)?,
                preference: *preference,
                referent,
            })
        }
        ActionDef::Call { function, args } => {
            if !rhs::is_known(function) {
                return Err(CompileError::UnknownFunction {
                    rule: rule.to_string(),
                    function: function.clone(),
                });
            }
            Ok(Action::Call {
                function: function.clone(),
                args: args
                    .iter()
                    .map(|a| compile_rhs(rule, a, symbols))
                    .collect::<Result<Vec<_>, _>>()?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::production::ast::Cond;

    #[test]
    fn compiles_and_orders_simple_rule() {
        let mut symbols = SymbolTable::new();
        let def = RuleDef::new("propose")
            .when(Cond::new("<o>", "name", "go"))
            .when(Cond::state("<s>", "operator", "<o>"))
            .then_make("<s>", "moved", "yes");
        let prod = compile_rule(&def, &mut symbols, 0).unwrap();
        assert_eq!(prod.conditions.len(), 2);
        let Condition::Positive(first) = &prod.conditions[0] else {
            panic!("first condition should be positive");
        };
        assert!(first.id.has_goal_test());
    }

    #[test]
    fn unknown_function_is_a_compile_error() {
        let mut symbols = SymbolTable::new();
        let def = RuleDef::new("bad")
            .when(Cond::state("<s>", "superstate", "nil"))
            .then_call("no-such-function", vec![]);
        let err = compile_rule(&def, &mut symbols, 0).unwrap_err();
        assert!(matches!(err, CompileError::UnknownFunction { .. }));
    }

    #[test]
    fn better_preference_requires_referent() {
        let mut symbols = SymbolTable::new();
        let def = RuleDef::new("bad")
            .when(Cond::state("<s>", "operator", "<o>"))
            .then_prefer("<s>", "operator", "<o>", PreferenceType::Better);
        let err = compile_rule(&def, &mut symbols, 0).unwrap_err();
        assert!(matches!(err, CompileError::InvalidAction { .. }));
    }

    #[test]
    fn state_test_outside_identifier_is_malformed() {
        let mut symbols = SymbolTable::new();
        let def = RuleDef::new("bad")
            .when(Cond::new(TestDef::State.and("<s>"), "x", TestDef::State))
            .then_make("<s>", "y", "z");
        let err = compile_rule(&def, &mut symbols, 0).unwrap_err();
        assert!(matches!(err, CompileError::MalformedTest { .. }));
    }
}
