//! Beta network nodes and join tests.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::CompileError;
use crate::memory::wme::{Field, WmeFields};
use crate::production::{ProdId, Relation, Test, Triple};
use crate::symbol::{Sym, SymbolTable};

use super::alpha::{AlphaKey, AmemId};
use super::token::TokenId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

/// Where a variable's value lives relative to the token being joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarLoc {
    /// Another field of the element being tested.
    Current(Field),
    /// `levels` parents above the left token (0 = the left token itself).
    Up { levels: u32, field: Field },
}

/// A test evaluated when joining an element with a partial match.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JoinTest {
    ConstEq { field: Field, sym: Sym },
    ConstRel { field: Field, rel: Relation, sym: Sym },
    OneOf { field: Field, syms: Vec<Sym> },
    VarEq { field: Field, loc: VarLoc },
    VarRel { field: Field, rel: Relation, loc: VarLoc },
    Goal { field: Field },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeKind {
    Root,
    Positive { amem: AmemId, tests: Vec<JoinTest> },
    Negative { amem: AmemId, tests: Vec<JoinTest> },
    Ncc { partner: NodeId },
    Partner {
        ncc: NodeId,
        conjuncts: u32,
        new_results: Vec<TokenId>,
    },
    Production { prod: ProdId },
}

#[derive(Debug)]
pub(crate) struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    /// Activated in order; an NCC node always follows its subnetwork.
    pub children: Vec<NodeId>,
    pub tokens: BTreeSet<TokenId>,
    /// Token depth below the root (root = 0).
    pub depth: u32,
}

/// Variable bindings visible while building a chain: variable → (depth, field).
pub(crate) type Bindings = BTreeMap<Sym, (u32, Field)>;

/// Compiled form of one condition: its alpha key, join tests and the
/// variables it binds for the first time.
pub(crate) struct CompiledTriple {
    pub key: AlphaKey,
    pub tests: Vec<JoinTest>,
    pub binds: Vec<(Sym, Field)>,
}

fn flatten<'a>(test: &'a Test, out: &mut Vec<&'a Test>) {
    match test {
        Test::Conjunction(ts) => ts.iter().for_each(|t| flatten(t, out)),
        other => out.push(other),
    }
}

/// Compile a triple whose tokens will sit at `depth`.
pub(crate) fn compile_triple(
    rule: &str,
    triple: &Triple,
    depth: u32,
    bindings: &Bindings,
    symbols: &SymbolTable,
) -> Result<CompiledTriple, CompileError> {
    let mut key = AlphaKey {
        id: None,
        attr: None,
        value: None,
        acceptable: triple.acceptable,
    };
    let mut tests = Vec::new();
    let mut binds: Vec<(Sym, Field)> = Vec::new();
    let fields = [
        (Field::Id, &triple.id),
        (Field::Attr, &triple.attr),
        (Field::Value, &triple.value),
    ];

    let locate = |var: Sym, binds: &[(Sym, Field)]| -> Option<VarLoc> {
        if let Some(&(d, f)) = bindings.get(&var) {
            return Some(VarLoc::Up {
                levels: depth - 1 - d,
                field: f,
            });
        }
        binds
            .iter()
            .find(|(s, _)| *s == var)
            .map(|&(_, f)| VarLoc::Current(f))
    };

    // Equalities first so later relational tests can see same-element bindings.
    for (field, test) in fields {
        let mut parts = Vec::new();
        flatten(test, &mut parts);
        for part in parts {
            let Test::Equality(sym) = part else { continue };
            if symbols.is_variable(*sym) {
                match locate(*sym, &binds) {
                    Some(loc) => tests.push(JoinTest::VarEq { field, loc }),
                    None => binds.push((*sym, field)),
                }
            } else {
                let slot = match field {
                    Field::Id => &mut key.id,
                    Field::Attr => &mut key.attr,
                    Field::Value => &mut key.value,
                };
                if slot.is_none() {
                    *slot = Some(*sym);
                } else {
                    tests.push(JoinTest::ConstEq { field, sym: *sym });
                }
            }
        }
    }

    for (field, test) in fields {
        let mut parts = Vec::new();
        flatten(test, &mut parts);
        for part in parts {
            match part {
                Test::Equality(_) | Test::Conjunction(_) => {}
                Test::Relational(rel, sym) => {
                    if symbols.is_variable(*sym) {
                        let loc = locate(*sym, &binds).ok_or_else(|| {
                            CompileError::UnboundRelationalVariable {
                                rule: rule.to_string(),
                                var: symbols
                                    .display(*sym)
                                    .trim_matches(|c| c == '<' || c == '>')
                                    .to_string(),
                            }
                        })?;
                        tests.push(JoinTest::VarRel {
                            field,
                            rel: *rel,
                            loc,
                        });
                    } else {
                        tests.push(JoinTest::ConstRel {
                            field,
                            rel: *rel,
                            sym: *sym,
                        });
                    }
                }
                Test::Disjunction(syms) => tests.push(JoinTest::OneOf {
                    field,
                    syms: syms.clone(),
                }),
                Test::Goal => tests.push(JoinTest::Goal { field }),
            }
        }
    }

    Ok(CompiledTriple { key, tests, binds })
}

/// Evaluate join tests for element `w` against the partial match ending at
/// `left`. `resolve` maps a token to its element's fields.
pub(crate) fn passes(
    tests: &[JoinTest],
    w: &WmeFields,
    left: Option<TokenId>,
    resolve: &impl Fn(TokenId, u32) -> Option<WmeFields>,
    symbols: &SymbolTable,
) -> bool {
    let value_at = |loc: VarLoc| -> Option<Sym> {
        match loc {
            VarLoc::Current(f) => Some(w.get(f)),
            VarLoc::Up { levels, field } => resolve(left?, levels).map(|f| f.get(field)),
        }
    };
    tests.iter().all(|t| match t {
        JoinTest::ConstEq { field, sym } => w.get(*field) == *sym,
        JoinTest::ConstRel { field, rel, sym } => rel.holds(symbols, w.get(*field), *sym),
        JoinTest::OneOf { field, syms } => syms.contains(&w.get(*field)),
        JoinTest::VarEq { field, loc } => value_at(*loc) == Some(w.get(*field)),
        JoinTest::VarRel { field, rel, loc } => {
            value_at(*loc).is_some_and(|r| rel.holds(symbols, w.get(*field), r))
        }
        JoinTest::Goal { field } => symbols.is_goal(w.get(*field)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_splits_constants_variables_and_relations() {
        let mut t = SymbolTable::new();
        let s = t.variable("s");
        let o = t.variable("o");
        let op = t.string("operator");
        let triple = Triple {
            id: Test::Conjunction(vec![Test::Goal, Test::Equality(s)]),
            attr: Test::Equality(op),
            value: Test::Conjunction(vec![
                Test::Equality(o),
                Test::Relational(Relation::NotEqual, s),
            ]),
            acceptable: false,
        };
        let c = compile_triple("r", &triple, 1, &Bindings::new(), &t).unwrap();
        assert_eq!(c.key.attr, Some(op));
        assert_eq!(c.binds, vec![(s, Field::Id), (o, Field::Value)]);
        assert!(c.tests.contains(&JoinTest::Goal { field: Field::Id }));
        assert!(c.tests.contains(&JoinTest::VarRel {
            field: Field::Value,
            rel: Relation::NotEqual,
            loc: VarLoc::Current(Field::Id),
        }));
    }

    #[test]
    fn earlier_bindings_become_upward_references() {
        let mut t = SymbolTable::new();
        let s = t.variable("s");
        let mut b = Bindings::new();
        b.insert(s, (1, Field::Value));
        let triple = Triple {
            id: Test::Equality(s),
            attr: Test::Equality(t.string("name")),
            value: Test::Equality(t.string("x")),
            acceptable: false,
        };
        let c = compile_triple("r", &triple, 3, &b, &t).unwrap();
        assert_eq!(
            c.tests,
            vec![JoinTest::VarEq {
                field: Field::Id,
                loc: VarLoc::Up {
                    levels: 1,
                    field: Field::Value
                }
            }]
        );
    }
}
