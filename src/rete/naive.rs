//! Brute-force matcher.
//!
//! Evaluates conditions by backtracking over every element. Far too slow for
//! real use, but simple enough to trust; the network's match set is checked
//! against it.

use std::collections::{BTreeMap, BTreeSet};

use crate::memory::wme::{WmeFields, WmeId};
use crate::production::{Condition, Test, Triple};
use crate::symbol::{Sym, SymbolTable};

type Env = BTreeMap<Sym, Sym>;

/// Every match of `conds` over `wmes`, reduced to the positive elements in
/// condition order.
pub fn naive_matches(
    conds: &[Condition],
    wmes: &BTreeMap<WmeId, WmeFields>,
    symbols: &SymbolTable,
) -> BTreeSet<Vec<WmeId>> {
    let mut out = BTreeSet::new();
    search(conds, wmes, symbols, Env::new(), Vec::new(), &mut |_: Env, m: Vec<WmeId>| {
        out.insert(m);
    });
    out
}

fn search(
    conds: &[Condition],
    wmes: &BTreeMap<WmeId, WmeFields>,
    symbols: &SymbolTable,
    env: Env,
    acc: Vec<WmeId>,
    found: &mut dyn FnMut(Env, Vec<WmeId>),
) {
    let Some((first, rest)) = conds.split_first() else {
        found(env, acc);
        return;
    };
    match first {
        Condition::Positive(t) => {
            for (w, f) in wmes {
                if let Some(env) = bind_triple(t, f, &env, symbols) {
                    let mut acc = acc.clone();
                    acc.push(*w);
                    search(rest, wmes, symbols, env, acc, found);
                }
            }
        }
        Condition::Negative(t) => {
            let blocked = wmes
                .values()
                .any(|f| bind_triple(t, f, &env, symbols).is_some());
            if !blocked {
                search(rest, wmes, symbols, env, acc, found);
            }
        }
        Condition::Ncc(inner) => {
            let mut any = false;
            search(inner, wmes, symbols, env.clone(), Vec::new(), &mut |_: Env, _: Vec<WmeId>| {
                any = true;
            });
            if !any {
                search(rest, wmes, symbols, env, acc, found);
            }
        }
    }
}

fn bind_triple(t: &Triple, f: &WmeFields, env: &Env, symbols: &SymbolTable) -> Option<Env> {
    if t.acceptable != f.acceptable {
        return None;
    }
    let fields = [(&t.id, f.id), (&t.attr, f.attr), (&t.value, f.value)];
    let mut env = env.clone();
    for (test, value) in fields {
        bind_equalities(test, value, &mut env, symbols)?;
    }
    for (test, value) in fields {
        if !check_rest(test, value, &env, symbols) {
            return None;
        }
    }
    Some(env)
}

fn bind_equalities(test: &Test, value: Sym, env: &mut Env, symbols: &SymbolTable) -> Option<()> {
    match test {
        Test::Equality(s) if symbols.is_variable(*s) => match env.get(s) {
            Some(bound) => (*bound == value).then_some(()),
            None => {
                env.insert(*s, value);
                Some(())
            }
        },
        Test::Equality(s) => (*s == value).then_some(()),
        Test::Conjunction(ts) => ts
            .iter()
            .try_for_each(|t| bind_equalities(t, value, env, symbols)),
        _ => Some(()),
    }
}

fn check_rest(test: &Test, value: Sym, env: &Env, symbols: &SymbolTable) -> bool {
    match test {
        Test::Equality(_) => true,
        Test::Relational(rel, s) => {
            let referent = if symbols.is_variable(*s) {
                match env.get(s) {
                    Some(r) => *r,
                    None => return false,
                }
            } else {
                *s
            };
            rel.holds(symbols, value, referent)
        }
        Test::Disjunction(syms) => syms.contains(&value),
        Test::Conjunction(ts) => ts.iter().all(|t| check_rest(t, value, env, symbols)),
        Test::Goal => symbols.is_goal(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::production::Relation;

    #[test]
    fn negation_and_relations() {
        let mut s = SymbolTable::new();
        let x = s.variable("x");
        let n = s.variable("n");
        let (a, b) = (s.string("a"), s.string("b"));
        let (on, size, red) = (s.string("on"), s.string("size"), s.string("red"));
        let color = s.string("color");
        let (three, seven) = (s.int(3), s.int(7));
        let wmes: BTreeMap<WmeId, WmeFields> = [
            (1, WmeFields::new(a, on, b)),
            (2, WmeFields::new(b, size, three)),
            (3, WmeFields::new(a, size, seven)),
            (4, WmeFields::new(b, color, red)),
        ]
        .into_iter()
        .collect();
        let five = s.int(5);
        let conds = vec![
            Condition::Positive(Triple {
                id: Test::Equality(x),
                attr: Test::Equality(size),
                value: Test::Conjunction(vec![
                    Test::Equality(n),
                    Test::Relational(Relation::Less, five),
                ]),
                acceptable: false,
            }),
            Condition::Negative(Triple {
                id: Test::Equality(x),
                attr: Test::Equality(color),
                value: Test::Equality(red),
                acceptable: false,
            }),
        ];
        assert!(naive_matches(&conds, &wmes, &s).is_empty());
        let conds = &conds[..1];
        let got = naive_matches(conds, &wmes, &s);
        assert_eq!(got, [vec![2]].into_iter().collect());
    }
}
