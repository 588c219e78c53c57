//! Preference semantics for one slot.
//!
//! [`resolve`] is a pure function of the preference set: it never looks at
//! assertion order, and candidates come back in canonical symbol order so
//! callers see the same result for the same preferences.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::production::PreferenceType;
use crate::symbol::{Sym, SymbolTable};

use super::exploration::NumericMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ImpasseKind {
    Tie,
    Conflict,
    ConstraintFailure,
    NoChange,
}

impl fmt::Display for ImpasseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImpasseKind::Tie => "tie",
            ImpasseKind::Conflict => "conflict",
            ImpasseKind::ConstraintFailure => "constraint-failure",
            ImpasseKind::NoChange => "no-change",
        })
    }
}

/// The parts of a preference that matter to resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefView {
    pub kind: PreferenceType,
    pub value: Sym,
    pub referent: Option<Sym>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Decided(Sym),
    /// Mutually indifferent candidates; the exploration policy picks one.
    Indifferent(Vec<Sym>),
    Impasse(ImpasseKind, Vec<Sym>),
    /// Nothing acceptable.
    Empty,
}

fn sorted(values: impl IntoIterator<Item = Sym>, symbols: &SymbolTable) -> Vec<Sym> {
    let set: BTreeSet<Sym> = values.into_iter().collect();
    let mut out: Vec<Sym> = set.into_iter().collect();
    out.sort_by(|a, b| symbols.canonical_cmp(*a, *b));
    out
}

fn values_of(prefs: &[PrefView], kind: PreferenceType) -> impl Iterator<Item = Sym> + '_ {
    prefs.iter().filter(move |p| p.kind == kind).map(|p| p.value)
}

/// Values an ordinary (non-decision) slot puts into working memory.
pub fn slot_values(prefs: &[PrefView], symbols: &SymbolTable) -> Vec<Sym> {
    let excluded: BTreeSet<Sym> = values_of(prefs, PreferenceType::Reject)
        .chain(values_of(prefs, PreferenceType::Prohibit))
        .collect();
    sorted(
        values_of(prefs, PreferenceType::Acceptable)
            .chain(values_of(prefs, PreferenceType::Require))
            .filter(|v| !excluded.contains(v)),
        symbols,
    )
}

/// Values mirrored as acceptable-preference elements of a decision slot.
pub fn acceptable_values(prefs: &[PrefView], symbols: &SymbolTable) -> Vec<Sym> {
    sorted(
        values_of(prefs, PreferenceType::Acceptable).chain(values_of(prefs, PreferenceType::Require)),
        symbols,
    )
}

/// Decide a decision slot.
pub fn resolve(prefs: &[PrefView], symbols: &SymbolTable) -> Resolution {
    let prohibited: BTreeSet<Sym> = values_of(prefs, PreferenceType::Prohibit).collect();
    let rejected: BTreeSet<Sym> = values_of(prefs, PreferenceType::Reject).collect();

    let required = sorted(values_of(prefs, PreferenceType::Require), symbols);
    match required.as_slice() {
        [] => {}
        [only] if !prohibited.contains(only) => return Resolution::Decided(*only),
        _ => return Resolution::Impasse(ImpasseKind::ConstraintFailure, required),
    }

    let mut candidates = sorted(
        values_of(prefs, PreferenceType::Acceptable)
            .filter(|v| !rejected.contains(v) && !prohibited.contains(v)),
        symbols,
    );
    match candidates.as_slice() {
        [] => return Resolution::Empty,
        [only] => return Resolution::Decided(*only),
        _ => {}
    }

    // Better/worse as (superior, inferior) pairs among live candidates.
    let live: BTreeSet<Sym> = candidates.iter().copied().collect();
    let dominance: BTreeSet<(Sym, Sym)> = prefs
        .iter()
        .filter_map(|p| {
            let r = p.referent?;
            match p.kind {
                PreferenceType::Better => Some((p.value, r)),
                PreferenceType::Worse => Some((r, p.value)),
                _ => None,
            }
        })
        .filter(|(a, b)| a != b && live.contains(a) && live.contains(b))
        .collect();
    let conflicted = sorted(
        dominance
            .iter()
            .filter(|(a, b)| dominance.contains(&(*b, *a)))
            .map(|(a, _)| *a),
        symbols,
    );
    if !conflicted.is_empty() {
        return Resolution::Impasse(ImpasseKind::Conflict, conflicted);
    }
    let dominated: BTreeSet<Sym> = dominance.iter().map(|(_, b)| *b).collect();
    let undominated: Vec<Sym> = candidates
        .iter()
        .copied()
        .filter(|c| !dominated.contains(c))
        .collect();
    if undominated.is_empty() {
        return Resolution::Impasse(ImpasseKind::Conflict, candidates);
    }
    candidates = undominated;

    let best: BTreeSet<Sym> = values_of(prefs, PreferenceType::Best).collect();
    if candidates.iter().any(|c| best.contains(c)) {
        candidates.retain(|c| best.contains(c));
    }
    let worst: BTreeSet<Sym> = values_of(prefs, PreferenceType::Worst).collect();
    if candidates.iter().any(|c| !worst.contains(c)) {
        candidates.retain(|c| !worst.contains(c));
    }
    if let [only] = candidates.as_slice() {
        return Resolution::Decided(*only);
    }

    let unary: BTreeSet<Sym> = values_of(prefs, PreferenceType::UnaryIndifferent)
        .chain(values_of(prefs, PreferenceType::NumericIndifferent))
        .collect();
    let binary: BTreeSet<(Sym, Sym)> = prefs
        .iter()
        .filter(|p| p.kind == PreferenceType::BinaryIndifferent)
        .filter_map(|p| p.referent.map(|r| (p.value, r)))
        .collect();
    let indifferent = |a: Sym, b: Sym| {
        (unary.contains(&a) && unary.contains(&b))
            || binary.contains(&(a, b))
            || binary.contains(&(b, a))
    };
    let all_indifferent = candidates.iter().enumerate().all(|(i, a)| {
        candidates[i + 1..]
            .iter()
            .all(|b| indifferent(*a, *b))
    });
    if all_indifferent {
        Resolution::Indifferent(candidates)
    } else {
        Resolution::Impasse(ImpasseKind::Tie, candidates)
    }
}

/// Combined numeric-indifferent value of each candidate (0 when none).
pub fn numeric_values(
    prefs: &[PrefView],
    candidates: &[Sym],
    mode: NumericMode,
    symbols: &SymbolTable,
) -> Vec<(Sym, f64)> {
    candidates
        .iter()
        .map(|c| {
            let nums: Vec<f64> = prefs
                .iter()
                .filter(|p| p.kind == PreferenceType::NumericIndifferent && p.value == *c)
                .filter_map(|p| p.referent.and_then(|r| symbols.as_f64(r)))
                .collect();
            let value = match (mode, nums.len()) {
                (_, 0) => 0.0,
                (NumericMode::Sum, _) => nums.iter().sum(),
                (NumericMode::Avg, n) => nums.iter().sum::<f64>() / n as f64,
            };
            (*c, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use PreferenceType::*;

    struct Fx {
        s: SymbolTable,
        a: Sym,
        b: Sym,
        c: Sym,
    }

    fn fx() -> Fx {
        let mut s = SymbolTable::new();
        let (a, b, c) = (s.identifier('O', 1), s.identifier('O', 2), s.identifier('O', 3));
        Fx { s, a, b, c }
    }

    fn p(kind: PreferenceType, value: Sym) -> PrefView {
        PrefView {
            kind,
            value,
            referent: None,
        }
    }

    fn p2(kind: PreferenceType, value: Sym, referent: Sym) -> PrefView {
        PrefView {
            kind,
            value,
            referent: Some(referent),
        }
    }

    #[test]
    fn two_unordered_acceptables_tie() {
        let f = fx();
        let prefs = [p(Acceptable, f.a), p(Acceptable, f.b)];
        assert_eq!(
            resolve(&prefs, &f.s),
            Resolution::Impasse(ImpasseKind::Tie, vec![f.a, f.b])
        );
    }

    #[test]
    fn reject_beats_acceptable() {
        let f = fx();
        let prefs = [p(Acceptable, f.a), p(Acceptable, f.b), p(Reject, f.b)];
        assert_eq!(resolve(&prefs, &f.s), Resolution::Decided(f.a));
        assert_eq!(resolve(&[p(Acceptable, f.a), p(Reject, f.a)], &f.s), Resolution::Empty);
    }

    #[test]
    fn require_and_prohibit() {
        let f = fx();
        assert_eq!(
            resolve(&[p(Acceptable, f.a), p(Require, f.b)], &f.s),
            Resolution::Decided(f.b)
        );
        assert!(matches!(
            resolve(&[p(Require, f.a), p(Prohibit, f.a)], &f.s),
            Resolution::Impasse(ImpasseKind::ConstraintFailure, _)
        ));
        assert!(matches!(
            resolve(&[p(Require, f.a), p(Require, f.b)], &f.s),
            Resolution::Impasse(ImpasseKind::ConstraintFailure, _)
        ));
    }

    #[test]
    fn better_worse_and_conflicts() {
        let f = fx();
        let base = [p(Acceptable, f.a), p(Acceptable, f.b), p(Acceptable, f.c)];
        let mut prefs = base.to_vec();
        prefs.push(p2(Better, f.a, f.b));
        prefs.push(p2(Worse, f.c, f.a));
        assert_eq!(resolve(&prefs, &f.s), Resolution::Decided(f.a));

        let mut cyclic = base.to_vec();
        cyclic.push(p2(Better, f.a, f.b));
        cyclic.push(p2(Better, f.b, f.a));
        assert_eq!(
            resolve(&cyclic, &f.s),
            Resolution::Impasse(ImpasseKind::Conflict, vec![f.a, f.b])
        );
    }

    #[test]
    fn best_worst_and_indifference() {
        let f = fx();
        let prefs = [p(Acceptable, f.a), p(Acceptable, f.b), p(Best, f.b)];
        assert_eq!(resolve(&prefs, &f.s), Resolution::Decided(f.b));
        let prefs = [p(Acceptable, f.a), p(Acceptable, f.b), p(Worst, f.a)];
        assert_eq!(resolve(&prefs, &f.s), Resolution::Decided(f.b));
        let prefs = [
            p(Acceptable, f.a),
            p(Acceptable, f.b),
            p(UnaryIndifferent, f.a),
            p(UnaryIndifferent, f.b),
        ];
        assert_eq!(resolve(&prefs, &f.s), Resolution::Indifferent(vec![f.a, f.b]));
    }

    #[test]
    fn assertion_order_does_not_matter() {
        let f = fx();
        let mut prefs = vec![
            p(Acceptable, f.c),
            p(Acceptable, f.a),
            p(Acceptable, f.b),
            p2(Better, f.b, f.c),
        ];
        let first = resolve(&prefs, &f.s);
        prefs.reverse();
        assert_eq!(resolve(&prefs, &f.s), first);
        assert_eq!(first, Resolution::Impasse(ImpasseKind::Tie, vec![f.a, f.b]));
    }

    #[test]
    fn numeric_values_combine() {
        let mut f = fx();
        let (one, three) = (f.s.float(1.0), f.s.int(3));
        let prefs = [
            p2(NumericIndifferent, f.a, one),
            p2(NumericIndifferent, f.a, three),
        ];
        let sums = numeric_values(&prefs, &[f.a, f.b], NumericMode::Sum, &f.s);
        assert_eq!(sums, vec![(f.a, 4.0), (f.b, 0.0)]);
        let avgs = numeric_values(&prefs, &[f.a], NumericMode::Avg, &f.s);
        assert_eq!(avgs, vec![(f.a, 2.0)]);
    }
}
