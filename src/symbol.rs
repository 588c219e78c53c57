//! Interned symbols for one agent.
//!
//! Every value that appears in working memory or in a rule is a [`Sym`]: a
//! small copyable handle into the agent's [`SymbolTable`]. Interning makes
//! equality a handle comparison, so the matcher never compares strings.
//! Identifiers additionally carry a goal-stack level and a goal flag, which
//! the decision cycle and the chunker maintain.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SymbolError;

/// Handle to an interned symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Sym(u32);

impl Sym {
    /// Raw slot index, for diagnostics.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// The value behind a [`Sym`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SymbolValue {
    /// Letter plus per-letter counter, e.g. `S1`.
    Identifier { letter: char, number: u64 },
    /// Symbolic or string constant.
    Str(String),
    Int(i64),
    Float(f64),
    /// Rule variable, stored without angle brackets. Never in working memory.
    Variable(String),
}

impl SymbolValue {
    /// Numeric view, promoting integers to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SymbolValue::Int(i) => Some(*i as f64),
            SymbolValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self, SymbolValue::Identifier { .. })
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, SymbolValue::Variable(_))
    }

    fn kind_rank(&self) -> u8 {
        match self {
            SymbolValue::Identifier { .. } => 0,
            SymbolValue::Str(_) => 1,
            SymbolValue::Int(_) => 2,
            SymbolValue::Float(_) => 3,
            SymbolValue::Variable(_) => 4,
        }
    }
}

impl fmt::Display for SymbolValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolValue::Identifier { letter, number } => write!(f, "{letter}{number}"),
            SymbolValue::Str(s) => write!(f, "{s}"),
            SymbolValue::Int(i) => write!(f, "{i}"),
            SymbolValue::Float(x) => write!(f, "{x:?}"),
            SymbolValue::Variable(v) => write!(f, "<{v}>"),
        }
    }
}

/// Hashable interning key. Floats are keyed by their bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SymKey {
    Id(char, u64),
    Str(String),
    Int(i64),
    Float(u64),
    Var(String),
}

impl SymKey {
    fn of(value: &SymbolValue) -> Self {
        match value {
            SymbolValue::Identifier { letter, number } => SymKey::Id(*letter, *number),
            SymbolValue::Str(s) => SymKey::Str(s.clone()),
            SymbolValue::Int(i) => SymKey::Int(*i),
            SymbolValue::Float(x) => SymKey::Float(x.to_bits()),
            SymbolValue::Variable(v) => SymKey::Var(v.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: SymbolValue,
    /// Goal-stack level for identifiers (1 = top state). 0 when unset.
    level: u32,
    is_goal: bool,
}

/// Architecture symbols every agent interns at construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Predefined {
    pub state: Sym,
    pub r#type: Sym,
    pub superstate: Sym,
    pub nil: Sym,
    pub operator: Sym,
    pub impasse: Sym,
    pub attribute: Sym,
    pub choices: Sym,
    pub item: Sym,
    pub item_count: Sym,
    pub quiescence: Sym,
    pub t: Sym,
    pub tie: Sym,
    pub conflict: Sym,
    pub constraint_failure: Sym,
    pub no_change: Sym,
    pub none: Sym,
    pub multiple: Sym,
    pub io: Sym,
    pub input_link: Sym,
    pub output_link: Sym,
}

/// Per-agent symbol table.
///
/// Slots freed by [`SymbolTable::reclaim`] are reused, so a handle is only
/// meaningful while the symbol is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolTable {
    entries: Vec<Option<Entry>>,
    free: Vec<u32>,
    id_counters: BTreeMap<char, u64>,
    predefined: Predefined,
    #[serde(skip)]
    index: HashMap<SymKey, Sym>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        let placeholder = Sym(0);
        let mut table = Self {
            entries: Vec::new(),
            free: Vec::new(),
            id_counters: BTreeMap::new(),
            predefined: Predefined {
                state: placeholder,
                r#type: placeholder,
                superstate: placeholder,
                nil: placeholder,
                operator: placeholder,
                impasse: placeholder,
                attribute: placeholder,
                choices: placeholder,
                item: placeholder,
                item_count: placeholder,
                quiescence: placeholder,
                t: placeholder,
                tie: placeholder,
                conflict: placeholder,
                constraint_failure: placeholder,
                no_change: placeholder,
                none: placeholder,
                multiple: placeholder,
                io: placeholder,
                input_link: placeholder,
                output_link: placeholder,
            },
            index: HashMap::new(),
        };
        table.predefined = Predefined {
            state: table.string("state"),
            r#type: table.string("type"),
            superstate: table.string("superstate"),
            nil: table.string("nil"),
            operator: table.string("operator"),
            impasse: table.string("impasse"),
            attribute: table.string("attribute"),
            choices: table.string("choices"),
            item: table.string("item"),
            item_count: table.string("item-count"),
            quiescence: table.string("quiescence"),
            t: table.string("t"),
            tie: table.string("tie"),
            conflict: table.string("conflict"),
            constraint_failure: table.string("constraint-failure"),
            no_change: table.string("no-change"),
            none: table.string("none"),
            multiple: table.string("multiple"),
            io: table.string("io"),
            input_link: table.string("input-link"),
            output_link: table.string("output-link"),
        };
        table
    }

    pub fn predefined(&self) -> &Predefined {
        &self.predefined
    }

    /// Rebuild the lookup index after deserialization.
    pub(crate) fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(entry) = entry {
                self.index.insert(SymKey::of(&entry.value), Sym(i as u32));
            }
        }
    }

    fn intern(&mut self, value: SymbolValue) -> Sym {
        let key = SymKey::of(&value);
        if let Some(&sym) = self.index.get(&key) {
            return sym;
        }
        let entry = Entry {
            value,
            level: 0,
            is_goal: false,
        };
        let sym = match self.free.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(entry);
                Sym(slot)
            }
            None => {
                self.entries.push(Some(entry));
                Sym((self.entries.len() - 1) as u32)
            }
        };
        self.index.insert(key, sym);
        sym
    }

    pub fn string(&mut self, s: &str) -> Sym {
        self.intern(SymbolValue::Str(s.to_string()))
    }

    pub fn int(&mut self, i: i64) -> Sym {
        self.intern(SymbolValue::Int(i))
    }

    pub fn float(&mut self, x: f64) -> Sym {
        self.intern(SymbolValue::Float(x))
    }

    /// Intern a variable; angle brackets are stripped if present.
    pub fn variable(&mut self, name: &str) -> Sym {
        let name = name.trim_start_matches('<').trim_end_matches('>');
        self.intern(SymbolValue::Variable(name.to_string()))
    }

    /// Intern a specific identifier, e.g. when loading a justification.
    pub fn identifier(&mut self, letter: char, number: u64) -> Sym {
        let letter = letter.to_ascii_uppercase();
        let counter = self.id_counters.entry(letter).or_insert(0);
        if *counter < number {
            *counter = number;
        }
        self.intern(SymbolValue::Identifier { letter, number })
    }

    /// Create a fresh identifier at the given goal level.
    pub fn new_identifier(&mut self, letter: char, level: u32) -> Sym {
        let letter = if letter.is_ascii_alphabetic() {
            letter.to_ascii_uppercase()
        } else {
            'I'
        };
        let mut number = self.id_counters.get(&letter).copied().unwrap_or(0);
        loop {
            number += 1;
            if !self.index.contains_key(&SymKey::Id(letter, number)) {
                break;
            }
        }
        self.id_counters.insert(letter, number);
        let sym = self.intern(SymbolValue::Identifier { letter, number });
        self.set_level(sym, level);
        sym
    }

    pub fn find_identifier(&self, letter: char, number: u64) -> Option<Sym> {
        self.index.get(&SymKey::Id(letter, number)).copied()
    }

    pub fn find_string(&self, s: &str) -> Option<Sym> {
        self.index.get(&SymKey::Str(s.to_string())).copied()
    }

    fn entry(&self, sym: Sym) -> Option<&Entry> {
        self.entries.get(sym.0 as usize).and_then(|e| e.as_ref())
    }

    fn entry_mut(&mut self, sym: Sym) -> Option<&mut Entry> {
        self.entries.get_mut(sym.0 as usize).and_then(|e| e.as_mut())
    }

    /// Look up the value behind a handle.
    pub fn value(&self, sym: Sym) -> Result<&SymbolValue, SymbolError> {
        self.entry(sym)
            .map(|e| &e.value)
            .ok_or(SymbolError::Unknown { handle: sym.0 })
    }

    /// Value lookup for internal paths where the handle is known to be live.
    pub(crate) fn get(&self, sym: Sym) -> Option<&SymbolValue> {
        self.entry(sym).map(|e| &e.value)
    }

    pub fn is_identifier(&self, sym: Sym) -> bool {
        self.get(sym).is_some_and(SymbolValue::is_identifier)
    }

    pub fn is_variable(&self, sym: Sym) -> bool {
        self.get(sym).is_some_and(SymbolValue::is_variable)
    }

    pub fn as_f64(&self, sym: Sym) -> Option<f64> {
        self.get(sym).and_then(SymbolValue::as_f64)
    }

    pub fn level(&self, sym: Sym) -> u32 {
        self.entry(sym).map(|e| e.level).unwrap_or(0)
    }

    pub(crate) fn set_level(&mut self, sym: Sym, level: u32) {
        if let Some(e) = self.entry_mut(sym) {
            e.level = level;
        }
    }

    pub fn is_goal(&self, sym: Sym) -> bool {
        self.entry(sym).is_some_and(|e| e.is_goal)
    }

    pub(crate) fn set_goal(&mut self, sym: Sym, is_goal: bool) {
        if let Some(e) = self.entry_mut(sym) {
            e.is_goal = is_goal;
        }
    }

    /// Display form of a symbol; unknown handles render as `?<n>`.
    pub fn display(&self, sym: Sym) -> String {
        match self.get(sym) {
            Some(v) => v.to_string(),
            None => format!("?{}", sym.0),
        }
    }

    /// Relational comparison with int/float promotion.
    ///
    /// Numbers compare numerically regardless of representation, strings
    /// lexically, identifiers by letter then number. Anything else is
    /// incomparable.
    pub fn compare(&self, a: Sym, b: Sym) -> Option<Ordering> {
        let (va, vb) = (self.get(a)?, self.get(b)?);
        match (va, vb) {
            (SymbolValue::Int(x), SymbolValue::Int(y)) => Some(x.cmp(y)),
            (SymbolValue::Str(x), SymbolValue::Str(y)) => Some(x.cmp(y)),
            (
                SymbolValue::Identifier { letter: l1, number: n1 },
                SymbolValue::Identifier { letter: l2, number: n2 },
            ) => Some((l1, n1).cmp(&(l2, n2))),
            _ => match (va.as_f64(), vb.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// `<=>`: same kind of symbol (int and float are different kinds).
    pub fn same_type(&self, a: Sym, b: Sym) -> bool {
        match (self.get(a), self.get(b)) {
            (Some(x), Some(y)) => x.kind_rank() == y.kind_rank(),
            _ => false,
        }
    }

    /// Total order used wherever output must not depend on handle values.
    pub fn canonical_cmp(&self, a: Sym, b: Sym) -> Ordering {
        match (self.get(a), self.get(b)) {
            (Some(x), Some(y)) => x
                .kind_rank()
                .cmp(&y.kind_rank())
                .then_with(|| self.compare(a, b).unwrap_or(Ordering::Equal))
                .then_with(|| a.cmp(&b)),
            _ => a.cmp(&b),
        }
    }

    /// Number of live symbols.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every symbol not in `live` (predefined symbols always survive)
    /// and reset identifier counters. Returns the number reclaimed.
    pub(crate) fn reclaim(&mut self, live: &BTreeSet<Sym>) -> usize {
        let keep: BTreeSet<Sym> = live
            .iter()
            .copied()
            .chain(self.predefined_syms())
            .collect();
        let mut reclaimed = 0;
        for i in 0..self.entries.len() {
            let sym = Sym(i as u32);
            if keep.contains(&sym) {
                continue;
            }
            if let Some(entry) = self.entries[i].take() {
                self.index.remove(&SymKey::of(&entry.value));
                self.free.push(i as u32);
                reclaimed += 1;
            }
        }
        // Highest-numbered free slots are handed out last.
        self.free.sort_unstable_by(|a, b| b.cmp(a));
        self.id_counters.clear();
        for entry in self.entries.iter().flatten() {
            if let SymbolValue::Identifier { letter, number } = entry.value {
                let c = self.id_counters.entry(letter).or_insert(0);
                *c = (*c).max(number);
            }
        }
        reclaimed
    }

    /// Drop identifiers not in `live`. Counters are left alone, so a
    /// reclaimed name is not handed out again. Returns the number reclaimed.
    pub(crate) fn reclaim_identifiers(&mut self, live: &BTreeSet<Sym>) -> usize {
        let mut reclaimed = 0;
        for i in 0..self.entries.len() {
            let sym = Sym(i as u32);
            let dead = self.entries[i]
                .as_ref()
                .is_some_and(|e| e.value.is_identifier() && !live.contains(&sym));
            if !dead {
                continue;
            }
            if let Some(entry) = self.entries[i].take() {
                self.index.remove(&SymKey::of(&entry.value));
                self.free.push(i as u32);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            self.free.sort_unstable_by(|a, b| b.cmp(a));
        }
        reclaimed
    }

    fn predefined_syms(&self) -> [Sym; 21] {
        let p = &self.predefined;
        [
            p.state,
            p.r#type,
            p.superstate,
            p.nil,
            p.operator,
            p.impasse,
            p.attribute,
            p.choices,
            p.item,
            p.item_count,
            p.quiescence,
            p.t,
            p.tie,
            p.conflict,
            p.constraint_failure,
            p.no_change,
            p.none,
            p.multiple,
            p.io,
            p.input_link,
            p.output_link,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_handle() {
        let mut t = SymbolTable::new();
        assert_eq!(t.string("foo"), t.string("foo"));
        assert_eq!(t.int(3), t.int(3));
        assert_eq!(t.float(1.5), t.float(1.5));
        assert_ne!(t.int(1), t.float(1.0));
        assert_eq!(t.variable("<x>"), t.variable("x"));
    }

    #[test]
    fn identifiers_count_per_letter() {
        let mut t = SymbolTable::new();
        let s1 = t.new_identifier('s', 1);
        let s2 = t.new_identifier('S', 2);
        let o1 = t.new_identifier('o', 1);
        assert_eq!(t.display(s1), "S1");
        assert_eq!(t.display(s2), "S2");
        assert_eq!(t.display(o1), "O1");
        assert_eq!(t.level(s2), 2);
        assert_eq!(t.find_identifier('S', 1), Some(s1));
    }

    #[test]
    fn mixed_numeric_comparison_promotes() {
        let mut t = SymbolTable::new();
        let two = t.int(2);
        let two_and_half = t.float(2.5);
        let three = t.int(3);
        assert_eq!(t.compare(two, two_and_half), Some(Ordering::Less));
        assert_eq!(t.compare(three, two_and_half), Some(Ordering::Greater));
        let s = t.string("abc");
        assert_eq!(t.compare(s, two), None);
        assert!(!t.same_type(two, two_and_half));
    }

    #[test]
    fn reclaim_frees_unreferenced_symbols_and_resets_counters() {
        let mut t = SymbolTable::new();
        let keep = t.string("keep");
        let _drop = t.string("drop");
        let _s1 = t.new_identifier('S', 1);
        let before = t.len();
        let live: BTreeSet<Sym> = [keep].into_iter().collect();
        let n = t.reclaim(&live);
        assert_eq!(n, 2);
        assert_eq!(t.len(), before - 2);
        assert!(t.find_string("drop").is_none());
        let again = t.new_identifier('S', 1);
        assert_eq!(t.display(again), "S1");
        assert_eq!(t.string("keep"), keep);
    }

    #[test]
    fn identifier_reclaim_keeps_constants_and_counters() {
        let mut t = SymbolTable::new();
        let word = t.string("word");
        let s1 = t.new_identifier('S', 1);
        let _o1 = t.new_identifier('O', 1);
        let live: BTreeSet<Sym> = [s1].into_iter().collect();
        assert_eq!(t.reclaim_identifiers(&live), 1);
        assert_eq!(t.find_string("word"), Some(word));
        assert_eq!(t.find_identifier('O', 1), None);
        assert_eq!(t.find_identifier('S', 1), Some(s1));
        let o2 = t.new_identifier('O', 1);
        assert_eq!(t.display(o2), "O2");
    }

    #[test]
    fn rebuild_index_after_roundtrip() {
        let mut t = SymbolTable::new();
        let foo = t.string("foo");
        let bytes = bincode::serialize(&t).unwrap();
        let mut back: SymbolTable = bincode::deserialize(&bytes).unwrap();
        back.rebuild_index();
        assert_eq!(back.find_string("foo"), Some(foo));
        assert_eq!(back.predefined().nil, t.predefined().nil);
    }
}
