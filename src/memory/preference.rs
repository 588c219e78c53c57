//! Preferences and the instantiations that create them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::production::{Condition, PreferenceType, ProdId, ProductionKind};
use crate::symbol::{Sym, SymbolTable};

use super::wme::WmeId;

pub type PrefId = u64;
pub type InstId = u64;

/// A vote about the value of one `(id ^attr)` slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub id: PrefId,
    pub kind: PreferenceType,
    pub ident: Sym,
    pub attr: Sym,
    pub value: Sym,
    /// Second operand of binary preferences, or the number of a numeric one.
    pub referent: Option<Sym>,
    pub inst: InstId,
    pub osupport: bool,
    /// Goal whose removal discards this preference.
    pub goal: Sym,
    pub in_slot: bool,
    /// Elements backed by this preference.
    pub refs: u32,
}

impl Preference {
    pub fn render(&self, symbols: &SymbolTable) -> String {
        let mut s = format!(
            "({} ^{} {} {}",
            symbols.display(self.ident),
            symbols.display(self.attr),
            symbols.display(self.value),
            self.kind.symbol()
        );
        if let Some(r) = self.referent {
            s.push(' ');
            s.push_str(&symbols.display(r));
        }
        s.push(')');
        if self.osupport {
            s.push_str(" :O");
        }
        s
    }
}

/// One firing of a production.
///
/// Outlives its match while any of its preferences survive, so the chunker
/// can still backtrace through it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instantiation {
    pub id: InstId,
    pub prod: ProdId,
    pub prod_name: String,
    pub prod_kind: ProductionKind,
    /// Goal the match was found at (deepest goal among matched identifiers).
    pub goal: Sym,
    pub level: u32,
    /// One entry per top-level condition; `None` for negations.
    pub match_wmes: Vec<Option<WmeId>>,
    /// Conditions with bound variables replaced by their values.
    pub conditions: Vec<Condition>,
    pub bindings: BTreeMap<Sym, Sym>,
    pub prefs: Vec<PrefId>,
    /// The network still reports this match.
    pub matched: bool,
    /// Preferences not yet freed.
    pub live_prefs: u32,
    /// Tests the selected operator of its goal.
    pub tests_operator: bool,
}

impl Instantiation {
    /// Positive elements in condition order.
    pub fn wmes(&self) -> impl Iterator<Item = WmeId> + '_ {
        self.match_wmes.iter().flatten().copied()
    }
}
