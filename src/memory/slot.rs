//! Decision slots: the preferences and elements of one `(id ^attr)` pair.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::symbol::Sym;

use super::preference::PrefId;
use super::wme::WmeId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Slot {
    pub prefs: BTreeSet<PrefId>,
    /// Ordinary elements, by value.
    pub wmes: BTreeMap<Sym, WmeId>,
    /// Acceptable-preference elements (`+`), by value. Context slots only.
    pub acceptable_wmes: BTreeMap<Sym, WmeId>,
    /// An `^operator` slot of a goal, decided by the decision phase.
    pub context: bool,
    /// Preferences changed since the slot was last decided.
    pub changed: bool,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.prefs.is_empty() && self.wmes.is_empty() && self.acceptable_wmes.is_empty()
    }
}
