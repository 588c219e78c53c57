//! Alpha memories: constant-test indexing of single elements.
//!
//! A condition's constant equality tests become an [`AlphaKey`]; every key
//! with the same constants shares one memory. An incoming element is routed
//! by probing the eight wildcard combinations of its own fields, so it never
//! meets memories it cannot belong to.

use std::collections::BTreeSet;

use crate::memory::wme::{WmeFields, WmeId};
use crate::symbol::Sym;

use super::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AmemId(pub(crate) u32);

/// Constant equality tests of one condition. `None` is a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlphaKey {
    pub id: Option<Sym>,
    pub attr: Option<Sym>,
    pub value: Option<Sym>,
    pub acceptable: bool,
}

impl AlphaKey {
    pub fn matches(&self, f: &WmeFields) -> bool {
        self.acceptable == f.acceptable
            && self.id.is_none_or(|s| s == f.id)
            && self.attr.is_none_or(|s| s == f.attr)
            && self.value.is_none_or(|s| s == f.value)
    }

    /// Every key an element with these fields could be stored under.
    pub fn probes(f: &WmeFields) -> [AlphaKey; 8] {
        let pick = |bit: u8, s: Sym, mask: u8| if mask & bit != 0 { Some(s) } else { None };
        std::array::from_fn(|i| {
            let mask = i as u8;
            AlphaKey {
                id: pick(1, f.id, mask),
                attr: pick(2, f.attr, mask),
                value: pick(4, f.value, mask),
                acceptable: f.acceptable,
            }
        })
    }
}

#[derive(Debug)]
pub(crate) struct AlphaMemory {
    pub key: AlphaKey,
    pub items: BTreeSet<WmeId>,
    /// Join and negative nodes reading this memory, descendants first.
    pub successors: Vec<NodeId>,
}
