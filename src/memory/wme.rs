//! Working-memory elements.

use serde::{Deserialize, Serialize};

use crate::symbol::{Sym, SymbolTable};

use super::preference::PrefId;

/// Timetag of a working-memory element. Never reused within an agent run.
pub type WmeId = u64;

/// One of the three fields of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    Id,
    Attr,
    Value,
}

/// The matchable content of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WmeFields {
    pub id: Sym,
    pub attr: Sym,
    pub value: Sym,
    pub acceptable: bool,
}

impl WmeFields {
    pub fn new(id: Sym, attr: Sym, value: Sym) -> Self {
        Self {
            id,
            attr,
            value,
            acceptable: false,
        }
    }

    pub fn get(&self, field: Field) -> Sym {
        match field {
            Field::Id => self.id,
            Field::Attr => self.attr,
            Field::Value => self.value,
        }
    }
}

/// How an element is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Support {
    /// Created by the architecture (goal structure, selected operator).
    Architecture,
    /// Added by an input provider; removed only by input.
    Input,
    /// Persistent: survives retraction of the rule that created it.
    OSupport,
    /// Instantiation-supported: vanishes when its rule stops matching.
    ISupport,
}

/// Provenance used by the chunker's backtrace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WmeSource {
    Architecture,
    Input,
    /// Backed by this preference (held with a reference).
    Preference(PrefId),
    /// A sub-state `^item`, standing for an acceptable-preference element
    /// of the super-state.
    Item { acceptable: WmeId },
}

/// A working-memory element together with its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wme {
    pub timetag: WmeId,
    pub fields: WmeFields,
    pub support: Support,
    pub source: WmeSource,
    /// Still in working memory (as opposed to retained for backtracing).
    pub in_wm: bool,
    /// Instantiations and item elements holding this record.
    pub refs: u32,
}

impl Wme {
    pub fn render(&self, symbols: &SymbolTable) -> String {
        format!(
            "({}: {} ^{} {}{})",
            self.timetag,
            symbols.display(self.fields.id),
            symbols.display(self.fields.attr),
            symbols.display(self.fields.value),
            if self.fields.acceptable { " +" } else { "" }
        )
    }
}
