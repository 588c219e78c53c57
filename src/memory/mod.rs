//! Working memory: elements, preferences, instantiations and slots.
//!
//! [`WorkingMemory`] is the only path by which elements enter or leave the
//! matcher; it owns the [`Rete`] so every add and remove reaches the network
//! synchronously. Records are reference counted: an element that left
//! working memory is kept while an instantiation still refers to it, a
//! preference while an element is backed by it, and an instantiation while
//! it matches or still has preferences. [`WorkingMemory::sweep`] frees
//! whatever has dropped to zero and cascades.

pub mod preference;
pub mod slot;
pub mod wme;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::WmError;
use crate::rete::Rete;
use crate::symbol::{Sym, SymbolTable};

use preference::{InstId, Instantiation, PrefId, Preference};
use slot::Slot;
use wme::{Support, Wme, WmeFields, WmeId, WmeSource};

/// Elements added and removed since the last drain.
#[derive(Debug, Clone, Default)]
pub struct WmDelta {
    pub added: Vec<Wme>,
    pub removed: Vec<Wme>,
}

impl WmDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A record whose reference count may have reached zero.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Release {
    Wme(WmeId),
    Pref(PrefId),
    Inst(InstId),
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WorkingMemory {
    wmes: BTreeMap<WmeId, Wme>,
    next_timetag: WmeId,
    prefs: BTreeMap<PrefId, Preference>,
    next_pref: PrefId,
    insts: BTreeMap<InstId, Instantiation>,
    next_inst: InstId,
    slots: BTreeMap<(Sym, Sym), Slot>,
    changed_slots: BTreeSet<(Sym, Sym)>,
    #[serde(skip)]
    by_id: BTreeMap<Sym, BTreeSet<WmeId>>,
    #[serde(skip)]
    rete: Rete,
    #[serde(skip)]
    delta: WmDelta,
    #[serde(skip)]
    record_delta: bool,
}

fn underflow(what: &'static str, key: u64) -> WmError {
    WmError::RefCountUnderflow { what, key }
}

fn missing(what: &str, key: u64) -> WmError {
    WmError::Invariant {
        detail: format!("{what} {key} referenced but not present"),
    }
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self {
            next_timetag: 1,
            next_pref: 1,
            next_inst: 1,
            ..Self::default()
        }
    }

    pub fn rete(&self) -> &Rete {
        &self.rete
    }

    pub(crate) fn rete_mut(&mut self) -> &mut Rete {
        &mut self.rete
    }

    // -----------------------------------------------------------------------
    // Elements
    // -----------------------------------------------------------------------

    /// Create an element, hand it to the matcher and return its timetag.
    pub(crate) fn add_wme(
        &mut self,
        fields: WmeFields,
        support: Support,
        source: WmeSource,
        symbols: &SymbolTable,
    ) -> Result<WmeId, WmError> {
        match source {
            WmeSource::Preference(p) => {
                self.prefs.get_mut(&p).ok_or_else(|| missing("preference", p))?.refs += 1;
            }
            WmeSource::Item { acceptable } => {
                self.wmes
                    .get_mut(&acceptable)
                    .ok_or_else(|| missing("element", acceptable))?
                    .refs += 1;
            }
            WmeSource::Architecture | WmeSource::Input => {}
        }
        let timetag = self.next_timetag;
        self.next_timetag += 1;
        let wme = Wme {
            timetag,
            fields,
            support,
            source,
            in_wm: true,
            refs: 0,
        };
        if self.record_delta {
            self.delta.added.push(wme.clone());
        }
        self.wmes.insert(timetag, wme);
        self.by_id.entry(fields.id).or_default().insert(timetag);
        self.rete.add_wme(timetag, fields, symbols);
        Ok(timetag)
    }

    /// Take an element out of working memory. Returns `false` if it was
    /// not there; the record itself lingers while referenced.
    pub(crate) fn remove_wme(&mut self, w: WmeId, symbols: &SymbolTable) -> Result<bool, WmError> {
        let Some(wme) = self.wmes.get_mut(&w) else {
            return Ok(false);
        };
        if !wme.in_wm {
            return Ok(false);
        }
        wme.in_wm = false;
        let id = wme.fields.id;
        if self.record_delta {
            let snapshot = wme.clone();
            self.delta.removed.push(snapshot);
        }
        if let Some(set) = self.by_id.get_mut(&id) {
            set.remove(&w);
            if set.is_empty() {
                self.by_id.remove(&id);
            }
        }
        self.rete.remove_wme(w, symbols);
        self.sweep(vec![Release::Wme(w)])?;
        Ok(true)
    }

    /// Point an element at a different backing preference.
    pub(crate) fn repoint_wme(&mut self, w: WmeId, pref: PrefId) -> Result<(), WmError> {
        let osupport = self
            .prefs
            .get(&pref)
            .ok_or_else(|| missing("preference", pref))?
            .osupport;
        let wme = self.wmes.get_mut(&w).ok_or_else(|| missing("element", w))?;
        let old = wme.source;
        if old == WmeSource::Preference(pref) {
            return Ok(());
        }
        wme.source = WmeSource::Preference(pref);
        wme.support = if osupport {
            Support::OSupport
        } else {
            Support::ISupport
        };
        if let Some(p) = self.prefs.get_mut(&pref) {
            p.refs += 1;
        }
        if let WmeSource::Preference(old) = old {
            let p = self.prefs.get_mut(&old).ok_or_else(|| missing("preference", old))?;
            p.refs = p.refs.checked_sub(1).ok_or_else(|| underflow("preference", old))?;
            self.sweep(vec![Release::Pref(old)])?;
        }
        Ok(())
    }

    /// Any record, including elements already out of working memory.
    pub fn wme(&self, w: WmeId) -> Option<&Wme> {
        self.wmes.get(&w)
    }

    pub fn contains(&self, w: WmeId) -> bool {
        self.wmes.get(&w).is_some_and(|x| x.in_wm)
    }

    /// Elements currently in working memory, oldest first.
    pub fn wmes(&self) -> impl Iterator<Item = &Wme> {
        self.wmes.values().filter(|w| w.in_wm)
    }

    pub fn len(&self) -> usize {
        self.wmes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements with identifier `id`, optionally restricted to `attr`.
    pub fn query(&self, id: Sym, attr: Option<Sym>) -> Vec<&Wme> {
        self.by_id
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|w| self.wmes.get(w))
            .filter(|w| attr.is_none_or(|a| w.fields.attr == a))
            .collect()
    }

    /// First ordinary element with exactly this triple.
    pub fn find(&self, id: Sym, attr: Sym, value: Sym) -> Option<WmeId> {
        self.query(id, Some(attr))
            .into_iter()
            .find(|w| w.fields.value == value && !w.fields.acceptable)
            .map(|w| w.timetag)
    }

    // -----------------------------------------------------------------------
    // Instantiations and preferences
    // -----------------------------------------------------------------------

    /// Record a new instantiation; it holds its positive elements.
    pub(crate) fn add_inst(&mut self, mut inst: Instantiation) -> Result<InstId, WmError> {
        let id = self.next_inst;
        self.next_inst += 1;
        inst.id = id;
        for w in inst.wmes().collect::<Vec<_>>() {
            self.wmes.get_mut(&w).ok_or_else(|| missing("element", w))?.refs += 1;
        }
        self.insts.insert(id, inst);
        Ok(id)
    }

    pub fn inst(&self, i: InstId) -> Option<&Instantiation> {
        self.insts.get(&i)
    }

    pub(crate) fn inst_mut(&mut self, i: InstId) -> Option<&mut Instantiation> {
        self.insts.get_mut(&i)
    }

    pub fn insts(&self) -> impl Iterator<Item = &Instantiation> {
        self.insts.values()
    }

    /// Mark an instantiation as no longer matched and free it if unused.
    pub(crate) fn unmatch_inst(&mut self, i: InstId) -> Result<(), WmError> {
        if let Some(inst) = self.insts.get_mut(&i) {
            inst.matched = false;
        }
        self.sweep(vec![Release::Inst(i)])
    }

    /// Create a preference owned by `pref.inst`. It is not yet in a slot.
    pub(crate) fn add_pref(&mut self, mut pref: Preference) -> Result<PrefId, WmError> {
        let id = self.next_pref;
        self.next_pref += 1;
        pref.id = id;
        pref.in_slot = false;
        pref.refs = 0;
        let inst = self
            .insts
            .get_mut(&pref.inst)
            .ok_or_else(|| missing("instantiation", pref.inst))?;
        inst.prefs.push(id);
        inst.live_prefs += 1;
        self.prefs.insert(id, pref);
        Ok(id)
    }

    /// Move a preference to another owning instantiation.
    pub(crate) fn transfer_pref(&mut self, p: PrefId, to: InstId) -> Result<(), WmError> {
        let pref = self.prefs.get_mut(&p).ok_or_else(|| missing("preference", p))?;
        let from = pref.inst;
        if from == to {
            return Ok(());
        }
        pref.inst = to;
        let src = self.insts.get_mut(&from).ok_or_else(|| missing("instantiation", from))?;
        src.prefs.retain(|x| *x != p);
        src.live_prefs = src
            .live_prefs
            .checked_sub(1)
            .ok_or_else(|| underflow("instantiation", from))?;
        let dst = self.insts.get_mut(&to).ok_or_else(|| missing("instantiation", to))?;
        dst.prefs.push(p);
        dst.live_prefs += 1;
        self.sweep(vec![Release::Inst(from)])
    }

    pub fn pref(&self, p: PrefId) -> Option<&Preference> {
        self.prefs.get(&p)
    }

    pub(crate) fn pref_mut(&mut self, p: PrefId) -> Option<&mut Preference> {
        self.prefs.get_mut(&p)
    }

    pub fn prefs(&self) -> impl Iterator<Item = &Preference> {
        self.prefs.values()
    }

    /// Preferences currently in the slot `(id ^attr)`.
    pub fn slot_prefs(&self, id: Sym, attr: Sym) -> Vec<&Preference> {
        self.slots
            .get(&(id, attr))
            .map(|s| s.prefs.iter().filter_map(|p| self.prefs.get(p)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn insert_pref(&mut self, p: PrefId, context: bool) -> Result<(), WmError> {
        let pref = self.prefs.get_mut(&p).ok_or_else(|| missing("preference", p))?;
        pref.in_slot = true;
        let key = (pref.ident, pref.attr);
        let slot = self.slots.entry(key).or_default();
        slot.context |= context;
        slot.prefs.insert(p);
        self.mark_changed(key);
        Ok(())
    }

    /// Take a preference out of its slot; it is freed once unreferenced.
    pub(crate) fn retract_pref(&mut self, p: PrefId) -> Result<(), WmError> {
        let Some(pref) = self.prefs.get_mut(&p) else {
            return Ok(());
        };
        if !pref.in_slot {
            return self.sweep(vec![Release::Pref(p)]);
        }
        pref.in_slot = false;
        let key = (pref.ident, pref.attr);
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.prefs.remove(&p);
        }
        self.mark_changed(key);
        self.sweep(vec![Release::Pref(p)])
    }

    // -----------------------------------------------------------------------
    // Slots
    // -----------------------------------------------------------------------

    pub fn slot(&self, id: Sym, attr: Sym) -> Option<&Slot> {
        self.slots.get(&(id, attr))
    }

    pub(crate) fn slot_mut(&mut self, id: Sym, attr: Sym) -> &mut Slot {
        self.slots.entry((id, attr)).or_default()
    }

    pub(crate) fn mark_changed(&mut self, key: (Sym, Sym)) {
        self.slots.entry(key).or_default().changed = true;
        self.changed_slots.insert(key);
    }

    pub(crate) fn take_changed_slots(&mut self) -> BTreeSet<(Sym, Sym)> {
        std::mem::take(&mut self.changed_slots)
    }

    /// Drop an ordinary slot once nothing refers to it.
    pub(crate) fn prune_slot(&mut self, key: (Sym, Sym)) {
        if self.slots.get(&key).is_some_and(|s| s.is_empty() && !s.context) {
            self.slots.remove(&key);
        }
    }

    // -----------------------------------------------------------------------
    // Reclamation
    // -----------------------------------------------------------------------

    /// Free records whose counts reached zero, cascading.
    pub(crate) fn sweep(&mut self, mut work: Vec<Release>) -> Result<(), WmError> {
        while let Some(item) = work.pop() {
            match item {
                Release::Wme(w) => {
                    if !self.wmes.get(&w).is_some_and(|x| !x.in_wm && x.refs == 0) {
                        continue;
                    }
                    let Some(wme) = self.wmes.remove(&w) else {
                        continue;
                    };
                    match wme.source {
                        WmeSource::Preference(p) => {
                            let pref =
                                self.prefs.get_mut(&p).ok_or_else(|| missing("preference", p))?;
                            pref.refs = pref.refs.checked_sub(1).ok_or_else(|| underflow("preference", p))?;
                            work.push(Release::Pref(p));
                        }
                        WmeSource::Item { acceptable } => {
                            let a = self
                                .wmes
                                .get_mut(&acceptable)
                                .ok_or_else(|| missing("element", acceptable))?;
                            a.refs = a
                                .refs
                                .checked_sub(1)
                                .ok_or_else(|| underflow("element", acceptable))?;
                            work.push(Release::Wme(acceptable));
                        }
                        WmeSource::Architecture | WmeSource::Input => {}
                    }
                }
                Release::Pref(p) => {
                    if !self.prefs.get(&p).is_some_and(|x| !x.in_slot && x.refs == 0) {
                        continue;
                    }
                    let Some(pref) = self.prefs.remove(&p) else {
                        continue;
                    };
                    let inst = self
                        .insts
                        .get_mut(&pref.inst)
                        .ok_or_else(|| missing("instantiation", pref.inst))?;
                    inst.live_prefs = inst
                        .live_prefs
                        .checked_sub(1)
                        .ok_or_else(|| underflow("instantiation", pref.inst))?;
                    inst.prefs.retain(|x| *x != p);
                    work.push(Release::Inst(pref.inst));
                }
                Release::Inst(i) => {
                    if !self.insts.get(&i).is_some_and(|x| !x.matched && x.live_prefs == 0) {
                        continue;
                    }
                    let Some(inst) = self.insts.remove(&i) else {
                        continue;
                    };
                    for w in inst.wmes() {
                        let wme = self.wmes.get_mut(&w).ok_or_else(|| missing("element", w))?;
                        wme.refs = wme.refs.checked_sub(1).ok_or_else(|| underflow("element", w))?;
                        work.push(Release::Wme(w));
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Deltas
    // -----------------------------------------------------------------------

    pub(crate) fn set_record_delta(&mut self, on: bool) {
        self.record_delta = on;
        if !on {
            self.delta = WmDelta::default();
        }
    }

    pub(crate) fn take_delta(&mut self) -> WmDelta {
        std::mem::take(&mut self.delta)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Forget every element, preference and instantiation. Compiled rules
    /// stay in the network.
    pub(crate) fn clear(&mut self, symbols: &SymbolTable) {
        self.wmes.clear();
        self.prefs.clear();
        self.insts.clear();
        self.slots.clear();
        self.changed_slots.clear();
        self.by_id.clear();
        self.delta = WmDelta::default();
        self.next_timetag = 1;
        self.next_pref = 1;
        self.next_inst = 1;
        self.rete.clear_memories(symbols);
    }

    /// After deserialization: rebuild indexes and feed every element in
    /// working memory to the (already compiled) network, oldest first.
    pub(crate) fn replay(&mut self, symbols: &SymbolTable) {
        self.by_id.clear();
        let live: Vec<(WmeId, WmeFields)> = self
            .wmes
            .values()
            .filter(|w| w.in_wm)
            .map(|w| (w.timetag, w.fields))
            .collect();
        for (w, fields) in live {
            self.by_id.entry(fields.id).or_default().insert(w);
            self.rete.add_wme(w, fields, symbols);
        }
    }

    /// Identifiers and constants referenced by live records, including
    /// records kept only for backtracing.
    pub(crate) fn referenced_symbols(&self) -> BTreeSet<Sym> {
        let mut out = BTreeSet::new();
        for w in self.wmes.values() {
            out.extend([w.fields.id, w.fields.attr, w.fields.value]);
        }
        for p in self.prefs.values() {
            out.extend([p.ident, p.attr, p.value, p.goal]);
            out.extend(p.referent);
        }
        for i in self.insts.values() {
            out.insert(i.goal);
            out.extend(i.bindings.iter().flat_map(|(k, v)| [*k, *v]));
            for c in &i.conditions {
                c.for_each_sym(&mut |s| {
                    out.insert(s);
                });
            }
        }
        out.extend(self.slots.keys().flat_map(|(id, attr)| [*id, *attr]));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::production::{PreferenceType, ProdId, ProductionKind};

    fn inst(wmes: Vec<Option<WmeId>>, goal: Sym) -> Instantiation {
        Instantiation {
            id: 0,
            prod: ProdId(0),
            prod_name: "r".into(),
            prod_kind: ProductionKind::User,
            goal,
            level: 1,
            match_wmes: wmes,
            conditions: Vec::new(),
            bindings: BTreeMap::new(),
            prefs: Vec::new(),
            matched: true,
            live_prefs: 0,
            tests_operator: false,
        }
    }

    fn pref(inst: InstId, ident: Sym, attr: Sym, value: Sym) -> Preference {
        Preference {
            id: 0,
            kind: PreferenceType::Acceptable,
            ident,
            attr,
            value,
            referent: None,
            inst,
            osupport: false,
            goal: ident,
            in_slot: false,
            refs: 0,
        }
    }

    #[test]
    fn records_linger_until_unreferenced() {
        let mut symbols = SymbolTable::new();
        let mut wm = WorkingMemory::new();
        let s1 = symbols.new_identifier('S', 1);
        let (a, b, c) = (symbols.string("a"), symbols.string("b"), symbols.string("c"));
        let w1 = wm
            .add_wme(WmeFields::new(s1, a, b), Support::Input, WmeSource::Input, &symbols)
            .unwrap();
        let i = wm.add_inst(inst(vec![Some(w1)], s1)).unwrap();
        let p = wm.add_pref(pref(i, s1, c, b)).unwrap();
        wm.insert_pref(p, false).unwrap();
        let w2 = wm
            .add_wme(
                WmeFields::new(s1, c, b),
                Support::ISupport,
                WmeSource::Preference(p),
                &symbols,
            )
            .unwrap();

        // The instantiation still holds w1 after it leaves working memory.
        assert!(wm.remove_wme(w1, &symbols).unwrap());
        assert!(!wm.contains(w1));
        assert!(wm.wme(w1).is_some());

        wm.unmatch_inst(i).unwrap();
        wm.retract_pref(p).unwrap();
        assert!(wm.pref(p).is_some(), "still backs w2");
        wm.remove_wme(w2, &symbols).unwrap();
        assert!(wm.pref(p).is_none());
        assert!(wm.inst(i).is_none());
        assert!(wm.wme(w1).is_none());
    }

    #[test]
    fn removing_twice_is_harmless() {
        let mut symbols = SymbolTable::new();
        let mut wm = WorkingMemory::new();
        let s1 = symbols.new_identifier('S', 1);
        let a = symbols.string("a");
        let w = wm
            .add_wme(WmeFields::new(s1, a, a), Support::Input, WmeSource::Input, &symbols)
            .unwrap();
        assert!(wm.remove_wme(w, &symbols).unwrap());
        assert!(!wm.remove_wme(w, &symbols).unwrap());
        assert!(wm.is_empty());
    }

    #[test]
    fn query_filters_by_attribute() {
        let mut symbols = SymbolTable::new();
        let mut wm = WorkingMemory::new();
        let s1 = symbols.new_identifier('S', 1);
        let (a, b) = (symbols.string("a"), symbols.string("b"));
        for (attr, value) in [(a, a), (a, b), (b, b)] {
            wm.add_wme(WmeFields::new(s1, attr, value), Support::Input, WmeSource::Input, &symbols)
                .unwrap();
        }
        assert_eq!(wm.query(s1, Some(a)).len(), 2);
        assert_eq!(wm.query(s1, None).len(), 3);
        assert!(wm.find(s1, b, b).is_some());
        assert!(wm.find(s1, b, a).is_none());
    }
}
