//! Incremental matcher: a RETE discrimination network.
//!
//! The network keeps its own copy of each element's fields, so it can be
//! driven directly with [`Rete::add_wme`] and [`Rete::remove_wme`]. Every
//! change propagates synchronously; complete matches appear and disappear as
//! [`MatchEvent`]s that the owner drains with [`Rete::take_events`].
//!
//! Structure follows Doorenbos: alpha memories index elements by constant
//! tests, positive/negative nodes join them with partial matches, conjunctive
//! negations use an NCC node plus a partner at the bottom of a subnetwork,
//! and production nodes report complete matches. Condition prefixes shared
//! between rules share nodes.

pub mod alpha;
pub mod naive;
pub mod node;
pub mod token;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::CompileError;
use crate::memory::wme::{WmeFields, WmeId};
use crate::production::{Condition, ProdId};
use crate::symbol::SymbolTable;

use alpha::{AlphaKey, AlphaMemory, AmemId};
use node::{Bindings, Node, NodeId, NodeKind, compile_triple, passes};
use token::{Token, TokenArena};

pub use token::TokenId;

/// A change in the complete-match set of one production.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchEvent {
    /// New match. `wmes` has one entry per top-level condition in match
    /// order: the element for positive conditions, `None` for negations.
    Assert {
        prod: ProdId,
        token: TokenId,
        wmes: Vec<Option<WmeId>>,
    },
    Retract { prod: ProdId, token: TokenId },
}

/// Node and memory counts, for sharing checks and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub alpha_memories: usize,
    pub positive_nodes: usize,
    pub negative_nodes: usize,
    pub ncc_nodes: usize,
    pub production_nodes: usize,
    pub tokens: usize,
}

impl NetworkStats {
    /// Beta nodes excluding production nodes.
    pub fn join_nodes(&self) -> usize {
        self.positive_nodes + self.negative_nodes + self.ncc_nodes
    }
}

const ROOT: NodeId = NodeId(0);

/// The discrimination network.
#[derive(Debug)]
pub struct Rete {
    nodes: Vec<Option<Node>>,
    free_nodes: Vec<u32>,
    amems: Vec<Option<AlphaMemory>>,
    free_amems: Vec<u32>,
    alpha_index: HashMap<AlphaKey, AmemId>,
    tokens: TokenArena,
    dummy: TokenId,
    wmes: HashMap<WmeId, WmeFields>,
    tokens_by_wme: HashMap<WmeId, Vec<TokenId>>,
    neg_index: HashMap<WmeId, Vec<TokenId>>,
    prod_nodes: BTreeMap<ProdId, NodeId>,
    events: Vec<MatchEvent>,
}

impl Default for Rete {
    fn default() -> Self {
        Self::new()
    }
}

impl Rete {
    pub fn new() -> Self {
        let mut tokens = TokenArena::default();
        let dummy = tokens.insert(Token::new(ROOT, None, None));
        let root = Node {
            kind: NodeKind::Root,
            parent: None,
            children: Vec::new(),
            tokens: [dummy].into_iter().collect(),
            depth: 0,
        };
        Self {
            nodes: vec![Some(root)],
            free_nodes: Vec::new(),
            amems: Vec::new(),
            free_amems: Vec::new(),
            alpha_index: HashMap::new(),
            tokens,
            dummy,
            wmes: HashMap::new(),
            tokens_by_wme: HashMap::new(),
            neg_index: HashMap::new(),
            prod_nodes: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize).and_then(|n| n.as_mut())
    }

    fn amem(&self, id: AmemId) -> Option<&AlphaMemory> {
        self.amems.get(id.0 as usize).and_then(|a| a.as_ref())
    }

    fn token_fields(&self, id: TokenId, levels: u32) -> Option<WmeFields> {
        let t = self.tokens.ancestor(id, levels)?;
        let w = self.tokens.get(t)?.wme?;
        self.wmes.get(&w).copied()
    }

    /// Tokens of `node` that pass matches to its children.
    fn active_tokens(&self, node: NodeId) -> Vec<TokenId> {
        let Some(n) = self.node(node) else {
            return Vec::new();
        };
        n.tokens
            .iter()
            .copied()
            .filter(|t| self.tokens.get(*t).is_some_and(|t| t.is_active() && !t.dying))
            .collect()
    }

    /// Drain pending match changes.
    pub fn take_events(&mut self) -> Vec<MatchEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn contains_wme(&self, w: WmeId) -> bool {
        self.wmes.contains_key(&w)
    }

    pub fn stats(&self) -> NetworkStats {
        let mut s = NetworkStats {
            alpha_memories: self.amems.iter().flatten().count(),
            tokens: self.tokens.len(),
            ..NetworkStats::default()
        };
        for n in self.nodes.iter().flatten() {
            match n.kind {
                NodeKind::Positive { .. } => s.positive_nodes += 1,
                NodeKind::Negative { .. } => s.negative_nodes += 1,
                NodeKind::Ncc { .. } => s.ncc_nodes += 1,
                NodeKind::Production { .. } => s.production_nodes += 1,
                NodeKind::Root | NodeKind::Partner { .. } => {}
            }
        }
        s
    }

    // -----------------------------------------------------------------------
    // Element changes
    // -----------------------------------------------------------------------

    /// Add an element. Adding a timetag twice is a no-op.
    pub fn add_wme(&mut self, w: WmeId, fields: WmeFields, symbols: &SymbolTable) {
        if self.wmes.contains_key(&w) {
            return;
        }
        self.wmes.insert(w, fields);
        for key in AlphaKey::probes(&fields) {
            let Some(&am) = self.alpha_index.get(&key) else {
                continue;
            };
            let successors = match self.amems[am.0 as usize].as_mut() {
                Some(mem) => {
                    mem.items.insert(w);
                    mem.successors.clone()
                }
                None => continue,
            };
            for n in successors {
                self.right_activate(n, w, symbols);
            }
        }
    }

    /// Remove an element. Unknown timetags are ignored.
    pub fn remove_wme(&mut self, w: WmeId, symbols: &SymbolTable) {
        let Some(fields) = self.wmes.get(&w).copied() else {
            return;
        };
        for key in AlphaKey::probes(&fields) {
            if let Some(&am) = self.alpha_index.get(&key) {
                if let Some(mem) = self.amems[am.0 as usize].as_mut() {
                    mem.items.remove(&w);
                }
            }
        }
        let roots = self.tokens_by_wme.remove(&w).unwrap_or_default();
        self.delete_trees(roots, symbols);
        if let Some(blocked) = self.neg_index.remove(&w) {
            for t in blocked {
                let unblocked = match self.tokens.get_mut(t) {
                    Some(tok) if !tok.dying => {
                        tok.neg_results.retain(|x| *x != w);
                        tok.is_active().then_some(tok.node)
                    }
                    _ => None,
                };
                if let Some(node) = unblocked {
                    self.left_activate_children(node, t, symbols);
                }
            }
        }
        self.wmes.remove(&w);
    }

    /// Forget every element and partial match, keeping the compiled rules.
    pub fn clear_memories(&mut self, symbols: &SymbolTable) {
        self.tokens = TokenArena::default();
        self.dummy = self.tokens.insert(Token::new(ROOT, None, None));
        for n in self.nodes.iter_mut().flatten() {
            n.tokens.clear();
            if let NodeKind::Partner { new_results, .. } = &mut n.kind {
                new_results.clear();
            }
        }
        let dummy = self.dummy;
        if let Some(root) = self.node_mut(ROOT) {
            root.tokens.insert(dummy);
        }
        for mem in self.amems.iter_mut().flatten() {
            mem.items.clear();
        }
        self.wmes.clear();
        self.tokens_by_wme.clear();
        self.neg_index.clear();
        self.events.clear();
        let children = self.node(ROOT).map(|n| n.children.clone()).unwrap_or_default();
        for c in children {
            self.left_activate(c, dummy, symbols);
        }
    }

    // -----------------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------------

    fn right_activate(&mut self, n: NodeId, w: WmeId, symbols: &SymbolTable) {
        let Some(fields) = self.wmes.get(&w).copied() else {
            return;
        };
        let Some(node) = self.node(n) else { return };
        match &node.kind {
            NodeKind::Positive { tests, .. } => {
                let Some(parent) = node.parent else { return };
                let resolve = |t, l| self.token_fields(t, l);
                let joined: Vec<TokenId> = self
                    .active_tokens(parent)
                    .into_iter()
                    .filter(|t| passes(tests, &fields, Some(*t), &resolve, symbols))
                    .collect();
                for t in joined {
                    self.emit_token(n, t, Some(w), symbols);
                }
            }
            NodeKind::Negative { tests, .. } => {
                let resolve = |t, l| self.token_fields(t, l);
                let blocked: Vec<TokenId> = node
                    .tokens
                    .iter()
                    .copied()
                    .filter(|t| {
                        let left = self.tokens.get(*t).and_then(|tok| tok.parent);
                        passes(tests, &fields, left, &resolve, symbols)
                    })
                    .collect();
                for t in blocked {
                    let newly_blocked = match self.tokens.get_mut(t) {
                        Some(tok) if !tok.dying => {
                            let was_active = tok.is_active();
                            tok.neg_results.push(w);
                            was_active.then(|| tok.children.clone())
                        }
                        _ => continue,
                    };
                    self.neg_index.entry(w).or_default().push(t);
                    if let Some(children) = newly_blocked {
                        self.delete_trees(children, symbols);
                    }
                }
            }
            _ => {}
        }
    }

    fn left_activate_children(&mut self, n: NodeId, t: TokenId, symbols: &SymbolTable) {
        let children = self.node(n).map(|n| n.children.clone()).unwrap_or_default();
        for c in children {
            if self.tokens.get(t).is_none_or(|tok| tok.dying || !tok.is_active()) {
                return;
            }
            self.left_activate(c, t, symbols);
        }
    }

    /// Allocate a token and link it into its node, parent and element index.
    fn new_token(&mut self, n: NodeId, parent: TokenId, wme: Option<WmeId>) -> TokenId {
        let id = self.tokens.insert(Token::new(n, Some(parent), wme));
        if let Some(p) = self.tokens.get_mut(parent) {
            p.children.push(id);
        }
        if let Some(node) = self.node_mut(n) {
            node.tokens.insert(id);
        }
        if let Some(w) = wme {
            self.tokens_by_wme.entry(w).or_default().push(id);
        }
        id
    }

    fn emit_token(&mut self, n: NodeId, parent: TokenId, wme: Option<WmeId>, symbols: &SymbolTable) {
        let id = self.new_token(n, parent, wme);
        self.left_activate_children(n, id, symbols);
    }

    fn left_activate(&mut self, n: NodeId, t: TokenId, symbols: &SymbolTable) {
        let Some(node) = self.node(n) else { return };
        match &node.kind {
            NodeKind::Root => {}
            NodeKind::Positive { amem, tests } => {
                let Some(mem) = self.amem(*amem) else { return };
                let resolve = |t, l| self.token_fields(t, l);
                let joined: Vec<WmeId> = mem
                    .items
                    .iter()
                    .copied()
                    .filter(|w| {
                        self.wmes
                            .get(w)
                            .is_some_and(|f| passes(tests, f, Some(t), &resolve, symbols))
                    })
                    .collect();
                for w in joined {
                    self.emit_token(n, t, Some(w), symbols);
                }
            }
            NodeKind::Negative { amem, tests } => {
                let Some(mem) = self.amem(*amem) else { return };
                let resolve = |t, l| self.token_fields(t, l);
                let blockers: Vec<WmeId> = mem
                    .items
                    .iter()
                    .copied()
                    .filter(|w| {
                        self.wmes
                            .get(w)
                            .is_some_and(|f| passes(tests, f, Some(t), &resolve, symbols))
                    })
                    .collect();
                let id = self.new_token(n, t, None);
                for w in &blockers {
                    self.neg_index.entry(*w).or_default().push(id);
                }
                let active = blockers.is_empty();
                if let Some(tok) = self.tokens.get_mut(id) {
                    tok.neg_results = blockers;
                }
                if active {
                    self.left_activate_children(n, id, symbols);
                }
            }
            NodeKind::Ncc { partner } => {
                let partner = *partner;
                let id = self.new_token(n, t, None);
                let (conjuncts, buffered) = match self.node(partner).map(|p| &p.kind) {
                    Some(NodeKind::Partner {
                        conjuncts,
                        new_results,
                        ..
                    }) => (*conjuncts, new_results.clone()),
                    _ => return,
                };
                let mine: Vec<TokenId> = buffered
                    .into_iter()
                    .filter(|r| self.result_owner_parent(*r, conjuncts) == Some(t))
                    .collect();
                if let Some(NodeKind::Partner { new_results, .. }) =
                    self.node_mut(partner).map(|p| &mut p.kind)
                {
                    new_results.retain(|r| !mine.contains(r));
                }
                for r in &mine {
                    if let Some(rt) = self.tokens.get_mut(*r) {
                        rt.owner = Some(id);
                    }
                }
                let active = mine.is_empty();
                if let Some(tok) = self.tokens.get_mut(id) {
                    tok.ncc_results = mine;
                }
                if active {
                    self.left_activate_children(n, id, symbols);
                }
            }
            NodeKind::Partner { ncc, conjuncts, .. } => {
                let (ncc, conjuncts) = (*ncc, *conjuncts);
                let result = self.new_token(n, t, None);
                let owner_parent = self.tokens.ancestor(t, conjuncts);
                let owner = owner_parent.and_then(|p| {
                    self.tokens.get(p).and_then(|pt| {
                        pt.children.iter().copied().find(|c| {
                            self.tokens
                                .get(*c)
                                .is_some_and(|ct| ct.node == ncc && !ct.dying)
                        })
                    })
                });
                match owner {
                    Some(o) => {
                        let newly_blocked = match self.tokens.get_mut(o) {
                            Some(ot) => {
                                let was_active = ot.is_active();
                                ot.ncc_results.push(result);
                                was_active.then(|| ot.children.clone())
                            }
                            None => None,
                        };
                        if let Some(rt) = self.tokens.get_mut(result) {
                            rt.owner = Some(o);
                        }
                        if let Some(children) = newly_blocked {
                            self.delete_trees(children, symbols);
                        }
                    }
                    None => {
                        if let Some(NodeKind::Partner { new_results, .. }) =
                            self.node_mut(n).map(|p| &mut p.kind)
                        {
                            new_results.push(result);
                        }
                    }
                }
            }
            NodeKind::Production { prod } => {
                let prod = *prod;
                let id = self.new_token(n, t, None);
                let wmes = self.match_wmes(t);
                self.events.push(MatchEvent::Assert {
                    prod,
                    token: id,
                    wmes,
                });
            }
        }
    }

    /// For a partner result token, the token its NCC owner hangs under.
    fn result_owner_parent(&self, result: TokenId, conjuncts: u32) -> Option<TokenId> {
        let bottom = self.tokens.get(result)?.parent?;
        self.tokens.ancestor(bottom, conjuncts)
    }

    /// Elements along the chain ending at `t`, root-most first.
    fn match_wmes(&self, t: TokenId) -> Vec<Option<WmeId>> {
        let mut out = Vec::new();
        let mut cur = Some(t);
        while let Some(id) = cur {
            if id == self.dummy {
                break;
            }
            let Some(tok) = self.tokens.get(id) else { break };
            out.push(tok.wme);
            cur = tok.parent;
        }
        out.reverse();
        out
    }

    // -----------------------------------------------------------------------
    // Token removal
    // -----------------------------------------------------------------------

    /// Delete the subtrees rooted at `roots`.
    ///
    /// Every token in every subtree is marked dying before any is freed, so
    /// unblocking an NCC owner never resurrects a branch that is going away.
    fn delete_trees(&mut self, roots: Vec<TokenId>, symbols: &SymbolTable) {
        let mut order = Vec::new();
        let mut stack = roots;
        while let Some(t) = stack.pop() {
            let Some(tok) = self.tokens.get_mut(t) else {
                continue;
            };
            if tok.dying {
                continue;
            }
            tok.dying = true;
            order.push(t);
            stack.extend(tok.children.iter().copied());
        }
        for t in order.into_iter().rev() {
            self.free_token(t, symbols);
        }
    }

    fn free_token(&mut self, t: TokenId, symbols: &SymbolTable) {
        let Some(tok) = self.tokens.remove(t) else {
            return;
        };
        let kind_info = self.node_mut(tok.node).map(|node| {
            node.tokens.remove(&t);
            match &mut node.kind {
                NodeKind::Production { prod } => Freed::Production(*prod),
                NodeKind::Partner {
                    ncc, new_results, ..
                } => {
                    if tok.owner.is_none() {
                        new_results.retain(|r| *r != t);
                    }
                    Freed::Partner(*ncc)
                }
                _ => Freed::Other,
            }
        });
        match kind_info {
            Some(Freed::Production(prod)) => {
                self.events.push(MatchEvent::Retract { prod, token: t });
            }
            Some(Freed::Partner(ncc)) => {
                if let Some(o) = tok.owner {
                    let unblocked = match self.tokens.get_mut(o) {
                        Some(ot) if !ot.dying => {
                            ot.ncc_results.retain(|r| *r != t);
                            ot.is_active()
                        }
                        _ => false,
                    };
                    if unblocked {
                        self.left_activate_children(ncc, o, symbols);
                    }
                }
            }
            _ => {}
        }
        for w in &tok.neg_results {
            if let Some(list) = self.neg_index.get_mut(w) {
                list.retain(|x| *x != t);
            }
        }
        for r in &tok.ncc_results {
            if let Some(rt) = self.tokens.get_mut(*r) {
                rt.owner = None;
            }
        }
        if let Some(p) = tok.parent {
            if let Some(pt) = self.tokens.get_mut(p) {
                if !pt.dying {
                    pt.children.retain(|c| *c != t);
                }
            }
        }
        if let Some(w) = tok.wme {
            if let Some(list) = self.tokens_by_wme.get_mut(&w) {
                list.retain(|x| *x != t);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Building
    // -----------------------------------------------------------------------

    /// Compile `conds` (already in match order) for `prod`.
    ///
    /// Existing matches for the new rule are reported immediately as
    /// [`MatchEvent::Assert`]s; other rules are not re-matched.
    pub fn add_production(
        &mut self,
        prod: ProdId,
        name: &str,
        conds: &[Condition],
        symbols: &SymbolTable,
    ) -> Result<(), CompileError> {
        let mut bindings = Bindings::new();
        let mut last = ROOT;
        let bottom = match self.build_chain(ROOT, conds, &mut bindings, name, symbols, &mut last) {
            Ok(b) => b,
            Err(e) => {
                self.prune(last, symbols);
                return Err(e);
            }
        };
        let node = self.create_node(bottom, NodeKind::Production { prod });
        self.prod_nodes.insert(prod, node);
        self.update_from_above(node, symbols);
        tracing::trace!(rule = name, node = node.0, "production compiled into network");
        Ok(())
    }

    /// Remove a production's terminal node and every node only it used.
    /// Its current matches are reported as retractions.
    pub fn remove_production(&mut self, prod: ProdId, symbols: &SymbolTable) -> bool {
        match self.prod_nodes.remove(&prod) {
            Some(node) => {
                self.prune(node, symbols);
                true
            }
            None => false,
        }
    }

    fn build_chain(
        &mut self,
        parent: NodeId,
        conds: &[Condition],
        bindings: &mut Bindings,
        name: &str,
        symbols: &SymbolTable,
        last: &mut NodeId,
    ) -> Result<NodeId, CompileError> {
        let mut cur = parent;
        for c in conds {
            let depth = self.node(cur).map(|n| n.depth + 1).unwrap_or(1);
            cur = match c {
                Condition::Positive(t) => {
                    let compiled = compile_triple(name, t, depth, bindings, symbols)?;
                    let amem = self.amem_for(compiled.key);
                    let node = self.share_or_create(
                        cur,
                        NodeKind::Positive {
                            amem,
                            tests: compiled.tests,
                        },
                        symbols,
                    );
                    for (s, f) in compiled.binds {
                        bindings.insert(s, (depth, f));
                    }
                    node
                }
                Condition::Negative(t) => {
                    let compiled = compile_triple(name, t, depth, bindings, symbols)?;
                    let amem = self.amem_for(compiled.key);
                    self.share_or_create(
                        cur,
                        NodeKind::Negative {
                            amem,
                            tests: compiled.tests,
                        },
                        symbols,
                    )
                }
                Condition::Ncc(inner) => {
                    let mut scoped = bindings.clone();
                    let bottom = self.build_chain(cur, inner, &mut scoped, name, symbols, last)?;
                    self.share_or_create_ncc(cur, bottom, symbols)
                }
            };
            *last = cur;
        }
        Ok(cur)
    }

    fn amem_for(&mut self, key: AlphaKey) -> AmemId {
        if let Some(&id) = self.alpha_index.get(&key) {
            return id;
        }
        let items: BTreeSet<WmeId> = self
            .wmes
            .iter()
            .filter(|(_, f)| key.matches(f))
            .map(|(w, _)| *w)
            .collect();
        let mem = AlphaMemory {
            key,
            items,
            successors: Vec::new(),
        };
        let id = match self.free_amems.pop() {
            Some(slot) => {
                self.amems[slot as usize] = Some(mem);
                AmemId(slot)
            }
            None => {
                self.amems.push(Some(mem));
                AmemId((self.amems.len() - 1) as u32)
            }
        };
        self.alpha_index.insert(key, id);
        id
    }

    fn create_node(&mut self, parent: NodeId, kind: NodeKind) -> NodeId {
        let depth = self.node(parent).map(|p| p.depth + 1).unwrap_or(1);
        let amem = match &kind {
            NodeKind::Positive { amem, .. } | NodeKind::Negative { amem, .. } => Some(*amem),
            _ => None,
        };
        let node = Node {
            kind,
            parent: Some(parent),
            children: Vec::new(),
            tokens: BTreeSet::new(),
            depth,
        };
        let id = match self.free_nodes.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        };
        if let Some(p) = self.node_mut(parent) {
            p.children.push(id);
        }
        if let Some(am) = amem {
            if let Some(mem) = self.amems[am.0 as usize].as_mut() {
                // Descendants before ancestors, so one new element is never
                // joined twice along the same chain.
                mem.successors.insert(0, id);
            }
        }
        id
    }

    fn share_or_create(&mut self, parent: NodeId, kind: NodeKind, symbols: &SymbolTable) -> NodeId {
        let existing = self.node(parent).and_then(|p| {
            p.children
                .iter()
                .copied()
                .find(|c| self.node(*c).is_some_and(|n| n.kind == kind))
        });
        if let Some(id) = existing {
            return id;
        }
        let id = self.create_node(parent, kind);
        self.update_from_above(id, symbols);
        id
    }

    fn share_or_create_ncc(&mut self, parent: NodeId, bottom: NodeId, symbols: &SymbolTable) -> NodeId {
        let existing = self.node(parent).and_then(|p| {
            p.children.iter().copied().find(|c| match self.node(*c).map(|n| &n.kind) {
                Some(NodeKind::Ncc { partner }) => {
                    self.node(*partner).and_then(|pn| pn.parent) == Some(bottom)
                }
                _ => false,
            })
        });
        if let Some(id) = existing {
            return id;
        }
        let conjuncts = match (self.node(bottom), self.node(parent)) {
            (Some(b), Some(p)) => b.depth - p.depth,
            _ => 0,
        };
        // Placeholder partner id; fixed up once the partner exists.
        let ncc = self.create_node(parent, NodeKind::Ncc { partner: ROOT });
        let partner = self.create_node(
            bottom,
            NodeKind::Partner {
                ncc,
                conjuncts,
                new_results: Vec::new(),
            },
        );
        if let Some(n) = self.node_mut(ncc) {
            n.kind = NodeKind::Ncc { partner };
        }
        self.update_from_above(ncc, symbols);
        self.update_from_above(partner, symbols);
        ncc
    }

    /// Feed a new node every active token its parent already holds.
    fn update_from_above(&mut self, n: NodeId, symbols: &SymbolTable) {
        let Some(parent) = self.node(n).and_then(|node| node.parent) else {
            return;
        };
        for t in self.active_tokens(parent) {
            self.left_activate(n, t, symbols);
        }
    }

    /// Remove childless nodes starting at `start`, walking upward.
    fn prune(&mut self, start: NodeId, symbols: &SymbolTable) {
        let mut work = vec![start];
        while let Some(n) = work.pop() {
            let removable = self
                .node(n)
                .is_some_and(|node| node.kind != NodeKind::Root && node.children.is_empty());
            if !removable {
                continue;
            }
            let tokens: Vec<TokenId> = self
                .node(n)
                .map(|node| node.tokens.iter().copied().collect())
                .unwrap_or_default();
            self.delete_trees(tokens, symbols);
            let Some(node) = self.nodes.get_mut(n.0 as usize).and_then(Option::take) else {
                continue;
            };
            self.free_nodes.push(n.0);
            if let Some(p) = node.parent {
                if let Some(pn) = self.node_mut(p) {
                    pn.children.retain(|c| *c != n);
                }
                work.push(p);
            }
            match node.kind {
                NodeKind::Positive { amem, .. } | NodeKind::Negative { amem, .. } => {
                    self.release_amem(amem, n);
                }
                NodeKind::Ncc { partner } => work.push(partner),
                _ => {}
            }
        }
    }

    fn release_amem(&mut self, am: AmemId, node: NodeId) {
        let empty = match self.amems.get_mut(am.0 as usize).and_then(|a| a.as_mut()) {
            Some(mem) => {
                mem.successors.retain(|s| *s != node);
                mem.successors.is_empty().then_some(mem.key)
            }
            None => None,
        };
        if let Some(key) = empty {
            self.alpha_index.remove(&key);
            self.amems[am.0 as usize] = None;
            self.free_amems.push(am.0);
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Current complete matches of `prod`, as per-condition element lists.
    pub fn matches(&self, prod: ProdId) -> Vec<Vec<Option<WmeId>>> {
        let Some(node) = self.prod_nodes.get(&prod).and_then(|n| self.node(*n)) else {
            return Vec::new();
        };
        node.tokens
            .iter()
            .filter_map(|t| self.tokens.get(*t).and_then(|tok| tok.parent))
            .map(|p| self.match_wmes(p))
            .collect()
    }

    /// Every complete match, reduced to positive elements.
    pub fn all_matches(&self) -> BTreeSet<(ProdId, Vec<WmeId>)> {
        self.prod_nodes
            .keys()
            .flat_map(|p| {
                self.matches(*p)
                    .into_iter()
                    .map(move |m| (*p, m.into_iter().flatten().collect()))
            })
            .collect()
    }

    /// Active partial matches at each top-level condition of `prod`.
    pub fn partial_match_counts(&self, prod: ProdId) -> Vec<usize> {
        let mut counts = Vec::new();
        let mut cur = self
            .prod_nodes
            .get(&prod)
            .and_then(|n| self.node(*n))
            .and_then(|n| n.parent);
        while let Some(id) = cur {
            if id == ROOT {
                break;
            }
            counts.push(self.active_tokens(id).len());
            cur = self.node(id).and_then(|n| n.parent);
        }
        counts.reverse();
        counts
    }

    pub fn has_production(&self, prod: ProdId) -> bool {
        self.prod_nodes.contains_key(&prod)
    }
}

enum Freed {
    Production(ProdId),
    Partner(NodeId),
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::production::{Test, Triple};
    use crate::symbol::Sym;

    struct Fixture {
        symbols: SymbolTable,
        rete: Rete,
        next: WmeId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                symbols: SymbolTable::new(),
                rete: Rete::new(),
                next: 1,
            }
        }

        fn term(&mut self, s: &str) -> Sym {
            if s.starts_with('<') {
                self.symbols.variable(s)
            } else {
                self.symbols.string(s)
            }
        }

        fn triple(&mut self, id: &str, attr: &str, value: &str) -> Triple {
            Triple {
                id: Test::Equality(self.term(id)),
                attr: Test::Equality(self.term(attr)),
                value: Test::Equality(self.term(value)),
                acceptable: false,
            }
        }

        fn add(&mut self, id: Sym, attr: &str, value: Sym) -> WmeId {
            let w = self.next;
            self.next += 1;
            let attr = self.symbols.string(attr);
            self.rete
                .add_wme(w, WmeFields::new(id, attr, value), &self.symbols);
            w
        }
    }

    #[test]
    fn simple_join_asserts_and_retracts() {
        let mut f = Fixture::new();
        let s = f.symbols.string("s1");
        let c1 = f.triple("s1", "on", "<x>");
        let c2 = f.triple("<x>", "color", "red");
        f.rete
            .add_production(
                ProdId(0),
                "r",
                &[Condition::Positive(c1), Condition::Positive(c2)],
                &f.symbols,
            )
            .unwrap();
        let b = f.symbols.string("b1");
        let red = f.symbols.string("red");
        let w1 = f.add(s, "on", b);
        assert!(f.rete.take_events().is_empty());
        let w2 = f.add(b, "color", red);
        let events = f.rete.take_events();
        assert!(matches!(
            &events[..],
            [MatchEvent::Assert { wmes, .. }] if wmes == &vec![Some(w1), Some(w2)]
        ));
        f.rete.remove_wme(w1, &f.symbols);
        let events = f.rete.take_events();
        assert!(matches!(&events[..], [MatchEvent::Retract { .. }]));
        assert!(f.rete.all_matches().is_empty());
    }

    #[test]
    fn removing_unknown_wme_is_a_noop() {
        let mut f = Fixture::new();
        f.rete.remove_wme(999, &f.symbols);
        assert!(f.rete.take_events().is_empty());
    }

    #[test]
    fn negation_blocks_and_unblocks() {
        let mut f = Fixture::new();
        let c1 = f.triple("s1", "on", "<x>");
        let n1 = f.triple("<x>", "color", "red");
        f.rete
            .add_production(
                ProdId(0),
                "r",
                &[Condition::Positive(c1), Condition::Negative(n1)],
                &f.symbols,
            )
            .unwrap();
        let s = f.symbols.string("s1");
        let b = f.symbols.string("b1");
        let red = f.symbols.string("red");
        f.add(s, "on", b);
        assert_eq!(f.rete.all_matches().len(), 1);
        let w = f.add(b, "color", red);
        assert!(f.rete.all_matches().is_empty());
        f.rete.remove_wme(w, &f.symbols);
        assert_eq!(f.rete.all_matches().len(), 1);
    }

    #[test]
    fn ncc_blocks_only_on_complete_inner_match() {
        let mut f = Fixture::new();
        let c1 = f.triple("s1", "on", "<x>");
        let i1 = f.triple("<x>", "color", "<c>");
        let i2 = f.triple("<c>", "shade", "dark");
        f.rete
            .add_production(
                ProdId(0),
                "r",
                &[
                    Condition::Positive(c1),
                    Condition::Ncc(vec![Condition::Positive(i1), Condition::Positive(i2)]),
                ],
                &f.symbols,
            )
            .unwrap();
        let s = f.symbols.string("s1");
        let b = f.symbols.string("b1");
        let red = f.symbols.string("red");
        let dark = f.symbols.string("dark");
        f.add(s, "on", b);
        f.add(b, "color", red);
        assert_eq!(f.rete.all_matches().len(), 1);
        let w = f.add(red, "shade", dark);
        assert!(f.rete.all_matches().is_empty());
        f.rete.remove_wme(w, &f.symbols);
        assert_eq!(f.rete.all_matches().len(), 1);
    }

    #[test]
    fn shared_prefix_reuses_nodes() {
        let mut f = Fixture::new();
        let c = f.triple("s1", "on", "<x>");
        let d = f.triple("<x>", "color", "red");
        let e = f.triple("<x>", "size", "big");
        f.rete
            .add_production(
                ProdId(0),
                "a",
                &[Condition::Positive(c.clone()), Condition::Positive(d)],
                &f.symbols,
            )
            .unwrap();
        let before = f.rete.stats();
        f.rete
            .add_production(
                ProdId(1),
                "b",
                &[Condition::Positive(c), Condition::Positive(e)],
                &f.symbols,
            )
            .unwrap();
        let after = f.rete.stats();
        assert_eq!(after.positive_nodes, before.positive_nodes + 1);
        assert_eq!(after.production_nodes, 2);
    }

    #[test]
    fn new_production_sees_existing_matches_and_excise_cleans_up() {
        let mut f = Fixture::new();
        let s = f.symbols.string("s1");
        let b = f.symbols.string("b1");
        f.add(s, "on", b);
        let c = f.triple("s1", "on", "<x>");
        f.rete
            .add_production(ProdId(3), "late", &[Condition::Positive(c)], &f.symbols)
            .unwrap();
        assert!(matches!(
            &f.rete.take_events()[..],
            [MatchEvent::Assert { prod: ProdId(3), .. }]
        ));
        assert!(f.rete.remove_production(ProdId(3), &f.symbols));
        assert!(matches!(
            &f.rete.take_events()[..],
            [MatchEvent::Retract { prod: ProdId(3), .. }]
        ));
        let stats = f.rete.stats();
        assert_eq!(stats.join_nodes(), 0);
        assert_eq!(stats.alpha_memories, 0);
    }

    #[test]
    fn same_element_used_twice_does_not_duplicate() {
        let mut f = Fixture::new();
        let c1 = f.triple("<a>", "next", "<b>");
        let c2 = f.triple("<b>", "next", "<c>");
        let mut c1 = c1;
        c1.id = Test::Equality(f.symbols.string("n1"));
        f.rete
            .add_production(
                ProdId(0),
                "chain",
                &[Condition::Positive(c1), Condition::Positive(c2)],
                &f.symbols,
            )
            .unwrap();
        let n1 = f.symbols.string("n1");
        f.add(n1, "next", n1);
        assert_eq!(f.rete.all_matches().len(), 1);
    }

    fn pos(t: Triple) -> Condition {
        Condition::Positive(t)
    }

    /// Rules over blocks with negations, an NCC and a nested NCC.
    fn property_rules(f: &mut Fixture) -> Vec<Vec<Condition>> {
        vec![
            vec![
                pos(f.triple("s1", "on", "<x>")),
                pos(f.triple("<x>", "color", "<c>")),
                Condition::Negative(f.triple("<x>", "hidden", "<c>")),
            ],
            vec![
                pos(f.triple("s1", "on", "<x>")),
                Condition::Ncc(vec![
                    pos(f.triple("<x>", "color", "<c>")),
                    pos(f.triple("<c>", "shade", "dark")),
                ]),
            ],
            vec![
                pos(f.triple("s1", "on", "<x>")),
                Condition::Ncc(vec![
                    pos(f.triple("<x>", "color", "<c>")),
                    Condition::Ncc(vec![
                        pos(f.triple("<c>", "shade", "<d>")),
                        pos(f.triple("<d>", "tone", "warm")),
                    ]),
                ]),
            ],
            vec![
                pos(f.triple("s1", "on", "<x>")),
                pos(f.triple("s1", "on", "<y>")),
                Condition::Negative(f.triple("<x>", "next", "<y>")),
            ],
        ]
    }

    fn element_pool(f: &mut Fixture) -> Vec<WmeFields> {
        let mut sym = |s: &str| f.symbols.string(s);
        let blocks = [sym("b1"), sym("b2"), sym("b3")];
        let colors = [sym("red"), sym("blue")];
        let shades = [sym("dark"), sym("light")];
        let (s1, on, color, hidden) = (sym("s1"), sym("on"), sym("color"), sym("hidden"));
        let (shade, tone, warm, next) = (sym("shade"), sym("tone"), sym("warm"), sym("next"));
        let mut pool = Vec::new();
        for b in blocks {
            pool.push(WmeFields::new(s1, on, b));
            for c in colors {
                pool.push(WmeFields::new(b, color, c));
                pool.push(WmeFields::new(b, hidden, c));
            }
            for other in blocks {
                pool.push(WmeFields::new(b, next, other));
            }
        }
        for c in colors {
            for d in shades {
                pool.push(WmeFields::new(c, shade, d));
            }
        }
        for d in shades {
            pool.push(WmeFields::new(d, tone, warm));
        }
        pool
    }

    #[test]
    fn random_adds_and_removes_agree_with_naive_matching() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        for seed in 0..25u64 {
            let mut f = Fixture::new();
            let rules = property_rules(&mut f);
            let pool = element_pool(&mut f);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut present: BTreeMap<usize, WmeId> = BTreeMap::new();
            let mut wm: BTreeMap<WmeId, WmeFields> = BTreeMap::new();
            // The last rule joins the network part way through.
            let late = rules.len() - 1;
            for (i, conds) in rules[..late].iter().enumerate() {
                f.rete.add_production(ProdId(i as u32), "rule", conds, &f.symbols).unwrap();
            }

            for step in 0..80 {
                if step == 40 {
                    f.rete
                        .add_production(ProdId(late as u32), "late", &rules[late], &f.symbols)
                        .unwrap();
                }
                let pick = rng.gen_range(0..pool.len());
                match present.remove(&pick) {
                    Some(w) => {
                        wm.remove(&w);
                        f.rete.remove_wme(w, &f.symbols);
                    }
                    None => {
                        let w = f.next;
                        f.next += 1;
                        present.insert(pick, w);
                        wm.insert(w, pool[pick]);
                        f.rete.add_wme(w, pool[pick], &f.symbols);
                    }
                }
                f.rete.take_events();

                let installed = if step >= 40 { rules.len() } else { late };
                for (i, conds) in rules[..installed].iter().enumerate() {
                    let tokens = f.rete.matches(ProdId(i as u32));
                    let distinct: BTreeSet<_> = tokens.iter().cloned().collect();
                    assert_eq!(distinct.len(), tokens.len(), "duplicate token: seed {seed} step {step} rule {i}");
                    let network: BTreeSet<Vec<WmeId>> = tokens
                        .into_iter()
                        .map(|m| m.into_iter().flatten().collect())
                        .collect();
                    let expected = naive::naive_matches(conds, &wm, &f.symbols);
                    assert_eq!(network, expected, "seed {seed} step {step} rule {i}");
                }
            }
        }
    }
}
