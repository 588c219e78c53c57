//! Partial-match tokens in a generational arena.
//!
//! A token records one element (or none, for negative and NCC levels) and a
//! link to its parent; following parents recovers the whole partial match.
//! Slots are reused, so a [`TokenId`] carries a generation and a stale id
//! simply fails to resolve.

use crate::memory::wme::WmeId;

use super::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
pub(crate) struct Token {
    pub node: NodeId,
    pub parent: Option<TokenId>,
    pub wme: Option<WmeId>,
    pub children: Vec<TokenId>,
    /// Negative nodes: elements currently blocking this token.
    pub neg_results: Vec<WmeId>,
    /// NCC nodes: subnetwork matches currently blocking this token.
    pub ncc_results: Vec<TokenId>,
    /// NCC partner results: the NCC token this result blocks.
    pub owner: Option<TokenId>,
    /// Set while the token's subtree is being torn down.
    pub dying: bool,
}

impl Token {
    pub fn new(node: NodeId, parent: Option<TokenId>, wme: Option<WmeId>) -> Self {
        Self {
            node,
            parent,
            wme,
            children: Vec::new(),
            neg_results: Vec::new(),
            ncc_results: Vec::new(),
            owner: None,
            dying: false,
        }
    }

    /// Tokens blocked by a negation or NCC do not pass matches downward.
    pub fn is_active(&self) -> bool {
        self.neg_results.is_empty() && self.ncc_results.is_empty()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    token: Option<Token>,
}

#[derive(Debug, Default)]
pub(crate) struct TokenArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl TokenArena {
    pub fn insert(&mut self, token: Token) -> TokenId {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.token = Some(token);
                TokenId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    token: Some(token),
                });
                TokenId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, id: TokenId) -> Option<&Token> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.token.as_ref())
    }

    pub fn get_mut(&mut self, id: TokenId) -> Option<&mut Token> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.token.as_mut())
    }

    pub fn remove(&mut self, id: TokenId) -> Option<Token> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let token = slot.token.take()?;
        self.free.push(id.index);
        self.live -= 1;
        Some(token)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    /// Walk `levels` parents up from `id`.
    pub fn ancestor(&self, mut id: TokenId, levels: u32) -> Option<TokenId> {
        for _ in 0..levels {
            id = self.get(id)?.parent?;
        }
        Some(id)
    }
}
