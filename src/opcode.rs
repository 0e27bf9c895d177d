//! Opcode module: the shared opcode graph.
//!
//! Opcodes live in an arena and refer to each other by id. Non-branch opcodes have at most one
//! successor (`next`). Branch opcodes hold several successors: a generic `Branch` forks to all
//! of its children, while `StringBranch` and `NumberBranch` index their children by literal so
//! thousands of sibling equality tests resolve with one hash lookup.
//!
//! Conditional jumps reference their targets by id, and every target keeps the ids of the jumps
//! that reach it so either side can be unlinked when a filter is removed.

use crate::expr::{Axis, NodeTest};
use crate::filter::FilterId;
use crate::functions::FunctionId;
use crate::types::{number_key, ArithmeticOp, RelationOp};
use crate::{Result, WirequeryError};
use log::{debug, trace};
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};
use std::fmt;
use std::ops::BitOr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpcodeId(u32);

impl OpcodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        OpcodeId(index as u32)
    }
}

impl fmt::Display for OpcodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct OpcodeFlags(u32);

impl OpcodeFlags {
    pub const NONE: OpcodeFlags = OpcodeFlags(0);
    /// Ends a chain; match results carry filter tags.
    pub const RESULT: OpcodeFlags = OpcodeFlags(1);
    pub const JUMP: OpcodeFlags = OpcodeFlags(1 << 1);
    /// Literal comparison or hashed literal branch.
    pub const LITERAL: OpcodeFlags = OpcodeFlags(1 << 2);
    /// Target of at least one conditional jump.
    pub const IN_CONDITIONAL: OpcodeFlags = OpcodeFlags(1 << 3);

    pub fn contains(self, other: OpcodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: OpcodeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: OpcodeFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for OpcodeFlags {
    type Output = OpcodeFlags;

    fn bitor(self, rhs: OpcodeFlags) -> OpcodeFlags {
        OpcodeFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpcodeKind {
    Root,
    PushContextNode,
    PushRoot,
    Select,
    Normalize,
    Union,
    PushString,
    PushNumber,
    Relation,
    Arithmetic,
    Negate,
    ToBoolean,
    LogicalAnd,
    LogicalOr,
    Function,
    FilterBegin,
    FilterEnd,
    JumpIf,
    BlockEnd,
    Test,
    StringEquals,
    NumberEquals,
    StringBranch,
    NumberBranch,
    Branch,
    MatchResult,
    SelectResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    /// Entry point of a shared tree.
    Root,
    /// One singleton sequence per context item, holding the context node.
    PushContextNode,
    /// One singleton sequence per context item, holding the document root.
    PushRoot,
    Select { axis: Axis, test: NodeTest },
    /// Regroups each sequence of the top frame into one document-ordered group.
    Normalize,
    Union,
    PushString(String),
    PushNumber(f64),
    Relation(RelationOp),
    Arithmetic(ArithmeticOp),
    Negate,
    ToBoolean,
    LogicalAnd,
    LogicalOr,
    Function { function: FunctionId, argc: usize },
    /// Makes the items of the top frame's sequences the current predicate context.
    FilterBegin,
    /// Pops the predicate results and the predicate context, then filters the sequences.
    FilterEnd,
    /// Jumps to every target when each value of the top frame converts to `when`. Targets hold
    /// block-local indices inside an `OpcodeBlock` and arena ids inside a tree.
    JumpIf { when: bool, targets: SmallVec<[OpcodeId; 2]> },
    BlockEnd,
    Test,
    StringEquals(String),
    NumberEquals(f64),
    StringBranch(FxHashMap<String, OpcodeId>),
    NumberBranch(FxHashMap<u64, OpcodeId>),
    Branch(Vec<OpcodeId>),
    MatchResult(Vec<FilterId>),
    SelectResult,
}

impl Opcode {
    pub fn kind(&self) -> OpcodeKind {
        match self {
            Opcode::Root => OpcodeKind::Root,
            Opcode::PushContextNode => OpcodeKind::PushContextNode,
            Opcode::PushRoot => OpcodeKind::PushRoot,
            Opcode::Select { .. } => OpcodeKind::Select,
            Opcode::Normalize => OpcodeKind::Normalize,
            Opcode::Union => OpcodeKind::Union,
            Opcode::PushString(_) => OpcodeKind::PushString,
            Opcode::PushNumber(_) => OpcodeKind::PushNumber,
            Opcode::Relation(_) => OpcodeKind::Relation,
            Opcode::Arithmetic(_) => OpcodeKind::Arithmetic,
            Opcode::Negate => OpcodeKind::Negate,
            Opcode::ToBoolean => OpcodeKind::ToBoolean,
            Opcode::LogicalAnd => OpcodeKind::LogicalAnd,
            Opcode::LogicalOr => OpcodeKind::LogicalOr,
            Opcode::Function { .. } => OpcodeKind::Function,
            Opcode::FilterBegin => OpcodeKind::FilterBegin,
            Opcode::FilterEnd => OpcodeKind::FilterEnd,
            Opcode::JumpIf { .. } => OpcodeKind::JumpIf,
            Opcode::BlockEnd => OpcodeKind::BlockEnd,
            Opcode::Test => OpcodeKind::Test,
            Opcode::StringEquals(_) => OpcodeKind::StringEquals,
            Opcode::NumberEquals(_) => OpcodeKind::NumberEquals,
            Opcode::StringBranch(_) => OpcodeKind::StringBranch,
            Opcode::NumberBranch(_) => OpcodeKind::NumberBranch,
            Opcode::Branch(_) => OpcodeKind::Branch,
            Opcode::MatchResult(_) => OpcodeKind::MatchResult,
            Opcode::SelectResult => OpcodeKind::SelectResult,
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Opcode::Branch(_) | Opcode::StringBranch(_) | Opcode::NumberBranch(_))
    }

    fn default_flags(&self) -> OpcodeFlags {
        match self {
            Opcode::StringBranch(_)
            | Opcode::NumberBranch(_)
            | Opcode::StringEquals(_)
            | Opcode::NumberEquals(_) => OpcodeFlags::LITERAL,
            Opcode::JumpIf { .. } => OpcodeFlags::JUMP,
            Opcode::MatchResult(_) | Opcode::SelectResult => OpcodeFlags::RESULT,
            _ => OpcodeFlags::NONE,
        }
    }

    /// Structural equality used when merging chains into a tree.
    ///
    /// Jump targets and result tags are not compared: two jumps with the same condition merge
    /// and collect each other's targets, two results merge and collect each other's tags.
    /// Number literals compare by hash key, so -0 and 0 merge. Branch opcodes never merge.
    pub fn merge_equals(&self, other: &Opcode) -> bool {
        match (self, other) {
            (Opcode::JumpIf { when: a, .. }, Opcode::JumpIf { when: b, .. }) => a == b,
            (Opcode::MatchResult(_), Opcode::MatchResult(_)) => true,
            (Opcode::PushNumber(a), Opcode::PushNumber(b)) | (Opcode::NumberEquals(a), Opcode::NumberEquals(b)) => {
                number_key(*a) == number_key(*b)
            }
            (a, b) if a.is_branch() || b.is_branch() => false,
            (a, b) => a == b,
        }
    }

    /// Filter tags of a match result; empty for every other opcode.
    pub fn tags(&self) -> &[FilterId] {
        match self {
            Opcode::MatchResult(tags) => tags,
            _ => &[],
        }
    }

    fn literal_key(&self) -> Option<LiteralKey> {
        match self {
            Opcode::StringEquals(s) => Some(LiteralKey::String(s.clone())),
            Opcode::NumberEquals(n) => Some(LiteralKey::Number(number_key(*n))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LiteralKey {
    String(String),
    Number(u64),
}

/// A successor position in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// The `next` link of a non-branch opcode.
    Next(OpcodeId),
    /// The entry for `key` in a hashed literal branch.
    Literal { branch: OpcodeId, key: LiteralKey },
}

/// Where an incoming opcode was found below a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    Opcode(OpcodeId),
    /// The incoming opcode is a literal comparison already absorbed by a hashed branch.
    LiteralEntry { branch: OpcodeId, key: LiteralKey },
}

#[derive(Debug, Clone)]
pub struct OpcodeNode {
    pub opcode: Opcode,
    pub flags: OpcodeFlags,
    pub prev: Option<OpcodeId>,
    pub next: Option<OpcodeId>,
    pub jump_sources: SmallVec<[OpcodeId; 2]>,
}

#[derive(Debug)]
pub struct OpcodeArena {
    nodes: Vec<Option<OpcodeNode>>,
    free: Vec<usize>,
    live: usize,
    root: OpcodeId,
    branch_promotion: bool,
}

impl OpcodeArena {
    pub fn new(branch_promotion: bool) -> Self {
        let mut arena = Self { nodes: Vec::new(), free: Vec::new(), live: 0, root: OpcodeId(0), branch_promotion };
        arena.root = arena.alloc(Opcode::Root);
        arena
    }

    pub fn root(&self) -> OpcodeId {
        self.root
    }

    /// Number of live opcodes, the root included.
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn alloc(&mut self, opcode: Opcode) -> OpcodeId {
        let node = OpcodeNode {
            flags: opcode.default_flags(),
            opcode,
            prev: None,
            next: None,
            jump_sources: SmallVec::new(),
        };
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                OpcodeId::from_index(index)
            }
            None => {
                self.nodes.push(Some(node));
                OpcodeId::from_index(self.nodes.len() - 1)
            }
        }
    }

    fn release(&mut self, id: OpcodeId) -> Result<OpcodeNode> {
        let node = self
            .nodes
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or_else(|| WirequeryError::Unexpected(format!("opcode {} is not live", id)))?;
        self.free.push(id.index());
        self.live -= 1;
        Ok(node)
    }

    pub fn contains(&self, id: OpcodeId) -> bool {
        matches!(self.nodes.get(id.index()), Some(Some(_)))
    }

    pub fn node(&self, id: OpcodeId) -> Result<&OpcodeNode> {
        self.nodes
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| WirequeryError::Unexpected(format!("opcode {} is not live", id)))
    }

    fn node_mut(&mut self, id: OpcodeId) -> Result<&mut OpcodeNode> {
        self.nodes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| WirequeryError::Unexpected(format!("opcode {} is not live", id)))
    }

    pub fn opcode(&self, id: OpcodeId) -> Result<&Opcode> {
        Ok(&self.node(id)?.opcode)
    }

    pub fn equals(&self, a: OpcodeId, b: OpcodeId) -> Result<bool> {
        Ok(self.opcode(a)?.merge_equals(self.opcode(b)?))
    }

    /// Every opcode control can flow to from `id`, jump targets excluded.
    pub fn successors(&self, id: OpcodeId) -> Result<SmallVec<[OpcodeId; 4]>> {
        let node = self.node(id)?;
        Ok(match &node.opcode {
            Opcode::Branch(children) => children.iter().copied().collect(),
            Opcode::StringBranch(index) => index.values().copied().collect(),
            Opcode::NumberBranch(index) => index.values().copied().collect(),
            _ => node.next.into_iter().collect(),
        })
    }

    pub fn jump_targets(&self, id: OpcodeId) -> Result<&[OpcodeId]> {
        match &self.node(id)?.opcode {
            Opcode::JumpIf { targets, .. } => Ok(targets),
            other => Err(WirequeryError::Unexpected(format!("{:?} is not a jump", other.kind()))),
        }
    }

    /// Adds `target` to a jump's targets unless already present.
    pub fn link_jump(&mut self, source: OpcodeId, target: OpcodeId) -> Result<()> {
        match &mut self.node_mut(source)?.opcode {
            Opcode::JumpIf { targets, .. } => {
                if targets.contains(&target) {
                    return Ok(());
                }
                targets.push(target);
            }
            other => return Err(WirequeryError::Unexpected(format!("{:?} is not a jump", other.kind()))),
        }
        let node = self.node_mut(target)?;
        node.jump_sources.push(source);
        node.flags.insert(OpcodeFlags::IN_CONDITIONAL);
        Ok(())
    }

    /// Links `next` after the non-branch opcode `prev`.
    pub fn link(&mut self, prev: OpcodeId, next: OpcodeId) -> Result<()> {
        self.node_mut(prev)?.next = Some(next);
        self.node_mut(next)?.prev = Some(prev);
        Ok(())
    }

    pub fn slot_occupant(&self, slot: &Slot) -> Result<Option<OpcodeId>> {
        match slot {
            Slot::Next(id) => Ok(self.node(*id)?.next),
            Slot::Literal { branch, key } => Ok(self.literal_child(*branch, key)?),
        }
    }

    fn literal_child(&self, branch: OpcodeId, key: &LiteralKey) -> Result<Option<OpcodeId>> {
        Ok(match (&self.node(branch)?.opcode, key) {
            (Opcode::StringBranch(index), LiteralKey::String(s)) => index.get(s).copied(),
            (Opcode::NumberBranch(index), LiteralKey::Number(n)) => index.get(n).copied(),
            _ => None,
        })
    }

    /// Finds where `incoming` continues below the opcode occupying a slot.
    pub fn locate(&self, head: OpcodeId, incoming: &Opcode) -> Result<Option<Located>> {
        let node = self.node(head)?;
        if let Opcode::Branch(children) = &node.opcode {
            for &child in children {
                if let Some(found) = self.locate_direct(child, incoming)? {
                    return Ok(Some(found));
                }
            }
            return Ok(None);
        }
        self.locate_direct(head, incoming)
    }

    fn locate_direct(&self, id: OpcodeId, incoming: &Opcode) -> Result<Option<Located>> {
        let opcode = self.opcode(id)?;
        if opcode.merge_equals(incoming) {
            return Ok(Some(Located::Opcode(id)));
        }
        if let Some(key) = incoming.literal_key() {
            if self.literal_child(id, &key)?.is_some() {
                return Ok(Some(Located::LiteralEntry { branch: id, key }));
            }
        }
        Ok(None)
    }

    /// Attaches the chain headed by `head` at `slot`, branching when the slot is occupied.
    pub fn attach(&mut self, slot: &Slot, head: OpcodeId) -> Result<()> {
        match slot {
            Slot::Next(parent) => {
                let merged = match self.node(*parent)?.next {
                    None => head,
                    Some(existing) => self.add_branch(existing, head)?,
                };
                self.link(*parent, merged)
            }
            Slot::Literal { branch, key } => {
                let existing = self
                    .literal_child(*branch, key)?
                    .ok_or_else(|| WirequeryError::Unexpected(format!("no literal entry under {}", branch)))?;
                let merged = self.add_branch(existing, head)?;
                self.set_literal_child(*branch, key, merged)?;
                self.node_mut(merged)?.prev = Some(*branch);
                Ok(())
            }
        }
    }

    /// Combines the opcode occupying a slot with a new sibling and returns the opcode that now
    /// occupies the slot. Sibling literal comparisons of one kind are promoted into a hashed
    /// branch; anything else lands in a generic branch.
    pub fn add_branch(&mut self, existing: OpcodeId, new: OpcodeId) -> Result<OpcodeId> {
        let existing_op = self.opcode(existing)?;
        let new_op = self.opcode(new)?;
        if self.branch_promotion {
            match (existing_op, new_op) {
                (Opcode::StringEquals(_), Opcode::StringEquals(_))
                | (Opcode::NumberEquals(_), Opcode::NumberEquals(_)) => {
                    if existing_op.merge_equals(new_op) {
                        return self.merge_literal(existing, new);
                    }
                    return self.promote_literals(existing, new);
                }
                (Opcode::StringBranch(_), Opcode::StringEquals(_))
                | (Opcode::NumberBranch(_), Opcode::NumberEquals(_)) => {
                    self.insert_literal(existing, new)?;
                    return Ok(existing);
                }
                _ => {}
            }
        }
        if let Opcode::Branch(_) = existing_op {
            self.add_branch_child(existing, new)?;
            return Ok(existing);
        }
        let branch = self.alloc(Opcode::Branch(vec![existing, new]));
        self.node_mut(existing)?.prev = Some(branch);
        self.node_mut(new)?.prev = Some(branch);
        trace!("branching {} and {} under {}", existing, new, branch);
        Ok(branch)
    }

    fn add_branch_child(&mut self, branch: OpcodeId, new: OpcodeId) -> Result<()> {
        let mut sibling = None;
        if self.branch_promotion {
            if let Some(key) = self.opcode(new)?.literal_key() {
                let children = match self.opcode(branch)? {
                    Opcode::Branch(children) => children.clone(),
                    _ => Vec::new(),
                };
                for (index, child) in children.into_iter().enumerate() {
                    let node = self.node(child)?;
                    let compatible = node.flags.contains(OpcodeFlags::LITERAL)
                        && matches!(
                            (&node.opcode, &key),
                            (Opcode::StringEquals(_) | Opcode::StringBranch(_), LiteralKey::String(_))
                                | (Opcode::NumberEquals(_) | Opcode::NumberBranch(_), LiteralKey::Number(_))
                        );
                    if compatible {
                        sibling = Some((index, child));
                        break;
                    }
                }
            }
        }
        let (index, occupant) = match sibling {
            Some((index, child)) => (Some(index), self.add_branch(child, new)?),
            None => (None, new),
        };
        if let Opcode::Branch(children) = &mut self.node_mut(branch)?.opcode {
            match index {
                Some(i) => children[i] = occupant,
                None => children.push(occupant),
            }
        }
        self.node_mut(occupant)?.prev = Some(branch);
        Ok(())
    }

    fn continuation(&self, id: OpcodeId) -> Result<OpcodeId> {
        self.node(id)?
            .next
            .ok_or_else(|| WirequeryError::Unexpected(format!("literal test {} has no continuation", id)))
    }

    /// Two identical literal tests: keep the first and branch their continuations.
    fn merge_literal(&mut self, existing: OpcodeId, new: OpcodeId) -> Result<OpcodeId> {
        let ours = self.continuation(existing)?;
        let theirs = self.continuation(new)?;
        let merged = self.add_branch(ours, theirs)?;
        self.link(existing, merged)?;
        self.release(new)?;
        Ok(existing)
    }

    fn promote_literals(&mut self, existing: OpcodeId, new: OpcodeId) -> Result<OpcodeId> {
        let ours = self.continuation(existing)?;
        let theirs = self.continuation(new)?;
        let branch = match (self.opcode(existing)?, self.opcode(new)?) {
            (Opcode::StringEquals(a), Opcode::StringEquals(b)) => {
                let mut index = FxHashMap::default();
                index.insert(a.clone(), ours);
                index.insert(b.clone(), theirs);
                Opcode::StringBranch(index)
            }
            (Opcode::NumberEquals(a), Opcode::NumberEquals(b)) => {
                let mut index = FxHashMap::default();
                index.insert(number_key(*a), ours);
                index.insert(number_key(*b), theirs);
                Opcode::NumberBranch(index)
            }
            _ => return Err(WirequeryError::Unexpected("promoting non-literal opcodes".into())),
        };
        let branch = self.alloc(branch);
        self.node_mut(ours)?.prev = Some(branch);
        self.node_mut(theirs)?.prev = Some(branch);
        self.release(existing)?;
        self.release(new)?;
        debug!("promoted sibling literal tests into hashed branch {}", branch);
        Ok(branch)
    }

    fn insert_literal(&mut self, branch: OpcodeId, new: OpcodeId) -> Result<()> {
        let key = self
            .opcode(new)?
            .literal_key()
            .ok_or_else(|| WirequeryError::Unexpected("inserting a non-literal opcode".into()))?;
        let theirs = self.continuation(new)?;
        let occupant = match self.literal_child(branch, &key)? {
            Some(existing) => self.add_branch(existing, theirs)?,
            None => theirs,
        };
        self.set_literal_child(branch, &key, occupant)?;
        self.node_mut(occupant)?.prev = Some(branch);
        self.release(new)?;
        Ok(())
    }

    fn set_literal_child(&mut self, branch: OpcodeId, key: &LiteralKey, child: OpcodeId) -> Result<()> {
        match (&mut self.node_mut(branch)?.opcode, key) {
            (Opcode::StringBranch(index), LiteralKey::String(s)) => {
                index.insert(s.clone(), child);
            }
            (Opcode::NumberBranch(index), LiteralKey::Number(n)) => {
                index.insert(*n, child);
            }
            _ => return Err(WirequeryError::Unexpected(format!("literal key mismatch at {}", branch))),
        }
        Ok(())
    }

    pub fn add_tag(&mut self, result: OpcodeId, tag: FilterId) -> Result<()> {
        match &mut self.node_mut(result)?.opcode {
            Opcode::MatchResult(tags) => {
                if !tags.contains(&tag) {
                    tags.push(tag);
                }
                Ok(())
            }
            other => Err(WirequeryError::Unexpected(format!("{:?} carries no result tags", other.kind()))),
        }
    }

    /// Drops a tag from a result opcode, pruning the result once no tag is left.
    /// Returns true when the result was pruned.
    pub fn remove_tag(&mut self, result: OpcodeId, tag: FilterId) -> Result<bool> {
        let empty = match &mut self.node_mut(result)?.opcode {
            Opcode::MatchResult(tags) => {
                tags.retain(|t| *t != tag);
                tags.is_empty()
            }
            other => return Err(WirequeryError::Unexpected(format!("{:?} carries no result tags", other.kind()))),
        };
        if empty && self.successors(result)?.is_empty() {
            self.remove(result)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Unlinks a leaf opcode and prunes every ancestor left without successors.
    pub fn remove(&mut self, id: OpcodeId) -> Result<()> {
        let mut current = id;
        while current != self.root {
            let node = self.release(current)?;
            if node.flags.contains(OpcodeFlags::IN_CONDITIONAL) {
                for source in &node.jump_sources {
                    if let Some(Some(src)) = self.nodes.get_mut(source.index()) {
                        if let Opcode::JumpIf { targets, .. } = &mut src.opcode {
                            targets.retain(|t| *t != current);
                        }
                    }
                }
            }
            if let Opcode::JumpIf { targets, .. } = &node.opcode {
                for target in targets {
                    if let Some(Some(t)) = self.nodes.get_mut(target.index()) {
                        t.jump_sources.retain(|s| *s != current);
                        if t.jump_sources.is_empty() {
                            t.flags.remove(OpcodeFlags::IN_CONDITIONAL);
                        }
                    }
                }
            }
            trace!("removed {:?} {}", node.opcode.kind(), current);
            let Some(parent) = node.prev else {
                break;
            };
            if !self.detach_child(parent, current)? || !self.prunable(parent)? {
                break;
            }
            current = parent;
        }
        Ok(())
    }

    fn prunable(&self, id: OpcodeId) -> Result<bool> {
        if id == self.root {
            return Ok(false);
        }
        let node = self.node(id)?;
        if node.flags.contains(OpcodeFlags::RESULT) {
            return Ok(node.opcode.tags().is_empty());
        }
        Ok(match &node.opcode {
            Opcode::JumpIf { targets, .. } => targets.is_empty(),
            _ => true,
        })
    }

    /// Removes `child` from its parent's successors. Returns true when the parent has none left.
    fn detach_child(&mut self, parent: OpcodeId, child: OpcodeId) -> Result<bool> {
        let node = self.node_mut(parent)?;
        let remaining = match &mut node.opcode {
            Opcode::Branch(children) => {
                children.retain(|c| *c != child);
                children.len()
            }
            Opcode::StringBranch(index) => {
                index.retain(|_, c| *c != child);
                index.len()
            }
            Opcode::NumberBranch(index) => {
                index.retain(|_, c| *c != child);
                index.len()
            }
            _ => {
                if node.next == Some(child) {
                    node.next = None;
                }
                return Ok(node.next.is_none());
            }
        };
        match remaining {
            0 => Ok(true),
            1 => {
                self.collapse(parent)?;
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    /// Replaces a branch left with one successor by that successor, demoting hashed branches
    /// back into a single literal test.
    fn collapse(&mut self, branch: OpcodeId) -> Result<()> {
        let grand = self
            .node(branch)?
            .prev
            .ok_or_else(|| WirequeryError::Unexpected(format!("branch {} has no parent", branch)))?;
        let (replacement, child) = match &self.node(branch)?.opcode {
            Opcode::Branch(children) => match children.first() {
                Some(child) => (None, *child),
                None => return Ok(()),
            },
            Opcode::StringBranch(index) => match index.iter().next() {
                Some((key, child)) => (Some(Opcode::StringEquals(key.clone())), *child),
                None => return Ok(()),
            },
            Opcode::NumberBranch(index) => match index.iter().next() {
                Some((key, child)) => (Some(Opcode::NumberEquals(f64::from_bits(*key))), *child),
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        let occupant = match replacement {
            Some(opcode) => {
                let demoted = self.alloc(opcode);
                self.link(demoted, child)?;
                debug!("demoted hashed branch {} into literal test {}", branch, demoted);
                demoted
            }
            None => child,
        };
        self.release(branch)?;
        self.node_mut(occupant)?.prev = Some(grand);
        self.replace_successor(grand, branch, occupant)
    }

    fn replace_successor(&mut self, parent: OpcodeId, old: OpcodeId, new: OpcodeId) -> Result<()> {
        let node = self.node_mut(parent)?;
        match &mut node.opcode {
            Opcode::Branch(children) => {
                for c in children.iter_mut().filter(|c| **c == old) {
                    *c = new;
                }
            }
            Opcode::StringBranch(index) => {
                for c in index.values_mut().filter(|c| **c == old) {
                    *c = new;
                }
            }
            Opcode::NumberBranch(index) => {
                for c in index.values_mut().filter(|c| **c == old) {
                    *c = new;
                }
            }
            _ => {
                if node.next == Some(old) {
                    node.next = Some(new);
                }
            }
        }
        Ok(())
    }

    /// Opcodes reachable from the root, in depth-first order.
    pub fn reachable(&self) -> Result<Vec<OpcodeId>> {
        let mut seen = vec![false; self.nodes.len()];
        let mut out = Vec::new();
        let mut pending: SmallVec<[OpcodeId; 16]> = smallvec![self.root];
        while let Some(id) = pending.pop() {
            if seen[id.index()] {
                continue;
            }
            seen[id.index()] = true;
            out.push(id);
            pending.extend(self.successors(id)?);
            if self.node(id)?.flags.contains(OpcodeFlags::JUMP) {
                pending.extend(self.jump_targets(id)?.iter().copied());
            }
        }
        Ok(out)
    }

    /// Counts reachable opcodes of one kind.
    pub fn count_kind(&self, kind: OpcodeKind) -> Result<usize> {
        let mut count = 0;
        for id in self.reachable()? {
            if self.opcode(id)?.kind() == kind {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(arena: &mut OpcodeArena, ops: Vec<Opcode>) -> (OpcodeId, OpcodeId) {
        let ids: Vec<OpcodeId> = ops.into_iter().map(|op| arena.alloc(op)).collect();
        for pair in ids.windows(2) {
            arena.link(pair[0], pair[1]).unwrap();
        }
        (ids[0], *ids.last().unwrap())
    }

    fn literal_chain(arena: &mut OpcodeArena, literal: &str, tag: FilterId) -> (OpcodeId, OpcodeId) {
        chain(arena, vec![Opcode::StringEquals(literal.into()), Opcode::MatchResult(vec![tag])])
    }

    #[test]
    fn test_merge_equals_ignores_targets_and_tags() {
        let a = Opcode::JumpIf { when: true, targets: smallvec![OpcodeId(1)] };
        let b = Opcode::JumpIf { when: true, targets: smallvec![OpcodeId(9)] };
        assert!(a.merge_equals(&b));
        assert!(!a.merge_equals(&Opcode::JumpIf { when: false, targets: SmallVec::new() }));
        assert!(Opcode::MatchResult(vec![FilterId::next()]).merge_equals(&Opcode::MatchResult(vec![])));
        assert!(Opcode::NumberEquals(0.0).merge_equals(&Opcode::NumberEquals(-0.0)));
        assert!(!Opcode::Branch(vec![]).merge_equals(&Opcode::Branch(vec![])));
    }

    #[test]
    fn test_string_literals_promote_and_demote() {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        let tags: Vec<FilterId> = (0..3).map(|_| FilterId::next()).collect();
        let mut results = Vec::new();
        for (i, lit) in ["a", "b", "c"].iter().enumerate() {
            let (head, result) = literal_chain(&mut arena, lit, tags[i]);
            arena.attach(&Slot::Next(root), head).unwrap();
            results.push(result);
        }
        assert_eq!(arena.count_kind(OpcodeKind::StringBranch).unwrap(), 1);
        assert_eq!(arena.count_kind(OpcodeKind::StringEquals).unwrap(), 0);
        assert_eq!(arena.count_kind(OpcodeKind::Branch).unwrap(), 0);

        assert!(arena.remove_tag(results[0], tags[0]).unwrap());
        assert_eq!(arena.count_kind(OpcodeKind::StringBranch).unwrap(), 1);
        assert!(arena.remove_tag(results[1], tags[1]).unwrap());
        assert_eq!(arena.count_kind(OpcodeKind::StringBranch).unwrap(), 0);
        assert_eq!(arena.count_kind(OpcodeKind::StringEquals).unwrap(), 1);
        assert!(arena.remove_tag(results[2], tags[2]).unwrap());
        assert_eq!(arena.live_count(), 1);
        assert_eq!(arena.node(root).unwrap().next, None);
    }

    #[test]
    fn test_number_literals_promote_and_demote() {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        let tags: Vec<FilterId> = (0..3).map(|_| FilterId::next()).collect();
        let mut results = Vec::new();
        for (i, n) in [5.0, 6.0, 7.0].into_iter().enumerate() {
            let (head, result) = chain(&mut arena, vec![Opcode::NumberEquals(n), Opcode::MatchResult(vec![tags[i]])]);
            arena.attach(&Slot::Next(root), head).unwrap();
            results.push(result);
        }
        let branch = arena.node(root).unwrap().next.unwrap();
        assert_eq!(arena.opcode(branch).unwrap().kind(), OpcodeKind::NumberBranch);
        assert_eq!(arena.successors(branch).unwrap().len(), 3);
        assert_eq!(arena.count_kind(OpcodeKind::NumberEquals).unwrap(), 0);

        assert!(arena.remove_tag(results[0], tags[0]).unwrap());
        assert!(arena.remove_tag(results[2], tags[2]).unwrap());
        let demoted = arena.node(root).unwrap().next.unwrap();
        assert_eq!(arena.opcode(demoted).unwrap(), &Opcode::NumberEquals(6.0));
        assert_eq!(arena.node(demoted).unwrap().prev, Some(root));
        assert_eq!(arena.node(demoted).unwrap().next, Some(results[1]));
        assert_eq!(arena.node(results[1]).unwrap().prev, Some(demoted));
        assert_eq!(arena.count_kind(OpcodeKind::NumberBranch).unwrap(), 0);
        assert_eq!(arena.live_count(), 3);
    }

    #[test]
    fn test_string_and_number_literals_split_by_key_type() {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        let literals = [
            Opcode::StringEquals("x".into()),
            Opcode::NumberEquals(5.0),
            Opcode::NumberEquals(6.0),
            Opcode::StringEquals("y".into()),
        ];
        for literal in literals {
            let (head, _) = chain(&mut arena, vec![literal, Opcode::MatchResult(vec![FilterId::next()])]);
            arena.attach(&Slot::Next(root), head).unwrap();
        }
        assert_eq!(arena.count_kind(OpcodeKind::Branch).unwrap(), 1);
        assert_eq!(arena.count_kind(OpcodeKind::StringBranch).unwrap(), 1);
        assert_eq!(arena.count_kind(OpcodeKind::NumberBranch).unwrap(), 1);
        let branch = arena.node(root).unwrap().next.unwrap();
        assert_eq!(arena.successors(branch).unwrap().len(), 2);
        let head = arena.slot_occupant(&Slot::Next(root)).unwrap().unwrap();
        assert!(matches!(
            arena.locate(head, &Opcode::NumberEquals(6.0)).unwrap(),
            Some(Located::LiteralEntry { key: LiteralKey::Number(_), .. })
        ));
        assert!(arena.locate(head, &Opcode::NumberEquals(7.0)).unwrap().is_none());
    }

    #[test]
    fn test_promotion_disabled_uses_generic_branch() {
        let mut arena = OpcodeArena::new(false);
        let root = arena.root();
        for lit in ["a", "b"] {
            let (head, _) = literal_chain(&mut arena, lit, FilterId::next());
            arena.attach(&Slot::Next(root), head).unwrap();
        }
        assert_eq!(arena.count_kind(OpcodeKind::Branch).unwrap(), 1);
        assert_eq!(arena.count_kind(OpcodeKind::StringEquals).unwrap(), 2);
    }

    #[test]
    fn test_locate_finds_literal_entries() {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        for lit in ["a", "b"] {
            let (head, _) = literal_chain(&mut arena, lit, FilterId::next());
            arena.attach(&Slot::Next(root), head).unwrap();
        }
        let head = arena.slot_occupant(&Slot::Next(root)).unwrap().unwrap();
        let found = arena.locate(head, &Opcode::StringEquals("b".into())).unwrap();
        assert!(matches!(found, Some(Located::LiteralEntry { .. })));
        assert!(arena.locate(head, &Opcode::StringEquals("z".into())).unwrap().is_none());
        assert!(arena.locate(head, &Opcode::NumberEquals(1.0)).unwrap().is_none());
    }

    #[test]
    fn test_mixed_siblings_promote_inside_generic_branch() {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        let (test_head, _) = chain(&mut arena, vec![Opcode::Test, Opcode::MatchResult(vec![FilterId::next()])]);
        arena.attach(&Slot::Next(root), test_head).unwrap();
        for lit in ["x", "y"] {
            let (head, _) = literal_chain(&mut arena, lit, FilterId::next());
            arena.attach(&Slot::Next(root), head).unwrap();
        }
        assert_eq!(arena.count_kind(OpcodeKind::Branch).unwrap(), 1);
        assert_eq!(arena.count_kind(OpcodeKind::StringBranch).unwrap(), 1);
        let branch = arena.node(root).unwrap().next.unwrap();
        assert_eq!(arena.successors(branch).unwrap().len(), 2);
    }

    #[test]
    fn test_generic_branch_collapses_on_removal() {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        let t1 = FilterId::next();
        let t2 = FilterId::next();
        let (h1, r1) = chain(&mut arena, vec![Opcode::Test, Opcode::MatchResult(vec![t1])]);
        let (h2, r2) = chain(&mut arena, vec![Opcode::Negate, Opcode::Test, Opcode::MatchResult(vec![t2])]);
        arena.attach(&Slot::Next(root), h1).unwrap();
        arena.attach(&Slot::Next(root), h2).unwrap();
        assert_eq!(arena.count_kind(OpcodeKind::Branch).unwrap(), 1);
        arena.remove_tag(r1, t1).unwrap();
        assert_eq!(arena.count_kind(OpcodeKind::Branch).unwrap(), 0);
        assert_eq!(arena.node(root).unwrap().next, Some(h2));
        assert_eq!(arena.node(h2).unwrap().prev, Some(root));
        arena.remove_tag(r2, t2).unwrap();
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn test_jump_links_are_delinked_on_removal() {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        let tag = FilterId::next();
        let (jump, end) = chain(&mut arena, vec![Opcode::JumpIf { when: true, targets: SmallVec::new() }, Opcode::BlockEnd]);
        let result = arena.alloc(Opcode::MatchResult(vec![tag]));
        arena.link(end, result).unwrap();
        arena.link_jump(jump, end).unwrap();
        arena.link_jump(jump, end).unwrap();
        arena.attach(&Slot::Next(root), jump).unwrap();
        assert_eq!(arena.jump_targets(jump).unwrap(), &[end]);
        assert!(arena.node(end).unwrap().flags.contains(OpcodeFlags::IN_CONDITIONAL));
        arena.remove_tag(result, tag).unwrap();
        assert!(!arena.contains(jump));
        assert!(!arena.contains(end));
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn test_result_with_tags_is_not_pruned() {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        let a = FilterId::next();
        let b = FilterId::next();
        let (head, result) = chain(&mut arena, vec![Opcode::Test, Opcode::MatchResult(vec![a])]);
        arena.attach(&Slot::Next(root), head).unwrap();
        arena.add_tag(result, b).unwrap();
        assert!(!arena.remove_tag(result, a).unwrap());
        assert!(arena.contains(result));
        assert!(arena.remove_tag(result, b).unwrap());
        assert!(!arena.contains(head));
    }

    #[test]
    fn test_flags_follow_opcode_roles() {
        let mut arena = OpcodeArena::new(true);
        let literal = arena.alloc(Opcode::NumberEquals(1.0));
        let jump = arena.alloc(Opcode::JumpIf { when: false, targets: SmallVec::new() });
        let result = arena.alloc(Opcode::MatchResult(vec![FilterId::next()]));
        let plain = arena.alloc(Opcode::Test);
        assert!(arena.node(literal).unwrap().flags.contains(OpcodeFlags::LITERAL));
        assert!(arena.node(jump).unwrap().flags.contains(OpcodeFlags::JUMP));
        assert!(arena.node(result).unwrap().flags.contains(OpcodeFlags::RESULT));
        assert_eq!(arena.node(plain).unwrap().flags, OpcodeFlags::NONE);

        let mut flags = OpcodeFlags::RESULT | OpcodeFlags::IN_CONDITIONAL;
        flags.remove(OpcodeFlags::RESULT);
        assert_eq!(flags, OpcodeFlags::IN_CONDITIONAL);
    }
}
