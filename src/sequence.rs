//! Sequence module: node-sets flowing through the interpreter.
//!
//! A NodeSequence keeps the nodes a location step produced, grouped by the context node each
//! group was selected from. Positions and sizes are relative to the group, which is what
//! predicates such as `[1]` or `[last()]` see.

use crate::message::NodeId;
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceItem {
    pub node: NodeId,
    pub group: u32,
    /// 1-based position within the group.
    pub position: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSequence {
    items: Vec<SequenceItem>,
    groups: u32,
}

impl NodeSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(node: NodeId) -> Self {
        let mut seq = Self::new();
        seq.push_group(&[node]);
        seq
    }

    pub fn items(&self) -> &[SequenceItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn group_count(&self) -> u32 {
        self.groups
    }

    /// Appends one group. Empty groups still consume a group number.
    pub fn push_group(&mut self, nodes: &[NodeId]) {
        let group = self.groups;
        let size = nodes.len() as u32;
        self.items.extend(nodes.iter().enumerate().map(|(i, &node)| SequenceItem {
            node,
            group,
            position: i as u32 + 1,
            size,
        }));
        self.groups += 1;
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.groups = 0;
    }

    /// Makes this sequence a copy of `other`, reusing its buffer.
    pub fn copy_from(&mut self, other: &NodeSequence) {
        self.items.clear();
        self.items.extend_from_slice(&other.items);
        self.groups = other.groups;
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.items.iter().any(|item| item.node == node)
    }

    /// Distinct nodes in document order.
    pub fn distinct_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut nodes: Vec<NodeId> = self.items.iter().map(|item| item.node).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes.into_iter()
    }

    pub fn distinct_count(&self) -> usize {
        self.distinct_nodes().count()
    }

    pub fn first_in_document_order(&self) -> Option<NodeId> {
        self.items.iter().map(|item| item.node).min()
    }

    /// Collapses the sequence into one group holding its distinct nodes in document order.
    pub fn normalize(&mut self) {
        let mut nodes: Vec<NodeId> = self.items.iter().map(|item| item.node).collect();
        nodes.sort_unstable();
        nodes.dedup();
        self.clear();
        self.push_group(&nodes);
    }

    /// Set union, normalized.
    pub fn union_with(&mut self, other: &NodeSequence) {
        self.items.extend_from_slice(&other.items);
        self.normalize();
    }

    /// Keeps the items whose entry in `keep` is true, then renumbers positions within each group.
    pub fn retain_mask(&mut self, keep: &[bool]) {
        let mut index = 0;
        self.items.retain(|_| {
            let kept = keep.get(index).copied().unwrap_or(false);
            index += 1;
            kept
        });
        self.renumber();
    }

    fn renumber(&mut self) {
        let mut start = 0;
        while start < self.items.len() {
            let group = self.items[start].group;
            let mut end = start;
            while end < self.items.len() && self.items[end].group == group {
                end += 1;
            }
            let size = (end - start) as u32;
            for (i, item) in self.items[start..end].iter_mut().enumerate() {
                item.position = i as u32 + 1;
                item.size = size;
            }
            start = end;
        }
    }
}

/// Free list of cleared sequences owned by one processing context.
#[derive(Debug)]
pub struct SequencePool {
    free: Vec<NodeSequence>,
    capacity: usize,
}

impl SequencePool {
    pub fn new(capacity: usize) -> Self {
        Self { free: Vec::with_capacity(capacity), capacity }
    }

    pub fn acquire(&mut self) -> NodeSequence {
        self.free.pop().unwrap_or_default()
    }

    pub fn release(&mut self, mut seq: NodeSequence) {
        if self.free.len() < self.capacity {
            seq.clear();
            self.free.push(seq);
        } else {
            trace!("sequence pool full, dropping sequence");
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}
