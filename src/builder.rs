//! Builder module: merges compiled opcode blocks into a shared opcode tree.
//!
//! The builder walks the tree and the new block in lockstep while opcodes compare equal, then
//! grafts the rest of the block at the divergence point. Jumps on the shared prefix gain the
//! new block's jump targets, and a block that matches an existing path completely only adds
//! its tag to the existing result opcode.

use crate::compiler::OpcodeBlock;
use crate::filter::FilterId;
use crate::opcode::{Located, Opcode, OpcodeArena, OpcodeId, Slot};
use crate::{Result, WirequeryError};
use log::debug;

pub struct QueryTreeBuilder<'a> {
    arena: &'a mut OpcodeArena,
}

impl<'a> QueryTreeBuilder<'a> {
    pub fn new(arena: &'a mut OpcodeArena) -> Self {
        Self { arena }
    }

    /// Merges `block` below `root` and returns the id of its result opcode.
    pub fn build(&mut self, root: OpcodeId, block: OpcodeBlock, tag: Option<FilterId>) -> Result<OpcodeId> {
        let ops = block.into_ops();
        match ops.last() {
            Some(Opcode::MatchResult(_)) | Some(Opcode::SelectResult) => {}
            _ => return Err(WirequeryError::Unexpected("opcode block does not end in a result".into())),
        }

        // Tree opcode matched by each block opcode of the shared prefix.
        let mut shared: Vec<OpcodeId> = Vec::with_capacity(ops.len());
        let mut slot = Slot::Next(root);
        while shared.len() < ops.len() {
            let Some(head) = self.arena.slot_occupant(&slot)? else {
                break;
            };
            match self.arena.locate(head, &ops[shared.len()])? {
                Some(Located::Opcode(id)) => {
                    shared.push(id);
                    slot = Slot::Next(id);
                }
                Some(Located::LiteralEntry { branch, key }) => {
                    shared.push(branch);
                    slot = Slot::Literal { branch, key };
                }
                None => break,
            }
        }

        let divergence = shared.len();
        if divergence == ops.len() {
            let result = shared[divergence - 1];
            if let Some(tag) = tag {
                self.arena.add_tag(result, tag)?;
            }
            debug!("block of {} opcodes fully merged into result {}", ops.len(), result);
            return Ok(result);
        }

        let mut ids = shared.clone();
        let mut fresh = Vec::with_capacity(ops.len() - divergence);
        for op in &ops[divergence..] {
            let op = match op {
                Opcode::JumpIf { when, .. } => Opcode::JumpIf { when: *when, targets: Default::default() },
                Opcode::MatchResult(_) => Opcode::MatchResult(tag.into_iter().collect()),
                other => other.clone(),
            };
            let id = self.arena.alloc(op);
            ids.push(id);
            fresh.push(id);
        }
        for pair in fresh.windows(2) {
            self.arena.link(pair[0], pair[1])?;
        }

        // Map block-local jump targets onto tree ids, for fresh jumps and for shared jumps that
        // now also have to reach this block's targets.
        for (index, op) in ops.iter().enumerate() {
            if let Opcode::JumpIf { targets, .. } = op {
                for target in targets {
                    let mapped = ids.get(target.index()).copied().ok_or_else(|| {
                        WirequeryError::Unexpected(format!("jump target {} outside of block", target.index()))
                    })?;
                    self.arena.link_jump(ids[index], mapped)?;
                }
            }
        }

        self.arena.attach(&slot, fresh[0])?;
        debug!(
            "grafted {} of {} opcodes after {} shared",
            fresh.len(),
            ops.len(),
            divergence
        );
        Ok(ids[ops.len() - 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileMode, XPathCompiler};
    use crate::expr::{NamespaceContext, XPathParser};
    use crate::functions::FunctionRegistry;
    use crate::opcode::OpcodeKind;

    fn block(input: &str) -> OpcodeBlock {
        let expr = XPathParser::parse(input, &NamespaceContext::message_defaults()).unwrap();
        XPathCompiler::compile(&expr, CompileMode::Filter, &FunctionRegistry::builtins()).unwrap()
    }

    fn add(arena: &mut OpcodeArena, input: &str) -> (FilterId, OpcodeId) {
        let tag = FilterId::next();
        let root = arena.root();
        let result = QueryTreeBuilder::new(arena).build(root, block(input), Some(tag)).unwrap();
        (tag, result)
    }

    #[test]
    fn test_shared_prefix_is_reused() {
        let mut arena = OpcodeArena::new(true);
        add(&mut arena, "/a/b and /c");
        let before = arena.live_count();
        add(&mut arena, "/a/b and /d");
        // Select, Test and result of the second conjunct, plus one branch.
        assert_eq!(arena.live_count(), before + 4);
        assert_eq!(arena.count_kind(OpcodeKind::Branch).unwrap(), 1);
    }

    #[test]
    fn test_identical_filters_share_one_result() {
        let mut arena = OpcodeArena::new(true);
        let (t1, r1) = add(&mut arena, "/a = 'x'");
        let live = arena.live_count();
        let (t2, r2) = add(&mut arena, "/a = 'x'");
        assert_eq!(r1, r2);
        assert_eq!(arena.live_count(), live);
        assert_eq!(arena.opcode(r1).unwrap(), &Opcode::MatchResult(vec![t1, t2]));
    }

    #[test]
    fn test_literal_siblings_promote_to_one_branch() {
        let mut arena = OpcodeArena::new(true);
        for action in ["a", "b", "c", "d"] {
            add(&mut arena, &format!("/s12:Envelope/s12:Header/wsa10:Action = '{}'", action));
        }
        assert_eq!(arena.count_kind(OpcodeKind::StringBranch).unwrap(), 1);
        assert_eq!(arena.count_kind(OpcodeKind::StringEquals).unwrap(), 0);
        assert_eq!(arena.count_kind(OpcodeKind::Select).unwrap(), 3);
        // The literal entry is walked through when more conjuncts follow.
        add(&mut arena, "/s12:Envelope/s12:Header/wsa10:Action = 'b' and /x");
        assert_eq!(arena.count_kind(OpcodeKind::StringBranch).unwrap(), 1);
        assert_eq!(arena.count_kind(OpcodeKind::Branch).unwrap(), 1);
    }

    #[test]
    fn test_shared_jump_gains_new_targets() {
        let mut arena = OpcodeArena::new(true);
        add(&mut arena, "/a and (/b or /c)");
        add(&mut arena, "/a and (/b or /d)");
        let jumps: Vec<OpcodeId> = arena
            .reachable()
            .unwrap()
            .into_iter()
            .filter(|id| matches!(arena.opcode(*id), Ok(Opcode::JumpIf { .. })))
            .collect();
        assert_eq!(jumps.len(), 1);
        let targets = arena.jump_targets(jumps[0]).unwrap();
        assert_eq!(targets.len(), 2);
        for target in targets {
            assert_eq!(arena.opcode(*target).unwrap(), &Opcode::BlockEnd);
        }
    }

    #[test]
    fn test_removal_after_merge_restores_tree() {
        let mut arena = OpcodeArena::new(true);
        let (t1, r1) = add(&mut arena, "/a and (/b or /c)");
        let live = arena.live_count();
        let (t2, r2) = add(&mut arena, "/a and (/b or /d)");
        arena.remove_tag(r2, t2).unwrap();
        assert_eq!(arena.live_count(), live);
        let jump = arena
            .reachable()
            .unwrap()
            .into_iter()
            .find(|id| matches!(arena.opcode(*id), Ok(Opcode::JumpIf { .. })))
            .unwrap();
        assert_eq!(arena.jump_targets(jump).unwrap().len(), 1);
        arena.remove_tag(r1, t1).unwrap();
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn test_block_without_result_is_rejected() {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        let err = QueryTreeBuilder::new(&mut arena).build(root, OpcodeBlock::default(), None).unwrap_err();
        assert!(err.is_fatal());
    }
}
