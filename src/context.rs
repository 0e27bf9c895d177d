//! Context module: the interpreter that evaluates an opcode tree against one message.
//!
//! A ProcessingContext owns the operand stack, the predicate context stack, a sequence pool and
//! the queue of pending forks. Branch opcodes and taken jumps with several targets checkpoint
//! the stack and resume every other path after the current one ends, so one pass over the tree
//! evaluates every registered filter.

use crate::config::EngineConfig;
use crate::filter::FilterId;
use crate::functions::{FunctionEnv, FunctionRegistry};
use crate::message::{Document, NodeId};
use crate::opcode::{Opcode, OpcodeArena, OpcodeId};
use crate::sequence::SequencePool;
use crate::stack::{EvalStack, StackFrame};
use crate::types::{number_key, string_to_number, Value};
use crate::{Result, WirequeryError};
use log::trace;
use smallvec::SmallVec;

/// A node being tested by a predicate, with its position in the candidate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextItem {
    pub node: NodeId,
    pub position: u32,
    pub size: u32,
}

impl ContextItem {
    fn root() -> Self {
        Self { node: NodeId::ROOT, position: 1, size: 1 }
    }
}

#[derive(Debug, Clone, Default)]
struct ContextFrame {
    items: Vec<ContextItem>,
}

/// Stack and context state to resume a fork from. Buffers are recycled across forks.
#[derive(Debug, Default)]
struct Checkpoint {
    values: Vec<Value>,
    frames: Vec<StackFrame>,
    contexts: Vec<ContextFrame>,
}

fn copy_contexts(source: &[ContextFrame], target: &mut Vec<ContextFrame>) {
    target.truncate(source.len());
    for (i, frame) in source.iter().enumerate() {
        match target.get_mut(i) {
            Some(copy) => {
                copy.items.clear();
                copy.items.extend_from_slice(&frame.items);
            }
            None => target.push(frame.clone()),
        }
    }
}

/// Read-only inputs of one evaluation.
#[derive(Clone, Copy)]
pub struct EvalEnv<'a> {
    pub arena: &'a OpcodeArena,
    pub document: &'a Document,
    pub functions: &'a FunctionRegistry,
}

#[derive(Debug)]
pub struct ProcessingContext {
    stack: EvalStack,
    contexts: Vec<ContextFrame>,
    sequences: SequencePool,
    pending: Vec<(OpcodeId, Checkpoint)>,
    spare: Vec<Checkpoint>,
    matches: Vec<FilterId>,
    selected: Option<Value>,
    scratch_nodes: Vec<NodeId>,
    scratch_mask: Vec<bool>,
}

fn recycle(pool: &mut SequencePool, value: Value) {
    if let Value::Sequence(seq) = value {
        pool.release(seq);
    }
}

impl ProcessingContext {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            stack: EvalStack::new(config.max_stack_depth),
            contexts: Vec::new(),
            sequences: SequencePool::new(config.sequence_pool_capacity),
            pending: Vec::new(),
            spare: Vec::new(),
            matches: Vec::new(),
            selected: None,
            scratch_nodes: Vec::new(),
            scratch_mask: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.clear_stack();
        self.contexts.clear();
        while let Some((_, checkpoint)) = self.pending.pop() {
            self.discard(checkpoint);
        }
        self.matches.clear();
        if let Some(value) = self.selected.take() {
            recycle(&mut self.sequences, value);
        }
    }

    fn clear_stack(&mut self) {
        while self.stack.depth() > 0 {
            let sequences = &mut self.sequences;
            if self.stack.pop_frame_with(|v| recycle(sequences, v)).is_err() {
                break;
            }
        }
        self.stack.clear();
    }

    /// Tags of every result opcode reached by the last run, in visiting order.
    pub fn matches(&self) -> &[FilterId] {
        &self.matches
    }

    pub fn take_selected(&mut self) -> Option<Value> {
        self.selected.take()
    }

    pub fn pooled_sequences(&self) -> usize {
        self.sequences.available()
    }

    /// Evaluates the tree below `start` with the document root as the single context node.
    pub fn run(&mut self, env: &EvalEnv<'_>, start: OpcodeId) -> Result<()> {
        self.reset();
        self.contexts.push(ContextFrame { items: vec![ContextItem::root()] });
        let mut next = Some(start);
        loop {
            while let Some(id) = next {
                next = self.eval(env, id)?;
            }
            match self.pending.pop() {
                Some((resume, checkpoint)) => next = Some(self.restore(resume, checkpoint)),
                None => break,
            }
        }
        Ok(())
    }

    fn checkpoint(&mut self, resume: OpcodeId) {
        let mut checkpoint = self.spare.pop().unwrap_or_default();
        let sequences = &mut self.sequences;
        self.stack.copy_into(&mut checkpoint.values, &mut checkpoint.frames, |value| match value {
            Value::Sequence(seq) => {
                let mut copy = sequences.acquire();
                copy.copy_from(seq);
                Value::Sequence(copy)
            }
            other => other.clone(),
        });
        copy_contexts(&self.contexts, &mut checkpoint.contexts);
        trace!("fork to {} with {} stacked values", resume, checkpoint.values.len());
        self.pending.push((resume, checkpoint));
    }

    fn restore(&mut self, resume: OpcodeId, mut checkpoint: Checkpoint) -> OpcodeId {
        self.clear_stack();
        self.stack.swap_parts(&mut checkpoint.values, &mut checkpoint.frames);
        std::mem::swap(&mut self.contexts, &mut checkpoint.contexts);
        self.spare.push(checkpoint);
        resume
    }

    /// Returns a checkpoint's sequences to the pool and keeps its buffers.
    fn discard(&mut self, mut checkpoint: Checkpoint) {
        for value in checkpoint.values.drain(..) {
            recycle(&mut self.sequences, value);
        }
        checkpoint.frames.clear();
        self.spare.push(checkpoint);
    }

    /// Continues with the last target and queues the others.
    fn fork(&mut self, targets: &[OpcodeId]) -> Option<OpcodeId> {
        let (last, rest) = targets.split_last()?;
        for &target in rest {
            self.checkpoint(target);
        }
        Some(*last)
    }

    fn context_items(&self) -> Result<&[ContextItem]> {
        self.contexts
            .last()
            .map(|frame| frame.items.as_slice())
            .ok_or_else(|| WirequeryError::Unexpected("no evaluation context".into()))
    }

    fn context_item(&self, index: usize) -> ContextItem {
        self.contexts
            .last()
            .and_then(|frame| frame.items.get(index))
            .copied()
            .unwrap_or_else(ContextItem::root)
    }

    fn pop_frame(&mut self) -> Result<()> {
        let sequences = &mut self.sequences;
        self.stack.pop_frame_with(|v| recycle(sequences, v))
    }

    /// Pushes one singleton sequence per context item.
    fn push_nodes(&mut self, root: bool) -> Result<()> {
        let count = self.context_items()?.len();
        self.stack.push_frame()?;
        for i in 0..count {
            let node = if root { NodeId::ROOT } else { self.context_item(i).node };
            let mut seq = self.sequences.acquire();
            seq.push_group(&[node]);
            self.stack.push(Value::Sequence(seq))?;
        }
        Ok(())
    }

    fn push_literal(&mut self, value: &Value) -> Result<()> {
        let count = self.context_items()?.len();
        self.stack.push_frame()?;
        for _ in 0..count {
            self.stack.push(value.clone())?;
        }
        Ok(())
    }

    /// Applies `f` element-wise to the two top frames, leaving the results in place of the
    /// lower frame.
    fn binary(&mut self, mut f: impl FnMut(&Value, &Value) -> Result<Value>) -> Result<()> {
        let right = self.stack.top_frame()?;
        let left = self.stack.secondary_frame()?;
        if left.count() != right.count() {
            return Err(WirequeryError::Unexpected(format!(
                "operand frames differ in size: {} and {}",
                left.count(),
                right.count()
            )));
        }
        for i in 0..left.count() {
            let result = f(self.stack.value(left.base + i), self.stack.value(right.base + i))?;
            let old = self.stack.replace(left.base + i, result);
            recycle(&mut self.sequences, old);
        }
        self.pop_frame()
    }

    fn unary(&mut self, mut f: impl FnMut(&Value) -> Result<Value>) -> Result<()> {
        let frame = self.stack.top_frame()?;
        for index in frame.range() {
            let result = f(self.stack.value(index))?;
            let old = self.stack.replace(index, result);
            recycle(&mut self.sequences, old);
        }
        Ok(())
    }

    /// Pops the top frame and reports whether every value passed `test`.
    fn pop_test(&mut self, mut test: impl FnMut(&Value) -> bool) -> Result<bool> {
        let frame = self.stack.top_frame()?;
        let values = self.stack.values(frame);
        let passed = !values.is_empty() && values.iter().all(&mut test);
        self.pop_frame()?;
        Ok(passed)
    }

    fn single_operand(&self) -> Result<&Value> {
        let frame = self.stack.top_frame()?;
        if frame.count() != 1 {
            return Err(WirequeryError::Unexpected(format!(
                "literal branch expects one operand, found {}",
                frame.count()
            )));
        }
        Ok(self.stack.value(frame.base))
    }

    fn eval(&mut self, env: &EvalEnv<'_>, id: OpcodeId) -> Result<Option<OpcodeId>> {
        let node = env.arena.node(id)?;
        let doc = env.document;
        trace!("eval {} {:?}", id, node.opcode.kind());
        match &node.opcode {
            Opcode::Root | Opcode::BlockEnd => {}
            Opcode::PushContextNode => self.push_nodes(false)?,
            Opcode::PushRoot => self.push_nodes(true)?,
            Opcode::Select { axis, test } => {
                let frame = self.stack.top_frame()?;
                for index in frame.range() {
                    let mut out = self.sequences.acquire();
                    {
                        let input = self.stack.value(index).as_sequence()?;
                        for context in input.distinct_nodes() {
                            self.scratch_nodes.clear();
                            doc.select(context, *axis, test, &mut self.scratch_nodes);
                            out.push_group(&self.scratch_nodes);
                        }
                    }
                    let old = self.stack.replace(index, Value::Sequence(out));
                    recycle(&mut self.sequences, old);
                }
            }
            Opcode::Normalize => {
                let frame = self.stack.top_frame()?;
                for value in self.stack.values_mut(frame) {
                    value.as_sequence_mut()?.normalize();
                }
            }
            Opcode::Union => {
                let right = self.stack.top_frame()?;
                let left = self.stack.secondary_frame()?;
                if left.count() != right.count() {
                    return Err(WirequeryError::Unexpected("union operand frames differ in size".into()));
                }
                for i in 0..right.count() {
                    let seq = match self.stack.replace(right.base + i, Value::Boolean(false)) {
                        Value::Sequence(seq) => seq,
                        other => {
                            return Err(WirequeryError::TypeMismatch(format!(
                                "'|' expects node-sets, found a {}",
                                other.value_type()
                            )))
                        }
                    };
                    self.stack.values_mut(left)[i].as_sequence_mut()?.union_with(&seq);
                    self.sequences.release(seq);
                }
                self.pop_frame()?;
            }
            Opcode::PushString(s) => self.push_literal(&Value::String(s.clone()))?,
            Opcode::PushNumber(n) => self.push_literal(&Value::Double(*n))?,
            Opcode::Relation(op) => self.binary(|l, r| Ok(Value::Boolean(l.compare(*op, r, doc))))?,
            Opcode::Arithmetic(op) => {
                self.binary(|l, r| Ok(Value::Double(op.apply(l.to_double(doc), r.to_double(doc)))))?
            }
            Opcode::Negate => self.unary(|v| Ok(Value::Double(-v.to_double(doc))))?,
            Opcode::ToBoolean => self.unary(|v| Ok(Value::Boolean(v.to_boolean())))?,
            Opcode::LogicalAnd => self.binary(|l, r| Ok(Value::Boolean(l.to_boolean() && r.to_boolean())))?,
            Opcode::LogicalOr => self.binary(|l, r| Ok(Value::Boolean(l.to_boolean() || r.to_boolean())))?,
            Opcode::Function { function, argc } => self.call_function(env, *function, *argc)?,
            Opcode::FilterBegin => {
                let frame = self.stack.top_frame()?;
                let mut items = Vec::new();
                for value in self.stack.values(frame) {
                    items.extend(value.as_sequence()?.items().iter().map(|item| ContextItem {
                        node: item.node,
                        position: item.position,
                        size: item.size,
                    }));
                }
                self.contexts.push(ContextFrame { items });
            }
            Opcode::FilterEnd => self.filter_end()?,
            Opcode::JumpIf { when, targets } => {
                let frame = self.stack.top_frame()?;
                let taken = self.stack.values(frame).iter().all(|v| v.to_boolean() == *when);
                if taken {
                    if targets.is_empty() {
                        return Err(WirequeryError::Unexpected(format!("jump {} has no targets", id)));
                    }
                    return Ok(self.fork(targets));
                }
            }
            Opcode::Test => {
                if !self.pop_test(Value::to_boolean)? {
                    return Ok(None);
                }
            }
            Opcode::StringEquals(literal) => {
                if !self.pop_test(|v| v.equals_str(literal, doc))? {
                    return Ok(None);
                }
            }
            Opcode::NumberEquals(literal) => {
                if !self.pop_test(|v| v.equals_number(*literal, doc))? {
                    return Ok(None);
                }
            }
            Opcode::StringBranch(index) => {
                let mut hits: SmallVec<[OpcodeId; 4]> = SmallVec::new();
                match self.single_operand()? {
                    Value::String(s) => hits.extend(index.get(s).copied()),
                    Value::Sequence(seq) => {
                        for n in seq.distinct_nodes() {
                            if let Some(&child) = index.get(&doc.string_value(n)) {
                                if !hits.contains(&child) {
                                    hits.push(child);
                                }
                            }
                        }
                    }
                    Value::Double(d) => {
                        hits.extend(index.iter().filter(|(k, _)| string_to_number(k) == *d).map(|(_, c)| *c))
                    }
                    Value::Boolean(b) => hits.extend(index.iter().filter(|(k, _)| !k.is_empty() == *b).map(|(_, c)| *c)),
                }
                self.pop_frame()?;
                return Ok(self.fork(&hits));
            }
            Opcode::NumberBranch(index) => {
                let lookup = |n: f64| if n.is_nan() { None } else { index.get(&number_key(n)).copied() };
                let mut hits: SmallVec<[OpcodeId; 4]> = SmallVec::new();
                match self.single_operand()? {
                    Value::Double(d) => hits.extend(lookup(*d)),
                    Value::String(s) => hits.extend(lookup(string_to_number(s))),
                    Value::Sequence(seq) => {
                        for n in seq.distinct_nodes() {
                            if let Some(child) = lookup(string_to_number(&doc.string_value(n))) {
                                if !hits.contains(&child) {
                                    hits.push(child);
                                }
                            }
                        }
                    }
                    Value::Boolean(b) => hits.extend(
                        index
                            .iter()
                            .filter(|(k, _)| {
                                let n = f64::from_bits(**k);
                                (n != 0.0 && !n.is_nan()) == *b
                            })
                            .map(|(_, c)| *c),
                    ),
                }
                self.pop_frame()?;
                return Ok(self.fork(&hits));
            }
            Opcode::Branch(children) => return Ok(self.fork(children)),
            Opcode::MatchResult(tags) => self.matches.extend_from_slice(tags),
            Opcode::SelectResult => {
                let selected = &mut self.selected;
                let sequences = &mut self.sequences;
                self.stack.pop_frame_with(|v| {
                    if selected.is_none() {
                        *selected = Some(v);
                    } else {
                        recycle(sequences, v);
                    }
                })?;
            }
        }
        Ok(node.next)
    }

    fn call_function(&mut self, env: &EvalEnv<'_>, function: usize, argc: usize) -> Result<()> {
        let func = env
            .functions
            .get(function)
            .ok_or_else(|| WirequeryError::Unexpected(format!("unknown function id {}", function)))?;
        let mut results = Vec::new();
        if argc == 0 {
            let count = self.context_items()?.len();
            for i in 0..count {
                let item = self.context_item(i);
                let fenv = FunctionEnv { document: env.document, node: item.node, position: item.position, size: item.size };
                results.push(func.call(&[], &fenv)?);
            }
        } else {
            let mut frames: SmallVec<[StackFrame; 4]> = SmallVec::new();
            for k in (0..argc).rev() {
                frames.push(self.stack.frame_at(k)?);
            }
            let count = frames[0].count();
            if frames.iter().any(|f| f.count() != count) {
                return Err(WirequeryError::Unexpected("argument frames differ in size".into()));
            }
            for i in 0..count {
                let args: SmallVec<[&Value; 4]> = frames.iter().map(|f| self.stack.value(f.base + i)).collect();
                let item = self.context_item(i);
                let fenv = FunctionEnv { document: env.document, node: item.node, position: item.position, size: item.size };
                results.push(func.call(&args, &fenv)?);
            }
            for _ in 0..argc {
                self.pop_frame()?;
            }
        }
        self.stack.push_frame()?;
        for value in results {
            self.stack.push(value)?;
        }
        Ok(())
    }

    /// Applies predicate results to the sequences the predicate context was built from.
    fn filter_end(&mut self) -> Result<()> {
        let results = self.stack.top_frame()?;
        self.scratch_mask.clear();
        for (i, index) in results.range().enumerate() {
            let item = self.context_item(i);
            let keep = match self.stack.value(index) {
                Value::Double(n) => *n == item.position as f64,
                other => other.to_boolean(),
            };
            self.scratch_mask.push(keep);
        }
        self.pop_frame()?;
        self.contexts
            .pop()
            .ok_or_else(|| WirequeryError::Unexpected("predicate context underflow".into()))?;

        let frame = self.stack.top_frame()?;
        let mut offset = 0;
        for value in self.stack.values_mut(frame) {
            let seq = value.as_sequence_mut()?;
            let len = seq.len();
            let mask = self
                .scratch_mask
                .get(offset..offset + len)
                .ok_or_else(|| WirequeryError::Unexpected("predicate results do not cover the context".into()))?;
            seq.retain_mask(mask);
            offset += len;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::QueryTreeBuilder;
    use crate::compiler::{CompileMode, XPathCompiler};
    use crate::expr::{NamespaceContext, XPathParser};

    const DOC: &str = "<r><i k='x'>one</i><i k='y'>two</i><i k='y'>three</i><n>5</n></r>";

    fn tree(inputs: &[&str], mode: CompileMode) -> (OpcodeArena, Vec<FilterId>) {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        let functions = FunctionRegistry::builtins();
        let mut tags = Vec::new();
        for input in inputs {
            let expr = XPathParser::parse(input, &NamespaceContext::new()).unwrap();
            let block = XPathCompiler::compile(&expr, mode, &functions).unwrap();
            let tag = FilterId::next();
            QueryTreeBuilder::new(&mut arena).build(root, block, Some(tag)).unwrap();
            tags.push(tag);
        }
        (arena, tags)
    }

    fn run(inputs: &[&str], xml: &str) -> Result<Vec<bool>> {
        let (arena, tags) = tree(inputs, CompileMode::Filter);
        let doc = Document::parse(xml).unwrap();
        let functions = FunctionRegistry::builtins();
        let env = EvalEnv { arena: &arena, document: &doc, functions: &functions };
        let mut ctx = ProcessingContext::new(&EngineConfig::default());
        ctx.run(&env, arena.root())?;
        Ok(tags.iter().map(|t| ctx.matches().contains(t)).collect())
    }

    fn matches(input: &str) -> bool {
        run(&[input], DOC).unwrap()[0]
    }

    fn select(input: &str) -> Value {
        let mut arena = OpcodeArena::new(true);
        let root = arena.root();
        let functions = FunctionRegistry::builtins();
        let expr = XPathParser::parse(input, &NamespaceContext::new()).unwrap();
        let block = XPathCompiler::compile(&expr, CompileMode::Select, &functions).unwrap();
        QueryTreeBuilder::new(&mut arena).build(root, block, None).unwrap();
        let doc = Document::parse(DOC).unwrap();
        let env = EvalEnv { arena: &arena, document: &doc, functions: &functions };
        let mut ctx = ProcessingContext::new(&EngineConfig::default());
        ctx.run(&env, root).unwrap();
        ctx.take_selected().unwrap()
    }

    #[test]
    fn test_literal_and_path_tests() {
        assert!(matches("/r/i = 'two'"));
        assert!(!matches("/r/i = 'four'"));
        assert!(matches("/r/n = 5"));
        assert!(matches("/r/n"));
        assert!(!matches("/r/missing"));
        assert!(matches("/r/i and /r/n > 4"));
    }

    #[test]
    fn test_positional_predicates() {
        assert!(matches("/r/i[2] = 'two'"));
        assert!(!matches("/r/i[2] = 'one'"));
        assert!(matches("/r/i[last()] = 'three'"));
        assert!(matches("/r/i[position() = 1]/@k = 'x'"));
        assert!(matches("/r/i[3]/preceding-sibling::i[1] = 'two'"));
    }

    #[test]
    fn test_boolean_predicates_and_functions() {
        assert!(matches("count(/r/i[@k = 'y']) = 2"));
        assert!(matches("count(/r/i[string-length() = 3]) = 2"));
        assert!(matches("/r/i[@k = 'y'][2] = 'three'"));
        assert!(matches("sum(/r/n) + 1 = 6"));
        assert!(matches("concat(/r/i[1], '-', /r/n) = 'one-5'"));
        assert!(matches("not(/r/missing)"));
    }

    #[test]
    fn test_nested_logic_short_circuits() {
        assert!(matches("/r/missing or /r/i"));
        assert!(matches("(/r/i or /r/missing) and /r/n"));
        assert!(!matches("/r/i and (/r/missing or /r/nope)"));
        assert!(matches("/r/i[@k = 'x' or . = 'three'][2] = 'three'"));
    }

    #[test]
    fn test_sequence_ordering_compares_pairs() {
        assert!(!matches("/r/i < /r/n"));
        assert!(matches("/r/n >= /r/n"));
        assert!(matches("count(/r/i) < /r/n"));
        let result = run(&["/r/n > /r/i", "/r/n = 5"], DOC).unwrap();
        assert_eq!(result, vec![false, true]);
    }

    #[test]
    fn test_non_node_set_argument_raises_type_mismatch() {
        let err = run(&["count('x') = 1"], DOC).unwrap_err();
        assert!(matches!(err, WirequeryError::TypeMismatch(_)));
    }

    #[test]
    fn test_shared_tree_reports_every_match() {
        let filters = ["/r/i = 'one'", "/r/i = 'two'", "/r/i = 'four'", "/r/n = 5", "/r/n = 6", "/r/i"];
        let result = run(&filters, DOC).unwrap();
        assert_eq!(result, vec![true, true, false, true, false, true]);
    }

    #[test]
    fn test_select_results() {
        assert_eq!(select("count(/r/i)"), Value::Double(3.0));
        assert_eq!(select("string(/r/i[2])"), Value::from("two"));
        assert_eq!(select("/r/n > 4"), Value::Boolean(true));
        match select("/r/i[@k = 'y']") {
            Value::Sequence(seq) => assert_eq!(seq.distinct_count(), 2),
            other => panic!("Expected node-set, found {:?}", other),
        }
    }

    #[test]
    fn test_fork_checkpoints_are_recycled() {
        let filters = ["/r/i = 'one'", "/r/i[2] = 'two'", "/r/i = 'two'", "/r/n = 5"];
        let (arena, tags) = tree(&filters, CompileMode::Filter);
        let functions = FunctionRegistry::builtins();
        let doc = Document::parse(DOC).unwrap();
        let env = EvalEnv { arena: &arena, document: &doc, functions: &functions };
        let mut ctx = ProcessingContext::new(&EngineConfig::default());

        ctx.run(&env, arena.root()).unwrap();
        let mut first = ctx.matches().to_vec();
        first.sort();
        assert_eq!(first, tags);
        let spare = ctx.spare.len();
        assert!(spare > 0);
        assert!(ctx.pending.is_empty());

        ctx.run(&env, arena.root()).unwrap();
        let mut second = ctx.matches().to_vec();
        second.sort();
        assert_eq!(second, first);
        assert_eq!(ctx.spare.len(), spare);
        assert!(ctx.spare.iter().all(|c| c.values.is_empty() && c.frames.is_empty()));
    }

    #[test]
    fn test_context_reuse_resets_state() {
        let (arena, tags) = tree(&["/r/i = 'one'"], CompileMode::Filter);
        let functions = FunctionRegistry::builtins();
        let mut ctx = ProcessingContext::new(&EngineConfig::default());
        let hit = Document::parse(DOC).unwrap();
        let miss = Document::parse("<r/>").unwrap();
        ctx.run(&EvalEnv { arena: &arena, document: &hit, functions: &functions }, arena.root()).unwrap();
        assert_eq!(ctx.matches(), &tags[..]);
        ctx.run(&EvalEnv { arena: &arena, document: &miss, functions: &functions }, arena.root()).unwrap();
        assert!(ctx.matches().is_empty());
        assert!(ctx.pooled_sequences() > 0);
    }

    #[test]
    fn test_stack_limit_is_enforced() {
        let (arena, _) = tree(&["((((/r/i))))[1] = 'one'"], CompileMode::Filter);
        let functions = FunctionRegistry::builtins();
        let doc = Document::parse(DOC).unwrap();
        let config = EngineConfig { max_stack_depth: 1, ..EngineConfig::default() };
        let mut ctx = ProcessingContext::new(&config);
        let err = ctx.run(&EvalEnv { arena: &arena, document: &doc, functions: &functions }, arena.root());
        assert!(matches!(err, Err(WirequeryError::Unexpected(_))));
    }
}
