//! Compiler module: compiles XPath expressions into linear opcode blocks.
//!
//! A block is one filter's chain before it is merged into a shared tree. Jump targets inside a
//! block are block-local indices; the tree builder maps them to arena ids. All compile errors
//! surface here, before the tree is touched.

use crate::expr::{LocationPath, Step, XPathExpr};
use crate::functions::FunctionRegistry;
use crate::opcode::{Opcode, OpcodeId};
use crate::types::{RelationOp, ValueType};
use crate::{Result, WirequeryError};
use log::trace;
use smallvec::{smallvec, SmallVec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// Boolean filter ending in a match result.
    Filter,
    /// Value-returning query ending in a select result.
    Select,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpcodeBlock {
    ops: Vec<Opcode>,
}

impl OpcodeBlock {
    pub fn ops(&self) -> &[Opcode] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Opcode> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn push(&mut self, op: Opcode) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }
}

pub struct XPathCompiler<'a> {
    functions: &'a FunctionRegistry,
    block: OpcodeBlock,
}

impl<'a> XPathCompiler<'a> {
    pub fn new(functions: &'a FunctionRegistry) -> Self {
        Self { functions, block: OpcodeBlock::default() }
    }

    pub fn compile(expr: &XPathExpr, mode: CompileMode, functions: &FunctionRegistry) -> Result<OpcodeBlock> {
        let mut compiler = XPathCompiler::new(functions);
        match mode {
            CompileMode::Filter => compiler.compile_filter(expr)?,
            CompileMode::Select => {
                compiler.compile_value(expr)?;
                compiler.block.push(Opcode::SelectResult);
            }
        }
        trace!("compiled {} opcodes", compiler.block.len());
        Ok(compiler.block)
    }

    /// Top-level conjuncts become tests that end the path when false, so filters sharing a
    /// leading conjunct share its opcodes.
    fn compile_filter(&mut self, expr: &XPathExpr) -> Result<()> {
        for conjunct in expr.conjuncts() {
            match literal_comparison(conjunct) {
                Some((operand, literal)) => {
                    self.compile_value(operand)?;
                    match literal {
                        XPathExpr::String(s) => self.block.push(Opcode::StringEquals(s.clone())),
                        XPathExpr::Number(n) => self.block.push(Opcode::NumberEquals(*n)),
                        _ => return Err(WirequeryError::Compile("expected a literal".into())),
                    };
                }
                None => {
                    self.compile_value(conjunct)?;
                    self.block.push(Opcode::Test);
                }
            }
        }
        self.block.push(Opcode::MatchResult(Vec::new()));
        Ok(())
    }

    fn compile_value(&mut self, expr: &XPathExpr) -> Result<()> {
        match expr {
            XPathExpr::Or(left, right) => self.compile_logical(left, right, true),
            XPathExpr::And(left, right) => self.compile_logical(left, right, false),
            XPathExpr::Relational { op, left, right } => {
                self.compile_value(left)?;
                self.compile_value(right)?;
                self.block.push(Opcode::Relation(*op));
                Ok(())
            }
            XPathExpr::Arithmetic { op, left, right } => {
                self.compile_value(left)?;
                self.compile_value(right)?;
                self.block.push(Opcode::Arithmetic(*op));
                Ok(())
            }
            XPathExpr::Negate(inner) => {
                self.compile_value(inner)?;
                self.block.push(Opcode::Negate);
                Ok(())
            }
            XPathExpr::Union(left, right) => {
                if !self.may_be_node_set(left) || !self.may_be_node_set(right) {
                    return Err(WirequeryError::Compile("operands of '|' must be node-sets".into()));
                }
                self.compile_value(left)?;
                self.compile_value(right)?;
                self.block.push(Opcode::Union);
                Ok(())
            }
            XPathExpr::Path(path) => self.compile_path(path),
            XPathExpr::Filter { primary, predicates, steps } => {
                if !self.may_be_node_set(primary) {
                    return Err(WirequeryError::Compile(
                        "predicates and location steps require a node-set".into(),
                    ));
                }
                self.compile_value(primary)?;
                if !predicates.is_empty() {
                    self.block.push(Opcode::Normalize);
                    for predicate in predicates {
                        self.compile_predicate(predicate)?;
                    }
                }
                self.compile_steps(steps)
            }
            XPathExpr::FunctionCall { name, args } => self.compile_function(name, args),
            XPathExpr::String(s) => {
                self.block.push(Opcode::PushString(s.clone()));
                Ok(())
            }
            XPathExpr::Number(n) => {
                self.block.push(Opcode::PushNumber(*n));
                Ok(())
            }
        }
    }

    /// Function calls are typed by the registry; everything else by its syntax.
    fn may_be_node_set(&self, expr: &XPathExpr) -> bool {
        match expr {
            XPathExpr::FunctionCall { name, .. } => {
                match self.functions.lookup(name).and_then(|id| self.functions.get(id)) {
                    Some(function) => function.result_type() == ValueType::Sequence,
                    None => expr.may_be_node_set(),
                }
            }
            _ => expr.may_be_node_set(),
        }
    }

    /// `left; JumpIf(short); right; And/Or; BlockEnd` where the jump targets the block end.
    fn compile_logical(&mut self, left: &XPathExpr, right: &XPathExpr, is_or: bool) -> Result<()> {
        self.compile_value(left)?;
        if !left.is_boolean_typed() {
            self.block.push(Opcode::ToBoolean);
        }
        let jump = self.block.push(Opcode::JumpIf { when: is_or, targets: SmallVec::new() });
        self.compile_value(right)?;
        self.block.push(if is_or { Opcode::LogicalOr } else { Opcode::LogicalAnd });
        let end = self.block.push(Opcode::BlockEnd);
        if let Opcode::JumpIf { targets, .. } = &mut self.block.ops[jump] {
            *targets = smallvec![OpcodeId::from_index(end)];
        }
        Ok(())
    }

    fn compile_path(&mut self, path: &LocationPath) -> Result<()> {
        self.block.push(if path.absolute { Opcode::PushRoot } else { Opcode::PushContextNode });
        self.compile_steps(&path.steps)
    }

    fn compile_steps(&mut self, steps: &[Step]) -> Result<()> {
        for step in steps {
            self.block.push(Opcode::Select { axis: step.axis, test: step.test.clone() });
            for predicate in &step.predicates {
                self.compile_predicate(predicate)?;
            }
        }
        Ok(())
    }

    fn compile_predicate(&mut self, predicate: &XPathExpr) -> Result<()> {
        self.block.push(Opcode::FilterBegin);
        self.compile_value(predicate)?;
        self.block.push(Opcode::FilterEnd);
        Ok(())
    }

    fn compile_function(&mut self, name: &str, args: &[XPathExpr]) -> Result<()> {
        let id = self
            .functions
            .lookup(name)
            .ok_or_else(|| WirequeryError::Compile(format!("unknown function '{}'", name)))?;
        let function = self
            .functions
            .get(id)
            .ok_or_else(|| WirequeryError::Compile(format!("unknown function '{}'", name)))?;
        let (min, max) = function.arity();
        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            return Err(WirequeryError::Compile(format!(
                "function '{}' does not accept {} argument(s)",
                name,
                args.len()
            )));
        }
        let argc = if args.is_empty() && function.context_default() {
            self.block.push(Opcode::PushContextNode);
            1
        } else {
            for arg in args {
                self.compile_value(arg)?;
            }
            args.len()
        };
        self.block.push(Opcode::Function { function: id, argc });
        Ok(())
    }
}

/// `operand = literal` or `literal = operand`, where only one side is a literal.
fn literal_comparison(expr: &XPathExpr) -> Option<(&XPathExpr, &XPathExpr)> {
    match expr {
        XPathExpr::Relational { op: RelationOp::Eq, left, right } => match (left.is_literal(), right.is_literal()) {
            (false, true) => Some((left.as_ref(), right.as_ref())),
            (true, false) => Some((right.as_ref(), left.as_ref())),
            _ => None,
        },
        _ => None,
    }
}
