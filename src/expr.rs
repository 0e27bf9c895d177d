//! Expression (AST) module: the parsed form of XPath filter expressions.
//!
//! This module provides the XPathExpr type, location steps, the namespace context used to
//! resolve prefixes and a hand-written recursive descent parser for the supported XPath subset.

use crate::config::EngineConfig;
use crate::message::{SOAP11_NAMESPACE, SOAP12_NAMESPACE, WSA10_NAMESPACE, WSA_AUGUST2004_NAMESPACE};
use crate::types::{ArithmeticOp, RelationOp};
use crate::{Result, WirequeryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum XPathExpr {
    Or(Box<XPathExpr>, Box<XPathExpr>),
    And(Box<XPathExpr>, Box<XPathExpr>),
    Relational {
        op: RelationOp,
        left: Box<XPathExpr>,
        right: Box<XPathExpr>,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<XPathExpr>,
        right: Box<XPathExpr>,
    },
    Negate(Box<XPathExpr>),
    Union(Box<XPathExpr>, Box<XPathExpr>),
    Path(LocationPath),
    /// A primary expression with predicates, optionally continued by a relative path.
    Filter {
        primary: Box<XPathExpr>,
        predicates: Vec<XPathExpr>,
        steps: Vec<Step>,
    },
    FunctionCall {
        name: String,
        args: Vec<XPathExpr>,
    },
    String(String),
    Number(f64),
}

impl XPathExpr {
    /// True when the expression always evaluates to a boolean.
    pub fn is_boolean_typed(&self) -> bool {
        match self {
            XPathExpr::Or(..) | XPathExpr::And(..) | XPathExpr::Relational { .. } => true,
            XPathExpr::FunctionCall { name, .. } => {
                matches!(name.as_str(), "boolean" | "not" | "true" | "false" | "contains" | "starts-with")
            }
            _ => false,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, XPathExpr::String(_) | XPathExpr::Number(_))
    }

    /// False for expressions that can never produce a node-set.
    pub fn may_be_node_set(&self) -> bool {
        match self {
            XPathExpr::Path(_) | XPathExpr::Union(..) | XPathExpr::Filter { .. } => true,
            XPathExpr::FunctionCall { .. } => !self.is_boolean_typed(),
            _ => false,
        }
    }

    /// Splits top-level `and` chains into their conjuncts.
    pub fn conjuncts(&self) -> Vec<&XPathExpr> {
        let mut out = Vec::new();
        collect_conjuncts(self, &mut out);
        out
    }
}

fn collect_conjuncts<'e>(expr: &'e XPathExpr, out: &mut Vec<&'e XPathExpr>) {
    match expr {
        XPathExpr::And(left, right) => {
            collect_conjuncts(left, out);
            collect_conjuncts(right, out);
        }
        other => out.push(other),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPath {
    pub absolute: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<XPathExpr>,
}

impl Step {
    fn descendant_or_self() -> Self {
        Step { axis: Axis::DescendantOrSelf, test: NodeTest::Node, predicates: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Child,
    Attribute,
    SelfAxis,
    Parent,
    Descendant,
    DescendantOrSelf,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
}

impl Axis {
    fn from_name(name: &str) -> Option<Axis> {
        Some(match name {
            "child" => Axis::Child,
            "attribute" => Axis::Attribute,
            "self" => Axis::SelfAxis,
            "parent" => Axis::Parent,
            "descendant" => Axis::Descendant,
            "descendant-or-self" => Axis::DescendantOrSelf,
            "ancestor" => Axis::Ancestor,
            "ancestor-or-self" => Axis::AncestorOrSelf,
            "following-sibling" => Axis::FollowingSibling,
            "preceding-sibling" => Axis::PrecedingSibling,
            _ => return None,
        })
    }
}

/// Node tests with prefixes already resolved to namespace URIs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeTest {
    Node,
    Text,
    Wildcard,
    NamespaceWildcard { namespace: String },
    /// An empty namespace means the name is in no namespace.
    Name { namespace: String, local: String },
}

/// Prefix to namespace URI bindings used when parsing name tests.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NamespaceContext {
    bindings: BTreeMap<String, String>,
}

impl NamespaceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The SOAP and WS-Addressing prefixes every message filter can use.
    pub fn message_defaults() -> Self {
        let mut ctx = Self::new();
        ctx.bind("s11", SOAP11_NAMESPACE);
        ctx.bind("s12", SOAP12_NAMESPACE);
        ctx.bind("wsa10", WSA10_NAMESPACE);
        ctx.bind("wsaAugust2004", WSA_AUGUST2004_NAMESPACE);
        ctx
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut ctx = Self::message_defaults();
        for (prefix, uri) in &config.namespaces {
            ctx.bind(prefix.clone(), uri.clone());
        }
        ctx
    }

    pub fn bind(&mut self, prefix: impl Into<String>, uri: impl Into<String>) -> &mut Self {
        self.bindings.insert(prefix.into(), uri.into());
        self
    }

    pub fn resolve(&self, prefix: &str) -> Option<&str> {
        self.bindings.get(prefix).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

// Hand-written recursive descent parser for XPath expressions
pub struct XPathParser<'a> {
    input: &'a str,
    pos: usize,
    namespaces: &'a NamespaceContext,
}

impl<'a> XPathParser<'a> {
    pub fn new(input: &'a str, namespaces: &'a NamespaceContext) -> Self {
        Self { input, pos: 0, namespaces }
    }

    pub fn parse(input: &str, namespaces: &NamespaceContext) -> Result<XPathExpr> {
        let mut parser = XPathParser::new(input, namespaces);
        parser.skip_whitespace();
        if parser.peek().is_none() {
            return Err(WirequeryError::parse(0, "Empty expression"));
        }
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(parser.error("Unexpected input"));
        }
        Ok(expr)
    }

    fn error(&self, message: &str) -> WirequeryError {
        WirequeryError::parse(self.pos, message)
    }

    fn parse_expr(&mut self) -> Result<XPathExpr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<XPathExpr> {
        let mut left = self.parse_and()?;
        loop {
            self.skip_whitespace();
            if self.consume_keyword("or") {
                let right = self.parse_and()?;
                left = XPathExpr::Or(Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<XPathExpr> {
        let mut left = self.parse_equality()?;
        loop {
            self.skip_whitespace();
            if self.consume_keyword("and") {
                let right = self.parse_equality()?;
                left = XPathExpr::And(Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<XPathExpr> {
        let mut left = self.parse_relational()?;
        loop {
            self.skip_whitespace();
            let op = if self.consume("!=") {
                RelationOp::Ne
            } else if self.consume("=") {
                RelationOp::Eq
            } else {
                break;
            };
            let right = self.parse_relational()?;
            left = XPathExpr::Relational { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<XPathExpr> {
        let mut left = self.parse_additive()?;
        loop {
            self.skip_whitespace();
            let op = if self.consume("<=") {
                RelationOp::Le
            } else if self.consume("<") {
                RelationOp::Lt
            } else if self.consume(">=") {
                RelationOp::Ge
            } else if self.consume(">") {
                RelationOp::Gt
            } else {
                break;
            };
            let right = self.parse_additive()?;
            left = XPathExpr::Relational { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<XPathExpr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            self.skip_whitespace();
            let op = if self.consume("+") {
                ArithmeticOp::Plus
            } else if self.consume("-") {
                ArithmeticOp::Minus
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = XPathExpr::Arithmetic { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<XPathExpr> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_whitespace();
            // In operator position '*' always means multiplication.
            let op = if self.consume("*") {
                ArithmeticOp::Multiply
            } else if self.consume_keyword("div") {
                ArithmeticOp::Div
            } else if self.consume_keyword("mod") {
                ArithmeticOp::Mod
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = XPathExpr::Arithmetic { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<XPathExpr> {
        self.skip_whitespace();
        if self.consume("-") {
            let operand = self.parse_unary()?;
            return Ok(match operand {
                XPathExpr::Number(n) => XPathExpr::Number(-n),
                other => XPathExpr::Negate(Box::new(other)),
            });
        }
        self.parse_union()
    }

    fn parse_union(&mut self) -> Result<XPathExpr> {
        let mut left = self.parse_path()?;
        loop {
            self.skip_whitespace();
            if self.consume("|") {
                let right = self.parse_path()?;
                left = XPathExpr::Union(Box::new(left), Box::new(right));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_path(&mut self) -> Result<XPathExpr> {
        self.skip_whitespace();
        match self.peek() {
            Some('/') => self.parse_absolute_path(),
            Some('(') | Some('"') | Some('\'') => self.parse_filter_expr(),
            Some(c) if c.is_ascii_digit() => self.parse_filter_expr(),
            Some('.') if self.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) => self.parse_filter_expr(),
            Some('$') => Err(self.error("Variable references are not supported")),
            Some(c) if is_name_start(c) && self.at_function_call() => self.parse_filter_expr(),
            Some(c) if is_name_start(c) || matches!(c, '*' | '@' | '.') => {
                let steps = self.parse_relative_path()?;
                Ok(XPathExpr::Path(LocationPath { absolute: false, steps }))
            }
            Some(_) => Err(self.error("Expected an expression")),
            None => Err(self.error("Unexpected end of expression")),
        }
    }

    fn parse_absolute_path(&mut self) -> Result<XPathExpr> {
        let mut steps = Vec::new();
        if self.consume("//") {
            steps.push(Step::descendant_or_self());
            steps.extend(self.parse_relative_path()?);
        } else {
            self.consume("/");
            self.skip_whitespace();
            if self.peek().is_some_and(|c| is_name_start(c) || matches!(c, '*' | '@' | '.')) {
                steps.extend(self.parse_relative_path()?);
            }
        }
        Ok(XPathExpr::Path(LocationPath { absolute: true, steps }))
    }

    fn parse_relative_path(&mut self) -> Result<Vec<Step>> {
        let mut steps = vec![self.parse_step()?];
        loop {
            self.skip_whitespace();
            if self.consume("//") {
                steps.push(Step::descendant_or_self());
                steps.push(self.parse_step()?);
            } else if self.consume("/") {
                steps.push(self.parse_step()?);
            } else {
                break;
            }
        }
        Ok(steps)
    }

    fn parse_step(&mut self) -> Result<Step> {
        self.skip_whitespace();
        if self.consume("..") {
            return Ok(Step { axis: Axis::Parent, test: NodeTest::Node, predicates: Vec::new() });
        }
        if self.consume(".") {
            return Ok(Step { axis: Axis::SelfAxis, test: NodeTest::Node, predicates: Vec::new() });
        }
        let axis = if self.consume("@") {
            Axis::Attribute
        } else {
            self.parse_axis_specifier()?.unwrap_or(Axis::Child)
        };
        let test = self.parse_node_test()?;
        let predicates = self.parse_predicates()?;
        Ok(Step { axis, test, predicates })
    }

    fn parse_axis_specifier(&mut self) -> Result<Option<Axis>> {
        let start = self.pos;
        let Some(name) = self.parse_ncname() else {
            return Ok(None);
        };
        self.skip_whitespace();
        if self.consume("::") {
            return Axis::from_name(&name)
                .map(Some)
                .ok_or_else(|| WirequeryError::parse(start, format!("Unsupported axis '{}'", name)));
        }
        self.pos = start;
        Ok(None)
    }

    fn parse_node_test(&mut self) -> Result<NodeTest> {
        self.skip_whitespace();
        if self.consume("*") {
            return Ok(NodeTest::Wildcard);
        }
        let start = self.pos;
        let first = self.parse_ncname().ok_or_else(|| self.error("Expected a node test"))?;
        if self.peek() == Some(':') && self.peek_nth(1) != Some(':') {
            self.consume(":");
            let namespace = self.resolve_prefix(&first, start)?;
            if self.consume("*") {
                return Ok(NodeTest::NamespaceWildcard { namespace });
            }
            let local = self.parse_ncname().ok_or_else(|| self.error("Expected a local name"))?;
            return Ok(NodeTest::Name { namespace, local });
        }
        let after_name = self.pos;
        self.skip_whitespace();
        if self.peek() == Some('(') {
            match first.as_str() {
                "node" | "text" => {
                    self.consume("(");
                    self.skip_whitespace();
                    if !self.consume(")") {
                        return Err(self.error("Expected ')'"));
                    }
                    return Ok(if first == "node" { NodeTest::Node } else { NodeTest::Text });
                }
                "comment" | "processing-instruction" => {
                    return Err(WirequeryError::parse(start, format!("Unsupported node type test '{}()'", first)));
                }
                _ => {}
            }
        }
        self.pos = after_name;
        Ok(NodeTest::Name { namespace: String::new(), local: first })
    }

    fn resolve_prefix(&self, prefix: &str, position: usize) -> Result<String> {
        self.namespaces
            .resolve(prefix)
            .map(str::to_string)
            .ok_or_else(|| WirequeryError::parse(position, format!("Unbound namespace prefix '{}'", prefix)))
    }

    fn parse_predicates(&mut self) -> Result<Vec<XPathExpr>> {
        let mut predicates = Vec::new();
        loop {
            self.skip_whitespace();
            if !self.consume("[") {
                break;
            }
            let predicate = self.parse_expr()?;
            self.skip_whitespace();
            if !self.consume("]") {
                return Err(self.error("Expected ']'"));
            }
            predicates.push(predicate);
        }
        Ok(predicates)
    }

    fn parse_filter_expr(&mut self) -> Result<XPathExpr> {
        let primary = self.parse_primary()?;
        let predicates = self.parse_predicates()?;
        let mut steps = Vec::new();
        self.skip_whitespace();
        if self.consume("//") {
            steps.push(Step::descendant_or_self());
            steps.extend(self.parse_relative_path()?);
        } else if self.consume("/") {
            steps.extend(self.parse_relative_path()?);
        }
        if predicates.is_empty() && steps.is_empty() {
            return Ok(primary);
        }
        Ok(XPathExpr::Filter { primary: Box::new(primary), predicates, steps })
    }

    fn parse_primary(&mut self) -> Result<XPathExpr> {
        self.skip_whitespace();
        match self.peek() {
            Some('(') => {
                self.consume("(");
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if !self.consume(")") {
                    return Err(self.error("Expected ')'"));
                }
                Ok(expr)
            }
            Some('"') | Some('\'') => self.parse_string_literal(),
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number_literal(),
            Some(_) => self.parse_function_call(),
            None => Err(self.error("Unexpected end of expression")),
        }
    }

    fn parse_function_call(&mut self) -> Result<XPathExpr> {
        let start = self.pos;
        let name = self.parse_ncname().ok_or_else(|| self.error("Expected a function name"))?;
        if self.peek() == Some(':') {
            return Err(WirequeryError::parse(start, format!("Unknown function '{}:...'", name)));
        }
        self.skip_whitespace();
        if !self.consume("(") {
            return Err(self.error("Expected '('"));
        }
        let mut args = Vec::new();
        self.skip_whitespace();
        if !self.consume(")") {
            loop {
                args.push(self.parse_expr()?);
                self.skip_whitespace();
                if self.consume(",") {
                    continue;
                }
                if self.consume(")") {
                    break;
                }
                return Err(self.error("Expected ',' or ')'"));
            }
        }
        Ok(XPathExpr::FunctionCall { name, args })
    }

    fn parse_string_literal(&mut self) -> Result<XPathExpr> {
        let start = self.pos;
        let quote = self.consume_char().ok_or_else(|| self.error("Expected a string literal"))?;
        let body_start = self.pos;
        while let Some(c) = self.consume_char() {
            if c == quote {
                let text = &self.input[body_start..self.pos - c.len_utf8()];
                return Ok(XPathExpr::String(text.to_string()));
            }
        }
        Err(WirequeryError::parse(start, "Unterminated string literal"))
    }

    fn parse_number_literal(&mut self) -> Result<XPathExpr> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some('.') {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        self.input[start..self.pos]
            .parse::<f64>()
            .map(XPathExpr::Number)
            .map_err(|_| WirequeryError::parse(start, "Invalid number literal"))
    }

    /// Looks ahead for `name (` where the name is not a node type test.
    fn at_function_call(&self) -> bool {
        let mut ahead = XPathParser { input: self.input, pos: self.pos, namespaces: self.namespaces };
        let Some(name) = ahead.parse_ncname() else {
            return false;
        };
        if ahead.peek() == Some(':') {
            return false;
        }
        ahead.skip_whitespace();
        ahead.peek() == Some('(') && !matches!(name.as_str(), "node" | "text" | "comment" | "processing-instruction")
    }

    fn parse_ncname(&mut self) -> Option<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if is_name_start(c) => {
                self.consume_char();
            }
            _ => return None,
        }
        while self.peek().is_some_and(is_name_char) {
            self.consume_char();
        }
        Some(self.input[start..self.pos].to_string())
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.consume_char();
            } else {
                break;
            }
        }
    }

    /// Consumes an operator name only when it is not the prefix of a longer name.
    fn consume_keyword(&mut self, keyword: &str) -> bool {
        let rest = &self.input[self.pos..];
        if rest.starts_with(keyword) && !rest[keyword.len()..].chars().next().is_some_and(is_name_char) {
            self.pos += keyword.len();
            self.skip_whitespace();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, s: &str) -> bool {
        if self.input[self.pos..].as_bytes().starts_with(s.as_bytes()) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn consume_char(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.input[self.pos..].chars().nth(n)
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}
