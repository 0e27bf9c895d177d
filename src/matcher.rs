//! Matcher module: the shared opcode tree engine.
//!
//! A QueryMatcher owns one opcode tree and the result opcode of every filter merged into it.
//! Matching runs the whole tree once per message with a pooled ProcessingContext.

use crate::builder::QueryTreeBuilder;
use crate::compiler::{CompileMode, XPathCompiler};
use crate::config::EngineConfig;
use crate::context::{EvalEnv, ProcessingContext};
use crate::expr::{NamespaceContext, XPathExpr, XPathParser};
use crate::filter::FilterId;
use crate::functions::FunctionRegistry;
use crate::message::Message;
use crate::opcode::{OpcodeArena, OpcodeId};
use crate::pool::ObjectPool;
use crate::types::Value;
use crate::{Result, WirequeryError};
use log::debug;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct QueryMatcher {
    arena: OpcodeArena,
    functions: Arc<FunctionRegistry>,
    namespaces: NamespaceContext,
    config: EngineConfig,
    results: FxHashMap<FilterId, OpcodeId>,
    contexts: ObjectPool<ProcessingContext>,
}

impl Default for QueryMatcher {
    fn default() -> Self {
        Self::build(EngineConfig::default(), FunctionRegistry::builtins())
    }
}

impl QueryMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, FunctionRegistry::builtins()))
    }

    /// A matcher resolving function calls against a custom registry.
    pub fn with_functions(config: EngineConfig, functions: Arc<FunctionRegistry>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, functions))
    }

    fn build(config: EngineConfig, functions: Arc<FunctionRegistry>) -> Self {
        let context_config = config.clone();
        let contexts = ObjectPool::new(config.context_pool_capacity, move || ProcessingContext::new(&context_config));
        Self {
            arena: OpcodeArena::new(config.branch_promotion),
            functions,
            namespaces: NamespaceContext::from_config(&config),
            config,
            results: FxHashMap::default(),
            contexts,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn namespaces(&self) -> &NamespaceContext {
        &self.namespaces
    }

    pub fn arena(&self) -> &OpcodeArena {
        &self.arena
    }

    /// Parses `xpath` against this matcher's namespace bindings.
    pub fn parse(&self, xpath: &str) -> Result<XPathExpr> {
        XPathParser::parse(xpath, &self.namespaces)
    }

    /// Compiles `expr` and merges it into the tree under `id`.
    ///
    /// Compilation happens before the tree is touched, so a rejected expression leaves the tree
    /// unchanged.
    pub fn add(&mut self, id: FilterId, expr: &XPathExpr) -> Result<()> {
        if self.results.contains_key(&id) {
            return Err(WirequeryError::DuplicateFilter(id));
        }
        let block = XPathCompiler::compile(expr, CompileMode::Filter, &self.functions)?;
        let root = self.arena.root();
        let result = QueryTreeBuilder::new(&mut self.arena).build(root, block, Some(id))?;
        self.results.insert(id, result);
        debug!("added filter {} at {} ({} live opcodes)", id, result, self.arena.live_count());
        Ok(())
    }

    /// Compiles `expr` as a value query. A matcher holds at most one query.
    pub fn set_query(&mut self, expr: &XPathExpr) -> Result<()> {
        let block = XPathCompiler::compile(expr, CompileMode::Select, &self.functions)?;
        self.clear();
        let root = self.arena.root();
        QueryTreeBuilder::new(&mut self.arena).build(root, block, None)?;
        Ok(())
    }

    pub fn remove(&mut self, id: FilterId) -> Result<()> {
        let result = self.results.remove(&id).ok_or(WirequeryError::FilterNotFound(id))?;
        self.arena.remove_tag(result, id)?;
        debug!("removed filter {} ({} live opcodes)", id, self.arena.live_count());
        Ok(())
    }

    pub fn clear(&mut self) {
        self.arena = OpcodeArena::new(self.config.branch_promotion);
        self.results.clear();
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn contains(&self, id: FilterId) -> bool {
        self.results.contains_key(&id)
    }

    fn run(&self, message: &Message, context: &mut ProcessingContext) -> Result<()> {
        let env = EvalEnv { arena: &self.arena, document: message.document(), functions: &self.functions };
        context.run(&env, self.arena.root())
    }

    /// Ids of every filter matching `message`, sorted and free of duplicates.
    pub fn match_ids(&self, message: &Message) -> Result<Vec<FilterId>> {
        if self.results.is_empty() {
            return Ok(Vec::new());
        }
        let mut context = self.contexts.checkout();
        self.run(message, &mut context)?;
        let mut ids = context.matches().to_vec();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub fn is_match(&self, message: &Message) -> Result<bool> {
        Ok(!self.match_ids(message)?.is_empty())
    }

    /// Evaluates the value query set with `set_query`.
    pub fn select(&self, message: &Message) -> Result<Option<Value>> {
        let mut context = self.contexts.checkout();
        self.run(message, &mut context)?;
        Ok(context.take_selected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EnvelopeVersion;
    use crate::opcode::OpcodeKind;

    fn message(action: &str, body: &str) -> Message {
        Message::builder(EnvelopeVersion::Soap12).action(action).body(body).build().unwrap()
    }

    fn add(matcher: &mut QueryMatcher, xpath: &str) -> FilterId {
        let id = FilterId::next();
        let expr = matcher.parse(xpath).unwrap();
        matcher.add(id, &expr).unwrap();
        id
    }

    #[test]
    fn test_shared_prefix_does_not_leak_matches() {
        let mut matcher = QueryMatcher::new();
        let f1 = add(&mut matcher, "/s12:Envelope/s12:Body/order and /s12:Envelope/s12:Body/order/@rush");
        let f2 = add(&mut matcher, "/s12:Envelope/s12:Body/order and /s12:Envelope/s12:Body/order/@gift");
        let rush = message("urn:a", "<order rush='1'/>");
        let gift = message("urn:a", "<order gift='1'/>");
        assert_eq!(matcher.match_ids(&rush).unwrap(), vec![f1]);
        assert_eq!(matcher.match_ids(&gift).unwrap(), vec![f2]);
    }

    #[test]
    fn test_action_filters_share_a_hashed_branch() {
        let mut matcher = QueryMatcher::new();
        let ids: Vec<FilterId> = ["x", "y", "z"]
            .iter()
            .map(|a| add(&mut matcher, &format!("/s12:Envelope/s12:Header/wsa10:Action = '{}'", a)))
            .collect();
        assert_eq!(matcher.arena().count_kind(OpcodeKind::StringBranch).unwrap(), 1);
        assert_eq!(matcher.arena().count_kind(OpcodeKind::StringEquals).unwrap(), 0);
        assert_eq!(matcher.match_ids(&message("y", "<a/>")).unwrap(), vec![ids[1]]);
        assert!(matcher.match_ids(&message("w", "<a/>")).unwrap().is_empty());
    }

    #[test]
    fn test_number_branch_dispatch_and_demotion() {
        let mut matcher = QueryMatcher::new();
        let path = "/s12:Envelope/s12:Body/r/n";
        let five = add(&mut matcher, &format!("{} = 5", path));
        let six = add(&mut matcher, &format!("{} = 6", path));
        let seven = add(&mut matcher, &format!("{} = 7", path));
        let named = add(&mut matcher, &format!("{} = 'x'", path));
        assert_eq!(matcher.arena().count_kind(OpcodeKind::NumberBranch).unwrap(), 1);
        assert_eq!(matcher.arena().count_kind(OpcodeKind::StringEquals).unwrap(), 1);

        let body = |n: &str| message("", &format!("<r><n>{}</n></r>", n));
        assert_eq!(matcher.match_ids(&body("6")).unwrap(), vec![six]);
        assert_eq!(matcher.match_ids(&body(" 6.0 ")).unwrap(), vec![six]);
        assert_eq!(matcher.match_ids(&body("x")).unwrap(), vec![named]);
        assert!(matcher.match_ids(&body("8")).unwrap().is_empty());
        let both = message("", "<r><n>7</n><n>5</n></r>");
        assert_eq!(matcher.match_ids(&both).unwrap(), vec![five, seven]);

        matcher.remove(five).unwrap();
        matcher.remove(seven).unwrap();
        assert_eq!(matcher.arena().count_kind(OpcodeKind::NumberBranch).unwrap(), 0);
        assert_eq!(matcher.arena().count_kind(OpcodeKind::NumberEquals).unwrap(), 1);
        assert_eq!(matcher.match_ids(&body("6")).unwrap(), vec![six]);
        assert!(matcher.match_ids(&body("5")).unwrap().is_empty());
        assert_eq!(matcher.match_ids(&body("x")).unwrap(), vec![named]);
    }

    #[test]
    fn test_remove_keeps_other_filters() {
        let mut matcher = QueryMatcher::new();
        let f1 = add(&mut matcher, "/s12:Envelope/s12:Body/a = 'x'");
        let f2 = add(&mut matcher, "/s12:Envelope/s12:Body/a = 'y'");
        matcher.remove(f1).unwrap();
        assert_eq!(matcher.match_ids(&message("", "<a>y</a>")).unwrap(), vec![f2]);
        assert!(matcher.match_ids(&message("", "<a>x</a>")).unwrap().is_empty());
        assert!(matches!(matcher.remove(f1), Err(WirequeryError::FilterNotFound(_))));
        matcher.remove(f2).unwrap();
        assert_eq!(matcher.arena().live_count(), 1);
    }

    #[test]
    fn test_duplicate_and_invalid_filters_leave_tree_unchanged() {
        let mut matcher = QueryMatcher::new();
        let id = add(&mut matcher, "/a");
        let expr = matcher.parse("/a").unwrap();
        assert!(matches!(matcher.add(id, &expr), Err(WirequeryError::DuplicateFilter(_))));
        let live = matcher.arena().live_count();
        let bad = matcher.parse("nosuch(/a)").unwrap();
        assert!(matcher.add(FilterId::next(), &bad).is_err());
        assert_eq!(matcher.arena().live_count(), live);
        assert_eq!(matcher.len(), 1);
    }

    #[test]
    fn test_select_query() {
        let mut matcher = QueryMatcher::new();
        let expr = matcher.parse("count(/s12:Envelope/s12:Body/item)").unwrap();
        matcher.set_query(&expr).unwrap();
        let msg = message("", "<item/><item/>");
        assert_eq!(matcher.select(&msg).unwrap(), Some(Value::Double(2.0)));
    }

    #[test]
    fn test_contexts_are_pooled() {
        let mut matcher = QueryMatcher::with_config(EngineConfig::builder().context_pool_capacity(2).build().unwrap()).unwrap();
        add(&mut matcher, "/s12:Envelope");
        for _ in 0..4 {
            assert!(matcher.is_match(&message("", "<a/>")).unwrap());
        }
        assert_eq!(matcher.contexts.available(), 1);
    }
}
