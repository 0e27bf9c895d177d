//! Query table: XPath value queries evaluated one by one against a message.

use crate::expr::{NamespaceContext, XPathParser};
use crate::filter::FilterId;
use crate::matcher::QueryMatcher;
use crate::message::{Document, Message};
use crate::types::Value;
use crate::{Result, WirequeryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The value of a query, detached from the message it was computed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryResult {
    Boolean(bool),
    Number(f64),
    String(String),
    /// String values of the selected nodes in document order.
    Nodes(Vec<String>),
}

impl QueryResult {
    pub(crate) fn from_value(value: Value, doc: &Document) -> Self {
        match value {
            Value::Boolean(b) => QueryResult::Boolean(b),
            Value::Double(n) => QueryResult::Number(n),
            Value::String(s) => QueryResult::String(s),
            Value::Sequence(seq) => QueryResult::Nodes(seq.distinct_nodes().map(|n| doc.string_value(n)).collect()),
        }
    }

    /// XPath boolean conversion of the result.
    pub fn as_bool(&self) -> bool {
        match self {
            QueryResult::Boolean(b) => *b,
            QueryResult::Number(n) => *n != 0.0 && !n.is_nan(),
            QueryResult::String(s) => !s.is_empty(),
            QueryResult::Nodes(nodes) => !nodes.is_empty(),
        }
    }
}

#[derive(Debug)]
struct QueryInner {
    id: FilterId,
    expression: String,
    matcher: QueryMatcher,
}

/// A compiled XPath query. Equality goes by identity.
#[derive(Clone)]
pub struct XPathQuery {
    inner: Arc<QueryInner>,
}

impl XPathQuery {
    pub fn new(expression: &str) -> Result<Self> {
        Self::with_namespaces(expression, &NamespaceContext::message_defaults())
    }

    pub fn with_namespaces(expression: &str, namespaces: &NamespaceContext) -> Result<Self> {
        let expr = XPathParser::parse(expression, namespaces)?;
        let mut matcher = QueryMatcher::new();
        matcher.set_query(&expr)?;
        Ok(Self {
            inner: Arc::new(QueryInner { id: FilterId::next(), expression: expression.to_string(), matcher }),
        })
    }

    pub fn id(&self) -> FilterId {
        self.inner.id
    }

    pub fn expression(&self) -> &str {
        &self.inner.expression
    }

    pub fn evaluate(&self, message: &Message) -> Result<QueryResult> {
        let value = self
            .inner
            .matcher
            .select(message)?
            .ok_or_else(|| WirequeryError::Unexpected(format!("query '{}' produced no value", self.expression())))?;
        Ok(QueryResult::from_value(value, message.document()))
    }
}

impl PartialEq for XPathQuery {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for XPathQuery {}

impl fmt::Debug for XPathQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XPathQuery{}({})", self.id(), self.expression())
    }
}

#[derive(Debug, Clone)]
pub struct MessageQueryTable<T> {
    queries: BTreeMap<FilterId, (XPathQuery, T)>,
}

impl<T> Default for MessageQueryTable<T> {
    fn default() -> Self {
        Self { queries: BTreeMap::new() }
    }
}

impl<T> MessageQueryTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, query: XPathQuery, data: T) -> Result<()> {
        if self.queries.contains_key(&query.id()) {
            return Err(WirequeryError::DuplicateFilter(query.id()));
        }
        self.queries.insert(query.id(), (query, data));
        Ok(())
    }

    pub fn remove(&mut self, query: &XPathQuery) -> Option<T> {
        self.queries.remove(&query.id()).map(|(_, data)| data)
    }

    pub fn get(&self, query: &XPathQuery) -> Option<&T> {
        self.queries.get(&query.id()).map(|(_, data)| data)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn clear(&mut self) {
        self.queries.clear();
    }

    pub fn queries(&self) -> Vec<XPathQuery> {
        self.queries.values().map(|(query, _)| query.clone()).collect()
    }

    /// Every query with its result, in registration order.
    pub fn evaluate(&self, message: &Message) -> Result<Vec<(XPathQuery, QueryResult)>> {
        self.queries
            .values()
            .map(|(query, _)| Ok((query.clone(), query.evaluate(message)?)))
            .collect()
    }

    pub fn evaluate_values(&self, message: &Message) -> Result<Vec<(T, QueryResult)>>
    where
        T: Clone,
    {
        self.queries
            .values()
            .map(|(query, data)| Ok((data.clone(), query.evaluate(message)?)))
            .collect()
    }
}
