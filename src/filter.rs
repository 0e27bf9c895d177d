//! Filter module: message filters and endpoint addresses.
//!
//! A MessageFilter is a cheap, shareable handle. Tables key their entries by filter identity,
//! so two filters built from the same expression are still distinct entries.

use crate::expr::{NamespaceContext, XPathExpr, XPathParser};
use crate::matcher::QueryMatcher;
use crate::message::{Document, Message};
use crate::{Result, WirequeryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

/// Process-unique identity of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterId(u64);

impl FilterId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        FilterId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A header an endpoint address requires, compared by canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressHeader {
    canonical: String,
}

impl AddressHeader {
    /// Parses a single header element such as `<p:Tenant xmlns:p="urn:t">a</p:Tenant>`.
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml)?;
        let element = doc
            .document_element()
            .ok_or_else(|| WirequeryError::InvalidAddress(format!("'{}' is not an element", xml)))?;
        Ok(Self { canonical: doc.canonical_form(element) })
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

/// A destination URI plus the reference headers a message must carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    uri: Url,
    headers: Vec<AddressHeader>,
}

impl EndpointAddress {
    pub fn new(uri: Url) -> Self {
        Self { uri, headers: Vec::new() }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let uri = Url::parse(uri).map_err(|e| WirequeryError::InvalidAddress(format!("{}: {}", uri, e)))?;
        Ok(Self::new(uri))
    }

    pub fn with_header(mut self, xml: &str) -> Result<Self> {
        let header = AddressHeader::parse(xml)?;
        if !self.headers.contains(&header) {
            self.headers.push(header);
        }
        Ok(self)
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn headers(&self) -> &[AddressHeader] {
        &self.headers
    }

    /// Lookup key of the URI. Scheme, host and port compare case-insensitively (the url crate
    /// lowercases them), the path exactly. Query and fragment are ignored.
    pub fn uri_key(&self, include_host: bool) -> String {
        uri_key(&self.uri, include_host)
    }

    /// The key of every segment prefix of the path, longest first.
    pub fn prefix_keys(&self, include_host: bool) -> Vec<String> {
        prefix_keys(&self.uri, include_host)
    }

    fn headers_present(&self, message: &Message) -> bool {
        if self.headers.is_empty() {
            return true;
        }
        let doc = message.document();
        let present: BTreeSet<String> = message.headers().iter().map(|&h| doc.canonical_form(h)).collect();
        self.headers.iter().all(|h| present.contains(h.canonical()))
    }

    /// Whether the message's `To` header names this address and it carries every required
    /// header. Messages without a parseable `To` never match.
    pub fn matches(&self, message: &Message, include_host: bool) -> bool {
        match message_to(message) {
            Some(to) => uri_key(&to, include_host) == self.uri_key(include_host) && self.headers_present(message),
            None => false,
        }
    }

    /// Like `matches`, but the address path only has to be a segment prefix of the `To` path.
    pub fn matches_prefix(&self, message: &Message, include_host: bool) -> bool {
        match message_to(message) {
            Some(to) => {
                let key = self.uri_key(include_host);
                prefix_keys(&to, include_host).contains(&key) && self.headers_present(message)
            }
            None => false,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)?;
        if !self.headers.is_empty() {
            write!(f, " (+{} headers)", self.headers.len())?;
        }
        Ok(())
    }
}

pub(crate) fn message_to(message: &Message) -> Option<Url> {
    let to = message.to()?;
    match Url::parse(to) {
        Ok(url) => Some(url),
        Err(e) => {
            log::debug!("ignoring unparseable To header '{}': {}", to, e);
            None
        }
    }
}

fn authority(uri: &Url, include_host: bool) -> String {
    let port = uri.port_or_known_default().map(|p| format!(":{}", p)).unwrap_or_default();
    if include_host {
        format!("{}://{}{}", uri.scheme(), uri.host_str().unwrap_or_default(), port)
    } else {
        format!("{}://{}", uri.scheme(), port)
    }
}

pub(crate) fn uri_key(uri: &Url, include_host: bool) -> String {
    let path = uri.path().trim_end_matches('/');
    format!("{}{}", authority(uri, include_host), path)
}

pub(crate) fn prefix_keys(uri: &Url, include_host: bool) -> Vec<String> {
    let base = authority(uri, include_host);
    let segments: Vec<&str> = uri.path().split('/').filter(|s| !s.is_empty()).collect();
    (0..=segments.len())
        .rev()
        .map(|n| {
            let mut key = base.clone();
            for segment in &segments[..n] {
                key.push('/');
                key.push_str(segment);
            }
            key
        })
        .collect()
}

/// An XPath filter with its own single-filter matcher.
#[derive(Debug)]
pub struct XPathFilter {
    expression: String,
    expr: XPathExpr,
    matcher: QueryMatcher,
}

impl XPathFilter {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn expr(&self) -> &XPathExpr {
        &self.expr
    }
}

#[derive(Debug)]
pub enum FilterKind {
    XPath(XPathFilter),
    /// Matches messages whose action is in the set; an empty set matches every message.
    Action(BTreeSet<String>),
    EndpointAddress { address: EndpointAddress, include_host: bool },
    PrefixEndpointAddress { address: EndpointAddress, include_host: bool },
    And(MessageFilter, MessageFilter),
    MatchAll,
    MatchNone,
}

#[derive(Debug)]
struct FilterInner {
    id: FilterId,
    kind: FilterKind,
}

/// A predicate over messages. Equality and hashing go by identity.
#[derive(Clone)]
pub struct MessageFilter {
    inner: Arc<FilterInner>,
}

impl MessageFilter {
    fn from_kind(kind: FilterKind) -> Self {
        Self { inner: Arc::new(FilterInner { id: FilterId::next(), kind }) }
    }

    /// An XPath filter using the SOAP and WS-Addressing prefixes.
    pub fn xpath(expression: &str) -> Result<Self> {
        Self::xpath_with_namespaces(expression, &NamespaceContext::message_defaults())
    }

    pub fn xpath_with_namespaces(expression: &str, namespaces: &NamespaceContext) -> Result<Self> {
        let expr = XPathParser::parse(expression, namespaces)?;
        let id = FilterId::next();
        let mut matcher = QueryMatcher::new();
        matcher.add(id, &expr)?;
        let kind = FilterKind::XPath(XPathFilter { expression: expression.to_string(), expr, matcher });
        Ok(Self { inner: Arc::new(FilterInner { id, kind }) })
    }

    pub fn action(action: impl Into<String>) -> Self {
        Self::actions([action.into()])
    }

    pub fn actions<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_kind(FilterKind::Action(actions.into_iter().map(Into::into).collect()))
    }

    pub fn endpoint_address(address: EndpointAddress, include_host: bool) -> Self {
        Self::from_kind(FilterKind::EndpointAddress { address, include_host })
    }

    pub fn prefix_endpoint_address(address: EndpointAddress, include_host: bool) -> Self {
        Self::from_kind(FilterKind::PrefixEndpointAddress { address, include_host })
    }

    pub fn and(first: MessageFilter, second: MessageFilter) -> Self {
        Self::from_kind(FilterKind::And(first, second))
    }

    pub fn match_all() -> Self {
        Self::from_kind(FilterKind::MatchAll)
    }

    pub fn match_none() -> Self {
        Self::from_kind(FilterKind::MatchNone)
    }

    pub fn id(&self) -> FilterId {
        self.inner.id
    }

    pub fn kind(&self) -> &FilterKind {
        &self.inner.kind
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            FilterKind::XPath(_) => "xpath",
            FilterKind::Action(_) => "action",
            FilterKind::EndpointAddress { .. } => "endpoint-address",
            FilterKind::PrefixEndpointAddress { .. } => "prefix-endpoint-address",
            FilterKind::And(..) => "and",
            FilterKind::MatchAll => "match-all",
            FilterKind::MatchNone => "match-none",
        }
    }

    pub fn matches(&self, message: &Message) -> Result<bool> {
        match self.kind() {
            FilterKind::XPath(xpath) => xpath.matcher.is_match(message),
            FilterKind::Action(actions) => {
                Ok(actions.is_empty() || message.action().is_some_and(|a| actions.contains(a)))
            }
            FilterKind::EndpointAddress { address, include_host } => Ok(address.matches(message, *include_host)),
            FilterKind::PrefixEndpointAddress { address, include_host } => {
                Ok(address.matches_prefix(message, *include_host))
            }
            FilterKind::And(first, second) => Ok(first.matches(message)? && second.matches(message)?),
            FilterKind::MatchAll => Ok(true),
            FilterKind::MatchNone => Ok(false),
        }
    }
}

impl PartialEq for MessageFilter {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for MessageFilter {}

impl Hash for MessageFilter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Display for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            FilterKind::XPath(xpath) => write!(f, "xpath{}({})", self.id(), xpath.expression),
            FilterKind::Action(actions) => {
                let list: Vec<&str> = actions.iter().map(String::as_str).collect();
                write!(f, "action{}({})", self.id(), list.join(", "))
            }
            FilterKind::EndpointAddress { address, .. } => write!(f, "endpoint{}({})", self.id(), address),
            FilterKind::PrefixEndpointAddress { address, .. } => write!(f, "prefix-endpoint{}({})", self.id(), address),
            FilterKind::And(a, b) => write!(f, "and{}({}, {})", self.id(), a, b),
            FilterKind::MatchAll => write!(f, "match-all{}", self.id()),
            FilterKind::MatchNone => write!(f, "match-none{}", self.id()),
        }
    }
}

impl fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageFilter({})", self)
    }
}
