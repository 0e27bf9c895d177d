//! Wirequery: a compiled XPath message-filter engine.
//!
//! Filters registered with the engine are compiled into opcode chains and merged into one
//! shared opcode tree, so thousands of filters that share sub-expressions evaluate those
//! sub-expressions once per message. Simple filter kinds (action strings, endpoint addresses)
//! bypass the tree and go through hash-indexed filter tables instead.
//!
//! # Architecture
//! - Value model and operand stack (`types`, `stack`)
//! - Message documents, node sequences and navigation (`message`, `sequence`)
//! - Expression parsing (`expr`) and the XPath function library (`functions`)
//! - Opcode graph, compiler and tree builder (`opcode`, `compiler`, `builder`)
//! - Interpreter (`context`) and the shared-tree engine (`matcher`)
//! - Filters and filter tables (`filter`, `table` and the `*_table` modules)

mod config;
mod types;
mod stack;
mod message;
mod sequence;
mod pool;
mod expr;
mod functions;
mod opcode;
mod compiler;
mod builder;
mod context;
mod matcher;
mod filter;
mod table;
mod action_table;
mod endpoint_table;
mod and_table;
mod sequential;
mod xpath_table;
mod query_table;
mod filter_table;
mod thread_safe;

pub use config::*;
pub use types::*;
pub use stack::*;
pub use message::*;
pub use sequence::*;
pub use pool::*;
pub use expr::*;
pub use functions::*;
pub use opcode::*;
pub use compiler::*;
pub use builder::*;
pub use context::*;
pub use matcher::*;
pub use filter::*;
pub use table::*;
pub use action_table::*;
pub use endpoint_table::*;
pub use and_table::*;
pub use sequential::*;
pub use xpath_table::*;
pub use query_table::*;
pub use filter_table::*;
pub use thread_safe::*;

use thiserror::Error;

/// Unified error type for Wirequery operations
#[derive(Debug, Error)]
pub enum WirequeryError {
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("Compile error: {0}")]
    Compile(String),
    /// An operand on the value stack had a type the opcode cannot handle.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    /// The opcode graph or the stack violated an interpreter invariant.
    #[error("Unexpected processing state: {0}")]
    Unexpected(String),
    #[error("Multiple filters matched the message: {}", display_filters(.0))]
    MultipleFilterMatches(Vec<MessageFilter>),
    #[error("Filter {0} is already registered")]
    DuplicateFilter(FilterId),
    #[error("Filter {0} is not registered")]
    FilterNotFound(FilterId),
    #[error("{table} does not accept {kind} filters")]
    UnsupportedFilter { table: &'static str, kind: &'static str },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("XML error: {0}")]
    Xml(String),
    #[error("Invalid endpoint address: {0}")]
    InvalidAddress(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WirequeryError {
    /// Processing errors that indicate a compiler bug or a malformed opcode graph.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WirequeryError::TypeMismatch(_) | WirequeryError::Unexpected(_))
    }

    pub fn is_ambiguity(&self) -> bool {
        matches!(self, WirequeryError::MultipleFilterMatches(_))
    }

    /// The colliding filters of an ambiguous match.
    pub fn colliding_filters(&self) -> Option<&[MessageFilter]> {
        match self {
            WirequeryError::MultipleFilterMatches(filters) => Some(filters),
            _ => None,
        }
    }

    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        WirequeryError::Parse { position, message: message.into() }
    }
}

fn display_filters(filters: &[MessageFilter]) -> String {
    filters.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
}

pub type Result<T> = std::result::Result<T, WirequeryError>;
