//! Functions module: the XPath core function library.
//!
//! This module provides the XPathFunction trait, the registry the compiler resolves function
//! names against, and the built-in string, number, boolean and node-set functions.

use crate::message::{Document, NodeId};
use crate::types::{string_to_number, Value, ValueType};
use crate::{Result, WirequeryError};
use rustc_hash::FxHashMap;
use std::sync::{Arc, OnceLock};

pub type FunctionId = usize;

/// What a function can see of the evaluation besides its arguments.
#[derive(Debug, Clone, Copy)]
pub struct FunctionEnv<'a> {
    pub document: &'a Document,
    pub node: NodeId,
    pub position: u32,
    pub size: u32,
}

pub trait XPathFunction: Send + Sync {
    /// Minimum and maximum argument counts; `None` means unbounded.
    fn arity(&self) -> (usize, Option<usize>);
    fn result_type(&self) -> ValueType;
    /// Called with no arguments, the function operates on the context node.
    fn context_default(&self) -> bool {
        false
    }
    fn call(&self, args: &[&Value], env: &FunctionEnv<'_>) -> Result<Value>;
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: Vec<Arc<dyn XPathFunction>>,
    names: Vec<String>,
    ids: FxHashMap<String, FunctionId>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        register_builtins(&mut reg);
        reg
    }

    /// Process-wide registry holding the core library.
    pub fn builtins() -> Arc<FunctionRegistry> {
        static BUILTINS: OnceLock<Arc<FunctionRegistry>> = OnceLock::new();
        Arc::clone(BUILTINS.get_or_init(|| Arc::new(FunctionRegistry::with_builtins())))
    }

    /// Registers a function. Re-registering a name replaces the function but keeps its id.
    pub fn register<F>(&mut self, name: impl Into<String>, func: F) -> FunctionId
    where
        F: XPathFunction + 'static,
    {
        let name = name.into();
        if let Some(&id) = self.ids.get(&name) {
            self.functions[id] = Arc::new(func);
            return id;
        }
        let id = self.functions.len();
        self.functions.push(Arc::new(func));
        self.names.push(name.clone());
        self.ids.insert(name, id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<FunctionId> {
        self.ids.get(name).copied()
    }

    pub fn get(&self, id: FunctionId) -> Option<&Arc<dyn XPathFunction>> {
        self.functions.get(id)
    }

    pub fn name(&self, id: FunctionId) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry").field("functions", &self.names).finish()
    }
}

macro_rules! builtin_functions {
    ($( $name:ident: $func_name:expr, ($min:expr, $max:expr), $ret:ident, context = $ctx:expr, |$args:ident, $env:ident| $body:block ),* $(,)?) => {
        $(
            pub struct $name;
            impl XPathFunction for $name {
                fn arity(&self) -> (usize, Option<usize>) {
                    ($min, $max)
                }
                fn result_type(&self) -> ValueType {
                    ValueType::$ret
                }
                fn context_default(&self) -> bool {
                    $ctx
                }
                fn call(&self, $args: &[&Value], $env: &FunctionEnv<'_>) -> Result<Value> $body
            }
        )*
        pub fn register_builtins(reg: &mut FunctionRegistry) {
            $(reg.register($func_name, $name);)*
        }
    };
}

fn arg<'v>(args: &[&'v Value], index: usize) -> Result<&'v Value> {
    args.get(index)
        .copied()
        .ok_or_else(|| WirequeryError::Unexpected(format!("missing function argument {}", index + 1)))
}

fn string_arg(args: &[&Value], index: usize, env: &FunctionEnv<'_>) -> Result<String> {
    Ok(arg(args, index)?.to_xpath_string(env.document))
}

fn number_arg(args: &[&Value], index: usize, env: &FunctionEnv<'_>) -> Result<f64> {
    Ok(arg(args, index)?.to_double(env.document))
}

/// First node of a node-set argument in document order.
fn first_node(args: &[&Value], index: usize) -> Result<Option<NodeId>> {
    Ok(arg(args, index)?.as_sequence()?.first_in_document_order())
}

fn xpath_round(n: f64) -> f64 {
    if n.is_nan() || n.is_infinite() || n == 0.0 {
        n
    } else if (-0.5..0.0).contains(&n) {
        -0.0
    } else {
        (n + 0.5).floor()
    }
}

fn substring(s: &str, start: f64, length: Option<f64>) -> String {
    let first = xpath_round(start);
    let end = match length {
        Some(len) => first + xpath_round(len),
        None => f64::INFINITY,
    };
    s.chars()
        .enumerate()
        .filter(|(i, _)| {
            let p = (*i + 1) as f64;
            p >= first && p < end
        })
        .map(|(_, c)| c)
        .collect()
}

builtin_functions! {
    BooleanFunction: "boolean", (1, Some(1)), Boolean, context = false, |args, _env| {
        Ok(Value::Boolean(arg(args, 0)?.to_boolean()))
    },
    NotFunction: "not", (1, Some(1)), Boolean, context = false, |args, _env| {
        Ok(Value::Boolean(!arg(args, 0)?.to_boolean()))
    },
    TrueFunction: "true", (0, Some(0)), Boolean, context = false, |_args, _env| {
        Ok(Value::Boolean(true))
    },
    FalseFunction: "false", (0, Some(0)), Boolean, context = false, |_args, _env| {
        Ok(Value::Boolean(false))
    },
    NumberFunction: "number", (0, Some(1)), Double, context = true, |args, env| {
        Ok(Value::Double(number_arg(args, 0, env)?))
    },
    StringFunction: "string", (0, Some(1)), String, context = true, |args, env| {
        Ok(Value::String(string_arg(args, 0, env)?))
    },
    ConcatFunction: "concat", (2, None), String, context = false, |args, env| {
        let mut out = String::new();
        for value in args {
            out.push_str(&value.to_xpath_string(env.document));
        }
        Ok(Value::String(out))
    },
    ContainsFunction: "contains", (2, Some(2)), Boolean, context = false, |args, env| {
        Ok(Value::Boolean(string_arg(args, 0, env)?.contains(&string_arg(args, 1, env)?)))
    },
    StartsWithFunction: "starts-with", (2, Some(2)), Boolean, context = false, |args, env| {
        Ok(Value::Boolean(string_arg(args, 0, env)?.starts_with(&string_arg(args, 1, env)?)))
    },
    SubstringFunction: "substring", (2, Some(3)), String, context = false, |args, env| {
        let s = string_arg(args, 0, env)?;
        let start = number_arg(args, 1, env)?;
        let length = if args.len() > 2 { Some(number_arg(args, 2, env)?) } else { None };
        Ok(Value::String(substring(&s, start, length)))
    },
    SubstringBeforeFunction: "substring-before", (2, Some(2)), String, context = false, |args, env| {
        let s = string_arg(args, 0, env)?;
        let needle = string_arg(args, 1, env)?;
        Ok(Value::String(s.find(&needle).map(|i| s[..i].to_string()).unwrap_or_default()))
    },
    SubstringAfterFunction: "substring-after", (2, Some(2)), String, context = false, |args, env| {
        let s = string_arg(args, 0, env)?;
        let needle = string_arg(args, 1, env)?;
        Ok(Value::String(s.find(&needle).map(|i| s[i + needle.len()..].to_string()).unwrap_or_default()))
    },
    StringLengthFunction: "string-length", (0, Some(1)), Double, context = true, |args, env| {
        Ok(Value::Double(string_arg(args, 0, env)?.chars().count() as f64))
    },
    NormalizeSpaceFunction: "normalize-space", (0, Some(1)), String, context = true, |args, env| {
        let s = string_arg(args, 0, env)?;
        Ok(Value::String(s.split_whitespace().collect::<Vec<_>>().join(" ")))
    },
    TranslateFunction: "translate", (3, Some(3)), String, context = false, |args, env| {
        let s = string_arg(args, 0, env)?;
        let from: Vec<char> = string_arg(args, 1, env)?.chars().collect();
        let to: Vec<char> = string_arg(args, 2, env)?.chars().collect();
        let out = s
            .chars()
            .filter_map(|c| match from.iter().position(|&f| f == c) {
                Some(i) => to.get(i).copied(),
                None => Some(c),
            })
            .collect();
        Ok(Value::String(out))
    },
    CountFunction: "count", (1, Some(1)), Double, context = false, |args, _env| {
        Ok(Value::Double(arg(args, 0)?.as_sequence()?.distinct_count() as f64))
    },
    SumFunction: "sum", (1, Some(1)), Double, context = false, |args, env| {
        let seq = arg(args, 0)?.as_sequence()?;
        let sum = seq.distinct_nodes().map(|n| string_to_number(&env.document.string_value(n))).sum();
        Ok(Value::Double(sum))
    },
    FloorFunction: "floor", (1, Some(1)), Double, context = false, |args, env| {
        Ok(Value::Double(number_arg(args, 0, env)?.floor()))
    },
    CeilingFunction: "ceiling", (1, Some(1)), Double, context = false, |args, env| {
        Ok(Value::Double(number_arg(args, 0, env)?.ceil()))
    },
    RoundFunction: "round", (1, Some(1)), Double, context = false, |args, env| {
        Ok(Value::Double(xpath_round(number_arg(args, 0, env)?)))
    },
    LocalNameFunction: "local-name", (0, Some(1)), String, context = true, |args, env| {
        let name = first_node(args, 0)?.map(|n| env.document.local_name(n).to_string());
        Ok(Value::String(name.unwrap_or_default()))
    },
    NamespaceUriFunction: "namespace-uri", (0, Some(1)), String, context = true, |args, env| {
        let uri = first_node(args, 0)?.map(|n| env.document.namespace_uri(n).to_string());
        Ok(Value::String(uri.unwrap_or_default()))
    },
    NameFunction: "name", (0, Some(1)), String, context = true, |args, env| {
        Ok(Value::String(first_node(args, 0)?.map(|n| env.document.name(n)).unwrap_or_default()))
    },
    PositionFunction: "position", (0, Some(0)), Double, context = false, |_args, env| {
        Ok(Value::Double(env.position as f64))
    },
    LastFunction: "last", (0, Some(0)), Double, context = false, |_args, env| {
        Ok(Value::Double(env.size as f64))
    },
}
