//! Config module: tunables for the filter engine.
//!
//! This module provides the EngineConfig type and its builder.

use crate::{Result, WirequeryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// NodeSequences retained by each processing context for reuse.
    pub sequence_pool_capacity: usize,
    /// Processing contexts retained by a matcher between evaluations.
    pub context_pool_capacity: usize,
    /// Header-mask processors retained by endpoint address tables.
    pub processor_pool_capacity: usize,
    /// Maximum number of live stack frames during one evaluation.
    pub max_stack_depth: usize,
    /// Upgrade sibling literal comparisons into hashed branch opcodes.
    pub branch_promotion: bool,
    /// Prefix bindings added on top of the default namespace context.
    pub namespaces: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sequence_pool_capacity: 64,
            context_pool_capacity: 8,
            processor_pool_capacity: 8,
            max_stack_depth: 256,
            branch_promotion: true,
            namespaces: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_stack_depth == 0 {
            return Err(WirequeryError::Config("max_stack_depth must be greater than zero".into()));
        }
        if self.context_pool_capacity == 0 || self.processor_pool_capacity == 0 {
            return Err(WirequeryError::Config("pool capacities must be greater than zero".into()));
        }
        for (prefix, uri) in &self.namespaces {
            if prefix.is_empty() || uri.is_empty() {
                return Err(WirequeryError::Config(format!(
                    "namespace binding '{}' -> '{}' must have a prefix and a uri",
                    prefix, uri
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self { config: EngineConfig::default() }
    }
    pub fn sequence_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.sequence_pool_capacity = capacity;
        self
    }
    pub fn context_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.context_pool_capacity = capacity;
        self
    }
    pub fn processor_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.processor_pool_capacity = capacity;
        self
    }
    pub fn max_stack_depth(mut self, depth: usize) -> Self {
        self.config.max_stack_depth = depth;
        self
    }
    pub fn branch_promotion(mut self, enabled: bool) -> Self {
        self.config.branch_promotion = enabled;
        self
    }
    pub fn namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.config.namespaces.insert(prefix.into(), uri.into());
        self
    }
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
