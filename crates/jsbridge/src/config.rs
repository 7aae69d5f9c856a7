//! Engine Configuration
//!
//! Limits and conversion policy for an isolate. Loaded from TOML and
//! overridable through `JSBRIDGE_*` environment variables.

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Default nesting limit for container conversion
pub const DEFAULT_MAX_CONVERSION_DEPTH: usize = 128;

/// Default cap on array elements and object entries copied by one
/// conversion
pub const DEFAULT_MAX_CONVERSION_ELEMENTS: usize = 1_000_000;

/// What to do with host integers the guest cannot represent exactly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegerPolicy {
    /// Fail with a conversion error.
    #[default]
    Strict,
    /// Round to the nearest float.
    Lossy,
}

/// Per-isolate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Heap limit in bytes.
    pub memory_limit: Option<usize>,
    /// Native stack limit in bytes.
    pub max_stack_size: Option<usize>,
    /// Allocation threshold that triggers a GC cycle, in bytes.
    pub gc_threshold: Option<usize>,
    /// Wall clock limit for one outermost guest call, in milliseconds.
    pub execution_timeout_ms: Option<u64>,
    pub max_conversion_depth: usize,
    /// Array elements and object entries one conversion may copy, summed
    /// over every nested container.
    pub max_conversion_elements: usize,
    pub integer_policy: IntegerPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            max_stack_size: None,
            gc_threshold: None,
            execution_timeout_ms: None,
            max_conversion_depth: DEFAULT_MAX_CONVERSION_DEPTH,
            max_conversion_elements: DEFAULT_MAX_CONVERSION_ELEMENTS,
            integer_policy: IntegerPolicy::Strict,
        }
    }
}

/// Errors from loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] figment::Error),
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = Some(bytes);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_conversion_depth(mut self, depth: usize) -> Self {
        self.max_conversion_depth = depth;
        self
    }

    pub fn with_max_conversion_elements(mut self, elements: usize) -> Self {
        self.max_conversion_elements = elements;
        self
    }

    pub fn with_integer_policy(mut self, policy: IntegerPolicy) -> Self {
        self.integer_policy = policy;
        self
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load defaults, then the TOML file (if given), then `JSBRIDGE_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config = figment.merge(Env::prefixed("JSBRIDGE_")).extract()?;
        Ok(config)
    }
}
