//! JSON-schema compilation and request-body validation.
//!
//! Schemas declared on locations are compiled once, when the listener is
//! built, and cached by `(path, method)`. Compilation parses the schema
//! text as JSON first; a compile failure is fatal for that listener's
//! construction. Validation operates on the already-buffered body bytes so
//! the pipeline can re-read them for templating and capture.

use crate::config::HttpMethod;
use crate::error::{CatalystError, Result};
use jsonschema::Validator;
use std::collections::HashMap;

/// Compiled schemas for one listener, keyed by `(path, method)`.
/// Immutable after registration; safe for concurrent reads.
#[derive(Default)]
pub struct SchemaCache {
    schemas: HashMap<String, Validator>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `schema_text` and cache it for `(path, method)`.
    pub fn register(&mut self, path: &str, method: HttpMethod, schema_text: &str) -> Result<()> {
        let schema_value: serde_json::Value =
            serde_json::from_str(schema_text).map_err(|e| CatalystError::SchemaCompile {
                path: path.to_string(),
                method: method.to_string(),
                reason: format!("schema is not valid JSON: {e}"),
            })?;

        let validator =
            jsonschema::validator_for(&schema_value).map_err(|e| CatalystError::SchemaCompile {
                path: path.to_string(),
                method: method.to_string(),
                reason: e.to_string(),
            })?;

        self.schemas.insert(cache_key(path, method), validator);
        Ok(())
    }

    /// Whether a schema is registered for `(path, method)`.
    pub fn contains(&self, path: &str, method: HttpMethod) -> bool {
        self.schemas.contains_key(&cache_key(path, method))
    }

    /// Validate body bytes against the schema registered for
    /// `(path, method)`. A missing registration passes.
    pub fn validate(&self, path: &str, method: HttpMethod, body: &[u8]) -> Result<()> {
        let Some(validator) = self.schemas.get(&cache_key(path, method)) else {
            return Ok(());
        };

        let data: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| CatalystError::Validation(format!("body is not valid JSON: {e}")))?;

        validator
            .validate(&data)
            .map_err(|e| CatalystError::Validation(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

fn cache_key(path: &str, method: HttpMethod) -> String {
    format!("{path}:{method}")
}
