//! Data part schema registry.
//!
//! A [`SchemaRegistry`] maps a data kind (the suffix of `data-<kind>`) to a
//! validator. It is an explicit value handed to the writer and the
//! reducer; kinds without a registered validator pass through unchecked.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::ProtocolEncodingError;

/// Validates the payload of one data kind.
pub trait DataValidator: Send + Sync {
    /// Check the payload, returning a human-readable reason on rejection.
    fn validate(&self, data: &Value) -> Result<(), String>;
}

/// Shared validator handle.
pub type BoxedDataValidator = Arc<dyn DataValidator>;

/// Validator backed by a closure.
pub struct FnValidator<F> {
    func: F,
}

impl<F> FnValidator<F> {
    /// Wrap a closure as a validator.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> DataValidator for FnValidator<F>
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, data: &Value) -> Result<(), String> {
        (self.func)(data)
    }
}

impl<F> fmt::Debug for FnValidator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnValidator").finish()
    }
}

/// Validator requiring a JSON object with the given keys.
#[derive(Debug, Clone, Default)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    /// Require each of `fields` to be present.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl DataValidator for RequiredFields {
    fn validate(&self, data: &Value) -> Result<(), String> {
        let object = data
            .as_object()
            .ok_or_else(|| "payload must be a JSON object".to_string())?;
        match self.fields.iter().find(|f| !object.contains_key(f.as_str())) {
            Some(missing) => Err(format!("missing field `{missing}`")),
            None => Ok(()),
        }
    }
}

/// Registry of validators keyed by data kind.
#[derive(Clone, Default)]
pub struct SchemaRegistry {
    validators: HashMap<String, BoxedDataValidator>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator for `kind`, replacing any previous one.
    #[must_use]
    pub fn register<V: DataValidator + 'static>(mut self, kind: impl Into<String>, validator: V) -> Self {
        self.validators.insert(kind.into(), Arc::new(validator));
        self
    }

    /// Register a closure for `kind`.
    #[must_use]
    pub fn register_fn<F>(self, kind: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register(kind, FnValidator::new(func))
    }

    /// Check if a validator exists for `kind`.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.validators.contains_key(kind)
    }

    /// Registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.validators.keys().map(String::as_str)
    }

    /// Validate `data` against the schema for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolEncodingError::SchemaViolation`] if a validator is
    /// registered for `kind` and rejects the payload.
    pub fn validate(&self, kind: &str, data: &Value) -> Result<(), ProtocolEncodingError> {
        match self.validators.get(kind) {
            Some(validator) => {
                validator
                    .validate(data)
                    .map_err(|reason| ProtocolEncodingError::SchemaViolation {
                        kind: kind.to_string(),
                        reason,
                    })
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.kinds().collect();
        kinds.sort_unstable();
        f.debug_struct("SchemaRegistry").field("kinds", &kinds).finish()
    }
}
