// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Flat option mapping shared by every backend
//!
//! Options are collected from a TOML file, `ARAVQA_*` environment variables
//! and explicit overrides, in that order (later sources win). Nested TOML
//! tables are flattened with `.`-joined keys, so `[clip] beam_size = 5`
//! becomes `clip.beam_size`.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::VqaError;

/// Prefix for environment overrides (`ARAVQA_BEAM_SIZE` -> `beam_size`)
pub const ENV_PREFIX: &str = "ARAVQA_";

/// Flat mapping of named options with no required nesting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    values: BTreeMap<String, Value>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse options from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let toml_value: toml::Value = toml::from_str(content)?;
        let json = serde_json::to_value(toml_value)?;

        let mut options = Self::new();
        if let Value::Object(map) = json {
            for (key, value) in map {
                flatten_into(&mut options.values, key, value);
            }
        }
        Ok(options)
    }

    /// Collect `ARAVQA_*` variables from the process environment
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Collect prefixed variables from an arbitrary iterator of pairs
    ///
    /// Values that parse as JSON scalars (numbers, booleans) keep that type,
    /// everything else is stored as a string.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut options = Self::new();
        for (key, raw) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let value = match serde_json::from_str::<Value>(&raw) {
                Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
                _ => Value::String(raw),
            };
            options.values.insert(name.to_lowercase(), value);
        }
        options
    }

    /// Merge `other` on top of `self`
    pub fn merge(mut self, other: Options) -> Self {
        self.values.extend(other.values);
        self
    }

    /// Set a single option, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Options under `prefix.` with the prefix stripped
    ///
    /// Keys without a prefix are kept too, so `scoped("clip")` sees both
    /// `clip.beam_size` and a global `device`. Scoped keys win.
    pub fn scoped(&self, prefix: &str) -> Options {
        let dotted = format!("{}.", prefix);
        let mut values: BTreeMap<String, Value> = self
            .values
            .iter()
            .filter(|(k, _)| !k.contains('.'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &self.values {
            if let Some(rest) = key.strip_prefix(&dotted) {
                values.insert(rest.to_string(), value.clone());
            }
        }
        Options { values }
    }

    /// Deserialize an option into any type, falling back to `default` when absent
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> crate::Result<T> {
        match self.values.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                VqaError::Config(format!("option '{}' has an unexpected type: {}", key, e))
            }),
        }
    }

    pub fn get_str(&self, key: &str) -> crate::Result<Option<String>> {
        self.get_or::<Option<String>>(key, None)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> crate::Result<usize> {
        self.get_or(key, default)
    }

    pub fn get_f32(&self, key: &str, default: f32) -> crate::Result<f32> {
        self.get_or(key, default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> crate::Result<bool> {
        self.get_or(key, default)
    }
}

fn flatten_into(out: &mut BTreeMap<String, Value>, key: String, value: Value) {
    match value {
        Value::Object(map) => {
            for (child, v) in map {
                flatten_into(out, format!("{}.{}", key, child), v);
            }
        }
        other => {
            out.insert(key, other);
        }
    }
}
