// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Indexable record sources

use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::info;

use crate::error::{Result, VqaError};

/// Random-access collection of records
pub trait RecordSource<T>: Send + Sync {
    fn len(&self) -> usize;

    /// Record at `index`, or `None` past the end
    fn get(&self, index: usize) -> Option<T>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records held in memory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InMemorySource<T> {
    records: Vec<T>,
}

impl<T> InMemorySource<T> {
    pub fn new(records: Vec<T>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn into_records(self) -> Vec<T> {
        self.records
    }
}

impl<T> From<Vec<T>> for InMemorySource<T> {
    fn from(records: Vec<T>) -> Self {
        Self::new(records)
    }
}

impl<T: Clone + Send + Sync> RecordSource<T> for InMemorySource<T> {
    fn len(&self) -> usize {
        self.records.len()
    }

    fn get(&self, index: usize) -> Option<T> {
        self.records.get(index).cloned()
    }
}

/// JSON Lines file, one record per non-blank line, parsed on open
#[derive(Debug, Clone)]
pub struct JsonlSource<T> {
    inner: InMemorySource<T>,
}

impl<T: DeserializeOwned> JsonlSource<T> {
    /// Read and parse every line; the first bad line is reported by its
    /// record position
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| VqaError::unavailable(path.display().to_string(), e))?;
        let source = Self::parse(&content)?;
        info!("Loaded {} records from {}", source.inner.records.len(), path.display());
        Ok(source)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|e| {
                VqaError::malformed(records.len(), format!("line {}: {}", line_no + 1, e))
            })?;
            records.push(record);
        }
        Ok(Self {
            inner: InMemorySource::new(records),
        })
    }

    pub fn into_memory(self) -> InMemorySource<T> {
        self.inner
    }
}

impl<T: Clone + Send + Sync> RecordSource<T> for JsonlSource<T> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Option<T> {
        self.inner.get(index)
    }
}
