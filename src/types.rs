// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Single-or-batch argument wrapper
//!
//! Capability calls accept either one item or a list and answer in the same
//! shape they were called with.

use serde::{Deserialize, Serialize};

use crate::vision::ImageInput;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Promote to a list (a single item becomes a length-1 list)
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(item) => vec![item],
            Self::Many(items) => items,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_many(&self) -> bool {
        matches!(self, Self::Many(_))
    }

    pub fn map<U, F: FnMut(T) -> U>(self, mut f: F) -> OneOrMany<U> {
        match self {
            Self::One(item) => OneOrMany::One(f(item)),
            Self::Many(items) => OneOrMany::Many(items.into_iter().map(f).collect()),
        }
    }

    /// Wrap `values` in the same shape as `self`
    ///
    /// Returns `None` when a single-item call did not produce exactly one value.
    pub fn reshape<U>(&self, values: Vec<U>) -> Option<OneOrMany<U>> {
        match self {
            Self::One(_) => {
                let mut values = values.into_iter();
                match (values.next(), values.next()) {
                    (Some(v), None) => Some(OneOrMany::One(v)),
                    _ => None,
                }
            }
            Self::Many(_) => Some(OneOrMany::Many(values)),
        }
    }

    /// The single item, or the first of many
    pub fn first(&self) -> Option<&T> {
        match self {
            Self::One(item) => Some(item),
            Self::Many(items) => items.first(),
        }
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(items: Vec<T>) -> Self {
        Self::Many(items)
    }
}

impl From<&str> for OneOrMany<String> {
    fn from(s: &str) -> Self {
        Self::One(s.to_string())
    }
}

impl From<String> for OneOrMany<String> {
    fn from(s: String) -> Self {
        Self::One(s)
    }
}

impl From<Vec<&str>> for OneOrMany<String> {
    fn from(items: Vec<&str>) -> Self {
        Self::Many(items.into_iter().map(str::to_string).collect())
    }
}

impl From<ImageInput> for OneOrMany<ImageInput> {
    fn from(input: ImageInput) -> Self {
        Self::One(input)
    }
}
