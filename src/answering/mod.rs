// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Question answering backends
//!
//! A QA backend knows nothing about captions: callers embed caption context
//! into the question text (see `dataset::prompt`) before asking.

pub mod chat;

pub use chat::{ChatAnswerer, ChatAnswererConfig};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::OneOrMany;

/// Question answering capability
#[async_trait]
pub trait QaBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Answer one question
    async fn answer(&self, question: &str) -> Result<String>;

    /// Answer one question or a list, mirroring the input shape
    ///
    /// Questions in a list are answered in order; the first failure is returned.
    async fn answer_question(&self, question: OneOrMany<String>) -> Result<OneOrMany<String>> {
        match question {
            OneOrMany::One(q) => Ok(OneOrMany::One(self.answer(&q).await?)),
            OneOrMany::Many(questions) => {
                let mut answers = Vec::with_capacity(questions.len());
                for q in &questions {
                    answers.push(self.answer(q).await?);
                }
                Ok(OneOrMany::Many(answers))
            }
        }
    }
}
