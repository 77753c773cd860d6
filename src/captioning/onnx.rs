// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! ONNX Runtime plumbing shared by the caption backends

use anyhow::{Context, Result};
use ndarray::{ArrayViewD, IxDyn};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::VqaError;

/// Where inference sessions run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    /// CUDA device ordinal; falls back to CPU when the provider is unavailable
    Cuda(i32),
}

impl std::str::FromStr for Device {
    type Err = VqaError;

    fn from_str(s: &str) -> std::result::Result<Self, VqaError> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| VqaError::Config(format!("unknown device '{}'", other))),
        }
    }
}

/// Shared, serialized handle to a loaded session
pub type SharedSession = Arc<Mutex<Session>>;

/// Load an ONNX model on the requested device
pub fn load_session(model_path: &Path, device: Device, intra_threads: usize) -> Result<SharedSession> {
    if !model_path.exists() {
        anyhow::bail!("ONNX model file not found: {}", model_path.display());
    }

    info!("Loading {} on {:?}", model_path.display(), device);

    if let Device::Cuda(device_id) = device {
        let cuda_result = Session::builder()
            .context("Failed to create session builder")?
            .with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()])
            .context("Failed to set CUDA execution provider")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("Failed to set optimization level")?
            .with_intra_threads(intra_threads)
            .context("Failed to set intra threads")?
            .commit_from_file(model_path);

        match cuda_result {
            Ok(session) => return Ok(Arc::new(Mutex::new(session))),
            Err(e) => {
                warn!("CUDA execution provider failed: {}", e);
                warn!("Falling back to CPU execution provider");
            }
        }
    }

    let session = Session::builder()
        .context("Failed to create session builder")?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .context("Failed to set CPU execution provider")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("Failed to set optimization level")?
        .with_intra_threads(intra_threads)
        .context("Failed to set intra threads")?
        .commit_from_file(model_path)
        .context(format!("Failed to load ONNX model from {}", model_path.display()))?;

    Ok(Arc::new(Mutex::new(session)))
}

/// Resolve a required file inside a model directory
pub fn find_model_file(model_dir: &Path, file_name: &str) -> Result<PathBuf> {
    let path = model_dir.join(file_name);
    if !path.exists() {
        anyhow::bail!("Model file not found: {}", path.display());
    }
    Ok(path)
}

/// Resolve an optional file inside a model directory
pub fn find_optional_file(model_dir: &Path, file_name: &str) -> Option<PathBuf> {
    let path = model_dir.join(file_name);
    path.exists().then_some(path)
}

/// Lock a session, turning a poisoned mutex into `err`
pub fn lock_session<'a>(
    session: &'a SharedSession,
    err: fn(String) -> VqaError,
) -> std::result::Result<MutexGuard<'a, Session>, VqaError> {
    session
        .lock()
        .map_err(|e| err(format!("session lock poisoned: {}", e)))
}

/// Logits at the last sequence position of a `[batch, seq, vocab]` or
/// `[seq, vocab]` output
pub fn last_position_logits(output: &ArrayViewD<f32>) -> std::result::Result<Vec<f32>, VqaError> {
    let shape = output.shape();
    match shape.len() {
        3 if shape[1] > 0 => {
            let last = shape[1] - 1;
            Ok((0..shape[2]).map(|v| output[IxDyn(&[0, last, v])]).collect())
        }
        2 if shape[0] > 0 => {
            let last = shape[0] - 1;
            Ok((0..shape[1]).map(|v| output[IxDyn(&[last, v])]).collect())
        }
        _ => Err(VqaError::CaptionGeneration(format!(
            "unexpected decoder output shape {:?}",
            shape
        ))),
    }
}
