// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process rank discovery.
//!
//! Multi-process runs are launched externally (one process per device,
//! `torchrun`-style). Each process reads its rank from the environment and
//! works independently; nothing is coordinated here.

use candle_core::Device;

use crate::error::{LensError, Result};

/// Global rank variable.
pub const RANK_VAR: &str = "RANK";
/// Node-local rank variable, used for device selection.
pub const LOCAL_RANK_VAR: &str = "LOCAL_RANK";
/// Process-count variable.
pub const WORLD_SIZE_VAR: &str = "WORLD_SIZE";

/// This process's position in a multi-process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistContext {
    rank: usize,
    local_rank: usize,
    world_size: usize,
}

impl Default for DistContext {
    fn default() -> Self {
        Self::single()
    }
}

impl DistContext {
    /// A single-process run: rank 0 of 1.
    #[must_use]
    pub const fn single() -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
        }
    }

    /// Build a context from explicit values.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if `rank >= world_size`.
    pub fn new(rank: usize, local_rank: usize, world_size: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(LensError::Config(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        Ok(Self {
            rank,
            local_rank,
            world_size,
        })
    }

    /// Read `RANK`, `LOCAL_RANK` and `WORLD_SIZE`. Unset variables fall
    /// back to a single-process run; `LOCAL_RANK` defaults to `RANK`.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Config`] if a variable is not a non-negative
    /// integer or the rank is out of range.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// [`from_env`](Self::from_env) over an arbitrary variable source.
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |name: &str| -> Result<Option<usize>> {
            lookup(name)
                .map(|value| {
                    value.trim().parse::<usize>().map_err(|e| {
                        LensError::Config(format!("{name}={value:?} is not a valid rank: {e}"))
                    })
                })
                .transpose()
        };
        let rank = parse(RANK_VAR)?.unwrap_or(0);
        let local_rank = parse(LOCAL_RANK_VAR)?.unwrap_or(rank);
        let world_size = parse(WORLD_SIZE_VAR)?.unwrap_or(1);
        Self::new(rank, local_rank, world_size)
    }

    /// Global rank.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    /// Node-local rank.
    #[must_use]
    pub const fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// Number of processes.
    #[must_use]
    pub const fn world_size(&self) -> usize {
        self.world_size
    }

    /// Whether more than one process takes part.
    #[must_use]
    pub const fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// CUDA device `local_rank` when available, otherwise the CPU.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Model`] if CUDA is present but the device
    /// cannot be opened.
    pub fn device(&self) -> Result<Device> {
        Ok(Device::cuda_if_available(self.local_rank)?)
    }
}
