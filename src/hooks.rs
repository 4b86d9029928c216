// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for residual-stream capture.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookSpec`] (which activations to capture) and [`HookCache`]
//! (the output plus captured tensors of one forward pass).
//!
//! A [`HookSpec`] is an ordinary value passed by reference to
//! [`ModelBackend::forward`](crate::ModelBackend::forward). Nothing is
//! registered on the model, so a capture lives exactly as long as the
//! spec and cache that describe it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{LensError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where an activation can be captured.
///
/// Names follow the `TransformerLens` convention via
/// [`Display`](std::fmt::Display) and [`FromStr`]:
///
/// ```
/// use candle_tuned_lens::HookPoint;
///
/// let hook = HookPoint::ResidPost(5);
/// assert_eq!(hook.to_string(), "blocks.5.hook_resid_post");
///
/// let parsed: HookPoint = "blocks.5.hook_resid_post".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After token embedding (`hook_embed`).
    Embed,
    /// Residual stream after full layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),
    /// After the final layer norm (`hook_final_norm`).
    FinalNorm,
    /// Backend-specific hook point not covered by the standard variants.
    Custom(String),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::FinalNorm => write!(f, "hook_final_norm"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Unknown strings parse as [`HookPoint::Custom`] rather than failing.
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

fn parse_hook_string(s: &str) -> HookPoint {
    match s {
        "hook_embed" => return HookPoint::Embed,
        "hook_final_norm" => return HookPoint::FinalNorm,
        _ => {}
    }

    if let Some(layer) = s
        .strip_prefix("blocks.")
        .and_then(|rest| rest.strip_suffix(".hook_resid_post"))
        .and_then(|layer| layer.parse::<usize>().ok())
    {
        return HookPoint::ResidPost(layer);
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations a forward pass should capture.
///
/// When empty, backends must run a plain forward pass with no extra
/// clones.
///
/// ```
/// use candle_tuned_lens::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::Embed).capture("blocks.0.hook_resid_post");
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    captures: HashSet<HookPoint>,
}

impl HookSpec {
    /// Create a spec with no captures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Whether nothing is requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Output of a hook-aware forward pass: logits plus captured activations.
#[derive(Debug)]
pub struct HookCache {
    output: Tensor,
    captures: HashMap<HookPoint, Tensor>,
}

impl HookCache {
    /// Create a cache holding `output` and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, failing if it was not captured.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| LensError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Remove and return a captured tensor.
    ///
    /// # Errors
    ///
    /// Returns [`LensError::Hook`] if the hook point was not captured.
    pub fn take(&mut self, hook: &HookPoint) -> Result<Tensor> {
        self.captures
            .remove(hook)
            .ok_or_else(|| LensError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation. Called by backend implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Replace the output tensor once the final logits are known.
    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    /// Number of captured tensors (excludes the output).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
