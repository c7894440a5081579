// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Explicit configuration for a [`DmaContext`](crate::DmaContext).

use crate::chain::MAX_SEGMENT_LEN;
use crate::platform::HostCapabilities;
use crate::platform::HostModel;
use thiserror::Error;

/// Diagnostic verbosity.
///
/// Higher values log more. Level [`LogLevel::SEGMENTS`] and above emits a
/// trace event for every mapped chain segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LogLevel(pub u32);

impl LogLevel {
    /// Only failures.
    pub const QUIET: Self = Self(0);
    /// Per-segment chain dumps.
    pub const SEGMENTS: Self = Self(3);

    /// Parses a level the way C's `strtol(value, NULL, 0)` would.
    ///
    /// Leading whitespace and a sign are skipped, then the prefix picks the
    /// base: `0x` for hex, `0` for octal, decimal otherwise. Parsing stops at
    /// the first character that is not a digit in that base, so `"3abc"` is 3
    /// and `"loud"` is 0. Negative values clamp to [`LogLevel::QUIET`] and
    /// values past `u32::MAX` saturate.
    pub fn from_env_value(value: &str) -> Self {
        let value = value.trim_start();
        let (negative, value) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value.strip_prefix('+').unwrap_or(value)),
        };
        let hex = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"));
        let (radix, digits) = match hex {
            Some(hex) if hex.starts_with(|c: char| c.is_ascii_hexdigit()) => (16, hex),
            _ if value.starts_with('0') => (8, value),
            _ => (10, value),
        };
        let level = digits
            .chars()
            .map_while(|c| c.to_digit(radix))
            .fold(0u32, |level, digit| level.saturating_mul(radix).saturating_add(digit));
        if negative { Self::QUIET } else { Self(level) }
    }
}

/// A configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A segment cap of zero can never make progress.
    #[error("maximum segment length must be non-zero")]
    ZeroSegmentLength,
    /// The host reported a unit size that is not a power of two.
    #[error("unit size {0:#x} is not a power of two")]
    UnitSizeNotPowerOfTwo(usize),
}

/// Buffer manager configuration. Immutable once a context is built from it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaConfig {
    max_segment_len: u16,
    log_level: LogLevel,
    host_model: HostModel,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaConfig {
    /// The environment variable read by [`Self::from_env`].
    pub const LOG_LEVEL_VAR: &'static str = "PORTABLE_DMA_LOGLEVEL";

    /// Returns the default configuration: full 16-bit segments, quiet logging
    /// and the paged host model.
    pub const fn new() -> Self {
        Self {
            max_segment_len: MAX_SEGMENT_LEN,
            log_level: LogLevel::QUIET,
            host_model: HostModel::Paged,
        }
    }

    /// Returns the default configuration with the log level taken from
    /// [`Self::LOG_LEVEL_VAR`], if set.
    ///
    /// This is a one-time read; the result is passed explicitly to the
    /// context and later changes to the environment have no effect.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(value) = std::env::var_os(Self::LOG_LEVEL_VAR) {
            config.log_level = LogLevel::from_env_value(&value.to_string_lossy());
            tracing::debug!(level = config.log_level.0, "log level set from environment");
        }
        config
    }

    /// Lowers the per-segment cap for hardware with a narrower count field.
    pub const fn with_max_segment_len(mut self, len: u16) -> Self {
        self.max_segment_len = len;
        self
    }

    /// Sets the diagnostic verbosity.
    pub const fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Selects the host model.
    pub const fn with_host_model(mut self, model: HostModel) -> Self {
        self.host_model = model;
        self
    }

    /// The per-segment byte cap.
    pub fn max_segment_len(&self) -> u16 {
        self.max_segment_len
    }

    /// The diagnostic verbosity.
    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// The host model.
    pub fn host_model(&self) -> HostModel {
        self.host_model
    }

    /// The capability table entry for the configured host model.
    pub fn capabilities(&self) -> &'static HostCapabilities {
        self.host_model.capabilities()
    }

    /// Checks the configuration against the host's unit size.
    pub fn validate(&self, unit_size: usize) -> Result<(), ConfigError> {
        if self.max_segment_len == 0 {
            return Err(ConfigError::ZeroSegmentLength);
        }
        if !unit_size.is_power_of_two() {
            return Err(ConfigError::UnitSizeNotPowerOfTwo(unit_size));
        }
        Ok(())
    }
}
