//! Allocation strategy configuration.
//!
//! The strategy a [`MemoryManager`](crate::memory::MemoryManager) uses is a
//! deployment-time choice. It is an explicit value passed to the manager's
//! constructor; the process-wide default is read from the environment the
//! first time it is needed and never changes afterwards.
//!
//! | Variable               | Values              | Default                      |
//! |------------------------|---------------------|------------------------------|
//! | `STRATA_MEM_STRATEGY`  | `tracked` \| `raw`  | `tracked` (debug), `raw` (release) |
//! | `STRATA_MEM_LIMIT`     | bytes               | unlimited                    |
//!
//! # Examples
//!
//! ```
//! use strata_mem::config::{AllocStrategy, MemoryConfig};
//!
//! let config = MemoryConfig::tracked().with_byte_limit(1 << 20);
//! assert_eq!(config.strategy, AllocStrategy::Tracked);
//! assert_eq!(config.byte_limit, Some(1 << 20));
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use strata_log::warn;

/// Environment variable selecting the allocation strategy.
pub const STRATEGY_ENV_VAR: &str = "STRATA_MEM_STRATEGY";

/// Environment variable holding the tracked-mode byte budget.
pub const LIMIT_ENV_VAR: &str = "STRATA_MEM_LIMIT";

/// How the memory manager obtains and accounts for blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocStrategy {
    /// Counts live blocks and bytes, detects double and foreign frees,
    /// and enforces the optional byte limit.
    Tracked,
    /// Straight to the system allocator, no bookkeeping.
    Raw,
}

impl AllocStrategy {
    /// The build-dependent default strategy.
    #[must_use]
    pub const fn default_for_build() -> Self {
        if cfg!(debug_assertions) {
            AllocStrategy::Tracked
        } else {
            AllocStrategy::Raw
        }
    }

    /// Returns the lower-case name used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AllocStrategy::Tracked => "tracked",
            AllocStrategy::Raw => "raw",
        }
    }
}

impl Default for AllocStrategy {
    fn default() -> Self {
        Self::default_for_build()
    }
}

impl fmt::Display for AllocStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an unknown strategy name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStrategyError {
    input: String,
}

impl fmt::Display for ParseStrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown allocation strategy {:?} (expected \"tracked\" or \"raw\")",
            self.input
        )
    }
}

impl std::error::Error for ParseStrategyError {}

impl FromStr for AllocStrategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tracked" => Ok(AllocStrategy::Tracked),
            "raw" => Ok(AllocStrategy::Raw),
            _ => Err(ParseStrategyError {
                input: s.to_string(),
            }),
        }
    }
}

/// Memory manager configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Allocation strategy.
    pub strategy: AllocStrategy,
    /// Maximum live bytes under [`AllocStrategy::Tracked`]. Ignored by
    /// [`AllocStrategy::Raw`].
    pub byte_limit: Option<usize>,
}

impl MemoryConfig {
    /// Tracked strategy, no limit.
    #[must_use]
    pub const fn tracked() -> Self {
        Self {
            strategy: AllocStrategy::Tracked,
            byte_limit: None,
        }
    }

    /// Raw strategy.
    #[must_use]
    pub const fn raw() -> Self {
        Self {
            strategy: AllocStrategy::Raw,
            byte_limit: None,
        }
    }

    /// Returns this configuration with a live-byte budget.
    #[must_use]
    pub const fn with_byte_limit(mut self, limit: usize) -> Self {
        self.byte_limit = Some(limit);
        self
    }

    /// Reads the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from a variable lookup.
    ///
    /// Unparsable values are reported at warn level and replaced by the
    /// defaults; configuration never fails.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let strategy = match lookup(STRATEGY_ENV_VAR) {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                warn!("{STRATEGY_ENV_VAR}: {err}");
                AllocStrategy::default_for_build()
            }),
            None => AllocStrategy::default_for_build(),
        };

        let byte_limit = lookup(LIMIT_ENV_VAR).and_then(|raw| {
            match raw.trim().parse::<usize>() {
                Ok(limit) => Some(limit),
                Err(err) => {
                    warn!("{LIMIT_ENV_VAR}: {raw:?}: {err}");
                    None
                }
            }
        });

        Self {
            strategy,
            byte_limit,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            strategy: AllocStrategy::default_for_build(),
            byte_limit: None,
        }
    }
}

/// The process-wide configuration, read from the environment once.
///
/// There is deliberately no setter: the strategy is fixed for the life of
/// the process.
pub fn process_config() -> MemoryConfig {
    static CONFIG: OnceLock<MemoryConfig> = OnceLock::new();
    *CONFIG.get_or_init(MemoryConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(
        pairs: &'static [(&'static str, &'static str)],
    ) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("tracked".parse(), Ok(AllocStrategy::Tracked));
        assert_eq!(" RAW ".parse(), Ok(AllocStrategy::Raw));
        assert!("pooled".parse::<AllocStrategy>().is_err());
        assert_eq!(AllocStrategy::Raw.to_string(), "raw");
    }

    #[test]
    fn test_from_lookup_reads_both_variables() {
        let config = MemoryConfig::from_lookup(vars(&[
            (STRATEGY_ENV_VAR, "raw"),
            (LIMIT_ENV_VAR, "4096"),
        ]));
        assert_eq!(config.strategy, AllocStrategy::Raw);
        assert_eq!(config.byte_limit, Some(4096));
    }

    #[test]
    fn test_from_lookup_falls_back_on_garbage() {
        let config = MemoryConfig::from_lookup(vars(&[
            (STRATEGY_ENV_VAR, "sometimes"),
            (LIMIT_ENV_VAR, "lots"),
        ]));
        assert_eq!(config.strategy, AllocStrategy::default_for_build());
        assert_eq!(config.byte_limit, None);
    }

    #[test]
    fn test_from_lookup_empty_environment() {
        let config = MemoryConfig::from_lookup(|_| None);
        assert_eq!(config, MemoryConfig::default());
    }

    #[test]
    fn test_process_config_is_stable() {
        assert_eq!(process_config(), process_config());
    }
}
