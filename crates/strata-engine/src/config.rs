//! Engine configuration and tracing setup.
//!
//! Configuration is plain serde data. Every field has a default, so a config
//! file only needs the values it changes:
//!
//! ```
//! use strata_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "tick": { "workers": 2 } }"#).unwrap();
//! assert_eq!(config.tick.workers, 2);
//! assert_eq!(config.world.parallel_sort_threshold, 4096);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use strata_ecs::world::{World, WorldConfig};

use crate::tick::{TickConfig, TickLoop};

/// Complete engine configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub world: WorldConfig,
    pub tick: TickConfig,
}

impl EngineConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, anyhow::Error> {
        serde_json::from_str(json).map_err(|e| anyhow::anyhow!("invalid engine config: {e}"))
    }

    /// Read and parse a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String, anyhow::Error> {
        serde_json::to_string_pretty(self).map_err(|e| anyhow::anyhow!("failed to encode engine config: {e}"))
    }

    /// Build an empty world and a tick loop around it.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`TickLoop::new`].
    pub fn build(&self) -> TickLoop {
        TickLoop::new(World::with_config(self.world), self.tick)
    }
}

/// Install a formatted tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` (e.g. `"warn"` or
/// `"strata_engine=debug"`) is used. A second call leaves the first
/// subscriber in place.
pub fn init_tracing(default_directive: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = EngineConfig::from_json_str(
            r#"{ "world": { "parallel_sort_threshold": 10 }, "tick": { "fixed_dt": 0.5 } }"#,
        )
        .unwrap();
        assert_eq!(config.world.parallel_sort_threshold, 10);
        assert_eq!(config.tick.fixed_dt, 0.5);
        assert_eq!(config.tick.min_entities_per_worker, TickConfig::default().min_entities_per_worker);
    }

    #[test]
    fn malformed_document_is_an_error() {
        let err = EngineConfig::from_json_str("{ not json").unwrap_err();
        assert!(err.to_string().contains("invalid engine config"));
    }

    #[test]
    fn load_round_trips_through_a_file() {
        let config = EngineConfig {
            tick: TickConfig {
                workers: 3,
                ..Default::default()
            },
            ..Default::default()
        };
        let path = std::env::temp_dir().join(format!("strata-config-{}.json", std::process::id()));
        std::fs::write(&path, config.to_json_string().unwrap()).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(EngineConfig::load("/definitely/not/here.json").is_err());
    }

    #[test]
    fn build_uses_both_sections() {
        let config = EngineConfig {
            world: WorldConfig {
                parallel_sort_threshold: 7,
            },
            tick: TickConfig {
                workers: 1,
                ..Default::default()
            },
        };
        let tick_loop = config.build();
        assert_eq!(tick_loop.world().config().parallel_sort_threshold, 7);
        assert_eq!(tick_loop.config().workers, 1);
    }

    #[test]
    fn init_tracing_twice_is_harmless() {
        init_tracing("warn");
        init_tracing("debug");
    }
}
