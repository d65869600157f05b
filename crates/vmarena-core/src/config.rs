use std::path::Path;

use config as cfg;
use serde::{Deserialize, Serialize};

use crate::arena::BumpArena;
use crate::error::{ArenaError, Result};
use crate::vm::{round_up, COMMIT_GRANULARITY};

/// Settings for arenas created by the tooling.
///
/// Sources, lowest priority first:
/// 1. built-in defaults
/// 2. an optional TOML file
/// 3. environment variables with the `VMARENA__` prefix
///    (e.g. `VMARENA__RESERVE_BYTES=268435456`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Address space reserved per arena. Only touched pages cost memory.
    pub reserve_bytes: usize,
    /// Discard committed pages above the cursor after every reset.
    pub free_unused_on_reset: bool,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            reserve_bytes: 1 << 30,
            free_unused_on_reset: false,
            log_filter: "vmarena=info".to_string(),
        }
    }
}

impl ArenaConfig {
    pub const ENV_PREFIX: &'static str = "VMARENA";

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = cfg::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                cfg::File::from(path)
                    .format(cfg::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            cfg::Environment::with_prefix(Self::ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: ArenaConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reserve_bytes == 0 {
            return Err(ArenaError::Config(
                "reserve_bytes must be greater than 0".to_string(),
            ));
        }
        if round_up(self.reserve_bytes, COMMIT_GRANULARITY).is_none() {
            return Err(ArenaError::Config(format!(
                "reserve_bytes {} cannot be rounded to the commit granularity",
                self.reserve_bytes
            )));
        }
        if self.log_filter.trim().is_empty() {
            return Err(ArenaError::Config("log_filter must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ArenaError::Config(e.to_string()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: ArenaConfig =
            toml::from_str(text).map_err(|e| ArenaError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn build_arena(&self) -> Result<BumpArena> {
        let mut arena = BumpArena::new(self.reserve_bytes)?;
        arena.set_free_unused_on_reset(self.free_unused_on_reset);
        Ok(arena)
    }
}
