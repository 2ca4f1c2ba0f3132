//! CLI command implementations.
//!
//! | Module    | Commands handled           |
//! |-----------|----------------------------|
//! | `serve`   | `Serve`                    |
//! | `project` | `Init`, `Submit`, `Show`   |
//! | `tree`    | `Tree`                     |
//! | `config`  | `Config`                   |

pub mod config;
pub mod project;
pub mod serve;
pub mod tree;

pub use config::cmd_config;
pub use project::{cmd_init, cmd_show, cmd_submit};
pub use serve::cmd_serve;
pub use tree::cmd_tree;

use std::path::Path;

use anyhow::Result;
use pluffy::config::StudioConfig;

use super::Overrides;

/// Effective configuration: file, environment, then CLI flags.
pub fn load_config(path: &Path, overrides: Overrides) -> Result<StudioConfig> {
    let mut config = StudioConfig::load_layered(path)?;
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(host) = overrides.host {
        config.server.host = host;
    }
    if let Some(db_path) = overrides.db_path {
        config.server.db_path = db_path;
    }
    config.server.dev_mode |= overrides.dev;
    config.agent.offline |= overrides.offline;

    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}
