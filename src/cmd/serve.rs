//! `pluffy serve`: HTTP API plus the in-process job worker.

use std::path::Path;

use anyhow::Result;

use super::super::Overrides;

pub async fn cmd_serve(config_path: &Path, overrides: Overrides) -> Result<()> {
    let config = super::load_config(config_path, overrides)?;
    pluffy::studio::server::start_server(config).await
}
