//! `sfm config` – show where the config lives and what it says.

use anyhow::Result;
use sfm_core::config::{self, SfmConfig};

pub fn run_config(cfg: &SfmConfig) -> Result<()> {
    println!("# {}", config::config_path()?.display());
    print!("{}", toml::to_string_pretty(cfg)?);
    Ok(())
}
