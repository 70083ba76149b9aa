use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use ubagg_core::control::{BondConfig, TopologyConfig};
use ubagg_core::TopologyMap;

/// `<platform config dir>/ubagg/bond.toml`
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "ubagg")
        .context("no home directory to place the bonding config under")?;
    Ok(dirs.config_dir().join("bond.toml"))
}

fn read_toml<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {what} file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("{what} file {} is not valid TOML", path.display()))
}

/// A missing file means the built-in defaults.
pub fn load(path: &Path) -> Result<BondConfig> {
    if !path.exists() {
        return Ok(BondConfig::default());
    }
    let cfg: BondConfig = read_toml(path, "bonding config")?;
    cfg.validate()
        .with_context(|| format!("bonding config {} rejected", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &BondConfig, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} exists; pass --force to replace it", path.display());
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let raw = toml::to_string_pretty(cfg).context("encoding bonding config")?;
    fs::write(path, raw).with_context(|| format!("writing {}", path.display()))
}

/// Topology files must exist; there is no default fabric.
pub fn load_topology(path: &Path) -> Result<TopologyMap> {
    let cfg: TopologyConfig = read_toml(path, "topology")?;
    cfg.into_map()
        .with_context(|| format!("topology {} rejected", path.display()))
}
