use quire_core::{KeyPair, NodeConfig, QuireError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    /// JSON key pair file, as written by `quire keygen`. A fresh key pair
    /// is generated (and written here) when the file does not exist.
    #[serde(default)]
    pub keys: Option<PathBuf>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("QUIRE").separator("__"))
            .build()
            .map_err(|e| QuireError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| QuireError::Config(e.to_string()))?;

        config.node.validate()?;
        Ok(config)
    }

    pub fn load_keys(&self) -> Result<KeyPair> {
        let Some(path) = &self.keys else {
            tracing::warn!("no key file configured, using an ephemeral key pair");
            return Ok(KeyPair::generate());
        };
        if path.exists() {
            return read_keys(path);
        }
        let keys = KeyPair::generate();
        write_keys(path, &keys)?;
        tracing::info!("generated key pair {} at {:?}", keys.public(), path);
        Ok(keys)
    }
}

pub fn read_keys(path: &Path) -> Result<KeyPair> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

pub fn write_keys(path: &Path, keys: &KeyPair) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_vec_pretty(keys)?)?;
    Ok(())
}
