//! Crate-wide configuration, loaded from `config.yml`: a small typed
//! struct under a platform config directory, deserialized with
//! `serde`/`serde_yaml`, falling back to a hard-coded default when no
//! file is present.

use std::{fs, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

const FILE_NAME: &str = "config.yml";
const APP_CONFIG_DIR: &str = "spotify-core";

/// Device identity and endpoint overrides threaded explicitly into the
/// dealer, the state manager and the HTTP client, rather than held as
/// global/static state.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Config {
  pub client_id: String,
  pub device_id: String,
  pub device_name: String,
  pub device_type: DeviceType,
  /// Overrides the cluster-reported locale for `Accept-Language`.
  pub locale_override: Option<String>,
  pub dealer_endpoint_override: Option<String>,
  pub spclient_endpoint_override: Option<String>,
  pub login5_endpoint_override: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
  #[default]
  Computer,
  Smartphone,
  Speaker,
  Tv,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      client_id: String::new(),
      device_id: String::new(),
      device_name: "spotify-core".to_string(),
      device_type: DeviceType::default(),
      locale_override: None,
      dealer_endpoint_override: None,
      spclient_endpoint_override: None,
      login5_endpoint_override: None,
    }
  }
}

impl Config {
  pub fn config_path() -> Result<PathBuf> {
    let mut path = dirs::config_dir().ok_or_else(|| anyhow!("no config directory for this platform"))?;
    path.push(APP_CONFIG_DIR);
    path.push(FILE_NAME);
    Ok(path)
  }

  pub fn load() -> Result<Self> {
    let path = Self::config_path()?;
    if !path.exists() {
      return Ok(Self::default());
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
  }

  pub fn save(&self) -> Result<()> {
    let path = Self::config_path()?;
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    let contents = serde_yaml::to_string(self)?;
    fs::write(&path, contents)?;
    Ok(())
  }
}
