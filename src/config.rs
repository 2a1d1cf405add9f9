//! Configuration for the agent and the server daemons.
//!
//! Both daemons read a small JSON config file. Missing fields fall back to
//! defaults so a minimal file is enough to get started.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use crate::tools;

fn default_server_address() -> String {
    "127.0.0.1:8830".to_string()
}

fn default_agent_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/sagiri-guard/agent")
}

/// Endpoint agent configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Address of the central service.
    #[serde(default = "default_server_address")]
    pub server: String,

    /// Directory holding the local store, the device identifier and
    /// restore fallbacks.
    #[serde(default = "default_agent_data_dir")]
    pub data_dir: PathBuf,

    /// Roots to observe recursively.
    #[serde(default)]
    pub watch_roots: Vec<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: default_server_address(),
            data_dir: default_agent_data_dir(),
            watch_roots: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        load_json(path)
    }

    pub fn local_store_path(&self) -> PathBuf {
        self.data_dir.join("agent.db")
    }

    pub fn restore_fallback_dir(&self) -> PathBuf {
        self.data_dir.join("restored")
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8830".to_string()
}

fn default_server_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/sagiri-guard/server")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/sagiri-guard/server/blobs")
}

/// Central service configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Directory holding the server store.
    #[serde(default = "default_server_data_dir")]
    pub data_dir: PathBuf,

    /// Root of the snapshot blob tree.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            data_dir: default_server_data_dir(),
            storage_root: default_storage_root(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        load_json(path)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("server.db")
    }
}

fn load_json<T: Default + serde::de::DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(format_err!("unable to read {:?} - {}", path, err)),
    };
    serde_json::from_slice(&raw).map_err(|err| format_err!("unable to parse {:?} - {}", path, err))
}

/// Read the persisted device identifier, generating and storing a fresh
/// one on first run.
pub fn ensure_device_id(data_dir: &Path) -> Result<String, Error> {
    std::fs::create_dir_all(data_dir)
        .map_err(|err| format_err!("unable to create {:?} - {}", data_dir, err))?;

    let path = data_dir.join("device_id");
    match std::fs::read_to_string(&path) {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(format_err!("unable to read {:?} - {}", path, err)),
    }

    let id = uuid::Uuid::new_v4().to_string();
    tools::replace_file(&path, id.as_bytes())?;
    Ok(id)
}
