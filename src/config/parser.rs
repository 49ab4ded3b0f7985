use super::SupervisorConfig;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "dbfixture.yaml";

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Find the config file starting from `dir` and walking up to the root.
    pub fn find_config_in_dir(dir: &Path) -> Result<PathBuf> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Ok(config_path);
        }

        let alt_path = dir.join("dbfixture.yml");
        if alt_path.exists() {
            return Ok(alt_path);
        }

        if let Some(parent) = dir.parent() {
            return Self::find_config_in_dir(parent);
        }

        Err(Error::Config(format!(
            "Could not find {} in current directory or any parent",
            CONFIG_FILE_NAME
        )))
    }

    /// Load config from file path
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<SupervisorConfig> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        self.parse_config(&content)
    }

    pub fn parse_config(&self, content: &str) -> Result<SupervisorConfig> {
        let config: SupervisorConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}
