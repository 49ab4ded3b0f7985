//! Instance parameters, the generated configuration file, and binary lookup.

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Merged key/value parameters of one server instance.
pub type Params = BTreeMap<String, String>;

pub const PORT_PARAM: &str = "port";
pub const DBPATH_PARAM: &str = "dbpath";
pub const BIND_IP_PARAM: &str = "bind_ip";
pub const LOGPATH_PARAM: &str = "logpath";
/// Selects a named release from [`InstanceSettings::releases`]; not written
/// to the server's configuration file.
pub const VERSION_PARAM: &str = "version";

pub const CONFIG_FILE_NAME: &str = "server.conf";
pub const LOG_FILE_NAME: &str = "server.log";

const CONFIG_HEADER: &str = "# generated by dbfixture, removed on cleanup";

/// The parts of [`SupervisorConfig`] an instance needs.
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub host: String,
    pub bin_dir: Option<PathBuf>,
    /// Release name to binary directory
    pub releases: BTreeMap<String, PathBuf>,
    /// Release used when `params` carry no `version`
    pub default_release: Option<String>,
    pub work_dir: PathBuf,
    pub grace_period: Duration,
}

impl InstanceSettings {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            host: config.get_host(),
            bin_dir: config.get_bin_dir(),
            releases: config.releases.clone(),
            default_release: config.default_release.clone(),
            work_dir: config.get_work_dir(),
            grace_period: config.get_grace_period(),
        }
    }

    /// Locate the binary for `kind`, honouring a `version` parameter.
    ///
    /// A named release (from `params["version"]` or `default_release`) must
    /// be known and must contain `kind`; `PATH` is not searched for it.
    /// Without one, [`resolve_binary`] searches `bin_dir` then `PATH`.
    pub fn locate_binary(&self, kind: &str, params: &Params) -> Result<PathBuf> {
        let release = params
            .get(VERSION_PARAM)
            .map(String::as_str)
            .or(self.default_release.as_deref());
        let Some(release) = release else {
            return resolve_binary(kind, self.bin_dir.as_deref());
        };
        if is_path_like(kind) {
            return resolve_binary(kind, None);
        }

        let launch_error = |reason: String| Error::Launch {
            kind: kind.to_string(),
            reason,
        };
        let dir = self.releases.get(release).ok_or_else(|| {
            let known: Vec<&str> = self.releases.keys().map(String::as_str).collect();
            launch_error(format!(
                "unknown release '{}' (configured: {})",
                release,
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            ))
        })?;
        let candidate = dir.join(kind);
        if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(launch_error(format!(
                "release '{}' has no {}",
                release,
                candidate.display()
            )))
        }
    }
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

/// Locate the server binary for `kind`.
///
/// A kind containing a path separator is used as given. Otherwise
/// `bin_dir/<kind>` wins if it exists, then `PATH`.
pub fn resolve_binary(kind: &str, bin_dir: Option<&Path>) -> Result<PathBuf> {
    let launch_error = |reason: String| Error::Launch {
        kind: kind.to_string(),
        reason,
    };

    if kind.trim().is_empty() {
        return Err(launch_error("empty process kind".to_string()));
    }

    let as_path = Path::new(kind);
    if is_path_like(kind) {
        return if as_path.is_file() {
            Ok(as_path.to_path_buf())
        } else {
            Err(launch_error(format!("{} does not exist", as_path.display())))
        };
    }

    if let Some(dir) = bin_dir {
        let candidate = dir.join(kind);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    which::which(kind).map_err(|e| {
        let searched = match bin_dir {
            Some(dir) => format!("{} or PATH", dir.display()),
            None => "PATH".to_string(),
        };
        launch_error(format!("not found in {}: {}", searched, e))
    })
}

fn is_path_like(kind: &str) -> bool {
    let path = Path::new(kind);
    path.is_absolute() || path.components().count() > 1
}

/// Parse the pinned `port` parameter, if any.
pub fn parse_port(params: &Params) -> Result<Option<u16>> {
    match params.get(PORT_PARAM) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(0) | Err(_) => Err(Error::Config(format!(
                "Invalid '{}' parameter '{}': expected 1-65535",
                PORT_PARAM, raw
            ))),
            Ok(port) => Ok(Some(port)),
        },
    }
}

/// Write `params` as `key = value` lines, sorted by key. `version` is
/// left out.
///
/// Written to a temporary sibling and renamed into place so a reader never
/// sees a half-written file.
pub fn write_config_file(path: &Path, params: &Params) -> Result<()> {
    let mut content = String::from(CONFIG_HEADER);
    content.push('\n');
    for (key, value) in params.iter().filter(|(key, _)| key.as_str() != VERSION_PARAM) {
        if key.is_empty() || key.contains(['=', '\n', '#']) || key.trim() != key {
            return Err(Error::Config(format!("Invalid parameter name '{}'", key)));
        }
        if value.contains('\n') {
            return Err(Error::Config(format!(
                "Parameter '{}' must not contain a newline",
                key
            )));
        }
        content.push_str(key);
        content.push_str(" = ");
        content.push_str(value);
        content.push('\n');
    }

    let tmp_path = path.with_extension("conf.tmp");
    let mut file = fs::File::create(&tmp_path).map_err(|e| {
        Error::Filesystem(format!(
            "Failed to create config file '{}': {}",
            tmp_path.display(),
            e
        ))
    })?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp_path, path).map_err(|e| {
        Error::Filesystem(format!(
            "Failed to move config file into place at '{}': {}",
            path.display(),
            e
        ))
    })?;
    Ok(())
}

/// Read a file written by [`write_config_file`].
pub fn read_config_file(path: &Path) -> Result<Params> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Params> {
    let mut params = Params::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            Error::Config(format!(
                "Line {}: expected 'key = value', got '{}'",
                lineno + 1,
                line
            ))
        })?;
        params.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(params)
}

/// Make `kind` usable as a directory-name component.
pub(crate) fn sanitize_component(kind: &str) -> String {
    let base = Path::new(kind)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| kind.to_string());
    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn config_file_is_sorted_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let p = params(&[("port", "27017"), ("dbpath", "/tmp/db"), ("journal", "true")]);
        write_config_file(&path, &p).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(lines, ["dbpath = /tmp/db", "journal = true", "port = 27017"]);
        assert_eq!(read_config_file(&path).unwrap(), p);
        assert!(!path.with_extension("conf.tmp").exists());
    }

    #[test]
    fn rejects_unwritable_keys_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert!(write_config_file(&path, &params(&[("a=b", "1")])).is_err());
        assert!(write_config_file(&path, &params(&[("a", "1\n2")])).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn parse_config_errors_on_bare_word() {
        assert!(parse_config("# comment\n\nport = 1\n").is_ok());
        assert!(matches!(parse_config("nonsense"), Err(Error::Config(_))));
    }

    #[test]
    fn parse_port_variants() {
        assert_eq!(parse_port(&Params::new()).unwrap(), None);
        assert_eq!(parse_port(&params(&[("port", " 4000 ")])).unwrap(), Some(4000));
        assert!(parse_port(&params(&[("port", "0")])).is_err());
        assert!(parse_port(&params(&[("port", "70000")])).is_err());
    }

    #[test]
    fn resolve_binary_prefers_bin_dir() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-server");
        std::fs::write(&fake, "").unwrap();
        assert_eq!(
            resolve_binary("fake-server", Some(dir.path())).unwrap(),
            fake
        );
        assert_eq!(resolve_binary(fake.to_str().unwrap(), None).unwrap(), fake);
    }

    #[test]
    fn resolve_binary_missing_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_binary("fake_process_", Some(dir.path())).unwrap_err();
        assert!(matches!(err, Error::Launch { ref kind, .. } if kind == "fake_process_"));
        assert!(matches!(
            resolve_binary("/no/such/dir/server", None),
            Err(Error::Launch { .. })
        ));
        assert!(resolve_binary("  ", None).is_err());
    }

    /// Settings with releases "4.0" and "5.0", each holding `fake-server`,
    /// plus a `bin_dir` holding its own copy.
    fn release_settings(dir: &Path) -> InstanceSettings {
        let mut releases = BTreeMap::new();
        for name in ["4.0", "5.0", "bin"] {
            let release_dir = dir.join(name);
            std::fs::create_dir_all(&release_dir).unwrap();
            std::fs::write(release_dir.join("fake-server"), "").unwrap();
            if name != "bin" {
                releases.insert(name.to_string(), release_dir);
            }
        }
        InstanceSettings {
            bin_dir: Some(dir.join("bin")),
            releases,
            ..InstanceSettings::default()
        }
    }

    #[test]
    fn version_param_selects_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = release_settings(dir.path());

        assert_eq!(
            settings.locate_binary("fake-server", &Params::new()).unwrap(),
            dir.path().join("bin/fake-server")
        );
        assert_eq!(
            settings
                .locate_binary("fake-server", &params(&[("version", "4.0")]))
                .unwrap(),
            dir.path().join("4.0/fake-server")
        );

        settings.default_release = Some("5.0".to_string());
        assert_eq!(
            settings.locate_binary("fake-server", &Params::new()).unwrap(),
            dir.path().join("5.0/fake-server")
        );
        assert_eq!(
            settings
                .locate_binary("fake-server", &params(&[("version", "4.0")]))
                .unwrap(),
            dir.path().join("4.0/fake-server")
        );
    }

    #[test]
    fn unknown_release_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = release_settings(dir.path());

        let err = settings
            .locate_binary("fake-server", &params(&[("version", "9.9")]))
            .unwrap_err();
        assert!(matches!(err, Error::Launch { ref reason, .. } if reason.contains("9.9")));
        // A release never falls back to bin_dir or PATH
        assert!(matches!(
            settings.locate_binary("sh", &params(&[("version", "4.0")])),
            Err(Error::Launch { .. })
        ));
    }

    #[test]
    fn version_is_not_written_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        write_config_file(&path, &params(&[("port", "1"), ("version", "4.0")])).unwrap();
        assert_eq!(read_config_file(&path).unwrap(), params(&[("port", "1")]));
    }

    #[test]
    fn sanitize_component_strips_paths() {
        assert_eq!(sanitize_component("/usr/bin/mongod"), "mongod");
        assert_eq!(sanitize_component("my server"), "my_server");
    }
}
