// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(code(dbfixture::config::error))]
    Config(String),

    #[error("Cannot launch '{kind}': {reason}")]
    #[diagnostic(
        code(dbfixture::instance::launch),
        help("Check that the server binary exists in the configured bin_dir, DBFIXTURE_BIN or PATH and is executable")
    )]
    Launch { kind: String, reason: String },

    #[error("Server '{0}' exited before it became reachable")]
    #[diagnostic(code(dbfixture::instance::exited))]
    ProcessExited(String),

    #[error("Instance '{0}' has been cleaned up and cannot be used again")]
    #[diagnostic(
        code(dbfixture::instance::destroyed),
        help("Create a new instance instead of reusing a cleaned-up one")
    )]
    InstanceDestroyed(String),

    #[error("No free port left in range {low}-{high}")]
    #[diagnostic(
        code(dbfixture::port::exhausted),
        help("Widen the port range or clean up instances that are no longer needed")
    )]
    PortsExhausted { low: u16, high: u16 },

    #[error("Invalid port range {low}-{high}")]
    #[diagnostic(code(dbfixture::port::invalid_range))]
    InvalidPortRange { low: u16, high: u16 },

    #[error("Port {0} is already reserved by another instance")]
    #[diagnostic(
        code(dbfixture::port::in_use),
        help("Drop the pinned 'port' parameter to let the allocator pick a free port")
    )]
    PortInUse(u16),

    #[error("Unknown command '{0}'")]
    #[diagnostic(
        code(dbfixture::registry::invalid_command),
        help("Valid commands are: start, stop, restart")
    )]
    InvalidCommand(String),

    #[error("Instance not found: {0}")]
    #[diagnostic(code(dbfixture::registry::not_found))]
    InstanceNotFound(String),

    #[error("No instance is listening on {0}")]
    #[diagnostic(code(dbfixture::registry::endpoint_not_found))]
    EndpointNotFound(String),

    #[error("Instance with id '{0}' already exists")]
    #[diagnostic(code(dbfixture::registry::duplicate_id))]
    DuplicateId(String),

    #[error("Registry is not configured")]
    #[diagnostic(
        code(dbfixture::registry::not_configured),
        help("Call Registry::configure with a persistence location first")
    )]
    NotConfigured,

    #[error("State store at '{0}' is closed")]
    #[diagnostic(code(dbfixture::state::closed))]
    StoreClosed(String),

    #[error("Unreadable record '{id}' in state store '{location}': {reason}")]
    #[diagnostic(code(dbfixture::state::corrupt_record))]
    CorruptRecord {
        id: String,
        location: String,
        reason: String,
    },

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(dbfixture::filesystem::error))]
    Filesystem(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    #[diagnostic(
        code(dbfixture::database::error),
        help("See recovery suggestions based on the specific error type")
    )]
    Database(#[from] tokio_rusqlite::Error),

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::Launch { kind, .. } => Some(format!(
                "Set bin_dir (or DBFIXTURE_BIN) to the directory containing '{}', or pass an absolute path as the kind.",
                kind
            )),
            Error::PortsExhausted { low, high } => Some(format!(
                "All {} ports in {}-{} are reserved. Remove unused instances or call set_range with a wider range.",
                u32::from(*high) - u32::from(*low) + 1,
                low,
                high
            )),
            Error::PortInUse(port) => Some(format!(
                "Port {} is held by another live instance. Remove that instance or omit 'port' from the parameters.",
                port
            )),
            Error::InvalidCommand(_) => {
                Some("Use one of: start, stop, restart".to_string())
            }
            Error::NotConfigured => Some(
                "Configure the registry with a persistence location before creating instances.".to_string(),
            ),
            Error::CorruptRecord { id, location, .. } => Some(format!(
                "Stop the server recorded as '{}' by hand, then delete its row from '{}' or remove the file.",
                id, location
            )),
            Error::Database(e) => {
                // tokio_rusqlite wraps the rusqlite error opaquely, so match on the message.
                let err_str = e.to_string();
                if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY") {
                    Some(
                        "Another supervisor may be writing to the same registry file. Point each test run at its own persistence location.".to_string(),
                    )
                } else if err_str.contains("database disk image is malformed")
                    || err_str.contains("SQLITE_CORRUPT")
                {
                    Some(
                        "Registry database is corrupted. Remove the file (running fixtures will not be restored).".to_string(),
                    )
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
pub fn validate_pid(pid: u32, owner: &str) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID 0 is invalid for '{}' (refers to process group, not a process)",
                owner
            ),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("refusing to operate on PID 1 (init) for '{}'", owner),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!(
                "PID {} exceeds i32::MAX for '{}', cannot convert safely",
                pid, owner
            ),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

/// Same as validate_pid but allows PID 1, for read-only existence checks.
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}

/// Query the kernel clock tick rate (jiffies per second) at runtime.
///
/// Falls back to 100 (the common default) if sysconf fails.
#[cfg(target_os = "linux")]
fn get_clock_ticks_per_sec() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .unwrap_or(100)
}

/// Check if a PID belongs to the expected process by comparing start times.
///
/// Returns true if the PID appears valid (start time matches or cannot be determined),
/// false if the PID was clearly reused by a different process. Used before
/// signalling a server that was re-attached from a persisted record.
pub fn validate_pid_start_time(pid: u32, expected_start: chrono::DateTime<chrono::Utc>) -> bool {
    #[cfg(target_os = "linux")]
    {
        let stat_path = format!("/proc/{}/stat", pid);
        if let Ok(stat) = std::fs::read_to_string(&stat_path) {
            // The process name sits in parens and may contain spaces
            if let Some(close_paren) = stat.rfind(')') {
                let fields: Vec<&str> = stat[close_paren + 2..].split_whitespace().collect();
                // starttime is field 22 overall, 19 after the pid and name
                if let Some(&starttime_str) = fields.get(19) {
                    if let Ok(starttime_jiffies) = starttime_str.parse::<u64>() {
                        let expected_age = chrono::Utc::now().signed_duration_since(expected_start);

                        if expected_age.num_hours() > 24 {
                            return true;
                        }

                        if let Ok(uptime_str) = std::fs::read_to_string("/proc/uptime") {
                            if let Some(uptime_secs) = uptime_str
                                .split_whitespace()
                                .next()
                                .and_then(|s| s.parse::<f64>().ok())
                            {
                                let jiffies_per_sec = get_clock_ticks_per_sec();
                                let process_age_secs = uptime_secs
                                    - (starttime_jiffies as f64 / jiffies_per_sec as f64);
                                let expected_age_secs = expected_age.num_seconds() as f64;

                                if (process_age_secs - expected_age_secs).abs() > 60.0 {
                                    tracing::warn!(
                                        "PID {} appears to be reused: process age {:.0}s vs expected {:.0}s",
                                        pid,
                                        process_age_secs,
                                        expected_age_secs
                                    );
                                    return false;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        use chrono::TimeZone;
        if let Ok(output) = std::process::Command::new("ps")
            .args(["-o", "lstart=", "-p", &pid.to_string()])
            .output()
        {
            if output.status.success() {
                let lstart = String::from_utf8_lossy(&output.stdout);
                let lstart = lstart.trim();
                if let Ok(process_start) =
                    chrono::NaiveDateTime::parse_from_str(lstart, "%a %b %e %H:%M:%S %Y")
                {
                    // ps lstart is local time
                    let Some(process_start_utc) = chrono::Local
                        .from_local_datetime(&process_start)
                        .earliest()
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                    else {
                        return true;
                    };
                    if (process_start_utc - expected_start).num_seconds().abs() > 60 {
                        tracing::warn!(
                            "PID {} appears to be reused: process started at {} vs expected {}",
                            pid,
                            process_start_utc,
                            expected_start
                        );
                        return false;
                    }
                }
            }
        }
    }

    // Trust the PID if we can't determine start time
    true
}
