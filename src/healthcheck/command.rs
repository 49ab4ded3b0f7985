use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Runs `<binary> --version` and reports the first line of output.
///
/// Used to fill an instance's server metadata once it is up; any failure
/// (timeout, non-zero exit, empty output) yields `None`.
pub struct VersionProbe {
    binary: PathBuf,
    timeout: Duration,
}

impl VersionProbe {
    pub fn new(binary: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
            timeout,
        }
    }

    pub async fn run(&self) -> Option<String> {
        let result = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .arg("--version")
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string),
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_yields_none() {
        let probe = VersionProbe::new("/nonexistent/dbfixture-server", VERSION_PROBE_TIMEOUT);
        assert_eq!(probe.run().await, None);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn non_zero_exit_yields_none() {
        let false_bin = which::which("false").unwrap();
        let probe = VersionProbe::new(false_bin, VERSION_PROBE_TIMEOUT);
        assert_eq!(probe.run().await, None);
    }
}
