//! System checks and diagnostics

use crate::config::{mask_secret, validate_bridge_key, BridgeConfig};
use crate::models::installed_models;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Below this much free disk a warning is raised
const LOW_DISK_GB: f64 = 5.0;

const GPU_DETECT_TIMEOUT: Duration = Duration::from_secs(3);
const BACKEND_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// GPU availability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub available: bool,
    pub name: Option<String>,
}

/// Look for a GPU: `nvidia-smi` first, then Apple Silicon.
pub async fn detect_gpu(timeout: Duration) -> GpuInfo {
    let mut cmd = tokio::process::Command::new("nvidia-smi");
    cmd.args(["--query-gpu=name", "--format=csv,noheader"])
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    if let Ok(Ok(output)) = tokio::time::timeout(timeout, cmd.output()).await {
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if let Some(name) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                return GpuInfo {
                    available: true,
                    name: Some(name.to_string()),
                };
            }
        }
    }

    if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        return GpuInfo {
            available: true,
            name: Some("Apple Silicon (MPS)".to_string()),
        };
    }
    GpuInfo::default()
}

/// Free space available to unprivileged users at `path`, in GB (1 decimal)
#[cfg(unix)]
pub fn disk_free_gb(path: &Path) -> Option<f64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs only writes into the zeroed struct we own.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    let bytes = stat.f_bavail as u64 * stat.f_frsize as u64;
    let gb = bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    Some((gb * 10.0).round() / 10.0)
}

#[cfg(not(unix))]
pub fn disk_free_gb(_path: &Path) -> Option<f64> {
    None
}

/// Locate `program` the way a shell would.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Round-trip latency to the backend; any HTTP answer counts as reachable.
pub async fn check_backend(url: &str, timeout: Duration) -> crate::error::Result<Duration> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let started = Instant::now();
    client
        .get(url)
        .send()
        .await
        .map_err(|e| crate::error::Error::Connectivity(e.to_string()))?;
    Ok(started.elapsed())
}

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl Check {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub checks: Vec<Check>,
}

impl DiagnosticReport {
    /// Checks that did not pass
    pub fn issues(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status != CheckStatus::Pass)
            .count()
    }

    pub fn has_failures(&self) -> bool {
        self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            let mark = match check.status {
                CheckStatus::Pass => "[ok]  ",
                CheckStatus::Warn => "[warn]",
                CheckStatus::Fail => "[FAIL]",
            };
            writeln!(f, "  {} {:<14} {}", mark, check.name, check.detail)?;
        }
        match self.issues() {
            0 => writeln!(f, "\nAll checks passed."),
            n => writeln!(f, "\n{} issue(s) found.", n),
        }
    }
}

/// Run every diagnostic check against `config`.
pub async fn diagnose(config: &BridgeConfig) -> DiagnosticReport {
    let mut report = DiagnosticReport::default();

    report.checks.push(if config.bridge_key.is_empty() {
        Check::new(
            "bridge key",
            CheckStatus::Fail,
            "not set. Run: pl config set bridge_key pb_...",
        )
    } else {
        match validate_bridge_key(&config.bridge_key) {
            Ok(()) => Check::new("bridge key", CheckStatus::Pass, mask_secret(&config.bridge_key)),
            Err(e) => Check::new("bridge key", CheckStatus::Fail, e.to_string()),
        }
    });

    report.checks.push(if config.backend_url.is_empty() {
        Check::new("backend", CheckStatus::Fail, "backend_url is not set")
    } else {
        match check_backend(&config.backend_url, BACKEND_CHECK_TIMEOUT).await {
            Ok(latency) => Check::new(
                "backend",
                CheckStatus::Pass,
                format!("{} reachable ({} ms)", config.backend_url, latency.as_millis()),
            ),
            Err(e) => Check::new(
                "backend",
                CheckStatus::Fail,
                format!("{} unreachable: {}", config.backend_url, e),
            ),
        }
    });

    let gpu = detect_gpu(GPU_DETECT_TIMEOUT).await;
    report.checks.push(match gpu.name {
        Some(name) if gpu.available => Check::new("gpu", CheckStatus::Pass, name),
        _ => Check::new("gpu", CheckStatus::Warn, "no GPU detected; models run on CPU"),
    });

    let tools = [
        ("python3", "python3"),
        ("downloader", config.models.download_program.as_str()),
        ("inference", config.models.infer_program.as_str()),
        ("model server", config.models.serve_program.as_str()),
        ("agent runner", config.supervisor.agent_program.as_str()),
    ];
    for (name, program) in tools {
        report.checks.push(match find_in_path(program) {
            Some(path) => Check::new(name, CheckStatus::Pass, path.display().to_string()),
            None => Check::new(name, CheckStatus::Warn, format!("{} not found on PATH", program)),
        });
    }

    let models_dir = &config.default_model_path;
    report.checks.push(if models_dir.is_dir() {
        let count = installed_models(models_dir).len();
        Check::new(
            "models",
            CheckStatus::Pass,
            format!("{} ({} installed)", models_dir.display(), count),
        )
    } else {
        Check::new(
            "models",
            CheckStatus::Warn,
            format!("{} does not exist yet", models_dir.display()),
        )
    });

    let disk_path = if models_dir.is_dir() {
        models_dir.clone()
    } else {
        dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("/"))
    };
    if let Some(free) = disk_free_gb(&disk_path) {
        let status = if free < LOW_DISK_GB {
            CheckStatus::Warn
        } else {
            CheckStatus::Pass
        };
        report
            .checks
            .push(Check::new("disk", status, format!("{:.1} GB free", free)));
    }

    report
}
