//! Host and checkout metadata stored next to every result set.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, RefreshKind, System};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Where and when a sweep ran.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEnvironment {
    /// RFC 3339 UTC timestamp of collection.
    pub timestamp_utc: String,
    /// Host name, when the OS reports one.
    pub hostname: Option<String>,
    /// Long OS name and version.
    pub os_version: Option<String>,
    /// Kernel release.
    pub kernel_version: Option<String>,
    /// Brand string of the first CPU.
    pub cpu_brand: Option<String>,
    /// Physical cores, when known.
    pub cpu_physical_cores: Option<usize>,
    /// Logical cores.
    pub cpu_logical_cores: usize,
    /// Installed memory.
    pub total_memory_bytes: u64,
    /// Disk holding the output directory.
    pub disk: Option<DiskInfo>,
    /// Checkout the binary was run from, when inside one.
    pub git: Option<GitInfo>,
    /// Version of this crate.
    pub shopbench_version: String,
}

/// Filesystem backing the results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct DiskInfo {
    pub mount_point: String,
    pub filesystem: Option<String>,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Git state of the working directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct GitInfo {
    pub commit: String,
    pub branch: Option<String>,
    pub dirty: bool,
}

impl RunEnvironment {
    /// Collects the environment, resolving the disk that holds `result_dir`.
    pub fn collect(result_dir: &Path) -> Self {
        let mut sys = System::new_with_specifics(RefreshKind::everything());
        sys.refresh_all();
        let cpu_brand = sys.cpus().first().map(|cpu| cpu.brand().to_string());
        Self {
            timestamp_utc: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            hostname: System::host_name(),
            os_version: System::long_os_version(),
            kernel_version: System::kernel_version(),
            cpu_brand,
            cpu_physical_cores: sys.physical_core_count(),
            cpu_logical_cores: sys.cpus().len().max(1),
            total_memory_bytes: sys.total_memory(),
            disk: find_disk(result_dir),
            git: collect_git(),
            shopbench_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn find_disk(path: &Path) -> Option<DiskInfo> {
    let canonical = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .map(|disk| DiskInfo {
            mount_point: disk.mount_point().display().to_string(),
            filesystem: Some(disk.file_system().to_string_lossy().into_owned()),
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        })
        .max_by_key(|disk| disk.mount_point.len())
}

fn collect_git() -> Option<GitInfo> {
    let commit = run_git(&["rev-parse", "HEAD"])?.trim().to_string();
    let branch = run_git(&["rev-parse", "--abbrev-ref", "HEAD"]).map(|s| s.trim().to_string());
    let dirty = run_git(&["status", "--porcelain"])
        .map(|out| !out.trim().is_empty())
        .unwrap_or(false);
    Some(GitInfo {
        commit,
        branch,
        dirty,
    })
}

fn run_git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok()
}
