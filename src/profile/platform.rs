//! Platform-specific storage queries.
//!
//! Each OS backend answers three questions about a path: what filesystem
//! it lives on, whether that filesystem is remote, and what kind of medium
//! backs it. Platforms without a backend report `Unknown` and the profiler
//! falls back to benchmark-based classification.

use crate::profile::storage::StorageKind;
use std::path::Path;
use std::time::Duration;

/// How long a platform query subprocess may run before being killed.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capability set for OS-level storage queries.
pub trait PlatformProbe: Send + Sync {
    /// Filesystem type backing `path` (e.g. "ext4", "apfs", "cifs")
    fn fs_type(&self, path: &Path) -> Option<String>;

    /// Whether `path` lives on a network filesystem
    fn is_network(&self, path: &Path) -> bool;

    /// Medium classification; `Unknown` defers to the benchmark
    fn detect_kind(&self, path: &Path) -> StorageKind;

    /// Root under which external drives are mounted on this platform
    fn external_volumes_root(&self) -> &'static Path;
}

/// Construct the probe for the current platform.
pub fn platform_probe() -> Box<dyn PlatformProbe> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxProbe)
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(macos::MacosProbe)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Box::new(FallbackProbe)
    }
}

/// Filesystem types that indicate a network mount.
pub(crate) fn is_network_fs_type(fs_type: &str) -> bool {
    matches!(
        fs_type,
        "smbfs" | "nfs" | "nfs4" | "afpfs" | "webdav" | "cifs" | "davfs" | "fuse.sshfs"
    )
}

/// A UNC-style path (`\\server\share` or `//server/share`) is always remote.
pub(crate) fn has_unc_prefix(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.starts_with("\\\\") || s.starts_with("//")
}

/// Run a command with the probe timeout, returning stdout on success.
#[allow(dead_code)]
pub(crate) fn run_probe_command(program: &str, args: &[&str]) -> Option<String> {
    use std::process::{Command, Stdio};

    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    let deadline = std::time::Instant::now() + PROBE_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => {
                let mut output = String::new();
                use std::io::Read;
                child.stdout.take()?.read_to_string(&mut output).ok()?;
                return Some(output);
            }
            Ok(Some(_)) => return None,
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return None,
        }
    }
}

/// Probe for platforms without a dedicated backend.
pub struct FallbackProbe;

impl PlatformProbe for FallbackProbe {
    fn fs_type(&self, _path: &Path) -> Option<String> {
        None
    }

    fn is_network(&self, path: &Path) -> bool {
        has_unc_prefix(path)
    }

    fn detect_kind(&self, path: &Path) -> StorageKind {
        if has_unc_prefix(path) {
            StorageKind::NetworkShare
        } else {
            StorageKind::Unknown
        }
    }

    fn external_volumes_root(&self) -> &'static Path {
        Path::new("/mnt")
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::path::PathBuf;

    pub struct LinuxProbe;

    /// A parsed /proc/mounts row
    struct MountEntry {
        device: String,
        mount_point: PathBuf,
        fs_type: String,
    }

    fn read_mounts() -> Vec<MountEntry> {
        let Ok(content) = std::fs::read_to_string("/proc/mounts") else {
            return Vec::new();
        };

        content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let device = parts.next()?.to_string();
                // Octal-escaped spaces in mount points
                let mount_point = PathBuf::from(parts.next()?.replace("\\040", " "));
                let fs_type = parts.next()?.to_string();
                Some(MountEntry {
                    device,
                    mount_point,
                    fs_type,
                })
            })
            .collect()
    }

    /// Longest mount-point prefix wins.
    fn mount_for(path: &Path) -> Option<MountEntry> {
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        read_mounts()
            .into_iter()
            .filter(|m| resolved.starts_with(&m.mount_point))
            .max_by_key(|m| m.mount_point.components().count())
    }

    /// Strip the partition suffix: sda1 -> sda, nvme0n1p2 -> nvme0n1.
    fn block_device_name(device: &str) -> Option<String> {
        let name = device.strip_prefix("/dev/")?;
        if name.starts_with("nvme") {
            if let Some(idx) = name.rfind('p') {
                let suffix = &name[idx + 1..];
                if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                    return Some(name[..idx].to_string());
                }
            }
            return Some(name.to_string());
        }
        Some(name.trim_end_matches(|c: char| c.is_ascii_digit()).to_string())
    }

    fn sys_block_attr(block: &str, attr: &str) -> Option<String> {
        let path = format!("/sys/block/{}/{}", block, attr);
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Walk up from the block device's sysfs node looking for the USB
    /// `speed` attribute (Mb/s).
    fn usb_speed_mbps(block: &str) -> Option<u64> {
        let sys = PathBuf::from(format!("/sys/block/{}", block));
        let mut current = sys.canonicalize().ok()?;

        for _ in 0..10 {
            let speed_file = current.join("speed");
            if let Ok(content) = std::fs::read_to_string(&speed_file) {
                if let Ok(speed) = content.trim().parse::<f64>() {
                    return Some(speed as u64);
                }
            }
            current = current.parent()?.to_path_buf();
        }

        None
    }

    impl PlatformProbe for LinuxProbe {
        fn fs_type(&self, path: &Path) -> Option<String> {
            mount_for(path).map(|m| m.fs_type)
        }

        fn is_network(&self, path: &Path) -> bool {
            if has_unc_prefix(path) {
                return true;
            }
            mount_for(path)
                .map(|m| is_network_fs_type(&m.fs_type))
                .unwrap_or(false)
        }

        fn detect_kind(&self, path: &Path) -> StorageKind {
            if self.is_network(path) {
                return StorageKind::NetworkShare;
            }

            let Some(mount) = mount_for(path) else {
                return StorageKind::Unknown;
            };

            if mount.fs_type.starts_with("fuse") {
                return StorageKind::CloudMount;
            }

            let Some(block) = block_device_name(&mount.device) else {
                return StorageKind::Unknown;
            };

            let removable = sys_block_attr(&block, "removable").as_deref() == Some("1");
            if removable || usb_speed_mbps(&block).is_some() {
                // USB generation from the hub link speed; unknown reads
                // optimistically as USB3.
                return match usb_speed_mbps(&block) {
                    Some(speed) if speed <= 480 => StorageKind::ExternalUsb2,
                    _ => StorageKind::ExternalUsb3,
                };
            }

            match sys_block_attr(&block, "queue/rotational").as_deref() {
                Some("0") => StorageKind::LocalSsd,
                Some("1") => StorageKind::LocalHdd,
                _ => StorageKind::Unknown,
            }
        }

        fn external_volumes_root(&self) -> &'static Path {
            Path::new("/media")
        }
    }
}

#[cfg(target_os = "macos")]
mod macos {
    use super::*;

    pub struct MacosProbe;

    fn diskutil_info(path: &Path) -> Option<String> {
        run_probe_command("diskutil", &["info", &path.to_string_lossy()])
    }

    /// Value of a `Key: value` row in diskutil output.
    fn info_value<'a>(info: &'a str, key: &str) -> Option<&'a str> {
        info.lines().find_map(|line| {
            let line = line.trim();
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix(':'))
                .map(str::trim)
        })
    }

    impl PlatformProbe for MacosProbe {
        fn fs_type(&self, path: &Path) -> Option<String> {
            let info = diskutil_info(path)?;
            info_value(&info, "Type (Bundle)")
                .or_else(|| info_value(&info, "File System Personality"))
                .map(|s| s.to_lowercase())
        }

        fn is_network(&self, path: &Path) -> bool {
            if has_unc_prefix(path) {
                return true;
            }
            self.fs_type(path)
                .map(|t| is_network_fs_type(&t))
                .unwrap_or(false)
        }

        fn detect_kind(&self, path: &Path) -> StorageKind {
            if self.is_network(path) {
                return StorageKind::NetworkShare;
            }

            let Some(info) = diskutil_info(path) else {
                return StorageKind::Unknown;
            };

            let protocol = info_value(&info, "Protocol").unwrap_or("");
            if protocol.contains("Thunderbolt") {
                return StorageKind::ExternalThunderbolt;
            }
            if protocol.contains("USB") {
                // "Up to 480 Mb/s" marks USB2; 5/10 Gb/s links are USB3.
                let speed = info_value(&info, "Device Speed").unwrap_or("");
                if speed.contains("480") {
                    return StorageKind::ExternalUsb2;
                }
                return StorageKind::ExternalUsb3;
            }

            if info_value(&info, "Solid State") == Some("Yes") {
                return StorageKind::LocalSsd;
            }
            if let Some(medium) = info_value(&info, "Medium Type") {
                if medium.contains("Rotational") {
                    return StorageKind::LocalHdd;
                }
            }

            match self.fs_type(path).as_deref() {
                Some("apfs") => StorageKind::LocalSsd,
                Some(t) if t.starts_with("hfs") => StorageKind::LocalHdd,
                _ => StorageKind::Unknown,
            }
        }

        fn external_volumes_root(&self) -> &'static Path {
            Path::new("/Volumes")
        }
    }
}
