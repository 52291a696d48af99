use std::env;

/// Where the probed system state comes from and whether results are written
/// back for later playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeMode {
    /// Probe the real system.
    #[default]
    Standard,
    /// Probe the real system and save the probed devicegraph.
    StandardWriteDevicegraph,
    /// Probe the real system and save a mockup of all tool invocations.
    StandardWriteMockup,
    /// Do not probe, start with empty graphs.
    None,
    /// Load the probed devicegraph from a file.
    ReadDevicegraph,
    /// Replay tool invocations from a mockup file.
    ReadMockup,
}

impl ProbeMode {
    /// Whether this mode touches the real system and thus needs the
    /// advisory lock.
    pub fn probes_system(self) -> bool {
        matches!(
            self,
            ProbeMode::Standard
                | ProbeMode::StandardWriteDevicegraph
                | ProbeMode::StandardWriteMockup
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetMode {
    /// Modify the system directly.
    #[default]
    Direct,
    /// Modifications apply inside a chroot.
    Chroot,
    /// Modifications apply to an image.
    Image,
}

/// Configuration of a `Storage` instance.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub read_only: bool,
    pub probe_mode: ProbeMode,
    pub target_mode: TargetMode,
    pub rootprefix: Option<String>,
    pub devicegraph_filename: Option<String>,
    pub mockup_filename: Option<String>,
}

impl Environment {
    pub fn new(read_only: bool, probe_mode: ProbeMode, target_mode: TargetMode) -> Self {
        Environment {
            read_only,
            probe_mode,
            target_mode,
            ..Default::default()
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(
            value.to_lowercase().as_str(),
            "1" | "yes" | "on" | "true"
        ),
        Err(_) => default,
    }
}

/// Probe btrfs filesystems spanning multiple devices (default yes).
pub fn multiple_devices_btrfs() -> bool {
    env_flag("BALLAST_MULTIPLE_DEVICES_BTRFS", true)
}

/// Probe btrfs snapshot relations (default yes).
pub fn btrfs_snapshot_relations() -> bool {
    env_flag("BALLAST_BTRFS_SNAPSHOT_RELATIONS", true)
}

/// Probe btrfs qgroups (default yes).
pub fn btrfs_qgroups() -> bool {
    env_flag("BALLAST_BTRFS_QGROUPS", true)
}

/// Stricter internal assertions (default no).
pub fn developer_mode() -> bool {
    env_flag("BALLAST_DEVELOPER_MODE", false)
}

/// Prefer a filesystem over an empty MSDOS partition table when a device
/// carries traces of both (default yes).
pub fn prefer_filesystem_over_empty_msdos() -> bool {
    env_flag("BALLAST_PFSOEMS", true)
}

/// Use cryptsetup to open BitLocker volumes (default no).
pub fn cryptsetup_for_bitlocker() -> bool {
    env_flag("BALLAST_CRYPTSETUP_FOR_BITLOCKER", false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert!(multiple_devices_btrfs());
        assert!(btrfs_qgroups());
        assert!(!developer_mode());
        assert!(!cryptsetup_for_bitlocker());
    }

    #[test]
    fn test_probe_mode() {
        assert!(ProbeMode::Standard.probes_system());
        assert!(!ProbeMode::ReadMockup.probes_system());
    }
}
