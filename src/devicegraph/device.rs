use serde::{Deserialize, Serialize};
use strum_macros::Display;

use osutils::btrfs::QgroupId;
use sysdefs::{
    bytes::ByteCount,
    filesystems::FsType,
    raid::{BtrfsRaidLevel, MdLevel},
    region::Region,
};

use crate::{
    error::{Result, StorageError},
    sid::Sid,
};

/// Attributes every block device carries, regardless of how it is backed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlkDeviceData {
    /// Device node, e.g. `/dev/sda1` or `/dev/mapper/cr-data`
    pub name: String,

    pub size: ByteCount,

    /// Position on the parent device, in sectors
    #[serde(default)]
    pub region: Region,

    /// `/dev/disk/by-id/` links
    #[serde(default)]
    pub udev_ids: Vec<String>,

    /// `/dev/disk/by-path/` links
    #[serde(default)]
    pub udev_paths: Vec<String>,

    #[serde(default)]
    pub read_only: bool,
}

impl BlkDeviceData {
    pub fn new(name: impl Into<String>, size: ByteCount) -> Self {
        BlkDeviceData {
            name: name.into(),
            size,
            ..Default::default()
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum PtType {
    Gpt,
    Msdos,
    Dasd,
    /// Implicit partition table of devices that cannot hold a real one but
    /// are modeled with a single partition anyway.
    ImplicitPt,
}

impl PtType {
    pub fn max_partitions(self) -> usize {
        match self {
            PtType::Gpt => 128,
            PtType::Msdos => 4,
            PtType::Dasd => 3,
            PtType::ImplicitPt => 1,
        }
    }

    /// Spelling `parted mklabel` expects.
    pub fn parted_name(self) -> &'static str {
        match self {
            PtType::Gpt => "gpt",
            PtType::Msdos => "msdos",
            PtType::Dasd => "dasd",
            PtType::ImplicitPt => "loop",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesystemData {
    pub fs_type: FsType,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub mkfs_options: Vec<String>,
}

/// Btrfs-only filesystem attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BtrfsData {
    #[serde(default)]
    pub metadata_raid_level: BtrfsRaidLevel,
    #[serde(default)]
    pub data_raid_level: BtrfsRaidLevel,
    #[serde(default)]
    pub quota: bool,
    /// Bytes in use as probed, input to shrink estimates
    #[serde(default)]
    pub used_size: ByteCount,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MountPointData {
    /// Mount path, or "swap" for swap space
    pub path: String,
    #[serde(default)]
    pub mount_options: Vec<String>,
    /// Whether the mount is active right now
    #[serde(default)]
    pub active: bool,
    /// Whether an /etc/fstab entry exists
    #[serde(default)]
    pub in_etc_fstab: bool,
    #[serde(default)]
    pub freq: u32,
    #[serde(default)]
    pub passno: u32,
}

pub const BTRFS_TOP_LEVEL_SUBVOLUME_ID: u64 = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BtrfsSubvolumeData {
    pub id: u64,
    /// Path relative to the top-level subvolume
    pub path: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub default_subvolume: bool,
    #[serde(default)]
    pub nocow: bool,
}

impl BtrfsSubvolumeData {
    pub fn is_top_level(&self) -> bool {
        self.id == BTRFS_TOP_LEVEL_SUBVOLUME_ID
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BtrfsQgroupData {
    /// (level, id); level-0 qgroups shadow subvolumes
    pub id: QgroupId,
    #[serde(default)]
    pub referenced: u64,
    #[serde(default)]
    pub exclusive: u64,
    #[serde(default)]
    pub referenced_limit: Option<u64>,
    #[serde(default)]
    pub exclusive_limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum EncryptionType {
    #[default]
    Luks1,
    Luks2,
}

/// The flattened polymorphic device hierarchy: one variant per device type,
/// shared attribute structs composed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceKind {
    Disk {
        blk: BlkDeviceData,
        #[serde(default)]
        rotational: bool,
    },
    Dasd {
        blk: BlkDeviceData,
        #[serde(default)]
        bus_id: String,
    },
    Multipath {
        blk: BlkDeviceData,
        #[serde(default)]
        vendor: String,
        #[serde(default)]
        model: String,
    },
    DmRaid {
        blk: BlkDeviceData,
    },
    /// A block device probing could not classify further.
    StrayBlkDevice {
        blk: BlkDeviceData,
    },
    Md {
        blk: BlkDeviceData,
        level: MdLevel,
        #[serde(default)]
        uuid: String,
    },
    MdContainer {
        blk: BlkDeviceData,
        #[serde(default)]
        uuid: String,
    },
    Bcache {
        blk: BlkDeviceData,
    },
    BcacheCset {
        #[serde(default)]
        uuid: String,
    },
    PartitionTable {
        pt_type: PtType,
        #[serde(default)]
        uuid: String,
    },
    Partition {
        blk: BlkDeviceData,
        number: u32,
        /// Partition type: GUID on gpt, hex id on msdos
        #[serde(default)]
        partition_id: String,
        #[serde(default)]
        legacy_boot: bool,
    },
    LvmPv {
        #[serde(default)]
        uuid: String,
        #[serde(default)]
        pe_start: ByteCount,
    },
    LvmVg {
        vg_name: String,
        #[serde(default)]
        uuid: String,
        extent_size: ByteCount,
        #[serde(default)]
        extent_count: u64,
    },
    LvmLv {
        blk: BlkDeviceData,
        lv_name: String,
        #[serde(default)]
        uuid: String,
    },
    Luks {
        blk: BlkDeviceData,
        /// Device-mapper name of the plaintext device
        dm_name: String,
        #[serde(default)]
        encryption_type: EncryptionType,
        #[serde(default)]
        uuid: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        cipher: String,
        /// Key size in bytes
        #[serde(default)]
        key_size: u64,
        #[serde(default)]
        pbkdf: String,
        #[serde(default)]
        integrity: String,
    },
    BitlockerV2 {
        blk: BlkDeviceData,
        dm_name: String,
        #[serde(default)]
        uuid: String,
    },
    Filesystem {
        fs: FilesystemData,
        /// Present exactly when `fs.fs_type` is btrfs
        #[serde(default)]
        btrfs: Option<BtrfsData>,
    },
    Nfs {
        server: String,
        path: String,
    },
    Tmpfs,
    MountPoint(MountPointData),
    BtrfsSubvolume(BtrfsSubvolumeData),
    BtrfsQgroup(BtrfsQgroupData),
}

impl DeviceKind {
    /// Stable name of the variant, used in error messages and for the
    /// cross-graph same-variant invariant.
    pub fn variant_name(&self) -> &'static str {
        match self {
            DeviceKind::Disk { .. } => "Disk",
            DeviceKind::Dasd { .. } => "Dasd",
            DeviceKind::Multipath { .. } => "Multipath",
            DeviceKind::DmRaid { .. } => "DmRaid",
            DeviceKind::StrayBlkDevice { .. } => "StrayBlkDevice",
            DeviceKind::Md { .. } => "Md",
            DeviceKind::MdContainer { .. } => "MdContainer",
            DeviceKind::Bcache { .. } => "Bcache",
            DeviceKind::BcacheCset { .. } => "BcacheCset",
            DeviceKind::PartitionTable { .. } => "PartitionTable",
            DeviceKind::Partition { .. } => "Partition",
            DeviceKind::LvmPv { .. } => "LvmPv",
            DeviceKind::LvmVg { .. } => "LvmVg",
            DeviceKind::LvmLv { .. } => "LvmLv",
            DeviceKind::Luks { .. } => "Luks",
            DeviceKind::BitlockerV2 { .. } => "BitlockerV2",
            DeviceKind::Filesystem { .. } => "Filesystem",
            DeviceKind::Nfs { .. } => "Nfs",
            DeviceKind::Tmpfs => "Tmpfs",
            DeviceKind::MountPoint(_) => "MountPoint",
            DeviceKind::BtrfsSubvolume(_) => "BtrfsSubvolume",
            DeviceKind::BtrfsQgroup(_) => "BtrfsQgroup",
        }
    }
}

/// A node of a device graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    sid: Sid,
    pub kind: DeviceKind,
}

impl Device {
    pub fn new(kind: DeviceKind) -> Self {
        Device {
            sid: Sid::allocate(),
            kind,
        }
    }

    pub(crate) fn with_sid(sid: Sid, kind: DeviceKind) -> Self {
        Device { sid, kind }
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }

    /// Shared block device attributes, for variants that are block devices.
    pub fn blk(&self) -> Option<&BlkDeviceData> {
        match &self.kind {
            DeviceKind::Disk { blk, .. }
            | DeviceKind::Dasd { blk, .. }
            | DeviceKind::Multipath { blk, .. }
            | DeviceKind::DmRaid { blk }
            | DeviceKind::StrayBlkDevice { blk }
            | DeviceKind::Md { blk, .. }
            | DeviceKind::MdContainer { blk, .. }
            | DeviceKind::Bcache { blk }
            | DeviceKind::Partition { blk, .. }
            | DeviceKind::LvmLv { blk, .. }
            | DeviceKind::Luks { blk, .. }
            | DeviceKind::BitlockerV2 { blk, .. } => Some(blk),
            _ => None,
        }
    }

    pub fn blk_mut(&mut self) -> Option<&mut BlkDeviceData> {
        match &mut self.kind {
            DeviceKind::Disk { blk, .. }
            | DeviceKind::Dasd { blk, .. }
            | DeviceKind::Multipath { blk, .. }
            | DeviceKind::DmRaid { blk }
            | DeviceKind::StrayBlkDevice { blk }
            | DeviceKind::Md { blk, .. }
            | DeviceKind::MdContainer { blk, .. }
            | DeviceKind::Bcache { blk }
            | DeviceKind::Partition { blk, .. }
            | DeviceKind::LvmLv { blk, .. }
            | DeviceKind::Luks { blk, .. }
            | DeviceKind::BitlockerV2 { blk, .. } => Some(blk),
            _ => None,
        }
    }

    pub fn is_blk_device(&self) -> bool {
        self.blk().is_some()
    }

    /// Whether a partition table can sit on this device.
    pub fn is_partitionable(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::Disk { .. }
                | DeviceKind::Dasd { .. }
                | DeviceKind::Multipath { .. }
                | DeviceKind::DmRaid { .. }
                | DeviceKind::Md { .. }
        )
    }

    pub fn is_filesystem(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::Filesystem { .. } | DeviceKind::Nfs { .. } | DeviceKind::Tmpfs
        )
    }

    fn wrong_type(&self, expected: &'static str) -> StorageError {
        StorageError::WrongType {
            sid: self.sid,
            expected,
            found: self.kind.variant_name(),
        }
    }

    pub fn as_partition(&self) -> Result<(&BlkDeviceData, u32)> {
        match &self.kind {
            DeviceKind::Partition { blk, number, .. } => Ok((blk, *number)),
            _ => Err(self.wrong_type("Partition")),
        }
    }

    pub fn as_partition_table(&self) -> Result<PtType> {
        match &self.kind {
            DeviceKind::PartitionTable { pt_type, .. } => Ok(*pt_type),
            _ => Err(self.wrong_type("PartitionTable")),
        }
    }

    pub fn as_filesystem(&self) -> Result<&FilesystemData> {
        match &self.kind {
            DeviceKind::Filesystem { fs, .. } => Ok(fs),
            _ => Err(self.wrong_type("Filesystem")),
        }
    }

    pub fn as_filesystem_mut(&mut self) -> Result<&mut FilesystemData> {
        let err = self.wrong_type("Filesystem");
        match &mut self.kind {
            DeviceKind::Filesystem { fs, .. } => Ok(fs),
            _ => Err(err),
        }
    }

    pub fn as_btrfs(&self) -> Result<(&FilesystemData, &BtrfsData)> {
        match &self.kind {
            DeviceKind::Filesystem { fs, btrfs: Some(btrfs) } => Ok((fs, btrfs)),
            _ => Err(self.wrong_type("Btrfs")),
        }
    }

    pub fn as_btrfs_mut(&mut self) -> Result<(&mut FilesystemData, &mut BtrfsData)> {
        let err = self.wrong_type("Btrfs");
        match &mut self.kind {
            DeviceKind::Filesystem { fs, btrfs: Some(btrfs) } => Ok((fs, btrfs)),
            _ => Err(err),
        }
    }

    pub fn as_mount_point(&self) -> Result<&MountPointData> {
        match &self.kind {
            DeviceKind::MountPoint(data) => Ok(data),
            _ => Err(self.wrong_type("MountPoint")),
        }
    }

    pub fn as_mount_point_mut(&mut self) -> Result<&mut MountPointData> {
        let err = self.wrong_type("MountPoint");
        match &mut self.kind {
            DeviceKind::MountPoint(data) => Ok(data),
            _ => Err(err),
        }
    }

    pub fn as_btrfs_subvolume(&self) -> Result<&BtrfsSubvolumeData> {
        match &self.kind {
            DeviceKind::BtrfsSubvolume(data) => Ok(data),
            _ => Err(self.wrong_type("BtrfsSubvolume")),
        }
    }

    pub fn as_btrfs_subvolume_mut(&mut self) -> Result<&mut BtrfsSubvolumeData> {
        let err = self.wrong_type("BtrfsSubvolume");
        match &mut self.kind {
            DeviceKind::BtrfsSubvolume(data) => Ok(data),
            _ => Err(err),
        }
    }

    pub fn as_btrfs_qgroup(&self) -> Result<&BtrfsQgroupData> {
        match &self.kind {
            DeviceKind::BtrfsQgroup(data) => Ok(data),
            _ => Err(self.wrong_type("BtrfsQgroup")),
        }
    }

    pub fn as_btrfs_qgroup_mut(&mut self) -> Result<&mut BtrfsQgroupData> {
        let err = self.wrong_type("BtrfsQgroup");
        match &mut self.kind {
            DeviceKind::BtrfsQgroup(data) => Ok(data),
            _ => Err(err),
        }
    }

    pub fn as_lvm_vg(&self) -> Result<(&str, ByteCount, u64)> {
        match &self.kind {
            DeviceKind::LvmVg { vg_name, extent_size, extent_count, .. } => {
                Ok((vg_name, *extent_size, *extent_count))
            }
            _ => Err(self.wrong_type("LvmVg")),
        }
    }

    /// Human-readable identification used in action texts and logs.
    pub fn display_name(&self) -> String {
        match &self.kind {
            DeviceKind::PartitionTable { pt_type, .. } => {
                format!("{pt_type} partition table")
            }
            DeviceKind::LvmPv { .. } => "physical volume".to_owned(),
            DeviceKind::LvmVg { vg_name, .. } => format!("volume group {vg_name}"),
            DeviceKind::Filesystem { fs, .. } => fs.fs_type.to_string(),
            DeviceKind::Nfs { server, path } => format!("{server}:{path}"),
            DeviceKind::Tmpfs => "tmpfs".to_owned(),
            DeviceKind::MountPoint(data) => format!("mount point {}", data.path),
            DeviceKind::BtrfsSubvolume(data) => format!("subvolume {}", data.path),
            DeviceKind::BtrfsQgroup(data) => {
                format!("qgroup {}", osutils::btrfs::format_qgroup_id(data.id))
            }
            _ => self
                .blk()
                .map(|blk| blk.name.clone())
                .unwrap_or_else(|| self.kind.variant_name().to_owned()),
        }
    }

    /// Attributes differing from `other`, for logging. Coarse by design:
    /// the action graph builder compares fields itself.
    pub fn log_diff(&self, other: &Device) -> Vec<String> {
        let mut diffs = Vec::new();

        if self.kind.variant_name() != other.kind.variant_name() {
            diffs.push(format!(
                "type: {} -> {}",
                self.kind.variant_name(),
                other.kind.variant_name()
            ));
            return diffs;
        }

        if let (Some(a), Some(b)) = (self.blk(), other.blk()) {
            if a.name != b.name {
                diffs.push(format!("name: {} -> {}", a.name, b.name));
            }
            if a.size != b.size {
                diffs.push(format!("size: {} -> {}", a.size, b.size));
            }
        }

        match (&self.kind, &other.kind) {
            (
                DeviceKind::Filesystem { fs: a, btrfs: ba },
                DeviceKind::Filesystem { fs: b, btrfs: bb },
            ) => {
                if a.label != b.label {
                    diffs.push(format!("label: '{}' -> '{}'", a.label, b.label));
                }
                if a.uuid != b.uuid {
                    diffs.push(format!("uuid: {} -> {}", a.uuid, b.uuid));
                }
                if ba.as_ref().map(|d| d.quota) != bb.as_ref().map(|d| d.quota) {
                    diffs.push("quota".to_owned());
                }
            }
            (DeviceKind::MountPoint(a), DeviceKind::MountPoint(b)) => {
                if a.path != b.path {
                    diffs.push(format!("path: {} -> {}", a.path, b.path));
                }
                if a.active != b.active {
                    diffs.push("active".to_owned());
                }
                if a.in_etc_fstab != b.in_etc_fstab {
                    diffs.push("in-etc-fstab".to_owned());
                }
            }
            (DeviceKind::BtrfsSubvolume(a), DeviceKind::BtrfsSubvolume(b)) => {
                if a.default_subvolume != b.default_subvolume {
                    diffs.push("default-subvolume".to_owned());
                }
                if a.nocow != b.nocow {
                    diffs.push("nocow".to_owned());
                }
            }
            (DeviceKind::LvmVg { vg_name: a, .. }, DeviceKind::LvmVg { vg_name: b, .. }) => {
                if a != b {
                    diffs.push(format!("vg-name: {a} -> {b}"));
                }
            }
            _ => {}
        }

        diffs
    }
}
