use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::bytes::{ByteCount, GIB, KIB, MIB, TIB};

/// Filesystem types the engine can model. The spelling matches the type
/// reported by `lsblk` and accepted by `mount -t`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FsType {
    Ext2,
    Ext3,
    #[default]
    Ext4,
    Btrfs,
    Xfs,
    Swap,
    Vfat,
    Exfat,
    Ntfs,
    Reiserfs,
    Jfs,
    F2fs,
    Udf,
    Iso9660,
    Nilfs2,
    Bcachefs,
    Nfs,
    Tmpfs,
}

impl FsType {
    /// Binary used to create the filesystem, if it can be created at all.
    pub fn mkfs_name(self) -> Option<&'static str> {
        match self {
            FsType::Ext2 => Some("mkfs.ext2"),
            FsType::Ext3 => Some("mkfs.ext3"),
            FsType::Ext4 => Some("mkfs.ext4"),
            FsType::Btrfs => Some("mkfs.btrfs"),
            FsType::Xfs => Some("mkfs.xfs"),
            FsType::Swap => Some("mkswap"),
            FsType::Vfat => Some("mkfs.vfat"),
            FsType::Exfat => Some("mkfs.exfat"),
            FsType::Ntfs => Some("mkfs.ntfs"),
            FsType::Reiserfs => Some("mkfs.reiserfs"),
            FsType::Jfs => Some("mkfs.jfs"),
            FsType::F2fs => Some("mkfs.f2fs"),
            FsType::Udf => Some("mkfs.udf"),
            FsType::Nilfs2 => Some("mkfs.nilfs2"),
            FsType::Bcachefs => Some("bcachefs"),
            FsType::Iso9660 | FsType::Nfs | FsType::Tmpfs => None,
        }
    }

    pub fn is_blk_filesystem(self) -> bool {
        !matches!(self, FsType::Nfs | FsType::Tmpfs)
    }

    pub fn min_size(self) -> ByteCount {
        ByteCount(match self {
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => 32 * MIB,
            FsType::Btrfs => 16 * MIB,
            FsType::Xfs => 300 * MIB,
            FsType::Swap => 40 * KIB,
            FsType::Vfat => 64 * KIB,
            FsType::Exfat => 16 * MIB,
            FsType::Ntfs => MIB,
            FsType::Reiserfs => 33 * MIB,
            FsType::Jfs => 16 * MIB,
            FsType::F2fs => 52 * MIB,
            FsType::Udf => MIB,
            FsType::Nilfs2 => 128 * MIB,
            FsType::Bcachefs => 16 * MIB,
            FsType::Iso9660 | FsType::Nfs | FsType::Tmpfs => 0,
        })
    }

    pub fn max_size(self) -> ByteCount {
        ByteCount(match self {
            FsType::Ext2 | FsType::Ext3 => 2048 * TIB,
            FsType::Ext4 => 1024 * 1024 * TIB,
            FsType::Btrfs | FsType::Xfs | FsType::Bcachefs => u64::MAX,
            FsType::Swap => 16 * TIB,
            FsType::Vfat => 2 * TIB,
            FsType::Exfat => 512 * TIB,
            FsType::Ntfs => 256 * TIB,
            FsType::Reiserfs => 16 * TIB,
            FsType::Jfs => 4096 * TIB,
            FsType::F2fs => 16 * TIB,
            FsType::Udf => 2 * TIB,
            FsType::Nilfs2 => 8192 * TIB,
            FsType::Iso9660 => 8 * GIB,
            FsType::Nfs | FsType::Tmpfs => u64::MAX,
        })
    }

    pub fn supports_label(self) -> bool {
        !matches!(self, FsType::Iso9660 | FsType::Nfs | FsType::Tmpfs)
    }

    pub fn max_label_len(self) -> usize {
        match self {
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => 16,
            FsType::Btrfs | FsType::Bcachefs => 256,
            FsType::Xfs => 12,
            FsType::Swap => 15,
            FsType::Vfat | FsType::Exfat => 11,
            FsType::Ntfs => 32,
            FsType::Reiserfs | FsType::Jfs => 16,
            FsType::F2fs => 512,
            FsType::Udf => 126,
            FsType::Nilfs2 => 80,
            FsType::Iso9660 | FsType::Nfs | FsType::Tmpfs => 0,
        }
    }

    pub fn supports_uuid(self) -> bool {
        !matches!(self, FsType::Iso9660 | FsType::Nfs | FsType::Tmpfs)
    }

    pub fn supports_shrink(self) -> bool {
        matches!(
            self,
            FsType::Ext2 | FsType::Ext3 | FsType::Ext4 | FsType::Btrfs | FsType::Nilfs2
        )
    }

    pub fn supports_grow(self) -> bool {
        matches!(
            self,
            FsType::Ext2
                | FsType::Ext3
                | FsType::Ext4
                | FsType::Btrfs
                | FsType::Xfs
                | FsType::Reiserfs
                | FsType::Jfs
                | FsType::F2fs
                | FsType::Nilfs2
                | FsType::Bcachefs
        )
    }

    /// Whether the filesystem is resized through a mount point instead of the
    /// block device.
    pub fn supports_mounted_resize(self) -> bool {
        matches!(
            self,
            FsType::Btrfs | FsType::Xfs | FsType::Nilfs2 | FsType::Bcachefs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(FsType::Btrfs.to_string(), "btrfs");
        assert_eq!(FsType::Iso9660.to_string(), "iso9660");
        assert_eq!("xfs".parse::<FsType>().unwrap(), FsType::Xfs);
        assert!("ufo".parse::<FsType>().is_err());
    }

    #[test]
    fn test_limits() {
        assert_eq!(FsType::Btrfs.min_size(), ByteCount(16 * MIB));
        assert_eq!(FsType::Xfs.min_size(), ByteCount(300 * MIB));
        assert!(FsType::Xfs.supports_grow());
        assert!(!FsType::Xfs.supports_shrink());
        assert!(FsType::Ext4.supports_shrink());
        assert!(!FsType::Swap.supports_mounted_resize());
    }
}
