use strum_macros::IntoStaticStr;

use crate::exe::Cmd;

/// Enum of the external binaries the engine shells out to. Keeping them in
/// one place makes the tool surface auditable and gives every invocation a
/// stable mockup key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Bcachefs,
    Blkid,
    Btrfs,
    Btrfstune,
    Chattr,
    Cryptsetup,
    Exfatlabel,
    Fatlabel,
    Lsblk,
    Lvcreate,
    Lvremove,
    Lvrename,
    Lvresize,
    Lvs,
    Mdadm,
    #[strum(serialize = "mkfs.btrfs")]
    MkfsBtrfs,
    #[strum(serialize = "mkfs.exfat")]
    MkfsExfat,
    #[strum(serialize = "mkfs.ext2")]
    MkfsExt2,
    #[strum(serialize = "mkfs.ext3")]
    MkfsExt3,
    #[strum(serialize = "mkfs.ext4")]
    MkfsExt4,
    #[strum(serialize = "mkfs.f2fs")]
    MkfsF2fs,
    #[strum(serialize = "mkfs.jfs")]
    MkfsJfs,
    #[strum(serialize = "mkfs.nilfs2")]
    MkfsNilfs2,
    #[strum(serialize = "mkfs.ntfs")]
    MkfsNtfs,
    #[strum(serialize = "mkfs.reiserfs")]
    MkfsReiserfs,
    #[strum(serialize = "mkfs.udf")]
    MkfsUdf,
    #[strum(serialize = "mkfs.vfat")]
    MkfsVfat,
    #[strum(serialize = "mkfs.xfs")]
    MkfsXfs,
    Mkswap,
    Mount,
    Ntfslabel,
    Parted,
    Pvcreate,
    Pvremove,
    Pvs,
    Resize2fs,
    Sfdisk,
    Swaplabel,
    Swapoff,
    Swapon,
    Tune2fs,
    Udevadm,
    Umount,
    Vgcreate,
    Vgextend,
    Vgreduce,
    Vgremove,
    Vgrename,
    Vgs,
    Wipefs,
    #[strum(serialize = "xfs_admin")]
    XfsAdmin,
    #[strum(serialize = "xfs_growfs")]
    XfsGrowfs,
}

impl Dependency {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Start building an invocation of this binary.
    pub fn cmd(self) -> Cmd {
        Cmd::new(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(Dependency::Btrfs.name(), "btrfs");
        assert_eq!(Dependency::MkfsBtrfs.name(), "mkfs.btrfs");
        assert_eq!(Dependency::XfsGrowfs.name(), "xfs_growfs");
        assert_eq!(Dependency::Lsblk.name(), "lsblk");
    }
}
