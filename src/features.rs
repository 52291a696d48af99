use bitflags::bitflags;

bitflags! {
    /// Storage features a device graph (or an action graph) makes use of.
    /// Clients use this to decide which tool packages must be installed.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct UsedFeatures: u32 {
        const EXT = 1 << 0;
        const BTRFS = 1 << 1;
        const XFS = 1 << 2;
        const SWAP = 1 << 3;
        const FAT = 1 << 4;
        const EXFAT = 1 << 5;
        const NTFS = 1 << 6;
        const OTHER_FILESYSTEM = 1 << 7;
        const NFS = 1 << 8;
        const LVM = 1 << 9;
        const LUKS = 1 << 10;
        const BITLOCKER = 1 << 11;
        const RAID = 1 << 12;
        const MULTIPATH = 1 << 13;
        const DMRAID = 1 << 14;
        const BCACHE = 1 << 15;
        const QUOTA = 1 << 16;
        const SNAPSHOTS = 1 << 17;
        const BTRFS_MULTIPLE_DEVICES = 1 << 18;
    }
}

impl UsedFeatures {
    /// Space-separated lowercase names of the set bits, stable order.
    pub fn names(self) -> String {
        let mut names = Vec::new();
        for (name, flag) in [
            ("ext", UsedFeatures::EXT),
            ("btrfs", UsedFeatures::BTRFS),
            ("xfs", UsedFeatures::XFS),
            ("swap", UsedFeatures::SWAP),
            ("fat", UsedFeatures::FAT),
            ("exfat", UsedFeatures::EXFAT),
            ("ntfs", UsedFeatures::NTFS),
            ("other-filesystem", UsedFeatures::OTHER_FILESYSTEM),
            ("nfs", UsedFeatures::NFS),
            ("lvm", UsedFeatures::LVM),
            ("luks", UsedFeatures::LUKS),
            ("bitlocker", UsedFeatures::BITLOCKER),
            ("raid", UsedFeatures::RAID),
            ("multipath", UsedFeatures::MULTIPATH),
            ("dmraid", UsedFeatures::DMRAID),
            ("bcache", UsedFeatures::BCACHE),
            ("quota", UsedFeatures::QUOTA),
            ("snapshots", UsedFeatures::SNAPSHOTS),
            ("btrfs-multiple-devices", UsedFeatures::BTRFS_MULTIPLE_DEVICES),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        names.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(UsedFeatures::LVM.names(), "lvm");
        assert_eq!(
            (UsedFeatures::BTRFS | UsedFeatures::QUOTA).names(),
            "btrfs quota"
        );
        assert_eq!(UsedFeatures::empty().names(), "");
    }
}
