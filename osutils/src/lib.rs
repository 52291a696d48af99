pub mod blkid;
pub mod btrfs;
pub mod cryptsetup;
pub mod dependencies;
pub mod errors;
pub mod exe;
pub mod files;
pub mod fstab;
pub mod lsblk;
pub mod lvm;
pub mod mdadm;
pub mod mkfs;
pub mod mockup;
pub mod mount;
pub mod parted;
pub mod sfdisk;
pub mod udevadm;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testing;
