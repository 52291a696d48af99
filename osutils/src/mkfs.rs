use log::info;

use sysdefs::filesystems::FsType;

use crate::{dependencies::Dependency, errors::CmdError, exe::Cmd};

fn mkfs_dependency(fs_type: FsType) -> Option<Dependency> {
    Some(match fs_type {
        FsType::Ext2 => Dependency::MkfsExt2,
        FsType::Ext3 => Dependency::MkfsExt3,
        FsType::Ext4 => Dependency::MkfsExt4,
        FsType::Xfs => Dependency::MkfsXfs,
        FsType::Swap => Dependency::Mkswap,
        FsType::Vfat => Dependency::MkfsVfat,
        FsType::Exfat => Dependency::MkfsExfat,
        FsType::Ntfs => Dependency::MkfsNtfs,
        FsType::Reiserfs => Dependency::MkfsReiserfs,
        FsType::Jfs => Dependency::MkfsJfs,
        FsType::F2fs => Dependency::MkfsF2fs,
        FsType::Udf => Dependency::MkfsUdf,
        FsType::Nilfs2 => Dependency::MkfsNilfs2,
        FsType::Bcachefs => Dependency::Bcachefs,
        // btrfs has its own module, the rest cannot be created
        FsType::Btrfs | FsType::Iso9660 | FsType::Nfs | FsType::Tmpfs => return None,
    })
}

/// Create a filesystem on a single block device. Btrfs creation lives in
/// the btrfs module since it spans multiple devices.
pub fn run(
    fs_type: FsType,
    device: &str,
    label: Option<&str>,
    uuid: Option<&str>,
    mkfs_options: &[String],
) -> Result<(), CmdError> {
    info!("Creating {fs_type} on '{device}'");

    let dependency = mkfs_dependency(fs_type).ok_or_else(|| CmdError::Failed {
        command: format!("mkfs {fs_type}"),
        stderr: format!("cannot create a {fs_type} filesystem"),
        code: 1,
    })?;

    let mut cmd = dependency.cmd();
    if fs_type == FsType::Bcachefs {
        cmd = cmd.arg("format");
    }

    cmd = match fs_type {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            let mut cmd = cmd.arg("-F");
            if let Some(label) = label {
                cmd = cmd.arg("-L").arg(label);
            }
            if let Some(uuid) = uuid {
                cmd = cmd.arg("-U").arg(uuid);
            }
            cmd
        }
        FsType::Xfs => {
            let mut cmd = cmd.arg("-q").arg("-f");
            if let Some(label) = label {
                cmd = cmd.arg("-L").arg(label);
            }
            if let Some(uuid) = uuid {
                cmd = cmd.arg("-m").arg(format!("uuid={uuid}"));
            }
            cmd
        }
        FsType::Swap => {
            let mut cmd = cmd.arg("--force");
            if let Some(label) = label {
                cmd = cmd.arg("--label").arg(label);
            }
            if let Some(uuid) = uuid {
                cmd = cmd.arg("--uuid").arg(uuid);
            }
            cmd
        }
        FsType::Vfat => {
            if let Some(label) = label {
                cmd = cmd.arg("-n").arg(label);
            }
            cmd
        }
        _ => {
            if let Some(label) = label {
                cmd = cmd.arg("-L").arg(label);
            }
            cmd
        }
    };

    cmd.args(mkfs_options.iter().cloned()).arg(device).run()?;
    Ok(())
}

/// Change the label of an existing filesystem.
pub fn set_label(fs_type: FsType, device: &str, label: &str) -> Result<(), CmdError> {
    info!("Setting label of {fs_type} on '{device}' to '{label}'");

    let cmd: Cmd = match fs_type {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            Dependency::Tune2fs.cmd().arg("-L").arg(label).arg(device)
        }
        FsType::Xfs => Dependency::XfsAdmin
            .cmd()
            .arg("-L")
            .arg(if label.is_empty() { "--" } else { label })
            .arg(device),
        FsType::Swap => Dependency::Swaplabel.cmd().arg("-L").arg(label).arg(device),
        FsType::Vfat => Dependency::Fatlabel.cmd().arg(device).arg(label),
        FsType::Exfat => Dependency::Exfatlabel.cmd().arg(device).arg(label),
        FsType::Ntfs => Dependency::Ntfslabel.cmd().arg(device).arg(label),
        _ => {
            return Err(CmdError::Failed {
                command: format!("set label {fs_type}"),
                stderr: format!("cannot set the label of a {fs_type} filesystem"),
                code: 1,
            })
        }
    };

    cmd.run()?;
    Ok(())
}

/// Change the uuid of an existing filesystem.
pub fn set_uuid(fs_type: FsType, device: &str, uuid: &str) -> Result<(), CmdError> {
    info!("Setting uuid of {fs_type} on '{device}' to '{uuid}'");

    let cmd: Cmd = match fs_type {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            Dependency::Tune2fs.cmd().arg("-U").arg(uuid).arg(device)
        }
        FsType::Xfs => Dependency::XfsAdmin.cmd().arg("-U").arg(uuid).arg(device),
        FsType::Swap => Dependency::Swaplabel.cmd().arg("-U").arg(uuid).arg(device),
        FsType::Btrfs => Dependency::Btrfstune
            .cmd()
            .arg("-f")
            .arg("-U")
            .arg(uuid)
            .arg(device),
        _ => {
            return Err(CmdError::Failed {
                command: format!("set uuid {fs_type}"),
                stderr: format!("cannot set the uuid of a {fs_type} filesystem"),
                code: 1,
            })
        }
    };

    cmd.run()?;
    Ok(())
}

/// Resize an ext* filesystem to `size_bytes`, or to the device size.
pub fn resize2fs(device: &str, size_bytes: Option<u64>) -> Result<(), CmdError> {
    let mut cmd = Dependency::Resize2fs.cmd().arg("-f").arg(device);
    if let Some(size_bytes) = size_bytes {
        cmd = cmd.arg(format!("{}K", size_bytes / 1024));
    }
    cmd.run()?;
    Ok(())
}

/// Grow a mounted xfs to the size of its device.
pub fn xfs_growfs(mount_point: &str, key: &str) -> Result<(), CmdError> {
    Dependency::XfsGrowfs
        .cmd()
        .arg(mount_point)
        .mockup_key(format!("xfs_growfs (device:{key})"))
        .run()?;
    Ok(())
}

pub fn wipefs(device: &str) -> Result<(), CmdError> {
    info!("Wiping signatures on '{device}'");

    Dependency::Wipefs.cmd().arg("--all").arg(device).run()?;
    Ok(())
}

pub fn swapon(device: &str) -> Result<(), CmdError> {
    Dependency::Swapon.cmd().arg(device).run()?;
    Ok(())
}

pub fn swapoff(device: &str) -> Result<(), CmdError> {
    Dependency::Swapoff.cmd().arg(device).run()?;
    Ok(())
}
