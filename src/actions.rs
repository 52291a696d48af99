//! Primitive actions: the smallest mutations the commit engine knows how to
//! render as text and run against the system.

use log::info;

use osutils::{
    btrfs as btrfs_cmd, cryptsetup, dependencies::Dependency, fstab, lvm, mdadm, mkfs,
    mount::EnsureMounted, parted, udevadm,
};
use sysdefs::filesystems::FsType;

use crate::{
    devicegraph::{device::DeviceKind, DeviceGraph, View},
    error::{Result, StorageError},
    sid::Sid,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tense {
    SimplePresent,
    ContinuousPresent,
    SimplePast,
    ContinuousPast,
}

/// Picks the verb form for a tense. Forms: infinitive, present participle,
/// past participle.
fn verb(tense: Tense, forms: [&str; 3]) -> String {
    match tense {
        Tense::SimplePresent => forms[0].to_owned(),
        Tense::ContinuousPresent => forms[1].to_owned(),
        Tense::SimplePast => forms[2].to_owned(),
        Tense::ContinuousPast => format!("Was {}", forms[1].to_lowercase()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    Shrink,
    Grow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReallotMode {
    Extend,
    Reduce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Create { sid: Sid },
    Delete { sid: Sid },
    SetLabel { sid: Sid },
    SetUuid { sid: Sid },
    SetQuota { sid: Sid },
    Resize { sid: Sid, mode: ResizeMode },
    Reallot { sid: Sid, mode: ReallotMode, partner: Sid },
    Mount { sid: Sid },
    Unmount { sid: Sid },
    AddToEtcFstab { sid: Sid },
    RemoveFromEtcFstab { sid: Sid },
    ActivateFilesystem { sid: Sid },
    DeactivateFilesystem { sid: Sid },
    Rename { sid: Sid },
    SetDefaultBtrfsSubvolume { sid: Sid },
    SetNocow { sid: Sid },
    SetQgroupLimits { sid: Sid },
    AddQgroupRelation { sid: Sid, parent: Sid },
    RemoveQgroupRelation { sid: Sid, parent: Sid },
}

/// The two graphs an action may consult: the current state and the wanted
/// state.
#[derive(Clone, Copy)]
pub struct CommitData<'a> {
    pub lhs: &'a DeviceGraph,
    pub rhs: &'a DeviceGraph,
}

impl Action {
    pub fn sid(&self) -> Sid {
        match self {
            Action::Create { sid }
            | Action::Delete { sid }
            | Action::SetLabel { sid }
            | Action::SetUuid { sid }
            | Action::SetQuota { sid }
            | Action::Resize { sid, .. }
            | Action::Reallot { sid, .. }
            | Action::Mount { sid }
            | Action::Unmount { sid }
            | Action::AddToEtcFstab { sid }
            | Action::RemoveFromEtcFstab { sid }
            | Action::ActivateFilesystem { sid }
            | Action::DeactivateFilesystem { sid }
            | Action::Rename { sid }
            | Action::SetDefaultBtrfsSubvolume { sid }
            | Action::SetNocow { sid }
            | Action::SetQgroupLimits { sid }
            | Action::AddQgroupRelation { sid, .. }
            | Action::RemoveQgroupRelation { sid, .. } => *sid,
        }
    }

    /// Whether the device data comes from the current state graph.
    pub fn uses_lhs(&self) -> bool {
        matches!(
            self,
            Action::Delete { .. }
                | Action::Unmount { .. }
                | Action::RemoveFromEtcFstab { .. }
                | Action::DeactivateFilesystem { .. }
                | Action::Reallot { mode: ReallotMode::Reduce, .. }
                | Action::RemoveQgroupRelation { .. }
        )
    }

    /// Tie-break key for the deterministic commit order: destructive
    /// actions first, then constructive, then tuning and mounting.
    pub fn kind_priority(&self) -> u8 {
        match self {
            Action::RemoveFromEtcFstab { .. } => 0,
            Action::Unmount { .. } => 1,
            Action::DeactivateFilesystem { .. } => 2,
            Action::RemoveQgroupRelation { .. } => 3,
            Action::Delete { .. } => 4,
            Action::Reallot { mode: ReallotMode::Reduce, .. } => 5,
            Action::Resize { mode: ResizeMode::Shrink, .. } => 6,
            Action::Rename { .. } => 7,
            Action::Create { .. } => 8,
            Action::Resize { mode: ResizeMode::Grow, .. } => 9,
            Action::Reallot { mode: ReallotMode::Extend, .. } => 10,
            Action::SetLabel { .. } => 11,
            Action::SetUuid { .. } => 12,
            Action::SetQuota { .. } => 13,
            Action::SetDefaultBtrfsSubvolume { .. } => 14,
            Action::SetNocow { .. } => 15,
            Action::SetQgroupLimits { .. } => 16,
            Action::AddQgroupRelation { .. } => 17,
            Action::Mount { .. } => 18,
            Action::ActivateFilesystem { .. } => 19,
            Action::AddToEtcFstab { .. } => 20,
        }
    }

    fn describe(&self, data: CommitData) -> String {
        let graph = if self.uses_lhs() { data.lhs } else { data.rhs };
        let sid = self.sid();

        let Ok(device) = graph.device(sid) else {
            return format!("device sid {sid}");
        };

        match &device.kind {
            DeviceKind::Filesystem { fs, .. } => {
                let devices: Vec<String> = graph
                    .filesystem_devices(sid)
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|(member, _)| graph.device(*member).ok())
                    .filter_map(|d| d.blk().map(|blk| blk.name.clone()))
                    .collect();
                format!("{} on {}", fs.fs_type, devices.join(", "))
            }
            DeviceKind::MountPoint(mp) => {
                let described = graph
                    .parents(sid, View::Classic)
                    .ok()
                    .and_then(|parents| parents.first().copied())
                    .and_then(|fs| graph.device(fs).ok())
                    .map(|fs| fs.display_name())
                    .unwrap_or_default();
                format!("{described} at {}", mp.path)
            }
            _ => device.display_name(),
        }
    }

    /// Human-readable text in the requested tense.
    pub fn text(&self, tense: Tense, data: CommitData) -> String {
        let what = self.describe(data);

        match self {
            Action::Create { .. } => {
                format!("{} {}", verb(tense, ["Create", "Creating", "Created"]), what)
            }
            Action::Delete { .. } => {
                format!("{} {}", verb(tense, ["Delete", "Deleting", "Deleted"]), what)
            }
            Action::SetLabel { sid } => {
                let label = data
                    .rhs
                    .device(*sid)
                    .ok()
                    .and_then(|d| d.as_filesystem().ok())
                    .map(|fs| fs.label.clone())
                    .unwrap_or_default();
                format!(
                    "{} label of {} to '{}'",
                    verb(tense, ["Set", "Setting", "Set"]),
                    what,
                    label
                )
            }
            Action::SetUuid { .. } => {
                format!("{} uuid of {}", verb(tense, ["Set", "Setting", "Set"]), what)
            }
            Action::SetQuota { sid } => {
                let enable = data
                    .rhs
                    .device(*sid)
                    .ok()
                    .and_then(|d| d.as_btrfs().ok())
                    .map(|(_, btrfs)| btrfs.quota)
                    .unwrap_or(false);
                if enable {
                    format!(
                        "{} quota on {}",
                        verb(tense, ["Enable", "Enabling", "Enabled"]),
                        what
                    )
                } else {
                    format!(
                        "{} quota on {}",
                        verb(tense, ["Disable", "Disabling", "Disabled"]),
                        what
                    )
                }
            }
            Action::Resize { mode, .. } => {
                let forms = match mode {
                    ResizeMode::Shrink => ["Shrink", "Shrinking", "Shrunk"],
                    ResizeMode::Grow => ["Grow", "Growing", "Grown"],
                };
                format!("{} {}", verb(tense, forms), what)
            }
            Action::Reallot { mode, partner, .. } => {
                let partner_name = data
                    .rhs
                    .device(*partner)
                    .or_else(|_| data.lhs.device(*partner))
                    .map(|d| d.display_name())
                    .unwrap_or_default();
                match mode {
                    ReallotMode::Extend => format!(
                        "{} {} by {}",
                        verb(tense, ["Extend", "Extending", "Extended"]),
                        what,
                        partner_name
                    ),
                    ReallotMode::Reduce => format!(
                        "{} {} by {}",
                        verb(tense, ["Reduce", "Reducing", "Reduced"]),
                        what,
                        partner_name
                    ),
                }
            }
            Action::Mount { .. } => {
                format!("{} {}", verb(tense, ["Mount", "Mounting", "Mounted"]), what)
            }
            Action::Unmount { .. } => format!(
                "{} {}",
                verb(tense, ["Unmount", "Unmounting", "Unmounted"]),
                what
            ),
            Action::AddToEtcFstab { .. } => format!(
                "{} {} to /etc/fstab",
                verb(tense, ["Add", "Adding", "Added"]),
                what
            ),
            Action::RemoveFromEtcFstab { .. } => format!(
                "{} {} from /etc/fstab",
                verb(tense, ["Remove", "Removing", "Removed"]),
                what
            ),
            Action::ActivateFilesystem { .. } => format!(
                "{} swap {}",
                verb(tense, ["Activate", "Activating", "Activated"]),
                what
            ),
            Action::DeactivateFilesystem { .. } => format!(
                "{} swap {}",
                verb(tense, ["Deactivate", "Deactivating", "Deactivated"]),
                what
            ),
            Action::Rename { sid } => {
                let old = data.lhs.device(*sid).map(|d| d.display_name()).unwrap_or_default();
                format!(
                    "{} {} to {}",
                    verb(tense, ["Rename", "Renaming", "Renamed"]),
                    old,
                    what
                )
            }
            Action::SetDefaultBtrfsSubvolume { .. } => format!(
                "{} default subvolume to {}",
                verb(tense, ["Set", "Setting", "Set"]),
                what
            ),
            Action::SetNocow { .. } => format!(
                "{} copy-on-write for {}",
                verb(tense, ["Disable", "Disabling", "Disabled"]),
                what
            ),
            Action::SetQgroupLimits { .. } => format!(
                "{} limits of {}",
                verb(tense, ["Set", "Setting", "Set"]),
                what
            ),
            Action::AddQgroupRelation { .. } => format!(
                "{} {} to a parent qgroup",
                verb(tense, ["Assign", "Assigning", "Assigned"]),
                what
            ),
            Action::RemoveQgroupRelation { .. } => format!(
                "{} {} from a parent qgroup",
                verb(tense, ["Unassign", "Unassigning", "Unassigned"]),
                what
            ),
        }
    }
}

// Execution helpers.

fn blk_name(graph: &DeviceGraph, sid: Sid) -> Result<String> {
    graph
        .device(sid)?
        .blk()
        .map(|blk| blk.name.clone())
        .ok_or(StorageError::NullReference("device without blk data"))
}

/// First member device of a filesystem, the anchor for mounted operations.
fn fs_primary_device(graph: &DeviceGraph, filesystem: Sid) -> Result<String> {
    let members = graph.filesystem_devices(filesystem)?;
    let (sid, _) = members
        .first()
        .ok_or(StorageError::NullReference("filesystem without devices"))?;
    blk_name(graph, *sid)
}

/// An active mount point of the filesystem in the current state, if any.
fn fs_mounted_path(graph: &DeviceGraph, filesystem: Sid) -> Option<String> {
    let children = graph.children(filesystem, View::Classic).ok()?;
    children.into_iter().find_map(|child| {
        let mp = graph.device(child).ok()?.as_mount_point().ok()?;
        (mp.active && mp.path != "swap").then(|| mp.path.clone())
    })
}

fn ensure_mounted(data: CommitData, filesystem: Sid) -> Result<EnsureMounted> {
    let graph = if data.rhs.has_device(filesystem) { data.rhs } else { data.lhs };
    let device = fs_primary_device(graph, filesystem)?;
    let existing = data
        .lhs
        .has_device(filesystem)
        .then(|| fs_mounted_path(data.lhs, filesystem))
        .flatten();
    Ok(EnsureMounted::new(
        &device,
        existing.as_deref().map(std::path::Path::new),
    )?)
}

/// The device a partition's partition table sits on.
fn partition_disk(graph: &DeviceGraph, partition: Sid) -> Result<String> {
    let table = *graph
        .parents(partition, View::Classic)?
        .first()
        .ok_or(StorageError::NullReference("partition without table"))?;
    blk_name(graph, graph.partitionable_of(table)?)
}

/// The btrfs a subvolume or qgroup hangs off, searched in the graph the
/// action reads from.
fn owning_btrfs(graph: &DeviceGraph, sid: Sid) -> Result<Sid> {
    if graph.device(sid)?.as_btrfs_subvolume().is_ok() {
        return graph.btrfs_of_subvolume(sid);
    }
    let parents = graph.parents(sid, View::Classic)?;
    parents
        .into_iter()
        .find(|parent| graph.device(*parent).map(|d| d.as_btrfs().is_ok()).unwrap_or(false))
        .ok_or(StorageError::NullReference("qgroup without btrfs"))
}

fn fstab_device_spec(graph: &DeviceGraph, filesystem: Sid) -> Result<String> {
    match &graph.device(filesystem)?.kind {
        DeviceKind::Nfs { server, path } => Ok(format!("{server}:{path}")),
        DeviceKind::Tmpfs => Ok("tmpfs".to_owned()),
        DeviceKind::Filesystem { fs, .. } if !fs.uuid.is_empty() => {
            Ok(format!("UUID={}", fs.uuid))
        }
        _ => fs_primary_device(graph, filesystem),
    }
}

fn mount_source(graph: &DeviceGraph, filesystem: Sid) -> Result<String> {
    match &graph.device(filesystem)?.kind {
        DeviceKind::Nfs { server, path } => Ok(format!("{server}:{path}")),
        DeviceKind::Tmpfs => Ok("tmpfs".to_owned()),
        _ => fs_primary_device(graph, filesystem),
    }
}

fn fs_type_name(graph: &DeviceGraph, filesystem: Sid) -> Result<String> {
    match &graph.device(filesystem)?.kind {
        DeviceKind::Nfs { .. } => Ok("nfs".to_owned()),
        DeviceKind::Tmpfs => Ok("tmpfs".to_owned()),
        DeviceKind::Filesystem { fs, .. } => Ok(fs.fs_type.to_string()),
        _ => Err(StorageError::WrongType {
            sid: filesystem,
            expected: "a filesystem",
            found: graph.device(filesystem)?.kind.variant_name(),
        }),
    }
}

impl Action {
    /// Run the action against the system.
    pub fn execute(&self, data: CommitData) -> Result<()> {
        match self {
            Action::Create { sid } => execute_create(data, *sid),
            Action::Delete { sid } => execute_delete(data, *sid),

            Action::SetLabel { sid } => {
                let fs = data.rhs.device(*sid)?.as_filesystem()?.clone();
                let device = fs_primary_device(data.rhs, *sid)?;
                if fs.fs_type == FsType::Btrfs {
                    btrfs_cmd::set_label(&device, &fs.label)?;
                } else {
                    mkfs::set_label(fs.fs_type, &device, &fs.label)?;
                }
                Ok(())
            }

            Action::SetUuid { sid } => {
                let fs = data.rhs.device(*sid)?.as_filesystem()?.clone();
                let device = fs_primary_device(data.rhs, *sid)?;
                mkfs::set_uuid(fs.fs_type, &device, &fs.uuid)?;
                Ok(())
            }

            Action::SetQuota { sid } => {
                let enable = data.rhs.device(*sid)?.as_btrfs()?.1.quota;
                let key = fs_primary_device(data.rhs, *sid)?;
                let mounted = ensure_mounted(data, *sid)?;
                let path = mounted.mount_point().to_string_lossy().to_string();
                if enable {
                    btrfs_cmd::quota_enable(&path, &key)?;
                } else {
                    btrfs_cmd::quota_disable(&path, &key)?;
                }
                Ok(())
            }

            Action::Resize { sid, mode } => execute_resize(data, *sid, *mode),
            Action::Reallot { sid, mode, partner } => execute_reallot(data, *sid, *mode, *partner),

            Action::Mount { sid } => {
                let mp = data.rhs.device(*sid)?.as_mount_point()?.clone();
                let filesystem = *data
                    .rhs
                    .parents(*sid, View::Classic)?
                    .first()
                    .ok_or(StorageError::NullReference("mount point without filesystem"))?;
                let source = mount_source(data.rhs, filesystem)?;
                let fs_type = fs_type_name(data.rhs, filesystem)?;
                osutils::mount::mount(
                    &source,
                    std::path::Path::new(&mp.path),
                    Some(fs_type.as_str()),
                    &mp.mount_options,
                )?;
                Ok(())
            }

            Action::Unmount { sid } => {
                let mp = data.lhs.device(*sid)?.as_mount_point()?.clone();
                let filesystem = *data
                    .lhs
                    .parents(*sid, View::Classic)?
                    .first()
                    .ok_or(StorageError::NullReference("mount point without filesystem"))?;
                let source = mount_source(data.lhs, filesystem)?;
                osutils::mount::umount(&source, std::path::Path::new(&mp.path))?;
                Ok(())
            }

            Action::AddToEtcFstab { sid } => {
                let mp = data.rhs.device(*sid)?.as_mount_point()?.clone();
                let filesystem = *data
                    .rhs
                    .parents(*sid, View::Classic)?
                    .first()
                    .ok_or(StorageError::NullReference("mount point without filesystem"))?;
                fstab::add_entry(
                    "/etc/fstab",
                    &fstab::FstabEntry {
                        device: fstab_device_spec(data.rhs, filesystem)?,
                        mount_point: mp.path.clone(),
                        fs_type: fs_type_name(data.rhs, filesystem)?,
                        options: mp.mount_options.clone(),
                        freq: mp.freq,
                        passno: mp.passno,
                    },
                )?;
                Ok(())
            }

            Action::RemoveFromEtcFstab { sid } => {
                let mp = data.lhs.device(*sid)?.as_mount_point()?.clone();
                fstab::remove_entry("/etc/fstab", &mp.path)?;
                Ok(())
            }

            Action::ActivateFilesystem { sid } => {
                let filesystem = *data
                    .rhs
                    .parents(*sid, View::Classic)?
                    .first()
                    .ok_or(StorageError::NullReference("mount point without filesystem"))?;
                mkfs::swapon(&fs_primary_device(data.rhs, filesystem)?)?;
                Ok(())
            }

            Action::DeactivateFilesystem { sid } => {
                let filesystem = *data
                    .lhs
                    .parents(*sid, View::Classic)?
                    .first()
                    .ok_or(StorageError::NullReference("mount point without filesystem"))?;
                mkfs::swapoff(&fs_primary_device(data.lhs, filesystem)?)?;
                Ok(())
            }

            Action::Rename { sid } => {
                match (&data.lhs.device(*sid)?.kind, &data.rhs.device(*sid)?.kind) {
                    (
                        DeviceKind::LvmVg { vg_name: old, .. },
                        DeviceKind::LvmVg { vg_name: new, .. },
                    ) => {
                        lvm::vgrename(old, new)?;
                        Ok(())
                    }
                    (
                        DeviceKind::LvmLv { lv_name: old, .. },
                        DeviceKind::LvmLv { lv_name: new, .. },
                    ) => {
                        let vg = *data
                            .rhs
                            .parents(*sid, View::Classic)?
                            .first()
                            .ok_or(StorageError::NullReference("lv without vg"))?;
                        let (vg_name, _, _) = data.rhs.device(vg)?.as_lvm_vg()?;
                        lvm::lvrename(vg_name, old, new)?;
                        Ok(())
                    }
                    _ => Err(StorageError::InvariantViolation(format!(
                        "device sid {sid} cannot be renamed"
                    ))),
                }
            }

            Action::SetDefaultBtrfsSubvolume { sid } => {
                let id = data.rhs.device(*sid)?.as_btrfs_subvolume()?.id;
                let filesystem = owning_btrfs(data.rhs, *sid)?;
                let key = fs_primary_device(data.rhs, filesystem)?;
                let mounted = ensure_mounted(data, filesystem)?;
                btrfs_cmd::subvolume_set_default(
                    id,
                    &mounted.mount_point().to_string_lossy(),
                    &key,
                )?;
                Ok(())
            }

            Action::SetNocow { sid } => {
                let subvolume = data.rhs.device(*sid)?.as_btrfs_subvolume()?.clone();
                let filesystem = owning_btrfs(data.rhs, *sid)?;
                let key = fs_primary_device(data.rhs, filesystem)?;
                let mounted = ensure_mounted(data, filesystem)?;
                let flag = if subvolume.nocow { "+C" } else { "-C" };
                Dependency::Chattr
                    .cmd()
                    .arg(flag)
                    .arg(format!(
                        "{}/{}",
                        mounted.mount_point().to_string_lossy(),
                        subvolume.path
                    ))
                    .mockup_key(format!("chattr {flag} {} (device:{key})", subvolume.path))
                    .run()?;
                Ok(())
            }

            Action::SetQgroupLimits { sid } => {
                let qgroup = data.rhs.device(*sid)?.as_btrfs_qgroup()?.clone();
                let filesystem = owning_btrfs(data.rhs, *sid)?;
                let key = fs_primary_device(data.rhs, filesystem)?;
                let mounted = ensure_mounted(data, filesystem)?;
                btrfs_cmd::qgroup_limit(
                    qgroup.id,
                    qgroup.referenced_limit,
                    qgroup.exclusive_limit,
                    &mounted.mount_point().to_string_lossy(),
                    &key,
                )?;
                Ok(())
            }

            Action::AddQgroupRelation { sid, parent } => {
                let child = data.rhs.device(*sid)?.as_btrfs_qgroup()?.id;
                let parent = data.rhs.device(*parent)?.as_btrfs_qgroup()?.id;
                let filesystem = owning_btrfs(data.rhs, *sid)?;
                let key = fs_primary_device(data.rhs, filesystem)?;
                let mounted = ensure_mounted(data, filesystem)?;
                btrfs_cmd::qgroup_assign(
                    child,
                    parent,
                    &mounted.mount_point().to_string_lossy(),
                    &key,
                )?;
                Ok(())
            }

            Action::RemoveQgroupRelation { sid, parent } => {
                let child = data.lhs.device(*sid)?.as_btrfs_qgroup()?.id;
                let parent = data.lhs.device(*parent)?.as_btrfs_qgroup()?.id;
                let filesystem = owning_btrfs(data.lhs, *sid)?;
                let key = fs_primary_device(data.lhs, filesystem)?;
                let mounted = ensure_mounted(data, filesystem)?;
                btrfs_cmd::qgroup_remove(
                    child,
                    parent,
                    &mounted.mount_point().to_string_lossy(),
                    &key,
                )?;
                Ok(())
            }
        }
    }
}

fn execute_create(data: CommitData, sid: Sid) -> Result<()> {
    let device = data.rhs.device(sid)?.clone();

    match &device.kind {
        DeviceKind::PartitionTable { pt_type, .. } => {
            let partitionable = blk_name(data.rhs, data.rhs.partitionable_of(sid)?)?;
            parted::mklabel(&partitionable, pt_type.parted_name())?;
            udevadm::settle()?;
            Ok(())
        }

        DeviceKind::Partition { blk, .. } => {
            let disk = partition_disk(data.rhs, sid)?;
            parted::mkpart(&disk, "primary", blk.region.start(), blk.region.end())?;
            udevadm::settle()?;
            Ok(())
        }

        DeviceKind::Filesystem { fs, btrfs } => {
            if let Some(btrfs) = btrfs {
                let devices: Vec<String> = data
                    .rhs
                    .filesystem_devices(sid)?
                    .iter()
                    .map(|(member, _)| blk_name(data.rhs, *member))
                    .collect::<Result<_>>()?;
                // The label is applied by a separate SetLabel action.
                let uuid = btrfs_cmd::mkfs(
                    &devices,
                    btrfs.metadata_raid_level,
                    btrfs.data_raid_level,
                    (!fs.uuid.is_empty()).then_some(fs.uuid.as_str()),
                    &fs.mkfs_options,
                )?;
                info!("created btrfs with uuid {uuid}");
            } else {
                let device = fs_primary_device(data.rhs, sid)?;
                mkfs::run(
                    fs.fs_type,
                    &device,
                    (!fs.label.is_empty()).then_some(fs.label.as_str()),
                    (!fs.uuid.is_empty()).then_some(fs.uuid.as_str()),
                    &fs.mkfs_options,
                )?;
            }
            Ok(())
        }

        DeviceKind::LvmPv { .. } => {
            let blk = *data
                .rhs
                .parents(sid, View::Classic)?
                .first()
                .ok_or(StorageError::NullReference("pv without block device"))?;
            lvm::pvcreate(&blk_name(data.rhs, blk)?)?;
            Ok(())
        }

        DeviceKind::LvmVg { vg_name, .. } => {
            let mut devices = Vec::new();
            for pv in data.rhs.parents(sid, View::Classic)? {
                let blk = *data
                    .rhs
                    .parents(pv, View::Classic)?
                    .first()
                    .ok_or(StorageError::NullReference("pv without block device"))?;
                devices.push(blk_name(data.rhs, blk)?);
            }
            devices.sort();
            lvm::vgcreate(vg_name, &devices)?;
            Ok(())
        }

        DeviceKind::LvmLv { blk, lv_name, .. } => {
            let vg = *data
                .rhs
                .parents(sid, View::Classic)?
                .first()
                .ok_or(StorageError::NullReference("lv without vg"))?;
            let (vg_name, _, _) = data.rhs.device(vg)?.as_lvm_vg()?;
            lvm::lvcreate(vg_name, lv_name, blk.size.0)?;
            Ok(())
        }

        DeviceKind::Luks { dm_name, encryption_type, uuid, label, cipher, key_size, .. } => {
            let blk = *data
                .rhs
                .parents(sid, View::Classic)?
                .first()
                .ok_or(StorageError::NullReference("luks without block device"))?;
            let underlying = blk_name(data.rhs, blk)?;
            cryptsetup::luks_format(
                &underlying,
                *encryption_type == crate::devicegraph::device::EncryptionType::Luks2,
                (!cipher.is_empty()).then_some(cipher.as_str()),
                (*key_size > 0).then_some(*key_size),
                (!label.is_empty()).then_some(label.as_str()),
                (!uuid.is_empty()).then_some(uuid.as_str()),
            )?;
            cryptsetup::luks_open(&underlying, dm_name)?;
            Ok(())
        }

        DeviceKind::BitlockerV2 { dm_name, .. } => {
            if !crate::environment::cryptsetup_for_bitlocker() {
                return Err(StorageError::InvariantViolation(
                    "opening BitLocker volumes with cryptsetup is disabled".to_owned(),
                ));
            }
            let blk = *data
                .rhs
                .parents(sid, View::Classic)?
                .first()
                .ok_or(StorageError::NullReference("bitlocker without block device"))?;
            cryptsetup::bitlk_open(&blk_name(data.rhs, blk)?, dm_name)?;
            Ok(())
        }

        DeviceKind::Md { blk, level, .. } => {
            let mut members = Vec::new();
            let mut spares = 0;
            for holder in data.rhs.holders_in(sid, View::All)? {
                if let crate::devicegraph::holder::HolderKind::MdUser { spare, .. } = holder.kind {
                    members.push(blk_name(data.rhs, holder.source)?);
                    if spare {
                        spares += 1;
                    }
                }
            }
            members.sort();
            mdadm::create(&blk.name, *level, &members, spares)?;
            udevadm::settle()?;
            Ok(())
        }

        DeviceKind::BtrfsSubvolume(subvolume) => {
            let filesystem = owning_btrfs(data.rhs, sid)?;
            let key = fs_primary_device(data.rhs, filesystem)?;
            let mounted = ensure_mounted(data, filesystem)?;
            btrfs_cmd::subvolume_create(
                &format!(
                    "{}/{}",
                    mounted.mount_point().to_string_lossy(),
                    subvolume.path
                ),
                &format!("{} (device:{key})", subvolume.path),
            )?;
            Ok(())
        }

        DeviceKind::BtrfsQgroup(qgroup) => {
            let filesystem = owning_btrfs(data.rhs, sid)?;
            let key = fs_primary_device(data.rhs, filesystem)?;
            let mounted = ensure_mounted(data, filesystem)?;
            btrfs_cmd::qgroup_create(
                qgroup.id,
                &mounted.mount_point().to_string_lossy(),
                &key,
            )?;
            Ok(())
        }

        _ => Err(StorageError::InvariantViolation(format!(
            "cannot create a {} (sid {sid})",
            device.kind.variant_name()
        ))),
    }
}

fn execute_delete(data: CommitData, sid: Sid) -> Result<()> {
    let device = data.lhs.device(sid)?.clone();

    match &device.kind {
        DeviceKind::PartitionTable { .. } => {
            let partitionable = blk_name(data.lhs, data.lhs.partitionable_of(sid)?)?;
            mkfs::wipefs(&partitionable)?;
            Ok(())
        }

        DeviceKind::Partition { blk, number, .. } => {
            let disk = partition_disk(data.lhs, sid)?;
            parted::rm(&disk, *number)?;
            udevadm::settle()?;
            info!("removed partition {}", blk.name);
            Ok(())
        }

        DeviceKind::Filesystem { .. } => {
            for (member, _) in data.lhs.filesystem_devices(sid)? {
                mkfs::wipefs(&blk_name(data.lhs, member)?)?;
            }
            Ok(())
        }

        DeviceKind::LvmPv { .. } => {
            let blk = *data
                .lhs
                .parents(sid, View::Classic)?
                .first()
                .ok_or(StorageError::NullReference("pv without block device"))?;
            lvm::pvremove(&blk_name(data.lhs, blk)?)?;
            Ok(())
        }

        DeviceKind::LvmVg { vg_name, .. } => {
            lvm::vgremove(vg_name)?;
            Ok(())
        }

        DeviceKind::LvmLv { lv_name, .. } => {
            let vg = *data
                .lhs
                .parents(sid, View::Classic)?
                .first()
                .ok_or(StorageError::NullReference("lv without vg"))?;
            let (vg_name, _, _) = data.lhs.device(vg)?.as_lvm_vg()?;
            lvm::lvremove(vg_name, lv_name)?;
            Ok(())
        }

        DeviceKind::BitlockerV2 { dm_name, .. } => {
            cryptsetup::close(dm_name)?;
            Ok(())
        }

        DeviceKind::Luks { dm_name, .. } => {
            cryptsetup::close(dm_name)?;
            let blk = *data
                .lhs
                .parents(sid, View::Classic)?
                .first()
                .ok_or(StorageError::NullReference("luks without block device"))?;
            mkfs::wipefs(&blk_name(data.lhs, blk)?)?;
            Ok(())
        }

        DeviceKind::Md { blk, .. } => {
            mdadm::stop(&blk.name)?;
            for holder in data.lhs.holders_in(sid, View::All)? {
                if matches!(
                    holder.kind,
                    crate::devicegraph::holder::HolderKind::MdUser { .. }
                ) {
                    mdadm::zero_superblock(&blk_name(data.lhs, holder.source)?)?;
                }
            }
            Ok(())
        }

        DeviceKind::BtrfsSubvolume(subvolume) => {
            let filesystem = owning_btrfs(data.lhs, sid)?;
            let key = fs_primary_device(data.lhs, filesystem)?;
            let mounted = ensure_mounted(data, filesystem)?;
            btrfs_cmd::subvolume_delete(
                &format!(
                    "{}/{}",
                    mounted.mount_point().to_string_lossy(),
                    subvolume.path
                ),
                &format!("{} (device:{key})", subvolume.path),
            )?;
            Ok(())
        }

        DeviceKind::BtrfsQgroup(qgroup) => {
            let filesystem = owning_btrfs(data.lhs, sid)?;
            let key = fs_primary_device(data.lhs, filesystem)?;
            let mounted = ensure_mounted(data, filesystem)?;
            btrfs_cmd::qgroup_destroy(
                qgroup.id,
                &mounted.mount_point().to_string_lossy(),
                &key,
            )?;
            Ok(())
        }

        _ => Err(StorageError::InvariantViolation(format!(
            "cannot delete a {} (sid {sid})",
            device.kind.variant_name()
        ))),
    }
}

fn execute_resize(data: CommitData, sid: Sid, mode: ResizeMode) -> Result<()> {
    let rhs_device = data.rhs.device(sid)?.clone();

    match &rhs_device.kind {
        DeviceKind::Partition { blk, number, .. } => {
            let disk = partition_disk(data.rhs, sid)?;
            parted::resizepart(&disk, *number, blk.region.end())?;
            udevadm::settle()?;
            Ok(())
        }

        DeviceKind::LvmLv { blk, lv_name, .. } => {
            let vg = *data
                .rhs
                .parents(sid, View::Classic)?
                .first()
                .ok_or(StorageError::NullReference("lv without vg"))?;
            let (vg_name, _, _) = data.rhs.device(vg)?.as_lvm_vg()?;
            lvm::lvresize(vg_name, lv_name, blk.size.0)?;
            Ok(())
        }

        DeviceKind::Filesystem { fs, btrfs } => {
            if btrfs.is_some() {
                // Find the member whose size changes; its devid anchors the
                // resize command.
                let members = data.rhs.filesystem_devices(sid)?;
                let (member, devid) = members
                    .iter()
                    .find(|(member, _)| {
                        let old = data.lhs.device(*member).ok().and_then(|d| d.blk().map(|b| b.size));
                        let new = data.rhs.device(*member).ok().and_then(|d| d.blk().map(|b| b.size));
                        old != new
                    })
                    .or_else(|| members.first())
                    .ok_or(StorageError::NullReference("filesystem without devices"))?;

                let key = fs_primary_device(data.rhs, sid)?;
                let mounted = ensure_mounted(data, sid)?;
                let size = match mode {
                    ResizeMode::Shrink => Some(
                        data.rhs
                            .device(*member)?
                            .blk()
                            .map(|blk| blk.size.0)
                            .unwrap_or(0),
                    ),
                    ResizeMode::Grow => None,
                };
                btrfs_cmd::filesystem_resize(
                    *devid,
                    size,
                    &mounted.mount_point().to_string_lossy(),
                    &key,
                )?;
                return Ok(());
            }

            let device = fs_primary_device(data.rhs, sid)?;
            match fs.fs_type {
                FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
                    let size = match mode {
                        ResizeMode::Shrink => data
                            .rhs
                            .filesystem_devices(sid)?
                            .first()
                            .and_then(|(member, _)| data.rhs.device(*member).ok())
                            .and_then(|d| d.blk().map(|blk| blk.size.0)),
                        ResizeMode::Grow => None,
                    };
                    mkfs::resize2fs(&device, size)?;
                }
                FsType::Xfs => {
                    if mode == ResizeMode::Shrink {
                        return Err(StorageError::InvariantViolation(
                            "cannot shrink an xfs filesystem".to_owned(),
                        ));
                    }
                    let key = device.clone();
                    let mounted = ensure_mounted(data, sid)?;
                    mkfs::xfs_growfs(&mounted.mount_point().to_string_lossy(), &key)?;
                }
                FsType::Swap => {
                    mkfs::run(FsType::Swap, &device, None, None, &[])?;
                }
                _ => {
                    return Err(StorageError::InvariantViolation(format!(
                        "cannot resize a {} filesystem",
                        fs.fs_type
                    )))
                }
            }
            Ok(())
        }

        _ => Err(StorageError::InvariantViolation(format!(
            "cannot resize a {} (sid {sid})",
            rhs_device.kind.variant_name()
        ))),
    }
}

fn execute_reallot(data: CommitData, sid: Sid, mode: ReallotMode, partner: Sid) -> Result<()> {
    let graph = match mode {
        ReallotMode::Extend => data.rhs,
        ReallotMode::Reduce => data.lhs,
    };
    let device = graph.device(sid)?.clone();

    match &device.kind {
        DeviceKind::LvmVg { vg_name, .. } => {
            // The partner is the pv; the tool wants its block device.
            let blk = *graph
                .parents(partner, View::Classic)?
                .first()
                .ok_or(StorageError::NullReference("pv without block device"))?;
            let device = blk_name(graph, blk)?;
            match mode {
                ReallotMode::Extend => lvm::vgextend(vg_name, &device)?,
                ReallotMode::Reduce => lvm::vgreduce(vg_name, &device)?,
            }
            Ok(())
        }

        DeviceKind::Filesystem { btrfs: Some(_), .. } => {
            let partner_name = blk_name(graph, partner)?;
            let key = fs_primary_device(graph, sid)?;
            let mounted = ensure_mounted(data, sid)?;
            let path = mounted.mount_point().to_string_lossy().to_string();
            match mode {
                ReallotMode::Extend => btrfs_cmd::device_add(&partner_name, &path, &key)?,
                ReallotMode::Reduce => btrfs_cmd::device_remove(&partner_name, &path, &key)?,
            }
            Ok(())
        }

        DeviceKind::Md { blk, .. } => {
            let partner_name = blk_name(graph, partner)?;
            match mode {
                ReallotMode::Extend => mdadm::add(&blk.name, &partner_name)?,
                ReallotMode::Reduce => mdadm::remove(&blk.name, &partner_name)?,
            }
            Ok(())
        }

        _ => Err(StorageError::InvariantViolation(format!(
            "cannot reallot a {} (sid {sid})",
            device.kind.variant_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysdefs::bytes::{ByteCount, GIB};
    use sysdefs::region::Region;

    #[test]
    fn test_texts_in_all_tenses() {
        let mut rhs = DeviceGraph::new();
        let disk = rhs.create_disk("/dev/sda", ByteCount(32 * GIB));
        let table = rhs
            .create_partition_table(disk, crate::devicegraph::device::PtType::Gpt)
            .unwrap();
        let partition = rhs
            .create_partition(table, Region::new(2048, GIB / 512, 512).unwrap())
            .unwrap();
        let filesystem = rhs.create_filesystem(partition, FsType::Btrfs).unwrap();
        let lhs = DeviceGraph::new();
        let data = CommitData { lhs: &lhs, rhs: &rhs };

        let create = Action::Create { sid: filesystem };
        assert_eq!(
            create.text(Tense::SimplePresent, data),
            "Create btrfs on /dev/sda1"
        );
        assert_eq!(
            create.text(Tense::ContinuousPresent, data),
            "Creating btrfs on /dev/sda1"
        );
        assert_eq!(
            create.text(Tense::SimplePast, data),
            "Created btrfs on /dev/sda1"
        );
        assert_eq!(
            create.text(Tense::ContinuousPast, data),
            "Was creating btrfs on /dev/sda1"
        );
    }

    #[test]
    fn test_mount_point_text() {
        let mut rhs = DeviceGraph::new();
        let disk = rhs.create_disk("/dev/sdb", ByteCount(32 * GIB));
        let table = rhs
            .create_partition_table(disk, crate::devicegraph::device::PtType::Gpt)
            .unwrap();
        let partition = rhs
            .create_partition(table, Region::new(2048, GIB / 512, 512).unwrap())
            .unwrap();
        let filesystem = rhs.create_filesystem(partition, FsType::Ext4).unwrap();
        let mount_point = rhs.create_mount_point(filesystem, "/home").unwrap();
        let lhs = DeviceGraph::new();
        let data = CommitData { lhs: &lhs, rhs: &rhs };

        assert_eq!(
            Action::Mount { sid: mount_point }.text(Tense::ContinuousPresent, data),
            "Mounting ext4 at /home"
        );
    }

    #[test]
    fn test_priorities_order_destructive_first() {
        let sid = Sid(1);
        assert!(
            Action::RemoveFromEtcFstab { sid }.kind_priority()
                < Action::Unmount { sid }.kind_priority()
        );
        assert!(
            Action::Unmount { sid }.kind_priority() < Action::Delete { sid }.kind_priority()
        );
        assert!(
            Action::Create { sid }.kind_priority() < Action::Mount { sid }.kind_priority()
        );
        assert!(
            Action::Mount { sid }.kind_priority()
                < Action::AddToEtcFstab { sid }.kind_priority()
        );
    }
}
