//! Btrfs specifics: multi-device membership, the subvolume tree, and the
//! qgroup model with its relation edges.

use bitflags::bitflags;
use log::debug;

use osutils::btrfs::QgroupId;
use sysdefs::bytes::ByteCount;

use crate::{
    devicegraph::{
        device::{BtrfsQgroupData, BtrfsSubvolumeData, DeviceKind},
        holder::HolderKind,
        DeviceGraph, View,
    },
    error::{Result, StorageError},
    sid::Sid,
};

bitflags! {
    /// Why a resize is limited or impossible.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ResizeReasons: u32 {
        const SHRINK_NOT_SUPPORTED_BY_MULTIDEVICE_FILESYSTEM = 1 << 0;
        const FILESYSTEM_FULL = 1 << 1;
        const RESIZE_NOT_SUPPORTED_BY_FILESYSTEM = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeInfo {
    pub resize_ok: bool,
    pub reasons: ResizeReasons,
    pub min_size: ByteCount,
    pub max_size: ByteCount,
}

impl DeviceGraph {
    /// The block devices backing a filesystem, with their btrfs devid,
    /// ordered by devid. Journal devices are not members.
    pub fn filesystem_devices(&self, filesystem: Sid) -> Result<Vec<(Sid, u64)>> {
        let mut members = Vec::new();
        for holder in self.holders_in(filesystem, View::All)? {
            if let HolderKind::FilesystemUser { devid, journal: false } = holder.kind {
                members.push((holder.source, devid));
            }
        }
        members.sort_by_key(|(_, devid)| *devid);
        Ok(members)
    }

    /// Add a member device to a btrfs.
    pub fn btrfs_add_device(&mut self, filesystem: Sid, blk_device: Sid) -> Result<Sid> {
        self.device(filesystem)?.as_btrfs()?;

        let children = self.children(blk_device, View::All)?;
        if !children.is_empty() {
            return Err(StorageError::WrongNumberOfChildren {
                expected: 0,
                found: children.len(),
            });
        }

        let next_devid = self
            .filesystem_devices(filesystem)?
            .iter()
            .map(|(_, devid)| *devid)
            .max()
            .unwrap_or(0)
            + 1;
        self.add_holder(
            blk_device,
            filesystem,
            HolderKind::FilesystemUser { devid: next_devid, journal: false },
        )
    }

    /// Remove a member device from a btrfs. The last member cannot go.
    pub fn btrfs_remove_device(&mut self, filesystem: Sid, blk_device: Sid) -> Result<()> {
        self.device(filesystem)?.as_btrfs()?;

        let members = self.filesystem_devices(filesystem)?;
        if members.len() <= 1 {
            return Err(StorageError::InvariantViolation(
                "cannot remove the last device of a btrfs".to_owned(),
            ));
        }

        let holder = self
            .holders_in(filesystem, View::All)?
            .into_iter()
            .find(|h| {
                h.source == blk_device
                    && matches!(h.kind, HolderKind::FilesystemUser { journal: false, .. })
            })
            .ok_or_else(|| {
                StorageError::NotFound(format!(
                    "filesystem-user holder from sid {blk_device}"
                ))
            })?;
        self.remove_holder(holder.sid)
    }

    /// All subvolumes of a btrfs, the top-level one first.
    pub fn btrfs_subvolumes(&self, filesystem: Sid) -> Result<Vec<Sid>> {
        self.device(filesystem)?.as_btrfs()?;

        let mut subvolumes = Vec::new();
        for sid in self.descendants(filesystem, View::Classic)? {
            if self.device(sid)?.as_btrfs_subvolume().is_ok() {
                subvolumes.push(sid);
            }
        }
        subvolumes.sort_by_key(|sid| {
            self.device(*sid)
                .and_then(|d| d.as_btrfs_subvolume().map(|s| s.id))
                .unwrap_or(u64::MAX)
        });
        Ok(subvolumes)
    }

    pub fn btrfs_top_level_subvolume(&self, filesystem: Sid) -> Result<Sid> {
        self.btrfs_subvolumes(filesystem)?
            .into_iter()
            .find(|sid| {
                self.device(*sid)
                    .and_then(|d| d.as_btrfs_subvolume().map(BtrfsSubvolumeData::is_top_level))
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                StorageError::InvariantViolation(format!(
                    "btrfs sid {filesystem} has no top-level subvolume"
                ))
            })
    }

    /// The default subvolume; the top-level one unless another is marked.
    pub fn btrfs_default_subvolume(&self, filesystem: Sid) -> Result<Sid> {
        for sid in self.btrfs_subvolumes(filesystem)? {
            if self.device(sid)?.as_btrfs_subvolume()?.default_subvolume {
                return Ok(sid);
            }
        }
        self.btrfs_top_level_subvolume(filesystem)
    }

    pub fn btrfs_set_default_subvolume(&mut self, filesystem: Sid, subvolume: Sid) -> Result<()> {
        let subvolumes = self.btrfs_subvolumes(filesystem)?;
        if !subvolumes.contains(&subvolume) {
            return Err(StorageError::NotFound(format!(
                "subvolume sid {subvolume} in btrfs sid {filesystem}"
            )));
        }

        for sid in subvolumes {
            self.device_mut(sid)?.as_btrfs_subvolume_mut()?.default_subvolume = sid == subvolume;
        }
        Ok(())
    }

    pub fn btrfs_find_subvolume_by_path(&self, filesystem: Sid, path: &str) -> Result<Sid> {
        self.btrfs_subvolumes(filesystem)?
            .into_iter()
            .find(|sid| {
                self.device(*sid)
                    .and_then(|d| d.as_btrfs_subvolume().map(|s| s.path == path))
                    .unwrap_or(false)
            })
            .ok_or_else(|| StorageError::NotFound(format!("subvolume with path '{path}'")))
    }

    /// Create a subvolume below `parent` (a subvolume). When quota is
    /// enabled the implicit level-0 qgroup comes along.
    pub fn create_btrfs_subvolume(&mut self, parent: Sid, path: &str) -> Result<Sid> {
        self.device(parent)?.as_btrfs_subvolume()?;
        let filesystem = self.btrfs_of_subvolume(parent)?;

        let next_id = self
            .btrfs_subvolumes(filesystem)?
            .iter()
            .filter_map(|sid| {
                self.device(*sid)
                    .and_then(|d| d.as_btrfs_subvolume().map(|s| s.id))
                    .ok()
            })
            .max()
            .unwrap_or(0)
            .max(255)
            + 1;

        let subvolume = self.add_device(DeviceKind::BtrfsSubvolume(BtrfsSubvolumeData {
            id: next_id,
            path: path.to_owned(),
            ..Default::default()
        }));
        self.add_holder(parent, subvolume, HolderKind::Subdevice)?;

        if self.device(filesystem)?.as_btrfs()?.1.quota {
            self.create_btrfs_qgroup(filesystem, (0, next_id))?;
        }

        Ok(subvolume)
    }

    /// The btrfs a subvolume belongs to.
    pub fn btrfs_of_subvolume(&self, subvolume: Sid) -> Result<Sid> {
        let mut current = subvolume;
        loop {
            let parents = self.parents(current, View::Classic)?;
            let parent = *parents.first().ok_or_else(|| {
                StorageError::InvariantViolation(format!(
                    "subvolume sid {subvolume} is not attached to a btrfs"
                ))
            })?;
            if self.device(parent)?.as_btrfs().is_ok() {
                return Ok(parent);
            }
            current = parent;
        }
    }

    /// All qgroups of a btrfs, ordered by (level, id).
    pub fn btrfs_qgroups(&self, filesystem: Sid) -> Result<Vec<Sid>> {
        self.device(filesystem)?.as_btrfs()?;

        let mut qgroups = Vec::new();
        for sid in self.children(filesystem, View::All)? {
            if self.device(sid)?.as_btrfs_qgroup().is_ok() {
                qgroups.push(sid);
            }
        }
        qgroups.sort_by_key(|sid| {
            self.device(*sid)
                .and_then(|d| d.as_btrfs_qgroup().map(|q| q.id))
                .unwrap_or((u32::MAX, u64::MAX))
        });
        Ok(qgroups)
    }

    pub fn btrfs_find_qgroup_by_id(&self, filesystem: Sid, id: QgroupId) -> Result<Sid> {
        self.btrfs_qgroups(filesystem)?
            .into_iter()
            .find(|sid| {
                self.device(*sid)
                    .and_then(|d| d.as_btrfs_qgroup().map(|q| q.id == id))
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                StorageError::NotFound(format!(
                    "qgroup {}",
                    osutils::btrfs::format_qgroup_id(id)
                ))
            })
    }

    /// Create a qgroup. A level-0 qgroup is tied to its governing
    /// subvolume by a qgroup relation when that subvolume exists.
    pub fn create_btrfs_qgroup(&mut self, filesystem: Sid, id: QgroupId) -> Result<Sid> {
        self.device(filesystem)?.as_btrfs()?;

        if self.btrfs_find_qgroup_by_id(filesystem, id).is_ok() {
            return Err(StorageError::InvariantViolation(format!(
                "qgroup {} already exists",
                osutils::btrfs::format_qgroup_id(id)
            )));
        }

        let qgroup = self.add_device(DeviceKind::BtrfsQgroup(BtrfsQgroupData {
            id,
            ..Default::default()
        }));
        self.add_holder(filesystem, qgroup, HolderKind::Subdevice)?;

        if id.0 == 0 {
            let governed = self.btrfs_subvolumes(filesystem)?.into_iter().find(|sid| {
                self.device(*sid)
                    .and_then(|d| d.as_btrfs_subvolume().map(|s| s.id == id.1))
                    .unwrap_or(false)
            });
            if let Some(subvolume) = governed {
                self.add_holder(subvolume, qgroup, HolderKind::BtrfsQgroupRelation)?;
            }
        }

        Ok(qgroup)
    }

    /// Toggle quota support. Enabling restores the probed qgroup state when
    /// quota was enabled on the probed system, otherwise level-0 qgroups are
    /// created for every subvolume. Disabling removes all qgroups.
    pub fn btrfs_set_quota(
        &mut self,
        filesystem: Sid,
        quota: bool,
        probed: Option<&DeviceGraph>,
    ) -> Result<()> {
        if self.device(filesystem)?.as_btrfs()?.1.quota == quota {
            return Ok(());
        }
        self.device_mut(filesystem)?.as_btrfs_mut()?.1.quota = quota;

        if !quota {
            for qgroup in self.btrfs_qgroups(filesystem)? {
                self.remove_device(qgroup)?;
            }
            return Ok(());
        }

        let probed_btrfs = probed.filter(|graph| {
            graph.has_device(filesystem)
                && graph
                    .device(filesystem)
                    .and_then(|d| d.as_btrfs().map(|(_, data)| data.quota))
                    .unwrap_or(false)
        });

        match probed_btrfs {
            Some(probed) => {
                debug!(
                    "restoring probed qgroups for btrfs sid {filesystem} while enabling quota"
                );

                // Copy the probed qgroups verbatim, sids included.
                for qgroup in probed.btrfs_qgroups(filesystem)? {
                    let device = probed.device(qgroup)?.clone();
                    self.insert_device(device)?;
                    self.add_holder(filesystem, qgroup, HolderKind::Subdevice)?;
                }

                // Copy relations unless their source is gone from this graph.
                for qgroup in probed.btrfs_qgroups(filesystem)? {
                    for holder in probed.holders_in(qgroup, View::All)? {
                        if matches!(holder.kind, HolderKind::BtrfsQgroupRelation)
                            && self.has_device(holder.source)
                        {
                            self.add_holder(holder.source, qgroup, HolderKind::BtrfsQgroupRelation)?;
                        }
                    }
                }

                // New subvolumes get implicit qgroups.
                for subvolume in self.btrfs_subvolumes(filesystem)? {
                    let id = self.device(subvolume)?.as_btrfs_subvolume()?.id;
                    if !probed.has_device(subvolume)
                        && self.btrfs_find_qgroup_by_id(filesystem, (0, id)).is_err()
                    {
                        self.create_btrfs_qgroup(filesystem, (0, id))?;
                    }
                }
            }
            None => {
                for subvolume in self.btrfs_subvolumes(filesystem)? {
                    let id = self.device(subvolume)?.as_btrfs_subvolume()?.id;
                    self.create_btrfs_qgroup(filesystem, (0, id))?;
                }
            }
        }

        Ok(())
    }

    /// Size limits for resizing a filesystem. For a multi-device btrfs the
    /// shrink estimate is deliberately pessimistic: minimum size plus used
    /// size, with a 50% safety margin on top.
    pub fn detect_resize_info(&self, filesystem: Sid) -> Result<ResizeInfo> {
        let (fs, btrfs) = match &self.device(filesystem)?.kind {
            DeviceKind::Filesystem { fs, btrfs } => (fs, btrfs),
            _ => {
                return Err(StorageError::WrongType {
                    sid: filesystem,
                    expected: "Filesystem",
                    found: self.device(filesystem)?.kind.variant_name(),
                })
            }
        };

        let members = self.filesystem_devices(filesystem)?;
        let aggregate: u64 = members
            .iter()
            .filter_map(|(sid, _)| self.device(*sid).ok())
            .filter_map(|device| device.blk().map(|blk| blk.size.0))
            .sum();

        let mut info = ResizeInfo {
            resize_ok: fs.fs_type.supports_shrink() || fs.fs_type.supports_grow(),
            reasons: ResizeReasons::empty(),
            min_size: fs.fs_type.min_size(),
            max_size: fs.fs_type.max_size(),
        };

        if !info.resize_ok {
            info.reasons |= ResizeReasons::RESIZE_NOT_SUPPORTED_BY_FILESYSTEM;
            return Ok(info);
        }

        if members.len() > 1 {
            let used = btrfs.as_ref().map(|data| data.used_size.0).unwrap_or(0);
            info.min_size = ByteCount((info.min_size.0 + used) * 3 / 2);
            info.reasons |= ResizeReasons::SHRINK_NOT_SUPPORTED_BY_MULTIDEVICE_FILESYSTEM;

            if info.min_size.0 >= aggregate {
                info.reasons |= ResizeReasons::FILESYSTEM_FULL;
            }
        }

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicegraph::device::BTRFS_TOP_LEVEL_SUBVOLUME_ID;
    use sysdefs::bytes::{ByteCount, GIB};
    use sysdefs::filesystems::FsType;
    use sysdefs::region::Region;

    fn btrfs_on_two_partitions(graph: &mut DeviceGraph) -> (Sid, Sid, Sid) {
        let disk = graph.create_disk("/dev/sda", ByteCount(32 * GIB));
        let table = graph
            .create_partition_table(disk, crate::devicegraph::device::PtType::Gpt)
            .unwrap();
        let free = graph.free_regions(table).unwrap()[0];
        let part1 = graph
            .create_partition(table, Region::new(free.start(), GIB / 512, 512).unwrap())
            .unwrap();
        let part2 = graph
            .create_partition(
                table,
                Region::new(free.start() + GIB / 512, GIB / 512, 512).unwrap(),
            )
            .unwrap();
        let filesystem = graph.create_filesystem(part1, FsType::Btrfs).unwrap();
        (filesystem, part1, part2)
    }

    #[test]
    fn test_subvolume_tree() {
        let mut graph = DeviceGraph::new();
        let (filesystem, _, _) = btrfs_on_two_partitions(&mut graph);

        let top_level = graph.btrfs_top_level_subvolume(filesystem).unwrap();
        assert!(graph
            .device(top_level)
            .unwrap()
            .as_btrfs_subvolume()
            .unwrap()
            .is_top_level());

        let home = graph.create_btrfs_subvolume(top_level, "home").unwrap();
        let snapshots = graph
            .create_btrfs_subvolume(home, "home/.snapshots")
            .unwrap();

        assert_eq!(
            graph.btrfs_subvolumes(filesystem).unwrap(),
            vec![top_level, home, snapshots]
        );
        assert_eq!(
            graph.btrfs_find_subvolume_by_path(filesystem, "home").unwrap(),
            home
        );
        assert!(graph
            .btrfs_find_subvolume_by_path(filesystem, "nope")
            .is_err());
        assert_eq!(graph.btrfs_of_subvolume(snapshots).unwrap(), filesystem);

        // Default subvolume falls back to the top-level one.
        assert_eq!(graph.btrfs_default_subvolume(filesystem).unwrap(), top_level);
        graph.btrfs_set_default_subvolume(filesystem, home).unwrap();
        assert_eq!(graph.btrfs_default_subvolume(filesystem).unwrap(), home);
        graph.check().unwrap();
    }

    #[test]
    fn test_multi_device_membership() {
        let mut graph = DeviceGraph::new();
        let (filesystem, part1, part2) = btrfs_on_two_partitions(&mut graph);

        assert_eq!(
            graph.filesystem_devices(filesystem).unwrap(),
            vec![(part1, 1)]
        );

        graph.btrfs_add_device(filesystem, part2).unwrap();
        assert_eq!(
            graph.filesystem_devices(filesystem).unwrap(),
            vec![(part1, 1), (part2, 2)]
        );

        graph.btrfs_remove_device(filesystem, part2).unwrap();
        assert_eq!(graph.filesystem_devices(filesystem).unwrap().len(), 1);

        // The last member must stay.
        assert!(graph.btrfs_remove_device(filesystem, part1).is_err());
    }

    #[test]
    fn test_quota_creates_implicit_qgroups() {
        let mut graph = DeviceGraph::new();
        let (filesystem, _, _) = btrfs_on_two_partitions(&mut graph);
        let top_level = graph.btrfs_top_level_subvolume(filesystem).unwrap();
        graph.create_btrfs_subvolume(top_level, "home").unwrap();

        graph.btrfs_set_quota(filesystem, true, None).unwrap();

        let qgroups = graph.btrfs_qgroups(filesystem).unwrap();
        assert_eq!(qgroups.len(), 2);
        assert!(graph
            .btrfs_find_qgroup_by_id(filesystem, (0, BTRFS_TOP_LEVEL_SUBVOLUME_ID))
            .is_ok());
        assert!(graph.btrfs_find_qgroup_by_id(filesystem, (0, 256)).is_ok());

        // New subvolumes pick up an implicit qgroup while quota is on.
        let top_level = graph.btrfs_top_level_subvolume(filesystem).unwrap();
        graph.create_btrfs_subvolume(top_level, "var").unwrap();
        assert_eq!(graph.btrfs_qgroups(filesystem).unwrap().len(), 3);

        graph.btrfs_set_quota(filesystem, false, None).unwrap();
        assert!(graph.btrfs_qgroups(filesystem).unwrap().is_empty());
        graph.check().unwrap();
    }

    #[test]
    fn test_quota_restores_probed_qgroups() {
        let mut probed = DeviceGraph::new();
        let (filesystem, _, _) = btrfs_on_two_partitions(&mut probed);
        let top_level = probed.btrfs_top_level_subvolume(filesystem).unwrap();
        let home = probed.create_btrfs_subvolume(top_level, "home").unwrap();
        probed.btrfs_set_quota(filesystem, true, None).unwrap();

        // A higher-level qgroup with a relation to the level-0 one.
        let parent = probed.create_btrfs_qgroup(filesystem, (1, 100)).unwrap();
        let level0 = probed.btrfs_find_qgroup_by_id(filesystem, (0, 256)).unwrap();
        probed
            .add_holder(parent, level0, HolderKind::BtrfsQgroupRelation)
            .unwrap();

        // Staging drops quota, removes a subvolume, adds a new one.
        let mut staging = probed.clone();
        staging.btrfs_set_quota(filesystem, false, None).unwrap();
        staging.remove_device_and_descendants(home).unwrap();
        let top_level = staging.btrfs_top_level_subvolume(filesystem).unwrap();
        let var = staging.create_btrfs_subvolume(top_level, "var").unwrap();

        // Enabling quota again restores the probed qgroups, drops the
        // relation whose subvolume is gone, and covers the new subvolume.
        staging.btrfs_set_quota(filesystem, true, Some(&probed)).unwrap();

        assert!(staging.btrfs_find_qgroup_by_id(filesystem, (1, 100)).is_ok());
        let restored_level0 = staging.btrfs_find_qgroup_by_id(filesystem, (0, 256)).unwrap();
        // The governing subvolume was removed in staging, so only the
        // inter-qgroup relation survives.
        let relations = staging
            .holders_in(restored_level0, View::All)
            .unwrap()
            .into_iter()
            .filter(|h| matches!(h.kind, HolderKind::BtrfsQgroupRelation))
            .count();
        assert_eq!(relations, 1);

        let var_id = staging.device(var).unwrap().as_btrfs_subvolume().unwrap().id;
        assert!(staging
            .btrfs_find_qgroup_by_id(filesystem, (0, var_id))
            .is_ok());
    }

    #[test]
    fn test_multi_device_resize_info() {
        let mut graph = DeviceGraph::new();
        let (filesystem, _, part2) = btrfs_on_two_partitions(&mut graph);
        graph.btrfs_add_device(filesystem, part2).unwrap();
        graph
            .device_mut(filesystem)
            .unwrap()
            .as_btrfs_mut()
            .unwrap()
            .1
            .used_size = ByteCount(GIB);

        let info = graph.detect_resize_info(filesystem).unwrap();
        assert!(info
            .reasons
            .contains(ResizeReasons::SHRINK_NOT_SUPPORTED_BY_MULTIDEVICE_FILESYSTEM));
        // (16 MiB + 1 GiB) * 1.5
        assert_eq!(info.min_size, ByteCount((GIB + (16 << 20)) * 3 / 2));
    }
}
