//! The device graph: a typed DAG of devices (nodes) and holders (edges)
//! describing one storage configuration snapshot.

pub mod device;
pub mod holder;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use log::debug;
use petgraph::{
    stable_graph::{EdgeIndex, NodeIndex, StableDiGraph},
    visit::EdgeRef,
    Direction,
};
use serde::{Deserialize, Serialize};

use sysdefs::{bytes::ByteCount, filesystems::FsType, raid::MdLevel, region::Region};

use crate::{
    error::{Result, StorageError},
    features::UsedFeatures,
    sid::Sid,
};

use device::{
    BlkDeviceData, BtrfsData, BtrfsSubvolumeData, Device, DeviceKind, FilesystemData,
    MountPointData, PtType, BTRFS_TOP_LEVEL_SUBVOLUME_ID,
};
use holder::{Holder, HolderKind, HolderView};

/// Alignment grain for partitions, in sectors of 512 bytes (1 MiB).
pub const PARTITION_ALIGNMENT_SECTORS: u64 = 2048;

/// Filter over edge variants when traversing the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum View {
    /// All holders.
    All,
    /// Skip snapshot and qgroup relations; the everyday view.
    #[default]
    Classic,
    /// The edge set driving cascading remove decisions: qgroup relations
    /// are followed so qgroups die with their subvolume, snapshot
    /// relations are not.
    Remove,
}

impl View {
    fn sees(self, kind: &HolderKind) -> bool {
        match self {
            View::All => true,
            View::Classic => !matches!(
                kind,
                HolderKind::Snapshot | HolderKind::BtrfsQgroupRelation
            ),
            View::Remove => !matches!(kind, HolderKind::Snapshot),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceGraph {
    graph: StableDiGraph<Device, Holder>,
    device_index: BTreeMap<Sid, NodeIndex>,
    holder_index: BTreeMap<Sid, EdgeIndex>,
}

impl DeviceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_devices(&self) -> usize {
        self.graph.node_count()
    }

    pub fn num_holders(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn node(&self, sid: Sid) -> Result<NodeIndex> {
        self.device_index
            .get(&sid)
            .copied()
            .ok_or(StorageError::DeviceNotFound(sid))
    }

    pub fn has_device(&self, sid: Sid) -> bool {
        self.device_index.contains_key(&sid)
    }

    pub fn device(&self, sid: Sid) -> Result<&Device> {
        Ok(&self.graph[self.node(sid)?])
    }

    pub fn device_mut(&mut self, sid: Sid) -> Result<&mut Device> {
        let node = self.node(sid)?;
        Ok(&mut self.graph[node])
    }

    /// All device sids, ascending.
    pub fn all_sids(&self) -> Vec<Sid> {
        self.device_index.keys().copied().collect()
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.graph.node_weights()
    }

    /// Add a device with a fresh sid.
    pub fn add_device(&mut self, kind: DeviceKind) -> Sid {
        self.insert_device(Device::new(kind))
            .expect("fresh sids cannot collide")
    }

    /// Add a device keeping its sid, e.g. when copying between graphs.
    pub fn insert_device(&mut self, device: Device) -> Result<Sid> {
        let sid = device.sid();
        if self.device_index.contains_key(&sid) {
            return Err(StorageError::InvariantViolation(format!(
                "device with sid {sid} already exists"
            )));
        }
        let node = self.graph.add_node(device);
        self.device_index.insert(sid, node);
        Ok(sid)
    }

    pub fn add_holder(&mut self, source: Sid, target: Sid, kind: HolderKind) -> Result<Sid> {
        self.insert_holder(source, target, Holder::new(kind))
    }

    pub fn insert_holder(&mut self, source: Sid, target: Sid, holder: Holder) -> Result<Sid> {
        let source_node = self.node(source)?;
        let target_node = self.node(target)?;

        let duplicate = self
            .graph
            .edges_connecting(source_node, target_node)
            .any(|edge| edge.weight().kind.variant_name() == holder.kind.variant_name());
        if duplicate {
            return Err(StorageError::HolderAlreadyExists { holder_source: source, target });
        }

        let sid = holder.sid();
        let edge = self.graph.add_edge(source_node, target_node, holder);
        self.holder_index.insert(sid, edge);
        Ok(sid)
    }

    fn view_of(&self, edge: EdgeIndex) -> Result<HolderView> {
        let (source, target) = self
            .graph
            .edge_endpoints(edge)
            .ok_or(StorageError::NullReference("holder endpoints"))?;
        let holder = &self.graph[edge];
        Ok(HolderView {
            sid: holder.sid(),
            source: self.graph[source].sid(),
            target: self.graph[target].sid(),
            kind: holder.kind.clone(),
        })
    }

    pub fn holder(&self, sid: Sid) -> Result<HolderView> {
        let edge = self
            .holder_index
            .get(&sid)
            .copied()
            .ok_or(StorageError::HolderNotFound(sid))?;
        self.view_of(edge)
    }

    pub fn holder_mut(&mut self, sid: Sid) -> Result<&mut Holder> {
        let edge = self
            .holder_index
            .get(&sid)
            .copied()
            .ok_or(StorageError::HolderNotFound(sid))?;
        Ok(&mut self.graph[edge])
    }

    /// All holders, ordered by sid.
    pub fn holders(&self) -> Vec<HolderView> {
        let mut views: Vec<HolderView> = self
            .holder_index
            .values()
            .filter_map(|edge| self.view_of(*edge).ok())
            .collect();
        views.sort_by_key(|view| view.sid);
        views
    }

    pub fn remove_holder(&mut self, sid: Sid) -> Result<()> {
        let edge = self
            .holder_index
            .remove(&sid)
            .ok_or(StorageError::HolderNotFound(sid))?;
        self.graph.remove_edge(edge);
        Ok(())
    }

    /// Remove a device and its incident holders.
    pub fn remove_device(&mut self, sid: Sid) -> Result<()> {
        let node = self.node(sid)?;

        let incident: Vec<Sid> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .chain(self.graph.edges_directed(node, Direction::Outgoing))
            .map(|edge| edge.weight().sid())
            .collect();
        for holder_sid in incident {
            self.holder_index.remove(&holder_sid);
        }

        self.graph.remove_node(node);
        self.device_index.remove(&sid);
        Ok(())
    }

    /// Remove a device together with everything hanging off it, following
    /// the Remove view. Returns the removed sids.
    pub fn remove_device_and_descendants(&mut self, sid: Sid) -> Result<Vec<Sid>> {
        let mut doomed = self.descendants(sid, View::Remove)?;
        doomed.push(sid);
        for sid in &doomed {
            self.remove_device(*sid)?;
        }
        Ok(doomed)
    }

    fn neighbours(&self, sid: Sid, view: View, direction: Direction) -> Result<Vec<Sid>> {
        let node = self.node(sid)?;
        let mut sids: Vec<Sid> = self
            .graph
            .edges_directed(node, direction)
            .filter(|edge| view.sees(&edge.weight().kind))
            .map(|edge| {
                let other = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                self.graph[other].sid()
            })
            .collect();
        sids.sort();
        sids.dedup();
        Ok(sids)
    }

    pub fn parents(&self, sid: Sid, view: View) -> Result<Vec<Sid>> {
        self.neighbours(sid, view, Direction::Incoming)
    }

    pub fn children(&self, sid: Sid, view: View) -> Result<Vec<Sid>> {
        self.neighbours(sid, view, Direction::Outgoing)
    }

    fn reachable(&self, sid: Sid, view: View, direction: Direction) -> Result<Vec<Sid>> {
        self.node(sid)?;

        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([sid]);
        while let Some(current) = queue.pop_front() {
            for next in self.neighbours(current, view, direction)? {
                if next != sid && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        Ok(seen.into_iter().collect())
    }

    pub fn ancestors(&self, sid: Sid, view: View) -> Result<Vec<Sid>> {
        self.reachable(sid, view, Direction::Incoming)
    }

    pub fn descendants(&self, sid: Sid, view: View) -> Result<Vec<Sid>> {
        self.reachable(sid, view, Direction::Outgoing)
    }

    fn holders_directed(&self, sid: Sid, view: View, direction: Direction) -> Result<Vec<HolderView>> {
        let node = self.node(sid)?;
        let mut views: Vec<HolderView> = self
            .graph
            .edges_directed(node, direction)
            .filter(|edge| view.sees(&edge.weight().kind))
            .filter_map(|edge| self.view_of(edge.id()).ok())
            .collect();
        views.sort_by_key(|view| view.sid);
        Ok(views)
    }

    pub fn holders_in(&self, sid: Sid, view: View) -> Result<Vec<HolderView>> {
        self.holders_directed(sid, view, Direction::Incoming)
    }

    pub fn holders_out(&self, sid: Sid, view: View) -> Result<Vec<HolderView>> {
        self.holders_directed(sid, view, Direction::Outgoing)
    }

    /// First holder between two devices, any kind.
    pub fn find_holder(&self, source: Sid, target: Sid) -> Result<HolderView> {
        let source_node = self.node(source)?;
        let target_node = self.node(target)?;
        self.graph
            .edges_connecting(source_node, target_node)
            .map(|edge| edge.id())
            .next()
            .map(|edge| self.view_of(edge))
            .unwrap_or(Err(StorageError::NullReference("no holder between devices")))
    }

    /// Devices of a given variant, by `variant_name`.
    pub fn filter_by_variant(&self, variant: &str) -> Vec<Sid> {
        let mut sids: Vec<Sid> = self
            .devices()
            .filter(|device| device.kind.variant_name() == variant)
            .map(|device| device.sid())
            .collect();
        sids.sort();
        sids
    }

    pub fn find_by_name(&self, name: &str) -> Option<Sid> {
        self.devices()
            .find(|device| device.blk().map(|blk| blk.name.as_str()) == Some(name))
            .map(|device| device.sid())
    }
}

// Constructors. Each adds the node and its required holders.
impl DeviceGraph {
    pub fn create_disk(&mut self, name: &str, size: ByteCount) -> Sid {
        let mut blk = BlkDeviceData::new(name, size);
        blk.region = Region::new(0, size.0 / 512, 512).unwrap_or_default();
        self.add_device(DeviceKind::Disk { blk, rotational: false })
    }

    pub fn create_partition_table(&mut self, partitionable: Sid, pt_type: PtType) -> Result<Sid> {
        let device = self.device(partitionable)?;
        if !device.is_partitionable() {
            return Err(StorageError::WrongType {
                sid: partitionable,
                expected: "a partitionable",
                found: device.kind.variant_name(),
            });
        }

        let children = self.children(partitionable, View::All)?;
        if !children.is_empty() {
            return Err(StorageError::WrongNumberOfChildren {
                expected: 0,
                found: children.len(),
            });
        }

        let table = self.add_device(DeviceKind::PartitionTable {
            pt_type,
            uuid: String::new(),
        });
        self.add_holder(partitionable, table, HolderKind::User)?;
        Ok(table)
    }

    /// The partition table sitting on a partitionable, if any.
    pub fn partition_table_of(&self, partitionable: Sid) -> Result<Option<Sid>> {
        for child in self.children(partitionable, View::Classic)? {
            if self.device(child)?.as_partition_table().is_ok() {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// The usable sector range of a partition table.
    pub fn usable_region(&self, table: Sid) -> Result<Region> {
        let pt_type = self.device(table)?.as_partition_table()?;
        let partitionable = self.partitionable_of(table)?;
        let blk = self
            .device(partitionable)?
            .blk()
            .ok_or(StorageError::NullReference("partitionable without blk data"))?;

        let total = blk.region.length();
        let tail = match pt_type {
            // Room for the secondary gpt header.
            PtType::Gpt => PARTITION_ALIGNMENT_SECTORS,
            _ => 0,
        };
        let start = PARTITION_ALIGNMENT_SECTORS;
        let length = total.saturating_sub(start + tail);
        Ok(Region::new(start, length, blk.region.block_size())
            .map_err(|e| StorageError::InvariantViolation(e.to_string()))?)
    }

    /// The partitionable a partition table sits on.
    pub fn partitionable_of(&self, table: Sid) -> Result<Sid> {
        let parents = self.parents(table, View::Classic)?;
        match parents.as_slice() {
            [single] => Ok(*single),
            _ => Err(StorageError::WrongNumberOfChildren {
                expected: 1,
                found: parents.len(),
            }),
        }
    }

    pub fn partitions_of(&self, table: Sid) -> Result<Vec<Sid>> {
        let mut partitions = Vec::new();
        for child in self.children(table, View::Classic)? {
            if self.device(child)?.as_partition().is_ok() {
                partitions.push(child);
            }
        }
        Ok(partitions)
    }

    /// Free, aligned regions of a partition table, largest first.
    pub fn free_regions(&self, table: Sid) -> Result<Vec<Region>> {
        let usable = self.usable_region(table)?;
        let block_size = usable.block_size();

        let mut used: Vec<Region> = Vec::new();
        for partition in self.partitions_of(table)? {
            used.push(self.device(partition)?.as_partition()?.0.region);
        }
        used.sort_by_key(|region| region.start());

        let mut free = Vec::new();
        let mut cursor = usable.start();
        for region in &used {
            if region.start() > cursor {
                free.push(Region::new(cursor, region.start() - cursor, block_size).unwrap());
            }
            cursor = cursor.max(region.end());
        }
        if usable.end() > cursor {
            free.push(Region::new(cursor, usable.end() - cursor, block_size).unwrap());
        }

        // Shrink each gap to alignment boundaries.
        let mut aligned = Vec::new();
        for region in free {
            let start = sysdefs::bytes::round_up(region.start(), PARTITION_ALIGNMENT_SECTORS);
            let end = sysdefs::bytes::round_down(region.end(), PARTITION_ALIGNMENT_SECTORS);
            if end > start {
                aligned.push(Region::new(start, end - start, block_size).unwrap());
            }
        }

        aligned.sort_by_key(|region| std::cmp::Reverse(region.length()));
        Ok(aligned)
    }

    fn next_partition_number(&self, table: Sid) -> Result<u32> {
        let mut taken = BTreeSet::new();
        for partition in self.partitions_of(table)? {
            taken.insert(self.device(partition)?.as_partition()?.1);
        }
        Ok((1..).find(|number| !taken.contains(number)).unwrap())
    }

    pub fn create_partition(&mut self, table: Sid, region: Region) -> Result<Sid> {
        let pt_type = self.device(table)?.as_partition_table()?;
        let usable = self.usable_region(table)?;

        if !usable
            .contains(&region)
            .map_err(|e| StorageError::InvariantViolation(e.to_string()))?
        {
            return Err(StorageError::InvariantViolation(format!(
                "partition region {region} outside of partition table region {usable}"
            )));
        }
        for existing in self.partitions_of(table)? {
            let other = self.device(existing)?.as_partition()?.0.region;
            if other
                .overlaps(&region)
                .map_err(|e| StorageError::InvariantViolation(e.to_string()))?
            {
                return Err(StorageError::InvariantViolation(format!(
                    "partition region {region} overlaps existing partition {other}"
                )));
            }
        }

        let count = self.partitions_of(table)?.len();
        if count >= pt_type.max_partitions() {
            return Err(StorageError::InvariantViolation(format!(
                "partition table already has {count} partitions"
            )));
        }

        let number = self.next_partition_number(table)?;
        let partitionable = self.partitionable_of(table)?;
        let parent_name = self
            .device(partitionable)?
            .blk()
            .map(|blk| blk.name.clone())
            .unwrap_or_default();
        let separator = if parent_name
            .chars()
            .last()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
        {
            "p"
        } else {
            ""
        };

        let mut blk = BlkDeviceData::new(
            format!("{parent_name}{separator}{number}"),
            region.size(),
        );
        blk.region = region;

        let partition = self.add_device(DeviceKind::Partition {
            blk,
            number,
            partition_id: String::new(),
            legacy_boot: false,
        });
        self.add_holder(table, partition, HolderKind::Subdevice)?;
        Ok(partition)
    }

    /// Create a filesystem on one block device. A btrfs gets its implicit
    /// top-level subvolume.
    pub fn create_filesystem(&mut self, blk_device: Sid, fs_type: FsType) -> Result<Sid> {
        let device = self.device(blk_device)?;
        if !device.is_blk_device() {
            return Err(StorageError::WrongType {
                sid: blk_device,
                expected: "a block device",
                found: device.kind.variant_name(),
            });
        }
        let children = self.children(blk_device, View::All)?;
        if !children.is_empty() {
            return Err(StorageError::WrongNumberOfChildren {
                expected: 0,
                found: children.len(),
            });
        }

        let btrfs = (fs_type == FsType::Btrfs).then(BtrfsData::default);
        let filesystem = self.add_device(DeviceKind::Filesystem {
            fs: FilesystemData {
                fs_type,
                ..Default::default()
            },
            btrfs,
        });
        self.add_holder(
            blk_device,
            filesystem,
            HolderKind::FilesystemUser { devid: 1, journal: false },
        )?;

        if fs_type == FsType::Btrfs {
            let top_level = self.add_device(DeviceKind::BtrfsSubvolume(BtrfsSubvolumeData {
                id: BTRFS_TOP_LEVEL_SUBVOLUME_ID,
                ..Default::default()
            }));
            self.add_holder(filesystem, top_level, HolderKind::Subdevice)?;
        }

        Ok(filesystem)
    }

    pub fn create_mount_point(&mut self, filesystem: Sid, path: &str) -> Result<Sid> {
        let device = self.device(filesystem)?;
        if !device.is_filesystem() {
            return Err(StorageError::WrongType {
                sid: filesystem,
                expected: "a filesystem",
                found: device.kind.variant_name(),
            });
        }

        let mount_point = self.add_device(DeviceKind::MountPoint(MountPointData {
            path: path.to_owned(),
            in_etc_fstab: true,
            ..Default::default()
        }));
        self.add_holder(filesystem, mount_point, HolderKind::Subdevice)?;
        Ok(mount_point)
    }

    pub fn create_lvm_pv(&mut self, blk_device: Sid) -> Result<Sid> {
        let device = self.device(blk_device)?;
        if !device.is_blk_device() {
            return Err(StorageError::WrongType {
                sid: blk_device,
                expected: "a block device",
                found: device.kind.variant_name(),
            });
        }
        let children = self.children(blk_device, View::All)?;
        if !children.is_empty() {
            return Err(StorageError::WrongNumberOfChildren {
                expected: 0,
                found: children.len(),
            });
        }

        let pv = self.add_device(DeviceKind::LvmPv {
            uuid: String::new(),
            pe_start: ByteCount(1 << 20),
        });
        self.add_holder(blk_device, pv, HolderKind::User)?;
        Ok(pv)
    }

    pub fn create_lvm_vg(&mut self, vg_name: &str, pvs: &[Sid]) -> Result<Sid> {
        let mut extent_count = 0;
        let extent_size = ByteCount(4 << 20);
        for pv in pvs {
            let parents = self.parents(*pv, View::Classic)?;
            let blk_sid = *parents
                .first()
                .ok_or(StorageError::NullReference("pv without block device"))?;
            let blk = self
                .device(blk_sid)?
                .blk()
                .ok_or(StorageError::NullReference("pv parent without blk data"))?;
            extent_count += blk.size.0.saturating_sub(1 << 20) / extent_size.0;
        }

        let vg = self.add_device(DeviceKind::LvmVg {
            vg_name: vg_name.to_owned(),
            uuid: String::new(),
            extent_size,
            extent_count,
        });
        for pv in pvs {
            self.add_holder(*pv, vg, HolderKind::User)?;
        }
        Ok(vg)
    }

    pub fn create_lvm_lv(&mut self, vg: Sid, lv_name: &str, size: ByteCount) -> Result<Sid> {
        let (vg_name, extent_size, extent_count) = self.device(vg)?.as_lvm_vg()?;
        let vg_name = vg_name.to_owned();

        let mut used_extents = 0;
        for child in self.children(vg, View::Classic)? {
            if let DeviceKind::LvmLv { blk, .. } = &self.device(child)?.kind {
                used_extents += blk.size.0.div_ceil(extent_size.0);
            }
        }
        let wanted = size.0.div_ceil(extent_size.0);
        if used_extents + wanted > extent_count {
            return Err(StorageError::InvariantViolation(format!(
                "volume group {vg_name} has {} free extents, {wanted} needed",
                extent_count - used_extents
            )));
        }

        let lv = self.add_device(DeviceKind::LvmLv {
            blk: BlkDeviceData::new(
                format!("/dev/mapper/{vg_name}-{lv_name}"),
                ByteCount(wanted * extent_size.0),
            ),
            lv_name: lv_name.to_owned(),
            uuid: String::new(),
        });
        self.add_holder(vg, lv, HolderKind::Subdevice)?;
        Ok(lv)
    }

    pub fn create_luks(&mut self, blk_device: Sid, dm_name: &str) -> Result<Sid> {
        let device = self.device(blk_device)?;
        let blk = device.blk().ok_or(StorageError::WrongType {
            sid: blk_device,
            expected: "a block device",
            found: device.kind.variant_name(),
        })?;
        let children = self.children(blk_device, View::All)?;
        if !children.is_empty() {
            return Err(StorageError::WrongNumberOfChildren {
                expected: 0,
                found: children.len(),
            });
        }

        // The LUKS2 header costs 16 MiB of payload.
        let size = ByteCount(blk.size.0.saturating_sub(16 << 20));
        let luks = self.add_device(DeviceKind::Luks {
            blk: BlkDeviceData::new(format!("/dev/mapper/{dm_name}"), size),
            dm_name: dm_name.to_owned(),
            encryption_type: device::EncryptionType::Luks2,
            uuid: String::new(),
            label: String::new(),
            cipher: "aes-xts-plain64".to_owned(),
            key_size: 64,
            pbkdf: String::new(),
            integrity: String::new(),
        });
        self.add_holder(blk_device, luks, HolderKind::User)?;
        Ok(luks)
    }

    pub fn create_md(
        &mut self,
        name: &str,
        level: MdLevel,
        members: &[Sid],
    ) -> Result<Sid> {
        if members.len() < level.min_devices() {
            return Err(StorageError::InvariantViolation(format!(
                "md level {level} needs at least {} devices, got {}",
                level.min_devices(),
                members.len()
            )));
        }

        let mut member_sizes = Vec::new();
        for member in members {
            let blk = self.device(*member)?.blk().ok_or(StorageError::WrongType {
                sid: *member,
                expected: "a block device",
                found: self.device(*member)?.kind.variant_name(),
            })?;
            member_sizes.push(blk.size.0);
        }
        let smallest = member_sizes.iter().copied().min().unwrap_or(0);
        let size = match level {
            MdLevel::Raid0 | MdLevel::Linear => member_sizes.iter().sum::<u64>(),
            MdLevel::Raid1 => smallest,
            MdLevel::Raid10 => smallest * (members.len() as u64 / 2),
            MdLevel::Raid4 | MdLevel::Raid5 => smallest * (members.len() as u64 - 1),
            MdLevel::Raid6 => smallest * (members.len() as u64 - 2),
            _ => smallest,
        };

        let md = self.add_device(DeviceKind::Md {
            blk: BlkDeviceData::new(name, ByteCount(size)),
            level,
            uuid: String::new(),
        });
        for member in members {
            self.add_holder(*member, md, HolderKind::MdUser { spare: false, faulty: false })?;
        }
        Ok(md)
    }
}

// Structural checks.
impl DeviceGraph {
    fn check_holder(&self, view: &HolderView) -> Result<()> {
        let source = self.device(view.source)?;
        let target = self.device(view.target)?;

        let ok = match &view.kind {
            HolderKind::User => match (&source.kind, &target.kind) {
                (_, DeviceKind::PartitionTable { .. }) => source.is_partitionable(),
                (_, DeviceKind::LvmPv { .. }) => source.is_blk_device(),
                (DeviceKind::LvmPv { .. }, DeviceKind::LvmVg { .. }) => true,
                (_, DeviceKind::Luks { .. }) => source.is_blk_device(),
                (_, DeviceKind::BitlockerV2 { .. }) => source.is_blk_device(),
                (_, DeviceKind::Bcache { .. }) => source.is_blk_device(),
                (DeviceKind::BcacheCset { .. }, _) => true,
                (_, DeviceKind::Multipath { .. }) => source.is_blk_device(),
                (_, DeviceKind::DmRaid { .. }) => source.is_blk_device(),
                _ => source.is_blk_device(),
            },
            HolderKind::Subdevice => matches!(
                (&source.kind, &target.kind),
                (DeviceKind::PartitionTable { .. }, DeviceKind::Partition { .. })
                    | (DeviceKind::LvmVg { .. }, DeviceKind::LvmLv { .. })
                    | (DeviceKind::Filesystem { .. }, DeviceKind::BtrfsSubvolume(_))
                    | (DeviceKind::Filesystem { .. }, DeviceKind::BtrfsQgroup(_))
                    | (DeviceKind::BtrfsSubvolume(_), DeviceKind::BtrfsSubvolume(_))
                    | (DeviceKind::Filesystem { .. }, DeviceKind::MountPoint(_))
                    | (DeviceKind::Nfs { .. }, DeviceKind::MountPoint(_))
                    | (DeviceKind::Tmpfs, DeviceKind::MountPoint(_))
                    | (DeviceKind::MdContainer { .. }, DeviceKind::Md { .. })
            ),
            HolderKind::FilesystemUser { .. } => {
                source.is_blk_device() && matches!(target.kind, DeviceKind::Filesystem { .. })
            }
            HolderKind::MdUser { .. } => {
                source.is_blk_device() && matches!(target.kind, DeviceKind::Md { .. })
            }
            HolderKind::Snapshot => matches!(
                (&source.kind, &target.kind),
                (DeviceKind::BtrfsSubvolume(_), DeviceKind::BtrfsSubvolume(_))
                    | (DeviceKind::LvmLv { .. }, DeviceKind::LvmLv { .. })
            ),
            HolderKind::BtrfsQgroupRelation => matches!(
                (&source.kind, &target.kind),
                (DeviceKind::BtrfsSubvolume(_), DeviceKind::BtrfsQgroup(_))
                    | (DeviceKind::BtrfsQgroup(_), DeviceKind::BtrfsQgroup(_))
            ),
        };

        if !ok {
            return Err(StorageError::InvariantViolation(format!(
                "{} holder from {} (sid {}) to {} (sid {}) violates typing rules",
                view.kind.variant_name(),
                source.kind.variant_name(),
                view.source,
                target.kind.variant_name(),
                view.target,
            )));
        }
        Ok(())
    }

    /// Verify the structural invariants of the graph.
    pub fn check(&self) -> Result<()> {
        for view in self.holders() {
            self.check_holder(&view)?;
        }

        // No cycles among devices; snapshot and qgroup relations are
        // exempt by design.
        let classic = petgraph::visit::EdgeFiltered::from_fn(&self.graph, |edge| {
            View::Classic.sees(&edge.weight().kind)
        });
        if petgraph::algo::is_cyclic_directed(&classic) {
            return Err(StorageError::InvariantViolation(
                "device graph contains a cycle".to_owned(),
            ));
        }

        for device in self.devices() {
            let sid = device.sid();
            match &device.kind {
                DeviceKind::Filesystem { fs, btrfs } => {
                    if (fs.fs_type == FsType::Btrfs) != btrfs.is_some() {
                        return Err(StorageError::InvariantViolation(format!(
                            "filesystem sid {sid} has inconsistent btrfs data"
                        )));
                    }

                    if btrfs.is_some() {
                        self.check_btrfs(sid)?;
                    }

                    // Size constraints apply to the aggregate of all
                    // backing devices.
                    let mut total = 0;
                    let mut backed = false;
                    for holder in self.holders_in(sid, View::All)? {
                        if matches!(holder.kind, HolderKind::FilesystemUser { journal: false, .. }) {
                            backed = true;
                            if let Some(blk) = self.device(holder.source)?.blk() {
                                total += blk.size.0;
                            }
                        }
                    }
                    if backed && total < fs.fs_type.min_size().0 {
                        return Err(StorageError::InvariantViolation(format!(
                            "{} needs at least {}, got {}",
                            fs.fs_type,
                            fs.fs_type.min_size(),
                            ByteCount(total)
                        )));
                    }
                }
                DeviceKind::MountPoint(_) => {
                    let parents = self.parents(sid, View::All)?;
                    let fs_parents = parents
                        .iter()
                        .filter(|p| self.device(**p).map(Device::is_filesystem).unwrap_or(false))
                        .count();
                    if fs_parents != 1 {
                        return Err(StorageError::InvariantViolation(format!(
                            "mount point sid {sid} has {fs_parents} filesystem parents"
                        )));
                    }
                }
                DeviceKind::Partition { blk, .. } => {
                    let parents = self.parents(sid, View::Classic)?;
                    let table = parents
                        .first()
                        .ok_or(StorageError::NullReference("partition without table"))?;
                    let usable = self.usable_region(*table)?;
                    if !usable
                        .contains(&blk.region)
                        .map_err(|e| StorageError::InvariantViolation(e.to_string()))?
                    {
                        return Err(StorageError::InvariantViolation(format!(
                            "partition {} outside of its partition table",
                            blk.name
                        )));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn check_btrfs(&self, filesystem: Sid) -> Result<()> {
        let mut top_level = 0;
        let mut default_subvolumes = 0;

        let mut all = vec![filesystem];
        all.extend(self.descendants(filesystem, View::Classic)?);
        for sid in all {
            if let Ok(subvolume) = self.device(sid)?.as_btrfs_subvolume() {
                if subvolume.is_top_level() {
                    top_level += 1;
                }
                if subvolume.default_subvolume {
                    default_subvolumes += 1;
                }
            }
        }

        if top_level != 1 {
            return Err(StorageError::InvariantViolation(format!(
                "btrfs sid {filesystem} has {top_level} top-level subvolumes"
            )));
        }
        if default_subvolumes > 1 {
            return Err(StorageError::InvariantViolation(format!(
                "btrfs sid {filesystem} has {default_subvolumes} default subvolumes"
            )));
        }
        Ok(())
    }
}

// Feature accounting.
impl DeviceGraph {
    pub fn device_features(&self, sid: Sid) -> Result<UsedFeatures> {
        let device = self.device(sid)?;
        let mut features = UsedFeatures::empty();

        match &device.kind {
            DeviceKind::Filesystem { fs, btrfs } => {
                features |= match fs.fs_type {
                    FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => UsedFeatures::EXT,
                    FsType::Btrfs => UsedFeatures::BTRFS,
                    FsType::Xfs => UsedFeatures::XFS,
                    FsType::Swap => UsedFeatures::SWAP,
                    FsType::Vfat => UsedFeatures::FAT,
                    FsType::Exfat => UsedFeatures::EXFAT,
                    FsType::Ntfs => UsedFeatures::NTFS,
                    FsType::Nfs => UsedFeatures::NFS,
                    _ => UsedFeatures::OTHER_FILESYSTEM,
                };

                if let Some(btrfs) = btrfs {
                    if btrfs.quota {
                        features |= UsedFeatures::QUOTA;
                    }

                    let members = self
                        .holders_in(sid, View::All)?
                        .iter()
                        .filter(|h| matches!(h.kind, HolderKind::FilesystemUser { journal: false, .. }))
                        .count();
                    if members > 1 {
                        features |= UsedFeatures::BTRFS_MULTIPLE_DEVICES;
                    }

                    for subvolume in self.descendants(sid, View::Classic)? {
                        if self.device(subvolume)?.as_btrfs_subvolume().is_ok()
                            && self
                                .holders_in(subvolume, View::All)?
                                .iter()
                                .any(|h| matches!(h.kind, HolderKind::Snapshot))
                        {
                            features |= UsedFeatures::SNAPSHOTS;
                        }
                    }
                }

                if fs.fs_type == FsType::Xfs {
                    // Quota on xfs is a mount option.
                    for mount_point in self.children(sid, View::Classic)? {
                        if let Ok(data) = self.device(mount_point)?.as_mount_point() {
                            if data.mount_options.iter().any(|option| {
                                matches!(
                                    option.as_str(),
                                    "quota"
                                        | "uquota"
                                        | "usrquota"
                                        | "gquota"
                                        | "grpquota"
                                        | "pquota"
                                        | "prjquota"
                                ) || option.ends_with("qnoenforce")
                            }) {
                                features |= UsedFeatures::QUOTA;
                            }
                        }
                    }
                }
            }
            DeviceKind::Nfs { .. } => features |= UsedFeatures::NFS,
            DeviceKind::LvmPv { .. } | DeviceKind::LvmVg { .. } | DeviceKind::LvmLv { .. } => {
                features |= UsedFeatures::LVM
            }
            DeviceKind::Luks { .. } => features |= UsedFeatures::LUKS,
            DeviceKind::BitlockerV2 { .. } => features |= UsedFeatures::BITLOCKER,
            DeviceKind::Md { .. } | DeviceKind::MdContainer { .. } => {
                features |= UsedFeatures::RAID
            }
            DeviceKind::Multipath { .. } => features |= UsedFeatures::MULTIPATH,
            DeviceKind::DmRaid { .. } => features |= UsedFeatures::DMRAID,
            DeviceKind::Bcache { .. } | DeviceKind::BcacheCset { .. } => {
                features |= UsedFeatures::BCACHE
            }
            _ => {}
        }

        Ok(features)
    }

    /// Union of the features of all devices in the graph.
    pub fn used_features(&self) -> UsedFeatures {
        let mut features = UsedFeatures::empty();
        for sid in self.all_sids() {
            if let Ok(device_features) = self.device_features(sid) {
                features |= device_features;
            }
        }
        features
    }
}

// Persistence and comparison.

#[derive(Serialize, Deserialize)]
struct SavedHolder {
    sid: Sid,
    source: Sid,
    target: Sid,
    kind: HolderKind,
}

#[derive(Serialize, Deserialize)]
struct SavedGraph {
    devices: Vec<Device>,
    holders: Vec<SavedHolder>,
}

impl DeviceGraph {
    pub fn save(&self, filename: impl AsRef<Path>) -> Result<()> {
        let saved = SavedGraph {
            devices: {
                let mut devices: Vec<Device> = self.devices().cloned().collect();
                devices.sort_by_key(Device::sid);
                devices
            },
            holders: self
                .holders()
                .into_iter()
                .map(|view| SavedHolder {
                    sid: view.sid,
                    source: view.source,
                    target: view.target,
                    kind: view.kind,
                })
                .collect(),
        };

        let text = serde_json::to_string_pretty(&saved)
            .map_err(|e| StorageError::InvariantViolation(e.to_string()))?;
        std::fs::write(filename.as_ref(), text)?;
        debug!("Saved devicegraph to {}", filename.as_ref().display());
        Ok(())
    }

    pub fn load(filename: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(filename.as_ref())?;
        let saved: SavedGraph = serde_json::from_str(&text).map_err(|e| {
            StorageError::InvariantViolation(format!(
                "failed to parse devicegraph file '{}': {e}",
                filename.as_ref().display()
            ))
        })?;

        let mut graph = DeviceGraph::new();
        let mut highest = Sid(0);
        for device in saved.devices {
            highest = highest.max(device.sid());
            graph.insert_device(device)?;
        }
        for holder in saved.holders {
            highest = highest.max(holder.sid);
            graph.insert_holder(
                holder.source,
                holder.target,
                Holder::with_sid(holder.sid, holder.kind),
            )?;
        }
        Sid::reserve_up_to(highest);

        Ok(graph)
    }
}

impl PartialEq for DeviceGraph {
    /// Structural equality: same devices by sid and same holders by
    /// (sid, endpoints, kind). Arena layout is irrelevant.
    fn eq(&self, other: &Self) -> bool {
        if self.num_devices() != other.num_devices()
            || self.num_holders() != other.num_holders()
        {
            return false;
        }

        for sid in self.all_sids() {
            match (self.device(sid), other.device(sid)) {
                (Ok(a), Ok(b)) if a == b => {}
                _ => return false,
            }
        }

        self.holders() == other.holders()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysdefs::bytes::GIB;

    fn disk_with_table(graph: &mut DeviceGraph) -> (Sid, Sid) {
        let disk = graph.create_disk("/dev/sda", ByteCount(32 * GIB));
        let table = graph.create_partition_table(disk, PtType::Gpt).unwrap();
        (disk, table)
    }

    #[test]
    fn test_construction_and_queries() {
        let mut graph = DeviceGraph::new();
        let (disk, table) = disk_with_table(&mut graph);

        let region = Region::new(2048, 2 * GIB / 512, 512).unwrap();
        let partition = graph.create_partition(table, region).unwrap();
        let filesystem = graph.create_filesystem(partition, FsType::Xfs).unwrap();
        let mount_point = graph.create_mount_point(filesystem, "/home").unwrap();

        assert_eq!(graph.num_devices(), 5);
        assert_eq!(graph.children(disk, View::Classic).unwrap(), vec![table]);
        assert_eq!(graph.parents(partition, View::Classic).unwrap(), vec![table]);

        let ancestors = graph.ancestors(mount_point, View::Classic).unwrap();
        assert!(ancestors.contains(&disk));
        assert!(ancestors.contains(&filesystem));

        let descendants = graph.descendants(disk, View::Classic).unwrap();
        assert_eq!(descendants.len(), 4);

        assert_eq!(
            graph.device(partition).unwrap().as_partition().unwrap().1,
            1
        );
        assert_eq!(
            graph.device(partition).unwrap().blk().unwrap().name,
            "/dev/sda1"
        );

        graph.check().unwrap();
    }

    #[test]
    fn test_downcast_failure() {
        let mut graph = DeviceGraph::new();
        let disk = graph.create_disk("/dev/sda", ByteCount(32 * GIB));

        let err = graph.device(disk).unwrap().as_partition().unwrap_err();
        assert!(matches!(err, StorageError::WrongType { .. }));
    }

    #[test]
    fn test_not_found() {
        let graph = DeviceGraph::new();
        assert!(matches!(
            graph.device(Sid(99999)),
            Err(StorageError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_holder_rejected() {
        let mut graph = DeviceGraph::new();
        let (disk, table) = disk_with_table(&mut graph);

        assert!(matches!(
            graph.add_holder(disk, table, HolderKind::User),
            Err(StorageError::HolderAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_clone_preserves_sids_and_structure() {
        let mut graph = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut graph);
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = graph.create_partition(table, region).unwrap();
        graph.create_filesystem(partition, FsType::Btrfs).unwrap();

        let clone = graph.clone();
        assert_eq!(graph, clone);
        assert_eq!(graph.all_sids(), clone.all_sids());
    }

    #[test]
    fn test_remove_device_drops_holders() {
        let mut graph = DeviceGraph::new();
        let (disk, table) = disk_with_table(&mut graph);

        graph.remove_device(table).unwrap();
        assert!(graph.children(disk, View::All).unwrap().is_empty());
        assert_eq!(graph.num_holders(), 0);
    }

    #[test]
    fn test_remove_descendants() {
        let mut graph = DeviceGraph::new();
        let (disk, table) = disk_with_table(&mut graph);
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = graph.create_partition(table, region).unwrap();
        graph.create_filesystem(partition, FsType::Ext4).unwrap();

        let removed = graph.remove_device_and_descendants(table).unwrap();
        assert_eq!(removed.len(), 3);
        assert_eq!(graph.num_devices(), 1);
        assert!(graph.has_device(disk));
    }

    #[test]
    fn test_partition_must_fit() {
        let mut graph = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut graph);

        // Starts before the usable region.
        let region = Region::new(0, GIB / 512, 512).unwrap();
        assert!(graph.create_partition(table, region).is_err());

        // Overlap with an existing partition.
        let first = Region::new(2048, GIB / 512, 512).unwrap();
        graph.create_partition(table, first).unwrap();
        let overlapping = Region::new(4096, GIB / 512, 512).unwrap();
        assert!(graph.create_partition(table, overlapping).is_err());
    }

    #[test]
    fn test_free_regions() {
        let mut graph = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut graph);

        let free = graph.free_regions(table).unwrap();
        assert_eq!(free.len(), 1);

        let region = Region::new(free[0].start(), GIB / 512, 512).unwrap();
        graph.create_partition(table, region).unwrap();

        let free = graph.free_regions(table).unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].start(), 2048 + GIB / 512);
    }

    #[test]
    fn test_check_rejects_second_top_level() {
        let mut graph = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut graph);
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = graph.create_partition(table, region).unwrap();
        let filesystem = graph.create_filesystem(partition, FsType::Btrfs).unwrap();
        graph.check().unwrap();

        let rogue = graph.add_device(DeviceKind::BtrfsSubvolume(BtrfsSubvolumeData {
            id: BTRFS_TOP_LEVEL_SUBVOLUME_ID,
            ..Default::default()
        }));
        graph
            .add_holder(filesystem, rogue, HolderKind::Subdevice)
            .unwrap();

        assert!(matches!(
            graph.check(),
            Err(StorageError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_check_rejects_too_small_filesystem() {
        let mut graph = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut graph);
        // 100 MiB is below the xfs minimum of 300 MiB.
        let region = Region::new(2048, 100 * 2048, 512).unwrap();
        let partition = graph.create_partition(table, region).unwrap();
        graph.create_filesystem(partition, FsType::Xfs).unwrap();

        assert!(matches!(
            graph.check(),
            Err(StorageError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_views_hide_snapshot_edges() {
        let mut graph = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut graph);
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = graph.create_partition(table, region).unwrap();
        let filesystem = graph.create_filesystem(partition, FsType::Btrfs).unwrap();
        let top_level = graph.children(filesystem, View::Classic).unwrap()[0];

        let origin = graph.add_device(DeviceKind::BtrfsSubvolume(BtrfsSubvolumeData {
            id: 256,
            path: "origin".into(),
            ..Default::default()
        }));
        graph.add_holder(top_level, origin, HolderKind::Subdevice).unwrap();
        let snapshot = graph.add_device(DeviceKind::BtrfsSubvolume(BtrfsSubvolumeData {
            id: 257,
            path: "snap".into(),
            ..Default::default()
        }));
        graph.add_holder(top_level, snapshot, HolderKind::Subdevice).unwrap();
        graph.add_holder(origin, snapshot, HolderKind::Snapshot).unwrap();

        assert_eq!(graph.children(origin, View::Classic).unwrap(), vec![]);
        assert_eq!(graph.children(origin, View::All).unwrap(), vec![snapshot]);
        graph.check().unwrap();
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut graph = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut graph);
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = graph.create_partition(table, region).unwrap();
        let filesystem = graph.create_filesystem(partition, FsType::Btrfs).unwrap();
        graph.create_mount_point(filesystem, "/data").unwrap();
        graph
            .device_mut(filesystem)
            .unwrap()
            .as_filesystem_mut()
            .unwrap()
            .label = "data".to_owned();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devicegraph.json");
        graph.save(&path).unwrap();

        let loaded = DeviceGraph::load(&path).unwrap();
        assert_eq!(graph, loaded);
    }

    #[test]
    fn test_used_features() {
        let mut graph = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut graph);
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = graph.create_partition(table, region).unwrap();
        let pv = graph.create_lvm_pv(partition).unwrap();
        let vg = graph.create_lvm_vg("system", &[pv]).unwrap();
        let lv = graph.create_lvm_lv(vg, "root", ByteCount(GIB / 2)).unwrap();
        graph.create_filesystem(lv, FsType::Ext4).unwrap();

        let features = graph.used_features();
        assert!(features.contains(UsedFeatures::LVM));
        assert!(features.contains(UsedFeatures::EXT));
        assert!(!features.contains(UsedFeatures::BTRFS));
    }
}
