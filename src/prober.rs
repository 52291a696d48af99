//! Probing: fill a device graph from the outputs of system tools. All tool
//! access goes through a caching `SystemInfo`, so repeated questions hit
//! each command once and mockup playback stays deterministic.

use std::collections::BTreeMap;

use log::{debug, warn};

use osutils::{
    blkid::Blkid,
    btrfs as btrfs_cmd,
    cryptsetup::{self, LuksDump, LuksVersion},
    fstab::{self, FstabEntry},
    lsblk::{self, LsblkOutput},
    lvm, mdadm,
    mount::EnsureMounted,
    sfdisk::{self, SfDisk},
    udevadm::{self, UdevadmInfo},
};
use sysdefs::{bytes::ByteCount, filesystems::FsType, region::Region};

use crate::{
    devicegraph::{
        device::{
            BlkDeviceData, BtrfsQgroupData, BtrfsSubvolumeData, DeviceKind, EncryptionType,
            MountPointData, PtType, BTRFS_TOP_LEVEL_SUBVOLUME_ID,
        },
        holder::HolderKind,
        DeviceGraph, View,
    },
    environment,
    error::{Result, StorageError},
    sid::Sid,
};

/// Progress and error reporting during probing. `error` decides whether the
/// failing item is skipped (`true`) or probing aborts (`false`).
pub trait ProbeCallbacks {
    fn begin(&self) {}

    fn end(&self) {}

    fn message(&self, _text: &str) {}

    fn error(&self, _message: &str, _what: &str) -> bool {
        false
    }
}

/// Callbacks that log everything and abort on errors.
#[derive(Debug, Default)]
pub struct SimpleProbeCallbacks;

impl ProbeCallbacks for SimpleProbeCallbacks {
    fn message(&self, text: &str) {
        debug!("probe: {text}");
    }
}

/// Cache of collected command outputs, keyed by command and argument.
#[derive(Default)]
pub struct SystemInfo {
    lsblk: Option<LsblkOutput>,
    udevadm: BTreeMap<String, UdevadmInfo>,
    sfdisk: BTreeMap<String, SfDisk>,
    btrfs_show: Option<Vec<btrfs_cmd::ShowEntry>>,
    blkid: Option<Blkid>,
    mdstat: Option<Vec<mdadm::MdstatEntry>>,
    pvs: Option<Vec<lvm::Pv>>,
    vgs: Option<Vec<lvm::Vg>>,
    lvs: Option<Vec<lvm::Lv>>,
    luks_dumps: BTreeMap<String, LuksDump>,
    fstab: Option<Vec<FstabEntry>>,
}

impl SystemInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lsblk(&mut self) -> Result<&LsblkOutput> {
        if self.lsblk.is_none() {
            self.lsblk = Some(lsblk::run_all()?);
        }
        Ok(self.lsblk.as_ref().unwrap())
    }

    pub fn udevadm_info(&mut self, name: &str) -> Result<&UdevadmInfo> {
        if !self.udevadm.contains_key(name) {
            let info = udevadm::info(name)?;
            self.udevadm.insert(name.to_owned(), info);
        }
        Ok(&self.udevadm[name])
    }

    pub fn sfdisk(&mut self, name: &str) -> Result<&SfDisk> {
        if !self.sfdisk.contains_key(name) {
            let table = sfdisk::run(name)?;
            self.sfdisk.insert(name.to_owned(), table);
        }
        Ok(&self.sfdisk[name])
    }

    pub fn btrfs_filesystem_show(&mut self) -> Result<&[btrfs_cmd::ShowEntry]> {
        if self.btrfs_show.is_none() {
            self.btrfs_show = Some(btrfs_cmd::filesystem_show()?);
        }
        Ok(self.btrfs_show.as_deref().unwrap())
    }

    pub fn blkid(&mut self) -> Result<&Blkid> {
        if self.blkid.is_none() {
            self.blkid = Some(osutils::blkid::run()?);
        }
        Ok(self.blkid.as_ref().unwrap())
    }

    pub fn mdstat(&mut self) -> Result<&[mdadm::MdstatEntry]> {
        if self.mdstat.is_none() {
            self.mdstat = Some(mdadm::mdstat()?);
        }
        Ok(self.mdstat.as_deref().unwrap())
    }

    pub fn pvs(&mut self) -> Result<&[lvm::Pv]> {
        if self.pvs.is_none() {
            self.pvs = Some(lvm::pvs()?);
        }
        Ok(self.pvs.as_deref().unwrap())
    }

    pub fn vgs(&mut self) -> Result<&[lvm::Vg]> {
        if self.vgs.is_none() {
            self.vgs = Some(lvm::vgs()?);
        }
        Ok(self.vgs.as_deref().unwrap())
    }

    pub fn lvs(&mut self) -> Result<&[lvm::Lv]> {
        if self.lvs.is_none() {
            self.lvs = Some(lvm::lvs()?);
        }
        Ok(self.lvs.as_deref().unwrap())
    }

    pub fn luks_dump(&mut self, name: &str) -> Result<&LuksDump> {
        if !self.luks_dumps.contains_key(name) {
            let dump = cryptsetup::luks_dump(name)?;
            self.luks_dumps.insert(name.to_owned(), dump);
        }
        Ok(&self.luks_dumps[name])
    }

    pub fn fstab(&mut self) -> Result<&[FstabEntry]> {
        if self.fstab.is_none() {
            self.fstab = Some(fstab::read("/etc/fstab")?);
        }
        Ok(self.fstab.as_deref().unwrap())
    }
}

pub struct Prober<'a> {
    graph: &'a mut DeviceGraph,
    system_info: &'a mut SystemInfo,
    callbacks: &'a dyn ProbeCallbacks,
    /// (filesystem, snapshot subvolume, origin uuid) left to resolve in
    /// phase 2b; children can precede parents in tool output.
    pending_snapshots: Vec<(Sid, Sid, String)>,
    /// subvolume uuid -> sid, per filesystem resolution pool
    subvolume_uuids: BTreeMap<String, Sid>,
}

impl<'a> Prober<'a> {
    pub fn new(
        graph: &'a mut DeviceGraph,
        system_info: &'a mut SystemInfo,
        callbacks: &'a dyn ProbeCallbacks,
    ) -> Self {
        Prober {
            graph,
            system_info,
            callbacks,
            pending_snapshots: Vec::new(),
            subvolume_uuids: BTreeMap::new(),
        }
    }

    /// Decide what to do with a failed probing step: skip the item when the
    /// callback says so, abort otherwise.
    fn guard(&self, message: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                if self.callbacks.error(message, &error.to_string()) {
                    warn!("{message}: {error}, skipping");
                    Ok(())
                } else {
                    Err(StorageError::Aborted(format!("{message}: {error}")))
                }
            }
        }
    }

    pub fn run(&mut self) -> Result<()> {
        self.callbacks.message("Probing block devices...");
        let result = self.probe_blk_devices();
        self.guard("Probing block devices failed", result)?;

        self.callbacks.message("Probing MD RAIDs...");
        let result = self.probe_mds();
        self.guard("Probing MD RAIDs failed", result)?;

        self.callbacks.message("Probing LVM...");
        let result = self.probe_lvm();
        self.guard("Probing LVM failed", result)?;

        self.callbacks.message("Probing encryption...");
        let result = self.probe_luks();
        self.guard("Probing LUKS failed", result)?;

        self.callbacks.message("Probing file systems...");
        let result = self.probe_filesystems();
        self.guard("Probing file systems failed", result)?;

        self.callbacks.message("Probing relations...");
        let result = self.probe_pass_2b();
        self.guard("Probing relations failed", result)?;

        Ok(())
    }

    fn blk_data_from(device: &lsblk::BlockDevice) -> BlkDeviceData {
        let block_size = device.logical_sector_size.max(512);
        let mut blk = BlkDeviceData::new(&device.name, ByteCount(device.size));
        blk.region = Region::new(0, device.size / block_size, block_size).unwrap_or_default();
        blk.read_only = device.readonly;
        blk
    }

    fn attach_udev_info(&mut self, sid: Sid, name: &str) -> Result<()> {
        match self.system_info.udevadm_info(name) {
            Ok(info) => {
                let ids = info.by_id_links.clone();
                let paths = info.by_path_links.clone();
                if let Some(blk) = self.graph.device_mut(sid)?.blk_mut() {
                    blk.udev_ids = ids;
                    blk.udev_paths = paths;
                }
                Ok(())
            }
            Err(error) => {
                // Udev info is advisory; a miss is not fatal for the device.
                debug!("no udev info for {name}: {error}");
                Ok(())
            }
        }
    }

    fn probe_blk_devices(&mut self) -> Result<()> {
        let lsblk = self.system_info.lsblk()?.clone();

        for top in &lsblk.blockdevices {
            let blk = Self::blk_data_from(top);
            let disk = match top.blkdev_type.as_str() {
                "disk" => self
                    .graph
                    .add_device(DeviceKind::Disk { blk, rotational: top.rota }),
                "mpath" => self.graph.add_device(DeviceKind::Multipath {
                    blk,
                    vendor: String::new(),
                    model: String::new(),
                }),
                "dm" if top.fstype.is_none() => {
                    self.graph.add_device(DeviceKind::DmRaid { blk })
                }
                "rom" | "loop" => continue,
                _ => {
                    if top.fstype.is_some() || !top.children.is_empty() {
                        self.graph.add_device(DeviceKind::StrayBlkDevice { blk });
                    }
                    continue;
                }
            };
            self.attach_udev_info(disk, &top.name)?;

            let Some(pttype) = top.pttype.as_deref() else {
                continue;
            };

            // A filesystem signature can coexist with traces of an empty
            // msdos partition table; prefer the filesystem when told so.
            if pttype == "dos"
                && top.fstype.is_some()
                && top.children.is_empty()
                && environment::prefer_filesystem_over_empty_msdos()
            {
                debug!("preferring filesystem over empty msdos table on {}", top.name);
                continue;
            }

            let pt_type = match pttype {
                "gpt" => PtType::Gpt,
                "dos" => PtType::Msdos,
                "dasd" => PtType::Dasd,
                other => {
                    warn!("unknown partition table type '{other}' on {}", top.name);
                    continue;
                }
            };

            let table = self.graph.add_device(DeviceKind::PartitionTable {
                pt_type,
                uuid: top.ptuuid.clone().unwrap_or_default(),
            });
            self.graph.add_holder(disk, table, HolderKind::User)?;

            let result = self.probe_partitions(table, top);
            self.guard(&format!("Probing partitions of {} failed", top.name), result)?;
        }
        Ok(())
    }

    fn probe_partitions(&mut self, table: Sid, disk: &lsblk::BlockDevice) -> Result<()> {
        let sf_table = self.system_info.sfdisk(&disk.name)?.clone();

        for child in &disk.children {
            if !child.is_partition() {
                continue;
            }

            let sf_partition = sf_table
                .partitions
                .iter()
                .find(|p| p.node == child.name)
                .ok_or_else(|| {
                    StorageError::NotFound(format!("partition {} in sfdisk output", child.name))
                })?;

            let mut blk = Self::blk_data_from(child);
            blk.region = Region::new(
                sf_partition.start,
                sf_partition.size,
                sf_table.sectorsize,
            )
            .map_err(|e| StorageError::InvariantViolation(e.to_string()))?;

            let number = sf_partition.number().unwrap_or(0);
            let partition = self.graph.add_device(DeviceKind::Partition {
                blk,
                number,
                partition_id: sf_partition.partition_type.clone(),
                legacy_boot: sf_partition.bootable,
            });
            self.graph.add_holder(table, partition, HolderKind::Subdevice)?;
            self.attach_udev_info(partition, &child.name)?;
        }
        Ok(())
    }

    fn probe_mds(&mut self) -> Result<()> {
        let entries = self.system_info.mdstat()?.to_vec();

        for entry in entries {
            let size = ByteCount(entry.blocks * 1024);
            let mut blk = BlkDeviceData::new(&entry.name, size);
            blk.region = Region::new(0, size.0 / 512, 512).unwrap_or_default();

            let md = self.graph.add_device(DeviceKind::Md {
                blk,
                level: entry.level,
                uuid: String::new(),
            });

            for device in &entry.devices {
                let Some(member) = self.graph.find_by_name(&device.name) else {
                    warn!("md member {} not found in graph", device.name);
                    continue;
                };
                self.graph.add_holder(
                    member,
                    md,
                    HolderKind::MdUser { spare: device.spare, faulty: device.faulty },
                )?;
            }
        }
        Ok(())
    }

    fn probe_lvm(&mut self) -> Result<()> {
        let pvs = self.system_info.pvs()?.to_vec();
        let vgs = self.system_info.vgs()?.to_vec();
        let lvs = self.system_info.lvs()?.to_vec();

        let mut vgs_by_name: BTreeMap<String, Sid> = BTreeMap::new();

        for vg in &vgs {
            let sid = self.graph.add_device(DeviceKind::LvmVg {
                vg_name: vg.vg_name.clone(),
                uuid: vg.vg_uuid.clone(),
                extent_size: ByteCount(lvm::number(&vg.vg_extent_size)?),
                extent_count: lvm::number(&vg.vg_extent_count)?,
            });
            vgs_by_name.insert(vg.vg_name.clone(), sid);
        }

        for pv in &pvs {
            let Some(blk_device) = self.graph.find_by_name(&pv.pv_name) else {
                warn!("pv device {} not found in graph", pv.pv_name);
                continue;
            };
            let pv_sid = self.graph.add_device(DeviceKind::LvmPv {
                uuid: pv.pv_uuid.clone(),
                pe_start: ByteCount(lvm::number(&pv.pe_start).unwrap_or(1 << 20)),
            });
            self.graph.add_holder(blk_device, pv_sid, HolderKind::User)?;

            if let Some(vg_sid) = vgs_by_name.get(&pv.vg_name) {
                self.graph.add_holder(pv_sid, *vg_sid, HolderKind::User)?;
            }
        }

        for lv in &lvs {
            let Some(vg_sid) = vgs_by_name.get(&lv.vg_name) else {
                warn!("vg {} of lv {} not probed", lv.vg_name, lv.lv_name);
                continue;
            };
            let size = ByteCount(lvm::number(&lv.lv_size)?);
            let mut blk = BlkDeviceData::new(
                format!("/dev/mapper/{}-{}", lv.vg_name, lv.lv_name),
                size,
            );
            blk.region = Region::new(0, size.0 / 512, 512).unwrap_or_default();

            let lv_sid = self.graph.add_device(DeviceKind::LvmLv {
                blk,
                lv_name: lv.lv_name.clone(),
                uuid: lv.lv_uuid.clone(),
            });
            self.graph.add_holder(*vg_sid, lv_sid, HolderKind::Subdevice)?;
        }
        Ok(())
    }

    fn probe_luks(&mut self) -> Result<()> {
        let lsblk = self.system_info.lsblk()?.clone();

        for device in lsblk.all_devices() {
            if device.fstype.as_deref() == Some("BitLocker") {
                self.probe_bitlocker(device)?;
                continue;
            }
            if device.fstype.as_deref() != Some("crypto_LUKS") {
                continue;
            }
            let Some(underlying) = self.graph.find_by_name(&device.name) else {
                warn!("luks device {} not found in graph", device.name);
                continue;
            };

            let dump = self.system_info.luks_dump(&device.name)?.clone();

            // The open plaintext device shows up as a crypt child.
            let open_child = device
                .children
                .iter()
                .find(|child| child.blkdev_type == "crypt");

            let (blk, dm_name) = match open_child {
                Some(child) => {
                    let dm_name = child
                        .name
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .to_owned();
                    (Self::blk_data_from(child), dm_name)
                }
                None => {
                    let dm_name = format!(
                        "cr-{}",
                        device.name.rsplit('/').next().unwrap_or_default()
                    );
                    let size = ByteCount(device.size.saturating_sub(16 << 20));
                    (
                        BlkDeviceData::new(format!("/dev/mapper/{dm_name}"), size),
                        dm_name,
                    )
                }
            };

            let luks = self.graph.add_device(DeviceKind::Luks {
                blk,
                dm_name,
                encryption_type: match dump.version {
                    LuksVersion::Luks1 => EncryptionType::Luks1,
                    LuksVersion::Luks2 => EncryptionType::Luks2,
                },
                uuid: dump.uuid.clone(),
                label: dump.label.clone().unwrap_or_default(),
                cipher: dump.cipher.clone(),
                key_size: dump.key_size,
                pbkdf: dump.pbkdf.clone().unwrap_or_default(),
                integrity: dump.integrity.clone().unwrap_or_default(),
            });
            self.graph.add_holder(underlying, luks, HolderKind::User)?;
        }
        Ok(())
    }

    fn probe_bitlocker(&mut self, device: &lsblk::BlockDevice) -> Result<()> {
        let Some(underlying) = self.graph.find_by_name(&device.name) else {
            warn!("bitlocker device {} not found in graph", device.name);
            return Ok(());
        };

        // An unlocked volume shows up as a crypt child, whether opened by
        // cryptsetup or by another tool.
        let open_child = device
            .children
            .iter()
            .find(|child| child.blkdev_type == "crypt");
        let (blk, dm_name) = match open_child {
            Some(child) => {
                let dm_name = child.name.rsplit('/').next().unwrap_or_default().to_owned();
                (Self::blk_data_from(child), dm_name)
            }
            None => {
                let dm_name = format!(
                    "cr-{}",
                    device.name.rsplit('/').next().unwrap_or_default()
                );
                (
                    BlkDeviceData::new(
                        format!("/dev/mapper/{dm_name}"),
                        ByteCount(device.size),
                    ),
                    dm_name,
                )
            }
        };

        let bitlocker = self.graph.add_device(DeviceKind::BitlockerV2 {
            blk,
            dm_name,
            uuid: device.uuid.clone().unwrap_or_default(),
        });
        self.graph.add_holder(underlying, bitlocker, HolderKind::User)?;
        Ok(())
    }

    /// Phase 2a: per-filesystem probing.
    fn probe_filesystems(&mut self) -> Result<()> {
        let lsblk = self.system_info.lsblk()?.clone();
        let mut probed_btrfs_uuids: Vec<String> = Vec::new();

        for device in lsblk.all_devices() {
            let Some(fstype) = device.fstype.as_deref() else {
                continue;
            };
            if matches!(
                fstype,
                "crypto_LUKS" | "LVM2_member" | "linux_raid_member" | "BitLocker"
            ) {
                continue;
            }
            let Ok(fs_type) = fstype.parse::<FsType>() else {
                debug!("unhandled filesystem type '{fstype}' on {}", device.name);
                continue;
            };

            let Some(blk_device) = self.graph.find_by_name(&device.name) else {
                warn!("device {} with {} not found in graph", device.name, fstype);
                continue;
            };

            if fs_type == FsType::Btrfs {
                let uuid = device.uuid.clone().unwrap_or_default();
                if probed_btrfs_uuids.contains(&uuid) {
                    continue;
                }
                probed_btrfs_uuids.push(uuid.clone());

                let result = self.probe_btrfs(&lsblk, device, &uuid);
                self.guard(&format!("Probing btrfs on {} failed", device.name), result)?;
                continue;
            }

            let filesystem = self.graph.create_filesystem(blk_device, fs_type)?;
            {
                let fs = self.graph.device_mut(filesystem)?.as_filesystem_mut()?;
                fs.label = device.label.clone().unwrap_or_default();
                fs.uuid = device.uuid.clone().unwrap_or_default();
            }
            self.probe_mount_point(filesystem, device)?;
        }
        Ok(())
    }

    /// One btrfs, possibly spanning several devices.
    fn probe_btrfs(
        &mut self,
        lsblk: &LsblkOutput,
        first_device: &lsblk::BlockDevice,
        uuid: &str,
    ) -> Result<()> {
        let multi_device = environment::multiple_devices_btrfs();
        let show_entry = if multi_device {
            self.system_info
                .btrfs_filesystem_show()?
                .iter()
                .find(|entry| entry.uuid == uuid)
                .cloned()
        } else {
            None
        };

        let members: Vec<(u64, String)> = match &show_entry {
            Some(entry) => entry
                .devices
                .iter()
                .map(|device| (device.id, device.name.clone()))
                .collect(),
            None => vec![(1, first_device.name.clone())],
        };

        let first_member = self
            .graph
            .find_by_name(&members[0].1)
            .ok_or_else(|| StorageError::NotFound(format!("device {}", members[0].1)))?;

        let filesystem = self.graph.create_filesystem(first_member, FsType::Btrfs)?;
        {
            let device = self.graph.device_mut(filesystem)?;
            let (fs, btrfs) = device.as_btrfs_mut()?;
            fs.label = first_device.label.clone().unwrap_or_default();
            fs.uuid = uuid.to_owned();
            btrfs.used_size = ByteCount(show_entry.as_ref().map(|e| e.used).unwrap_or(0));
        }

        // Correct the devid of the first member and attach the others.
        {
            let holder = self
                .graph
                .holders_in(filesystem, View::All)?
                .into_iter()
                .find(|h| matches!(h.kind, HolderKind::FilesystemUser { .. }))
                .ok_or(StorageError::NullReference("btrfs without member holder"))?;
            self.graph.holder_mut(holder.sid)?.kind =
                HolderKind::FilesystemUser { devid: members[0].0, journal: false };
        }
        for (devid, name) in members.iter().skip(1) {
            let member = self
                .graph
                .find_by_name(name)
                .ok_or_else(|| StorageError::NotFound(format!("device {name}")))?;
            self.graph.add_holder(
                member,
                filesystem,
                HolderKind::FilesystemUser { devid: *devid, journal: false },
            )?;
        }

        // Mount points can sit on any member device; lsblk reports them on
        // each, use the first that has one.
        let mounted_on = members.iter().find_map(|(_, name)| {
            lsblk
                .find_by_name(name)
                .and_then(|device| device.mountpoint.clone())
        });
        if let Some(path) = &mounted_on {
            self.add_mount_point(filesystem, path, first_device)?;
        } else {
            self.add_fstab_only_mount_point(filesystem, first_device)?;
        }

        // Everything below needs the filesystem mounted somewhere.
        let key = members[0].1.clone();
        let mounted = EnsureMounted::new(
            &key,
            mounted_on
                .as_deref()
                .filter(|path| *path != "[SWAP]")
                .map(std::path::Path::new),
        )?;
        let mount_path = mounted.mount_point().to_string_lossy().to_string();

        let df = btrfs_cmd::filesystem_df(&mount_path, &key)?;
        {
            let device = self.graph.device_mut(filesystem)?;
            let (_, btrfs) = device.as_btrfs_mut()?;
            btrfs.metadata_raid_level = df.metadata_raid_level;
            btrfs.data_raid_level = df.data_raid_level;
        }

        let subvolumes = btrfs_cmd::subvolume_list(&mount_path, &key)?;
        let top_level = self.graph.btrfs_top_level_subvolume(filesystem)?;

        // Two passes: create all subvolumes first, then wire the tree.
        // Children can precede parents in the tool output.
        let mut by_id: BTreeMap<u64, Sid> = BTreeMap::new();
        by_id.insert(BTRFS_TOP_LEVEL_SUBVOLUME_ID, top_level);
        for entry in &subvolumes {
            let sid = self.graph.add_device(DeviceKind::BtrfsSubvolume(
                BtrfsSubvolumeData {
                    id: entry.id,
                    path: entry.path.clone(),
                    uuid: entry.uuid.clone(),
                    ..Default::default()
                },
            ));
            by_id.insert(entry.id, sid);
            if !entry.uuid.is_empty() {
                self.subvolume_uuids.insert(entry.uuid.clone(), sid);
            }
        }
        for entry in &subvolumes {
            let child = by_id[&entry.id];
            let parent = by_id.get(&entry.parent_id).copied().unwrap_or_else(|| {
                warn!(
                    "parent {} of subvolume {} not found, attaching to top level",
                    entry.parent_id, entry.path
                );
                top_level
            });
            self.graph.add_holder(parent, child, HolderKind::Subdevice)?;

            if environment::btrfs_snapshot_relations() {
                if let Some(parent_uuid) = &entry.parent_uuid {
                    self.pending_snapshots
                        .push((filesystem, child, parent_uuid.clone()));
                }
            }
        }

        let default_id = btrfs_cmd::subvolume_get_default(&mount_path, &key)?;
        if default_id != BTRFS_TOP_LEVEL_SUBVOLUME_ID {
            if let Some(default_sid) = by_id.get(&default_id) {
                self.graph
                    .device_mut(*default_sid)?
                    .as_btrfs_subvolume_mut()?
                    .default_subvolume = true;
            }
        }

        if environment::btrfs_qgroups() {
            if let Some(qgroups) = btrfs_cmd::qgroup_show(&mount_path, &key)? {
                self.graph.device_mut(filesystem)?.as_btrfs_mut()?.1.quota = true;

                let mut qgroup_sids: BTreeMap<btrfs_cmd::QgroupId, Sid> = BTreeMap::new();
                for entry in &qgroups {
                    let sid = self.graph.add_device(DeviceKind::BtrfsQgroup(
                        BtrfsQgroupData {
                            id: entry.id,
                            referenced: entry.referenced,
                            exclusive: entry.exclusive,
                            referenced_limit: entry.referenced_limit,
                            exclusive_limit: entry.exclusive_limit,
                        },
                    ));
                    self.graph.add_holder(filesystem, sid, HolderKind::Subdevice)?;
                    qgroup_sids.insert(entry.id, sid);

                    // Level-0 qgroups shadow their subvolume.
                    if entry.id.0 == 0 {
                        if let Some(subvolume) = by_id.get(&entry.id.1) {
                            self.graph.add_holder(
                                *subvolume,
                                sid,
                                HolderKind::BtrfsQgroupRelation,
                            )?;
                        }
                    }
                }
                for entry in &qgroups {
                    for parent_id in &entry.parents {
                        if let (Some(parent), Some(child)) =
                            (qgroup_sids.get(parent_id), qgroup_sids.get(&entry.id))
                        {
                            self.graph.add_holder(
                                *parent,
                                *child,
                                HolderKind::BtrfsQgroupRelation,
                            )?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn probe_mount_point(&mut self, filesystem: Sid, device: &lsblk::BlockDevice) -> Result<()> {
        match &device.mountpoint {
            Some(path) => self.add_mount_point(filesystem, path, device),
            None => self.add_fstab_only_mount_point(filesystem, device),
        }
    }

    fn add_mount_point(
        &mut self,
        filesystem: Sid,
        path: &str,
        device: &lsblk::BlockDevice,
    ) -> Result<()> {
        let path = if path == "[SWAP]" { "swap" } else { path };
        let fstab_entry = self.find_fstab_entry(device, path)?;

        let mount_point = self.graph.add_device(DeviceKind::MountPoint(MountPointData {
            path: path.to_owned(),
            active: true,
            in_etc_fstab: fstab_entry.is_some(),
            mount_options: fstab_entry
                .as_ref()
                .map(|entry| entry.options.clone())
                .unwrap_or_default(),
            freq: fstab_entry.as_ref().map(|entry| entry.freq).unwrap_or(0),
            passno: fstab_entry.as_ref().map(|entry| entry.passno).unwrap_or(0),
        }));
        self.graph
            .add_holder(filesystem, mount_point, HolderKind::Subdevice)?;
        Ok(())
    }

    /// A filesystem that is not mounted may still have an fstab entry.
    fn add_fstab_only_mount_point(
        &mut self,
        filesystem: Sid,
        device: &lsblk::BlockDevice,
    ) -> Result<()> {
        let Some(entry) = self.find_fstab_entry(device, "")? else {
            return Ok(());
        };

        let path = if entry.fs_type == "swap" || entry.mount_point == "none" {
            "swap".to_owned()
        } else {
            entry.mount_point.clone()
        };
        let mount_point = self.graph.add_device(DeviceKind::MountPoint(MountPointData {
            path,
            active: false,
            in_etc_fstab: true,
            mount_options: entry.options.clone(),
            freq: entry.freq,
            passno: entry.passno,
        }));
        self.graph
            .add_holder(filesystem, mount_point, HolderKind::Subdevice)?;
        Ok(())
    }

    fn find_fstab_entry(
        &mut self,
        device: &lsblk::BlockDevice,
        mount_path: &str,
    ) -> Result<Option<FstabEntry>> {
        let uuid_spec = device
            .uuid
            .as_ref()
            .map(|uuid| format!("UUID={uuid}"))
            .unwrap_or_default();
        let name = device.name.clone();

        let entries = self.system_info.fstab()?;
        Ok(entries
            .iter()
            .find(|entry| {
                entry.device == name
                    || (!uuid_spec.is_empty() && entry.device == uuid_spec)
                    || (!mount_path.is_empty()
                        && mount_path != "swap"
                        && entry.mount_point == mount_path)
            })
            .cloned())
    }

    /// Phase 2b: relations crossing filesystems, resolved with repeated
    /// passes since discovery order is arbitrary.
    fn probe_pass_2b(&mut self) -> Result<()> {
        // Snapshot origins.
        let mut pending = std::mem::take(&mut self.pending_snapshots);
        loop {
            let before = pending.len();
            let mut unresolved = Vec::new();

            for (filesystem, snapshot, origin_uuid) in pending {
                match self.subvolume_uuids.get(&origin_uuid) {
                    Some(origin) => {
                        self.graph
                            .add_holder(*origin, snapshot, HolderKind::Snapshot)?;
                    }
                    None => unresolved.push((filesystem, snapshot, origin_uuid)),
                }
            }

            pending = unresolved;
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        for (_, snapshot, origin_uuid) in pending {
            debug!(
                "origin {origin_uuid} of snapshot sid {snapshot} not found, \
                 possibly deleted"
            );
        }

        // External xfs journals.
        let mut journals: Vec<(Sid, String)> = Vec::new();
        for sid in self.graph.all_sids() {
            let Ok(fs) = self.graph.device(sid)?.as_filesystem() else {
                continue;
            };
            if fs.fs_type != FsType::Xfs || fs.uuid.is_empty() {
                continue;
            }
            if let Some(journal_device) = self.system_info.blkid()?.find_by_journal_uuid(&fs.uuid)
            {
                journals.push((sid, journal_device.to_owned()));
            }
        }
        for (filesystem, journal_device) in journals {
            let Some(device) = self.graph.find_by_name(&journal_device) else {
                warn!("journal device {journal_device} not found in graph");
                continue;
            };
            self.graph.add_holder(
                device,
                filesystem,
                HolderKind::FilesystemUser { devid: 0, journal: true },
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osutils::mockup::{self, Command, Mode};

    const LSBLK_KEY: &str = "lsblk --json --bytes --paths --output \
         NAME,KNAME,TYPE,SIZE,FSTYPE,LABEL,UUID,PTTYPE,PTUUID,PARTUUID,PKNAME,MOUNTPOINT,RO,ROTA,LOG-SEC";

    fn empty_report(key_prefix: &str, options: &str) -> (String, Command) {
        (
            format!(
                "{key_prefix} --reportformat json --config \
                 'log {{ command_names = 0 prefix = \"\" }}' --units b --nosuffix --all \
                 --options {options}"
            ),
            Command::from_stdout(vec!["{\"report\": []}".to_owned()]),
        )
    }

    fn set_stdout(key: &str, lines: &[&str]) {
        mockup::set_command(
            key,
            Command::from_stdout(lines.iter().map(|s| s.to_string()).collect()),
        );
    }

    fn fill_mockup_for_btrfs_system() {
        mockup::clear();

        set_stdout(
            LSBLK_KEY,
            &[r#"{"blockdevices": [
                {"name": "/dev/sda", "kname": "/dev/sda", "type": "disk", "size": 34359738368,
                 "pttype": "gpt", "ptuuid": "8e382fb6-8fb0-4e5c-ac6e-4cb05af3a92f",
                 "ro": false, "rota": true, "log-sec": 512,
                 "children": [
                    {"name": "/dev/sda1", "kname": "/dev/sda1", "type": "part",
                     "size": 1073741824, "fstype": "btrfs", "label": "data",
                     "uuid": "ea108250-d02c-41dd-b4d8-d4a707a5c649",
                     "pkname": "/dev/sda", "mountpoint": "/data", "log-sec": 512},
                    {"name": "/dev/sda2", "kname": "/dev/sda2", "type": "part",
                     "size": 1073741824, "fstype": "swap",
                     "uuid": "5bd50d3c-a2e9-4d5c-b18b-b9c7d1a8e101",
                     "pkname": "/dev/sda", "mountpoint": "[SWAP]", "log-sec": 512}
                 ]}
            ]}"#],
        );

        set_stdout(
            "sfdisk --json /dev/sda",
            &[r#"{"partitiontable": {
                "label": "gpt", "id": "8E382FB6-8FB0-4E5C-AC6E-4CB05AF3A92F",
                "device": "/dev/sda", "unit": "sectors",
                "firstlba": 2048, "lastlba": 67108830, "sectorsize": 512,
                "partitions": [
                   {"node": "/dev/sda1", "start": 2048, "size": 2097152,
                    "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4"},
                   {"node": "/dev/sda2", "start": 2099200, "size": 2097152,
                    "type": "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F"}
                ]}}"#],
        );

        set_stdout(
            "btrfs filesystem show",
            &[
                "Label: 'data'  uuid: ea108250-d02c-41dd-b4d8-d4a707a5c649",
                "        Total devices 1 FS bytes used 28.00KiB",
                "        devid    1 size 1.00GiB used 138.38MiB path /dev/sda1",
                "",
                "Btrfs v6.5.1",
            ],
        );
        set_stdout(
            "btrfs filesystem df (device:/dev/sda1)",
            &[
                "Data, single: total=8.00MiB, used=64.00KiB",
                "Metadata, DUP: total=102.38MiB, used=112.00KiB",
            ],
        );
        set_stdout(
            "btrfs subvolume list -a -puq (device:/dev/sda1)",
            &[
                "ID 257 gen 22 parent 256 top level 256 parent_uuid \
                 9f24374e-8b4e-8f4d-8d2d-2d1eafa2c8bc uuid \
                 0c3c1b4c-12a1-4a4e-a381-69dbd8a67b0b path <FS_TREE>/sub1/snap",
                "ID 256 gen 22 parent 5 top level 5 parent_uuid - uuid \
                 9f24374e-8b4e-8f4d-8d2d-2d1eafa2c8bc path <FS_TREE>/sub1",
            ],
        );
        set_stdout(
            "btrfs subvolume get-default (device:/dev/sda1)",
            &["ID 256 gen 22 top level 5 path sub1"],
        );
        set_stdout(
            "btrfs qgroup show -rep --raw (device:/dev/sda1)",
            &[
                "qgroupid         rfer         excl     max_rfer     max_excl parent  ",
                "--------         ----         ----     --------     -------- ------  ",
                "0/5             16384        16384         none         none ---     ",
                "0/256           16384        16384   1073741824         none 1/100   ",
                "0/257           16384        16384         none         none ---     ",
                "1/100           16384        16384         none         none ---     ",
            ],
        );

        let (pvs_key, pvs) =
            empty_report("pvs", "pv_name,pv_uuid,vg_name,vg_uuid,pv_attr,pe_start");
        mockup::set_command(pvs_key, pvs);
        let (vgs_key, vgs) = empty_report(
            "vgs",
            "vg_name,vg_uuid,vg_attr,vg_extent_size,vg_extent_count,vg_free_count",
        );
        mockup::set_command(vgs_key, vgs);
        let (lvs_key, lvs) =
            empty_report("lvs", "lv_name,lv_uuid,vg_name,vg_uuid,lv_attr,lv_size");
        mockup::set_command(lvs_key, lvs);
    }

    #[test]
    fn test_probe_btrfs_system() {
        let _guard = osutils::testing::playback_lock();
        mockup::set_mode(Mode::Playback);
        fill_mockup_for_btrfs_system();

        let mut graph = DeviceGraph::new();
        let mut system_info = SystemInfo::new();
        let callbacks = SimpleProbeCallbacks;
        Prober::new(&mut graph, &mut system_info, &callbacks)
            .run()
            .unwrap();

        graph.check().unwrap();

        // Disk, table and both partitions with their sfdisk regions.
        let disk = graph.find_by_name("/dev/sda").unwrap();
        let table = graph.partition_table_of(disk).unwrap().unwrap();
        let partitions = graph.partitions_of(table).unwrap();
        assert_eq!(partitions.len(), 2);
        let sda1 = graph.find_by_name("/dev/sda1").unwrap();
        let (blk, number) = graph.device(sda1).unwrap().as_partition().unwrap();
        assert_eq!(number, 1);
        assert_eq!(blk.region.start(), 2048);
        assert_eq!(blk.region.length(), 2097152);

        // The btrfs with label, uuid and raid levels.
        let filesystem = graph.children(sda1, View::Classic).unwrap()[0];
        let device = graph.device(filesystem).unwrap();
        let (fs, btrfs) = device.as_btrfs().unwrap();
        assert_eq!(fs.uuid, "ea108250-d02c-41dd-b4d8-d4a707a5c649");
        assert_eq!(fs.label, "data");
        assert_eq!(
            btrfs.data_raid_level,
            sysdefs::raid::BtrfsRaidLevel::Single
        );
        assert_eq!(btrfs.metadata_raid_level, sysdefs::raid::BtrfsRaidLevel::Dup);
        assert!(btrfs.quota);

        // Subvolume tree: top level, sub1, snap below sub1. The default is
        // sub1 even though the list reported the snapshot first.
        let subvolumes = graph.btrfs_subvolumes(filesystem).unwrap();
        assert_eq!(subvolumes.len(), 3);
        let sub1 = graph
            .btrfs_find_subvolume_by_path(filesystem, "sub1")
            .unwrap();
        let snap = graph
            .btrfs_find_subvolume_by_path(filesystem, "sub1/snap")
            .unwrap();
        assert_eq!(graph.parents(snap, View::Classic).unwrap(), vec![sub1]);
        assert_eq!(graph.btrfs_default_subvolume(filesystem).unwrap(), sub1);

        // The snapshot relation points from the origin to the snapshot and
        // is invisible in the classic view.
        assert_eq!(graph.children(sub1, View::Classic).unwrap(), vec![snap]);
        let snapshot_holders = graph.holders_in(snap, View::All).unwrap();
        assert!(snapshot_holders
            .iter()
            .any(|h| matches!(h.kind, HolderKind::Snapshot) && h.source == sub1));

        // Qgroups: three level-0 plus one level-1, with the probed
        // parent relation.
        let qgroups = graph.btrfs_qgroups(filesystem).unwrap();
        assert_eq!(qgroups.len(), 4);
        let level0 = graph
            .btrfs_find_qgroup_by_id(filesystem, (0, 256))
            .unwrap();
        let parent = graph.btrfs_find_qgroup_by_id(filesystem, (1, 100)).unwrap();
        assert!(graph
            .holders_in(level0, View::All)
            .unwrap()
            .iter()
            .any(|h| matches!(h.kind, HolderKind::BtrfsQgroupRelation) && h.source == parent));
        assert_eq!(
            graph
                .device(level0)
                .unwrap()
                .as_btrfs_qgroup()
                .unwrap()
                .referenced_limit,
            Some(1073741824)
        );

        // The mounted btrfs and the active swap.
        let mount_point = graph
            .children(filesystem, View::Classic)
            .unwrap()
            .into_iter()
            .find(|sid| graph.device(*sid).unwrap().as_mount_point().is_ok())
            .unwrap();
        let mp = graph.device(mount_point).unwrap().as_mount_point().unwrap();
        assert_eq!(mp.path, "/data");
        assert!(mp.active);
        assert!(!mp.in_etc_fstab);

        let sda2 = graph.find_by_name("/dev/sda2").unwrap();
        let swap = graph.children(sda2, View::Classic).unwrap()[0];
        assert_eq!(
            graph.device(swap).unwrap().as_filesystem().unwrap().fs_type,
            FsType::Swap
        );
        let swap_mount = graph.children(swap, View::Classic).unwrap()[0];
        let mp = graph.device(swap_mount).unwrap().as_mount_point().unwrap();
        assert_eq!(mp.path, "swap");
        assert!(mp.active);

        mockup::set_mode(Mode::None);
    }
}
