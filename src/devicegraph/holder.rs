use serde::{Deserialize, Serialize};

use crate::sid::Sid;

/// The typed edges of a device graph. Edges point from the container or
/// backing device (source) to the dependent device (target).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HolderKind {
    /// Generic usage: disk -> partition table, blk device -> lvm pv,
    /// pv -> vg, blk device -> luks, ...
    User,

    /// Containment: partition table -> partition, vg -> lv,
    /// btrfs -> top-level subvolume, subvolume -> subvolume,
    /// filesystem -> mount point.
    Subdevice,

    /// A block device backing a filesystem. For btrfs the edge carries the
    /// member devid; `journal` marks an external journal device.
    FilesystemUser {
        #[serde(default)]
        devid: u64,
        #[serde(default)]
        journal: bool,
    },

    /// A block device belonging to an MD RAID.
    MdUser {
        #[serde(default)]
        spare: bool,
        #[serde(default)]
        faulty: bool,
    },

    /// Snapshot origin -> snapshot. Never traversed by default, see the
    /// graph views.
    Snapshot,

    /// Subvolume -> its level-0 qgroup, or parent qgroup -> child qgroup.
    /// Never traversed by default.
    BtrfsQgroupRelation,
}

impl HolderKind {
    pub fn variant_name(&self) -> &'static str {
        match self {
            HolderKind::User => "User",
            HolderKind::Subdevice => "Subdevice",
            HolderKind::FilesystemUser { .. } => "FilesystemUser",
            HolderKind::MdUser { .. } => "MdUser",
            HolderKind::Snapshot => "Snapshot",
            HolderKind::BtrfsQgroupRelation => "BtrfsQgroupRelation",
        }
    }
}

/// An edge of a device graph. Like devices, holders carry their own sid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holder {
    sid: Sid,
    pub kind: HolderKind,
}

impl Holder {
    pub fn new(kind: HolderKind) -> Self {
        Holder {
            sid: Sid::allocate(),
            kind,
        }
    }

    pub(crate) fn with_sid(sid: Sid, kind: HolderKind) -> Self {
        Holder { sid, kind }
    }

    pub fn sid(&self) -> Sid {
        self.sid
    }
}

/// A resolved view of one holder: its endpoints by sid plus the edge data.
/// Returned by graph queries to avoid borrowing the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct HolderView {
    pub sid: Sid,
    pub source: Sid,
    pub target: Sid,
    pub kind: HolderKind,
}
