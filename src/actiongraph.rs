//! Computes the action graph: the diff between two device graphs as a DAG
//! of primitive actions with ordering constraints, plus a deterministic
//! commit order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};

use log::debug;
use petgraph::{
    stable_graph::{NodeIndex, StableDiGraph},
    visit::EdgeRef,
    Direction,
};

use sysdefs::filesystems::FsType;

use crate::{
    actions::{Action, CommitData, ReallotMode, ResizeMode, Tense},
    devicegraph::{device::DeviceKind, holder::HolderKind, DeviceGraph, View},
    error::{Result, StorageError},
    features::UsedFeatures,
    sid::Sid,
};

/// A user-visible grouping of related primitive actions with one text.
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundAction {
    /// The device the group is about.
    pub target: Sid,
    /// Positions of the member actions in the commit order.
    pub actions: Vec<usize>,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct ActionGraph {
    graph: StableDiGraph<Action, ()>,
    order: Vec<NodeIndex>,
    features: UsedFeatures,
    compounds: Vec<CompoundAction>,
}

impl ActionGraph {
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn num_actions(&self) -> usize {
        self.graph.node_count()
    }

    pub fn used_features(&self) -> UsedFeatures {
        self.features
    }

    /// The actions in commit order.
    pub fn commit_actions(&self) -> Vec<&Action> {
        self.order.iter().map(|node| &self.graph[*node]).collect()
    }

    pub fn commit_actions_as_strings(&self, data: CommitData) -> Vec<String> {
        self.commit_actions()
            .iter()
            .map(|action| action.text(Tense::SimplePresent, data))
            .collect()
    }

    pub fn compound_actions(&self) -> &[CompoundAction] {
        &self.compounds
    }

    pub(crate) fn ordered_nodes(&self) -> &[NodeIndex] {
        &self.order
    }

    pub(crate) fn action(&self, node: NodeIndex) -> &Action {
        &self.graph[node]
    }

    /// Everything that transitively depends on `node`.
    pub(crate) fn dependents(&self, node: NodeIndex) -> BTreeSet<NodeIndex> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([node]);
        while let Some(current) = queue.pop_front() {
            for edge in self.graph.edges_directed(current, Direction::Outgoing) {
                if seen.insert(edge.target()) {
                    queue.push_back(edge.target());
                }
            }
        }
        seen
    }

    /// Check the ordering property: every edge points forward in the
    /// commit order.
    #[cfg(test)]
    pub(crate) fn order_is_sound(&self) -> bool {
        let position: BTreeMap<NodeIndex, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(position, node)| (*node, position))
            .collect();
        self.graph.edge_indices().all(|edge| {
            let (a, b) = self.graph.edge_endpoints(edge).unwrap();
            position[&a] < position[&b]
        })
    }

    pub fn build(lhs: &DeviceGraph, rhs: &DeviceGraph) -> Result<ActionGraph> {
        let mut builder = Builder {
            lhs,
            rhs,
            graph: StableDiGraph::new(),
            chains: BTreeMap::new(),
        };

        builder.classify()?;
        builder.synthesize_resizes()?;
        builder.synthesize_reallots()?;
        builder.synthesize_qgroup_relations()?;
        builder.add_dependencies()?;

        let order = builder.topological_order()?;
        let features = builder.used_features();

        let mut actiongraph = ActionGraph {
            graph: builder.graph,
            order,
            features,
            compounds: Vec::new(),
        };
        actiongraph.generate_compound_actions(CommitData { lhs, rhs });

        debug!(
            "action graph: {} actions, features '{}'",
            actiongraph.num_actions(),
            actiongraph.features.names()
        );

        Ok(actiongraph)
    }

    /// Collapse related primitives into user-visible compound actions,
    /// keeping references to the underlying primitives.
    fn generate_compound_actions(&mut self, data: CommitData) {
        let mut groups: BTreeMap<Sid, Vec<usize>> = BTreeMap::new();

        for (position, node) in self.order.iter().enumerate() {
            let action = &self.graph[*node];
            let graph = if action.uses_lhs() { data.lhs } else { data.rhs };
            let target = compound_target(graph, action.sid());
            groups.entry(target).or_default().push(position);
        }

        let mut compounds: Vec<CompoundAction> = groups
            .into_iter()
            .map(|(target, actions)| {
                let texts: Vec<String> = actions
                    .iter()
                    .map(|position| {
                        self.graph[self.order[*position]].text(Tense::SimplePresent, data)
                    })
                    .collect();
                CompoundAction {
                    target,
                    actions,
                    text: texts.join(" and "),
                }
            })
            .collect();
        compounds.sort_by_key(|compound| compound.actions[0]);

        self.compounds = compounds;
    }
}

/// The device a primitive action is attributed to in the compound view:
/// mount points fold into their filesystem, subvolumes and qgroups into
/// their btrfs.
fn compound_target(graph: &DeviceGraph, sid: Sid) -> Sid {
    let Ok(device) = graph.device(sid) else {
        return sid;
    };

    match &device.kind {
        DeviceKind::MountPoint(_) => graph
            .parents(sid, View::Classic)
            .ok()
            .and_then(|parents| parents.first().copied())
            .unwrap_or(sid),
        DeviceKind::BtrfsSubvolume(_) => graph.btrfs_of_subvolume(sid).unwrap_or(sid),
        DeviceKind::BtrfsQgroup(_) => graph
            .parents(sid, View::Classic)
            .ok()
            .and_then(|parents| parents.first().copied())
            .unwrap_or(sid),
        _ => sid,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainKind {
    Create,
    Delete,
    Modify,
}

struct Chain {
    kind: ChainKind,
    nodes: Vec<NodeIndex>,
}

struct Builder<'a> {
    lhs: &'a DeviceGraph,
    rhs: &'a DeviceGraph,
    graph: StableDiGraph<Action, ()>,
    chains: BTreeMap<Sid, Chain>,
}

impl<'a> Builder<'a> {
    fn add_chain(&mut self, sid: Sid, kind: ChainKind, actions: Vec<Action>) {
        if actions.is_empty() {
            return;
        }

        let nodes: Vec<NodeIndex> = actions
            .into_iter()
            .map(|action| self.graph.add_node(action))
            .collect();
        for pair in nodes.windows(2) {
            self.graph.add_edge(pair[0], pair[1], ());
        }
        self.chains.insert(sid, Chain { kind, nodes });
    }

    fn classify(&mut self) -> Result<()> {
        let mut sids: BTreeSet<Sid> = self.lhs.all_sids().into_iter().collect();
        sids.extend(self.rhs.all_sids());

        for sid in sids {
            match (self.lhs.has_device(sid), self.rhs.has_device(sid)) {
                (false, true) => {
                    let actions = self.create_actions(sid)?;
                    self.add_chain(sid, ChainKind::Create, actions);
                }
                (true, false) => {
                    let actions = self.delete_actions(sid)?;
                    self.add_chain(sid, ChainKind::Delete, actions);
                }
                (true, true) => {
                    let actions = self.modify_actions(sid)?;
                    self.add_chain(sid, ChainKind::Modify, actions);
                }
                (false, false) => unreachable!(),
            }
        }
        Ok(())
    }

    /// Whether this diff switches quota on for the filesystem.
    fn quota_enabled_in_plan(&self, filesystem: Sid) -> bool {
        let rhs_quota = self
            .rhs
            .device(filesystem)
            .ok()
            .and_then(|d| d.as_btrfs().ok())
            .map(|(_, btrfs)| btrfs.quota)
            .unwrap_or(false);
        let lhs_quota = self
            .lhs
            .device(filesystem)
            .ok()
            .and_then(|d| d.as_btrfs().ok())
            .map(|(_, btrfs)| btrfs.quota)
            .unwrap_or(false);
        rhs_quota && !lhs_quota
    }

    fn create_actions(&self, sid: Sid) -> Result<Vec<Action>> {
        let device = self.rhs.device(sid)?;

        Ok(match &device.kind {
            DeviceKind::Filesystem { fs, btrfs } => {
                let mut actions = vec![Action::Create { sid }];
                if !fs.label.is_empty() && fs.fs_type == FsType::Btrfs {
                    actions.push(Action::SetLabel { sid });
                }
                if btrfs.as_ref().map(|data| data.quota).unwrap_or(false) {
                    actions.push(Action::SetQuota { sid });
                }
                actions
            }

            DeviceKind::Nfs { .. } | DeviceKind::Tmpfs => Vec::new(),

            DeviceKind::MountPoint(mp) => {
                let mut actions = Vec::new();
                if mp.active {
                    if self.mount_point_is_swap(self.rhs, sid) {
                        actions.push(Action::ActivateFilesystem { sid });
                    } else {
                        actions.push(Action::Mount { sid });
                    }
                }
                if mp.in_etc_fstab {
                    actions.push(Action::AddToEtcFstab { sid });
                }
                actions
            }

            DeviceKind::BtrfsSubvolume(subvolume) => {
                if subvolume.is_top_level() {
                    // Created together with the filesystem.
                    Vec::new()
                } else {
                    let mut actions = vec![Action::Create { sid }];
                    if subvolume.nocow {
                        actions.push(Action::SetNocow { sid });
                    }
                    if subvolume.default_subvolume {
                        actions.push(Action::SetDefaultBtrfsSubvolume { sid });
                    }
                    actions
                }
            }

            DeviceKind::BtrfsQgroup(qgroup) => {
                let mut actions = Vec::new();
                let implicit = qgroup.id.0 == 0 && self.governing_subvolume_exists(sid, qgroup.id.1);
                if !implicit {
                    actions.push(Action::Create { sid });
                }
                if qgroup.referenced_limit.is_some() || qgroup.exclusive_limit.is_some() {
                    actions.push(Action::SetQgroupLimits { sid });
                }
                actions
            }

            _ => vec![Action::Create { sid }],
        })
    }

    /// Level-0 qgroups of an existing subvolume come into being with quota
    /// enablement or subvolume creation, no command needed.
    fn governing_subvolume_exists(&self, qgroup: Sid, subvolume_id: u64) -> bool {
        let Ok(parents) = self.rhs.parents(qgroup, View::Classic) else {
            return false;
        };
        let Some(filesystem) = parents.first() else {
            return false;
        };
        let Ok(subvolumes) = self.rhs.btrfs_subvolumes(*filesystem) else {
            return false;
        };
        subvolumes.iter().any(|sid| {
            self.rhs
                .device(*sid)
                .and_then(|d| d.as_btrfs_subvolume().map(|s| s.id == subvolume_id))
                .unwrap_or(false)
        })
    }

    fn delete_actions(&self, sid: Sid) -> Result<Vec<Action>> {
        let device = self.lhs.device(sid)?;

        Ok(match &device.kind {
            DeviceKind::Nfs { .. } | DeviceKind::Tmpfs => Vec::new(),

            DeviceKind::MountPoint(mp) => {
                let mut actions = Vec::new();
                if mp.in_etc_fstab {
                    actions.push(Action::RemoveFromEtcFstab { sid });
                }
                if mp.active {
                    if self.mount_point_is_swap(self.lhs, sid) {
                        actions.push(Action::DeactivateFilesystem { sid });
                    } else {
                        actions.push(Action::Unmount { sid });
                    }
                }
                actions
            }

            DeviceKind::BtrfsSubvolume(subvolume) => {
                let filesystem = self.lhs.btrfs_of_subvolume(sid)?;
                if subvolume.is_top_level() || !self.rhs.has_device(filesystem) {
                    // Vanishes with the filesystem.
                    Vec::new()
                } else {
                    vec![Action::Delete { sid }]
                }
            }

            DeviceKind::BtrfsQgroup(_) => {
                let parents = self.lhs.parents(sid, View::Classic)?;
                let filesystem = parents.first().copied();
                let fs_stays = filesystem
                    .map(|fs| self.rhs.has_device(fs))
                    .unwrap_or(false);
                let quota_stays_on = filesystem
                    .and_then(|fs| self.rhs.device(fs).ok())
                    .and_then(|d| d.as_btrfs().ok().map(|(_, btrfs)| btrfs.quota))
                    .unwrap_or(false);
                if fs_stays && quota_stays_on {
                    vec![Action::Delete { sid }]
                } else {
                    // Disabling quota (or deleting the filesystem) removes
                    // all qgroups in one go.
                    Vec::new()
                }
            }

            _ => vec![Action::Delete { sid }],
        })
    }

    fn mount_point_is_swap(&self, graph: &DeviceGraph, mount_point: Sid) -> bool {
        graph
            .parents(mount_point, View::Classic)
            .ok()
            .and_then(|parents| parents.first().copied())
            .and_then(|fs| graph.device(fs).ok())
            .and_then(|device| device.as_filesystem().ok().map(|fs| fs.fs_type))
            == Some(FsType::Swap)
    }

    fn modify_actions(&self, sid: Sid) -> Result<Vec<Action>> {
        let lhs_device = self.lhs.device(sid)?;
        let rhs_device = self.rhs.device(sid)?;

        if lhs_device.kind.variant_name() != rhs_device.kind.variant_name() {
            return Err(StorageError::InvariantViolation(format!(
                "sid {sid} changes type from {} to {}",
                lhs_device.kind.variant_name(),
                rhs_device.kind.variant_name()
            )));
        }

        let mut actions = Vec::new();

        // Size changes of resizable block devices.
        if let (Some(old), Some(new)) = (lhs_device.blk(), rhs_device.blk()) {
            if old.size != new.size
                && matches!(
                    rhs_device.kind,
                    DeviceKind::Partition { .. } | DeviceKind::LvmLv { .. }
                )
            {
                let mode = if new.size < old.size {
                    ResizeMode::Shrink
                } else {
                    ResizeMode::Grow
                };
                self.reject_multidevice_shrink(sid, mode)?;
                actions.push(Action::Resize { sid, mode });
            }
        }

        match (&lhs_device.kind, &rhs_device.kind) {
            (
                DeviceKind::Filesystem { fs: old, btrfs: old_btrfs },
                DeviceKind::Filesystem { fs: new, btrfs: new_btrfs },
            ) => {
                if old.label != new.label {
                    actions.push(Action::SetLabel { sid });
                }
                if old.uuid != new.uuid && !new.uuid.is_empty() {
                    actions.push(Action::SetUuid { sid });
                }
                let old_quota = old_btrfs.as_ref().map(|data| data.quota).unwrap_or(false);
                let new_quota = new_btrfs.as_ref().map(|data| data.quota).unwrap_or(false);
                if old_quota != new_quota {
                    actions.push(Action::SetQuota { sid });
                }
            }

            (DeviceKind::MountPoint(old), DeviceKind::MountPoint(new)) => {
                let swap = self.mount_point_is_swap(self.rhs, sid);
                let remount = old.path != new.path
                    || (old.active && new.active && old.mount_options != new.mount_options);

                if old.in_etc_fstab && (!new.in_etc_fstab || remount) {
                    actions.push(Action::RemoveFromEtcFstab { sid });
                }
                if old.active && (!new.active || remount) {
                    actions.push(if swap {
                        Action::DeactivateFilesystem { sid }
                    } else {
                        Action::Unmount { sid }
                    });
                }
                if new.active && (!old.active || remount) {
                    actions.push(if swap {
                        Action::ActivateFilesystem { sid }
                    } else {
                        Action::Mount { sid }
                    });
                }
                if new.in_etc_fstab && (!old.in_etc_fstab || remount) {
                    actions.push(Action::AddToEtcFstab { sid });
                }
            }

            (DeviceKind::BtrfsSubvolume(old), DeviceKind::BtrfsSubvolume(new)) => {
                if !old.default_subvolume && new.default_subvolume {
                    actions.push(Action::SetDefaultBtrfsSubvolume { sid });
                }
                if old.nocow != new.nocow {
                    actions.push(Action::SetNocow { sid });
                }
            }

            (DeviceKind::BtrfsQgroup(old), DeviceKind::BtrfsQgroup(new)) => {
                if old.referenced_limit != new.referenced_limit
                    || old.exclusive_limit != new.exclusive_limit
                {
                    actions.push(Action::SetQgroupLimits { sid });
                }
            }

            (
                DeviceKind::LvmVg { vg_name: old, .. },
                DeviceKind::LvmVg { vg_name: new, .. },
            ) => {
                if old != new {
                    actions.push(Action::Rename { sid });
                }
            }

            (
                DeviceKind::LvmLv { lv_name: old, .. },
                DeviceKind::LvmLv { lv_name: new, .. },
            ) => {
                if old != new {
                    actions.push(Action::Rename { sid });
                }
            }

            _ => {}
        }

        Ok(actions)
    }

    /// Shrinking a device backing a multi-device btrfs has no defined
    /// action ordering; such plans are rejected outright.
    fn reject_multidevice_shrink(&self, blk_device: Sid, mode: ResizeMode) -> Result<()> {
        if mode != ResizeMode::Shrink {
            return Ok(());
        }

        for graph in [self.lhs, self.rhs] {
            if !graph.has_device(blk_device) {
                continue;
            }
            for holder in graph.holders_out(blk_device, View::All)? {
                if matches!(holder.kind, HolderKind::FilesystemUser { journal: false, .. })
                    && graph.device(holder.target)?.as_btrfs().is_ok()
                    && graph.filesystem_devices(holder.target)?.len() > 1
                {
                    return Err(StorageError::InvariantViolation(
                        "shrinking a multi-device btrfs is not supported".to_owned(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// A filesystem follows the size of its backing devices: emit its
    /// resize alongside theirs, with the mode-dependent ordering.
    fn synthesize_resizes(&mut self) -> Result<()> {
        let mut filesystem_resizes: Vec<(Sid, ResizeMode, Vec<Sid>)> = Vec::new();

        for sid in self.rhs.all_sids() {
            if !self.lhs.has_device(sid) || self.rhs.device(sid)?.as_filesystem().is_err() {
                continue;
            }

            let mut resized_members = Vec::new();
            let mut mode = None;
            for (member, _) in self.rhs.filesystem_devices(sid)? {
                let Some(chain) = self.chains.get(&member) else {
                    continue;
                };
                for node in &chain.nodes {
                    if let Action::Resize { mode: member_mode, .. } = self.graph[*node] {
                        resized_members.push(member);
                        mode = Some(member_mode);
                    }
                }
            }

            if let Some(mode) = mode {
                filesystem_resizes.push((sid, mode, resized_members));
            }
        }

        for (sid, mode, members) in filesystem_resizes {
            let fs_type = self.rhs.device(sid)?.as_filesystem()?.fs_type;
            let supported = match mode {
                ResizeMode::Shrink => fs_type.supports_shrink(),
                ResizeMode::Grow => fs_type.supports_grow(),
            };
            if !supported {
                return Err(StorageError::InvariantViolation(format!(
                    "cannot {} a {} filesystem",
                    if mode == ResizeMode::Shrink { "shrink" } else { "grow" },
                    fs_type
                )));
            }

            let fs_node = self.graph.add_node(Action::Resize { sid, mode });
            match self.chains.get_mut(&sid) {
                Some(chain) => {
                    if let Some(last) = chain.nodes.last() {
                        self.graph.add_edge(*last, fs_node, ());
                    }
                    chain.nodes.push(fs_node);
                }
                None => {
                    self.chains.insert(
                        sid,
                        Chain { kind: ChainKind::Modify, nodes: vec![fs_node] },
                    );
                }
            }

            for member in members {
                let member_nodes: Vec<NodeIndex> = self.chains[&member].nodes.clone();
                for node in member_nodes {
                    if let Action::Resize { .. } = self.graph[node] {
                        match mode {
                            // Shrink the filesystem before its devices,
                            // grow the devices before the filesystem.
                            ResizeMode::Shrink => self.graph.add_edge(fs_node, node, ()),
                            ResizeMode::Grow => self.graph.add_edge(node, fs_node, ()),
                        };
                    }
                }
            }
        }
        Ok(())
    }

    /// Membership changes of multi-device containers: btrfs members, vg
    /// physical volumes, md members.
    fn synthesize_reallots(&mut self) -> Result<()> {
        for sid in self.rhs.all_sids() {
            if !self.lhs.has_device(sid) {
                continue;
            }

            let (old_members, new_members) = match &self.rhs.device(sid)?.kind {
                DeviceKind::Filesystem { btrfs: Some(_), .. } => (
                    member_set(self.lhs, sid, MemberKind::FilesystemUser)?,
                    member_set(self.rhs, sid, MemberKind::FilesystemUser)?,
                ),
                DeviceKind::LvmVg { .. } => (
                    member_set(self.lhs, sid, MemberKind::User)?,
                    member_set(self.rhs, sid, MemberKind::User)?,
                ),
                DeviceKind::Md { .. } => (
                    member_set(self.lhs, sid, MemberKind::MdUser)?,
                    member_set(self.rhs, sid, MemberKind::MdUser)?,
                ),
                _ => continue,
            };

            let mut actions = Vec::new();
            for partner in new_members.difference(&old_members) {
                actions.push(Action::Reallot {
                    sid,
                    mode: ReallotMode::Extend,
                    partner: *partner,
                });
            }
            for partner in old_members.difference(&new_members) {
                actions.push(Action::Reallot {
                    sid,
                    mode: ReallotMode::Reduce,
                    partner: *partner,
                });
            }

            if actions.is_empty() {
                continue;
            }

            // Merge with an existing modify chain.
            match self.chains.remove(&sid) {
                Some(mut chain) => {
                    let mut nodes: Vec<NodeIndex> = actions
                        .into_iter()
                        .map(|action| self.graph.add_node(action))
                        .collect();
                    if let (Some(last), Some(first)) = (chain.nodes.last(), nodes.first()) {
                        self.graph.add_edge(*last, *first, ());
                    }
                    for pair in nodes.windows(2) {
                        self.graph.add_edge(pair[0], pair[1], ());
                    }
                    chain.nodes.append(&mut nodes);
                    self.chains.insert(sid, chain);
                }
                None => self.add_chain(sid, ChainKind::Modify, actions),
            }
        }
        Ok(())
    }

    /// Diffs of the inter-qgroup relation edges.
    fn synthesize_qgroup_relations(&mut self) -> Result<()> {
        let lhs_relations = qgroup_relations(self.lhs)?;
        let rhs_relations = qgroup_relations(self.rhs)?;

        let mut actions: Vec<(Sid, Action)> = Vec::new();

        for (parent, child) in rhs_relations.difference(&lhs_relations) {
            actions.push((
                *child,
                Action::AddQgroupRelation { sid: *child, parent: *parent },
            ));
        }
        for (parent, child) in lhs_relations.difference(&rhs_relations) {
            // Only when both qgroups survive; otherwise their removal
            // takes the relation along.
            if self.rhs.has_device(*parent) && self.rhs.has_device(*child) {
                actions.push((
                    *child,
                    Action::RemoveQgroupRelation { sid: *child, parent: *parent },
                ));
            }
        }

        for (sid, action) in actions {
            let node = self.graph.add_node(action);
            match self.chains.get_mut(&sid) {
                Some(chain) => {
                    if let Some(last) = chain.nodes.last() {
                        self.graph.add_edge(*last, node, ());
                    }
                    chain.nodes.push(node);
                }
                None => {
                    self.chains.insert(
                        sid,
                        Chain { kind: ChainKind::Modify, nodes: vec![node] },
                    );
                }
            }
        }
        Ok(())
    }

    /// Nearest ancestors (in `graph`) that have an action chain.
    fn nearest_chained_ancestors(&self, graph: &DeviceGraph, sid: Sid) -> Result<Vec<Sid>> {
        let mut found = Vec::new();
        let mut queue: VecDeque<Sid> = graph.parents(sid, View::Classic)?.into();
        let mut seen = BTreeSet::new();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if self.chains.contains_key(&current) {
                found.push(current);
            } else {
                queue.extend(graph.parents(current, View::Classic)?);
            }
        }
        Ok(found)
    }

    fn nearest_chained_descendants(&self, graph: &DeviceGraph, sid: Sid) -> Result<Vec<Sid>> {
        let mut found = Vec::new();
        let mut queue: VecDeque<Sid> = graph.children(sid, View::Classic)?.into();
        let mut seen = BTreeSet::new();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if self.chains.contains_key(&current) {
                found.push(current);
            } else {
                queue.extend(graph.children(current, View::Classic)?);
            }
        }
        Ok(found)
    }

    fn add_dependencies(&mut self) -> Result<()> {
        let sids: Vec<Sid> = self.chains.keys().copied().collect();
        let mut edges: Vec<(NodeIndex, NodeIndex)> = Vec::new();

        for sid in &sids {
            let chain = &self.chains[sid];
            match chain.kind {
                ChainKind::Create => {
                    // Parents first: a device comes into being after
                    // everything it sits on, including pending attribute
                    // changes of those parents.
                    let first = chain.nodes[0];
                    for ancestor in self.nearest_chained_ancestors(self.rhs, *sid)? {
                        let ancestor_chain = &self.chains[&ancestor];
                        if ancestor_chain.kind != ChainKind::Delete {
                            edges.push((*ancestor_chain.nodes.last().unwrap(), first));
                        }
                    }
                }
                ChainKind::Delete => {
                    // Children first: nothing dies before its dependents.
                    let first = chain.nodes[0];
                    for descendant in self.nearest_chained_descendants(self.lhs, *sid)? {
                        let descendant_chain = &self.chains[&descendant];
                        if descendant_chain.kind == ChainKind::Delete {
                            edges.push((*descendant_chain.nodes.last().unwrap(), first));
                        }
                    }
                }
                ChainKind::Modify => {}
            }
        }

        // Snapshots come after their origin.
        for holder in self.rhs.holders() {
            if matches!(holder.kind, HolderKind::Snapshot) {
                if let (Some(origin), Some(snapshot)) = (
                    self.chains.get(&holder.source),
                    self.chains.get(&holder.target),
                ) {
                    if origin.kind == ChainKind::Create && snapshot.kind == ChainKind::Create {
                        edges.push((*origin.nodes.last().unwrap(), snapshot.nodes[0]));
                    }
                }
            }
        }

        // Quota enablement precedes every qgroup action of that btrfs.
        for sid in &sids {
            let chain = &self.chains[sid];
            let quota_nodes: Vec<NodeIndex> = chain
                .nodes
                .iter()
                .copied()
                .filter(|node| matches!(self.graph[*node], Action::SetQuota { .. }))
                .collect();
            if quota_nodes.is_empty() {
                continue;
            }
            let Ok(qgroups) = self.rhs.btrfs_qgroups(*sid) else {
                continue;
            };
            for qgroup in qgroups {
                if let Some(qgroup_chain) = self.chains.get(&qgroup) {
                    for quota_node in &quota_nodes {
                        edges.push((*quota_node, qgroup_chain.nodes[0]));
                    }
                }
            }
        }

        // Reallots against created or deleted partners.
        for sid in &sids {
            for node in &self.chains[sid].nodes {
                if let Action::Reallot { mode, partner, .. } = self.graph[*node] {
                    if let Some(partner_chain) = self.chains.get(&partner) {
                        match (mode, partner_chain.kind) {
                            (ReallotMode::Extend, ChainKind::Create) => {
                                edges.push((*partner_chain.nodes.last().unwrap(), *node));
                            }
                            (ReallotMode::Reduce, ChainKind::Delete) => {
                                edges.push((*node, partner_chain.nodes[0]));
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        // Mounting waits for every pending change of the filesystem, label
        // and quota included.
        for sid in &sids {
            for node in &self.chains[sid].nodes {
                if matches!(
                    self.graph[*node],
                    Action::Mount { .. } | Action::ActivateFilesystem { .. }
                ) {
                    let Ok(parents) = self.rhs.parents(self.graph[*node].sid(), View::Classic)
                    else {
                        continue;
                    };
                    for filesystem in parents {
                        if let Some(fs_chain) = self.chains.get(&filesystem) {
                            if fs_chain.kind != ChainKind::Delete {
                                edges.push((*fs_chain.nodes.last().unwrap(), *node));
                            }
                        }
                    }
                }
            }
        }

        // Mounts shallow-to-deep, unmounts deep-to-shallow.
        let mut mounts: Vec<(String, NodeIndex)> = Vec::new();
        let mut unmounts: Vec<(String, NodeIndex)> = Vec::new();
        for sid in &sids {
            for node in &self.chains[sid].nodes {
                match self.graph[*node] {
                    Action::Mount { sid } => {
                        if let Ok(mp) = self.rhs.device(sid).and_then(|d| d.as_mount_point()) {
                            mounts.push((mp.path.clone(), *node));
                        }
                    }
                    Action::Unmount { sid } => {
                        if let Ok(mp) = self.lhs.device(sid).and_then(|d| d.as_mount_point()) {
                            unmounts.push((mp.path.clone(), *node));
                        }
                    }
                    _ => {}
                }
            }
        }
        for (shallow, shallow_node) in &mounts {
            for (deep, deep_node) in &mounts {
                if is_path_below(shallow, deep) {
                    edges.push((*shallow_node, *deep_node));
                }
            }
        }
        for (shallow, shallow_node) in &unmounts {
            for (deep, deep_node) in &unmounts {
                if is_path_below(shallow, deep) {
                    edges.push((*deep_node, *shallow_node));
                }
            }
        }

        // Unmount before a resize of a filesystem that cannot be resized
        // while mounted.
        for sid in &sids {
            for node in &self.chains[sid].nodes {
                if let Action::Resize { sid: fs_sid, .. } = self.graph[*node] {
                    let Ok(fs) = self.rhs.device(fs_sid).and_then(|d| d.as_filesystem()) else {
                        continue;
                    };
                    if fs.fs_type.supports_mounted_resize() {
                        continue;
                    }
                    for mount_point in self.lhs.children(fs_sid, View::Classic).unwrap_or_default()
                    {
                        if let Some(mp_chain) = self.chains.get(&mount_point) {
                            for mp_node in &mp_chain.nodes {
                                if matches!(self.graph[*mp_node], Action::Unmount { .. }) {
                                    edges.push((*mp_node, *node));
                                }
                            }
                        }
                    }
                }
            }
        }

        for (a, b) in edges {
            if a != b {
                self.graph.add_edge(a, b, ());
            }
        }
        Ok(())
    }

    /// Kahn's algorithm with a stable tie-break key, so equal inputs give
    /// equal plans.
    fn topological_order(&self) -> Result<Vec<NodeIndex>> {
        let mut in_degree: BTreeMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|node| {
                (
                    node,
                    self.graph.edges_directed(node, Direction::Incoming).count(),
                )
            })
            .collect();

        let key = |graph: &StableDiGraph<Action, ()>, node: NodeIndex| {
            let action = &graph[node];
            (action.kind_priority(), action.sid(), node.index())
        };

        let mut ready: BinaryHeap<Reverse<(u8, Sid, usize, NodeIndex)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| {
                let (priority, sid, index) = key(&self.graph, *node);
                Reverse((priority, sid, index, *node))
            })
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, _, _, node))) = ready.pop() {
            order.push(node);
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                let target = edge.target();
                let degree = in_degree.get_mut(&target).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    let (priority, sid, index) = key(&self.graph, target);
                    ready.push(Reverse((priority, sid, index, target)));
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(StorageError::InvariantViolation(
                "action graph contains a cycle".to_owned(),
            ));
        }
        Ok(order)
    }

    fn used_features(&self) -> UsedFeatures {
        let mut features = UsedFeatures::empty();
        for (sid, _) in self.chains.iter() {
            let graph = if self.rhs.has_device(*sid) { self.rhs } else { self.lhs };
            if let Ok(device_features) = graph.device_features(*sid) {
                features |= device_features;
            }
        }
        features
    }
}

#[derive(Clone, Copy, PartialEq)]
enum MemberKind {
    User,
    FilesystemUser,
    MdUser,
}

fn member_set(graph: &DeviceGraph, sid: Sid, kind: MemberKind) -> Result<BTreeSet<Sid>> {
    let mut members = BTreeSet::new();
    for holder in graph.holders_in(sid, View::All)? {
        let matched = match kind {
            MemberKind::User => matches!(holder.kind, HolderKind::User),
            MemberKind::FilesystemUser => {
                matches!(holder.kind, HolderKind::FilesystemUser { journal: false, .. })
            }
            MemberKind::MdUser => matches!(holder.kind, HolderKind::MdUser { .. }),
        };
        if matched {
            members.insert(holder.source);
        }
    }
    Ok(members)
}

/// (parent qgroup, child qgroup) pairs of all inter-qgroup relations.
fn qgroup_relations(graph: &DeviceGraph) -> Result<BTreeSet<(Sid, Sid)>> {
    let mut relations = BTreeSet::new();
    for holder in graph.holders() {
        if matches!(holder.kind, HolderKind::BtrfsQgroupRelation)
            && graph.device(holder.source)?.as_btrfs_qgroup().is_ok()
            && graph.device(holder.target)?.as_btrfs_qgroup().is_ok()
        {
            relations.insert((holder.source, holder.target));
        }
    }
    Ok(relations)
}

/// Whether `deep` lives below `shallow` in the mount hierarchy.
fn is_path_below(shallow: &str, deep: &str) -> bool {
    if shallow == deep {
        return false;
    }
    let prefix = if shallow == "/" {
        "/".to_owned()
    } else {
        format!("{shallow}/")
    };
    deep.starts_with(&prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicegraph::device::PtType;
    use sysdefs::bytes::{ByteCount, GIB, MIB};
    use sysdefs::region::Region;

    fn texts(lhs: &DeviceGraph, rhs: &DeviceGraph) -> Vec<String> {
        let actiongraph = ActionGraph::build(lhs, rhs).unwrap();
        assert!(actiongraph.order_is_sound());
        actiongraph.commit_actions_as_strings(CommitData { lhs, rhs })
    }

    fn disk_with_table(graph: &mut DeviceGraph, name: &str) -> (Sid, Sid) {
        let disk = graph.create_disk(name, ByteCount(32 * GIB));
        let table = graph.create_partition_table(disk, PtType::Gpt).unwrap();
        (disk, table)
    }

    #[test]
    fn test_empty_diff() {
        let mut graph = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut graph, "/dev/sda");
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = graph.create_partition(table, region).unwrap();
        graph.create_filesystem(partition, FsType::Btrfs).unwrap();

        let actiongraph = ActionGraph::build(&graph, &graph.clone()).unwrap();
        assert!(actiongraph.is_empty());
        assert_eq!(actiongraph.num_actions(), 0);
    }

    #[test]
    fn test_create_chain_order_and_determinism() {
        let mut lhs = DeviceGraph::new();
        let disk = lhs.create_disk("/dev/sda", ByteCount(32 * GIB));
        let mut rhs = lhs.clone();

        let table = rhs.create_partition_table(disk, PtType::Gpt).unwrap();
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = rhs.create_partition(table, region).unwrap();
        let filesystem = rhs.create_filesystem(partition, FsType::Btrfs).unwrap();
        rhs.device_mut(filesystem)
            .unwrap()
            .as_filesystem_mut()
            .unwrap()
            .label = "data".to_owned();
        rhs.device_mut(filesystem)
            .unwrap()
            .as_btrfs_mut()
            .unwrap()
            .1
            .quota = true;
        let mount_point = rhs.create_mount_point(filesystem, "/data").unwrap();
        rhs.device_mut(mount_point)
            .unwrap()
            .as_mount_point_mut()
            .unwrap()
            .active = true;

        let first = texts(&lhs, &rhs);
        assert_eq!(
            first,
            vec![
                "Create gpt partition table",
                "Create /dev/sda1",
                "Create btrfs on /dev/sda1",
                "Set label of btrfs on /dev/sda1 to 'data'",
                "Enable quota on btrfs on /dev/sda1",
                "Mount btrfs at /data",
                "Add btrfs at /data to /etc/fstab",
            ]
        );

        // Re-running on the same inputs yields the same order.
        for _ in 0..5 {
            assert_eq!(texts(&lhs, &rhs), first);
        }
    }

    #[test]
    fn test_delete_chain_order() {
        let mut lhs = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut lhs, "/dev/sda");
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = lhs.create_partition(table, region).unwrap();
        let filesystem = lhs.create_filesystem(partition, FsType::Ext4).unwrap();
        let mount_point = lhs.create_mount_point(filesystem, "/data").unwrap();
        lhs.device_mut(mount_point)
            .unwrap()
            .as_mount_point_mut()
            .unwrap()
            .active = true;

        // Keep only the disk.
        let mut rhs = lhs.clone();
        rhs.remove_device_and_descendants(table).unwrap();

        assert_eq!(
            texts(&lhs, &rhs),
            vec![
                "Remove ext4 at /data from /etc/fstab",
                "Unmount ext4 at /data",
                "Delete ext4 on /dev/sda1",
                "Delete /dev/sda1",
                "Delete gpt partition table",
            ]
        );
    }

    #[test]
    fn test_subvolume_actions_and_compounds() {
        let mut lhs = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut lhs, "/dev/sda");
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = lhs.create_partition(table, region).unwrap();
        let filesystem = lhs.create_filesystem(partition, FsType::Btrfs).unwrap();

        let mut rhs = lhs.clone();
        let top_level = rhs.btrfs_top_level_subvolume(filesystem).unwrap();
        let home = rhs.create_btrfs_subvolume(top_level, "home").unwrap();
        rhs.create_btrfs_subvolume(home, "home/.snapshots").unwrap();
        rhs.btrfs_set_default_subvolume(filesystem, home).unwrap();

        let strings = texts(&lhs, &rhs);
        let home_position = strings
            .iter()
            .position(|s| s == "Create subvolume home")
            .unwrap();
        let snapshots_position = strings
            .iter()
            .position(|s| s == "Create subvolume home/.snapshots")
            .unwrap();
        assert!(home_position < snapshots_position);
        assert!(strings.contains(&"Set default subvolume to subvolume home".to_owned()));

        // All subvolume work folds into one compound action on the btrfs.
        let actiongraph = ActionGraph::build(&lhs, &rhs).unwrap();
        let compounds = actiongraph.compound_actions();
        assert_eq!(compounds.len(), 1);
        assert_eq!(compounds[0].target, filesystem);
        assert_eq!(compounds[0].actions.len(), actiongraph.num_actions());
        assert!(compounds[0].text.contains(" and "));
    }

    #[test]
    fn test_grow_orders_device_before_filesystem() {
        let mut lhs = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut lhs, "/dev/sda");
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = lhs.create_partition(table, region).unwrap();
        lhs.create_filesystem(partition, FsType::Ext4).unwrap();

        let mut rhs = lhs.clone();
        let grown = Region::new(2048, 2 * GIB / 512, 512).unwrap();
        let blk = rhs.device_mut(partition).unwrap().blk_mut().unwrap();
        blk.region = grown;
        blk.size = ByteCount(2 * GIB);

        let strings = texts(&lhs, &rhs);
        assert_eq!(
            strings,
            vec!["Grow /dev/sda1", "Grow ext4 on /dev/sda1"]
        );
    }

    #[test]
    fn test_shrink_orders_filesystem_before_device() {
        let mut lhs = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut lhs, "/dev/sda");
        let region = Region::new(2048, 2 * GIB / 512, 512).unwrap();
        let partition = lhs.create_partition(table, region).unwrap();
        lhs.create_filesystem(partition, FsType::Ext4).unwrap();

        let mut rhs = lhs.clone();
        let shrunk = Region::new(2048, GIB / 512, 512).unwrap();
        let blk = rhs.device_mut(partition).unwrap().blk_mut().unwrap();
        blk.region = shrunk;
        blk.size = ByteCount(GIB);

        let strings = texts(&lhs, &rhs);
        assert_eq!(
            strings,
            vec!["Shrink ext4 on /dev/sda1", "Shrink /dev/sda1"]
        );
    }

    #[test]
    fn test_multidevice_btrfs_shrink_is_rejected() {
        let mut lhs = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut lhs, "/dev/sda");
        let free = lhs.free_regions(table).unwrap()[0];
        let part1 = lhs
            .create_partition(table, Region::new(free.start(), GIB / 512, 512).unwrap())
            .unwrap();
        let part2 = lhs
            .create_partition(
                table,
                Region::new(free.start() + GIB / 512, GIB / 512, 512).unwrap(),
            )
            .unwrap();
        let filesystem = lhs.create_filesystem(part1, FsType::Btrfs).unwrap();
        lhs.btrfs_add_device(filesystem, part2).unwrap();

        let mut rhs = lhs.clone();
        let shrunk = Region::new(free.start(), GIB / 1024, 512).unwrap();
        let blk = rhs.device_mut(part1).unwrap().blk_mut().unwrap();
        blk.region = shrunk;
        blk.size = ByteCount(GIB / 2);

        assert!(matches!(
            ActionGraph::build(&lhs, &rhs),
            Err(StorageError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_reallot_extend_waits_for_partner() {
        let mut lhs = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut lhs, "/dev/sda");
        let free = lhs.free_regions(table).unwrap()[0];
        let part1 = lhs
            .create_partition(table, Region::new(free.start(), GIB / 512, 512).unwrap())
            .unwrap();
        let filesystem = lhs.create_filesystem(part1, FsType::Btrfs).unwrap();

        let mut rhs = lhs.clone();
        let part2 = rhs
            .create_partition(
                table,
                Region::new(free.start() + GIB / 512, GIB / 512, 512).unwrap(),
            )
            .unwrap();
        rhs.btrfs_add_device(filesystem, part2).unwrap();

        let strings = texts(&lhs, &rhs);
        assert_eq!(
            strings,
            vec![
                "Create /dev/sda2",
                "Extend btrfs on /dev/sda1, /dev/sda2 by /dev/sda2",
            ]
        );
    }

    #[test]
    fn test_reusing_vg_name_keeps_lvm_feature() {
        // The probed system has a volume group; staging deletes it and
        // creates a new one under the same name. All three sides of the
        // story report the lvm feature.
        let mut probed = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut probed, "/dev/sda");
        let free = probed.free_regions(table).unwrap()[0];
        let partition = probed
            .create_partition(table, Region::new(free.start(), 4 * GIB / 512, 512).unwrap())
            .unwrap();
        let pv = probed.create_lvm_pv(partition).unwrap();
        let vg = probed.create_lvm_vg("system", &[pv]).unwrap();
        let lv = probed.create_lvm_lv(vg, "root", ByteCount(GIB)).unwrap();
        probed.create_filesystem(lv, FsType::Ext4).unwrap();

        let mut staging = probed.clone();
        staging.remove_device_and_descendants(vg).unwrap();
        let new_vg = staging.create_lvm_vg("system", &[pv]).unwrap();
        staging.create_lvm_lv(new_vg, "root", ByteCount(GIB)).unwrap();

        assert_eq!(probed.used_features().names(), "ext lvm");
        assert!(staging.used_features().contains(UsedFeatures::LVM));

        let actiongraph = ActionGraph::build(&probed, &staging).unwrap();
        assert!(actiongraph.used_features().contains(UsedFeatures::LVM));
        assert!(actiongraph.order_is_sound());
    }

    #[test]
    fn test_quota_enable_precedes_qgroup_limits() {
        let mut lhs = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut lhs, "/dev/sda");
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = lhs.create_partition(table, region).unwrap();
        let filesystem = lhs.create_filesystem(partition, FsType::Btrfs).unwrap();

        let mut rhs = lhs.clone();
        rhs.btrfs_set_quota(filesystem, true, None).unwrap();
        let qgroup = rhs
            .btrfs_find_qgroup_by_id(filesystem, (0, 5))
            .unwrap();
        rhs.device_mut(qgroup)
            .unwrap()
            .as_btrfs_qgroup_mut()
            .unwrap()
            .referenced_limit = Some(512 * MIB);

        let strings = texts(&lhs, &rhs);
        let quota_position = strings
            .iter()
            .position(|s| s.starts_with("Enable quota"))
            .unwrap();
        let limits_position = strings
            .iter()
            .position(|s| s.starts_with("Set limits"))
            .unwrap();
        assert!(quota_position < limits_position);
        // The implicit level-0 qgroup gets no create action.
        assert!(!strings.iter().any(|s| s.starts_with("Create qgroup")));
    }

    #[test]
    fn test_forward_and_backward_plans_mirror_each_other() {
        let mut lhs = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut lhs, "/dev/sda");
        let mut rhs = lhs.clone();
        let region = Region::new(2048, GIB / 512, 512).unwrap();
        let partition = rhs.create_partition(table, region).unwrap();
        rhs.create_filesystem(partition, FsType::Ext4).unwrap();

        let forward = ActionGraph::build(&lhs, &rhs).unwrap();
        let backward = ActionGraph::build(&rhs, &lhs).unwrap();

        let creates = |graph: &ActionGraph| {
            graph
                .commit_actions()
                .iter()
                .filter(|action| matches!(action, Action::Create { .. }))
                .count()
        };
        let deletes = |graph: &ActionGraph| {
            graph
                .commit_actions()
                .iter()
                .filter(|action| matches!(action, Action::Delete { .. }))
                .count()
        };

        assert_eq!(creates(&forward), deletes(&backward));
        assert_eq!(deletes(&forward), creates(&backward));
        assert!(backward.order_is_sound());
    }

    #[test]
    fn test_mount_order_follows_path_depth() {
        let mut lhs = DeviceGraph::new();
        let (_, table) = disk_with_table(&mut lhs, "/dev/sda");
        let free = lhs.free_regions(table).unwrap()[0];
        let part1 = lhs
            .create_partition(table, Region::new(free.start(), GIB / 512, 512).unwrap())
            .unwrap();
        let part2 = lhs
            .create_partition(
                table,
                Region::new(free.start() + GIB / 512, GIB / 512, 512).unwrap(),
            )
            .unwrap();

        let mut rhs = lhs.clone();
        // Deliberately create the deeper mount first so only the path rule
        // can order them.
        let fs_var = rhs.create_filesystem(part2, FsType::Xfs).unwrap();
        let mp_var = rhs.create_mount_point(fs_var, "/var/log").unwrap();
        rhs.device_mut(mp_var)
            .unwrap()
            .as_mount_point_mut()
            .unwrap()
            .active = true;
        let fs_root = rhs.create_filesystem(part1, FsType::Ext4).unwrap();
        let mp_root = rhs.create_mount_point(fs_root, "/").unwrap();
        rhs.device_mut(mp_root)
            .unwrap()
            .as_mount_point_mut()
            .unwrap()
            .active = true;

        let strings = texts(&lhs, &rhs);
        let root_position = strings
            .iter()
            .position(|s| s == "Mount ext4 at /")
            .unwrap();
        let var_position = strings
            .iter()
            .position(|s| s == "Mount xfs at /var/log")
            .unwrap();
        assert!(root_position < var_position);
    }
}
