//! Pools: named sets of candidate devices used to provision partitions.
//!
//! The strategy balances bandwidth and keeps room for future large
//! partitions by preferring the candidates that are so far less used.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use sysdefs::{bytes::ByteCount, region::Region};

use crate::{
    devicegraph::{DeviceGraph, PARTITION_ALIGNMENT_SECTORS},
    error::{Result, StorageError},
    sid::Sid,
};

#[derive(Debug, Clone, Default)]
pub struct Pool {
    devices: BTreeSet<Sid>,
    userdata: BTreeMap<String, String>,
}

struct Candidate {
    table: Sid,
    partitions: usize,
    free_regions: Vec<Region>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn userdata(&self) -> &BTreeMap<String, String> {
        &self.userdata
    }

    pub fn set_userdata(&mut self, userdata: BTreeMap<String, String>) {
        self.userdata = userdata;
    }

    pub fn exists_device(&self, sid: Sid) -> bool {
        self.devices.contains(&sid)
    }

    /// Add a candidate. Membership is devicegraph-agnostic, only the sid
    /// is stored.
    pub fn add_device(&mut self, sid: Sid) -> Result<()> {
        if !self.devices.insert(sid) {
            return Err(StorageError::InvariantViolation(format!(
                "sid {sid} is already in the pool"
            )));
        }
        Ok(())
    }

    pub fn remove_device(&mut self, sid: Sid) -> Result<()> {
        if !self.devices.remove(&sid) {
            return Err(StorageError::NotFound(format!("sid {sid} in pool")));
        }
        Ok(())
    }

    /// Candidates resolving in the devicegraph. Unknown sids are no error.
    pub fn devices(&self, devicegraph: &DeviceGraph) -> Vec<Sid> {
        self.devices
            .iter()
            .copied()
            .filter(|sid| devicegraph.has_device(*sid))
            .collect()
    }

    pub fn empty(&self, devicegraph: &DeviceGraph) -> bool {
        self.devices(devicegraph).is_empty()
    }

    pub fn size(&self, devicegraph: &DeviceGraph) -> usize {
        self.devices(devicegraph).len()
    }

    /// Usable candidates: partitionables with a partition table. Everything
    /// else in the pool is silently ignored.
    fn candidates(&self, devicegraph: &DeviceGraph) -> Result<Vec<Candidate>> {
        let mut candidates = Vec::new();

        for sid in self.devices(devicegraph) {
            let device = devicegraph.device(sid)?;
            if !device.is_partitionable() {
                continue;
            }
            let Some(table) = devicegraph.partition_table_of(sid)? else {
                continue;
            };
            candidates.push(Candidate {
                table,
                partitions: devicegraph.partitions_of(table)?.len(),
                free_regions: devicegraph.free_regions(table)?,
            });
        }
        Ok(candidates)
    }

    /// The largest size such that `number` partitions of that size can be
    /// created out of the pool.
    pub fn max_partition_size(
        &self,
        devicegraph: &DeviceGraph,
        number: usize,
    ) -> Result<ByteCount> {
        if number == 0 {
            return Err(StorageError::InvariantViolation(
                "requested zero partitions".to_owned(),
            ));
        }

        let candidates = self.candidates(devicegraph)?;
        let regions: Vec<&Region> = candidates
            .iter()
            .flat_map(|candidate| candidate.free_regions.iter())
            .collect();

        let fits = |sectors: u64| -> usize {
            regions
                .iter()
                .map(|region| (region.length() / sectors) as usize)
                .sum()
        };

        let largest = regions.iter().map(|region| region.length()).max().unwrap_or(0);
        if largest == 0 || fits(PARTITION_ALIGNMENT_SECTORS) < number {
            return Err(StorageError::PoolOutOfSpace);
        }

        // Binary search over alignment-sized steps.
        let mut low = 1;
        let mut high = largest / PARTITION_ALIGNMENT_SECTORS;
        while low < high {
            let middle = (low + high + 1) / 2;
            if fits(middle * PARTITION_ALIGNMENT_SECTORS) >= number {
                low = middle;
            } else {
                high = middle - 1;
            }
        }

        Ok(ByteCount(low * PARTITION_ALIGNMENT_SECTORS * 512))
    }

    /// Create `number` partitions of `size` on the pool's candidates. The
    /// actual sizes may differ slightly due to alignment. Candidates with
    /// fewer partitions win; among equals the biggest free region does.
    pub fn create_partitions(
        &self,
        devicegraph: &mut DeviceGraph,
        number: usize,
        size: ByteCount,
    ) -> Result<Vec<Sid>> {
        let sectors = sysdefs::bytes::round_up(
            size.0.div_ceil(512).max(1),
            PARTITION_ALIGNMENT_SECTORS,
        );

        let mut created = Vec::new();

        for _ in 0..number {
            let mut candidates = self.candidates(devicegraph)?;
            candidates.retain(|candidate| {
                candidate
                    .free_regions
                    .first()
                    .map(|region| region.length() >= sectors)
                    .unwrap_or(false)
            });
            candidates.sort_by_key(|candidate| {
                (
                    candidate.partitions,
                    std::cmp::Reverse(
                        candidate
                            .free_regions
                            .first()
                            .map(|region| region.length())
                            .unwrap_or(0),
                    ),
                    candidate.table,
                )
            });

            let Some(winner) = candidates.first() else {
                return Err(StorageError::PoolOutOfSpace);
            };

            let region = winner.free_regions[0];
            let partition_region =
                Region::new(region.start(), sectors, region.block_size())
                    .map_err(|e| StorageError::InvariantViolation(e.to_string()))?;
            let partition = devicegraph.create_partition(winner.table, partition_region)?;
            debug!(
                "pool created partition sid {partition} on table sid {}",
                winner.table
            );
            created.push(partition);
        }

        Ok(created)
    }
}
