//! Per-host batch loading plan
//!
//! The global batch is sharded over the mesh like any other array, with
//! its row dimension carrying the `batch` logical name. Each process then
//! loads only the union of the row ranges its own devices consume, and
//! processes whose unions coincide share one load so identical reads are
//! not issued twice across the fleet.

use std::collections::HashMap;

use mesh::{MeshSpec, PartitionLayout, RuleTable, ShardSlice};
use runtime_core::{DeviceId, Error, Result};
use tracing::debug;

/// Logical name the batch row dimension shards under
pub const BATCH_DIM: &str = "batch";

/// Rows in the global batch for a given per-device row count
///
/// The global batch scales with the product of the mesh axes the `batch`
/// dimension shards over; replicated setups keep the per-device count.
pub fn global_batch_rows(
    mesh: &MeshSpec,
    rules: &RuleTable,
    per_device_rows: usize,
) -> Result<usize> {
    if per_device_rows == 0 {
        return Err(Error::InvalidConfig {
            message: "per_device_batch_rows must be positive".to_string(),
        });
    }
    let axes = rules.resolve(BATCH_DIM, mesh)?;
    let shards: usize = axes
        .iter()
        .map(|axis| mesh.axis_size(axis).unwrap_or(1))
        .product();
    Ok(per_device_rows * shards)
}

/// Where one device's rows sit globally and inside its host's loaded buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRows {
    pub device: DeviceId,

    /// Row range within the global batch
    pub global: ShardSlice,

    /// Row range within the host's loaded buffer
    pub local: ShardSlice,
}

/// One process's share of the global batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLoad {
    pub process_index: usize,

    /// Which distinct load this process performs. Processes with equal
    /// row unions share an index and can read the same source shard.
    pub load_index: usize,

    /// Rows this process actually loads
    pub rows_to_load: usize,

    /// Per-device placement, in device id order
    pub device_rows: Vec<DeviceRows>,
}

/// The full loading plan, one entry per process
#[derive(Debug, Clone)]
pub struct HostDataLayout {
    global_rows: usize,
    num_unique_loads: usize,
    hosts: Vec<HostLoad>,
}

impl HostDataLayout {
    pub fn compute(mesh: &MeshSpec, rules: &RuleTable, global_rows: usize) -> Result<Self> {
        if global_rows == 0 {
            return Err(Error::InvalidConfig {
                message: "global batch must have at least one row".to_string(),
            });
        }
        let layout = PartitionLayout::compute(
            "global_batch",
            &[global_rows],
            &[BATCH_DIM.to_string()],
            mesh,
            rules,
        )?;

        let mut rows_by_process: Vec<Vec<(DeviceId, ShardSlice)>> =
            vec![Vec::new(); mesh.process_count()];
        for device in mesh.devices() {
            let slice = layout.device_slices(device.id)[0];
            rows_by_process[device.process_index].push((device.id, slice));
        }

        let mut load_index_by_union: HashMap<Vec<(usize, usize)>, usize> = HashMap::new();
        let mut hosts = Vec::with_capacity(rows_by_process.len());
        for (process_index, device_slices) in rows_by_process.into_iter().enumerate() {
            // Concatenate the distinct row ranges in first-seen order; each
            // device's local range is its global range's offset within that
            // concatenation.
            let mut local_start: HashMap<(usize, usize), usize> = HashMap::new();
            let mut rows_to_load = 0;
            let mut union = Vec::new();
            for &(_, slice) in &device_slices {
                let key = (slice.start, slice.end);
                if !local_start.contains_key(&key) {
                    local_start.insert(key, rows_to_load);
                    rows_to_load += slice.len();
                    union.push(key);
                }
            }

            union.sort_unstable();
            let next_index = load_index_by_union.len();
            let load_index = *load_index_by_union.entry(union).or_insert(next_index);

            let device_rows = device_slices
                .into_iter()
                .map(|(device, global)| {
                    let start = local_start[&(global.start, global.end)];
                    DeviceRows {
                        device,
                        global,
                        local: ShardSlice {
                            start,
                            end: start + global.len(),
                        },
                    }
                })
                .collect();

            hosts.push(HostLoad {
                process_index,
                load_index,
                rows_to_load,
                device_rows,
            });
        }

        let num_unique_loads = load_index_by_union.len();
        debug!(
            global_rows,
            processes = hosts.len(),
            unique_loads = num_unique_loads,
            "Computed host data layout"
        );
        Ok(Self {
            global_rows,
            num_unique_loads,
            hosts,
        })
    }

    pub fn global_rows(&self) -> usize {
        self.global_rows
    }

    /// Distinct loads across all processes
    pub fn num_unique_loads(&self) -> usize {
        self.num_unique_loads
    }

    pub fn hosts(&self) -> &[HostLoad] {
        &self.hosts
    }

    pub fn load_for_process(&self, process_index: usize) -> Option<&HostLoad> {
        self.hosts.get(process_index)
    }
}
