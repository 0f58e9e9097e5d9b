//! Per-device partition geometry
//!
//! A `PartitionLayout` fixes, for one parameter, which slice of the global
//! array every device holds. Slicing is derived from the first matching
//! rule per logical dimension, so two processes given the same mesh and
//! rule table agree on every byte of every shard.

use std::collections::BTreeMap;

use runtime_core::{DeviceId, Error, Result};

use crate::rules::RuleTable;
use crate::spec::MeshSpec;

/// Half-open index range of one dimension of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSlice {
    pub start: usize,
    pub end: usize,
}

impl ShardSlice {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Shard geometry of one parameter over a mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLayout {
    name: String,
    global_shape: Vec<usize>,
    shard_shape: Vec<usize>,
    partitions_per_dim: Vec<usize>,
    /// Indexed `[device][dim]`
    slices: Vec<Vec<ShardSlice>>,
}

impl PartitionLayout {
    /// Compute the layout of one parameter
    ///
    /// Each dimension resolves through the rule table to zero or more mesh
    /// axes. A mesh axis may back at most one dimension of the parameter,
    /// and every dimension size must divide evenly by the product of its
    /// axis sizes.
    pub fn compute(
        name: &str,
        global_shape: &[usize],
        logical_dims: &[String],
        mesh: &MeshSpec,
        rules: &RuleTable,
    ) -> Result<Self> {
        if logical_dims.len() != global_shape.len() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "parameter {name}: {} logical dims for {} dimensions",
                    logical_dims.len(),
                    global_shape.len()
                ),
            });
        }

        let mut dim_axes: Vec<Vec<String>> = Vec::with_capacity(logical_dims.len());
        for logical in logical_dims {
            dim_axes.push(rules.resolve(logical, mesh)?.to_vec());
        }

        let mut used_axes: Vec<&str> = Vec::new();
        for axes in &dim_axes {
            for axis in axes {
                if used_axes.contains(&axis.as_str()) {
                    return Err(Error::AxisReuse {
                        axis: axis.clone(),
                        array: name.to_string(),
                    });
                }
                used_axes.push(axis);
            }
        }

        let mut partitions_per_dim = Vec::with_capacity(global_shape.len());
        let mut shard_shape = Vec::with_capacity(global_shape.len());
        for (dim, axes) in dim_axes.iter().enumerate() {
            let partitions: usize = axes
                .iter()
                .map(|axis| mesh.axis_size(axis).unwrap_or(1))
                .product();
            if partitions == 0 || global_shape[dim] % partitions != 0 {
                return Err(Error::UnevenPartition {
                    array: name.to_string(),
                    dim,
                    dim_size: global_shape[dim],
                    axis: axes.join(","),
                    axis_size: partitions,
                });
            }
            partitions_per_dim.push(partitions);
            shard_shape.push(global_shape[dim] / partitions);
        }

        let mut slices = Vec::with_capacity(mesh.device_count());
        for device in mesh.devices() {
            let mut device_slices = Vec::with_capacity(global_shape.len());
            for (dim, axes) in dim_axes.iter().enumerate() {
                let mut partition_index = 0;
                for axis in axes {
                    let axis_position = mesh
                        .axis_index(axis)
                        .ok_or_else(|| Error::UnknownMeshAxis { axis: axis.clone() })?;
                    let axis_size = mesh.axes()[axis_position].size();
                    partition_index =
                        partition_index * axis_size + device.coordinate[axis_position];
                }
                let start = partition_index * shard_shape[dim];
                device_slices.push(ShardSlice {
                    start,
                    end: start + shard_shape[dim],
                });
            }
            slices.push(device_slices);
        }

        Ok(Self {
            name: name.to_string(),
            global_shape: global_shape.to_vec(),
            shard_shape,
            partitions_per_dim,
            slices,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    pub fn shard_shape(&self) -> &[usize] {
        &self.shard_shape
    }

    /// Elements in the global array
    pub fn global_len(&self) -> usize {
        self.global_shape.iter().product()
    }

    /// Elements in one shard
    pub fn shard_len(&self) -> usize {
        self.shard_shape.iter().product()
    }

    /// Number of distinct shards
    pub fn num_partitions(&self) -> usize {
        self.partitions_per_dim.iter().product()
    }

    /// Devices per distinct shard
    pub fn replication_factor(&self) -> usize {
        self.slices.len() / self.num_partitions()
    }

    pub fn device_count(&self) -> usize {
        self.slices.len()
    }

    /// Slice ranges of one device's shard, per dimension
    pub fn device_slices(&self, device: DeviceId) -> &[ShardSlice] {
        &self.slices[device]
    }

    /// Devices grouped so every group holds an identical shard
    pub fn replica_groups(&self) -> Vec<Vec<DeviceId>> {
        let mut groups: BTreeMap<Vec<usize>, Vec<DeviceId>> = BTreeMap::new();
        for (device, slices) in self.slices.iter().enumerate() {
            let key: Vec<usize> = slices.iter().map(|slice| slice.start).collect();
            groups.entry(key).or_default().push(device);
        }
        groups.into_values().collect()
    }

    /// Copy one device's shard out of a global array
    pub fn extract_shard<T: Copy>(&self, global: &[T], device: DeviceId) -> Result<Vec<T>> {
        if global.len() != self.global_len() {
            return Err(Error::ShapeMismatch {
                name: self.name.clone(),
                expected: self.global_shape.clone(),
                actual: vec![global.len()],
            });
        }

        let mut shard = Vec::with_capacity(self.shard_len());
        self.for_each_shard_row(device, |global_offset, row_len| {
            shard.extend_from_slice(&global[global_offset..global_offset + row_len]);
        });
        Ok(shard)
    }

    /// Copy one device's shard into its place in a global array
    pub fn scatter_shard<T: Copy>(
        &self,
        shard: &[T],
        global: &mut [T],
        device: DeviceId,
    ) -> Result<()> {
        if shard.len() != self.shard_len() {
            return Err(Error::ShapeMismatch {
                name: self.name.clone(),
                expected: self.shard_shape.clone(),
                actual: vec![shard.len()],
            });
        }
        if global.len() != self.global_len() {
            return Err(Error::ShapeMismatch {
                name: self.name.clone(),
                expected: self.global_shape.clone(),
                actual: vec![global.len()],
            });
        }

        let mut shard_offset = 0;
        self.for_each_shard_row(device, |global_offset, row_len| {
            global[global_offset..global_offset + row_len]
                .copy_from_slice(&shard[shard_offset..shard_offset + row_len]);
            shard_offset += row_len;
        });
        Ok(())
    }

    /// Walk the shard as contiguous last-dimension rows, yielding the
    /// global offset and length of each row
    fn for_each_shard_row<F: FnMut(usize, usize)>(&self, device: DeviceId, mut visit: F) {
        let rank = self.global_shape.len();
        if rank == 0 {
            visit(0, 1);
            return;
        }

        let mut strides = vec![1usize; rank];
        for dim in (0..rank - 1).rev() {
            strides[dim] = strides[dim + 1] * self.global_shape[dim + 1];
        }

        let slices = &self.slices[device];
        let row_len = self.shard_shape[rank - 1];
        let mut index = vec![0usize; rank.saturating_sub(1)];

        loop {
            let mut offset = slices[rank - 1].start;
            for dim in 0..rank - 1 {
                offset += (slices[dim].start + index[dim]) * strides[dim];
            }
            visit(offset, row_len);

            let mut advanced = false;
            for dim in (0..rank - 1).rev() {
                index[dim] += 1;
                if index[dim] < self.shard_shape[dim] {
                    advanced = true;
                    break;
                }
                index[dim] = 0;
            }
            if !advanced {
                break;
            }
        }
    }
}
