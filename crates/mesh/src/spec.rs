//! Mesh axes and device enumeration

use runtime_core::{DeviceId, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use runtime_core::config::MeshSection;

/// One named mesh axis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshAxis {
    name: String,
    size: usize,
}

impl MeshAxis {
    /// Create an axis, rejecting empty names and zero sizes
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidConfig {
                message: "mesh axis name must not be empty".to_string(),
            });
        }
        if size == 0 {
            return Err(Error::InvalidConfig {
                message: format!("mesh axis {name} must have a positive size"),
            });
        }
        Ok(Self { name, size })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// One device position within a mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshDevice {
    /// Linear device index, row-major over the axis order
    pub id: DeviceId,

    /// Position along each mesh axis
    pub coordinate: Vec<usize>,

    /// Index of the process hosting this device
    pub process_index: usize,
}

/// A validated device mesh
///
/// Axes are ordered; devices are enumerated row-major, so the last axis
/// varies fastest. The product of axis sizes always equals the device
/// count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSpec {
    axes: Vec<MeshAxis>,
    axis_index_by_name: HashMap<String, usize>,
    devices: Vec<MeshDevice>,
    devices_per_process: usize,
}

impl MeshSpec {
    /// Build a single-host mesh
    pub fn build(axes: Vec<MeshAxis>, device_count: usize) -> Result<Self> {
        Self::build_with_hosts(axes, device_count, device_count)
    }

    /// Build a mesh whose devices are grouped into processes of
    /// `devices_per_process` consecutive device ids
    pub fn build_with_hosts(
        axes: Vec<MeshAxis>,
        device_count: usize,
        devices_per_process: usize,
    ) -> Result<Self> {
        if axes.is_empty() {
            return Err(Error::InvalidConfig {
                message: "a mesh requires at least one axis".to_string(),
            });
        }

        let mut axis_index_by_name = HashMap::with_capacity(axes.len());
        for (index, axis) in axes.iter().enumerate() {
            if axis_index_by_name.insert(axis.name().to_string(), index).is_some() {
                return Err(Error::DuplicateMeshAxis {
                    axis: axis.name().to_string(),
                });
            }
        }

        let mut axis_product: usize = 1;
        for axis in &axes {
            axis_product = axis_product
                .checked_mul(axis.size())
                .ok_or_else(|| Error::InvalidConfig {
                    message: "mesh axis sizes overflow the device count".to_string(),
                })?;
        }
        if axis_product != device_count {
            return Err(Error::MeshSizeMismatch {
                axis_product,
                device_count,
            });
        }

        if devices_per_process == 0 || device_count % devices_per_process != 0 {
            return Err(Error::InvalidConfig {
                message: format!(
                    "{device_count} devices cannot be split into processes of {devices_per_process}"
                ),
            });
        }

        let shape: Vec<usize> = axes.iter().map(MeshAxis::size).collect();
        let devices = (0..device_count)
            .map(|id| MeshDevice {
                id,
                coordinate: decode_coordinate(id, &shape),
                process_index: id / devices_per_process,
            })
            .collect();

        Ok(Self {
            axes,
            axis_index_by_name,
            devices,
            devices_per_process,
        })
    }

    /// Build a mesh from its configuration section
    ///
    /// At most one axis may carry size -1; its size is inferred so the
    /// product matches the configured device count.
    pub fn from_config(section: &MeshSection) -> Result<Self> {
        let device_count = section.device_count;
        let fixed_product: usize = section
            .axes
            .iter()
            .filter(|entry| entry.size != -1)
            .map(|entry| entry.size.max(0) as usize)
            .product();

        let mut axes = Vec::with_capacity(section.axes.len());
        for entry in &section.axes {
            let size = if entry.size == -1 {
                if fixed_product == 0 || device_count % fixed_product != 0 {
                    return Err(Error::InvalidConfig {
                        message: format!(
                            "cannot infer size for mesh axis {}: {device_count} devices not \
                             divisible by the remaining axes product {fixed_product}",
                            entry.name
                        ),
                    });
                }
                device_count / fixed_product
            } else if entry.size > 0 {
                entry.size as usize
            } else {
                return Err(Error::InvalidConfig {
                    message: format!("mesh axis {} must have a positive size or -1", entry.name),
                });
            };
            axes.push(MeshAxis::new(entry.name.clone(), size)?);
        }

        Self::build(axes, device_count)
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    pub fn devices(&self) -> &[MeshDevice] {
        &self.devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices_per_process(&self) -> usize {
        self.devices_per_process
    }

    pub fn process_count(&self) -> usize {
        self.devices.len() / self.devices_per_process
    }

    /// Axis sizes in axis order
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(MeshAxis::size).collect()
    }

    /// Axes as a compact `name=size` list for log lines
    pub fn summary(&self) -> String {
        self.axes
            .iter()
            .map(|axis| format!("{}={}", axis.name(), axis.size()))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Position of a named axis in the axis order
    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.axis_index_by_name.get(name).copied()
    }

    /// Size of a named axis
    pub fn axis_size(&self, name: &str) -> Option<usize> {
        self.axis_index(name).map(|index| self.axes[index].size())
    }

    /// Mesh coordinate of a device id
    pub fn coordinate_of(&self, device: DeviceId) -> &[usize] {
        &self.devices[device].coordinate
    }

    /// Device id at a mesh coordinate
    pub fn device_at(&self, coordinate: &[usize]) -> DeviceId {
        let mut id = 0;
        for (position, axis) in coordinate.iter().zip(self.axes.iter()) {
            id = id * axis.size() + position;
        }
        id
    }
}

fn decode_coordinate(id: DeviceId, shape: &[usize]) -> Vec<usize> {
    let mut coordinate = vec![0; shape.len()];
    let mut remainder = id;
    for (dim, &size) in shape.iter().enumerate().rev() {
        coordinate[dim] = remainder % size;
        remainder /= size;
    }
    coordinate
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_core::config::MeshAxisEntry;

    fn data_model_axes() -> Vec<MeshAxis> {
        vec![
            MeshAxis::new("data", 4).unwrap(),
            MeshAxis::new("model", 2).unwrap(),
        ]
    }

    #[test]
    fn test_build_matches_device_count() {
        let mesh = MeshSpec::build(data_model_axes(), 8).unwrap();
        assert_eq!(mesh.device_count(), 8);
        assert_eq!(mesh.shape(), vec![4, 2]);
    }

    #[test]
    fn test_build_rejects_wrong_device_count() {
        let err = MeshSpec::build(data_model_axes(), 16).unwrap_err();
        assert!(matches!(
            err,
            Error::MeshSizeMismatch {
                axis_product: 8,
                device_count: 16
            }
        ));
    }

    #[test]
    fn test_duplicate_axis_rejected() {
        let axes = vec![
            MeshAxis::new("data", 2).unwrap(),
            MeshAxis::new("data", 4).unwrap(),
        ];
        let err = MeshSpec::build(axes, 8).unwrap_err();
        assert!(matches!(err, Error::DuplicateMeshAxis { axis } if axis == "data"));
    }

    #[test]
    fn test_axis_validation() {
        assert!(MeshAxis::new("", 2).is_err());
        assert!(MeshAxis::new("data", 0).is_err());
    }

    #[test]
    fn test_row_major_coordinates() {
        let mesh = MeshSpec::build(data_model_axes(), 8).unwrap();
        assert_eq!(mesh.coordinate_of(0), &[0, 0]);
        assert_eq!(mesh.coordinate_of(1), &[0, 1]);
        assert_eq!(mesh.coordinate_of(5), &[2, 1]);
        for device in 0..8 {
            assert_eq!(mesh.device_at(mesh.coordinate_of(device)), device);
        }
    }

    #[test]
    fn test_process_indices() {
        let mesh = MeshSpec::build_with_hosts(data_model_axes(), 8, 4).unwrap();
        assert_eq!(mesh.process_count(), 2);
        assert_eq!(mesh.devices()[3].process_index, 0);
        assert_eq!(mesh.devices()[4].process_index, 1);
    }

    #[test]
    fn test_from_config_infers_axis_size() {
        let section = MeshSection {
            device_count: 8,
            axes: vec![
                MeshAxisEntry {
                    name: "data".to_string(),
                    size: -1,
                },
                MeshAxisEntry {
                    name: "model".to_string(),
                    size: 2,
                },
            ],
            logical_axis_rules: Vec::new(),
        };
        let mesh = MeshSpec::from_config(&section).unwrap();
        assert_eq!(mesh.axis_size("data"), Some(4));
    }

    #[test]
    fn test_from_config_rejects_non_divisible_inference() {
        let section = MeshSection {
            device_count: 8,
            axes: vec![
                MeshAxisEntry {
                    name: "data".to_string(),
                    size: -1,
                },
                MeshAxisEntry {
                    name: "model".to_string(),
                    size: 3,
                },
            ],
            logical_axis_rules: Vec::new(),
        };
        assert!(MeshSpec::from_config(&section).is_err());
    }
}
