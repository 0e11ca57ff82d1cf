//! Device topology descriptors.
//!
//! A mesh arranges devices along named axes (e.g. `data` x `model`).
//! Executors own their mesh; everything else only reads it.

use candle_core::Device;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("{names} axis names for {dims} mesh dimensions")]
    AxisCountMismatch { names: usize, dims: usize },

    #[error("mesh shape needs {expected} devices, got {found}")]
    DeviceCountMismatch { expected: usize, found: usize },

    #[error("axis `{0}` declared twice")]
    DuplicateAxis(String),

    #[error("axis `{0}` has size 0")]
    EmptyAxis(String),

    #[error("no axis named `{0}`")]
    UnknownAxis(String),
}

/// Devices laid out on a named, row-major grid.
#[derive(Debug, Clone)]
pub struct DeviceMesh {
    axis_names: Vec<String>,
    shape: Vec<usize>,
    devices: Vec<Device>,
}

impl DeviceMesh {
    pub fn new(
        axis_names: Vec<String>,
        shape: Vec<usize>,
        devices: Vec<Device>,
    ) -> Result<Self, MeshError> {
        if axis_names.len() != shape.len() {
            return Err(MeshError::AxisCountMismatch {
                names: axis_names.len(),
                dims: shape.len(),
            });
        }
        for (i, name) in axis_names.iter().enumerate() {
            if axis_names[..i].contains(name) {
                return Err(MeshError::DuplicateAxis(name.clone()));
            }
            if shape[i] == 0 {
                return Err(MeshError::EmptyAxis(name.clone()));
            }
        }
        let expected: usize = shape.iter().product();
        if devices.len() != expected {
            return Err(MeshError::DeviceCountMismatch {
                expected,
                found: devices.len(),
            });
        }
        Ok(Self {
            axis_names,
            shape,
            devices,
        })
    }

    /// Single-host, single-device mesh.
    pub fn cpu() -> Self {
        Self {
            axis_names: vec!["data".to_string()],
            shape: vec![1],
            devices: vec![Device::Cpu],
        }
    }

    pub fn axis_names(&self) -> &[String] {
        &self.axis_names
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn axis_size(&self, axis: &str) -> Option<usize> {
        self.axis_names
            .iter()
            .position(|a| a == axis)
            .map(|i| self.shape[i])
    }
}

/// Placement of an array across a [`DeviceMesh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sharding {
    /// Every device holds a full copy.
    Replicated,
    /// The leading dimension is split evenly along `axis`.
    Partitioned { axis: String },
}

impl Sharding {
    /// Per-device extent of a leading dimension of length `len`.
    pub fn shard_len(&self, mesh: &DeviceMesh, len: usize) -> Result<usize, MeshError> {
        match self {
            Self::Replicated => Ok(len),
            Self::Partitioned { axis } => {
                let parts = mesh
                    .axis_size(axis)
                    .ok_or_else(|| MeshError::UnknownAxis(axis.clone()))?;
                Ok(len.div_ceil(parts))
            }
        }
    }
}
