// Element types and device placement for tensors entering the coordinator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GradflowError;

// ── Data Type ────────────────────────────────────────────────────────────────

/// Element type of a tensor handed to the coordinator.
///
/// Numeric discriminants are the framework-facing type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Float32 = 0,
    Float64 = 1,
    Float16 = 2,
    Uint8   = 3,
    Int32   = 4,
    Int8    = 5,
    Int64   = 6,
}

impl DataType {
    /// Width of the widest element type.
    pub const MAX_ELEMENT_BYTES: usize = 8;

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Float32),
            1 => Some(Self::Float64),
            2 => Some(Self::Float16),
            3 => Some(Self::Uint8),
            4 => Some(Self::Int32),
            5 => Some(Self::Int8),
            6 => Some(Self::Int64),
            _ => None,
        }
    }

    /// Bytes per element for this dtype.
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 => 1,
            Self::Float16 => 2,
            Self::Float32 | Self::Int32 => 4,
            Self::Float64 | Self::Int64 => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Float32 => "f32",
            Self::Float64 => "f64",
            Self::Float16 => "f16",
            Self::Uint8   => "u8",
            Self::Int32   => "i32",
            Self::Int8    => "i8",
            Self::Int64   => "i64",
        };
        f.write_str(s)
    }
}

impl FromStr for DataType {
    type Err = GradflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(Self::Float32),
            "f64" | "float64" => Ok(Self::Float64),
            "f16" | "float16" => Ok(Self::Float16),
            "u8" | "uint8"    => Ok(Self::Uint8),
            "i32" | "int32"   => Ok(Self::Int32),
            "i8" | "int8"     => Ok(Self::Int8),
            "i64" | "int64"   => Ok(Self::Int64),
            _ => Err(GradflowError::UnknownDataType(s.to_string())),
        }
    }
}

// ── Device ───────────────────────────────────────────────────────────────────

/// Where a tensor's source memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host memory. No staging buffer is needed.
    Cpu,
    /// GPU with the given ordinal.
    Gpu(u32),
}

impl Device {
    /// Raw device id frameworks use for host memory.
    pub const HOST_SENTINEL: i32 = -1;

    /// Map a framework device id (`-1` for host, otherwise a GPU ordinal).
    pub fn from_raw(id: i32) -> Self {
        if id < 0 {
            Self::Cpu
        } else {
            Self::Gpu(id as u32)
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Gpu(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu(i) => write!(f, "gpu:{i}"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_widths() {
        assert_eq!(DataType::Uint8.element_bytes(), 1);
        assert_eq!(DataType::Int8.element_bytes(), 1);
        assert_eq!(DataType::Float16.element_bytes(), 2);
        assert_eq!(DataType::Float32.element_bytes(), 4);
        assert_eq!(DataType::Int32.element_bytes(), 4);
        assert_eq!(DataType::Float64.element_bytes(), 8);
        assert_eq!(DataType::Int64.element_bytes(), 8);
    }

    #[test]
    fn type_codes() {
        for v in 0..=6u8 {
            let dt = DataType::from_u8(v).unwrap();
            assert_eq!(dt as u8, v);
        }
        assert!(DataType::from_u8(7).is_none());
    }

    #[test]
    fn parse_names() {
        assert_eq!("f16".parse::<DataType>().unwrap(), DataType::Float16);
        assert_eq!("Float32".parse::<DataType>().unwrap(), DataType::Float32);
        assert!("bf16".parse::<DataType>().is_err());
    }

    #[test]
    fn device_from_raw() {
        assert_eq!(Device::from_raw(Device::HOST_SENTINEL), Device::Cpu);
        assert_eq!(Device::from_raw(3), Device::Gpu(3));
        assert!(Device::Gpu(0).is_gpu());
        assert!(!Device::Cpu.is_gpu());
        assert_eq!(Device::Gpu(1).to_string(), "gpu:1");
    }
}
