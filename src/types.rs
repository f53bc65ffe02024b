//! Core data types for frameline
//!
//! This module contains the element types carried by sockets and adaptor
//! channels.
//!
//! # Main Types
//!
//! - [`DataType`] - Closed set of element types (u8, u16, u32, f32, etc.)
//!
//! Socket compatibility is decided by comparing `DataType` values at bind
//! time, so no runtime type inspection happens on the hot path.

use serde::{Deserialize, Serialize};

/// Element type of a socket or adaptor channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 8-bit unsigned integer
    #[default]
    U8,
    /// 16-bit unsigned integer
    U16,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer
    U64,
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
}

impl DataType {
    /// Returns the size in bytes of one element of this type
    pub const fn size_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Parse one little-endian element into a f64 (used by debug dumps)
    pub fn parse_to_f64(&self, bytes: &[u8]) -> Option<f64> {
        let size = self.size_bytes();
        if bytes.len() < size {
            return None;
        }
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(&bytes[..size]);

        Some(match self {
            DataType::U8 => raw[0] as f64,
            DataType::I8 => raw[0] as i8 as f64,
            DataType::U16 => u16::from_le_bytes([raw[0], raw[1]]) as f64,
            DataType::I16 => i16::from_le_bytes([raw[0], raw[1]]) as f64,
            DataType::U32 => u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
            DataType::I32 => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
            DataType::F32 => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64,
            DataType::U64 => u64::from_le_bytes(raw) as f64,
            DataType::I64 => i64::from_le_bytes(raw) as f64,
            DataType::F64 => f64::from_le_bytes(raw),
        })
    }

    /// Render at most `limit` elements of `bytes` as a compact list.
    pub fn format_elements(&self, bytes: &[u8], limit: usize) -> String {
        let size = self.size_bytes();
        let total = bytes.len() / size;
        let shown = total.min(limit);
        let mut out = String::from("[");
        for (i, chunk) in bytes.chunks_exact(size).take(shown).enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            match self.parse_to_f64(chunk) {
                Some(v) if matches!(self, DataType::F32 | DataType::F64) => {
                    out.push_str(&format!("{:.3}", v))
                }
                Some(v) => out.push_str(&format!("{}", v as i128)),
                None => out.push('?'),
            }
        }
        if total > shown {
            out.push_str(&format!(", ... (+{})", total - shown));
        }
        out.push(']');
        out
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::U8 => write!(f, "u8"),
            DataType::U16 => write!(f, "u16"),
            DataType::U32 => write!(f, "u32"),
            DataType::U64 => write!(f, "u64"),
            DataType::I8 => write!(f, "i8"),
            DataType::I16 => write!(f, "i16"),
            DataType::I32 => write!(f, "i32"),
            DataType::I64 => write!(f, "i64"),
            DataType::F32 => write!(f, "f32"),
            DataType::F64 => write!(f, "f64"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_size() {
        assert_eq!(DataType::U8.size_bytes(), 1);
        assert_eq!(DataType::I16.size_bytes(), 2);
        assert_eq!(DataType::U32.size_bytes(), 4);
        assert_eq!(DataType::U64.size_bytes(), 8);
        assert_eq!(DataType::F32.size_bytes(), 4);
        assert_eq!(DataType::F64.size_bytes(), 8);
    }

    #[test]
    fn test_data_type_parse() {
        let bytes_u32: [u8; 4] = 1000u32.to_le_bytes();
        assert_eq!(DataType::U32.parse_to_f64(&bytes_u32), Some(1000.0));

        let bytes_i16: [u8; 2] = (-12i16).to_le_bytes();
        assert_eq!(DataType::I16.parse_to_f64(&bytes_i16), Some(-12.0));

        assert_eq!(DataType::U64.parse_to_f64(&[1, 2]), None);
    }

    #[test]
    fn test_format_elements_truncates() {
        let bytes = [1u8, 2, 3, 4, 5];
        assert_eq!(DataType::U8.format_elements(&bytes, 3), "[1, 2, 3, ... (+2)]");
        assert_eq!(DataType::U8.format_elements(&bytes, 16), "[1, 2, 3, 4, 5]");
    }

    #[test]
    fn test_data_type_serde_lowercase() {
        let json = serde_json::to_string(&DataType::F32).unwrap();
        assert_eq!(json, "\"f32\"");
    }
}
