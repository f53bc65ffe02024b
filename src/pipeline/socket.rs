//! Socket descriptors for the task system.
//!
//! Each task declares its sockets via static `SocketSpec` arrays. The graph
//! uses these to validate bindings: element type and element count must match
//! on both ends.

use crate::types::DataType;

/// Whether a socket is read, written, or modified in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketDirection {
    /// Bound to exactly one upstream writer, read-only.
    Input,
    /// Owns its storage, written by the task.
    Output,
    /// Bound to an upstream writer like an input, modified in place and read
    /// by downstream tasks like an output.
    Forward,
}

impl SocketDirection {
    /// Can downstream sockets be bound to this one?
    #[inline]
    pub fn is_writer(self) -> bool {
        matches!(self, SocketDirection::Output | SocketDirection::Forward)
    }

    /// Must this socket be bound to an upstream writer?
    #[inline]
    pub fn is_reader(self) -> bool {
        matches!(self, SocketDirection::Input | SocketDirection::Forward)
    }
}

/// Static descriptor for a task's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketSpec {
    pub name: &'static str,
    pub direction: SocketDirection,
    pub datatype: DataType,
    /// Elements per frame.
    pub n_elmts: usize,
}

impl SocketSpec {
    pub const fn input(name: &'static str, datatype: DataType, n_elmts: usize) -> Self {
        Self {
            name,
            direction: SocketDirection::Input,
            datatype,
            n_elmts,
        }
    }

    pub const fn output(name: &'static str, datatype: DataType, n_elmts: usize) -> Self {
        Self {
            name,
            direction: SocketDirection::Output,
            datatype,
            n_elmts,
        }
    }

    pub const fn forward(name: &'static str, datatype: DataType, n_elmts: usize) -> Self {
        Self {
            name,
            direction: SocketDirection::Forward,
            datatype,
            n_elmts,
        }
    }

    /// Bytes held by this socket for a single frame.
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.n_elmts * self.datatype.size_bytes()
    }

    /// Whether `self` (a reader) may be bound to `writer`.
    pub fn accepts(&self, writer: &SocketSpec) -> bool {
        self.direction.is_reader()
            && writer.direction.is_writer()
            && self.datatype == writer.datatype
            && self.n_elmts == writer.n_elmts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes() {
        let s = SocketSpec::output("out", DataType::U32, 16);
        assert_eq!(s.frame_bytes(), 64);
    }

    #[test]
    fn test_accepts_checks_type_and_count() {
        let out = SocketSpec::output("out", DataType::U8, 8);
        assert!(SocketSpec::input("in", DataType::U8, 8).accepts(&out));
        assert!(SocketSpec::forward("fwd", DataType::U8, 8).accepts(&out));
        assert!(!SocketSpec::input("in", DataType::I8, 8).accepts(&out));
        assert!(!SocketSpec::input("in", DataType::U8, 4).accepts(&out));
        // Outputs are never readers.
        assert!(!SocketSpec::output("o", DataType::U8, 8).accepts(&out));
    }
}
