//! Identity types for the pipeline system.
//!
//! All IDs are newtypes over `u32` that serve as direct array indices
//! into their respective storage vectors, providing O(1) lookup.

use std::fmt;

/// Index into `Graph::modules`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl ModuleId {
    pub const INVALID: ModuleId = ModuleId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "ModuleId(INVALID)")
        } else {
            write!(f, "ModuleId({})", self.0)
        }
    }
}

/// Index into `Graph::tasks`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct TaskId(pub u32);

impl TaskId {
    pub const INVALID: TaskId = TaskId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Address the `index`-th socket of this task.
    #[inline]
    pub fn socket(self, index: u16) -> SocketId {
        SocketId::new(self, index)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "TaskId(INVALID)")
        } else {
            write!(f, "TaskId({})", self.0)
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Compact socket identifier. High 20 bits = task index, low 12 bits = socket index.
/// Supports up to ~1M tasks with 4096 sockets each.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

impl SocketId {
    const SOCKET_BITS: u32 = 12;
    const SOCKET_MASK: u32 = (1 << Self::SOCKET_BITS) - 1;

    pub fn new(task: TaskId, socket_index: u16) -> Self {
        debug_assert!(socket_index < (1 << Self::SOCKET_BITS) as u16);
        Self((task.0 << Self::SOCKET_BITS) | (socket_index as u32 & Self::SOCKET_MASK))
    }

    #[inline]
    pub fn task(self) -> TaskId {
        TaskId(self.0 >> Self::SOCKET_BITS)
    }

    #[inline]
    pub fn socket_index(self) -> u16 {
        (self.0 & Self::SOCKET_MASK) as u16
    }
}

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SocketId(task={}, socket={})",
            self.task().0,
            self.socket_index()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id() {
        let id = TaskId(42);
        assert!(id.is_valid());
        assert_eq!(id.index(), 42);
        assert!(!TaskId::INVALID.is_valid());
    }

    #[test]
    fn test_socket_id_round_trip() {
        let task = TaskId(100);
        let socket = task.socket(7);
        assert_eq!(socket.task(), task);
        assert_eq!(socket.socket_index(), 7);
    }

    #[test]
    fn test_socket_id_limits() {
        let task = TaskId((1 << 20) - 1);
        let socket = SocketId::new(task, 4095);
        assert_eq!(socket.task(), task);
        assert_eq!(socket.socket_index(), 4095);
    }

    #[test]
    fn test_module_id() {
        let id = ModuleId(3);
        assert!(id.is_valid());
        assert!(!ModuleId::INVALID.is_valid());
    }
}
