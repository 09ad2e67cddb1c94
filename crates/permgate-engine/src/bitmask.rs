//! Typed permission bit layouts
//!
//! Object-level blocks use a 6-bit layout, record rules a 3-bit one, each as
//! its own flag type.

use bitflags::bitflags;

use permgate_common::types::{Operation, RecordRulePermissions};

bitflags! {
    /// Object-level operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjectPermissions: u8 {
        const CREATE = 1 << 0;
        const READ = 1 << 1;
        const UPDATE = 1 << 2;
        const DELETE = 1 << 3;
        const VIEW_ALL = 1 << 4;
        const MODIFY_ALL = 1 << 5;
    }
}

bitflags! {
    /// Operations a record rule can grant
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecordPermissions: u8 {
        const READ = 1 << 0;
        const UPDATE = 1 << 1;
        const DELETE = 1 << 2;
    }
}

impl ObjectPermissions {
    #[must_use]
    pub fn from_operation(operation: Operation) -> Self {
        match operation {
            Operation::Create => Self::CREATE,
            Operation::Read => Self::READ,
            Operation::Update => Self::UPDATE,
            Operation::Delete => Self::DELETE,
            Operation::ViewAll => Self::VIEW_ALL,
            Operation::ModifyAll => Self::MODIFY_ALL,
        }
    }

    #[must_use]
    pub fn grants(self, operation: Operation) -> bool {
        self.contains(Self::from_operation(operation))
    }
}

impl RecordPermissions {
    /// Bit for `operation`; `None` for operations record rules never grant
    #[must_use]
    pub fn from_operation(operation: Operation) -> Option<Self> {
        match operation {
            Operation::Read => Some(Self::READ),
            Operation::Update => Some(Self::UPDATE),
            Operation::Delete => Some(Self::DELETE),
            _ => None,
        }
    }

    #[must_use]
    pub fn grants(self, operation: Operation) -> bool {
        Self::from_operation(operation).is_some_and(|bit| self.contains(bit))
    }
}

impl From<&RecordRulePermissions> for RecordPermissions {
    fn from(perms: &RecordRulePermissions) -> Self {
        let mut bits = Self::empty();
        bits.set(Self::READ, perms.read);
        bits.set(Self::UPDATE, perms.update);
        bits.set(Self::DELETE, perms.delete);
        bits
    }
}
