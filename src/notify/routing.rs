//! Notification routing table: external notification id to (module, irq).
//!
//! Read from signal context, so it is a fixed-capacity array behind a spin
//! lock and is only written with the real-time signals masked.

use arrayvec::ArrayVec;
use axerrno::{AxError, AxResult, ax_err};
use spin::RwLock;

use crate::protocol::{ModuleName, module_name};
use crate::signal::IrqGuard;

/// Maximum number of notification mappings.
pub const MAX_NOTIFICATIONS: usize = 16;

/// One binding between an external notification id and a model's IRQ line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationMapping {
    /// External id; the signal number under signal delivery.
    pub id: i32,
    pub module: ModuleName,
    pub irq: u32,
}

/// One-to-one mapping between notification ids and `(module, irq)` pairs.
pub struct NotificationTable {
    table: RwLock<ArrayVec<NotificationMapping, MAX_NOTIFICATIONS>>,
}

impl NotificationTable {
    pub const fn new() -> Self {
        Self {
            table: RwLock::new(ArrayVec::new_const()),
        }
    }

    /// Adds a mapping.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` for a bad module name.
    /// - `AlreadyExists` if either the id or the `(module, irq)` pair is
    ///   already bound.
    /// - `NoMemory` if the table is full.
    pub fn bind(&self, id: i32, module: &str, irq: u32) -> AxResult<NotificationMapping> {
        let mapping = NotificationMapping {
            id,
            module: module_name(module)?,
            irq,
        };

        let _irq = IrqGuard::new();
        let mut table = self.table.write();
        if table.iter().any(|m| m.id == id) {
            return ax_err!(AlreadyExists, "notification id already bound");
        }
        if table
            .iter()
            .any(|m| m.irq == irq && m.module == mapping.module)
        {
            return ax_err!(AlreadyExists, "interrupt line already bound");
        }
        table.try_push(mapping).map_err(|_| AxError::NoMemory)?;
        Ok(mapping)
    }

    /// Finds the mapping for an incoming notification. Async-signal-safe.
    pub fn by_id(&self, id: i32) -> Option<NotificationMapping> {
        self.table.read().iter().find(|m| m.id == id).copied()
    }

    /// Finds the notification id a model's IRQ line is bound to.
    pub fn by_target(&self, module: &str, irq: u32) -> Option<NotificationMapping> {
        self.table
            .read()
            .iter()
            .find(|m| m.irq == irq && m.module.as_str() == module)
            .copied()
    }

    /// Snapshot of every mapping.
    pub fn mappings(&self) -> ArrayVec<NotificationMapping, MAX_NOTIFICATIONS> {
        self.table.read().clone()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

impl Default for NotificationTable {
    fn default() -> Self {
        Self::new()
    }
}
