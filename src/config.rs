use axerrno::AxError;

use crate::notify::DeliveryMethod;

/// How a register range is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeBacking {
    /// Reserved as an inaccessible mapping; native accesses trap.
    #[default]
    Reserved,
    /// Only recorded in the range table; faults are fed in explicitly.
    Recorded,
}

/// A register range owned by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeConfig {
    pub start: usize,
    /// Exclusive.
    pub end: usize,
    pub module: String,
    pub backing: RangeBacking,
}

/// Maps external id `id` to interrupt `irq` of `module`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    pub id: i32,
    pub module: String,
    pub irq: u32,
}

/// Everything the simulator applies at start-up.
#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    pub ranges: Vec<RangeConfig>,
    pub notifications: Vec<NotificationConfig>,
    pub delivery: DeliveryMethod,
}

impl SimConfig {
    pub fn new(delivery: DeliveryMethod) -> Self {
        Self {
            delivery,
            ..Default::default()
        }
    }

    pub fn with_range(
        mut self,
        start: usize,
        end: usize,
        module: &str,
        backing: RangeBacking,
    ) -> Self {
        self.ranges.push(RangeConfig {
            start,
            end,
            module: module.into(),
            backing,
        });
        self
    }

    pub fn with_notification(mut self, id: i32, module: &str, irq: u32) -> Self {
        self.notifications.push(NotificationConfig {
            id,
            module: module.into(),
            irq,
        });
        self
    }
}

/// A configuration entry that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEntry {
    Range(RangeConfig),
    Notification(NotificationConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigRejection {
    pub entry: ConfigEntry,
    pub error: AxError,
}

/// Outcome of applying a [`SimConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigReport {
    /// Number of entries applied.
    pub applied: usize,
    pub rejected: Vec<ConfigRejection>,
}

impl ConfigReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    pub(crate) fn record(&mut self, entry: ConfigEntry, outcome: axerrno::AxResult) {
        match outcome {
            Ok(()) => self.applied += 1,
            Err(error) => self.rejected.push(ConfigRejection { entry, error }),
        }
    }
}
