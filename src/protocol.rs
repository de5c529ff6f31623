//! Structured request/response messages exchanged between the trap layer,
//! explicit callers and the device-model registry.
//!
//! A [`SimMessage`] is a small `Copy` value. Everything it carries (including
//! the module name) lives inline, so a message can be built inside a fault
//! handler and passed across the service hand-off without allocating.

use core::fmt;

use arrayvec::ArrayString;
use axerrno::{AxError, AxResult};

/// Capacity of a module name field. Names are limited to one byte less so the
/// field always fits a NUL-terminated copy.
pub const MODULE_NAME_CAP: usize = 32;

/// Inline, fixed-capacity module name.
pub type ModuleName = ArrayString<MODULE_NAME_CAP>;

/// Builds a [`ModuleName`], rejecting empty names and names that do not fit.
pub fn module_name(name: &str) -> AxResult<ModuleName> {
    if name.is_empty() || name.len() >= MODULE_NAME_CAP {
        return axerrno::ax_err!(InvalidInput, "module name must be 1..=31 bytes");
    }
    ModuleName::from(name).map_err(|_| AxError::InvalidInput)
}

/// Message kind, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Clock = 1,
    Reset = 2,
    RegisterRead = 3,
    RegisterWrite = 4,
    Interrupt = 5,
    Response = 6,
}

/// Clock control carried by a [`MessageKind::Clock`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ClockAction {
    Tick = 1,
    Enable = 2,
    Disable = 3,
}

/// Reset line control carried by a [`MessageKind::Reset`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResetAction {
    Assert = 1,
    Deassert = 2,
}

/// Width of a decoded register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Word,
    /// 32-bit access.
    #[default]
    Dword,
    /// 64-bit access.
    Qword,
}

impl AccessWidth {
    /// Size of the access in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }

    /// Bit mask covering the access.
    pub const fn mask(self) -> u64 {
        match self {
            Self::Byte => 0xff,
            Self::Word => 0xffff,
            Self::Dword => 0xffff_ffff,
            Self::Qword => u64::MAX,
        }
    }

    /// Converts a byte count back into a width.
    pub const fn from_size(size: usize) -> Option<Self> {
        match size {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            8 => Some(Self::Qword),
            _ => None,
        }
    }
}

/// Kind-specific part of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    None,
    Clock { action: ClockAction, cycles: u32 },
    Reset { action: ResetAction },
    Interrupt { irq: u32 },
    Response { result: u32, error: i32 },
}

/// A structured request or response.
///
/// Requests are consumed exactly once by the message router; the response
/// always has kind [`MessageKind::Response`] and the request's correlation id.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SimMessage {
    pub kind: MessageKind,
    pub module: ModuleName,
    pub address: usize,
    pub value: u32,
    pub width: AccessWidth,
    pub id: u32,
    pub payload: Payload,
}

impl SimMessage {
    fn request(kind: MessageKind, module: ModuleName, payload: Payload) -> Self {
        Self {
            kind,
            module,
            address: 0,
            value: 0,
            width: AccessWidth::Dword,
            id: 0,
            payload,
        }
    }

    /// A register read at `address`.
    pub fn register_read(module: ModuleName, address: usize, width: AccessWidth) -> Self {
        Self {
            address,
            width,
            ..Self::request(MessageKind::RegisterRead, module, Payload::None)
        }
    }

    /// A register write of `value` at `address`.
    pub fn register_write(module: ModuleName, address: usize, value: u32, width: AccessWidth) -> Self {
        Self {
            address,
            value,
            width,
            ..Self::request(MessageKind::RegisterWrite, module, Payload::None)
        }
    }

    pub fn clock(module: ModuleName, action: ClockAction, cycles: u32) -> Self {
        Self::request(MessageKind::Clock, module, Payload::Clock { action, cycles })
    }

    pub fn reset(module: ModuleName, action: ResetAction) -> Self {
        Self::request(MessageKind::Reset, module, Payload::Reset { action })
    }

    pub fn interrupt(module: ModuleName, irq: u32) -> Self {
        Self::request(MessageKind::Interrupt, module, Payload::Interrupt { irq })
    }

    /// Returns a copy carrying the given correlation id.
    pub fn with_id(self, id: u32) -> Self {
        Self { id, ..self }
    }

    /// Builds the response to `request`.
    ///
    /// `result` is meaningful only for register reads and is forced to 0 for
    /// every other kind.
    pub fn response_to(request: &Self, outcome: AxResult<u32>) -> Self {
        let (result, error) = match outcome {
            Ok(value) if request.kind == MessageKind::RegisterRead => (value, 0),
            Ok(_) => (0, 0),
            Err(err) => (0, error_code(err)),
        };
        Self {
            kind: MessageKind::Response,
            module: request.module,
            address: request.address,
            value: 0,
            width: request.width,
            id: request.id,
            payload: Payload::Response { result, error },
        }
    }

    /// Register value of a response, 0 for anything else.
    pub fn result(&self) -> u32 {
        match self.payload {
            Payload::Response { result, .. } => result,
            _ => 0,
        }
    }

    /// Error field of a response: 0 on success, negative on failure.
    pub fn error(&self) -> i32 {
        match self.payload {
            Payload::Response { error, .. } => error,
            _ => 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.kind == MessageKind::Response && self.error() == 0
    }
}

impl fmt::Debug for SimMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimMessage")
            .field("kind", &self.kind)
            .field("module", &self.module.as_str())
            .field("address", &format_args!("{:#x}", self.address))
            .field("value", &format_args!("{:#x}", self.value))
            .field("width", &self.width)
            .field("id", &self.id)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Negative wire error code for an [`AxError`].
pub fn error_code(err: AxError) -> i32 {
    match err {
        AxError::NotFound => -2,
        AxError::BadAddress => -14,
        AxError::AlreadyExists => -17,
        AxError::InvalidInput => -22,
        AxError::NoMemory => -12,
        AxError::BadState => -16,
        AxError::Unsupported => -95,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uart() -> ModuleName {
        module_name("uart").unwrap()
    }

    #[test]
    fn test_module_name_bounds() {
        assert!(module_name("").is_err());
        assert!(module_name(&"x".repeat(31)).is_ok());
        assert!(module_name(&"x".repeat(32)).is_err());
    }

    #[test]
    fn test_read_response_carries_value() {
        let req = SimMessage::register_read(uart(), 0x1018, AccessWidth::Dword).with_id(7);
        let resp = SimMessage::response_to(&req, Ok(0x90));
        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.id, 7);
        assert_eq!(resp.result(), 0x90);
        assert_eq!(resp.error(), 0);
        assert!(resp.is_ok());
    }

    #[test]
    fn test_write_response_ignores_result() {
        let req = SimMessage::register_write(uart(), 0x1000, 0x41, AccessWidth::Byte).with_id(3);
        let resp = SimMessage::response_to(&req, Ok(0x1234));
        assert_eq!(resp.result(), 0);
        assert_eq!(resp.id, 3);
    }

    #[test]
    fn test_failed_response_is_negative() {
        let req = SimMessage::reset(uart(), ResetAction::Assert).with_id(9);
        let resp = SimMessage::response_to(&req, Err(AxError::NotFound));
        assert!(resp.error() < 0);
        assert!(!resp.is_ok());
        assert_eq!(resp.id, 9);
    }

    #[test]
    fn test_access_width() {
        assert_eq!(AccessWidth::from_size(2), Some(AccessWidth::Word));
        assert_eq!(AccessWidth::from_size(3), None);
        assert_eq!(AccessWidth::Byte.mask(), 0xff);
        assert_eq!(AccessWidth::Qword.size(), 8);
    }
}
