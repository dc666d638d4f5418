use crate::pci::PciResourceError;
use dm_platform::io::IoBusError;
use dm_platform::memory::MapError;
use dm_platform::time::TimerError;
use thiserror::Error;

/// Errors raised while creating or wiring up a device.
///
/// These are configuration-time failures: each one aborts the creation of a single device and
/// leaves every other device (and the resource maps) as they were.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{class}: invalid option `{option}`: {reason}")]
    ConfigParse {
        class: String,
        option: String,
        reason: String,
    },

    #[error("unknown device class `{0}`")]
    UnknownClass(String),

    #[error("only one `{class}` device is allowed per VM")]
    Duplicate { class: String },

    #[error("PCI resource allocation failed: {0}")]
    ResourceAllocation(#[from] PciResourceError),

    #[error("guest memory mapping failed: {0}")]
    Mapping(#[from] MapError),

    #[error("unsupported configuration: {0}")]
    Unsupported(&'static str),

    #[error("remote display could not be started: {0}")]
    RemoteDisplay(String),

    #[error("I/O port registration failed: {0}")]
    PortIo(#[from] IoBusError),

    #[error(transparent)]
    Timer(#[from] TimerError),
}

impl DeviceError {
    pub(crate) fn config(
        class: &str,
        option: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ConfigParse {
            class: class.to_string(),
            option: option.into(),
            reason: reason.into(),
        }
    }
}

/// A guest access that falls outside a register block or uses an unsupported width.
///
/// Never surfaced to the guest: the device logs it and turns the access into a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterAccessError {
    #[error("access out of range: offset={offset:#x} size={size} len={len:#x}")]
    OutOfRange { offset: u64, size: usize, len: usize },

    #[error("unsupported access size {0}")]
    UnsupportedSize(usize),
}
