//! Device configuration lines: `[slot[:func],]class_name[,opt]*`.
//!
//! Only the outer shape is parsed here; each device class interprets its own option tokens.

use crate::pci::PciBdf;
use crate::DeviceError;

/// One parsed device configuration line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Explicit PCI location, if the line started with `slot[:func]`.
    pub slot: Option<PciBdf>,
    pub class: String,
    /// Everything after the class name, unparsed (may be empty).
    pub options: String,
}

impl DeviceSpec {
    pub fn new(class: impl Into<String>, options: impl Into<String>) -> Self {
        Self {
            slot: None,
            class: class.into(),
            options: options.into(),
        }
    }

    pub fn at(mut self, slot: PciBdf) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn parse(line: &str) -> Result<Self, DeviceError> {
        let line = line.trim();
        let (first, rest) = split_once_or_all(line, ',');

        let (slot, class, options) = if first.starts_with(|c: char| c.is_ascii_digit()) {
            let slot = parse_slot(first)?;
            let (class, options) = split_once_or_all(rest, ',');
            (Some(slot), class, options)
        } else {
            (None, first, rest)
        };

        if class.is_empty() {
            return Err(DeviceError::config("", line, "missing device class"));
        }

        Ok(Self {
            slot,
            class: class.to_string(),
            options: options.to_string(),
        })
    }
}

fn split_once_or_all(s: &str, sep: char) -> (&str, &str) {
    s.split_once(sep).unwrap_or((s, ""))
}

fn parse_slot(token: &str) -> Result<PciBdf, DeviceError> {
    let bad = |reason: &str| DeviceError::config("", token, reason);

    let (dev, func) = split_once_or_all(token, ':');
    let device: u8 = dev.parse().map_err(|_| bad("slot is not a number"))?;
    let function: u8 = if func.is_empty() {
        0
    } else {
        func.parse().map_err(|_| bad("function is not a number"))?
    };

    if device >= 32 {
        return Err(bad("slot must be below 32"));
    }
    if function >= 8 {
        return Err(bad("function must be below 8"));
    }
    Ok(PciBdf::new(0, device, function))
}

/// A single `key[=value]` option token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionToken<'a> {
    pub key: &'a str,
    pub value: Option<&'a str>,
}

/// Splits an option string on `,`, skipping empty tokens.
pub fn option_tokens(options: &str) -> impl Iterator<Item = OptionToken<'_>> {
    options
        .split(',')
        .filter(|tok| !tok.is_empty())
        .map(|tok| match tok.split_once('=') {
            Some((key, value)) => OptionToken {
                key,
                value: Some(value),
            },
            None => OptionToken {
                key: tok,
                value: None,
            },
        })
}
