use crate::opts::option_tokens;
use crate::DeviceError;

const CLASS: &str = "fbuf";

pub const COLS_MAX: u16 = 1920;
pub const ROWS_MAX: u16 = 1200;
pub const COLS_DEFAULT: u16 = 1024;
pub const ROWS_DEFAULT: u16 = 768;

/// Geometry substituted for an explicit `w=0` / `h=0`.
const COLS_ZERO: u16 = 1920;
const ROWS_ZERO: u16 = 1080;

/// Legacy VGA compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VgaMode {
    /// VGA registers and VGA rendering.
    On,
    /// VGA registers only; the linear framebuffer is always rendered.
    #[default]
    Io,
    Off,
}

impl VgaMode {
    pub fn enabled(self) -> bool {
        self != Self::Off
    }

    pub fn full(self) -> bool {
        self == Self::On
    }
}

/// Where the remote display server listens. No host means all interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfbEndpoint {
    pub host: Option<String>,
    pub port: u16,
}

impl RfbEndpoint {
    /// Parses `host:port`, `[host%zone]:port` or `port`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let (host, port) = match value.split_once(']') {
            Some((host, rest)) => {
                let host = host.strip_prefix('[').unwrap_or(host);
                let port = rest
                    .strip_prefix(':')
                    .ok_or_else(|| format!("expected `:` after `]` in `{value}`"))?;
                (Some(host), port)
            }
            None => match value.split_once(':') {
                Some((host, port)) => (Some(host), port),
                None => (None, value),
            },
        };

        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port `{port}`"))?;
        Ok(Self {
            host: host.filter(|h| !h.is_empty()).map(str::to_string),
            port,
        })
    }
}

/// Options accepted by the `fbuf` device class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FbufConfig {
    /// Hold guest execution until a remote display client connects.
    pub wait: bool,
    pub vga: VgaMode,
    pub rfb: Option<RfbEndpoint>,
    pub width: u16,
    pub height: u16,
    pub password: Option<String>,
}

impl Default for FbufConfig {
    fn default() -> Self {
        Self {
            wait: false,
            vga: VgaMode::default(),
            rfb: None,
            width: COLS_DEFAULT,
            height: ROWS_DEFAULT,
            password: None,
        }
    }
}

impl FbufConfig {
    /// Parses `{wait,}{vga=on|io|off,}{rfb|tcp=<endpoint>,}{w=<w>,}{h=<h>,}{password=<pw>}`.
    ///
    /// Any malformed token fails the whole string.
    pub fn parse(options: &str) -> Result<Self, DeviceError> {
        let mut cfg = Self::default();

        for tok in option_tokens(options) {
            let Some(value) = tok.value else {
                if tok.key == "wait" {
                    cfg.wait = true;
                    continue;
                }
                return Err(DeviceError::config(CLASS, tok.key, "expected `key=value`"));
            };
            tracing::debug!(key = tok.key, value, "fbuf option");

            let bad = |reason: String| {
                DeviceError::config(CLASS, format!("{}={value}", tok.key), reason)
            };

            match tok.key {
                "rfb" | "tcp" => cfg.rfb = Some(RfbEndpoint::parse(value).map_err(bad)?),
                "vga" => {
                    cfg.vga = match value {
                        "on" => VgaMode::On,
                        "io" => VgaMode::Io,
                        "off" => VgaMode::Off,
                        _ => return Err(bad("expected `on`, `io` or `off`".into())),
                    }
                }
                "w" => cfg.width = parse_dimension(value, COLS_MAX, COLS_ZERO).map_err(bad)?,
                "h" => cfg.height = parse_dimension(value, ROWS_MAX, ROWS_ZERO).map_err(bad)?,
                "password" => cfg.password = Some(value.to_string()),
                _ => return Err(bad("unknown option".into())),
            }
        }

        Ok(cfg)
    }
}

fn parse_dimension(value: &str, max: u16, zero: u16) -> Result<u16, String> {
    let v: u32 = value
        .parse()
        .map_err(|_| format!("`{value}` is not a number"))?;
    let v = u16::try_from(v).map_err(|_| format!("{v} does not fit in 16 bits"))?;
    match v {
        0 => Ok(zero),
        v if v > max => Err(format!("{v} exceeds the maximum of {max}")),
        v => Ok(v),
    }
}
