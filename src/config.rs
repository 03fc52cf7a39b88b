use byteordered::Endianness;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Byte order of the produced data stream files.
///
/// The packet header, packet context, and every event field are
/// serialized in this byte order; it is also what the `trace` block's
/// `byte_order` attribute in the generated metadata advertises.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NativeByteOrder {
    #[serde(alias = "little")]
    #[serde(alias = "le")]
    LittleEndian,
    #[serde(alias = "big")]
    #[serde(alias = "be")]
    BigEndian,
}

impl Default for NativeByteOrder {
    fn default() -> Self {
        if cfg!(target_endian = "little") {
            NativeByteOrder::LittleEndian
        } else {
            NativeByteOrder::BigEndian
        }
    }
}

impl From<NativeByteOrder> for Endianness {
    fn from(value: NativeByteOrder) -> Self {
        match value {
            NativeByteOrder::LittleEndian => Endianness::Little,
            NativeByteOrder::BigEndian => Endianness::Big,
        }
    }
}

/// The preferred base (radix) to use when displaying integer field
/// values, carried into the generated TSDL `base` attribute.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum PreferredDisplayBase {
    #[serde(alias = "bin")]
    Binary,
    #[serde(alias = "oct")]
    Octal,
    #[default]
    #[serde(alias = "dec")]
    Decimal,
    #[serde(alias = "hex")]
    Hexadecimal,
}

/// The sink configuration object.
///
/// This can be constructed directly or deserialized from a parameter
/// file (YAML).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SinkConfig {
    /// Output directory path.
    pub path: PathBuf,
    /// Write the trace files directly under `path` instead of
    /// per-trace subdirectories. `path` must not already exist.
    #[serde(default)]
    pub assume_single_trace: bool,
    /// Drop discarded events messages entirely.
    #[serde(default)]
    pub ignore_discarded_events: bool,
    /// Drop discarded packets messages entirely.
    #[serde(default)]
    pub ignore_discarded_packets: bool,
    /// Suppress the "Created CTF trace" stdout line printed when a
    /// trace is finalized.
    #[serde(default)]
    pub quiet: bool,
    /// Byte order of the produced data stream files.
    #[serde(default)]
    pub byte_order: NativeByteOrder,
}

impl SinkConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            assume_single_trace: false,
            ignore_discarded_events: false,
            ignore_discarded_packets: false,
            quiet: false,
            byte_order: NativeByteOrder::default(),
        }
    }
}
