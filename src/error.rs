//! Library errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

/// All possible errors returned by espprobe
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("IO error while talking to the device: {0}")]
    #[diagnostic(
        code(espprobe::io),
        help("Make sure the transport is still open and the device is connected")
    )]
    Io(#[from] io::Error),

    #[error("Improv payload of {0} bytes does not fit in a single packet")]
    #[diagnostic(
        code(espprobe::improv::payload_too_large),
        help("Improv packets carry at most 255 bytes of data")
    )]
    PayloadTooLarge(usize),

    #[error("Failed to parse configuration")]
    #[diagnostic(code(espprobe::config))]
    Config(#[from] toml::de::Error),

    #[error("Invalid probe configuration: {0}")]
    #[diagnostic(
        code(espprobe::config::invalid_value),
        help("Poll intervals must be non-zero and the OTA sector must hold at least one 32 byte record")
    )]
    InvalidConfig(String),

    #[error("Failed to parse partition table")]
    #[diagnostic(code(espprobe::partition_table))]
    Partition(#[from] esp_idf_part::Error),

    #[error("Detector `{id}` failed")]
    #[diagnostic(code(espprobe::detector_failed))]
    DetectorFailed {
        id: String,
        #[source]
        source: Box<Error>,
    },
}

pub(crate) trait ResultExt {
    /// Mark the detector from which this error originates
    fn for_detector(self, id: &str) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_detector(self, id: &str) -> Self {
        match self {
            Err(err @ Error::DetectorFailed { .. }) => Err(err),
            Err(err) => Err(Error::DetectorFailed {
                id: id.to_string(),
                source: Box::new(err),
            }),
            res => res,
        }
    }
}
