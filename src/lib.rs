//! Identify what a serial-attached device is running.
//!
//! [detector] runs passive and active probes over a [DetectorContext] and
//! ranks what they find; [improv] is the Improv serial packet codec used by
//! the bundled Improv detector. [ota] works out which app slot an ESP-IDF
//! device boots from a dump of its `otadata` partition.

pub mod config;
pub mod connection;
pub mod detector;
pub mod error;
pub mod improv;
pub mod ota;

pub use config::Config;
pub use connection::{DetectorContext, SerialContext};
pub use detector::{identify, identify_all, Confidence, DetectionResult, Detector};
pub use error::Error;
pub use ota::{detect_active_slot, OtaSelection};

/// The detectors shipped with this crate, configured with `config`
pub fn default_detectors(config: &Config) -> Vec<Detector> {
    vec![detector::improv::detector(config.probe)]
}
