//! Detector for firmware speaking the Improv serial protocol

use std::sync::LazyLock;

use log::debug;
use regex::bytes::Regex;

use super::{wait_for, Confidence, DetectionResult, Detector};
use crate::{
    config::ProbeConfig,
    connection::DetectorContext,
    error::Error,
    improv::{self, ImprovPacket, PacketType, RpcCommand, Scan, IMPROV_BANNER},
};

pub const IMPROV_DETECTOR_ID: &str = "improv-serial";
pub const IMPROV_DETECTOR_NAME: &str = "Improv Serial";
pub const IMPROV_DETECTOR_PRIORITY: i32 = 850;

/// Sent when no packet came back, some firmwares answer with a banner
const BANNER_NUDGE: &[u8] = b"\r\n";

static BANNER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)IMPROV").expect("banner pattern is valid"));

/// Build the Improv detector with the given probe timings
pub fn detector(config: ProbeConfig) -> Detector {
    Detector::new(
        IMPROV_DETECTOR_ID,
        IMPROV_DETECTOR_NAME,
        IMPROV_DETECTOR_PRIORITY,
    )
    .with_passive(move |ctx| passive(ctx, &config))
    .with_active(move |ctx| active(ctx, &config))
}

fn result(confidence: Confidence) -> DetectionResult {
    DetectionResult::new(IMPROV_DETECTOR_ID, IMPROV_DETECTOR_NAME, confidence)
}

/// Look for Improv traffic the device sent on its own
pub fn passive(ctx: &dyn DetectorContext, config: &ProbeConfig) -> Option<DetectionResult> {
    match improv::find(ctx.snapshot(config.snapshot_bytes)) {
        Scan::Packet(packet) => {
            let confidence = if packet.has_lf_terminator {
                Confidence::High
            } else {
                Confidence::Med
            };

            Some(result(confidence).with_details(improv::details(&packet)))
        }
        // Some firmwares print "IMPROV" in a human readable banner
        Scan::Maybe => Some(result(Confidence::Low)),
        Scan::Nothing if ctx.includes_ascii(IMPROV_BANNER) => Some(result(Confidence::Low)),
        Scan::Nothing => None,
    }
}

/// Ask the device for its current state and wait for a reply.
///
/// Falls back to nudging the device with a line terminator and waiting for
/// an `IMPROV` banner.
pub fn active(
    ctx: &mut dyn DetectorContext,
    config: &ProbeConfig,
) -> Result<Option<DetectionResult>, Error> {
    ctx.clear();
    ctx.write(&improv::rpc_command(RpcCommand::RequestCurrentState, &[])?)?;

    if let Some(packet) = wait_for_packet(ctx, config)? {
        debug!("Improv device answered with {:?}", packet);
        return Ok(Some(
            result(Confidence::High).with_details(improv::details(&packet)),
        ));
    }

    // Drop the echo of the probe so it can't be mistaken for a banner
    ctx.clear();
    ctx.write(BANNER_NUDGE)?;

    let snapshot_bytes = config.snapshot_bytes;
    let banner = wait_for(
        ctx,
        config.banner_timeout(),
        config.poll_interval(),
        |ctx| ctx.match_regex(&BANNER, snapshot_bytes),
    )?;

    Ok(banner.map(|_| result(Confidence::Med)))
}

/// Wait for a valid packet which is not an echo of our own RPC command
fn wait_for_packet(
    ctx: &mut dyn DetectorContext,
    config: &ProbeConfig,
) -> Result<Option<ImprovPacket>, Error> {
    let snapshot_bytes = config.snapshot_bytes;

    wait_for(
        ctx,
        config.response_timeout(),
        config.poll_interval(),
        |ctx| {
            improv::packets(ctx.snapshot(snapshot_bytes))
                .find(|packet| packet.packet_type() != Some(PacketType::RpcCommand))
        },
    )
}

#[cfg(test)]
mod tests {
    use std::io;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::connection::{ManualClock, SerialContext};

    fn context_with(received: &[u8]) -> SerialContext<io::Cursor<Vec<u8>>, ManualClock> {
        let mut ctx = SerialContext::new(io::Cursor::new(Vec::new()), ManualClock::default());
        ctx.buffer_mut().push(received);
        ctx
    }

    #[test]
    fn passive_terminated_packet_is_high() {
        let mut bytes = improv::build(0x01, &[0x04]).unwrap();
        bytes.push(b'\n');
        let ctx = context_with(&bytes);

        let result = passive(&ctx, &ProbeConfig::default()).unwrap();

        assert_eq!(result.id, IMPROV_DETECTOR_ID);
        assert_eq!(result.confidence, Confidence::High);
        assert_eq!(result.details.unwrap()["state_name"], "Provisioned");
    }

    #[test]
    fn passive_unterminated_packet_is_med() {
        let ctx = context_with(&improv::build(0x02, &[0x03]).unwrap());

        let result = passive(&ctx, &ProbeConfig::default()).unwrap();

        assert_eq!(result.confidence, Confidence::Med);
        assert_eq!(result.details.unwrap()["error_name"], "Unable to connect");
    }

    #[test]
    fn passive_banner_is_low() {
        let ctx = context_with(b"Starting IMPROV service\r\n");

        let result = passive(&ctx, &ProbeConfig::default()).unwrap();

        assert_eq!(result.confidence, Confidence::Low);
        assert_eq!(result.details, None);
    }

    #[test]
    fn active_ignores_packets_received_before_the_request() {
        let mut stale = improv::build(0x01, &[0x04]).unwrap();
        stale.push(b'\n');
        let mut ctx = context_with(&stale);

        let result = active(&mut ctx, &ProbeConfig::default()).unwrap();

        assert_eq!(result, None);
        assert!(ctx.buffer().is_empty());
    }

    #[test]
    fn passive_ignores_unrelated_output() {
        let ctx = context_with(b"rst:0x1 (POWERON),boot:0x8 (SPI_FAST_FLASH_BOOT)\r\n");

        assert_eq!(passive(&ctx, &ProbeConfig::default()), None);
    }
}
