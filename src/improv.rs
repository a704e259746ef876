//! Improv serial packet codec
//!
//! Packets are framed as `"IMPROV"`, the protocol version, a type byte, a
//! length byte, the payload and a checksum byte (the sum of everything before
//! it, modulo 256). Devices usually terminate each packet with a line feed.
//!
//! See <https://www.improv-wifi.com/serial/>

use std::{collections::BTreeMap, io::Write};

use strum::{Display, FromRepr};

use self::encoder::ChecksumWriter;
use crate::{connection::contains, error::Error};

/// ASCII form of the magic, also printed in some firmware banners
pub const IMPROV_BANNER: &str = "IMPROV";
/// Magic bytes opening every packet
pub const IMPROV_MAGIC: &[u8; 6] = b"IMPROV";
/// Protocol version understood by this codec
pub const IMPROV_VERSION: u8 = 0x01;

/// Magic, version, type and length
const HEADER_LEN: usize = IMPROV_MAGIC.len() + 3;
const LINE_FEED: u8 = 0x0A;

/// Packet type codes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum PacketType {
    #[strum(serialize = "Current State")]
    CurrentState = 0x01,
    #[strum(serialize = "Error State")]
    ErrorState = 0x02,
    #[strum(serialize = "RPC Command")]
    RpcCommand = 0x03,
    #[strum(serialize = "RPC Result")]
    RpcResult = 0x04,
}

/// Commands carried by [PacketType::RpcCommand] packets
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RpcCommand {
    #[strum(serialize = "Send Wi-Fi settings")]
    WifiSettings = 0x01,
    #[strum(serialize = "Request current state")]
    RequestCurrentState = 0x02,
    #[strum(serialize = "Request device information")]
    RequestDeviceInfo = 0x03,
    #[strum(serialize = "Request scanned Wi-Fi networks")]
    RequestScannedNetworks = 0x04,
}

/// Provisioning states reported in [PacketType::CurrentState] packets
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum ImprovState {
    #[strum(serialize = "Ready (Authorized)")]
    Authorized = 0x02,
    #[strum(serialize = "Provisioning")]
    Provisioning = 0x03,
    #[strum(serialize = "Provisioned")]
    Provisioned = 0x04,
}

/// Error codes reported in [PacketType::ErrorState] packets
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum ImprovError {
    #[strum(serialize = "No error")]
    NoError = 0x00,
    #[strum(serialize = "Invalid RPC packet")]
    InvalidRpcPacket = 0x01,
    #[strum(serialize = "Unknown RPC command")]
    UnknownRpcCommand = 0x02,
    #[strum(serialize = "Unable to connect")]
    UnableToConnect = 0x03,
    #[strum(serialize = "Bad Hostname")]
    BadHostname = 0x05,
    #[strum(serialize = "Unknown Error")]
    Unknown = 0xFF,
}

/// A structurally valid packet found in a byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImprovPacket {
    /// Raw type code, see [PacketType]
    pub ty: u8,
    /// Length field; always equal to `data.len()`
    pub length: u8,
    pub data: Vec<u8>,
    /// Whether a line feed directly followed the checksum
    pub has_lf_terminator: bool,
}

impl ImprovPacket {
    /// The known packet type, if any
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_repr(self.ty)
    }
}

/// Outcome of searching a buffer for Improv traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// A complete packet with consistent length and checksum
    Packet(ImprovPacket),
    /// The ASCII magic is present but no valid packet could be decoded
    Maybe,
    Nothing,
}

/// Encode a packet, ready to be written to the transport verbatim
pub fn build(ty: u8, data: &[u8]) -> Result<Vec<u8>, Error> {
    let length = u8::try_from(data.len()).map_err(|_| Error::PayloadTooLarge(data.len()))?;

    let mut packet = Vec::with_capacity(HEADER_LEN + data.len() + 1);
    let mut writer = ChecksumWriter::new(&mut packet);
    writer.write_all(IMPROV_MAGIC)?;
    writer.write_all(&[IMPROV_VERSION, ty, length])?;
    writer.write_all(data)?;
    writer.finish()?;

    Ok(packet)
}

/// Encode an RPC command packet
///
/// The RPC payload is the command code, the length of `data`, then `data`.
pub fn rpc_command(command: RpcCommand, data: &[u8]) -> Result<Vec<u8>, Error> {
    let length = u8::try_from(data.len()).map_err(|_| Error::PayloadTooLarge(data.len()))?;

    let mut payload = Vec::with_capacity(data.len() + 2);
    payload.push(command as u8);
    payload.push(length);
    payload.extend_from_slice(data);

    build(PacketType::RpcCommand as u8, &payload)
}

/// Encode a "send Wi-Fi settings" RPC command
pub fn wifi_settings(ssid: &str, password: &str) -> Result<Vec<u8>, Error> {
    let mut data = Vec::with_capacity(ssid.len() + password.len() + 2);
    for field in [ssid, password] {
        let length =
            u8::try_from(field.len()).map_err(|_| Error::PayloadTooLarge(field.len()))?;
        data.push(length);
        data.extend_from_slice(field.as_bytes());
    }

    rpc_command(RpcCommand::WifiSettings, &data)
}

/// Look for Improv traffic in `buffer`.
///
/// Returns the first valid packet, or [Scan::Maybe] when only the ASCII magic
/// shows up. Never fails: garbage simply yields [Scan::Nothing].
pub fn find(buffer: &[u8]) -> Scan {
    match packets(buffer).next() {
        Some(packet) => Scan::Packet(packet),
        None if contains(buffer, IMPROV_MAGIC) => Scan::Maybe,
        None => Scan::Nothing,
    }
}

/// Iterate over every valid packet in `buffer`, in order
pub fn packets(buffer: &[u8]) -> Packets<'_> {
    Packets { buffer, pos: 0 }
}

/// Iterator returned by [packets]
#[derive(Debug, Clone)]
pub struct Packets<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl Iterator for Packets<'_> {
    type Item = ImprovPacket;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos + IMPROV_MAGIC.len() <= self.buffer.len() {
            let start = self.pos;
            match decode_at(&self.buffer[start..]) {
                Some((packet, consumed)) => {
                    self.pos = start + consumed;
                    return Some(packet);
                }
                None => self.pos = start + 1,
            }
        }

        None
    }
}

/// Decode a packet starting exactly at the beginning of `bytes`, returning it
/// with the number of bytes it spans (including a trailing line feed).
fn decode_at(bytes: &[u8]) -> Option<(ImprovPacket, usize)> {
    if !bytes.starts_with(IMPROV_MAGIC) || bytes.len() < HEADER_LEN {
        return None;
    }

    let version = bytes[IMPROV_MAGIC.len()];
    let ty = bytes[IMPROV_MAGIC.len() + 1];
    let length = bytes[IMPROV_MAGIC.len() + 2];
    if version != IMPROV_VERSION {
        return None;
    }

    let checksum_at = HEADER_LEN + length as usize;
    let checksum = *bytes.get(checksum_at)?;
    if checksum != checksum_of(&bytes[..checksum_at]) {
        return None;
    }

    let has_lf_terminator = bytes.get(checksum_at + 1) == Some(&LINE_FEED);
    let consumed = checksum_at + 1 + usize::from(has_lf_terminator);

    let packet = ImprovPacket {
        ty,
        length,
        data: bytes[HEADER_LEN..checksum_at].to_vec(),
        has_lf_terminator,
    };

    Some((packet, consumed))
}

fn checksum_of(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Human readable description of state and error packets.
///
/// Other packet types, or packets whose length is not 1, have no details.
pub fn details(packet: &ImprovPacket) -> Option<BTreeMap<String, String>> {
    if packet.length != 1 {
        return None;
    }
    let code = *packet.data.first()?;

    let (key, name) = match packet.packet_type()? {
        PacketType::CurrentState => (
            "state",
            ImprovState::from_repr(code).map(|s| s.to_string()),
        ),
        PacketType::ErrorState => (
            "error",
            ImprovError::from_repr(code).map(|e| e.to_string()),
        ),
        _ => return None,
    };

    let mut details = BTreeMap::new();
    details.insert("packet".to_string(), packet.packet_type()?.to_string());
    details.insert(key.to_string(), format!("{code:#04x}"));
    details.insert(
        format!("{key}_name"),
        name.unwrap_or_else(|| "Unknown".to_string()),
    );

    Some(details)
}

/// Decoded payload of a [PacketType::RpcResult] packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResult {
    /// Raw code of the command being answered, see [RpcCommand]
    pub command: u8,
    pub values: Vec<String>,
}

impl RpcResult {
    /// Decode the length-prefixed strings of an RPC result.
    ///
    /// Returns `None` for other packet types or inconsistent lengths.
    pub fn parse(packet: &ImprovPacket) -> Option<Self> {
        if packet.packet_type()? != PacketType::RpcResult {
            return None;
        }

        let (&command, rest) = packet.data.split_first()?;
        let (&total, mut rest) = rest.split_first()?;
        if total as usize != rest.len() {
            return None;
        }

        let mut values = Vec::new();
        while let Some((&len, tail)) = rest.split_first() {
            let value = tail.get(..len as usize)?;
            values.push(std::str::from_utf8(value).ok()?.to_string());
            rest = &tail[len as usize..];
        }

        Some(RpcResult { command, values })
    }

    pub fn rpc_command(&self) -> Option<RpcCommand> {
        RpcCommand::from_repr(self.command)
    }
}

mod encoder {
    use std::io::Write;

    /// Writer appending an Improv checksum of everything written through it
    pub struct ChecksumWriter<'a, W: Write> {
        writer: &'a mut W,
        sum: u8,
    }

    impl<'a, W: Write> ChecksumWriter<'a, W> {
        pub fn new(writer: &'a mut W) -> Self {
            Self { writer, sum: 0 }
        }

        /// Write the checksum byte, returning it
        pub fn finish(self) -> std::io::Result<u8> {
            self.writer.write_all(&[self.sum])?;
            Ok(self.sum)
        }
    }

    impl<W: Write> Write for ChecksumWriter<'_, W> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let written = self.writer.write(buf)?;
            self.sum = buf[..written]
                .iter()
                .fold(self.sum, |sum, byte| sum.wrapping_add(*byte));

            Ok(written)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.writer.flush()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn terminated(mut packet: Vec<u8>) -> Vec<u8> {
        packet.push(LINE_FEED);
        packet
    }

    #[test]
    fn build_matches_reference_bytes() {
        let packet = rpc_command(RpcCommand::RequestCurrentState, &[]).unwrap();

        let mut expected = b"IMPROV".to_vec();
        expected.extend_from_slice(&[0x01, 0x03, 0x02, 0x02, 0x00]);
        expected.push(checksum_of(&expected));

        assert_eq!(packet, expected);
    }

    #[test]
    fn built_packets_parse_back() {
        for (ty, data) in [
            (0x01, vec![0x04]),
            (0x02, vec![0xff]),
            (0x04, vec![0x02, 0x00]),
            (0x7f, vec![]),
            (0x03, (0..=254).collect::<Vec<u8>>()),
        ] {
            let bytes = build(ty, &data).unwrap();

            match find(&bytes) {
                Scan::Packet(packet) => {
                    assert_eq!(packet.ty, ty);
                    assert_eq!(packet.data, data);
                    assert_eq!(packet.length as usize, data.len());
                    assert!(!packet.has_lf_terminator);
                }
                other => panic!("expected a packet, got {other:?}"),
            }
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert!(matches!(
            build(0x03, &[0u8; 256]),
            Err(Error::PayloadTooLarge(256))
        ));
    }

    #[test]
    fn detects_line_feed_terminator() {
        let bytes = terminated(build(0x01, &[0x02]).unwrap());

        let Scan::Packet(packet) = find(&bytes) else {
            panic!("no packet found");
        };
        assert!(packet.has_lf_terminator);
    }

    #[test]
    fn finds_packets_amid_log_noise() {
        let mut bytes = b"I (312) boot: Loaded app\r\nIMPROV but not a packet\r\n".to_vec();
        bytes.extend(terminated(build(0x01, &[0x03]).unwrap()));
        bytes.extend_from_slice(b"noise");
        bytes.extend(build(0x02, &[0x00]).unwrap());

        let found: Vec<_> = packets(&bytes).map(|p| (p.ty, p.data)).collect();

        assert_eq!(found, vec![(0x01, vec![0x03]), (0x02, vec![0x00])]);
    }

    #[test]
    fn malformed_input_never_yields_packets() {
        let valid = build(0x01, &[0x02]).unwrap();

        let mut bad_checksum = valid.clone();
        *bad_checksum.last_mut().unwrap() ^= 0xff;

        let mut bad_version = valid.clone();
        bad_version[6] = 0x02;

        let truncated = valid[..valid.len() - 1].to_vec();

        let mut overlong = valid.clone();
        overlong[8] = 0xff;

        for bytes in [bad_checksum, bad_version, truncated, overlong] {
            assert_eq!(find(&bytes), Scan::Maybe);
        }

        assert_eq!(find(b""), Scan::Nothing);
        assert_eq!(find(b"IMPRO"), Scan::Nothing);
        assert_eq!(find(&[0xff; 64]), Scan::Nothing);
        assert_eq!(find(b"improv"), Scan::Nothing);
    }

    #[test]
    fn current_state_details() {
        for (code, name) in [
            (0x02, "Ready (Authorized)"),
            (0x03, "Provisioning"),
            (0x04, "Provisioned"),
            (0x01, "Unknown"),
            (0x09, "Unknown"),
        ] {
            let packet = ImprovPacket {
                ty: 0x01,
                length: 1,
                data: vec![code],
                has_lf_terminator: true,
            };

            let details = details(&packet).unwrap();
            assert_eq!(details["packet"], "Current State");
            assert_eq!(details["state"], format!("0x{code:02x}"));
            assert_eq!(details["state_name"], name);
        }
    }

    #[test]
    fn error_state_details() {
        for (code, name) in [
            (0x00, "No error"),
            (0x01, "Invalid RPC packet"),
            (0x02, "Unknown RPC command"),
            (0x03, "Unable to connect"),
            (0x05, "Bad Hostname"),
            (0xff, "Unknown Error"),
            (0x04, "Unknown"),
        ] {
            let packet = ImprovPacket {
                ty: 0x02,
                length: 1,
                data: vec![code],
                has_lf_terminator: false,
            };

            let details = details(&packet).unwrap();
            assert_eq!(details["packet"], "Error State");
            assert_eq!(details["error_name"], name);
        }
    }

    #[test]
    fn other_packets_have_no_details() {
        let rpc = ImprovPacket {
            ty: 0x04,
            length: 1,
            data: vec![0x02],
            has_lf_terminator: true,
        };
        let long_state = ImprovPacket {
            ty: 0x01,
            length: 2,
            data: vec![0x02, 0x00],
            has_lf_terminator: true,
        };
        let unknown = ImprovPacket {
            ty: 0x42,
            length: 1,
            data: vec![0x02],
            has_lf_terminator: true,
        };

        assert_eq!(details(&rpc), None);
        assert_eq!(details(&long_state), None);
        assert_eq!(details(&unknown), None);
    }

    #[test]
    fn parses_rpc_results() {
        let mut data = vec![RpcCommand::RequestDeviceInfo as u8, 0];
        for value in ["ESPHome", "2024.6.0", "ESP32-S3", "living-room"] {
            data.push(value.len() as u8);
            data.extend_from_slice(value.as_bytes());
        }
        data[1] = (data.len() - 2) as u8;

        let Scan::Packet(packet) = find(&build(0x04, &data).unwrap()) else {
            panic!("no packet found");
        };
        let result = RpcResult::parse(&packet).unwrap();

        assert_eq!(result.rpc_command(), Some(RpcCommand::RequestDeviceInfo));
        assert_eq!(
            result.values,
            vec!["ESPHome", "2024.6.0", "ESP32-S3", "living-room"]
        );
    }

    #[test]
    fn rejects_inconsistent_rpc_results() {
        let packet = ImprovPacket {
            ty: 0x04,
            length: 5,
            data: vec![0x03, 0x03, 0x05, b'a', b'b'],
            has_lf_terminator: true,
        };

        assert_eq!(RpcResult::parse(&packet), None);
    }

    #[test]
    fn wifi_settings_payload() {
        let Scan::Packet(packet) = find(&wifi_settings("home", "hunter2").unwrap()) else {
            panic!("no packet found");
        };

        assert_eq!(packet.packet_type(), Some(PacketType::RpcCommand));
        assert_eq!(packet.data[0], RpcCommand::WifiSettings as u8);
        assert_eq!(packet.data[1] as usize, packet.data.len() - 2);
        assert_eq!(&packet.data[2..], b"\x04home\x07hunter2");
    }
}
