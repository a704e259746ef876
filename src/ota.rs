//! Active OTA slot detection
//!
//! ESP-IDF keeps two copies of an [OtaSelectEntry] in the `otadata`
//! partition, one at the start of each flash sector. The bootloader boots the
//! app slot selected by the valid entry with the highest sequence number.
//!
//! See <https://docs.espressif.com/projects/esp-idf/en/latest/esp32/api-reference/system/ota.html#ota-data-partition>

use std::mem::size_of;

use bytemuck::{Pod, Zeroable, pod_read_unaligned};
use crc::{Crc, CRC_32_ISO_HDLC};
use esp_idf_part::{DataType, Partition, PartitionTable, SubType, Type};
use log::debug;
use serde::Serialize;
use strum::{Display, FromRepr};

use crate::error::Error;

/// Size of one `otadata` sector
pub const OTA_SELECT_SECTOR_SIZE: usize = 0x1000;
/// Size of the selection record at the start of each sector
pub const OTA_SELECT_ENTRY_SIZE: usize = size_of::<OtaSelectEntry>();

/// Number of selection records kept by the bootloader
const OTA_SELECT_ENTRY_COUNT: usize = 2;
/// Subtype of `ota_0`; `ota_15` is `0x1f`
const OTA_APP_SUBTYPE_BASE: u8 = 0x10;
const MAX_OTA_APP_SLOTS: u8 = 16;

/// Sequence numbers marking a record as never written
const ERASED_SEQUENCES: [u32; 2] = [u32::MAX, 0];
/// Label bytes that must still be erased for a record with a mismatching CRC
/// to be accepted anyway
const PLAUSIBLE_ERASED_LABEL_BYTES: usize = 16;

const SUMMARY_UNKNOWN: &str = "Active slot unknown.";
const SUMMARY_NONE_VALID: &str = "No valid OTA selection found";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// OTA selection record, little endian
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
#[doc(alias = "esp_ota_select_entry_t")]
struct OtaSelectEntry {
    ota_seq: u32,
    seq_label: [u8; 20],
    ota_state: u32,
    /// CRC32 of `ota_seq` only
    crc: u32,
}

/// State of an OTA app image, as tracked by the bootloader
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u32)]
#[doc(alias = "esp_ota_img_states_t")]
pub enum OtaImageState {
    #[strum(serialize = "new")]
    New = 0x0,
    #[strum(serialize = "pending verify")]
    PendingVerify = 0x1,
    #[strum(serialize = "valid")]
    Valid = 0x2,
    #[strum(serialize = "invalid")]
    Invalid = 0x3,
    #[strum(serialize = "aborted")]
    Aborted = 0x4,
    #[strum(serialize = "undefined")]
    Undefined = 0xFFFF_FFFF,
}

impl OtaImageState {
    /// Whether the bootloader refuses to boot an image in this state
    pub fn is_rejected(raw: u32) -> bool {
        matches!(
            Self::from_repr(raw),
            Some(OtaImageState::Invalid | OtaImageState::Aborted)
        )
    }
}

/// Which app slot a device will boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtaSelection {
    /// `ota_<n>` of the selected slot
    pub slot_id: Option<String>,
    pub summary: String,
    pub slot_index: Option<usize>,
    /// Sequence number of the winning record
    pub sequence: Option<u32>,
}

impl OtaSelection {
    fn unknown() -> Self {
        Self::without_slot(SUMMARY_UNKNOWN)
    }

    fn none_valid() -> Self {
        Self::without_slot(SUMMARY_NONE_VALID)
    }

    fn without_slot(summary: &str) -> Self {
        OtaSelection {
            slot_id: None,
            summary: summary.to_string(),
            slot_index: None,
            sequence: None,
        }
    }

    fn active(slot_index: usize, sequence: u32) -> Self {
        let slot_id = format!("ota_{slot_index}");

        OtaSelection {
            summary: format!("Active slot: {slot_id} (sequence {sequence})"),
            slot_id: Some(slot_id),
            slot_index: Some(slot_index),
            sequence: Some(sequence),
        }
    }

    /// The app partition backing the selected slot
    pub fn partition<'a>(&self, table: &'a PartitionTable) -> Option<&'a Partition> {
        let slot = u8::try_from(self.slot_index?).ok()?;

        table
            .partitions()
            .iter()
            .find(|partition| ota_slot_of(partition) == Some(slot))
    }
}

/// A record which passed validation
#[derive(Debug, Clone, Copy)]
struct Candidate {
    sequence: u32,
    slot_index: usize,
}

/// CRC the bootloader stores alongside a sequence number
pub fn sequence_crc(sequence: u32) -> u32 {
    CRC32.checksum(&sequence.to_le_bytes())
}

/// Work out the active slot from the raw contents of the `otadata`
/// partition.
///
/// `ota_count` is the number of OTA app partitions and `sector_size` the
/// distance between the two selection records. Degenerate input is reported
/// through the summary rather than as an error.
pub fn detect_active_slot(otadata: &[u8], ota_count: usize, sector_size: usize) -> OtaSelection {
    if otadata.is_empty() || ota_count == 0 || sector_size == 0 {
        return OtaSelection::unknown();
    }

    let entry_count = OTA_SELECT_ENTRY_COUNT.min(otadata.len() / sector_size);
    if entry_count == 0 {
        return OtaSelection::unknown();
    }

    let mut winner: Option<Candidate> = None;
    for index in 0..entry_count {
        let base = index * sector_size;
        let Some(raw) = otadata.get(base..base + OTA_SELECT_ENTRY_SIZE) else {
            continue;
        };

        let Some(candidate) = validate(pod_read_unaligned(raw), ota_count, index) else {
            continue;
        };

        if winner.map_or(true, |best| candidate.sequence > best.sequence) {
            winner = Some(candidate);
        }
    }

    match winner {
        Some(Candidate {
            sequence,
            slot_index,
        }) => OtaSelection::active(slot_index, sequence),
        None => OtaSelection::none_valid(),
    }
}

/// Count the OTA slots in `table` and detect the active one
pub fn detect_active_slot_in_table(
    otadata: &[u8],
    table: &PartitionTable,
    sector_size: usize,
) -> OtaSelection {
    detect_active_slot(otadata, ota_app_count(table), sector_size)
}

fn validate(entry: OtaSelectEntry, ota_count: usize, index: usize) -> Option<Candidate> {
    let sequence = u32::from_le(entry.ota_seq);
    let state = u32::from_le(entry.ota_state);
    let crc = u32::from_le(entry.crc);

    if ERASED_SEQUENCES.contains(&sequence) {
        debug!("OTA record {index} is erased");
        return None;
    }

    // Firmware CRC conventions vary, so a mismatch only rejects records
    // which don't look like a freshly written entry either
    if crc != sequence_crc(sequence) {
        let erased = entry.seq_label.iter().filter(|&&b| b == 0xFF).count();
        if erased < PLAUSIBLE_ERASED_LABEL_BYTES {
            debug!("OTA record {index} has a bad CRC ({crc:#010x}), rejecting");
            return None;
        }
        debug!("OTA record {index} has a bad CRC ({crc:#010x}) but an erased label");
    }

    if OtaImageState::is_rejected(state) {
        debug!("OTA record {index} is in state {state:#x}, skipping");
        return None;
    }

    let slot_index = usize::try_from(sequence.checked_sub(1)?).ok()? % ota_count;

    Some(Candidate {
        sequence,
        slot_index,
    })
}

/// Slot number of an `ota_<n>` app partition
fn ota_slot_of(partition: &Partition) -> Option<u8> {
    match partition.subtype() {
        SubType::App(app) => (app as u8)
            .checked_sub(OTA_APP_SUBTYPE_BASE)
            .filter(|slot| *slot < MAX_OTA_APP_SLOTS),
        _ => None,
    }
}

/// Parse a partition table from its CSV or binary form
pub fn parse_partition_table(data: Vec<u8>) -> Result<PartitionTable, Error> {
    Ok(PartitionTable::try_from(data)?)
}

/// Number of `ota_<n>` app partitions in `table`
pub fn ota_app_count(table: &PartitionTable) -> usize {
    table
        .partitions()
        .iter()
        .filter(|partition| ota_slot_of(partition).is_some())
        .count()
}

/// The `otadata` partition, which holds the selection records
pub fn otadata_partition(table: &PartitionTable) -> Option<&Partition> {
    table.partitions().iter().find(|partition| {
        matches!(partition.ty(), Type::Data)
            && matches!(partition.subtype(), SubType::Data(DataType::Ota))
    })
}
