//! Cyclic process-data frames.
//!
//! This module defines:
//! - `CommandKeyword` - 32-byte ASCII command field (upper-cased, NUL-padded)
//! - `RxFrame` - output frame written to a slave (45 bytes on the wire)
//! - `DriveStatus` - the 22 drive status flags
//! - `TxFrame` - input frame read from a slave (8 bytes on the wire)
//!
//! All wire encodings are little-endian and packed without padding. The
//! orchestrator core never touches the byte layout itself; only the adapter
//! implementations marshal frames to and from the wire.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::error::OrchestratorError;

/// Wire size of an [`RxFrame`]: 32-byte command + i32 parameter +
/// i32 velocity + u16 acceleration + u16 deceleration + u8 execute.
pub const RX_FRAME_WIRE_BYTES: usize = 45;

/// Wire size of a [`TxFrame`]: i32 position + 3 status bytes + slot byte.
pub const TX_FRAME_WIRE_BYTES: usize = 8;

const_assert_eq!(RX_FRAME_WIRE_BYTES, 32 + 4 + 4 + 2 + 2 + 1);
const_assert_eq!(TX_FRAME_WIRE_BYTES, 4 + 3 + 1);

/// ASCII command keyword, NUL-padded to 32 bytes.
///
/// Keywords are always upper-case on the wire. Construction via
/// [`CommandKeyword::parse`] upper-cases and validates; the known drive
/// keywords are available as associated constants.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandKeyword {
    bytes: [u8; 32],
}

impl CommandKeyword {
    /// Maximum keyword length in bytes.
    pub const MAX_LEN: usize = 32;

    /// Absolute position move.
    pub const DPOS: Self = Self::from_static("DPOS");
    /// Continuous scan (jog).
    pub const SCAN: Self = Self::from_static("SCAN");
    /// Encoder index search.
    pub const INDX: Self = Self::from_static("INDX");
    /// Amplifier enable/disable.
    pub const ENBL: Self = Self::from_static("ENBL");
    /// Drive reset.
    pub const RSET: Self = Self::from_static("RSET");
    /// Halt scanning motion.
    pub const HALT: Self = Self::from_static("HALT");
    /// Emergency-style stop.
    pub const STOP: Self = Self::from_static("STOP");
    /// No operation (idle frame).
    pub const NOP: Self = Self::from_static("NOP");

    /// Build a keyword from a static string.
    ///
    /// Compile-time fails on an empty, over-long, or non-upper-case-ASCII
    /// input, so the associated constants are checked for free.
    pub const fn from_static(s: &str) -> Self {
        let src = s.as_bytes();
        assert!(!src.is_empty() && src.len() <= Self::MAX_LEN);
        let mut bytes = [0u8; 32];
        let mut i = 0;
        while i < src.len() {
            let b = src[i];
            assert!(b.is_ascii_uppercase() || b.is_ascii_digit());
            bytes[i] = b;
            i += 1;
        }
        Self { bytes }
    }

    /// Parse a caller-supplied keyword: non-empty, at most 32 ASCII
    /// characters, upper-cased on entry.
    pub fn parse(s: &str) -> Result<Self, OrchestratorError> {
        if s.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "command keyword must not be empty".into(),
            ));
        }
        if s.len() > Self::MAX_LEN {
            return Err(OrchestratorError::InvalidArgument(format!(
                "command keyword '{s}' exceeds {} bytes",
                Self::MAX_LEN
            )));
        }
        if !s.is_ascii() {
            return Err(OrchestratorError::InvalidArgument(format!(
                "command keyword '{s}' is not ASCII"
            )));
        }
        let mut bytes = [0u8; 32];
        for (dst, b) in bytes.iter_mut().zip(s.bytes()) {
            *dst = b.to_ascii_uppercase();
        }
        Ok(Self { bytes })
    }

    /// The keyword as a string slice (without NUL padding).
    pub fn as_str(&self) -> &str {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(Self::MAX_LEN);
        // Construction guarantees ASCII.
        std::str::from_utf8(&self.bytes[..end]).unwrap_or("")
    }

    /// The full NUL-padded 32-byte field as written to the wire.
    #[inline]
    pub const fn as_wire_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for CommandKeyword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommandKeyword({})", self.as_str())
    }
}

impl std::fmt::Display for CommandKeyword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output process-data frame for one slave.
///
/// Staged in place by the I/O loop every cycle and handed to the adapter,
/// which packs it into [`RX_FRAME_WIRE_BYTES`] little-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxFrame {
    /// Command keyword (upper-cased ASCII, NUL-padded to 32 bytes).
    pub command: CommandKeyword,
    /// Command parameter (target position, direction, or enable flag).
    pub parameter: i32,
    /// Commanded velocity.
    pub velocity: i32,
    /// Acceleration ramp.
    pub acceleration: u16,
    /// Deceleration ramp.
    pub deceleration: u16,
    /// Execute request bit (0 or 1).
    pub execute: u8,
}

impl RxFrame {
    /// Idle frame: `NOP` with all numeric fields zero and execute low.
    pub const fn nop() -> Self {
        Self {
            command: CommandKeyword::NOP,
            parameter: 0,
            velocity: 0,
            acceleration: 0,
            deceleration: 0,
            execute: 0,
        }
    }

    /// Reset this frame to the idle `NOP` state in place.
    pub fn clear(&mut self) {
        *self = Self::nop();
    }

    /// Pack into the 45-byte wire representation.
    pub fn encode(&self) -> [u8; RX_FRAME_WIRE_BYTES] {
        let mut out = [0u8; RX_FRAME_WIRE_BYTES];
        out[0..32].copy_from_slice(self.command.as_wire_bytes());
        out[32..36].copy_from_slice(&self.parameter.to_le_bytes());
        out[36..40].copy_from_slice(&self.velocity.to_le_bytes());
        out[40..42].copy_from_slice(&self.acceleration.to_le_bytes());
        out[42..44].copy_from_slice(&self.deceleration.to_le_bytes());
        out[44] = self.execute;
        out
    }
}

impl Default for RxFrame {
    fn default() -> Self {
        Self::nop()
    }
}

bitflags! {
    /// The 22 drive status flags reported in every TX frame.
    ///
    /// Bit positions match the wire packing order (LSB-first across the
    /// three status bytes).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DriveStatus: u32 {
        const AMPLIFIERS_ENABLED          = 1 << 0;
        const END_STOP                    = 1 << 1;
        const THERMAL_PROTECTION_1        = 1 << 2;
        const THERMAL_PROTECTION_2        = 1 << 3;
        const FORCE_ZERO                  = 1 << 4;
        const MOTOR_ON                    = 1 << 5;
        const CLOSED_LOOP                 = 1 << 6;
        const ENCODER_AT_INDEX            = 1 << 7;
        const ENCODER_VALID               = 1 << 8;
        const SEARCHING_INDEX             = 1 << 9;
        const POSITION_REACHED            = 1 << 10;
        const ERROR_COMPENSATION          = 1 << 11;
        const ENCODER_ERROR               = 1 << 12;
        const SCANNING                    = 1 << 13;
        const LEFT_END_STOP               = 1 << 14;
        const RIGHT_END_STOP              = 1 << 15;
        const ERROR_LIMIT                 = 1 << 16;
        const SEARCHING_OPTIMAL_FREQUENCY = 1 << 17;
        const SAFETY_TIMEOUT              = 1 << 18;
        const EXECUTE_ACK                 = 1 << 19;
        const EMERGENCY_STOP              = 1 << 20;
        const POSITION_FAIL               = 1 << 21;
    }
}

impl DriveStatus {
    /// Unpack from the three wire status bytes (LSB-first).
    #[inline]
    pub fn unpack(bytes: [u8; 3]) -> Self {
        let raw = u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16;
        Self::from_bits_truncate(raw)
    }

    /// Pack into the three wire status bytes (LSB-first).
    #[inline]
    pub fn pack(self) -> [u8; 3] {
        let raw = self.bits();
        [raw as u8, (raw >> 8) as u8, (raw >> 16) as u8]
    }
}

/// Input process-data frame from one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxFrame {
    /// Actual encoder position.
    pub actual_position: i32,
    /// Decoded status flag vector.
    pub status: DriveStatus,
    /// Drive slot number.
    pub slot: u8,
}

impl TxFrame {
    /// Pack into the 8-byte wire representation.
    pub fn encode(&self) -> [u8; TX_FRAME_WIRE_BYTES] {
        let mut out = [0u8; TX_FRAME_WIRE_BYTES];
        out[0..4].copy_from_slice(&self.actual_position.to_le_bytes());
        out[4..7].copy_from_slice(&self.status.pack());
        out[7] = self.slot;
        out
    }

    /// Unpack from the 8-byte wire representation.
    pub fn decode(bytes: &[u8; TX_FRAME_WIRE_BYTES]) -> Self {
        Self {
            actual_position: i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            status: DriveStatus::unpack([bytes[4], bytes[5], bytes[6]]),
            slot: bytes[7],
        }
    }

    /// XOR of this frame's status bits against a previous frame's.
    #[inline]
    pub fn changed_bits(&self, previous: &TxFrame) -> u32 {
        self.status.bits() ^ previous.status.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_parse_uppercases() {
        let kw = CommandKeyword::parse("dpos").unwrap();
        assert_eq!(kw, CommandKeyword::DPOS);
        assert_eq!(kw.as_str(), "DPOS");
    }

    #[test]
    fn keyword_parse_rejects_bad_input() {
        assert!(CommandKeyword::parse("").is_err());
        assert!(CommandKeyword::parse(&"X".repeat(33)).is_err());
        assert!(CommandKeyword::parse("DPÖS").is_err());
        // Exactly 32 characters is accepted.
        assert!(CommandKeyword::parse(&"X".repeat(32)).is_ok());
    }

    #[test]
    fn keyword_wire_field_is_nul_padded() {
        let kw = CommandKeyword::STOP;
        let wire = kw.as_wire_bytes();
        assert_eq!(&wire[0..4], b"STOP");
        assert!(wire[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rx_frame_encode_layout() {
        let frame = RxFrame {
            command: CommandKeyword::DPOS,
            parameter: 100_000,
            velocity: -30_000,
            acceleration: 1000,
            deceleration: 2000,
            execute: 1,
        };
        let wire = frame.encode();
        assert_eq!(&wire[0..4], b"DPOS");
        assert!(wire[4..32].iter().all(|&b| b == 0));
        assert_eq!(i32::from_le_bytes(wire[32..36].try_into().unwrap()), 100_000);
        assert_eq!(i32::from_le_bytes(wire[36..40].try_into().unwrap()), -30_000);
        assert_eq!(u16::from_le_bytes(wire[40..42].try_into().unwrap()), 1000);
        assert_eq!(u16::from_le_bytes(wire[42..44].try_into().unwrap()), 2000);
        assert_eq!(wire[44], 1);
    }

    #[test]
    fn rx_frame_default_is_idle_nop() {
        let frame = RxFrame::default();
        assert_eq!(frame.command, CommandKeyword::NOP);
        assert_eq!(frame.parameter, 0);
        assert_eq!(frame.velocity, 0);
        assert_eq!(frame.acceleration, 0);
        assert_eq!(frame.deceleration, 0);
        assert_eq!(frame.execute, 0);
    }

    #[test]
    fn status_pack_unpack_each_flag() {
        for bit in 0..22 {
            let flag = DriveStatus::from_bits(1 << bit).unwrap();
            let back = DriveStatus::unpack(flag.pack());
            assert_eq!(back, flag, "round-trip failed for bit {bit}");
        }
        let combo = DriveStatus::AMPLIFIERS_ENABLED
            | DriveStatus::MOTOR_ON
            | DriveStatus::EXECUTE_ACK
            | DriveStatus::POSITION_FAIL;
        assert_eq!(DriveStatus::unpack(combo.pack()), combo);
    }

    #[test]
    fn status_unpack_ignores_undefined_bits() {
        // Bits 22 and 23 of the third byte are not defined flags.
        let status = DriveStatus::unpack([0x01, 0x00, 0xFF]);
        assert!(status.contains(DriveStatus::AMPLIFIERS_ENABLED));
        assert_eq!(status.bits() & !DriveStatus::all().bits(), 0);
    }

    #[test]
    fn tx_frame_wire_round_trip() {
        let frame = TxFrame {
            actual_position: -123_456,
            status: DriveStatus::ENCODER_VALID | DriveStatus::POSITION_REACHED,
            slot: 7,
        };
        let wire = frame.encode();
        assert_eq!(i32::from_le_bytes(wire[0..4].try_into().unwrap()), -123_456);
        assert_eq!(wire[7], 7);
        assert_eq!(TxFrame::decode(&wire), frame);
    }

    #[test]
    fn changed_bits_mask() {
        let a = TxFrame {
            status: DriveStatus::MOTOR_ON | DriveStatus::POSITION_REACHED,
            ..TxFrame::default()
        };
        let b = TxFrame {
            status: DriveStatus::MOTOR_ON,
            ..TxFrame::default()
        };
        assert_eq!(a.changed_bits(&b), DriveStatus::POSITION_REACHED.bits());
        assert_eq!(a.changed_bits(&a), 0);
    }
}
