//! x86-64 instruction decoding and lifting.
//!
//! [`tables`] holds the static per-opcode metadata (one-byte, two-byte and
//! ModRM-extension maps), [`decoder`] turns raw bytes into a
//! [`decoder::DecodedInst`] with an exact length, and [`dispatch`] lifts
//! decoded instructions into IR.

pub mod decoder;
pub mod dispatch;
pub mod tables;
