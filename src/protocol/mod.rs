//! Protocol Layer: wire integers, headers and framing
//!
//! Design principles:
//! - Fixed-size headers, integers kept in wire order
//! - Body bytes delivered by reference, never copied by the framer
//! - Arbitrary TCP fragmentation and packing are handled in one place

mod framer;
mod message;
mod wire_int;

pub use framer::{FramerState, MessageFramer, Outcome, Processor};
pub use message::{encode_common, encode_message, CommonHeader, MessageHeader, COMMON_HEADER_SIZE};
pub use wire_int::{
    needs_swap, BigEndian, DefaultOrder, LittleEndian, NInt16, NInt32, NInt64, NInt8, NUInt16,
    NUInt32, NUInt64, NUInt8, WireInt, WireOrder, WireRepr,
};
