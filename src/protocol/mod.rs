// (c) 2026 The muxrpc authors

//! The muxrpc wire protocol
//!
//! # On-Wire Framing (version 1)
//!
//! A connection carries a sequence of frames. Every frame is a fixed 9-byte header
//! followed by the body. All integers are big-endian.
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 1 | [flags](Flags) |
//! | 1 | 4 | body length (`u32`) |
//! | 5 | 4 | stream id (`i32`) |
//!
//! The flag byte:
//!
//! | bit | mask | meaning |
//! |---|---|---|
//! | 3 | `0x08` | `Stream`: more frames belong to this call |
//! | 2 | `0x04` | `EndErr`: this frame ends the call; the body is `true` or an error object |
//! | 1 | `0x02` | body is JSON |
//! | 0 | `0x01` | body is a UTF-8 string |
//!
//! With neither of the two low bits set the body is opaque binary; setting both is an error.
//! The high nibble is reserved and must be zero.
//!
//! A header consisting of nine zero bytes is the *goodbye* frame; the sender is about to
//! hang up. Closing the connection on a frame boundary means the same thing.
//!
//! Any framing error is fatal to the connection, as the reader can no longer find the
//! next frame boundary.
//!
//! # Stream ids
//!
//! Each peer numbers the calls it opens with positive ids counting up from 1.
//! Frames are sent with the id as the sender sees it; the receiver negates every id it reads.
//! So a call we opened is positive in our stream table, and a call the peer opened is negative.
//!
//! # Calls
//!
//! The first frame of a call is a JSON [`CallHeader`]. The [`CallType`] it names fixes
//! what each side may do with the call from then on; see [`CallType::capabilities`].
//!
//! An error ending a call is sent as a JSON [`CallError`] in an `EndErr` frame.

mod call;
mod codec;
mod packet;

pub use call::{
    CallError, CallHeader, CallType, Capability, Method, Role, normalize_args,
};
pub use codec::{
    CodecError, Header, assemble, encode, read_packet, write_goodbye, write_packet,
};
pub use packet::{Body, Encoding, Flags, Packet};
