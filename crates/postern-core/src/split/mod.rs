//! Oversized message splitting and reassembly
//!
//! An envelope whose wire encoding exceeds `max_message_size` is sent as a
//! group of `part` envelopes. Each part travels and is acknowledged on its
//! own; the group is reported to the application under the original id.
//!
//! ```text
//! original (sha256 = O)
//!     |
//!     | serialize, slice into part_size chunks, base64
//!     v
//! part{O, 0/3}  part{O, 1/3}  part{O, 2/3}        (each has its own sha256)
//!     |             |             |
//!     v             v             v
//! acks per part --> tracker --> one "delivered O" / one "received O"
//! ```

mod reassembler;
mod splitter;

pub use reassembler::MessageReassembler;
pub use splitter::MessageSplitter;
