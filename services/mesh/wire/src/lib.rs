//! Envelope encoding, command variants, and length-prefix framing for mesh chat.
//!
//! An envelope is a flat JSON object whose keys are command names and whose
//! values are the command arguments. Each envelope travels as one frame
//! prefixed by its big-endian `u32` length.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------------------+
//! | u32 frame_len        | length of the JSON body                |
//! +----------------------+----------------------------------------+
//! | {"text": "hi", ...}  | command key -> argument                |
//! +----------------------+----------------------------------------+
//! ```
//!
//! ## Commands
//!
//! | key             | argument        |
//! |-----------------|-----------------|
//! | `conn`          | boolean         |
//! | `address`       | `[host, port]`  |
//! | `limit`         | integer         |
//! | `new_peer`      | `[host, port]`  |
//! | `nickname`      | string          |
//! | `text`          | string          |
//! | `leave`         | string          |
//! | `display_error` | integer         |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod command;
pub mod error;
pub mod frame;

// Re-export main types
pub use codec::{decode, encode, Envelope};
pub use command::{Command, CommandKind, PeerAddr};
pub use error::WireError;
pub use frame::{
    encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE, READ_CHUNK_SIZE,
};
