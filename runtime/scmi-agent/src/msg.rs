//! Header-only (MSG) framing
//!
//! Used with memory allocated fresh for one TEE invocation. The region holds
//! just `msg_header` followed by the payload; turn-taking comes from the
//! invocation's call and return, so there are no status bits. Sizes travel
//! out of band as invocation parameters.

use crate::header::{MessageHeader, HEADER_SIZE};
use crate::message::Message;
use crate::shmem::SharedMemory;
use crate::{Result, ScmiError};

/// Write header and payload at the start of `region`
///
/// # Returns
/// Number of bytes the platform must consume (header + payload)
///
/// # Errors
/// Returns `TooSmall` if the region cannot hold header plus input
pub fn encode_request_msg<M: SharedMemory + ?Sized>(region: &M, msg: &Message<'_>) -> Result<usize> {
    let needed = HEADER_SIZE + msg.input.len();
    if needed > region.size() {
        return Err(ScmiError::TooSmall {
            needed,
            available: region.size(),
        });
    }

    region.write(0, &MessageHeader::command(msg.protocol_id, msg.message_id).to_bytes());
    region.write(HEADER_SIZE, msg.input);

    Ok(needed)
}

/// Copy a reply of `size` bytes (header included) into `msg.output`
///
/// # Returns
/// Number of payload bytes copied
///
/// # Errors
/// - `Protocol` if `size` cannot hold a header or runs past the region
/// - `TooSmall` if the payload exceeds the output capacity
pub fn decode_response_msg<M: SharedMemory + ?Sized>(
    region: &M,
    size: usize,
    msg: &mut Message<'_>,
) -> Result<usize> {
    if size < HEADER_SIZE || size > region.size() {
        return Err(ScmiError::Protocol);
    }

    let reply_len = size - HEADER_SIZE;
    if reply_len > msg.output_capacity() {
        return Err(ScmiError::TooSmall {
            needed: reply_len,
            available: msg.output_capacity(),
        });
    }

    region.read(HEADER_SIZE, &mut msg.output[..reply_len]);
    msg.set_output_len(reply_len);

    Ok(reply_len)
}
