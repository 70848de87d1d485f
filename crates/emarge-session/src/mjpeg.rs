//! Multipart JPEG stream framing.
//!
//! Each frame travels as one chunk:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! \r\n
//! <jpeg bytes>\r\n
//! \r\n
//! ```
//!
//! The sequence is infinite and pull-driven; it ends only when the
//! consumer disconnects or the session terminates on its own.

/// Boundary token, without the leading dashes.
pub const BOUNDARY: &str = "frame";

/// Content type the consumer mounts the stream under.
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n\r\n";

/// Wrap one encoded JPEG as a multipart chunk.
pub fn chunk(jpeg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PART_HEADER.len() + jpeg.len() + PART_TRAILER.len());
    out.extend_from_slice(PART_HEADER);
    out.extend_from_slice(jpeg);
    out.extend_from_slice(PART_TRAILER);
    out
}
