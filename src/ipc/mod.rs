pub mod client;
pub mod protocol;
pub mod server;

use tokio_util::codec::LengthDelimitedCodec;

/// Frame codec shared by both ends: 4-byte big-endian length prefix,
/// frames over 16 MiB rejected.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(protocol::MAX_FRAME_LEN)
        .new_codec()
}
