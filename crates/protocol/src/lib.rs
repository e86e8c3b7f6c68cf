pub mod constants;
pub mod envelope;
pub mod frame;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use frame::{ChunkHeader, FrameError, encode_chunk_frame, parse_chunk_frame};
pub use types::{SessionStatus, UploadMetadata, UploadProgress};
