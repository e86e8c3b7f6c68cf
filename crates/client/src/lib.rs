//! Initiating side of a chunkdrop upload.
//!
//! [`Uploader`] prepares a file, opens or resumes its session, drives the
//! [`Orchestrator`] over the chunks the server is still missing and
//! finalizes the upload. The wire is abstracted behind [`UploadTransport`];
//! [`WsClient`] is the WebSocket implementation.

pub mod error;
pub mod mirror;
pub mod orchestrator;
mod pumps;
pub mod retry;
pub mod transport;
pub mod types;
pub mod uploader;
pub mod ws_client;

pub use error::{TransportError, UploadError};
pub use mirror::{LocalMirror, MirrorEntry};
pub use orchestrator::{ChunkAttempt, ChunkJob, Orchestrator, RunSummary};
pub use retry::RetryPolicy;
pub use transport::{TransportFuture, UploadTransport};
pub use types::{UploadConfig, UploadEvent, UploadOutcome, UploadRequest};
pub use uploader::Uploader;
pub use ws_client::WsClient;
