// Destination side: Graph client, upload sessions, publish verification

pub mod client;
pub mod upload;
pub mod verify;

pub use client::{CredentialReport, GraphClient, GraphFailure};
pub use upload::{plan_chunks, ChunkSpan, UploadMode, UploadReceipt, UploadSession, UploadSessionManager};
pub use verify::{PublishVerifier, VerificationReport};
