//! Uploaded media and the attachments that reference it.
//!
//! Upload, presign and storage live elsewhere; this crate only carries the
//! shapes the cleanup jobs need.

pub mod media;

pub use media::{Attachment, Media, MediaStatus};
