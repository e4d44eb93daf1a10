//! HTTP API handlers for cleantxt-server
//!
//! - `POST /api/transcribe` → SSE job stream
//! - `POST /api/upload` → stores a media file, returns its `fileId`
//! - `POST /api/translate` → translated subtitle document
//! - `GET /health`

pub mod health;
pub mod transcribe;
pub mod translate;
pub mod upload;

pub use health::health_routes;
pub use transcribe::transcribe_routes;
pub use translate::translate_routes;
pub use upload::upload_routes;
