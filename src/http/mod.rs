//! HTTP payload helpers shared by the client layer.

pub mod decode;
pub mod multipart;

pub use decode::decode_body;
pub use multipart::{Form, Part};
