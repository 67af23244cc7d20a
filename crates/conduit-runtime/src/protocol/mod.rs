//! Wire format types for provider-specific API protocols
//!
//! Each module contains pure serde structs matching the respective provider's
//! JSON API format. These types are only used for serialization/deserialization
//! inside the codecs and never leave the crate boundary.

pub mod anthropic;
pub mod google;
pub mod ollama;
pub mod openai;
