//! # agora-shared
//!
//! Types and pure logic shared by every Agora crate: identifiers, entity
//! models, boundary documents, the reaction reducer, timeline assembly and
//! timestamp labelling.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod reactions;
pub mod time;
pub mod timeline;
pub mod types;

pub use error::{AgoraError, AuthError, Locale};
pub use models::*;
pub use reactions::{ReactionChange, ReactionEntry, Reactions};
pub use types::*;
