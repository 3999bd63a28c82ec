//! # agora-client
//!
//! Client core of the Agora team chat: the services a view layer drives.
//!
//! - [`backend`]: seams to the hosted document and presence stores, plus an
//!   in-memory implementation
//! - [`timeline`]: live channel timelines merged across topics
//! - [`reactions`], [`chat`]: write paths for reactions, channels, topics,
//!   messages and direct conversations
//! - [`presence`]: own presence announcements and a shared presence cache
//! - [`unread`]: persisted unread counters for direct conversations
//! - [`avatar`]: avatar upload with local fallback
//! - [`client`]: a facade tying these to [`state::AppState`] and the
//!   [`events`] channel

pub mod avatar;
pub mod backend;
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod presence;
pub mod reactions;
pub mod state;
pub mod subscription;
pub mod timeline;
pub mod unread;

use tracing_subscriber::{fmt, EnvFilter};

pub use client::AgoraClient;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use subscription::Subscription;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "agora_client=debug,agora_store=info,warn";

/// Install the global `tracing` subscriber.
///
/// Respects `RUST_LOG`; falls back to [`DEFAULT_LOG_FILTER`].  Calling it
/// twice is harmless: the second installation is ignored.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
