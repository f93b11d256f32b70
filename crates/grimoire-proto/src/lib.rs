//! # grimoire-proto
//!
//! Wire protocol types shared between the Annotation Collaboration Engine
//! and its clients:
//! - Opaque identifiers for documents, clients, and highlights
//! - Tag identity (workspace UUIDs with a legacy string fallback)
//! - The framed message sum types exchanged over the transport
//! - Ephemeral presence payloads
//! - Metadata attached to persisted document state

mod id;
mod message;
mod presence;
mod tag;

pub use id::{ClientId, DocId, HighlightId};
pub use message::{ClientMessage, ErrorCode, SaveMetadata, ServerMessage};
pub use presence::{PresenceMessage, PresenceState, PresenceUpdate};
pub use tag::Tag;
