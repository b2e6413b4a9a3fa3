//! # parley-store
//!
//! Persistence for Parley: rooms, memberships, messages and presence.
//!
//! The chat layer talks to the [`ChatStore`] trait; [`SqliteStore`] is the
//! bundled implementation. Uniqueness rules live in the schema so that
//! concurrent create-or-join calls converge on one row:
//!
//! - one `single` room per project and unordered identity pair
//! - one non-single room per (project, type, item)
//! - one membership per (room, member)

pub mod error;
pub mod models;
pub mod sqlite;
pub mod store;

pub use error::{Result, StoreError};
pub use models::{
    MarkRead, Message, MessageEdit, MessageList, NewMember, NewMessage, NewRoom, Page, Presence,
    PresenceStatus, Room, RoomCreated, RoomKind, RoomList, RoomLookup, RoomMember, RoomQuery,
    RoomSummary,
};
pub use sqlite::SqliteStore;
pub use store::{with_deadline, ChatStore};
