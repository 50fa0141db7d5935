use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One logical bridge namespace inside `registered_bridges`.
///
/// Side A is always the platform identifier, side B the canonical space identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    GuildSpace,
    ChannelThread,
    MatrixSpace,
    RoomThread,
}

impl MappingKind {
    pub const ALL: [MappingKind; 4] = [
        MappingKind::GuildSpace,
        MappingKind::ChannelThread,
        MappingKind::MatrixSpace,
        MappingKind::RoomThread,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MappingKind::GuildSpace => "guild_space",
            MappingKind::ChannelThread => "channel_thread",
            MappingKind::MatrixSpace => "matrix_space",
            MappingKind::RoomThread => "room_thread",
        }
    }

    pub fn prefixes(self) -> (&'static str, &'static str) {
        match self {
            MappingKind::GuildSpace => ("discord_guild", "space_for_guild"),
            MappingKind::ChannelThread => ("discord_channel", "thread_for_channel"),
            MappingKind::MatrixSpace => ("matrix_space", "space_for_matrix"),
            MappingKind::RoomThread => ("matrix_room", "thread_for_room"),
        }
    }

    pub fn forward_key(self, key_a: &str) -> String {
        format!("{}:{}", self.prefixes().0, key_a)
    }

    pub fn reverse_key(self, key_b: &str) -> String {
        format!("{}:{}", self.prefixes().1, key_b)
    }

    /// The namespace holding conversations nested under this group namespace.
    pub fn child_kind(self) -> Option<MappingKind> {
        match self {
            MappingKind::GuildSpace => Some(MappingKind::ChannelThread),
            MappingKind::MatrixSpace => Some(MappingKind::RoomThread),
            MappingKind::ChannelThread | MappingKind::RoomThread => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub kind: MappingKind,
    pub key_a: String,
    pub key_b: String,
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedOrigin {
    pub scope: String,
    pub message_id: String,
}

pub(crate) fn synced_key(scope: &str, message_id: &str) -> String {
    format!("{scope}:{message_id}")
}

pub(crate) fn mirror_key(mirror_id: &str) -> String {
    format!("mirror:{mirror_id}")
}
