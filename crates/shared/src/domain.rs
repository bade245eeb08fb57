use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(RemoteMessageId);
id_newtype!(SessionId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Individual,
    Bot,
    Group,
    Supergroup,
    Channel,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Individual => "individual",
            ConversationKind::Bot => "bot",
            ConversationKind::Group => "group",
            ConversationKind::Supergroup => "supergroup",
            ConversationKind::Channel => "channel",
        }
    }

    /// Parses a stored kind. Legacy rows may carry `user` for individual chats;
    /// anything unrecognised yields `None` so callers fall back to probing.
    pub fn parse_stored(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown kind '{0}'")]
pub struct UnknownKind(pub String);

impl FromStr for ConversationKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "individual" | "user" => Ok(ConversationKind::Individual),
            "bot" => Ok(ConversationKind::Bot),
            "group" | "chat" => Ok(ConversationKind::Group),
            "supergroup" => Ok(ConversationKind::Supergroup),
            "channel" => Ok(ConversationKind::Channel),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Photo,
    Video,
    Audio,
    Document,
    Image,
    Gif,
    Sticker,
    Contact,
    Location,
    Poll,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Photo => "photo",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Document => "document",
            MessageKind::Image => "image",
            MessageKind::Gif => "gif",
            MessageKind::Sticker => "sticker",
            MessageKind::Contact => "contact",
            MessageKind::Location => "location",
            MessageKind::Poll => "poll",
        }
    }

    /// Body used when a message carries media but no caption.
    pub fn placeholder(self) -> Option<&'static str> {
        match self {
            MessageKind::Text => None,
            MessageKind::Photo => Some("[Photo]"),
            MessageKind::Video => Some("[Video]"),
            MessageKind::Audio => Some("[Audio]"),
            MessageKind::Document => Some("[Document]"),
            MessageKind::Image => Some("[Image]"),
            MessageKind::Gif => Some("[GIF]"),
            MessageKind::Sticker => Some("[Sticker]"),
            MessageKind::Contact => Some("[Contact]"),
            MessageKind::Location => Some("[Location]"),
            MessageKind::Poll => Some("[Poll]"),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "text" => MessageKind::Text,
            "photo" => MessageKind::Photo,
            "video" => MessageKind::Video,
            "audio" => MessageKind::Audio,
            "document" => MessageKind::Document,
            "image" => MessageKind::Image,
            "gif" => MessageKind::Gif,
            "sticker" => MessageKind::Sticker,
            "contact" => MessageKind::Contact,
            "location" => MessageKind::Location,
            "poll" => MessageKind::Poll,
            other => return Err(UnknownKind(other.to_string())),
        })
    }
}

/// Incremental-sync checkpoint: everything up to this point has been ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCursor {
    pub pts: i64,
    pub qts: i64,
    pub date: i64,
    pub seq: i64,
}

impl SyncCursor {
    pub const ZERO: SyncCursor = SyncCursor {
        pts: 0,
        qts: 0,
        date: 0,
        seq: 0,
    };

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// A cursor carrying neither pts nor date cannot be trusted as a checkpoint.
    pub fn is_degenerate(&self) -> bool {
        self.pts == 0 && self.date == 0
    }

    /// Folds a candidate cursor from a diff response into this one.
    ///
    /// Returns `None` for a degenerate candidate. Fields never move backwards.
    pub fn advance(&self, candidate: &SyncCursor) -> Option<SyncCursor> {
        if candidate.is_degenerate() {
            return None;
        }
        Some(SyncCursor {
            pts: self.pts.max(candidate.pts),
            qts: self.qts.max(candidate.qts),
            date: self.date.max(candidate.date),
            seq: self.seq.max(candidate.seq),
        })
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pts={} qts={} date={} seq={}",
            self.pts, self.qts, self.date, self.seq
        )
    }
}
