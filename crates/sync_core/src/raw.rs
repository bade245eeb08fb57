//! Raw records as delivered by the remote collaborator, before normalization.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use shared::domain::SyncCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawPeer {
    User { user_id: i64 },
    Chat { chat_id: i64 },
    Channel { channel_id: i64 },
}

impl RawPeer {
    pub fn id(&self) -> i64 {
        match *self {
            RawPeer::User { user_id } => user_id,
            RawPeer::Chat { chat_id } => chat_id,
            RawPeer::Channel { channel_id } => channel_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: i64,
    #[serde(default)]
    pub peer: Option<RawPeer>,
    #[serde(default)]
    pub from: Option<RawPeer>,
    #[serde(default)]
    pub text: String,
    /// Unix seconds.
    pub date: i64,
    #[serde(default)]
    pub media: Option<RawMedia>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawMedia {
    Photo {
        #[serde(default)]
        photo: Option<RawPhoto>,
    },
    Document {
        #[serde(default)]
        document: Option<RawDocument>,
    },
    WebPage,
    Contact,
    Geo,
    Poll,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPhoto {
    pub id: i64,
    #[serde(default)]
    pub sizes: Vec<RawPhotoSize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPhotoSize {
    pub w: i64,
    pub h: i64,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: i64,
    pub size: i64,
    #[serde(default)]
    pub attributes: Vec<DocumentAttribute>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentAttribute {
    Video,
    Audio {
        #[serde(default)]
        title: Option<String>,
    },
    ImageSize {
        w: i64,
        h: i64,
    },
    Animated,
    Sticker,
    Filename {
        file_name: String,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawUser {
    pub id: i64,
    #[serde(default)]
    pub access_hash: Option<i64>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub bot: bool,
    #[serde(default)]
    pub photo_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChat {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub photo_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChannel {
    pub id: i64,
    pub access_hash: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub photo_id: Option<i64>,
}

/// One dialog entry of the conversation listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawConversation {
    User(RawUser),
    Chat(RawChat),
    Channel(RawChannel),
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistoryBatch {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub users: Vec<RawUser>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiffBatch {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub users: Vec<RawUser>,
    pub state: SyncCursor,
}

/// Users accompanying a batch, indexed for sender lookups.
#[derive(Debug, Clone, Default)]
pub struct SenderDirectory {
    users: HashMap<i64, RawUser>,
}

impl SenderDirectory {
    pub fn from_users<'a>(users: impl IntoIterator<Item = &'a RawUser>) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|user| (user.id, user.clone()))
                .collect(),
        }
    }

    pub fn get(&self, user_id: i64) -> Option<&RawUser> {
        self.users.get(&user_id)
    }
}
