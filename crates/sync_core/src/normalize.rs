//! Conversion of raw remote records into canonical storage records.
//!
//! Normalization never fails for a single message: anything that cannot be
//! classified degrades to a plain text record with whatever fields are known.

use chrono::{DateTime, Utc};

use shared::domain::{ConversationId, ConversationKind, MessageKind, RemoteMessageId, UserId};
use storage::{ConversationRecord, MessageRecord, UserRecord};

use crate::{
    error::SyncError,
    raw::{
        DocumentAttribute, RawConversation, RawDocument, RawMedia, RawMessage, RawPeer, RawPhoto,
        RawUser, SenderDirectory,
    },
};

const MEDIA_NAME_GLYPH: &str = "📁";
const WEBPAGE_PLACEHOLDER: &str = "[Webpage]";

#[derive(Debug, Clone, PartialEq)]
struct Classified {
    kind: MessageKind,
    placeholder: Option<&'static str>,
    media_name: Option<String>,
    media_url: String,
}

impl Classified {
    fn of(kind: MessageKind) -> Self {
        Self {
            kind,
            placeholder: kind.placeholder(),
            media_name: None,
            media_url: String::new(),
        }
    }
}

pub fn normalize_message(
    raw: &RawMessage,
    senders: &SenderDirectory,
    user_id: UserId,
    conversation_id: ConversationId,
) -> MessageRecord {
    let classified = classify(raw.media.as_ref());

    let mut body = raw.text.clone();
    if body.is_empty() {
        if let Some(placeholder) = classified.placeholder {
            body = placeholder.to_string();
        }
    }
    if let Some(name) = classified.media_name.as_deref() {
        if !body.is_empty() {
            body = format!("{body}\n{MEDIA_NAME_GLYPH} {name}");
        }
    }

    let (sender_id, sender) = match raw.from {
        Some(RawPeer::User { user_id }) => (user_id, senders.get(user_id)),
        Some(other) => (other.id(), None),
        None => (0, None),
    };

    MessageRecord {
        user_id,
        conversation_id,
        remote_message_id: RemoteMessageId(raw.id),
        sender_id,
        sender_username: sender.map(|u| u.username.clone()).unwrap_or_default(),
        sender_display_name: sender.map(display_name).unwrap_or_default(),
        body,
        kind: classified.kind,
        media_url: classified.media_url,
        timestamp: DateTime::<Utc>::from_timestamp(raw.date, 0).unwrap_or_default(),
    }
}

/// Conversation a diff message belongs to, taken from its peer.
pub fn conversation_of(raw: &RawMessage) -> Result<ConversationId, SyncError> {
    raw.peer
        .map(|peer| ConversationId(peer.id()))
        .ok_or_else(|| SyncError::Malformed(format!("message {} carries no peer", raw.id)))
}

fn classify(media: Option<&RawMedia>) -> Classified {
    match media {
        None | Some(RawMedia::Unsupported) => Classified::of(MessageKind::Text),
        Some(RawMedia::Photo { photo }) => Classified {
            media_url: photo.as_ref().and_then(photo_reference).unwrap_or_default(),
            ..Classified::of(MessageKind::Photo)
        },
        Some(RawMedia::Document { document }) => match document {
            Some(document) => classify_document(document),
            None => Classified::of(MessageKind::Document),
        },
        Some(RawMedia::WebPage) => Classified {
            placeholder: Some(WEBPAGE_PLACEHOLDER),
            ..Classified::of(MessageKind::Text)
        },
        Some(RawMedia::Contact) => Classified::of(MessageKind::Contact),
        Some(RawMedia::Geo) => Classified::of(MessageKind::Location),
        Some(RawMedia::Poll) => Classified::of(MessageKind::Poll),
    }
}

fn classify_document(document: &RawDocument) -> Classified {
    let mut kind = None;
    let mut media_name = None;

    for attribute in &document.attributes {
        match attribute {
            DocumentAttribute::Video => kind = Some(MessageKind::Video),
            DocumentAttribute::Audio { title } => {
                kind = Some(MessageKind::Audio);
                if let Some(title) = title.as_deref().filter(|t| !t.is_empty()) {
                    media_name = Some(title.to_string());
                }
            }
            DocumentAttribute::ImageSize { .. } => {
                if kind.is_none() {
                    kind = Some(MessageKind::Image);
                }
            }
            DocumentAttribute::Animated => kind = Some(MessageKind::Gif),
            DocumentAttribute::Sticker => kind = Some(MessageKind::Sticker),
            DocumentAttribute::Filename { file_name } => {
                if media_name.is_none() && !file_name.is_empty() {
                    media_name = Some(file_name.clone());
                }
            }
            DocumentAttribute::Unsupported => {}
        }
    }

    Classified {
        media_name,
        media_url: format!("remote://document/{}_{}", document.id, document.size),
        ..Classified::of(kind.unwrap_or(MessageKind::Document))
    }
}

/// Reference to the largest variant by area; the first of equal-area variants wins.
fn photo_reference(photo: &RawPhoto) -> Option<String> {
    let mut best = None;
    let mut best_area = 0;
    for size in &photo.sizes {
        let area = size.w.saturating_mul(size.h);
        if area > best_area {
            best_area = area;
            best = Some(size);
        }
    }
    best.map(|size| format!("remote://photo/{}_{}", photo.id, size.size))
}

fn display_name(user: &RawUser) -> String {
    format!("{} {}", user.first_name, user.last_name)
        .trim()
        .to_string()
}

pub fn normalize_conversation(
    raw: &RawConversation,
    user_id: UserId,
) -> Option<ConversationRecord> {
    let (id, kind, title, username, avatar_url, access_hash) = match raw {
        RawConversation::User(user) => {
            let title = match display_name(user) {
                name if name.is_empty() => format!("User {}", user.id),
                name => name,
            };
            let kind = if user.bot {
                ConversationKind::Bot
            } else {
                ConversationKind::Individual
            };
            (
                user.id,
                kind,
                title,
                user.username.clone(),
                avatar_reference("avatar", user.photo_id),
                user.access_hash.map(|hash| hash.to_string()),
            )
        }
        RawConversation::Chat(chat) => (
            chat.id,
            ConversationKind::Group,
            fallback_title(&chat.title, "Chat", chat.id),
            String::new(),
            avatar_reference("chat_avatar", chat.photo_id),
            None,
        ),
        RawConversation::Channel(channel) => {
            let kind = if channel.broadcast {
                ConversationKind::Channel
            } else {
                ConversationKind::Supergroup
            };
            (
                channel.id,
                kind,
                fallback_title(&channel.title, "Channel", channel.id),
                channel.username.clone(),
                avatar_reference("chat_avatar", channel.photo_id),
                Some(channel.access_hash.to_string()),
            )
        }
        RawConversation::Unsupported => return None,
    };

    Some(ConversationRecord {
        id: ConversationId(id),
        user_id,
        kind: Some(kind),
        title,
        username,
        avatar_url,
        access_hash,
        last_message: String::new(),
        last_time: None,
    })
}

/// Profile record for the account owning a session.
pub fn normalize_user(raw: &RawUser) -> UserRecord {
    UserRecord {
        id: UserId(raw.id),
        first_name: raw.first_name.clone(),
        last_name: raw.last_name.clone(),
        username: raw.username.clone(),
        phone: raw.phone.clone(),
        is_active: true,
        last_sync_time: None,
    }
}

fn fallback_title(title: &str, label: &str, id: i64) -> String {
    if title.is_empty() {
        format!("{label} {id}")
    } else {
        title.to_string()
    }
}

fn avatar_reference(scheme_path: &str, photo_id: Option<i64>) -> String {
    photo_id
        .map(|id| format!("remote://{scheme_path}/{id}"))
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "tests/normalize_tests.rs"]
mod tests;
