//! Wire types for the Famly REST and GraphQL responses, and their conversion
//! into [`MediaItem`]s.
//!
//! Everything optional on the wire is optional here; an item that lacks a URL
//! or a usable timestamp is dropped with a warning instead of failing the page.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::media::{
    parse_timestamp, parse_timestamp_value, MediaItem, MediaKind, MediaOrigin, Resolution,
};

// ── REST: /api/v2/images/tagged ──────────────────────────────────────────

/// Tagged-images page. Older deployments answer with a bare array and no
/// total; both shapes are accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TaggedImagesBody {
    Paged(TaggedImagesPage),
    Bare(Vec<TaggedImage>),
}

impl TaggedImagesBody {
    pub fn into_parts(self) -> (Vec<TaggedImage>, Option<u64>) {
        match self {
            TaggedImagesBody::Paged(page) => (page.images, page.total_amount),
            TaggedImagesBody::Bare(images) => (images, None),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedImagesPage {
    #[serde(default)]
    pub images: Vec<TaggedImage>,
    /// Absent on some deployments; paging then falls back to short-page
    /// detection.
    #[serde(default)]
    pub total_amount: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SizedUrl {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaggedImage {
    pub image_id: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub device_timestamp: Option<Value>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "url_big")]
    pub url_big: Option<String>,
    #[serde(default)]
    pub big: Option<SizedUrl>,
    #[serde(default)]
    pub thumbnail: Option<SizedUrl>,
}

impl TaggedImage {
    /// `{prefix}/{width}x{height}/{key}`, with the expiry appended when the
    /// key doesn't already carry a query string.
    fn constructed_url(&self) -> Option<String> {
        let prefix = self.prefix.as_deref()?.trim_end_matches('/');
        let key = self.key.as_deref()?.trim_start_matches('/');
        let (w, h) = (self.width?, self.height?);
        if prefix.is_empty() || key.is_empty() {
            return None;
        }
        let mut url = format!("{}/{}x{}/{}", prefix, w, h, key);
        if let Some(expires) = self.expires.as_deref().filter(|e| !e.is_empty()) {
            if !key.contains('?') {
                url.push_str("?expires=");
                url.push_str(expires);
            }
        }
        Some(url)
    }

    /// Pick a download URL for the requested resolution, falling back to
    /// whatever the server did provide.
    pub fn download_url(&self, resolution: Resolution) -> Option<String> {
        let big = self.big.as_ref().map(|b| b.url.clone());
        let thumb = self.thumbnail.as_ref().map(|t| t.url.clone());
        let candidates = match resolution {
            Resolution::Full => [
                big,
                self.url_big.clone(),
                self.constructed_url(),
                self.url.clone(),
                thumb,
            ],
            Resolution::Thumbnail => [
                thumb,
                self.url.clone(),
                self.constructed_url(),
                self.url_big.clone(),
                big,
            ],
        };
        candidates.into_iter().flatten().find(|u| !u.is_empty())
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
            .as_deref()
            .and_then(parse_timestamp)
            .or_else(|| self.device_timestamp.as_ref().and_then(parse_timestamp_value))
    }

    pub fn into_media_item(
        self,
        resolution: Resolution,
        discovered_at: DateTime<Utc>,
    ) -> Option<MediaItem> {
        let Some(source_url) = self.download_url(resolution) else {
            tracing::warn!(
                image_id = %self.image_id,
                "Tagged image has no download URL, skipping"
            );
            return None;
        };
        let Some(captured_at) = self.captured_at() else {
            tracing::warn!(
                image_id = %self.image_id,
                "Tagged image has no usable timestamp, skipping"
            );
            return None;
        };
        Some(MediaItem {
            id: self.image_id,
            kind: MediaKind::Photo,
            source_url,
            width: self.width,
            height: self.height,
            captured_at,
            discovered_at,
            origin: MediaOrigin::TaggedImages,
            original_name: None,
        })
    }
}

// ── GraphQL: observations ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GraphQlResponse<T> {
    pub data: Option<T>,
    pub errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlError {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationsData {
    pub child_development: ChildDevelopment,
}

#[derive(Debug, Deserialize)]
pub struct ChildDevelopment {
    pub observations: ObservationsPage,
}

#[derive(Debug, Default, Deserialize)]
pub struct ObservationsPage {
    #[serde(default)]
    pub results: Option<Vec<Observation>>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observation {
    pub id: String,
    #[serde(default)]
    pub remark: Option<Remark>,
    #[serde(default)]
    pub images: Option<Vec<ObservationImage>>,
    #[serde(default)]
    pub files: Option<Vec<ObservationFile>>,
    #[serde(default)]
    pub videos: Option<Vec<ObservationVideo>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Remark {
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSecret {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expires: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservationImage {
    pub id: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub secret: Option<ImageSecret>,
}

impl ObservationImage {
    /// The plain `url` when present, otherwise rebuilt from the signed parts
    /// as `{prefix}/{key}/{w}x{h}/{path}?expires={expires}`.
    fn download_url(&self) -> Option<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.is_empty()) {
            return Some(url.to_string());
        }
        let secret = self.secret.as_ref()?;
        let prefix = secret.prefix.as_deref()?.trim_end_matches('/');
        let key = secret.key.as_deref()?.trim_matches('/');
        let path = secret.path.as_deref()?.trim_start_matches('/');
        let (w, h) = (self.width?, self.height?);
        let mut url = format!("{}/{}/{}x{}/{}", prefix, key, w, h, path);
        if let Some(expires) = secret.expires.as_deref().filter(|e| !e.is_empty()) {
            url.push_str("?expires=");
            url.push_str(expires);
        }
        Some(url)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservationFile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// A member of the videos union. Non-transcoded members decode with every
/// field missing and are skipped.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationVideo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl Observation {
    /// Flatten an observation's attachments into media items. All of them share
    /// the observation's date as their capture time.
    pub fn into_media_items(self, discovered_at: DateTime<Utc>) -> Vec<MediaItem> {
        let captured_at = self
            .remark
            .as_ref()
            .and_then(|r| r.date.as_deref())
            .and_then(parse_timestamp);
        let Some(captured_at) = captured_at else {
            let attachments = self.images.as_ref().map_or(0, Vec::len)
                + self.files.as_ref().map_or(0, Vec::len)
                + self.videos.as_ref().map_or(0, Vec::len);
            if attachments > 0 {
                tracing::warn!(
                    observation_id = %self.id,
                    "Observation has no usable date, skipping {} attachments",
                    attachments
                );
            }
            return Vec::new();
        };

        let item = |id: String, kind, source_url, width, height, original_name| MediaItem {
            id,
            kind,
            source_url,
            width,
            height,
            captured_at,
            discovered_at,
            origin: MediaOrigin::Observations,
            original_name,
        };

        let mut items = Vec::new();
        for image in self.images.unwrap_or_default() {
            match image.download_url() {
                Some(url) => items.push(item(
                    image.id.clone(),
                    MediaKind::Photo,
                    url,
                    image.width,
                    image.height,
                    None,
                )),
                None => {
                    tracing::warn!(image_id = %image.id, "Observation image has no URL, skipping")
                }
            }
        }
        for file in self.files.unwrap_or_default() {
            match file.url.filter(|u| !u.is_empty()) {
                Some(url) => items.push(item(file.id, MediaKind::File, url, None, None, file.name)),
                None => tracing::warn!(file_id = %file.id, "Observation file has no URL, skipping"),
            }
        }
        for video in self.videos.unwrap_or_default() {
            let (Some(id), Some(url)) = (video.id, video.video_url.filter(|u| !u.is_empty()))
            else {
                tracing::debug!(
                    observation_id = %self.id,
                    "Skipping video without a transcoded URL"
                );
                continue;
            };
            items.push(item(id, MediaKind::Video, url, video.width, video.height, None));
        }
        items
    }
}

// ── REST: /api/v2/conversations ──────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub messages: Option<Vec<Message>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<MessageImage>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageImage {
    pub image_id: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

impl MessageImage {
    /// Message attachments are served at `{prefix}/{key}` with no size
    /// segment.
    fn download_url(&self) -> Option<String> {
        let prefix = self.prefix.as_deref()?.trim_end_matches('/');
        let key = self.key.as_deref()?.trim_start_matches('/');
        if prefix.is_empty() || key.is_empty() {
            return None;
        }
        Some(format!("{}/{}", prefix, key))
    }
}

impl Conversation {
    /// Image attachments of every message, each captured at its message's
    /// `createdAt`.
    pub fn into_media_items(self, discovered_at: DateTime<Utc>) -> Vec<MediaItem> {
        let mut items = Vec::new();
        for message in self.messages.unwrap_or_default() {
            let images = message.images.unwrap_or_default();
            if images.is_empty() {
                continue;
            }
            let Some(captured_at) = message.created_at.as_deref().and_then(parse_timestamp) else {
                tracing::warn!(
                    message_id = message.message_id.as_deref().unwrap_or("?"),
                    "Message has no usable timestamp, skipping {} images",
                    images.len()
                );
                continue;
            };
            for image in images {
                let Some(source_url) = image.download_url() else {
                    tracing::warn!(
                        image_id = %image.image_id,
                        "Message image has no URL, skipping"
                    );
                    continue;
                };
                items.push(MediaItem {
                    id: image.image_id,
                    kind: MediaKind::Photo,
                    source_url,
                    width: image.width,
                    height: image.height,
                    captured_at,
                    discovered_at,
                    origin: MediaOrigin::Messages,
                    original_name: None,
                });
            }
        }
        items
    }
}

// ── REST: /api/v2/sidebar ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SidebarResponse {
    #[serde(default)]
    pub items: Vec<SidebarItem>,
}

#[derive(Debug, Deserialize)]
pub struct SidebarItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// A child the access token can see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildProfile {
    pub id: String,
    pub name: Option<String>,
}

impl SidebarResponse {
    /// Children appear as sidebar items whose type mentions `Child`.
    pub fn into_children(self) -> Vec<ChildProfile> {
        self.items
            .into_iter()
            .filter(|item| item.item_type.contains("Child"))
            .filter_map(|item| {
                let id = item.id.filter(|id| !id.is_empty())?;
                Some(ChildProfile {
                    id,
                    name: item.title.filter(|t| !t.trim().is_empty()),
                })
            })
            .collect()
    }
}
