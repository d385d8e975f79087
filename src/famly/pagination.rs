//! Paginated media sources and the cursor driver that turns them into one
//! lazy stream of [`MediaItem`]s.
//!
//! Pages are fetched only as the consumer pulls, so a planner that stops early
//! never pays for the pages it didn't need.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::sync::OnceCell;

use super::error::ApiError;
use super::media::{MediaItem, MediaOrigin, Resolution};
use super::ApiClient;
use crate::credentials::Credential;
use crate::sync::SyncError;

/// Where the next page starts. Offset feeds count records; cursor feeds hand
/// back an opaque token (`None` for the first page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    Offset(u64),
    After(Option<String>),
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageCursor::Offset(offset) => write!(f, "offset {}", offset),
            PageCursor::After(None) => write!(f, "first page"),
            PageCursor::After(Some(cursor)) => write!(f, "cursor {}", cursor),
        }
    }
}

/// One fetched page.
#[derive(Debug)]
pub struct Page {
    pub items: Vec<MediaItem>,
    /// Raw records the server returned. Can exceed `items.len()` when some
    /// records were unusable; only a zero here counts as an empty page.
    pub records: usize,
    /// `None` once the feed is exhausted.
    pub next: Option<PageCursor>,
}

/// A paginated feed of media.
#[async_trait]
pub trait MediaSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn first_cursor(&self) -> PageCursor;

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page, ApiError>;
}

/// The REST tagged-images feed, paged by offset.
pub struct TaggedImagesSource {
    client: ApiClient,
    credential: Credential,
    page_size: u64,
    resolution: Resolution,
}

impl TaggedImagesSource {
    pub fn new(
        client: ApiClient,
        credential: Credential,
        page_size: u64,
        resolution: Resolution,
    ) -> Self {
        Self {
            client,
            credential,
            page_size: page_size.max(1),
            resolution,
        }
    }
}

/// Work out the cursor after an offset page.
///
/// The offset advances by the records actually returned, never by the page
/// size. An empty page below the server's total is not the end; the same
/// offset is asked for again. Without a total, a short page ends the feed.
fn next_offset(offset: u64, records: usize, limit: u64, total: Option<u64>) -> Option<PageCursor> {
    let advanced = offset + records as u64;
    match total {
        Some(total) if records == 0 => (offset < total).then_some(PageCursor::Offset(offset)),
        Some(total) => (advanced < total).then_some(PageCursor::Offset(advanced)),
        None => ((records as u64) >= limit).then_some(PageCursor::Offset(advanced)),
    }
}

#[async_trait]
impl MediaSource for TaggedImagesSource {
    fn name(&self) -> &'static str {
        MediaOrigin::TaggedImages.as_str()
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Offset(0)
    }

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page, ApiError> {
        let PageCursor::Offset(offset) = *cursor else {
            return Err(ApiError::fatal(self.name(), format!("unexpected {cursor}")));
        };
        let (images, total) = self
            .client
            .fetch_tagged_images_page(&self.credential, offset, self.page_size)
            .await?;
        let records = images.len();
        let discovered_at = Utc::now();
        let items = images
            .into_iter()
            .filter_map(|img| img.into_media_item(self.resolution, discovered_at))
            .collect();
        tracing::debug!(
            source = self.name(),
            offset,
            records,
            total = ?total,
            "Fetched page"
        );
        Ok(Page {
            items,
            records,
            next: next_offset(offset, records, self.page_size, total),
        })
    }
}

/// The GraphQL observations feed, paged by opaque cursor.
pub struct ObservationsSource {
    client: ApiClient,
    credential: Credential,
    page_size: u32,
}

impl ObservationsSource {
    pub fn new(client: ApiClient, credential: Credential, page_size: u32) -> Self {
        Self {
            client,
            credential,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl MediaSource for ObservationsSource {
    fn name(&self) -> &'static str {
        MediaOrigin::Observations.as_str()
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::After(None)
    }

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page, ApiError> {
        let PageCursor::After(after) = cursor else {
            return Err(ApiError::fatal(self.name(), format!("unexpected {cursor}")));
        };
        let child_ids = [self.credential.child_id.clone()];
        let page = self
            .client
            .fetch_observations_page(&self.credential, &child_ids, self.page_size, after.as_deref())
            .await?;
        let results = page.results.unwrap_or_default();
        let records = results.len();
        let discovered_at = Utc::now();
        let items: Vec<MediaItem> = results
            .into_iter()
            .flat_map(|obs| obs.into_media_items(discovered_at))
            .collect();
        tracing::debug!(
            source = self.name(),
            %cursor,
            records,
            items = items.len(),
            "Fetched page"
        );
        Ok(Page {
            items,
            records,
            next: page
                .next
                .filter(|c| !c.is_empty())
                .map(|c| PageCursor::After(Some(c))),
        })
    }
}

/// Image attachments in the guardian's conversations. The conversation list
/// is fetched once; each page is then one conversation, addressed by its
/// position in that list.
pub struct ConversationsSource {
    client: ApiClient,
    credential: Credential,
    conversation_ids: OnceCell<Vec<String>>,
}

impl ConversationsSource {
    pub fn new(client: ApiClient, credential: Credential) -> Self {
        Self {
            client,
            credential,
            conversation_ids: OnceCell::new(),
        }
    }

    async fn conversation_ids(&self) -> Result<&[String], ApiError> {
        let ids = self
            .conversation_ids
            .get_or_try_init(|| async {
                let summaries = self.client.fetch_conversations(&self.credential).await?;
                tracing::debug!(
                    source = self.name(),
                    conversations = summaries.len(),
                    "Fetched conversation list"
                );
                Ok::<_, ApiError>(summaries.into_iter().map(|c| c.conversation_id).collect())
            })
            .await?;
        Ok(ids.as_slice())
    }
}

#[async_trait]
impl MediaSource for ConversationsSource {
    fn name(&self) -> &'static str {
        MediaOrigin::Messages.as_str()
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Offset(0)
    }

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<Page, ApiError> {
        let PageCursor::Offset(index) = *cursor else {
            return Err(ApiError::fatal(self.name(), format!("unexpected {cursor}")));
        };
        let ids = self.conversation_ids().await?;
        let Some(conversation_id) = usize::try_from(index).ok().and_then(|i| ids.get(i)) else {
            return Ok(Page {
                items: Vec::new(),
                records: 0,
                next: None,
            });
        };
        let conversation = self
            .client
            .fetch_conversation(&self.credential, conversation_id)
            .await?;
        let items = conversation.into_media_items(Utc::now());
        tracing::debug!(
            source = self.name(),
            conversation_id = %conversation_id,
            items = items.len(),
            "Fetched conversation"
        );
        let next = index + 1;
        Ok(Page {
            items,
            // A conversation without pictures is still a record, not a stall.
            records: 1,
            next: ((next as usize) < ids.len()).then_some(PageCursor::Offset(next)),
        })
    }
}

/// Drives a [`MediaSource`] page by page.
///
/// A page with zero records that still points at a next page is retried at
/// the same cursor, up to `stall_limit` times, before the stream ends with
/// [`SyncError::PaginationStall`].
#[derive(Clone)]
pub struct Paginator {
    source: Arc<dyn MediaSource>,
    stall_limit: u32,
    stall_delay: Duration,
}

impl Paginator {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            stall_limit: 3,
            stall_delay: Duration::from_millis(500),
        }
    }

    pub fn with_stall_policy(mut self, limit: u32, delay: Duration) -> Self {
        self.stall_limit = limit;
        self.stall_delay = delay;
        self
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    pub fn stream(&self) -> BoxStream<'static, Result<MediaItem, SyncError>> {
        self.stream_from(self.source.first_cursor())
    }

    /// Resume enumeration at `cursor`.
    pub fn stream_from(
        &self,
        cursor: PageCursor,
    ) -> BoxStream<'static, Result<MediaItem, SyncError>> {
        let source = Arc::clone(&self.source);
        let stall_limit = self.stall_limit;
        let stall_delay = self.stall_delay;

        stream::try_unfold(Some(cursor), move |cursor| {
            let source = Arc::clone(&source);
            async move {
                let Some(cursor) = cursor else {
                    return Ok::<_, SyncError>(None);
                };
                let mut empty_pages = 0u32;
                loop {
                    let page = source.fetch_page(&cursor).await?;
                    if page.records == 0 && page.next.is_some() {
                        empty_pages += 1;
                        if empty_pages > stall_limit {
                            return Err(SyncError::PaginationStall {
                                source_name: source.name(),
                                cursor: cursor.to_string(),
                                attempts: empty_pages,
                            });
                        }
                        tracing::warn!(
                            source = source.name(),
                            "Empty page at {} but the feed is not finished, retrying ({}/{})",
                            cursor,
                            empty_pages,
                            stall_limit
                        );
                        tokio::time::sleep(stall_delay).await;
                        continue;
                    }
                    let items = stream::iter(page.items.into_iter().map(Ok::<_, SyncError>));
                    return Ok(Some((items, page.next)));
                }
            }
        })
        .try_flatten()
        .boxed()
    }
}

/// Interleave several sources into one stream. Each source keeps its own
/// cursor; a stall in one does not stop the others.
pub fn merge(paginators: &[Paginator]) -> BoxStream<'static, Result<MediaItem, SyncError>> {
    stream::select_all(paginators.iter().map(Paginator::stream)).boxed()
}
