//! Value types shared between the scheduler and the thumbnail backend.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Opaque identifier of a source asset.
///
/// In practice this is the content hash of the source file, which the backend also uses as the
/// file name of the materialized thumbnail.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(Arc<str>);

impl AssetId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AssetId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// The rendered sizes the backend knows how to produce.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailSize {
    /// Tiny placeholder used for progressive loading.
    Tiny,
    /// Grid cells, sized for 2x DPI.
    Small,
    /// The default size.
    #[default]
    Medium,
    /// Large previews.
    Large,
}

impl ThumbnailSize {
    pub const ALL: [ThumbnailSize; 4] = [Self::Tiny, Self::Small, Self::Medium, Self::Large];

    /// The maximum edge length of the rendered thumbnail, in pixels.
    pub fn dimensions(&self) -> u32 {
        match self {
            Self::Tiny => 50,
            Self::Small => 300,
            Self::Medium => 500,
            Self::Large => 800,
        }
    }

    /// Parses the wire name of a size.
    ///
    /// Returns `None` for unknown names. Callers usually fall back to [`ThumbnailSize::Medium`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tiny" => Some(Self::Tiny),
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            _ => None,
        }
    }
}

impl AsRef<str> for ThumbnailSize {
    fn as_ref(&self) -> &str {
        match self {
            Self::Tiny => "tiny",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl fmt::Display for ThumbnailSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Identifies one wanted thumbnail: a source asset rendered at a given size.
///
/// Two demands with the same key are the same unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemandKey {
    pub asset_id: AssetId,
    pub size: ThumbnailSize,
}

impl DemandKey {
    pub fn new(asset_id: impl Into<AssetId>, size: ThumbnailSize) -> Self {
        Self {
            asset_id: asset_id.into(),
            size,
        }
    }
}

impl fmt::Display for DemandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.asset_id, self.size)
    }
}

/// A request for a thumbnail, as issued by a UI consumer.
///
/// Built with [`DemandRequest::new`] and the chained setters, which mirror the optional
/// arguments of [`ThumbnailScheduler::demand`](crate::ThumbnailScheduler::demand).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemandRequest {
    pub key: DemandKey,
    pub source_location: String,
    pub priority: i32,
    pub visible: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl DemandRequest {
    pub fn new(
        asset_id: impl Into<AssetId>,
        size: ThumbnailSize,
        source_location: impl Into<String>,
    ) -> Self {
        Self {
            key: DemandKey::new(asset_id, size),
            source_location: source_location.into(),
            priority: 0,
            visible: false,
            width: None,
            height: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Sets the size hints that are passed through to generation.
    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

/// An outstanding, not yet resolved thumbnail demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Demand {
    pub key: DemandKey,
    /// Where the backend reads the source image from.
    pub source_location: String,
    pub priority: i32,
    pub visible: bool,
    /// Set once on creation.
    pub created_at: Instant,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Registry insertion order, used to break priority ties.
    pub(crate) seq: u64,
}

impl Demand {
    pub(crate) fn from_request(request: DemandRequest, created_at: Instant, seq: u64) -> Self {
        let DemandRequest {
            key,
            source_location,
            priority,
            visible,
            width,
            height,
        } = request;
        Self {
            key,
            source_location,
            priority,
            visible,
            created_at,
            width,
            height,
            seq,
        }
    }

    /// Merges a duplicate request into this demand.
    ///
    /// Priority only ever rises and visibility is sticky; hiding a demand requires an explicit
    /// [`mark_hidden`](crate::ThumbnailScheduler::mark_hidden). Location and size hints are
    /// last-writer-wins, but a missing hint never clears a known one.
    pub(crate) fn merge(&mut self, request: DemandRequest) {
        debug_assert_eq!(self.key, request.key);
        self.priority = self.priority.max(request.priority);
        self.visible |= request.visible;
        self.source_location = request.source_location;
        if request.width.is_some() {
            self.width = request.width;
        }
        if request.height.is_some() {
            self.height = request.height;
        }
    }

    pub(crate) fn generation_task(&self) -> GenerationTask {
        GenerationTask {
            asset_id: self.key.asset_id.clone(),
            size: self.key.size,
            source_location: self.source_location.clone(),
            priority: self.priority,
            width: self.width,
            height: self.height,
        }
    }
}

/// A renderable thumbnail, as stored in the L1 cache and handed to subscribers.
#[derive(Clone, PartialEq, Eq)]
pub enum ThumbnailHandle {
    /// The thumbnail is materialized at this location.
    Location(Arc<str>),
    /// The encoded thumbnail is carried inline.
    Inline(Bytes),
}

impl ThumbnailHandle {
    pub fn location(location: impl AsRef<str>) -> Self {
        Self::Location(Arc::from(location.as_ref()))
    }
}

impl fmt::Debug for ThumbnailHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Location(location) => f.debug_tuple("Location").field(location).finish(),
            Self::Inline(bytes) => write!(f, "Inline(<{} bytes>)", bytes.len()),
        }
    }
}

/// The "thumbnail ready" notification published by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyEvent {
    pub asset_id: AssetId,
    pub size: ThumbnailSize,
    pub location: String,
    #[serde(default)]
    pub is_placeholder: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Bytes>,
}

impl ReadyEvent {
    pub fn key(&self) -> DemandKey {
        DemandKey::new(self.asset_id.clone(), self.size)
    }

    /// The handle carried by this event, preferring inline data over the location.
    pub fn handle(&self) -> ThumbnailHandle {
        match &self.inline_data {
            Some(data) => ThumbnailHandle::Inline(data.clone()),
            None => ThumbnailHandle::location(&self.location),
        }
    }
}

/// One entry of a generation batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTask {
    pub asset_id: AssetId,
    pub size: ThumbnailSize,
    pub source_location: String,
    pub priority: i32,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl GenerationTask {
    pub fn key(&self) -> DemandKey {
        DemandKey::new(self.asset_id.clone(), self.size)
    }
}

/// The answer of the existence check for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistenceResult {
    pub asset_id: AssetId,
    pub size: ThumbnailSize,
    pub hit: bool,
    pub location: Option<String>,
}

impl ExistenceResult {
    pub fn key(&self) -> DemandKey {
        DemandKey::new(self.asset_id.clone(), self.size)
    }
}

/// Diagnostic counters of the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub wanted_count: usize,
    pub in_flight_count: usize,
    pub visible_count: usize,
}
