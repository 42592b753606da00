//! Wire-level types of the music service Web API.
//!
//! All of these deserialize straight from the service's JSON responses.
//! Unknown fields are ignored on purpose, the upstream API grows fields
//! regularly and old payloads persisted in the response cache must keep
//! deserializing.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Identifier of an artist, as issued by the remote service.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ArtistId(pub String);

impl std::fmt::Display for ArtistId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtistId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Identifier of an album.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct AlbumId(pub String);

impl std::fmt::Display for AlbumId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AlbumId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Identifier of a playback device.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// An offset-paginated envelope.
///
/// The service returns collections in pages of `limit` items, with `next`
/// carrying the full URL of the following page, or `null` on the last one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total number of items in the whole collection, not this page.
    pub total: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Page {
            items: Vec::new(),
            total: 0,
            next: None,
            limit: 0,
            offset: 0,
        }
    }
}

/// A cursor-paginated envelope, used by the followed-artists endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CursorPage<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub cursors: Cursors,
}

impl<T> Default for CursorPage<T> {
    fn default() -> Self {
        CursorPage {
            items: Vec::new(),
            total: 0,
            next: None,
            cursors: Cursors::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Cursors {
    #[serde(default)]
    pub after: Option<String>,
}

/// A playback device known to the service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// `None` for restricted devices the service refuses to identify.
    pub id: Option<DeviceId>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub volume_percent: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatState {
    #[default]
    Off,
    Track,
    Context,
}

impl RepeatState {
    /// The value the corresponding write endpoint expects.
    pub fn as_str(self) -> &'static str {
        match self {
            RepeatState::Off => "off",
            RepeatState::Track => "track",
            RepeatState::Context => "context",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: ArtistId,
    pub name: String,
}

/// Granularity of an album's `release_date` field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseDatePrecision {
    Year,
    Month,
    Day,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: AlbumId,
    pub name: String,
    /// "album", "single" or "compilation".
    #[serde(default)]
    pub album_type: String,
    #[serde(default)]
    pub artists: Vec<Artist>,
    /// Date string whose shape depends on [`ReleaseDatePrecision`]:
    /// `YYYY`, `YYYY-MM` or `YYYY-MM-DD`.
    pub release_date: String,
    pub release_date_precision: ReleaseDatePrecision,
    #[serde(default)]
    pub total_tracks: Option<u32>,
}

impl Album {
    /// Resolves the release date to a concrete day.
    ///
    /// Year and month precision round down to the first day of the period.
    /// Returns `None` for date strings the service should not produce.
    pub fn released_at(&self) -> Option<NaiveDate> {
        let date = &self.release_date;
        match self.release_date_precision {
            ReleaseDatePrecision::Year => {
                let year = date.parse().ok()?;
                NaiveDate::from_ymd_opt(year, 1, 1)
            }
            ReleaseDatePrecision::Month => {
                let (year, month) = date.split_once('-')?;
                NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)
            }
            ReleaseDatePrecision::Day => NaiveDate::parse_from_str(date, "%Y-%m-%d").ok(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// `None` for local files injected into a playlist.
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub album: Option<Album>,
}

/// What the user's player is doing right now.
///
/// An inactive player (HTTP 204 from the playback endpoint) is represented
/// by the [`Default`] value: no device, nothing playing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    #[serde(default)]
    pub device: Option<Device>,
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub shuffle_state: bool,
    #[serde(default)]
    pub repeat_state: RepeatState,
    /// Server-side instant this snapshot was taken, epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub progress_ms: Option<u64>,
    #[serde(default)]
    pub item: Option<Track>,
}

impl PlaybackState {
    /// The id of the device this state belongs to, if the service disclosed one.
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.device.as_ref().and_then(|d| d.id.as_ref())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaylistOwner {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackRef {
    #[serde(default)]
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner: PlaylistOwner,
    /// Changes whenever the playlist contents change.
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub tracks: TrackRef,
}
