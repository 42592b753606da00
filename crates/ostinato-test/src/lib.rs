//! Helpers for testing the synchronization engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`MusicService`], make sure that the instance is held until all requests to
//!    the server have been made. If the service is dropped, the ports remain open and all
//!    connections to it will time out. To avoid this, assign it to a variable:
//!    `let service = MusicService::new();`.
//!
//!  - The service answers with strong `ETag` headers derived from the body and honors
//!    `If-None-Match`, so revalidation behaves like the real API: an unchanged body comes
//!    back as `304 Not Modified`.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `ostinato` crates and mutes
///    all other logs (such as the HTTP stack).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("ostinato_service=trace,ostinato=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The scriptable account state behind the fake service.
///
/// Everything is stored as raw JSON. Tests either use the builders at the
/// bottom of this module ([`artist`], [`album`], [`device`], [`playback`],
/// [`playlist`]) or hand-write values for malformed-payload cases.
#[derive(Debug, Default)]
pub struct ServiceState {
    /// The playback document, `None` answers `204 No Content`.
    pub playback: Option<Value>,
    pub devices: Vec<Value>,
    /// Artists the account follows, in cursor order.
    pub followed: Vec<Value>,
    pub playlists: Vec<Value>,
    /// Albums per artist id, newest first like the real endpoint.
    pub artist_albums: BTreeMap<String, Vec<Value>>,
    /// Full album records served by the batched `/albums?ids=` endpoint.
    pub album_records: BTreeMap<String, Value>,
    /// Statuses to answer instead of the real response, popped per request.
    /// Keyed by request path, or by `path?query` to hit one exact page.
    pub status_queue: BTreeMap<String, VecDeque<u16>>,
    /// Raw bodies served instead of the real response, bypassing pagination
    /// and etags. Keyed like `status_queue`.
    pub body_overrides: BTreeMap<String, Value>,
    /// Every non-GET request the service accepted, as `METHOD path?query`.
    pub writes: Vec<String>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<ServiceState>,
    hits: Mutex<BTreeMap<String, usize>>,
}

type Shared = Arc<Inner>;

/// A scripted stand-in for the music service Web API.
///
/// Serves the read endpoints the engine polls (playback, devices, followed
/// artists, playlists, artist albums, batched album lookup) with real
/// pagination and `ETag` revalidation, and accepts the write endpoints the
/// commands use, recording them and applying their obvious effect to the
/// account state.
#[derive(Debug)]
pub struct MusicService {
    server: Server,
    inner: Shared,
}

impl MusicService {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(ServiceState::default()),
            hits: Mutex::new(BTreeMap::new()),
        });

        let router = Router::new()
            .route("/v1/me/player", get(get_playback).put(put_transfer))
            .route("/v1/me/player/devices", get(get_devices))
            .route("/v1/me/player/play", put(put_play))
            .route("/v1/me/player/pause", put(put_pause))
            .route("/v1/me/player/next", post(post_skip))
            .route("/v1/me/player/previous", post(post_skip))
            .route("/v1/me/player/seek", put(put_seek))
            .route("/v1/me/player/volume", put(put_volume))
            .route("/v1/me/player/shuffle", put(put_shuffle))
            .route("/v1/me/player/repeat", put(put_repeat))
            .route("/v1/me/following", get(get_following).put(put_follow).delete(delete_follow))
            .route("/v1/me/playlists", get(get_playlists))
            .route("/v1/artists/:artist_id/albums", get(get_artist_albums))
            .route("/v1/albums", get(get_albums_batch))
            .layer(middleware::from_fn_with_state(inner.clone(), intercept))
            .with_state(inner.clone());

        let server = Server::with_router(router);

        Self { server, inner }
    }

    /// The URL synchronization configs should use as their API base.
    pub fn base_url(&self) -> String {
        self.server.url("v1")
    }

    /// Direct access to the account state, for scripting and asserting.
    pub fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.inner.state.lock().unwrap()
    }

    pub fn set_playback(&self, playback: Option<Value>) {
        self.state().playback = playback;
    }

    pub fn set_devices(&self, devices: Vec<Value>) {
        self.state().devices = devices;
    }

    pub fn set_followed(&self, artists: Vec<Value>) {
        self.state().followed = artists;
    }

    pub fn set_playlists(&self, playlists: Vec<Value>) {
        self.state().playlists = playlists;
    }

    /// Scripts the album list of one artist and registers each album for the
    /// batched lookup endpoint as well.
    pub fn set_artist_albums(&self, artist_id: &str, albums: Vec<Value>) {
        let mut state = self.state();
        for album in &albums {
            if let Some(id) = album["id"].as_str() {
                state.album_records.insert(id.to_owned(), album.clone());
            }
        }
        state.artist_albums.insert(artist_id.to_owned(), albums);
    }

    /// Answers the next requests for `path` with the given statuses instead
    /// of the real response. A 429 carries `Retry-After: 0`.
    ///
    /// `path` may include a query string to target one exact page, e.g.
    /// `/v1/me/playlists?limit=50&offset=100`.
    pub fn enqueue_statuses(&self, path: &str, statuses: &[u16]) {
        let mut state = self.state();
        state
            .status_queue
            .entry(path.to_owned())
            .or_default()
            .extend(statuses.iter().copied());
    }

    /// Serves `body` verbatim for every request to `path`, for scripting
    /// envelopes the real handlers would never produce.
    pub fn override_body(&self, path: &str, body: Value) {
        self.state().body_overrides.insert(path.to_owned(), body);
    }

    /// The writes accepted so far, as `METHOD path?query` strings.
    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    /// Total number of requests served, counting every page and retry.
    ///
    /// This resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.inner.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// All request counts by `path?query`, sorted.
    ///
    /// This resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.inner.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Number of requests whose path starts with `prefix`, without resetting.
    pub fn requests_to(&self, prefix: &str) -> usize {
        let hits = self.inner.hits.lock().unwrap();
        hits.iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, count)| count)
            .sum()
    }
}

impl Default for MusicService {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts the hit, records writes and applies scripted status overrides.
async fn intercept(State(inner): State<Shared>, request: Request, next: Next) -> Response {
    let uri = request.uri().clone();
    let key = uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| uri.path().to_string());

    {
        let mut hits = inner.hits.lock().unwrap();
        *hits.entry(key.clone()).or_default() += 1;
    }

    let (scripted, overridden) = {
        let mut state = inner.state.lock().unwrap();
        if request.method() != Method::GET {
            state.writes.push(format!("{} {key}", request.method()));
        }
        let scripted = state
            .status_queue
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .or_else(|| {
                state
                    .status_queue
                    .get_mut(uri.path())
                    .and_then(VecDeque::pop_front)
            });
        let overridden = state
            .body_overrides
            .get(&key)
            .or_else(|| state.body_overrides.get(uri.path()))
            .cloned();
        (scripted, overridden)
    };

    if let Some(status) = scripted {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = status.into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("0"));
        }
        return response;
    }

    if let Some(body) = overridden {
        return Json(body).into_response();
    }

    next.run(request).await
}

/// Answers with the body and an `ETag`, or `304 Not Modified` when the
/// request already has the current version.
fn cacheable(headers: &HeaderMap, body: Value) -> Response {
    let body = serde_json::to_vec(&body).unwrap();
    let etag = format!("\"{:x}\"", Sha256::digest(&body));

    let revalidated = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == etag);
    if revalidated {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
    }

    (
        StatusCode::OK,
        [
            (header::ETAG, etag),
            (header::CONTENT_TYPE, "application/json".to_owned()),
        ],
        body,
    )
        .into_response()
}

fn param(params: &BTreeMap<String, String>, name: &str, default: usize) -> usize {
    params
        .get(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Builds an offset page over `items`, with an absolute `next` link pointing
/// back at this server.
fn offset_page(
    host: &str,
    path: &str,
    params: &BTreeMap<String, String>,
    items: &[Value],
) -> Value {
    let limit = param(params, "limit", 20).clamp(1, 50);
    let offset = param(params, "offset", 0);
    let total = items.len();

    let page: Vec<Value> = items.iter().skip(offset).take(limit).cloned().collect();
    let next = (offset + limit < total).then(|| {
        let mut params = params.clone();
        params.insert("limit".to_owned(), limit.to_string());
        params.insert("offset".to_owned(), (offset + limit).to_string());
        let query: Vec<String> = params
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        format!("http://{host}{path}?{}", query.join("&"))
    });

    json!({
        "items": page,
        "total": total,
        "limit": limit,
        "offset": offset,
        "next": next,
    })
}

fn host_of(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_owned()
}

async fn get_playback(State(inner): State<Shared>, headers: HeaderMap) -> Response {
    let playback = inner.state.lock().unwrap().playback.clone();
    match playback {
        Some(playback) => cacheable(&headers, playback),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_devices(State(inner): State<Shared>, headers: HeaderMap) -> Response {
    let devices = inner.state.lock().unwrap().devices.clone();
    cacheable(&headers, json!({ "devices": devices }))
}

async fn get_following(
    State(inner): State<Shared>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let followed = inner.state.lock().unwrap().followed.clone();
    let limit = param(&params, "limit", 20).clamp(1, 50);

    let start = match params.get("after") {
        Some(after) => followed
            .iter()
            .position(|artist| artist["id"].as_str() == Some(after.as_str()))
            .map(|index| index + 1)
            .unwrap_or(followed.len()),
        None => 0,
    };

    let page: Vec<Value> = followed.iter().skip(start).take(limit).cloned().collect();
    let after = (start + limit < followed.len())
        .then(|| page.last())
        .flatten()
        .and_then(|artist| artist["id"].as_str())
        .map(str::to_owned);
    let next = after.as_ref().map(|after| {
        format!(
            "http://{}/v1/me/following?type=artist&after={after}&limit={limit}",
            host_of(&headers),
        )
    });

    cacheable(
        &headers,
        json!({
            "artists": {
                "items": page,
                "total": followed.len(),
                "next": next,
                "cursors": { "after": after },
            }
        }),
    )
}

async fn get_playlists(
    State(inner): State<Shared>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let playlists = inner.state.lock().unwrap().playlists.clone();
    let page = offset_page(&host_of(&headers), "/v1/me/playlists", &params, &playlists);
    cacheable(&headers, page)
}

async fn get_artist_albums(
    State(inner): State<Shared>,
    Path(artist_id): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let albums = inner
        .state
        .lock()
        .unwrap()
        .artist_albums
        .get(&artist_id)
        .cloned()
        .unwrap_or_default();
    let path = format!("/v1/artists/{artist_id}/albums");
    let page = offset_page(&host_of(&headers), &path, &params, &albums);
    cacheable(&headers, page)
}

async fn get_albums_batch(
    State(inner): State<Shared>,
    Query(params): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let state = inner.state.lock().unwrap();
    let records: Vec<Value> = params
        .get("ids")
        .map(|ids| {
            ids.split(',')
                .map(|id| state.album_records.get(id).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .unwrap_or_default();
    let body = json!({ "albums": records });
    drop(state);
    cacheable(&headers, body)
}

fn with_playback(inner: &Shared, change: impl FnOnce(&mut Value)) -> StatusCode {
    let mut state = inner.state.lock().unwrap();
    if let Some(playback) = state.playback.as_mut() {
        change(playback);
    }
    StatusCode::NO_CONTENT
}

async fn put_play(State(inner): State<Shared>) -> StatusCode {
    with_playback(&inner, |playback| playback["is_playing"] = json!(true))
}

async fn put_pause(State(inner): State<Shared>) -> StatusCode {
    with_playback(&inner, |playback| playback["is_playing"] = json!(false))
}

async fn post_skip() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn put_seek(
    State(inner): State<Shared>,
    Query(params): Query<BTreeMap<String, String>>,
) -> StatusCode {
    let position = param(&params, "position_ms", 0);
    with_playback(&inner, |playback| {
        playback["progress_ms"] = json!(position);
    })
}

async fn put_volume(
    State(inner): State<Shared>,
    Query(params): Query<BTreeMap<String, String>>,
) -> StatusCode {
    let percent = param(&params, "volume_percent", 0);
    with_playback(&inner, |playback| {
        playback["device"]["volume_percent"] = json!(percent);
    })
}

async fn put_shuffle(
    State(inner): State<Shared>,
    Query(params): Query<BTreeMap<String, String>>,
) -> StatusCode {
    let shuffle = params.get("state").map(String::as_str) == Some("true");
    with_playback(&inner, |playback| {
        playback["shuffle_state"] = json!(shuffle);
    })
}

async fn put_repeat(
    State(inner): State<Shared>,
    Query(params): Query<BTreeMap<String, String>>,
) -> StatusCode {
    let repeat = params.get("state").cloned().unwrap_or_else(|| "off".to_owned());
    with_playback(&inner, |playback| {
        playback["repeat_state"] = json!(repeat);
    })
}

async fn put_transfer(State(inner): State<Shared>, Json(body): Json<Value>) -> StatusCode {
    let target = body["device_ids"][0].as_str().map(str::to_owned);
    let mut state = inner.state.lock().unwrap();
    let mut active = None;
    for device in &mut state.devices {
        let is_target = device["id"].as_str() == target.as_deref();
        device["is_active"] = json!(is_target);
        if is_target {
            active = Some(device.clone());
        }
    }
    if let (Some(playback), Some(active)) = (state.playback.as_mut(), active) {
        playback["device"] = active;
    }
    StatusCode::NO_CONTENT
}

async fn put_follow(
    State(inner): State<Shared>,
    Query(params): Query<BTreeMap<String, String>>,
) -> StatusCode {
    let mut state = inner.state.lock().unwrap();
    for id in ids_param(&params) {
        let known = state
            .followed
            .iter()
            .any(|artist| artist["id"].as_str() == Some(id.as_str()));
        if !known {
            state.followed.push(artist(&id, &id));
        }
    }
    StatusCode::NO_CONTENT
}

async fn delete_follow(
    State(inner): State<Shared>,
    Query(params): Query<BTreeMap<String, String>>,
) -> StatusCode {
    let ids = ids_param(&params);
    let mut state = inner.state.lock().unwrap();
    state
        .followed
        .retain(|artist| !ids.iter().any(|id| artist["id"].as_str() == Some(id.as_str())));
    StatusCode::NO_CONTENT
}

fn ids_param(params: &BTreeMap<String, String>) -> Vec<String> {
    params
        .get("ids")
        .map(|ids| ids.split(',').map(str::to_owned).collect())
        .unwrap_or_default()
}

/// An artist record as the service serializes it.
pub fn artist(id: &str, name: &str) -> Value {
    json!({ "id": id, "name": name })
}

/// An album record with day precision and the given credited artists.
pub fn album(id: &str, name: &str, release_date: &str, artists: &[(&str, &str)]) -> Value {
    let artists: Vec<Value> = artists.iter().map(|(id, name)| artist(id, name)).collect();
    json!({
        "id": id,
        "name": name,
        "album_type": "album",
        "artists": artists,
        "release_date": release_date,
        "release_date_precision": "day",
        "total_tracks": 10,
    })
}

/// A device record.
pub fn device(id: &str, name: &str, is_active: bool, volume_percent: u32) -> Value {
    json!({
        "id": id,
        "name": name,
        "type": "speaker",
        "is_active": is_active,
        "volume_percent": volume_percent,
    })
}

/// A playback document placing a track on the given device.
pub fn playback(device: Value, track_id: &str, is_playing: bool, progress_ms: u64) -> Value {
    json!({
        "device": device,
        "is_playing": is_playing,
        "shuffle_state": false,
        "repeat_state": "off",
        "timestamp": 1_703_173_911_093_u64,
        "progress_ms": progress_ms,
        "item": {
            "id": track_id,
            "name": format!("Track {track_id}"),
            "duration_ms": 413_947,
            "artists": [],
        },
    })
}

/// A playlist record.
pub fn playlist(id: &str, name: &str, snapshot_id: &str, tracks: u64) -> Value {
    json!({
        "id": id,
        "name": name,
        "owner": { "id": "listener", "display_name": "Listener" },
        "snapshot_id": snapshot_id,
        "tracks": { "total": tracks },
    })
}
