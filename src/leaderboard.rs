//! # Region Leaderboard Cache
//!
//! Per-cell top-N leaderboards for the area currently shown on the map.
//!
//! ## Policy
//!
//! - **Replace, don't merge**: a successful fetch replaces the whole mapping
//!   (and the cell boundaries derived from it) with exactly the cells
//!   returned. Memory stays bounded to about one viewport of cells.
//! - **Refetch hysteresis**: [`should_refetch`] suppresses requests for small
//!   pan/zoom changes.
//! - **Failure keeps the previous state**: a failed or undecodable response
//!   leaves the cache as it was.
//! - **Latest request wins**: every [`FetchTicket`] carries a generation. A
//!   response for an older generation, or one issued before
//!   [`RegionLeaderboardCache::cancel_in_flight`], is discarded.
//!
//! Cell envelopes are kept in an R-tree so the display layer can ask which
//! cached cells intersect its viewport.

use std::collections::HashMap;
use std::future::Future;

use h3o::Resolution;
use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Deserializer, Serialize};

use crate::cells::{index_of, CellBoundary, CellId};
use crate::{Bounds, GpsPoint, Result, TerritoryConfig, TerritoryError};

// ============================================================================
// Viewport
// ============================================================================

/// The geographic region currently visible on the map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub center_lat: f64,
    pub center_lng: f64,
    pub lat_span: f64,
    pub lng_span: f64,
}

impl Viewport {
    pub fn new(center_lat: f64, center_lng: f64, lat_span: f64, lng_span: f64) -> Self {
        Self {
            center_lat,
            center_lng,
            lat_span,
            lng_span,
        }
    }

    pub fn from_bounds(bounds: &Bounds) -> Self {
        let center = bounds.center();
        Self {
            center_lat: center.latitude,
            center_lng: center.longitude,
            lat_span: bounds.max_lat - bounds.min_lat,
            lng_span: bounds.max_lng - bounds.min_lng,
        }
    }

    /// Bounding box query for this viewport.
    ///
    /// Latitudes are clamped to ±90. The center longitude is wrapped into
    /// ±180 and the box is clamped there too, so a viewport straddling the
    /// antimeridian only queries the part on the center's side.
    pub fn to_bounds(&self) -> Bounds {
        let half_lat = self.lat_span.abs() / 2.0;
        let half_lng = self.lng_span.abs() / 2.0;
        let center_lng = wrap_longitude(self.center_lng);
        Bounds {
            min_lat: (self.center_lat - half_lat).max(-90.0),
            max_lat: (self.center_lat + half_lat).min(90.0),
            min_lng: (center_lng - half_lng).max(-180.0),
            max_lng: (center_lng + half_lng).min(180.0),
        }
    }
}

fn wrap_longitude(lng: f64) -> f64 {
    if (-180.0..=180.0).contains(&lng) {
        lng
    } else {
        (lng + 180.0).rem_euclid(360.0) - 180.0
    }
}

/// Decide whether a viewport change warrants a new leaderboard request.
///
/// True when there is no previous viewport, when the center moved by at
/// least `refetch_center_ratio` of the new span, or when a span changed by
/// at least `refetch_span_ratio` of the previous span (either axis).
/// A zero change never triggers.
pub fn should_refetch(
    previous: Option<&Viewport>,
    current: &Viewport,
    config: &TerritoryConfig,
) -> bool {
    let Some(previous) = previous else {
        return true;
    };

    let center_ratio = config.refetch_center_ratio;
    let span_ratio = config.refetch_span_ratio;

    let moved = |delta: f64, span: f64| delta > 0.0 && delta >= center_ratio * span.abs();
    let resized = |old: f64, new: f64| {
        let delta = (new - old).abs();
        delta > 0.0 && delta >= span_ratio * old.abs()
    };

    moved(
        (current.center_lat - previous.center_lat).abs(),
        current.lat_span,
    ) || moved(
        (current.center_lng - previous.center_lng).abs(),
        current.lng_span,
    ) || resized(previous.lat_span, current.lat_span)
        || resized(previous.lng_span, current.lng_span)
}

// ============================================================================
// Leaderboard entries
// ============================================================================

/// One ranked user in a cell leaderboard.
///
/// The backend has used several field names for the display name over
/// time; all of them are accepted and [`display_name`](Self::display_name)
/// resolves them in a fixed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub score: f64,
}

impl LeaderboardEntry {
    pub fn new(user_id: impl Into<String>, score: f64) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: None,
            username: None,
            name: None,
            score,
        }
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    /// `user_name`, then `username`, then `name`, then `user_id`.
    /// Blank names are skipped.
    pub fn display_name(&self) -> &str {
        [&self.user_name, &self.username, &self.name]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or(self.user_id.as_str())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Unsigned(n) => n.to_string(),
        StringOrNumber::Signed(n) => n.to_string(),
        StringOrNumber::Float(n) => n.to_string(),
    })
}

/// Top entries for one cell, ordered by score descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellLeaderboard {
    pub cell_id: CellId,
    pub entries: Vec<LeaderboardEntry>,
}

impl CellLeaderboard {
    pub fn new(cell_id: CellId, entries: Vec<LeaderboardEntry>) -> Self {
        Self { cell_id, entries }
    }

    /// Highest-scoring entry, if any.
    pub fn leader(&self) -> Option<&LeaderboardEntry> {
        self.entries.first()
    }

    /// Sort by score descending (stable for ties) and keep the top `depth`.
    fn normalized(mut self, depth: usize) -> Self {
        let key = |score: f64| if score.is_nan() { f64::NEG_INFINITY } else { score };
        self.entries
            .sort_by(|a, b| key(b.score).total_cmp(&key(a.score)));
        self.entries.truncate(depth);
        self
    }
}

/// Leaderboard Query collaborator: one request per bounding box.
pub trait LeaderboardQuery {
    fn query_bbox(&self, bounds: Bounds)
        -> impl Future<Output = Result<Vec<CellLeaderboard>>> + Send;
}

// ============================================================================
// Cache
// ============================================================================

/// A cached cell: its boundary for rendering and its leaderboard.
#[derive(Debug, Clone, PartialEq)]
pub struct CellTile {
    pub cell_id: CellId,
    pub boundary: CellBoundary,
    pub leaderboard: CellLeaderboard,
}

#[derive(Debug, Clone)]
struct TileEnvelope {
    cell_id: CellId,
    bounds: Bounds,
}

impl RTreeObject for TileEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds.min_lng, self.bounds.min_lat],
            [self.bounds.max_lng, self.bounds.max_lat],
        )
    }
}

/// Handle for one outstanding leaderboard request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchTicket {
    generation: u64,
    pub bounds: Bounds,
}

/// Result of applying a fetch response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Cache replaced with `cells` cells
    Applied { cells: usize },
    /// Response belonged to a superseded or cancelled request
    Discarded,
    /// Viewport change below the refetch thresholds; no request made
    Suppressed,
}

/// Region leaderboard cache, keyed by cell.
pub struct RegionLeaderboardCache {
    config: TerritoryConfig,
    resolution: Resolution,
    tiles: HashMap<CellId, CellTile>,
    spatial_index: RTree<TileEnvelope>,
    generation: u64,
    last_viewport: Option<Viewport>,
}

impl RegionLeaderboardCache {
    pub fn new(config: &TerritoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resolution: config.resolution()?,
            config: config.clone(),
            tiles: HashMap::new(),
            spatial_index: RTree::new(),
            generation: 0,
            last_viewport: None,
        })
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Whether `viewport` differs enough from the last requested one.
    pub fn should_refetch(&self, viewport: &Viewport) -> bool {
        should_refetch(self.last_viewport.as_ref(), viewport, &self.config)
    }

    /// Start a request for `bounds`. Supersedes any outstanding ticket.
    pub fn begin_fetch(&mut self, bounds: Bounds) -> FetchTicket {
        self.generation += 1;
        debug!(
            "[LeaderboardCache] Fetch #{} for bbox lat {:.5}..{:.5} lng {:.5}..{:.5}",
            self.generation, bounds.min_lat, bounds.max_lat, bounds.min_lng, bounds.max_lng
        );
        FetchTicket {
            generation: self.generation,
            bounds,
        }
    }

    /// Start a request for `viewport` if it passes the refetch thresholds.
    pub fn begin_viewport_fetch(&mut self, viewport: &Viewport) -> Option<FetchTicket> {
        if !self.should_refetch(viewport) {
            return None;
        }
        self.last_viewport = Some(*viewport);
        Some(self.begin_fetch(viewport.to_bounds()))
    }

    /// Make every outstanding ticket stale. Called when recording stops.
    pub fn cancel_in_flight(&mut self) {
        self.generation += 1;
    }

    /// Apply the response for `ticket`.
    ///
    /// Stale tickets are discarded. Errors (network, decode, resolution
    /// mismatch) leave the cache untouched and are returned to the caller.
    pub fn complete_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<Vec<CellLeaderboard>>,
    ) -> Result<FetchOutcome> {
        if ticket.generation != self.generation {
            debug!(
                "[LeaderboardCache] Discarding stale response #{} (current #{})",
                ticket.generation, self.generation
            );
            return Ok(FetchOutcome::Discarded);
        }

        let applied = result.and_then(|leaderboards| self.replace(leaderboards));
        if let Err(e) = &applied {
            warn!("[LeaderboardCache] Fetch failed, keeping previous cells: {}", e);
            // Allow the next viewport change to retry
            self.last_viewport = None;
        }
        applied
    }

    /// One request for `bounds`, applied when it returns.
    pub async fn fetch<Q: LeaderboardQuery>(
        &mut self,
        query: &Q,
        bounds: Bounds,
    ) -> Result<FetchOutcome> {
        let ticket = self.begin_fetch(bounds);
        let result = query.query_bbox(ticket.bounds).await;
        self.complete_fetch(ticket, result)
    }

    /// Fetch for `viewport` unless the change is below the thresholds.
    pub async fn refresh<Q: LeaderboardQuery>(
        &mut self,
        viewport: &Viewport,
        query: &Q,
    ) -> Result<FetchOutcome> {
        let Some(ticket) = self.begin_viewport_fetch(viewport) else {
            return Ok(FetchOutcome::Suppressed);
        };
        let result = query.query_bbox(ticket.bounds).await;
        self.complete_fetch(ticket, result)
    }

    fn replace(&mut self, leaderboards: Vec<CellLeaderboard>) -> Result<FetchOutcome> {
        let expected = u8::from(self.resolution);
        let depth = self.config.leaderboard_depth;

        // Validate everything before touching the current state
        let mut tiles = HashMap::with_capacity(leaderboards.len());
        for leaderboard in leaderboards {
            let found = leaderboard.cell_id.resolution();
            if found != expected {
                return Err(TerritoryError::ResolutionMismatch { expected, found });
            }
            let cell_id = leaderboard.cell_id;
            tiles.insert(
                cell_id,
                CellTile {
                    cell_id,
                    boundary: cell_id.boundary(),
                    leaderboard: leaderboard.normalized(depth),
                },
            );
        }

        let envelopes: Vec<TileEnvelope> = tiles
            .values()
            .map(|tile| TileEnvelope {
                cell_id: tile.cell_id,
                bounds: tile.boundary.envelope(),
            })
            .collect();

        self.tiles = tiles;
        self.spatial_index = RTree::bulk_load(envelopes);

        info!("[LeaderboardCache] Replaced cache with {} cells", self.tiles.len());
        Ok(FetchOutcome::Applied {
            cells: self.tiles.len(),
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn last_viewport(&self) -> Option<&Viewport> {
        self.last_viewport.as_ref()
    }

    pub fn leaderboard(&self, cell_id: &CellId) -> Option<&CellLeaderboard> {
        self.tiles.get(cell_id).map(|t| &t.leaderboard)
    }

    pub fn tile(&self, cell_id: &CellId) -> Option<&CellTile> {
        self.tiles.get(cell_id)
    }

    pub fn tiles(&self) -> impl Iterator<Item = &CellTile> {
        self.tiles.values()
    }

    /// Cached cell ids, sorted.
    pub fn cell_ids(&self) -> Vec<CellId> {
        let mut ids: Vec<CellId> = self.tiles.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Cached cells whose envelope intersects `bounds`, sorted.
    pub fn cells_in_bounds(&self, bounds: &Bounds) -> Vec<CellId> {
        let search = AABB::from_corners(
            [bounds.min_lng, bounds.min_lat],
            [bounds.max_lng, bounds.max_lat],
        );
        let mut ids: Vec<CellId> = self
            .spatial_index
            .locate_in_envelope_intersecting(&search)
            .map(|e| e.cell_id)
            .collect();
        ids.sort();
        ids
    }

    /// The cached cell containing `point`, if any.
    pub fn cell_at(&self, point: GpsPoint) -> Option<&CellTile> {
        let cell = index_of(point, self.resolution).ok()?;
        self.tiles.get(&cell)
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
        self.spatial_index = RTree::new();
        self.last_viewport = None;
    }
}
