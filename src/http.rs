//! HTTP client for the StrideWars backend.
//!
//! Implements the two network collaborators of the core:
//! - [`LeaderboardQuery`]: `GET /hexleaderboards/bbox`
//! - [`ActivityIngestion`]: `POST /activity/create`
//!
//! plus the profile endpoints (`/activity/stats`, `/leaderboard/global`).
//!
//! Every response is treated the same way: a non-2xx status is an
//! [`Http`](TerritoryError::Http) error, a body that does not decode is a
//! [`Decode`](TerritoryError::Decode) error. A 429 is retried with
//! exponential backoff.

use std::time::Duration;

use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cells::CellId;
use crate::leaderboard::{CellLeaderboard, LeaderboardEntry, LeaderboardQuery};
use crate::submission::{ActivityIngestion, ActivityPayload};
use crate::{Bounds, OptionExt, Result, TerritoryConfig, TerritoryError};

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 500;
const MAX_IDLE_CONNECTIONS: usize = 4;

/// Profile statistics for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserActivityStats {
    pub hexes_visited: i64,
    pub activities_recorded: i64,
    /// Meters
    pub distance_covered: f64,
    /// Activities per week, oldest first
    pub weekly_activities: Vec<i64>,
}

/// One row of the global leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalLeaderboardEntry {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    /// Number of cells the user currently leads
    #[serde(default)]
    pub top_count: i64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BboxResponse {
    leaderboards: Option<Vec<HexLeaderboardWire>>,
}

#[derive(Debug, Deserialize)]
struct HexLeaderboardWire {
    h3_index: CellId,
    top_users: Option<Vec<LeaderboardEntry>>,
}

/// Client for the leaderboard and activity endpoints.
#[derive(Clone)]
pub struct TerritoryClient {
    client: Client,
    config: TerritoryConfig,
    access_token: Option<String>,
}

impl TerritoryClient {
    pub fn new(config: &TerritoryConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TerritoryError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                status_code: None,
            })?;

        Ok(Self {
            client,
            config: config.clone(),
            access_token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn config(&self) -> &TerritoryConfig {
        &self.config
    }

    /// Leaderboards of every cell inside `bounds`.
    pub async fn fetch_leaderboards(&self, bounds: &Bounds) -> Result<Vec<CellLeaderboard>> {
        let url = self.config.endpoint("hexleaderboards/bbox");
        let query = [
            ("min_lat", bounds.min_lat),
            ("min_lng", bounds.min_lng),
            ("max_lat", bounds.max_lat),
            ("max_lng", bounds.max_lng),
        ];

        let data: Option<BboxResponse> = self
            .send_json(|| self.client.get(&url).query(&query))
            .await?;

        let leaderboards: Vec<CellLeaderboard> = data
            .ok_or_decode("leaderboard response has no data")?
            .leaderboards
            .unwrap_or_default()
            .into_iter()
            .map(|lb| CellLeaderboard::new(lb.h3_index, lb.top_users.unwrap_or_default()))
            .collect();

        debug!(
            "[TerritoryClient] {} cell leaderboards in bbox",
            leaderboards.len()
        );
        Ok(leaderboards)
    }

    /// Record one finished activity.
    pub async fn create_activity(&self, payload: &ActivityPayload) -> Result<()> {
        let url = self.config.endpoint("activity/create");
        let _: Option<Value> = self
            .send_json(|| self.client.post(&url).json(payload))
            .await?;
        info!(
            "[TerritoryClient] Activity created ({} cells)",
            payload.h3_indexes.len()
        );
        Ok(())
    }

    pub async fn fetch_user_stats(&self, user_id: &str) -> Result<UserActivityStats> {
        let url = self.config.endpoint("activity/stats");
        let stats: Option<UserActivityStats> = self
            .send_json(|| self.client.get(&url).query(&[("user_id", user_id)]))
            .await?;
        stats.ok_or_decode("stats response has no data")
    }

    pub async fn fetch_global_leaderboard(&self) -> Result<Vec<GlobalLeaderboardEntry>> {
        let url = self.config.endpoint("leaderboard/global");
        let entries: Option<Vec<GlobalLeaderboardEntry>> =
            self.send_json(|| self.client.get(&url)).await?;
        Ok(entries.unwrap_or_default())
    }

    /// Send a request, retrying on 429, and decode the `data` payload.
    async fn send_json<T, F>(&self, build: F) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;

        loop {
            let mut request = build();
            if let Some(token) = &self.access_token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await.map_err(transport_error)?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS && retries < MAX_RETRIES {
                retries += 1;
                let backoff = Duration::from_millis(BASE_BACKOFF_MS << (retries - 1));
                warn!(
                    "[TerritoryClient] 429 for {}, retry {} after {:?}",
                    response.url().path(),
                    retries,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            let body = response.bytes().await.map_err(transport_error)?;
            return decode_body(status, &body);
        }
    }
}

impl LeaderboardQuery for TerritoryClient {
    async fn query_bbox(&self, bounds: Bounds) -> Result<Vec<CellLeaderboard>> {
        self.fetch_leaderboards(&bounds).await
    }
}

impl ActivityIngestion for TerritoryClient {
    async fn ingest(&self, payload: &ActivityPayload) -> Result<()> {
        self.create_activity(payload).await
    }
}

fn transport_error(e: reqwest::Error) -> TerritoryError {
    TerritoryError::Http {
        message: e.to_string(),
        status_code: e.status().map(|s| s.as_u16()),
    }
}

/// Decode a response body.
///
/// Bodies wrapped in `{success, data, error}` are unwrapped; anything else
/// is decoded as the payload itself.
fn decode_body<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<Option<T>> {
    let parsed: Option<Value> = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice(body).ok()
    };

    let envelope = parsed
        .as_ref()
        .filter(|v| v.get("success").is_some())
        .and_then(|v| Envelope::deserialize(v).ok());

    if !status.is_success() {
        let message = envelope
            .and_then(|e| e.error)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| "request failed".to_string());
        return Err(TerritoryError::Http {
            message,
            status_code: Some(status.as_u16()),
        });
    }

    let payload = match (envelope, parsed) {
        (Some(envelope), _) => {
            if !envelope.success {
                return Err(TerritoryError::Http {
                    message: envelope
                        .error
                        .unwrap_or_else(|| "request rejected".to_string()),
                    status_code: Some(status.as_u16()),
                });
            }
            envelope.data
        }
        (None, Some(value)) => Some(value),
        (None, None) if body.iter().all(u8::is_ascii_whitespace) => None,
        (None, None) => {
            return Err(TerritoryError::Decode {
                message: "response body is not valid JSON".to_string(),
            })
        }
    };

    match payload {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
    }
}
