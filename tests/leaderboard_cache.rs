//! Region leaderboard cache driven through the HTTP client against a local
//! responder.

#![cfg(feature = "http")]

use std::collections::HashSet;

use stridewars_core::{
    index_of, neighbors_within_radius, CellId, FetchOutcome, GpsPoint, RegionLeaderboardCache,
    TerritoryClient, TerritoryConfig, TerritoryError, Viewport,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Answer each connection with the next body; count the requests served.
async fn responder(bodies: Vec<(u16, String)>) -> (String, JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut served = 0;
        for (status, body) in bodies {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                read += n;
                if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            served += 1;
        }
        served
    });

    (format!("http://{}/api/v1", addr), handle)
}

fn envelope(cells: &[(CellId, &[(&str, &str, f64)])]) -> String {
    let leaderboards: Vec<serde_json::Value> = cells
        .iter()
        .map(|(cell, users)| {
            serde_json::json!({
                "id": format!("lb-{}", cell),
                "h3_index": cell.to_string(),
                "top_users": users
                    .iter()
                    .map(|(id, name, score)| serde_json::json!({
                        "user_id": id,
                        "user_name": name,
                        "score": score,
                    }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    serde_json::json!({"success": true, "data": {"leaderboards": leaderboards}}).to_string()
}

fn setup(base: &str) -> (TerritoryConfig, TerritoryClient, RegionLeaderboardCache) {
    let config = TerritoryConfig {
        api_base_url: base.to_string(),
        request_timeout_secs: 5,
        ..Default::default()
    };
    let client = TerritoryClient::new(&config).unwrap();
    let cache = RegionLeaderboardCache::new(&config).unwrap();
    (config, client, cache)
}

#[tokio::test]
async fn test_disjoint_viewports_replace_cache() {
    let resolution = TerritoryConfig::default().resolution().unwrap();
    let warsaw = index_of(GpsPoint::new(52.2297, 21.0122), resolution).unwrap();
    let krakow = index_of(GpsPoint::new(50.0647, 19.9450), resolution).unwrap();
    let warsaw_ring: Vec<CellId> = {
        let mut cells: Vec<CellId> = neighbors_within_radius(warsaw.center(), 300.0, resolution)
            .unwrap()
            .into_iter()
            .collect();
        cells.sort();
        cells
    };

    let first: Vec<(CellId, &[(&str, &str, f64)])> = warsaw_ring
        .iter()
        .map(|c| (*c, &[("u1", "Alice", 4.0)][..]))
        .collect();
    let second = envelope(&[(krakow, &[("u2", "Bob", 1.0), ("u3", "Cy", 9.0)][..])]);
    let (base, server) = responder(vec![(200, envelope(&first)), (200, second)]).await;
    let (_, client, mut cache) = setup(&base);

    let over_warsaw = Viewport::new(52.2297, 21.0122, 0.02, 0.02);
    let outcome = cache.refresh(&over_warsaw, &client).await.unwrap();
    assert_eq!(
        outcome,
        FetchOutcome::Applied {
            cells: warsaw_ring.len()
        }
    );
    assert_eq!(cache.cell_ids(), warsaw_ring);

    let over_krakow = Viewport::new(50.0647, 19.9450, 0.02, 0.02);
    cache.refresh(&over_krakow, &client).await.unwrap();

    let keys: HashSet<CellId> = cache.cell_ids().into_iter().collect();
    assert_eq!(keys, HashSet::from([krakow]));
    let board = cache.leaderboard(&krakow).unwrap();
    assert_eq!(board.leader().unwrap().display_name(), "Cy");
    assert_eq!(server.await.unwrap(), 2);
}

#[tokio::test]
async fn test_failed_fetch_keeps_previous_cells() {
    let resolution = TerritoryConfig::default().resolution().unwrap();
    let cell = index_of(GpsPoint::new(52.2297, 21.0122), resolution).unwrap();
    let (base, _server) = responder(vec![
        (200, envelope(&[(cell, &[("u1", "Alice", 2.0)][..])])),
        (500, r#"{"success":false,"error":"database unavailable"}"#.to_string()),
    ])
    .await;
    let (_, client, mut cache) = setup(&base);

    cache
        .refresh(&Viewport::new(52.2297, 21.0122, 0.02, 0.02), &client)
        .await
        .unwrap();

    let err = cache
        .refresh(&Viewport::new(52.30, 21.0122, 0.02, 0.02), &client)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        TerritoryError::Http {
            message: "database unavailable".to_string(),
            status_code: Some(500),
        }
    );
    assert_eq!(cache.cell_ids(), vec![cell]);
    assert!(cache.cell_at(GpsPoint::new(52.2297, 21.0122)).is_some());
}

#[tokio::test]
async fn test_small_pans_do_not_hit_the_network() {
    let (base, server) = responder(vec![(200, envelope(&[]))]).await;
    let (_, client, mut cache) = setup(&base);

    let mut viewport = Viewport::new(52.2297, 21.0122, 0.02, 0.02);
    assert_eq!(
        cache.refresh(&viewport, &client).await.unwrap(),
        FetchOutcome::Applied { cells: 0 }
    );

    // A drag gesture: many tiny moves, all below 1/10 of the span
    for _ in 0..20 {
        viewport.center_lat += 0.00005;
        assert_eq!(
            cache.refresh(&viewport, &client).await.unwrap(),
            FetchOutcome::Suppressed
        );
    }
    assert_eq!(server.await.unwrap(), 1);
}
