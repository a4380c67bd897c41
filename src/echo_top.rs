use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::constants::{ECHO_TOP_PRODUCTS, FEET_PER_METER, MAX_PENDING_ATTEMPTS, MRMS_CONUS_PREFIX};
use crate::discovery::{extract_timestamp_from_key, list_keys_for_prefix};
use crate::grib::parse_aux_grib_gzipped;
use crate::http_client::fetch_bytes;
use crate::storage::persist_echo_top_snapshot;
use crate::types::{AppState, EchoTopDebugMetadata, EchoTopSnapshot, PendingIngest, StoredEchoTop};
use crate::utils::{parse_timestamp_utc, round_u16};

const MRMS_BUCKET_URL: &str = "https://noaa-mrms-pds.s3.amazonaws.com";

pub async fn spawn_echo_top_workers(state: AppState) -> Result<()> {
    let scheduler_state = state.clone();
    tokio::spawn(async move {
        echo_top_scheduler_loop(scheduler_state).await;
    });

    let bootstrap_state = state;
    tokio::spawn(async move {
        echo_top_bootstrap_loop(bootstrap_state).await;
    });

    Ok(())
}

async fn echo_top_bootstrap_loop(state: AppState) {
    loop {
        if let Err(error) = enqueue_latest_echo_top(&state).await {
            warn!("Periodic echo-top bootstrap enqueue failed: {error:#}");
        }
        sleep(state.cfg.bootstrap_interval).await;
    }
}

pub async fn enqueue_latest_echo_top(state: &AppState) -> Result<()> {
    let (product, _) = ECHO_TOP_PRODUCTS[0];
    let now = Utc::now();
    let day = now.format("%Y%m%d").to_string();
    let prefix = format!("{MRMS_CONUS_PREFIX}/{product}/{day}/");
    let keys = list_keys_for_prefix(&state.http, &prefix).await?;

    let mut timestamps: Vec<String> = keys
        .iter()
        .filter_map(|key| extract_timestamp_from_key(key))
        .collect();
    timestamps.sort();
    timestamps.reverse();

    if let Some(latest) = timestamps.into_iter().next() {
        enqueue_echo_top_timestamp(state, &latest).await;
    }

    Ok(())
}

async fn enqueue_echo_top_timestamp(state: &AppState, timestamp: &str) {
    let latest_timestamp = state
        .echo_tops
        .read()
        .await
        .as_ref()
        .map(|snapshot| snapshot.timestamp.clone());
    if let Some(latest) = latest_timestamp {
        if timestamp <= latest.as_str() {
            return;
        }
    }

    let mut pending = state.echo_top_pending.lock().await;
    let now = Instant::now();
    pending
        .entry(timestamp.to_string())
        .and_modify(|entry| entry.next_attempt_at = now)
        .or_insert(PendingIngest {
            attempts: 0,
            next_attempt_at: now,
            first_seen_at: now,
        });
}

async fn echo_top_scheduler_loop(state: AppState) {
    loop {
        let candidate = {
            let now = Instant::now();
            let mut pending = state.echo_top_pending.lock().await;

            let evicted: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| {
                    now.duration_since(entry.first_seen_at) > state.cfg.eviction_horizon
                })
                .map(|(timestamp, _)| timestamp.clone())
                .collect();
            for timestamp in evicted {
                pending.remove(&timestamp);
                warn!("Evicting pending echo-top scan {timestamp}: exceeded eviction horizon");
            }

            let mut selected: Option<String> = None;
            for (timestamp, entry) in pending.iter() {
                if entry.next_attempt_at <= now
                    && selected.as_ref().map_or(true, |current| timestamp >= current)
                {
                    selected = Some(timestamp.clone());
                }
            }

            selected.and_then(|timestamp| {
                let entry = pending.remove(&timestamp)?;
                Some((timestamp, entry))
            })
        };

        let Some((timestamp, pending_entry)) = candidate else {
            sleep(Duration::from_secs(2)).await;
            continue;
        };

        match ingest_echo_top_timestamp(&state, &timestamp).await {
            Ok(snapshot) => {
                info!(
                    "Ingested echo-top scan {} with {} cells",
                    snapshot.timestamp,
                    snapshot.cells.len()
                );

                if let Err(error) = persist_echo_top_snapshot(&state.cfg, snapshot.clone()).await {
                    error!("Failed to persist echo-top scan {}: {error:#}", snapshot.timestamp);
                }

                let mut latest = state.echo_tops.write().await;
                let should_replace = match latest.as_ref() {
                    Some(current) => snapshot.timestamp >= current.timestamp,
                    None => true,
                };
                if should_replace {
                    *latest = Some(snapshot);
                }
            }
            Err(error) => {
                warn!(
                    "Echo-top ingest attempt {} failed (attempt {}): {error:#}",
                    timestamp,
                    pending_entry.attempts + 1
                );
                if pending_entry.attempts + 1 < MAX_PENDING_ATTEMPTS {
                    let mut pending = state.echo_top_pending.lock().await;
                    pending.insert(
                        timestamp,
                        PendingIngest {
                            attempts: pending_entry.attempts + 1,
                            next_attempt_at: Instant::now() + state.cfg.pending_retry_delay,
                            first_seen_at: pending_entry.first_seen_at,
                        },
                    );
                }
            }
        }
    }
}

async fn ingest_echo_top_timestamp(state: &AppState, timestamp: &str) -> Result<Arc<EchoTopSnapshot>> {
    let date_part = timestamp
        .split('-')
        .next()
        .ok_or_else(|| anyhow!("Invalid timestamp format: {timestamp}"))?;

    let mut futures = FuturesUnordered::new();
    for (product, slot) in ECHO_TOP_PRODUCTS {
        let http = state.http.clone();
        let date_part = date_part.to_string();
        let timestamp = timestamp.to_string();
        futures.push(async move {
            let key = format!(
                "{MRMS_CONUS_PREFIX}/{product}/{date_part}/MRMS_{product}_{timestamp}.grib2.gz"
            );
            let url = format!("{MRMS_BUCKET_URL}/{key}");
            let zipped = fetch_bytes(&http, &url).await?;
            let field = tokio::task::spawn_blocking(move || parse_aux_grib_gzipped(&zipped))
                .await
                .context("Join error while parsing echo-top GRIB")??;
            Ok::<_, anyhow::Error>((slot, field))
        });
    }

    let mut fields: Vec<Option<crate::types::ParsedAuxField>> = vec![None, None, None, None];
    while let Some(result) = futures.next().await {
        let (slot, field) = result?;
        fields[slot] = Some(field);
    }

    let Some(grid) = fields.iter().flatten().next().map(|field| field.grid.clone()) else {
        return Err(anyhow!("No echo-top products available for {timestamp}"));
    };

    let mut cells = Vec::new();
    let mut max18 = 0_u16;
    let mut max30 = 0_u16;
    let mut max50 = 0_u16;
    let mut max60 = 0_u16;

    for row in 0..grid.ny as usize {
        for col in 0..grid.nx as usize {
            let idx = row * grid.nx as usize + col;
            let top18 = feet_at(&fields[0], idx);
            let top30 = feet_at(&fields[1], idx);
            let top50 = feet_at(&fields[2], idx);
            let top60 = feet_at(&fields[3], idx);
            if top18 == 0 && top30 == 0 && top50 == 0 && top60 == 0 {
                continue;
            }
            max18 = max18.max(top18);
            max30 = max30.max(top30);
            max50 = max50.max(top50);
            max60 = max60.max(top60);
            cells.push(StoredEchoTop {
                row: row as u16,
                col: col as u16,
                top18_feet: top18,
                top30_feet: top30,
                top50_feet: top50,
                top60_feet: top60,
            });
        }
    }

    let scan_time_ms = parse_timestamp_utc(timestamp)
        .map(|datetime| datetime.timestamp_millis())
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    Ok(Arc::new(EchoTopSnapshot {
        timestamp: timestamp.to_string(),
        generated_at_ms: Utc::now().timestamp_millis(),
        scan_time_ms,
        grid,
        cells,
        debug: EchoTopDebugMetadata {
            top18_timestamp: fields[0].as_ref().map(|_| timestamp.to_string()),
            top30_timestamp: fields[1].as_ref().map(|_| timestamp.to_string()),
            top50_timestamp: fields[2].as_ref().map(|_| timestamp.to_string()),
            top60_timestamp: fields[3].as_ref().map(|_| timestamp.to_string()),
            max_top18_feet: fields[0].as_ref().map(|_| max18),
            max_top30_feet: fields[1].as_ref().map(|_| max30),
            max_top50_feet: fields[2].as_ref().map(|_| max50),
            max_top60_feet: fields[3].as_ref().map(|_| max60),
        },
    }))
}

fn feet_at(field: &Option<crate::types::ParsedAuxField>, idx: usize) -> u16 {
    field
        .as_ref()
        .and_then(|field| field.values.get(idx).copied())
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|meters| round_u16(meters as f64 * FEET_PER_METER))
        .unwrap_or(0)
}
