use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_sqs::Client as SqsClient;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use reqwest::Client;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::constants::{
    AUX_TIMESTAMP_LOOKBACK_DAYS, DUAL_POL_STALE_THRESHOLD_SECONDS, FEET_PER_KM, FEET_PER_METER,
    LEVEL_TAGS, MAX_BASE_DAY_LOOKBACK, MAX_BASE_KEYS_LOOKUP, MAX_PENDING_ATTEMPTS,
    MRMS_BASE_LEVEL_TAG, MRMS_BRIGHTBAND_BOTTOM_PRODUCT, MRMS_BRIGHTBAND_TOP_PRODUCT,
    MRMS_BUCKET_URL, MRMS_CONUS_PREFIX, MRMS_MODEL_FREEZING_HEIGHT_PRODUCT,
    MRMS_PRECIP_FLAG_PRODUCT, MRMS_PRODUCT_PREFIX, MRMS_RHOHV_PRODUCT_PREFIX, MRMS_RQI_PRODUCT,
    MRMS_SURFACE_TEMP_PRODUCT, MRMS_WETBULB_PRODUCT, MRMS_ZDR_PRODUCT_PREFIX, STORE_MIN_DBZ_TENTHS,
};
use crate::discovery::{extract_timestamp_from_key, find_recent_base_level_keys, list_keys_for_prefix};
use crate::grib::{
    normalize_temperature_field_to_celsius, parse_aux_grib_gzipped, parse_reflectivity_grib_gzipped,
};
use crate::http_client::fetch_bytes;
use crate::phase::{self, ColumnContext, VoxelInputs};
use crate::storage::persist_snapshot;
use crate::types::{
    AppState, GridDef, LevelBounds, ParsedAuxField, ParsedReflectivityField, PendingIngest,
    PhaseCounters, PhaseDebugMetadata, ScanSnapshot, StoredVoxel,
};
use crate::utils::{parse_timestamp_utc, round_u16, to_lon360};

pub async fn spawn_background_workers(state: AppState) -> Result<()> {
    let worker_state = state.clone();
    tokio::spawn(async move {
        ingest_scheduler_loop(worker_state).await;
    });

    let bootstrap_state = state.clone();
    tokio::spawn(async move {
        bootstrap_loop(bootstrap_state).await;
    });

    if let Some(queue_url) = state.cfg.sqs_queue_url.clone() {
        let sqs_state = state.clone();
        tokio::spawn(async move {
            if let Err(error) = sqs_loop(sqs_state, &queue_url).await {
                error!("SQS loop exited: {error:#}");
            }
        });
    } else {
        warn!("RUNTIME_MRMS_SQS_QUEUE_URL is not set; relying only on periodic S3 bootstrap polling.");
    }

    Ok(())
}

async fn sqs_loop(state: AppState, queue_url: &str) -> Result<()> {
    info!("Starting SQS loop for {queue_url}");
    let shared_config = aws_config::defaults(BehaviorVersion::latest())
        .region(aws_config::Region::new(state.cfg.aws_region.clone()))
        .load()
        .await;
    let sqs_client = SqsClient::new(&shared_config);

    let base_key_regex =
        Regex::new(r#"MergedReflectivityQC_00\.50[^\s"']*_(\d{8}-\d{6})\.grib2\.gz"#)
            .context("Failed to compile base key regex")?;

    loop {
        let receive_result = sqs_client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(10)
            .wait_time_seconds(20)
            .visibility_timeout(90)
            .send()
            .await;

        let response = match receive_result {
            Ok(response) => response,
            Err(error) => {
                warn!("SQS receive_message failed: {error}");
                sleep(state.cfg.sqs_poll_delay).await;
                continue;
            }
        };

        let messages = response.messages.unwrap_or_default();
        if messages.is_empty() {
            continue;
        }

        for message in messages {
            let mut extracted_timestamps = Vec::new();
            if let Some(body) = message.body() {
                extracted_timestamps = extract_timestamps_from_sqs_body(body, &base_key_regex);
            }

            for timestamp in extracted_timestamps {
                enqueue_timestamp(&state, &timestamp).await;
            }

            if let Some(receipt_handle) = message.receipt_handle() {
                if let Err(error) = sqs_client
                    .delete_message()
                    .queue_url(queue_url)
                    .receipt_handle(receipt_handle)
                    .send()
                    .await
                {
                    warn!("Failed to delete SQS message: {error}");
                }
            }
        }
    }
}

fn extract_timestamps_from_sqs_body(body: &str, base_key_regex: &Regex) -> Vec<String> {
    let mut candidates = HashSet::new();

    for captures in base_key_regex.captures_iter(body) {
        if let Some(timestamp) = captures.get(1) {
            candidates.insert(timestamp.as_str().to_string());
        }
    }

    let parsed = serde_json::from_str::<Value>(body);
    if let Ok(value) = parsed {
        collect_json_strings(&value, &mut candidates, base_key_regex);
        if let Some(message_value) = value.get("Message") {
            if let Some(message_str) = message_value.as_str() {
                if let Ok(inner_json) = serde_json::from_str::<Value>(message_str) {
                    collect_json_strings(&inner_json, &mut candidates, base_key_regex);
                }
            }
        }
    }

    let mut sorted: Vec<String> = candidates.into_iter().collect();
    sorted.sort();
    sorted
}

fn collect_json_strings(value: &Value, candidates: &mut HashSet<String>, base_key_regex: &Regex) {
    match value {
        Value::String(text) => {
            let decoded = urlencoding::decode(text)
                .map(|value| value.to_string())
                .unwrap_or_else(|_| text.clone());
            for target in [text.as_str(), decoded.as_str()] {
                for captures in base_key_regex.captures_iter(target) {
                    if let Some(timestamp) = captures.get(1) {
                        candidates.insert(timestamp.as_str().to_string());
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_json_strings(item, candidates, base_key_regex);
            }
        }
        Value::Object(items) => {
            for (_key, item) in items {
                collect_json_strings(item, candidates, base_key_regex);
            }
        }
        _ => {}
    }
}

async fn bootstrap_loop(state: AppState) {
    loop {
        if let Err(error) = enqueue_latest_from_s3(&state).await {
            warn!("Periodic S3 bootstrap enqueue failed: {error:#}");
        }
        sleep(state.cfg.bootstrap_interval).await;
    }
}

pub async fn enqueue_latest_from_s3(state: &AppState) -> Result<()> {
    let now = Utc::now();
    let base_keys = find_recent_base_level_keys(&state.http, now, MAX_BASE_KEYS_LOOKUP).await?;
    for key in base_keys {
        if let Some(timestamp) = extract_timestamp_from_key(&key) {
            enqueue_timestamp(state, &timestamp).await;
        }
    }
    Ok(())
}

async fn enqueue_timestamp(state: &AppState, timestamp: &str) {
    let latest_timestamp = state
        .latest
        .read()
        .await
        .as_ref()
        .map(|scan| scan.timestamp.clone());
    if let Some(latest) = latest_timestamp {
        if timestamp <= latest.as_str() {
            return;
        }
    }

    {
        let recent = state.recent_timestamps.lock().await;
        if recent.contains(timestamp) {
            return;
        }
    }

    let mut pending = state.pending.lock().await;
    let now = Instant::now();
    pending
        .entry(timestamp.to_string())
        .and_modify(|entry| {
            entry.next_attempt_at = now;
        })
        .or_insert(PendingIngest {
            attempts: 0,
            next_attempt_at: now,
            first_seen_at: now,
        });
}

async fn ingest_scheduler_loop(state: AppState) {
    loop {
        let candidate = {
            let now = Instant::now();
            let mut pending = state.pending.lock().await;

            let evicted: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.first_seen_at) > state.cfg.eviction_horizon)
                .map(|(timestamp, _)| timestamp.clone())
                .collect();
            for timestamp in evicted {
                pending.remove(&timestamp);
                warn!("Evicting pending MRMS scan {timestamp}: exceeded eviction horizon");
            }

            let mut selected: Option<(String, Instant)> = None;
            for (timestamp, entry) in pending.iter() {
                if entry.next_attempt_at <= now {
                    match &selected {
                        Some((current_timestamp, current_due_at))
                            if entry.next_attempt_at > *current_due_at
                                || (entry.next_attempt_at == *current_due_at
                                    && timestamp >= current_timestamp) => {}
                        _ => selected = Some((timestamp.clone(), entry.next_attempt_at)),
                    }
                }
            }

            selected.and_then(|(timestamp, _)| {
                let entry = pending.remove(&timestamp)?;
                Some((timestamp, entry))
            })
        };

        let Some((timestamp, pending_entry)) = candidate else {
            sleep(Duration::from_secs(2)).await;
            continue;
        };

        match ingest_timestamp(&state, &timestamp).await {
            Ok(scan) => {
                info!(
                    "Ingested MRMS scan {} with {} stored voxels (phase_mode={}, phase_detail={})",
                    scan.timestamp,
                    scan.voxels.len(),
                    scan.phase_debug.mode,
                    scan.phase_debug.detail,
                );

                if let Err(error) = persist_snapshot(&state.cfg, scan.clone()).await {
                    error!("Failed to persist scan {}: {error:#}", scan.timestamp);
                }

                {
                    let mut latest = state.latest.write().await;
                    let should_replace = match latest.as_ref() {
                        Some(current) => scan.timestamp >= current.timestamp,
                        None => true,
                    };
                    if should_replace {
                        *latest = Some(scan.clone());
                    }
                }

                {
                    let mut recent = state.recent_timestamps.lock().await;
                    recent.insert(scan.timestamp.clone());
                    if recent.len() > 512 {
                        if let Some(first) = recent.iter().next().cloned() {
                            recent.remove(&first);
                        }
                    }
                }

                {
                    let mut pending = state.pending.lock().await;
                    pending.retain(|timestamp, _| timestamp > &scan.timestamp);
                }
            }
            Err(error) => {
                warn!(
                    "Ingest attempt {} failed (attempt {}): {error:#}",
                    timestamp,
                    pending_entry.attempts + 1
                );

                if pending_entry.attempts + 1 < MAX_PENDING_ATTEMPTS {
                    let mut pending = state.pending.lock().await;
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

async fn ingest_timestamp(state: &AppState, timestamp: &str) -> Result<Arc<ScanSnapshot>> {
    let date_part = timestamp
        .split('-')
        .next()
        .ok_or_else(|| anyhow!("Invalid timestamp format: {timestamp}"))?;

    let mut futures = FuturesUnordered::new();
    for (level_idx, level_tag) in LEVEL_TAGS.iter().enumerate() {
        let http = state.http.clone();
        let level_tag = level_tag.to_string();
        let timestamp = timestamp.to_string();
        let date_part = date_part.to_string();
        futures.push(async move {
            let reflectivity_key =
                build_level_key(MRMS_PRODUCT_PREFIX, &level_tag, &date_part, &timestamp);
            let reflectivity_zipped =
                fetch_bytes(&http, &format!("{MRMS_BUCKET_URL}/{reflectivity_key}")).await?;
            let reflectivity = tokio::task::spawn_blocking(move || {
                parse_reflectivity_grib_gzipped(&reflectivity_zipped)
            })
            .await
            .context("Join error while parsing level GRIB")??;
            Ok::<_, anyhow::Error>((level_idx, level_tag, reflectivity))
        });
    }

    let mut parsed_levels: Vec<Option<(String, ParsedReflectivityField)>> =
        vec![None; LEVEL_TAGS.len()];
    while let Some(result) = futures.next().await {
        let (level_idx, level_tag, reflectivity) = result?;
        parsed_levels[level_idx] = Some((level_tag, reflectivity));
    }

    let mut levels = Vec::with_capacity(parsed_levels.len());
    for (idx, item) in parsed_levels.into_iter().enumerate() {
        let (level_tag, reflectivity) =
            item.ok_or_else(|| anyhow!("Missing parsed level {}", LEVEL_TAGS[idx]))?;
        levels.push((idx as u8, level_tag, reflectivity));
    }

    levels.sort_by_key(|(idx, _, _)| *idx);

    let base_grid = levels
        .first()
        .map(|(_, _, parsed)| parsed.grid.clone())
        .ok_or_else(|| anyhow!("No parsed MRMS levels"))?;

    for (_, tag, parsed) in levels.iter().skip(1) {
        if !is_same_grid(&parsed.grid, &base_grid) {
            bail!("MRMS grid mismatch for level {tag}");
        }
    }

    let mut zdr_bundle =
        fetch_dual_pol_bundle(&state.http, MRMS_ZDR_PRODUCT_PREFIX, timestamp).await;
    let mut rhohv_bundle =
        fetch_dual_pol_bundle(&state.http, MRMS_RHOHV_PRODUCT_PREFIX, timestamp).await;

    if zdr_bundle.fields_by_level.len() != LEVEL_TAGS.len() {
        zdr_bundle
            .fields_by_level
            .resize_with(LEVEL_TAGS.len(), || None);
    }
    if rhohv_bundle.fields_by_level.len() != LEVEL_TAGS.len() {
        rhohv_bundle
            .fields_by_level
            .resize_with(LEVEL_TAGS.len(), || None);
    }

    let zdr_coverage = zdr_bundle.available_level_count() as f64 / LEVEL_TAGS.len() as f64;
    let rhohv_coverage = rhohv_bundle.available_level_count() as f64 / LEVEL_TAGS.len() as f64;
    let dual_pol_stale = zdr_bundle
        .age_seconds
        .is_some_and(|age| age > DUAL_POL_STALE_THRESHOLD_SECONDS)
        || rhohv_bundle
            .age_seconds
            .is_some_and(|age| age > DUAL_POL_STALE_THRESHOLD_SECONDS);
    let dual_pol_below_coverage = zdr_coverage.min(rhohv_coverage) < state.cfg.aux_min_level_coverage;
    let dual_aux_fallback = dual_pol_stale || dual_pol_below_coverage;
    let dual_age_seconds = zdr_bundle.age_seconds.max(rhohv_bundle.age_seconds);

    let context = fetch_context_aux_bundle(&state.http, timestamp).await;

    let level_km: Vec<f64> = LEVEL_TAGS
        .iter()
        .map(|tag| tag.parse::<f64>().unwrap_or(0.0))
        .collect();
    let level_bounds = compute_level_bounds(&level_km);
    let column_mean_alt_ft = level_bounds
        .iter()
        .map(|bounds| (bounds.bottom_feet as f64 + bounds.top_feet as f64) / 2.0)
        .sum::<f64>()
        / level_bounds.len().max(1) as f64;

    let tile_size = state.cfg.tile_size.max(16);
    let tile_cols = ((base_grid.nx + tile_size as u32 - 1) / tile_size as u32) as u16;
    let tile_rows = ((base_grid.ny + tile_size as u32 - 1) / tile_size as u32) as u16;
    let tile_count = tile_cols as usize * tile_rows as usize;

    let row_lats: Vec<f64> = (0..base_grid.ny)
        .map(|row| base_grid.la1_deg + row as f64 * base_grid.lat_step_deg)
        .collect();
    let col_lons360: Vec<f64> = (0..base_grid.nx)
        .map(|col| to_lon360(base_grid.lo1_deg360 + col as f64 * base_grid.lon_step_deg))
        .collect();

    let mut all_voxels: Vec<StoredVoxel> = Vec::new();
    let mut columns: HashMap<(u16, u16), Vec<usize>> = HashMap::new();
    let mut per_level_voxel_counts = vec![0_u32; level_bounds.len()];
    let mut counters = PhaseCounters::default();

    for (level_idx, level_tag, parsed) in &levels {
        let level_index = *level_idx as usize;
        let Some(bounds) = level_bounds.get(level_index) else {
            continue;
        };
        let voxel_mid_feet = (bounds.bottom_feet as f64 + bounds.top_feet as f64) / 2.0;

        let zdr_values = validate_level_aux_values(
            zdr_bundle.fields_by_level[level_index].as_ref(),
            parsed,
            "ZDR",
            level_tag,
            timestamp,
        );
        let rhohv_values = validate_level_aux_values(
            rhohv_bundle.fields_by_level[level_index].as_ref(),
            parsed,
            "RhoHV",
            level_tag,
            timestamp,
        );

        for row in 0..parsed.grid.ny as usize {
            let lat_deg = row_lats[row];
            let row_offset = row * parsed.grid.nx as usize;

            for col in 0..parsed.grid.nx as usize {
                let value_idx = row_offset + col;
                let dbz_tenths = parsed.dbz_tenths[value_idx];
                if dbz_tenths < STORE_MIN_DBZ_TENTHS {
                    continue;
                }

                let lon_deg360 = col_lons360[col];

                let precip_code = sample_value(context.precip_flag.as_ref(), lat_deg, lon_deg360)
                    .map(|value| value.round() as i32);
                let freezing_level_ft =
                    sample_value(context.freezing_level.as_ref(), lat_deg, lon_deg360)
                        .map(|meters| meters as f64 * FEET_PER_METER);
                let wet_bulb_c =
                    sample_value(context.wet_bulb.as_ref(), lat_deg, lon_deg360).map(|v| v as f64);
                let surface_temp_c =
                    sample_value(context.surface_temp.as_ref(), lat_deg, lon_deg360).map(|v| v as f64);
                let bright_band_top_ft =
                    sample_value(context.brightband_top.as_ref(), lat_deg, lon_deg360)
                        .map(|meters| meters as f64 * FEET_PER_METER);
                let bright_band_bottom_ft =
                    sample_value(context.brightband_bottom.as_ref(), lat_deg, lon_deg360)
                        .map(|meters| meters as f64 * FEET_PER_METER);
                let rqi = sample_value(context.rqi.as_ref(), lat_deg, lon_deg360).map(|v| v as f64);

                if wet_bulb_c.is_some() {
                    counters.aux_wetbulb += 1;
                }
                if surface_temp_c.is_some() {
                    counters.aux_surface_temp += 1;
                }
                if bright_band_top_ft.is_some() && bright_band_bottom_ft.is_some() {
                    counters.aux_brightband_pair += 1;
                }
                if rqi.is_some() {
                    counters.aux_rqi += 1;
                }
                if precip_code.is_some()
                    || freezing_level_ft.is_some()
                    || wet_bulb_c.is_some()
                    || surface_temp_c.is_some()
                {
                    counters.aux_any += 1;
                }
                if dual_aux_fallback {
                    counters.aux_fallback += 1;
                }

                let column_context = ColumnContext {
                    precip_flag_code: precip_code,
                    freezing_level_ft,
                    wet_bulb_c,
                    surface_temp_c,
                    bright_band_top_ft,
                    bright_band_bottom_ft,
                    rqi,
                    column_mean_alt_ft,
                };

                let voxel_inputs = VoxelInputs {
                    alt_ft: voxel_mid_feet,
                    zdr_db: zdr_values.and_then(|values| values.get(value_idx).copied()),
                    rhohv: rhohv_values.and_then(|values| values.get(value_idx).copied()),
                    dual_age_seconds,
                    dual_aux_fallback,
                };

                let outcome = phase::resolve_thermo_phase(&voxel_inputs, &column_context);
                phase::accumulate_counters(&mut counters, &outcome);
                let surface_phase = phase::resolve_surface_phase(precip_code);

                let row_u16 = row as u16;
                let col_u16 = col as u16;

                let index = all_voxels.len();
                all_voxels.push(StoredVoxel {
                    row: row_u16,
                    col: col_u16,
                    level_idx: *level_idx,
                    thermo_phase: outcome.phase,
                    surface_phase,
                    dbz_tenths,
                });
                columns.entry((row_u16, col_u16)).or_default().push(index);
                per_level_voxel_counts[level_index] += 1;
            }
        }
    }

    for indices in columns.into_values() {
        if indices.len() < 2 {
            continue;
        }
        let mut ordered = indices.clone();
        ordered.sort_by_key(|&idx| all_voxels[idx].level_idx);
        let mut phases: Vec<Option<u8>> = ordered
            .iter()
            .map(|&idx| Some(all_voxels[idx].thermo_phase))
            .collect();
        let promoted = phase::apply_boundary_blend(&mut phases);
        if promoted > 0 {
            counters.mixed_edge_promoted_voxels += promoted;
            for (slot, &idx) in ordered.iter().enumerate() {
                if let Some(phase_value) = phases[slot] {
                    all_voxels[idx].thermo_phase = phase_value;
                }
            }
        }
    }

    let mut buckets: Vec<Vec<StoredVoxel>> = (0..tile_count).map(|_| Vec::new()).collect();
    for voxel in all_voxels {
        let tile_row = voxel.row as usize / tile_size as usize;
        let tile_col = voxel.col as usize / tile_size as usize;
        let tile_idx = tile_row * tile_cols as usize + tile_col;
        if tile_idx < buckets.len() {
            buckets[tile_idx].push(voxel);
        }
    }

    let mut tile_offsets = Vec::with_capacity(tile_count + 1);
    tile_offsets.push(0_u32);
    let mut voxels = Vec::new();
    for bucket in buckets {
        voxels.extend(bucket);
        tile_offsets.push(voxels.len() as u32);
    }

    let scan_time_ms = parse_timestamp_utc(timestamp)
        .map(|datetime| datetime.timestamp_millis())
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    let mode = if dual_aux_fallback {
        "thermo-primary+aux-fallback"
    } else if dual_age_seconds.is_some_and(|age| age > 0) && counters.dual_adjusted_voxels > 0 {
        "thermo-primary+stale-dual-correction"
    } else if counters.dual_adjusted_voxels > 0 {
        "thermo-primary+dual-correction"
    } else {
        "thermo-primary"
    };

    let detail = format!(
        "zdr_levels={}/{},rhohv_levels={}/{},zdr_age_s={},rhohv_age_s={},thermo_signal_voxels={},dual_adjusted_voxels={},dual_suppressed_voxels={},mixed_suppressed_voxels={},mixed_edge_promoted_voxels={},precip_snow_forced_voxels={},aux_wetbulb={},aux_surface_temp={},aux_brightband_pair={},aux_rqi={},aux_any={},aux_fallback={}",
        zdr_bundle.available_level_count(),
        LEVEL_TAGS.len(),
        rhohv_bundle.available_level_count(),
        LEVEL_TAGS.len(),
        format_optional_i64(zdr_bundle.age_seconds),
        format_optional_i64(rhohv_bundle.age_seconds),
        counters.thermo_signal_voxels,
        counters.dual_adjusted_voxels,
        counters.dual_suppressed_voxels,
        counters.mixed_suppressed_voxels,
        counters.mixed_edge_promoted_voxels,
        counters.precip_snow_forced_voxels,
        counters.aux_wetbulb,
        counters.aux_surface_temp,
        counters.aux_brightband_pair,
        counters.aux_rqi,
        counters.aux_any,
        counters.aux_fallback,
    );

    Ok(Arc::new(ScanSnapshot {
        timestamp: timestamp.to_string(),
        generated_at_ms: Utc::now().timestamp_millis(),
        scan_time_ms,
        grid: base_grid,
        tile_size,
        tile_cols,
        tile_rows,
        level_bounds,
        tile_offsets,
        voxels,
        per_level_voxel_counts,
        phase_debug: PhaseDebugMetadata {
            mode: mode.to_string(),
            detail,
            zdr_timestamp: zdr_bundle.selected_timestamp,
            rhohv_timestamp: rhohv_bundle.selected_timestamp,
            precip_flag_timestamp: context.precip_flag_timestamp,
            freezing_level_timestamp: context.freezing_level_timestamp,
            zdr_age_seconds: zdr_bundle.age_seconds,
            rhohv_age_seconds: rhohv_bundle.age_seconds,
            aux_fallback: dual_aux_fallback,
            counters,
        },
    }))
}

#[derive(Default)]
struct ContextAuxBundle {
    precip_flag: Option<ParsedAuxField>,
    precip_flag_timestamp: Option<String>,
    freezing_level: Option<ParsedAuxField>,
    freezing_level_timestamp: Option<String>,
    wet_bulb: Option<ParsedAuxField>,
    surface_temp: Option<ParsedAuxField>,
    brightband_top: Option<ParsedAuxField>,
    brightband_bottom: Option<ParsedAuxField>,
    rqi: Option<ParsedAuxField>,
}

struct DualPolBundle {
    selected_timestamp: Option<String>,
    age_seconds: Option<i64>,
    fields_by_level: Vec<Option<ParsedAuxField>>,
}

impl DualPolBundle {
    fn available_level_count(&self) -> usize {
        self.fields_by_level
            .iter()
            .filter(|field| field.is_some())
            .count()
    }
}

async fn fetch_dual_pol_bundle(
    http: &Client,
    product_prefix: &'static str,
    target_timestamp: &str,
) -> DualPolBundle {
    let target_date_part = match target_timestamp.split('-').next() {
        Some(value) => value,
        None => {
            warn!("Invalid timestamp for aux selection: {target_timestamp}");
            return DualPolBundle {
                selected_timestamp: None,
                age_seconds: None,
                fields_by_level: vec![None; LEVEL_TAGS.len()],
            };
        }
    };

    let mut selected_timestamp = Some(target_timestamp.to_string());
    let mut base_level_field: Option<ParsedAuxField> = match fetch_level_aux_field_at_timestamp(
        http,
        product_prefix,
        MRMS_BASE_LEVEL_TAG,
        target_date_part,
        target_timestamp,
    )
    .await
    {
        Ok(field) => Some(field),
        Err(error) => {
            warn!(
                "{product_prefix} exact aux unavailable at {target_timestamp}: {error:#}; searching latest available timestamp"
            );
            None
        }
    };

    if base_level_field.is_none() {
        selected_timestamp = find_latest_level_timestamp_at_or_before(
            http,
            product_prefix,
            MRMS_BASE_LEVEL_TAG,
            target_timestamp,
        )
        .await;
        if let Some(selected) = selected_timestamp.as_ref() {
            let date_part = match selected.split('-').next() {
                Some(value) => value,
                None => {
                    warn!(
                        "Invalid fallback aux timestamp for {product_prefix}: {selected}; skipping aux bundle"
                    );
                    return DualPolBundle {
                        selected_timestamp: None,
                        age_seconds: None,
                        fields_by_level: vec![None; LEVEL_TAGS.len()],
                    };
                }
            };
            base_level_field = fetch_level_aux_field_at_timestamp(
                http,
                product_prefix,
                MRMS_BASE_LEVEL_TAG,
                date_part,
                selected,
            )
            .await
            .map_err(|error| {
                warn!(
                    "{product_prefix} fallback aux fetch failed at {selected}: {error:#}; skipping aux bundle"
                );
                error
            })
            .ok();
        }
    }

    let Some(selected_timestamp_value) = selected_timestamp.clone() else {
        return DualPolBundle {
            selected_timestamp: None,
            age_seconds: None,
            fields_by_level: vec![None; LEVEL_TAGS.len()],
        };
    };

    let selected_date_part = match selected_timestamp_value.split('-').next() {
        Some(value) => value.to_string(),
        None => {
            warn!(
                "Invalid selected aux timestamp for {product_prefix}: {selected_timestamp_value}"
            );
            return DualPolBundle {
                selected_timestamp: None,
                age_seconds: None,
                fields_by_level: vec![None; LEVEL_TAGS.len()],
            };
        }
    };

    let mut fields_by_level = vec![None; LEVEL_TAGS.len()];
    let mut futures = FuturesUnordered::new();

    for (level_idx, level_tag) in LEVEL_TAGS.iter().enumerate() {
        if level_idx == 0 {
            fields_by_level[level_idx] = base_level_field.clone();
            continue;
        }

        let http = http.clone();
        let level_tag = level_tag.to_string();
        let product_prefix = product_prefix.to_string();
        let date_part = selected_date_part.clone();
        let selected_timestamp_value = selected_timestamp_value.clone();

        futures.push(async move {
            let field = fetch_level_aux_field_at_timestamp(
                &http,
                &product_prefix,
                &level_tag,
                &date_part,
                &selected_timestamp_value,
            )
            .await
            .map_err(|error| {
                warn!(
                    "{product_prefix} aux unavailable for level {level_tag} at {selected_timestamp_value}: {error:#}"
                );
                error
            })
            .ok();
            (level_idx, field)
        });
    }

    while let Some((level_idx, field)) = futures.next().await {
        fields_by_level[level_idx] = field;
    }

    DualPolBundle {
        selected_timestamp: Some(selected_timestamp_value.clone()),
        age_seconds: timestamp_age_seconds(target_timestamp, &selected_timestamp_value),
        fields_by_level,
    }
}

async fn fetch_context_aux_bundle(http: &Client, target_timestamp: &str) -> ContextAuxBundle {
    let precip = fetch_latest_aux_field_at_or_before(http, MRMS_PRECIP_FLAG_PRODUCT, target_timestamp).await;
    let freezing =
        fetch_latest_aux_field_at_or_before(http, MRMS_MODEL_FREEZING_HEIGHT_PRODUCT, target_timestamp)
            .await;
    let mut wet_bulb =
        fetch_latest_aux_field_at_or_before(http, MRMS_WETBULB_PRODUCT, target_timestamp).await;
    let mut surface_temp =
        fetch_latest_aux_field_at_or_before(http, MRMS_SURFACE_TEMP_PRODUCT, target_timestamp).await;
    let brightband_top =
        fetch_latest_aux_field_at_or_before(http, MRMS_BRIGHTBAND_TOP_PRODUCT, target_timestamp).await;
    let brightband_bottom = fetch_latest_aux_field_at_or_before(
        http,
        MRMS_BRIGHTBAND_BOTTOM_PRODUCT,
        target_timestamp,
    )
    .await;
    let rqi = fetch_latest_aux_field_at_or_before(http, MRMS_RQI_PRODUCT, target_timestamp).await;

    if let Some((_, field)) = wet_bulb.as_mut() {
        normalize_temperature_field_to_celsius(field);
    }
    if let Some((_, field)) = surface_temp.as_mut() {
        normalize_temperature_field_to_celsius(field);
    }

    ContextAuxBundle {
        precip_flag_timestamp: precip.as_ref().map(|(ts, _)| ts.clone()),
        precip_flag: precip.map(|(_, field)| field),
        freezing_level_timestamp: freezing.as_ref().map(|(ts, _)| ts.clone()),
        freezing_level: freezing.map(|(_, field)| field),
        wet_bulb: wet_bulb.map(|(_, field)| field),
        surface_temp: surface_temp.map(|(_, field)| field),
        brightband_top: brightband_top.map(|(_, field)| field),
        brightband_bottom: brightband_bottom.map(|(_, field)| field),
        rqi: rqi.map(|(_, field)| field),
    }
}

async fn fetch_latest_aux_field_at_or_before(
    http: &Client,
    product: &'static str,
    target_timestamp: &str,
) -> Option<(String, ParsedAuxField)> {
    let timestamp = find_latest_aux_timestamp_at_or_before(http, product, target_timestamp).await?;
    let date_part = timestamp.split('-').next()?;
    match fetch_aux_field_at_timestamp(http, product, date_part, &timestamp).await {
        Ok(field) => Some((timestamp, field)),
        Err(error) => {
            warn!(
                "Context aux fetch failed for {product} at {timestamp}: {error:#}; continuing without this field"
            );
            None
        }
    }
}

fn validate_level_aux_values<'a>(
    field: Option<&'a ParsedAuxField>,
    reflectivity: &ParsedReflectivityField,
    product_label: &str,
    level_tag: &str,
    timestamp: &str,
) -> Option<&'a [f32]> {
    let field = field?;
    if !is_same_grid(&field.grid, &reflectivity.grid) {
        warn!(
            "{product_label} aux grid mismatch for level {level_tag} at {timestamp}; dropping dual-pol evidence for affected voxels"
        );
        return None;
    }
    if field.values.len() != reflectivity.dbz_tenths.len() {
        warn!(
            "{product_label} aux point-count mismatch for level {level_tag} at {timestamp}: expected {}, got {}; dropping dual-pol evidence for affected voxels",
            reflectivity.dbz_tenths.len(),
            field.values.len()
        );
        return None;
    }
    Some(field.values.as_slice())
}

fn is_same_grid(left: &GridDef, right: &GridDef) -> bool {
    left.nx == right.nx
        && left.ny == right.ny
        && (left.la1_deg - right.la1_deg).abs() <= 1e-6
        && (left.lo1_deg360 - right.lo1_deg360).abs() <= 1e-6
        && (left.di_deg - right.di_deg).abs() <= 1e-6
        && (left.dj_deg - right.dj_deg).abs() <= 1e-6
}

fn compute_level_bounds(level_km: &[f64]) -> Vec<LevelBounds> {
    let mut bounds = Vec::with_capacity(level_km.len());

    for idx in 0..level_km.len() {
        let level = level_km[idx];
        let previous = if idx > 0 {
            Some(level_km[idx - 1])
        } else {
            None
        };
        let next = level_km.get(idx + 1).copied();

        let bottom_km = if let Some(prev) = previous {
            (prev + level) / 2.0
        } else {
            let next_level = next.unwrap_or(level + 0.5);
            (level - (next_level - level) / 2.0).max(0.0)
        };

        let top_km = if let Some(next_level) = next {
            (level + next_level) / 2.0
        } else {
            let prev_level = previous.unwrap_or(level - 0.5);
            level + (level - prev_level) / 2.0
        };

        bounds.push(LevelBounds {
            bottom_feet: round_u16(bottom_km * FEET_PER_KM),
            top_feet: round_u16(top_km * FEET_PER_KM),
        });
    }

    bounds
}

fn build_level_key(
    product_prefix: &str,
    level_tag: &str,
    date_part: &str,
    timestamp: &str,
) -> String {
    format!(
        "{MRMS_CONUS_PREFIX}/{product_prefix}_{level_tag}/{date_part}/MRMS_{product_prefix}_{level_tag}_{timestamp}.grib2.gz"
    )
}

async fn fetch_level_aux_field_at_timestamp(
    http: &Client,
    product_prefix: &str,
    level_tag: &str,
    date_part: &str,
    timestamp: &str,
) -> Result<ParsedAuxField> {
    let key = build_level_key(product_prefix, level_tag, date_part, timestamp);
    let url = format!("{MRMS_BUCKET_URL}/{key}");
    let zipped = fetch_bytes(http, &url).await?;
    let parsed = tokio::task::spawn_blocking(move || parse_aux_grib_gzipped(&zipped))
        .await
        .context("Join error while parsing aux GRIB")??;
    Ok(parsed)
}

fn build_aux_key(product: &str, date_part: &str, timestamp: &str) -> String {
    format!("{MRMS_CONUS_PREFIX}/{product}/{date_part}/MRMS_{product}_{timestamp}.grib2.gz")
}

async fn fetch_aux_field_at_timestamp(
    http: &Client,
    product: &str,
    date_part: &str,
    timestamp: &str,
) -> Result<ParsedAuxField> {
    let key = build_aux_key(product, date_part, timestamp);
    let url = format!("{MRMS_BUCKET_URL}/{key}");
    let zipped = fetch_bytes(http, &url).await?;
    let parsed = tokio::task::spawn_blocking(move || parse_aux_grib_gzipped(&zipped))
        .await
        .context("Join error while parsing context aux GRIB")??;
    Ok(parsed)
}

async fn find_latest_level_timestamp_at_or_before(
    http: &Client,
    product_prefix: &str,
    level_tag: &str,
    target_timestamp: &str,
) -> Option<String> {
    find_latest_timestamp_at_or_before(
        http,
        |day| format!("{MRMS_CONUS_PREFIX}/{product_prefix}_{level_tag}/{day}/"),
        target_timestamp,
    )
    .await
}

async fn find_latest_aux_timestamp_at_or_before(
    http: &Client,
    product: &str,
    target_timestamp: &str,
) -> Option<String> {
    find_latest_timestamp_at_or_before(
        http,
        |day| format!("{MRMS_CONUS_PREFIX}/{product}/{day}/"),
        target_timestamp,
    )
    .await
}

async fn find_latest_timestamp_at_or_before<F>(
    http: &Client,
    prefix_builder: F,
    target_timestamp: &str,
) -> Option<String>
where
    F: Fn(&str) -> String,
{
    let target_dt = match parse_timestamp_utc(target_timestamp) {
        Some(value) => value,
        None => {
            warn!("Invalid target timestamp while searching fallback aux: {target_timestamp}");
            return None;
        }
    };

    let mut best: Option<String> = None;
    let max_day_lookback = AUX_TIMESTAMP_LOOKBACK_DAYS.max(MAX_BASE_DAY_LOOKBACK);
    for day_offset in 0..=max_day_lookback {
        let day = (target_dt - chrono::Duration::days(day_offset))
            .format("%Y%m%d")
            .to_string();
        let prefix = prefix_builder(&day);
        let keys = match list_keys_for_prefix(http, &prefix).await {
            Ok(value) => value,
            Err(error) => {
                warn!("Failed listing MRMS keys for prefix {prefix}: {error:#}");
                continue;
            }
        };

        for key in keys {
            let Some(timestamp) = extract_timestamp_from_key(&key) else {
                continue;
            };
            if timestamp.as_str() > target_timestamp {
                continue;
            }
            match &best {
                Some(current) if timestamp <= *current => {}
                _ => best = Some(timestamp),
            }
        }
    }

    best
}

fn timestamp_age_seconds(newer_timestamp: &str, older_timestamp: &str) -> Option<i64> {
    let newer = parse_timestamp_utc(newer_timestamp)?;
    let older = parse_timestamp_utc(older_timestamp)?;
    Some((newer - older).num_seconds().max(0))
}

fn sample_value(field: Option<&ParsedAuxField>, lat_deg: f64, lon_deg360: f64) -> Option<f32> {
    field.and_then(|field| sample_aux_field(field, lat_deg, lon_deg360))
}

fn sample_aux_field(field: &ParsedAuxField, lat_deg: f64, lon_deg360: f64) -> Option<f32> {
    if field.grid.lat_step_deg.abs() < f64::EPSILON || field.grid.lon_step_deg.abs() < f64::EPSILON
    {
        return None;
    }

    let row = ((lat_deg - field.grid.la1_deg) / field.grid.lat_step_deg).round() as i64;
    let col = ((lon_deg360 - field.grid.lo1_deg360) / field.grid.lon_step_deg).round() as i64;
    if row < 0 || col < 0 {
        return None;
    }

    let row_u = row as u32;
    let col_u = col as u32;
    if row_u >= field.grid.ny || col_u >= field.grid.nx {
        return None;
    }

    let index = row_u as usize * field.grid.nx as usize + col_u as usize;
    field.values.get(index).copied()
}

fn format_optional_i64(value: Option<i64>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_pol_keys_share_same_timestamp_and_level_as_reflectivity() {
        let date = "20260212";
        let timestamp = "20260212-123456";
        let level = "03.00";
        let suffix = format!("_{level}_{timestamp}.grib2.gz");

        let reflectivity = build_level_key(MRMS_PRODUCT_PREFIX, level, date, timestamp);
        let zdr = build_level_key(MRMS_ZDR_PRODUCT_PREFIX, level, date, timestamp);
        let rhohv = build_level_key(MRMS_RHOHV_PRODUCT_PREFIX, level, date, timestamp);

        assert!(reflectivity.ends_with(&suffix));
        assert!(zdr.ends_with(&suffix));
        assert!(rhohv.ends_with(&suffix));
    }

    #[test]
    fn compute_level_bounds_are_monotonic_and_nonoverlapping() {
        let level_km: Vec<f64> = LEVEL_TAGS.iter().map(|tag| tag.parse().unwrap()).collect();
        let bounds = compute_level_bounds(&level_km);
        for window in bounds.windows(2) {
            assert!(window[0].bottom_feet < window[0].top_feet);
            assert!(window[0].top_feet <= window[1].bottom_feet + 1);
        }
    }

    #[test]
    fn timestamp_age_seconds_is_nonnegative_for_past_timestamps() {
        assert_eq!(
            timestamp_age_seconds("20260212-123456", "20260212-123000"),
            Some(456)
        );
    }
}
