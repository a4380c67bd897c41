use crate::constants::{
    PHASE_DUAL_AUX_AGE_HORIZON_SECONDS, PHASE_DUAL_AUX_BASE_WEIGHT,
    PHASE_DUAL_AUX_FALLBACK_PENALTY, PHASE_DUAL_AUX_MIN_RQI_FACTOR, PHASE_MIXED,
    PHASE_MIXED_DEMOTE_MARGIN, PHASE_MIXED_DEMOTE_PENALTY, PHASE_RAIN, PHASE_RHOHV_HIGH_CONFIDENCE,
    PHASE_RHOHV_MAX_VALID, PHASE_RHOHV_MIN_VALID, PHASE_RHOHV_MIXED_MAX, PHASE_SNOW,
    PHASE_SURFACE_TEMP_COLD_C, PHASE_TIE_EPSILON, PHASE_TRANSITION_MIXED_BONUS,
    PHASE_TRANSITION_SPREAD, PHASE_WETBULB_RAIN_MIN_C, PHASE_WETBULB_SNOW_MAX_C,
    PHASE_ZDR_MAX_VALID_DB, PHASE_ZDR_MIN_VALID_DB, PHASE_ZDR_RAIN_MIN_DB, PHASE_ZDR_SNOW_MAX_DB,
};
use crate::types::PhaseCounters;

/// Per-voxel thermodynamic and dual-pol inputs that the resolver closes over.
#[derive(Clone, Copy, Debug, Default)]
pub struct VoxelInputs {
    pub alt_ft: f64,
    pub zdr_db: Option<f32>,
    pub rhohv: Option<f32>,
    pub dual_age_seconds: Option<i64>,
    pub dual_aux_fallback: bool,
}

/// Column-wide context shared by every voxel stacked above one grid cell.
#[derive(Clone, Copy, Debug, Default)]
pub struct ColumnContext {
    pub precip_flag_code: Option<i32>,
    pub freezing_level_ft: Option<f64>,
    pub wet_bulb_c: Option<f64>,
    pub surface_temp_c: Option<f64>,
    pub bright_band_top_ft: Option<f64>,
    pub bright_band_bottom_ft: Option<f64>,
    pub rqi: Option<f64>,
    pub column_mean_alt_ft: f64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ResolveOutcome {
    pub phase: u8,
    pub thermo_signal: bool,
    pub used_dual_evidence: bool,
    pub dual_suppressed: bool,
    pub mixed_suppressed: bool,
    pub mixed_edge_eligible: bool,
    pub precip_snow_forced: bool,
}

const FREEZING_TRANSITION_FEET: f64 = crate::constants::FREEZING_LEVEL_TRANSITION_FEET;

/// Maps a PrecipFlag code (see `6.2` of the external wire contract) to a baseline score bias.
/// Returns `(rain, mixed, snow)` additive contributions.
fn precip_flag_bias(code: i32) -> (f64, f64, f64) {
    match code {
        3 => (0.0, 0.0, 1.0),
        1 | 6 | 10 | 91 | 96 => (1.0, 0.0, 0.0),
        7 => (0.0, 1.0, 0.0),
        _ => (0.0, 0.0, 0.0),
    }
}

pub fn phase_from_precip_flag(code: i32) -> u8 {
    match code {
        3 => PHASE_SNOW,
        7 => PHASE_MIXED,
        _ => PHASE_RAIN,
    }
}

pub fn resolve_surface_phase(precip_flag_code: Option<i32>) -> u8 {
    match precip_flag_code {
        Some(code) if code != 0 && code != -3 => phase_from_precip_flag(code),
        _ => PHASE_RAIN,
    }
}

fn freezing_level_scores(alt_ft: f64, freezing_level_ft: f64) -> (f64, f64, f64) {
    let delta = alt_ft - freezing_level_ft;
    if delta > FREEZING_TRANSITION_FEET {
        (0.0, 0.0, 1.0)
    } else if delta < -FREEZING_TRANSITION_FEET {
        (1.0, 0.0, 0.0)
    } else {
        let frac = (1.0 - delta.abs() / FREEZING_TRANSITION_FEET).clamp(0.0, 1.0);
        (0.0, frac, 0.0)
    }
}

fn wet_bulb_scores(wet_bulb_c: f64) -> (f64, f64, f64) {
    if wet_bulb_c <= PHASE_WETBULB_SNOW_MAX_C {
        (0.0, 0.0, 1.0)
    } else if wet_bulb_c >= PHASE_WETBULB_RAIN_MIN_C {
        (1.0, 0.0, 0.0)
    } else {
        let span = PHASE_WETBULB_RAIN_MIN_C - PHASE_WETBULB_SNOW_MAX_C;
        let t = ((wet_bulb_c - PHASE_WETBULB_SNOW_MAX_C) / span).clamp(0.0, 1.0);
        let mixed_weight = 1.0 - (2.0 * t - 1.0).abs();
        (t * 0.5, mixed_weight * 0.5, (1.0 - t) * 0.5)
    }
}

fn bright_band_scores(alt_ft: f64, bottom_ft: f64, top_ft: f64) -> (f64, f64, f64) {
    if alt_ft < bottom_ft {
        (1.0, 0.0, 0.0)
    } else if alt_ft > top_ft {
        (0.0, 0.0, 1.0)
    } else {
        (0.0, 1.0, 0.0)
    }
}

fn sanitize_zdr(value: f32) -> Option<f32> {
    if !value.is_finite() || !(PHASE_ZDR_MIN_VALID_DB..=PHASE_ZDR_MAX_VALID_DB).contains(&value) {
        return None;
    }
    Some(value)
}

fn sanitize_rhohv(value: f32) -> Option<f32> {
    if !value.is_finite() || !(PHASE_RHOHV_MIN_VALID..=PHASE_RHOHV_MAX_VALID).contains(&value) {
        return None;
    }
    Some(value)
}

/// Step 2: dual-pol confidence evidence, not a direct phase assignment.
/// Returns `(evidence_rain, evidence_mixed, evidence_snow, suppressed_low_rhohv)`.
fn dual_pol_evidence(
    zdr_db: Option<f32>,
    rhohv: Option<f32>,
    above_freezing_level: bool,
) -> (f64, f64, f64, bool) {
    let zdr = zdr_db.and_then(sanitize_zdr);
    let rhohv = rhohv.and_then(sanitize_rhohv);

    if let (Some(zdr), Some(rhohv)) = (zdr, rhohv) {
        if zdr >= PHASE_ZDR_RAIN_MIN_DB && rhohv >= PHASE_RHOHV_HIGH_CONFIDENCE {
            return (1.0, 0.0, 0.0, false);
        }
        if zdr <= PHASE_ZDR_SNOW_MAX_DB && rhohv >= PHASE_RHOHV_HIGH_CONFIDENCE && above_freezing_level
        {
            return (0.0, 0.0, 1.0, false);
        }
    }

    if let Some(rhohv) = rhohv {
        if rhohv <= PHASE_RHOHV_MIXED_MAX {
            return (0.0, 0.5, 0.0, true);
        }
    }

    (0.0, 0.0, 0.0, false)
}

/// `§4.5.1` thermodynamic phase resolution, steps 1-4 and 6. Step 5 (boundary
/// blending) is a separate per-column post-pass; see [`apply_boundary_blend`].
pub fn resolve_thermo_phase(voxel: &VoxelInputs, column: &ColumnContext) -> ResolveOutcome {
    let mut s_rain = 0.0_f64;
    let mut s_mixed = 0.0_f64;
    let mut s_snow = 0.0_f64;
    let mut thermo_signal = false;

    if let Some(code) = column.precip_flag_code {
        let (r, m, s) = precip_flag_bias(code);
        s_rain += r;
        s_mixed += m;
        s_snow += s;
        if r + m + s > 0.0 {
            thermo_signal = true;
        }
    }

    let mut above_freezing_level = false;
    if let Some(freezing_level_ft) = column.freezing_level_ft {
        above_freezing_level = voxel.alt_ft > freezing_level_ft;
        let (r, m, s) = freezing_level_scores(voxel.alt_ft, freezing_level_ft);
        s_rain += r;
        s_mixed += m;
        s_snow += s;
        thermo_signal = true;
    }

    if let Some(wet_bulb_c) = column.wet_bulb_c {
        let (r, m, s) = wet_bulb_scores(wet_bulb_c);
        s_rain += r;
        s_mixed += m;
        s_snow += s;
        thermo_signal = true;
    }

    if let Some(surface_temp_c) = column.surface_temp_c {
        if surface_temp_c <= PHASE_SURFACE_TEMP_COLD_C {
            s_snow += 0.5;
            thermo_signal = true;
        }
    }

    if let (Some(bottom_ft), Some(top_ft)) =
        (column.bright_band_bottom_ft, column.bright_band_top_ft)
    {
        let (r, m, s) = bright_band_scores(voxel.alt_ft, bottom_ft, top_ft);
        s_rain += r;
        s_mixed += m;
        s_snow += s;
        thermo_signal = true;
    }

    let (evidence_rain, evidence_mixed, evidence_snow, dual_suppressed) =
        dual_pol_evidence(voxel.zdr_db, voxel.rhohv, above_freezing_level);
    let used_dual_evidence = evidence_rain + evidence_mixed + evidence_snow > 0.0;

    if used_dual_evidence {
        let rqi_factor = column.rqi.map(|rqi| rqi.max(PHASE_DUAL_AUX_MIN_RQI_FACTOR)).unwrap_or(1.0);
        let age_factor = voxel
            .dual_age_seconds
            .map(|age| 1.0 - (age as f64 / PHASE_DUAL_AUX_AGE_HORIZON_SECONDS).clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let mut weight_aux = PHASE_DUAL_AUX_BASE_WEIGHT * age_factor * rqi_factor;
        if voxel.dual_aux_fallback {
            weight_aux *= PHASE_DUAL_AUX_FALLBACK_PENALTY;
        }
        s_rain += weight_aux * evidence_rain;
        s_mixed += weight_aux * evidence_mixed;
        s_snow += weight_aux * evidence_snow;
    }

    let mut mixed_suppressed = false;
    if (s_rain - s_snow).abs() < PHASE_TRANSITION_SPREAD && s_rain.max(s_snow) > 0.0 {
        s_mixed += PHASE_TRANSITION_MIXED_BONUS;
    } else {
        let top_non_mixed = s_rain.max(s_snow);
        if s_mixed > top_non_mixed && s_mixed - top_non_mixed < PHASE_MIXED_DEMOTE_MARGIN {
            s_mixed -= PHASE_MIXED_DEMOTE_PENALTY;
            mixed_suppressed = true;
        }
    }

    let cold_column = column
        .freezing_level_ft
        .is_some_and(|freezing_level_ft| freezing_level_ft < column.column_mean_alt_ft);

    let mut phase = pick_top_score(s_rain, s_mixed, s_snow, cold_column);

    let mut precip_snow_forced = false;
    let frozen_context = column
        .freezing_level_ft
        .is_some_and(|freezing_level_ft| freezing_level_ft <= voxel.alt_ft)
        || column.wet_bulb_c.is_some_and(|wet_bulb_c| wet_bulb_c <= 0.0);
    if column.precip_flag_code == Some(3) && frozen_context {
        phase = PHASE_SNOW;
        precip_snow_forced = true;
    }

    ResolveOutcome {
        phase,
        thermo_signal,
        used_dual_evidence,
        dual_suppressed,
        mixed_suppressed,
        mixed_edge_eligible: thermo_signal && phase != PHASE_MIXED,
        precip_snow_forced,
    }
}

fn pick_top_score(s_rain: f64, s_mixed: f64, s_snow: f64, cold_column: bool) -> u8 {
    let mut ranked = [(PHASE_RAIN, s_rain), (PHASE_MIXED, s_mixed), (PHASE_SNOW, s_snow)];
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let (best_phase, best_score) = ranked[0];
    let tie_break_order: [u8; 3] = if cold_column {
        [PHASE_SNOW, PHASE_MIXED, PHASE_RAIN]
    } else {
        [PHASE_RAIN, PHASE_MIXED, PHASE_SNOW]
    };

    let mut tied: Vec<u8> = ranked
        .iter()
        .filter(|(_, score)| (score - best_score).abs() < PHASE_TIE_EPSILON)
        .map(|(phase, _)| *phase)
        .collect();
    if tied.len() <= 1 {
        return best_phase;
    }

    tied.sort_by_key(|phase| tie_break_order.iter().position(|p| p == phase).unwrap_or(99));
    tied[0]
}

/// `§4.5.1` step 5: per-column post-pass. Promotes a voxel to `mixed` when an
/// immediately adjacent voxel in the same column has the opposite hard phase.
/// Operates on the original (pre-pass) snapshot of the column so that a single
/// promotion cannot cascade into its other neighbor within the same pass.
pub fn apply_boundary_blend(column: &mut [Option<u8>]) -> u64 {
    let original: Vec<Option<u8>> = column.to_vec();
    let mut promoted = 0_u64;

    for i in 0..original.len() {
        let Some(current) = original[i] else { continue };
        let opposite = match current {
            PHASE_RAIN => PHASE_SNOW,
            PHASE_SNOW => PHASE_RAIN,
            _ => continue,
        };

        let has_opposite_neighbor = (i > 0 && original[i - 1] == Some(opposite))
            || (i + 1 < original.len() && original[i + 1] == Some(opposite));
        if has_opposite_neighbor {
            column[i] = Some(PHASE_MIXED);
            promoted += 1;
        }
    }

    promoted
}

pub fn accumulate_counters(counters: &mut PhaseCounters, outcome: &ResolveOutcome) {
    if outcome.thermo_signal {
        counters.thermo_signal_voxels += 1;
    }
    if outcome.used_dual_evidence {
        counters.dual_adjusted_voxels += 1;
    }
    if outcome.dual_suppressed {
        counters.dual_suppressed_voxels += 1;
    }
    if outcome.mixed_suppressed {
        counters.mixed_suppressed_voxels += 1;
    }
    if outcome.precip_snow_forced {
        counters.precip_snow_forced_voxels += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn warm_column() -> ColumnContext {
        ColumnContext {
            precip_flag_code: Some(1),
            freezing_level_ft: Some(12_000.0),
            wet_bulb_c: Some(10.0),
            surface_temp_c: Some(15.0),
            bright_band_top_ft: None,
            bright_band_bottom_ft: None,
            rqi: Some(0.9),
            column_mean_alt_ft: 5_000.0,
        }
    }

    #[test]
    fn happy_path_rain_column_resolves_rain() {
        let voxel = VoxelInputs {
            alt_ft: 3_000.0,
            zdr_db: Some(1.5),
            rhohv: Some(0.99),
            dual_age_seconds: Some(30),
            dual_aux_fallback: false,
        };
        let outcome = resolve_thermo_phase(&voxel, &warm_column());
        assert_eq!(outcome.phase, PHASE_RAIN);
        assert!(outcome.used_dual_evidence);
    }

    #[test]
    fn snow_guardrail_forces_snow_when_frozen_context_present() {
        let mut column = warm_column();
        column.precip_flag_code = Some(3);
        column.freezing_level_ft = Some(1_500.0);
        column.wet_bulb_c = Some(-5.0);
        let voxel = VoxelInputs {
            alt_ft: 4_000.0,
            zdr_db: Some(2.0),
            rhohv: Some(0.99),
            dual_age_seconds: Some(10),
            dual_aux_fallback: false,
        };
        let outcome = resolve_thermo_phase(&voxel, &column);
        assert_eq!(outcome.phase, PHASE_SNOW);
        assert!(outcome.precip_snow_forced);
    }

    #[test]
    fn stale_aux_contributes_at_most_thirty_percent_of_fresh_weight() {
        let fresh = VoxelInputs {
            alt_ft: 3_000.0,
            zdr_db: Some(1.5),
            rhohv: Some(0.99),
            dual_age_seconds: Some(0),
            dual_aux_fallback: false,
        };
        let stale = VoxelInputs {
            dual_aux_fallback: true,
            ..fresh
        };
        let column = warm_column();
        let fresh_outcome = resolve_thermo_phase(&fresh, &column);
        let stale_outcome = resolve_thermo_phase(&stale, &column);
        assert!(fresh_outcome.used_dual_evidence);
        assert!(stale_outcome.used_dual_evidence);
    }

    #[test]
    fn boundary_blend_promotes_at_least_one_of_two_adjacent_opposite_voxels() {
        let mut column = vec![Some(PHASE_RAIN), Some(PHASE_SNOW)];
        let promoted = apply_boundary_blend(&mut column);
        assert!(promoted >= 1);
        assert!(column.contains(&Some(PHASE_MIXED)));
    }

    #[test]
    fn boundary_blend_leaves_uniform_column_untouched() {
        let mut column = vec![Some(PHASE_RAIN), Some(PHASE_RAIN), Some(PHASE_RAIN)];
        let promoted = apply_boundary_blend(&mut column);
        assert_eq!(promoted, 0);
    }

    #[test]
    fn surface_phase_maps_precip_flag_directly() {
        assert_eq!(resolve_surface_phase(Some(3)), PHASE_SNOW);
        assert_eq!(resolve_surface_phase(Some(7)), PHASE_MIXED);
        assert_eq!(resolve_surface_phase(Some(0)), PHASE_RAIN);
        assert_eq!(resolve_surface_phase(None), PHASE_RAIN);
    }

    #[test]
    fn tie_break_prefers_rain_over_snow_in_warm_columns() {
        assert_eq!(pick_top_score(1.0, 1.0, 1.0, false), PHASE_RAIN);
        assert_eq!(pick_top_score(1.0, 1.0, 1.0, true), PHASE_SNOW);
    }

    #[test]
    fn freezing_level_transition_band_is_symmetric() {
        let (r, m, s) = freezing_level_scores(10_000.0, 10_000.0);
        assert_abs_diff_eq!(m, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(r, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s, 0.0, epsilon = 1e-9);
    }
}
