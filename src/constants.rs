pub const MRMS_BUCKET_URL: &str = "https://noaa-mrms-pds.s3.amazonaws.com";
pub const MRMS_CONUS_PREFIX: &str = "CONUS";
pub const MRMS_PRODUCT_PREFIX: &str = "MergedReflectivityQC";
pub const MRMS_BASE_LEVEL_TAG: &str = "00.50";
pub const MRMS_ZDR_PRODUCT_PREFIX: &str = "MergedZdr";
pub const MRMS_RHOHV_PRODUCT_PREFIX: &str = "MergedRhoHV";
pub const MRMS_PRECIP_FLAG_PRODUCT: &str = "PrecipFlag_00.00";
pub const MRMS_MODEL_FREEZING_HEIGHT_PRODUCT: &str = "Model_0degC_Height_00.50";
pub const MRMS_WETBULB_PRODUCT: &str = "Model_WetBulbTemp_00.00";
pub const MRMS_SURFACE_TEMP_PRODUCT: &str = "Model_SurfaceTemp_00.00";
pub const MRMS_BRIGHTBAND_TOP_PRODUCT: &str = "BrightBandTopHeight_00.00";
pub const MRMS_BRIGHTBAND_BOTTOM_PRODUCT: &str = "BrightBandBottomHeight_00.00";
pub const MRMS_RQI_PRODUCT: &str = "RadarQualityIndex_00.00";

pub const MRMS_ECHO_TOP_18_PRODUCT: &str = "EchoTop_18_00.50";
pub const MRMS_ECHO_TOP_30_PRODUCT: &str = "EchoTop_30_00.50";
pub const MRMS_ECHO_TOP_50_PRODUCT: &str = "EchoTop_50_00.50";
pub const MRMS_ECHO_TOP_60_PRODUCT: &str = "EchoTop_60_00.50";
pub const ECHO_TOP_PRODUCTS: [(&str, usize); 4] = [
    (MRMS_ECHO_TOP_18_PRODUCT, 0),
    (MRMS_ECHO_TOP_30_PRODUCT, 1),
    (MRMS_ECHO_TOP_50_PRODUCT, 2),
    (MRMS_ECHO_TOP_60_PRODUCT, 3),
];

pub const LEVEL_TAGS: [&str; 33] = [
    "00.50", "00.75", "01.00", "01.25", "01.50", "01.75", "02.00", "02.25", "02.50", "02.75",
    "03.00", "03.50", "04.00", "04.50", "05.00", "05.50", "06.00", "06.50", "07.00", "07.50",
    "08.00", "08.50", "09.00", "10.00", "11.00", "12.00", "13.00", "14.00", "15.00", "16.00",
    "17.00", "18.00", "19.00",
];

pub const FEET_PER_KM: f64 = 3280.84;
pub const FEET_PER_METER: f64 = 3.28084;
pub const METERS_TO_NM: f64 = 1.0 / 1852.0;
pub const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;
pub const WGS84_SEMI_MAJOR_METERS: f64 = 6_378_137.0;
pub const WGS84_FLATTENING: f64 = 1.0 / 298.257_223_563;
pub const WGS84_E2: f64 = WGS84_FLATTENING * (2.0 - WGS84_FLATTENING);

pub const PHASE_RAIN: u8 = 0;
pub const PHASE_MIXED: u8 = 1;
pub const PHASE_SNOW: u8 = 2;
pub const FREEZING_LEVEL_TRANSITION_FEET: f64 = 1500.0;

pub const PHASE_ZDR_MIN_VALID_DB: f32 = -4.0;
pub const PHASE_ZDR_MAX_VALID_DB: f32 = 8.0;
pub const PHASE_ZDR_RAIN_MIN_DB: f32 = 1.0;
pub const PHASE_ZDR_SNOW_MAX_DB: f32 = 0.3;
pub const PHASE_RHOHV_MIN_VALID: f32 = 0.0;
pub const PHASE_RHOHV_MAX_VALID: f32 = 1.05;
pub const PHASE_RHOHV_MIXED_MAX: f32 = 0.9;
pub const PHASE_RHOHV_HIGH_CONFIDENCE: f32 = 0.97;

pub const PHASE_WETBULB_SNOW_MAX_C: f64 = -2.0;
pub const PHASE_WETBULB_RAIN_MIN_C: f64 = 2.0;
pub const PHASE_SURFACE_TEMP_COLD_C: f64 = 0.0;

pub const PHASE_DUAL_AUX_BASE_WEIGHT: f64 = 1.0;
pub const PHASE_DUAL_AUX_FALLBACK_PENALTY: f64 = 0.3;
pub const PHASE_DUAL_AUX_AGE_HORIZON_SECONDS: f64 = 300.0;
pub const PHASE_DUAL_AUX_MIN_RQI_FACTOR: f64 = 0.25;

pub const PHASE_TRANSITION_SPREAD: f64 = 0.75;
pub const PHASE_TRANSITION_MIXED_BONUS: f64 = 0.4;
pub const PHASE_MIXED_DEMOTE_MARGIN: f64 = 0.35;
pub const PHASE_MIXED_DEMOTE_PENALTY: f64 = 0.5;
pub const PHASE_TIE_EPSILON: f64 = 1e-6;

pub const DUAL_POL_STALE_THRESHOLD_SECONDS: i64 = 300;
pub const AUX_TIMESTAMP_LOOKBACK_DAYS: i64 = 1;
pub const DEFAULT_AUX_MIN_LEVEL_COVERAGE: f64 = 0.7;

pub const DEFAULT_MIN_DBZ: f64 = 5.0;
pub const DEFAULT_MAX_RANGE_NM: f64 = 120.0;
pub const MIN_ALLOWED_DBZ: f64 = 5.0;
pub const MAX_ALLOWED_DBZ: f64 = 60.0;
pub const MIN_ALLOWED_RANGE_NM: f64 = 30.0;
pub const MAX_ALLOWED_RANGE_NM: f64 = 220.0;

pub const DEFAULT_TILE_SIZE: u16 = 64;
pub const DEFAULT_RETENTION_BYTES: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_BOOTSTRAP_INTERVAL_SECONDS: u64 = 300;
pub const DEFAULT_SQS_POLL_DELAY_SECONDS: u64 = 3;
pub const DEFAULT_PENDING_RETRY_SECONDS: u64 = 30;
pub const DEFAULT_EVICTION_HORIZON_SECONDS: u64 = 90 * 60;
pub const MAX_PENDING_ATTEMPTS: u32 = 20;
pub const STORE_MIN_DBZ_TENTHS: i16 = 50;
pub const MAX_BASE_KEYS_LOOKUP: usize = 8;
pub const MAX_BASE_DAY_LOOKBACK: i64 = 1;

pub const WIRE_MAGIC: [u8; 4] = *b"AVMR";
pub const WIRE_HEADER_BYTES: usize = 64;

/// v2 is accepted from older clients; the record layout is byte-identical to
/// v3 (bytes 11 and 16-19 are simply documented as reserved for v2 readers).
pub const WIRE_V2_VERSION: u16 = 2;
pub const WIRE_V2_RECORD_BYTES: u16 = 20;

pub const WIRE_V3_VERSION: u16 = 3;
pub const WIRE_V3_RECORD_BYTES: u16 = 20;

/// dBZ quantization step (0.5 dBZ) used only to decide merge-equivalence;
/// the emitted record always carries the run's actual maximum dBZ.
pub const WIRE_DBZ_QUANT_STEP_TENTHS: i16 = 5;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"AVSN";
pub const SNAPSHOT_VERSION: u16 = 2;
