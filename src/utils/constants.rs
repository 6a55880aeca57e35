/// Periodic coordinate names
pub const DIM_DAYOFYEAR: &str = "dayofyear";
pub const DIM_HOUR: &str = "hour";

/// Output time dimension
pub const DIM_TIME: &str = "time";

/// Calendar constants
pub const HOURS_PER_DAY: i64 = 24;
pub const TIME_CALENDAR: &str = "proleptic_gregorian";

/// Defaults for the expansion range
pub const DEFAULT_TIME_START: &str = "2017-01-01";
pub const DEFAULT_TIME_STOP: &str = "2017-12-31";

/// Zarr store layout
pub const ZARR_JSON_FILE: &str = "zarr.json";
pub const ZGROUP_FILE: &str = ".zgroup";
pub const ARRAY_DIMENSIONS_ATTR: &str = "_ARRAY_DIMENSIONS";

/// Root group attribute: false while an expansion is being written
pub const COMPLETE_ATTR: &str = "expansion_complete";

/// Output compression level (zstd and blosc)
pub const COMPRESSION_LEVEL: u8 = 5;

/// Processing defaults
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_WRITER_THREADS: usize = 4;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "CLIM_EXPAND";
