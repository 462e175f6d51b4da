//! File and format constants shared between the reader, the writer and the CLI

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

// Environment overrides applied after the config file
pub const ENV_BRONZE_DIR: &str = "PIPELINE_BRONZE_DIR";
pub const ENV_SILVER_DIR: &str = "PIPELINE_SILVER_DIR";

/// Timestamp suffix used in Bronze file names, e.g. `paris_bike_counts_p0001_20240101T000000Z.json`
pub const BRONZE_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

// Silver partition layout
pub const RECORDS_FILE: &str = "records.ndjson";
pub const REJECTIONS_FILE: &str = "rejections.ndjson";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const STAGING_DIR: &str = ".staging";
pub const LOCKS_DIR: &str = ".locks";

pub const MANIFEST_VERSION: &str = "1.0.0";
pub const DEFAULT_PARTITION_PREFIX: &str = "silver";

pub const LOG_FILE_NAME: &str = "pipeline.log";
