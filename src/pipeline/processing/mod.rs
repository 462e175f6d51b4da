// Record processing: schema normalization, deduplication, and validation

pub mod dedup;
pub mod normalize;
pub mod quality_gate;
