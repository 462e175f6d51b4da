// Pipeline ingestion: Bronze discovery and the raw record reader

pub mod bronze_locator;
pub mod bronze_reader;

pub use bronze_locator::{BronzeFile, BronzeFileName, BronzeFormat};
pub use bronze_reader::{BronzeBatch, BronzeReadOutcome, BronzeReader, InputFile};
