pub mod fs_silver_store;

pub use fs_silver_store::FsSilverStore;
