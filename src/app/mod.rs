pub mod ports;
pub mod silver_use_case;

pub use silver_use_case::{RunContext, RunReport, RunStatus, SilverUseCase};
