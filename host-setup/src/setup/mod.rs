// First-run setup wizard

pub mod error;
pub mod events;
pub mod gdrive;
pub mod orchestrator;
pub mod storage;
