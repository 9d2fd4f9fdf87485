pub mod config;
pub mod context;
pub mod deps;
pub mod errors;
pub mod executor;
pub mod fleet;
pub mod hygiene;
pub mod init;
pub mod integrity;
pub mod patchwork_config;
pub mod quarantine;
pub mod repair;
pub mod report;
pub mod sequencer;
pub mod sla;
pub mod telemetry;
pub mod unit;
pub mod util;
