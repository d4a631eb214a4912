//! ---
//! mayhem_section: "01-core-functionality"
//! mayhem_subsection: "module"
//! mayhem_type: "source"
//! mayhem_scope: "code"
//! mayhem_description: "Shared configuration and logging primitives."
//! mayhem_version: "v0.1.0"
//! mayhem_owner: "tbd"
//! ---
//! Shared primitives for the Mayhem workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the daemon and the library crates.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, EngineConfig, LedgerBackend, LedgerConfig, LoadedAppConfig,
    LoggingConfig, MetricsConfig, TelemetryConfig,
};
pub use logging::{init_tracing, LogFormat};
