//! Structured logging and optional OpenTelemetry span export.
//!
//! # Telemetry invariants
//!
//! - **No key material, credentials or shares** may appear in any span
//!   attribute or log field. Secret store calls log the path only.
//! - Audit entries are mirrored on the `audit` target; lifecycle events on
//!   the `events` target.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`) and
//!   overridden by `RUST_LOG` when set.

pub mod init;

pub use init::init_telemetry;
