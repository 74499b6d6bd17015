pub mod cli;
pub mod probes;
pub mod run;
pub mod types;

pub use probes::{default_probes, Probe, ProbeRegistry};
pub use run::run;
pub use types::{ErrorCategory, ExecutionContext, TestDefinition, TestResult, TestStatus};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
