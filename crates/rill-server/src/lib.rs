// Library side of the Rill node server
// Configuration loading, logging and signal handling used by the binary

pub mod metrics; // Metric descriptions
pub mod model; // CLI and configuration sources
pub mod startup; // Logging and shutdown
