//! # Constants
//!
//! Shared constants used throughout the provider.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Resource version used when the initial listing does not report one.
///
/// "0" tells the API server to start the watch from the beginning of its
/// change history rather than a specific point.
pub const DEFAULT_RESOURCE_VERSION: &str = "0";

/// HTTP status code signalling that a watch resume point has expired
pub const HTTP_GONE: u16 = 410;

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Environment variable overriding the metrics/probe server port
pub const ENV_METRICS_PORT: &str = "METRICS_PORT";

/// Environment variable holding the label selector applied to secret
/// list and watch calls (empty or unset = unfiltered)
pub const ENV_LABEL_SELECTOR: &str = "CREDENTIALS_LABEL_SELECTOR";

/// Environment variable naming the namespace whose credentials are
/// visible to root-scope lookups
pub const ENV_SHARED_NAMESPACE: &str = "CREDENTIALS_SHARED_NAMESPACE";
