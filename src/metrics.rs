//! Prometheus exporter bootstrap.
//!
//! The tunnel worker records `focuslock_queries_{blocked,forwarded,dropped}_total`
//! counters and the `focuslock_domains_loaded` gauge; without an installed
//! recorder these are no-ops.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{Error, Result};

/// Install the exporter when enabled, serving `/metrics` on `config.listen`.
pub fn init(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()
        .map_err(|err| Error::Metrics(err.to_string()))?;

    info!(listen = %config.listen, "metrics exporter listening");
    Ok(())
}
