//! Metric names and recorder setup.
//!
//! Library crates record through the `metrics` facade using the names in
//! [`definitions`]; nothing is collected until the binary installs a
//! recorder (see [`install_prometheus`]).

pub mod definitions;

pub use metrics::{counter, gauge, histogram};

#[cfg(feature = "prometheus")]
pub use metrics_exporter_prometheus::PrometheusHandle;

/// Install the global Prometheus recorder and return a handle for rendering
/// the text exposition format.
#[cfg(feature = "prometheus")]
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install prometheus recorder: {e}"))?;
    definitions::describe_all();
    tracing::debug!("prometheus recorder installed");
    Ok(handle)
}
