use opentelemetry::metrics::{Meter, MeterProvider};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, SdkMeterProvider};

use crate::error::{TelemetryError, TelemetryResult};

/// A utility for metric unit tests.
/// Instruments created from [`MetricTester::meter`] are collected by an
/// in-memory exporter and can be read back as counter values.
pub struct MetricTester {
    exporter: InMemoryMetricExporter,
    provider: SdkMeterProvider,
    meter: Meter,
}

impl MetricTester {
    pub fn new() -> Self {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_periodic_exporter(exporter.clone())
            .build();
        let meter = provider.meter("test");
        Self {
            exporter,
            provider,
            meter,
        }
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    /// Returns the cumulative value of a `u64` counter, summed over the data points
    /// that carry every given attribute. A counter that was never recorded reads as zero.
    pub fn counter(&self, name: &str, attributes: &[KeyValue]) -> TelemetryResult<u64> {
        self.provider
            .force_flush()
            .map_err(|e| TelemetryError::internal(e.to_string()))?;
        let exported = self
            .exporter
            .get_finished_metrics()
            .map_err(|e| TelemetryError::internal(e.to_string()))?;
        // Every flush exports the cumulative state, so the latest export wins.
        let latest = exported.iter().rev().find_map(|resource| {
            resource
                .scope_metrics()
                .flat_map(|scope| scope.metrics())
                .find(|metric| metric.name() == name)
        });
        let Some(metric) = latest else {
            return Ok(0);
        };
        match metric.data() {
            AggregatedMetrics::U64(MetricData::Sum(sum)) => Ok(sum
                .data_points()
                .filter(|point| {
                    attributes
                        .iter()
                        .all(|expected| point.attributes().any(|x| x == expected))
                })
                .map(|point| point.value())
                .sum::<u64>()),
            _ => Err(TelemetryError::invalid(format!(
                "metric {name} is not a u64 counter"
            ))),
        }
    }
}

impl Default for MetricTester {
    fn default() -> Self {
        Self::new()
    }
}
