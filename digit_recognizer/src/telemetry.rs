use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    request_count: IntCounterVec,
    request_latency: Gauge,
    request_latency_per_char: GaugeVec,
    request_input_length: GaugeVec,
    registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_count = IntCounterVec::new(
            Opts::new("request_count_total", "App Request Count"),
            &["app_name", "client_ip"],
        )?;

        // Not partitioned by client, unlike the two gauges below.
        let request_latency = Gauge::new("request_latency", "Request latency")?;

        let request_latency_per_char = GaugeVec::new(
            Opts::new(
                "request_latency_per_char",
                "Request latency per character",
            ),
            &["client_ip"],
        )?;

        let request_input_length = GaugeVec::new(
            Opts::new("request_input_length", "Request input length"),
            &["client_ip"],
        )?;

        registry.register(Box::new(request_count.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(request_latency_per_char.clone()))?;
        registry.register(Box::new(request_input_length.clone()))?;

        Ok(Metrics {
            request_count,
            request_latency,
            request_latency_per_char,
            request_input_length,
            registry,
        })
    }

    pub fn increment_request_count(&self, app_name: &str, client_id: &str) {
        self.request_count
            .with_label_values(&[app_name, client_id])
            .inc();
    }

    pub fn set_latency(&self, duration_seconds: f64) {
        self.request_latency.set(duration_seconds);
    }

    pub fn set_input_length(&self, client_id: &str, length: usize) {
        self.request_input_length
            .with_label_values(&[client_id])
            .set(length as f64);
    }

    pub fn set_latency_per_unit(&self, client_id: &str, value: f64) {
        self.request_latency_per_char
            .with_label_values(&[client_id])
            .set(value);
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
impl Metrics {
    /// Reads a sample without creating it; absent series read as zero.
    fn sample(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let families = self.registry.gather();
        families
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric().iter())
            .find(|metric| {
                let pairs = metric.get_label();
                pairs.len() == labels.len()
                    && labels.iter().all(|(key, value)| {
                        pairs
                            .iter()
                            .any(|pair| pair.get_name() == *key && pair.get_value() == *value)
                    })
            })
            .map(|metric| {
                if metric.has_counter() {
                    metric.get_counter().get_value()
                } else {
                    metric.get_gauge().get_value()
                }
            })
            .unwrap_or(0.0)
    }

    pub(crate) fn request_count(&self, app_name: &str, client_id: &str) -> u64 {
        self.sample(
            "request_count_total",
            &[("app_name", app_name), ("client_ip", client_id)],
        ) as u64
    }

    pub(crate) fn latency(&self) -> f64 {
        self.sample("request_latency", &[])
    }

    pub(crate) fn input_length(&self, client_id: &str) -> f64 {
        self.sample("request_input_length", &[("client_ip", client_id)])
    }

    pub(crate) fn latency_per_unit(&self, client_id: &str) -> f64 {
        self.sample("request_latency_per_char", &[("client_ip", client_id)])
    }
}

/// Microseconds of latency per unit of model input.
pub fn latency_per_unit(duration_seconds: f64, input_length: usize) -> f64 {
    (duration_seconds / input_length as f64) * 1e6
}
