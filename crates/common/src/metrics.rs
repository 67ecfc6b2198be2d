use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Process-wide registry of shuffle transport metrics.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    shuffle_blocks_written: CounterVec,
    shuffle_bytes_written: CounterVec,
    shuffle_records_written: CounterVec,
    shuffle_blocks_read: CounterVec,
    shuffle_bytes_read: CounterVec,
    shuffle_fetch_seconds: HistogramVec,
    shuffle_fetch_retries: CounterVec,
    shuffle_active_fetches: GaugeVec,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Records one map bucket flushed to disk.
    pub fn record_map_output(
        &self,
        shuffle_id: u64,
        map_id: u64,
        blocks: u64,
        bytes: u64,
        records: u64,
    ) {
        let shuffle_id = shuffle_id.to_string();
        let map_id = map_id.to_string();
        let labels = [shuffle_id.as_str(), map_id.as_str()];
        self.inner
            .shuffle_blocks_written
            .with_label_values(&labels)
            .inc_by(blocks as f64);
        self.inner
            .shuffle_bytes_written
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner
            .shuffle_records_written
            .with_label_values(&labels)
            .inc_by(records as f64);
    }

    /// Records one block fully consumed by a reducer.
    pub fn record_block_read(&self, shuffle_id: u64, reduce_id: u64, bytes: u64, secs: f64) {
        let shuffle_id = shuffle_id.to_string();
        let reduce_id = reduce_id.to_string();
        let labels = [shuffle_id.as_str(), reduce_id.as_str()];
        self.inner
            .shuffle_blocks_read
            .with_label_values(&labels)
            .inc();
        self.inner
            .shuffle_bytes_read
            .with_label_values(&labels)
            .inc_by(bytes as f64);
        self.inner
            .shuffle_fetch_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    /// Counts one failed fetch attempt that left the producer eligible for
    /// re-selection.
    pub fn inc_fetch_retry(&self, shuffle_id: u64, reduce_id: u64) {
        let shuffle_id = shuffle_id.to_string();
        let reduce_id = reduce_id.to_string();
        let labels = [shuffle_id.as_str(), reduce_id.as_str()];
        self.inner
            .shuffle_fetch_retries
            .with_label_values(&labels)
            .inc();
    }

    /// Sets the currently executing fetch count for one reducer task.
    pub fn set_active_fetches(&self, shuffle_id: u64, reduce_id: u64, active: u64) {
        let shuffle_id = shuffle_id.to_string();
        let reduce_id = reduce_id.to_string();
        let labels = [shuffle_id.as_str(), reduce_id.as_str()];
        self.inner
            .shuffle_active_fetches
            .with_label_values(&labels)
            .set(active as f64);
    }

    /// Renders all families in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let shuffle_blocks_written = counter_vec(
            &registry,
            "capstan_shuffle_blocks_written_total",
            "Shuffle block files written",
            &["shuffle_id", "map_id"],
        );
        let shuffle_bytes_written = counter_vec(
            &registry,
            "capstan_shuffle_bytes_written_total",
            "Shuffle bytes written",
            &["shuffle_id", "map_id"],
        );
        let shuffle_records_written = counter_vec(
            &registry,
            "capstan_shuffle_records_written_total",
            "Shuffle records written",
            &["shuffle_id", "map_id"],
        );
        let shuffle_blocks_read = counter_vec(
            &registry,
            "capstan_shuffle_blocks_read_total",
            "Shuffle blocks fully consumed",
            &["shuffle_id", "reduce_id"],
        );
        let shuffle_bytes_read = counter_vec(
            &registry,
            "capstan_shuffle_bytes_read_total",
            "Shuffle bytes read",
            &["shuffle_id", "reduce_id"],
        );
        let shuffle_fetch_seconds = histogram_vec(
            &registry,
            "capstan_shuffle_fetch_seconds",
            "Block fetch time",
            &["shuffle_id", "reduce_id"],
        );
        let shuffle_fetch_retries = counter_vec(
            &registry,
            "capstan_shuffle_fetch_retries_total",
            "Failed fetch attempts eligible for retry",
            &["shuffle_id", "reduce_id"],
        );
        let shuffle_active_fetches = gauge_vec(
            &registry,
            "capstan_shuffle_active_fetches",
            "Currently executing fetches per reducer",
            &["shuffle_id", "reduce_id"],
        );

        Self {
            registry,
            shuffle_blocks_written,
            shuffle_bytes_written,
            shuffle_records_written,
            shuffle_blocks_read,
            shuffle_bytes_read,
            shuffle_fetch_seconds,
            shuffle_fetch_retries,
            shuffle_active_fetches,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Returns the process-wide metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
