use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

lazy_static::lazy_static! {
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tilekiln_http_requests_total", "Total HTTP requests", &["method", "path", "status"]
    ).unwrap();
    pub static ref TILE_FETCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tilekiln_tile_fetches_total", "Tile fetches by serving mode and result",
        &["mode", "result"]
    ).unwrap();
    pub static ref GENERATION_DURATION: HistogramVec = register_histogram_vec!(
        "tilekiln_generation_duration_seconds", "Whole-tile generation duration",
        &["tileset"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();
    pub static ref LAYER_QUERY_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tilekiln_layer_query_errors_total", "Failed or timed-out layer queries",
        &["tileset", "layer"]
    ).unwrap();
    pub static ref TILE_BYTES: HistogramVec = register_histogram_vec!(
        "tilekiln_tile_bytes", "Generated tile payload size",
        &["tileset"],
        vec![0.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0]
    ).unwrap();
    pub static ref STORAGE_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "tilekiln_storage_operation_duration_seconds", "Tile storage operation latency",
        &["backend", "operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();
    pub static ref STORAGE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tilekiln_storage_errors_total", "Tile storage operation errors",
        &["backend", "operation"]
    ).unwrap();
    pub static ref BULK_ITEMS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tilekiln_bulk_items_total", "Bulk batch items by operation and outcome",
        &["operation", "outcome"]
    ).unwrap();
    pub static ref ACTIVE_GENERATIONS: IntGauge = register_int_gauge!(
        "tilekiln_active_generations", "Number of in-flight tile generations"
    ).unwrap();
}

/// RAII guard that decrements an IntGauge on drop.
pub struct GaugeGuard<'a>(pub &'a IntGauge);

impl<'a> GaugeGuard<'a> {
    pub fn inc(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

pub fn init() {
    lazy_static::initialize(&HTTP_REQUESTS_TOTAL);
    lazy_static::initialize(&TILE_FETCHES_TOTAL);
    lazy_static::initialize(&GENERATION_DURATION);
    lazy_static::initialize(&LAYER_QUERY_ERRORS_TOTAL);
    lazy_static::initialize(&TILE_BYTES);
    lazy_static::initialize(&STORAGE_OPERATION_DURATION);
    lazy_static::initialize(&STORAGE_ERRORS_TOTAL);
    lazy_static::initialize(&BULK_ITEMS_TOTAL);
    lazy_static::initialize(&ACTIVE_GENERATIONS);
}

