use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    operations_accepted_total: AtomicU64,
    operations_rejected_total: Mutex<HashMap<String, u64>>,
    duplicate_submissions_total: AtomicU64,
    conflicts_opened_total: Mutex<HashMap<String, u64>>,
    snapshot_failures_total: AtomicU64,
    sequence_gap_count: AtomicU64,
    operation_ack_latency_ms: AtomicU64,
    active_rooms: AtomicI64,
    active_participants: AtomicI64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_duration_count: Mutex::new(HashMap::new()),
            ws_duration_sum_ms: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_rate_total: Mutex::new(HashMap::new()),
            operations_accepted_total: AtomicU64::new(0),
            operations_rejected_total: Mutex::new(HashMap::new()),
            duplicate_submissions_total: AtomicU64::new(0),
            conflicts_opened_total: Mutex::new(HashMap::new()),
            snapshot_failures_total: AtomicU64::new(0),
            sequence_gap_count: AtomicU64::new(0),
            operation_ack_latency_ms: AtomicU64::new(0),
            active_rooms: AtomicI64::new(0),
            active_participants: AtomicI64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_request(endpoint: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(endpoint, is_error, latency_ms);
    }
}

pub fn increment_operations_accepted() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_operations_accepted();
    }
}

pub fn increment_operations_rejected(reason: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_operations_rejected(reason);
    }
}

pub fn increment_duplicate_submissions() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_duplicate_submissions();
    }
}

pub fn increment_conflicts_opened(strategy: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_conflicts_opened(strategy);
    }
}

pub fn increment_snapshot_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_snapshot_failures();
    }
}

pub fn increment_sequence_gap_count() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_sequence_gap_count();
    }
}

pub fn observe_operation_ack_latency_ms(latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.observe_operation_ack_latency_ms(latency_ms);
    }
}

pub fn set_active_rooms(value: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.active_rooms.store(value.max(0), Ordering::SeqCst);
    }
}

pub fn set_active_participants(value: i64) {
    if let Some(metrics) = global_metrics() {
        metrics.active_participants.store(value.max(0), Ordering::SeqCst);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_request(&self, endpoint: &str, is_error: bool, latency_ms: u64) {
        let normalized_endpoint = normalize_label(endpoint);
        increment_label_counter(&self.ws_rate_total, &normalized_endpoint, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &normalized_endpoint, latency_ms);
        increment_label_counter(&self.ws_duration_count, &normalized_endpoint, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &normalized_endpoint, 1);
        }
    }

    pub fn increment_operations_accepted(&self) {
        self.operations_accepted_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_operations_rejected(&self, reason: &str) {
        increment_label_counter(&self.operations_rejected_total, &normalize_label(reason), 1);
    }

    pub fn increment_duplicate_submissions(&self) {
        self.duplicate_submissions_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_conflicts_opened(&self, strategy: &str) {
        increment_label_counter(&self.conflicts_opened_total, &normalize_label(strategy), 1);
    }

    pub fn increment_snapshot_failures(&self) {
        self.snapshot_failures_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_sequence_gap_count(&self) {
        self.sequence_gap_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn observe_operation_ack_latency_ms(&self, value: u64) {
        self.operation_ack_latency_ms.store(value, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_rate_total Total websocket messages by kind.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", "kind", &self.ws_rate_total);

        output.push_str("# HELP relay_ws_errors_total Total websocket message errors by kind.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_errors_total",
            "kind",
            &self.ws_errors_total,
        );

        output.push_str("# HELP relay_ws_duration_ms_sum Sum of websocket message latency in milliseconds by kind.\n");
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_sum",
            "kind",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP relay_ws_duration_ms_count Count of websocket latency samples by kind.\n",
        );
        output.push_str("# TYPE relay_ws_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_count",
            "kind",
            &self.ws_duration_count,
        );

        output.push_str("# HELP operations_accepted_total Total accepted operations.\n");
        output.push_str("# TYPE operations_accepted_total counter\n");
        output.push_str(&format!(
            "operations_accepted_total {}\n",
            self.operations_accepted_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP operations_rejected_total Total rejected operations by reason.\n");
        output.push_str("# TYPE operations_rejected_total counter\n");
        append_label_counter_lines(
            &mut output,
            "operations_rejected_total",
            "reason",
            &self.operations_rejected_total,
        );

        output.push_str(
            "# HELP duplicate_submissions_total Total replayed idempotent submissions.\n",
        );
        output.push_str("# TYPE duplicate_submissions_total counter\n");
        output.push_str(&format!(
            "duplicate_submissions_total {}\n",
            self.duplicate_submissions_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP conflicts_opened_total Total manual conflicts opened by strategy.\n");
        output.push_str("# TYPE conflicts_opened_total counter\n");
        append_label_counter_lines(
            &mut output,
            "conflicts_opened_total",
            "strategy",
            &self.conflicts_opened_total,
        );

        output.push_str("# HELP snapshot_failures_total Total snapshot writes that gave up.\n");
        output.push_str("# TYPE snapshot_failures_total counter\n");
        output.push_str(&format!(
            "snapshot_failures_total {}\n",
            self.snapshot_failures_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP sequence_gap_count Total resync requests for missed sequences.\n");
        output.push_str("# TYPE sequence_gap_count counter\n");
        output.push_str(&format!(
            "sequence_gap_count {}\n",
            self.sequence_gap_count.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP operation_ack_latency_ms Last observed operation ack latency in milliseconds.\n",
        );
        output.push_str("# TYPE operation_ack_latency_ms gauge\n");
        output.push_str(&format!(
            "operation_ack_latency_ms {}\n",
            self.operation_ack_latency_ms.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP active_rooms Rooms currently held in memory.\n");
        output.push_str("# TYPE active_rooms gauge\n");
        output.push_str(&format!("active_rooms {}\n", self.active_rooms.load(Ordering::SeqCst)));

        output.push_str("# HELP active_participants Participants currently in a room.\n");
        output.push_str("# TYPE active_participants gauge\n");
        output.push_str(&format!(
            "active_participants {}\n",
            self.active_participants.load(Ordering::SeqCst)
        ));

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
