#[derive(Debug, Parser)]
#[command(
    name = "fr0ntier",
    version,
    about = "Adaptive frontier crawler feeding item payloads to websocket consumers"
)]
struct Cli {
    #[arg(long, env = "CONFIG_FILE", value_name = "FILE")]
    config_file: String,

    #[arg(long, env = "PROXIES_FILE", value_name = "FILE")]
    proxies_file: String,

    #[arg(long, env = "USER_AGENTS_FILE", value_name = "FILE")]
    user_agents_file: String,

    #[arg(long, env = "STATUS_LOG_FILE", value_name = "FILE")]
    status_log_file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProbeRequest {
    item_id: i64,
    batch_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GapRequest {
    item_id: i64,
    batch_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BackupRequest {
    item_id: i64,
    suffix_appended: bool,
}

#[derive(Debug)]
struct FetchResult {
    payload: Option<Value>,
    item_id: i64,
    success: bool,
    age_ms: u32,
}

#[derive(Debug)]
struct ResultsPayload {
    payload: Value,
    item_id: i64,
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("unauthorized (HTTP 401)")]
    Unauthorized,

    #[error("not found (HTTP 404)")]
    NotFound,

    #[error("rate limited (HTTP 429)")]
    RateLimit,

    #[error("unexpected response status code {0}")]
    UnexpectedStatus(u16),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("{missing} target session cookie(s) not found in refresh response")]
    MissingTargetCookies { missing: usize },

    #[error("unexpected listing response shape: {0}")]
    ListingShape(&'static str),
}

fn infer_http_error(status: StatusCode) -> FetchError {
    match status.as_u16() {
        401 => FetchError::Unauthorized,
        404 => FetchError::NotFound,
        429 => FetchError::RateLimit,
        code => FetchError::UnexpectedStatus(code),
    }
}

// Process-wide request counters. Every worker bumps these; only the status
// aggregator reads and resets them.
#[derive(Debug, Default)]
struct Outcome {
    rate_limits: AtomicI64,
    not_founds: AtomicI64,
    other_errs: AtomicI64,
    consecutive_errs: AtomicI64,
    successes: AtomicI64,
    sent_to_backup: AtomicI64,
    recovered: AtomicI64,
    lost: AtomicI64,
}

#[derive(Debug, Clone, Copy)]
struct OutcomeSnapshot {
    rate_limits: i64,
    not_founds: i64,
    other_errs: i64,
    successes: i64,
    recovered: i64,
    lost: i64,
}

impl Outcome {
    fn record_error(&self, err: &FetchError) {
        match err {
            FetchError::RateLimit => self.rate_limits.fetch_add(1, Ordering::Relaxed),
            FetchError::NotFound => self.not_founds.fetch_add(1, Ordering::Relaxed),
            _ => self.other_errs.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn rate_limits_exceeded(&self, max_per_second: i64) -> bool {
        self.rate_limits.load(Ordering::Relaxed) > max_per_second
    }

    fn snapshot_and_reset(&self) -> OutcomeSnapshot {
        OutcomeSnapshot {
            rate_limits: self.rate_limits.swap(0, Ordering::Relaxed),
            not_founds: self.not_founds.swap(0, Ordering::Relaxed),
            other_errs: self.other_errs.swap(0, Ordering::Relaxed),
            successes: self.successes.swap(0, Ordering::Relaxed),
            recovered: self.recovered.swap(0, Ordering::Relaxed),
            lost: self.lost.swap(0, Ordering::Relaxed),
        }
    }
}

impl OutcomeSnapshot {
    fn total_requests(&self) -> i64 {
        self.successes + self.not_founds + self.rate_limits + self.other_errs
    }

    fn success_rate(&self) -> f32 {
        let total = self.total_requests();
        if total > 0 {
            self.successes as f32 / total as f32 * 100.0
        } else {
            0.0
        }
    }
}

// Batch progress plus the sample slices the status aggregator averages and
// truncates once per tick.
#[derive(Debug, Default)]
struct State {
    batch_id: u16,
    highest_id: i64,
    thresholds_counts: Vec<u16>,
    thresholds_offsets: Vec<i64>,
    hit_levels: Vec<u16>,
    ages_ms: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
struct StateSummary {
    batch_id: u16,
    highest_id: i64,
    avg_thresholds_count: f32,
    avg_offset: f32,
    avg_hit_level: f32,
    avg_age_ms: f32,
}

impl State {
    fn record_batch(
        &mut self,
        batch_id: u16,
        highest_id: i64,
        count: u16,
        offset: i64,
        hit_level: u16,
    ) {
        self.batch_id = batch_id;
        self.highest_id = highest_id;
        self.thresholds_counts.push(count);
        self.thresholds_offsets.push(offset);
        self.hit_levels.push(hit_level);
    }

    fn record_age(&mut self, age_ms: u32) {
        self.ages_ms.push(age_ms);
    }

    fn tick_summary(&mut self) -> StateSummary {
        let summary = StateSummary {
            batch_id: self.batch_id,
            highest_id: self.highest_id,
            avg_thresholds_count: average(self.thresholds_counts.iter().map(|v| f64::from(*v))),
            avg_offset: average(self.thresholds_offsets.iter().map(|v| *v as f64)),
            avg_hit_level: average(self.hit_levels.iter().map(|v| f64::from(*v))),
            avg_age_ms: average(self.ages_ms.iter().map(|v| f64::from(*v))),
        };

        self.thresholds_counts.clear();
        self.thresholds_offsets.clear();
        self.hit_levels.clear();
        self.ages_ms.clear();

        summary
    }
}

fn average(values: impl ExactSizeIterator<Item = f64>) -> f32 {
    let count = values.len();
    if count == 0 {
        return 0.0;
    }
    (values.sum::<f64>() / count as f64) as f32
}

// Everything a worker task needs besides its own channels.
#[derive(Clone)]
struct WorkerEnv {
    cfg: Arc<Config>,
    pools: Arc<HttpPools>,
    outcome: Arc<Outcome>,
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
}

#[cfg(test)]
mod outcome_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_error_routes_to_matching_counter() {
        let outcome = Outcome::default();
        outcome.record_error(&FetchError::RateLimit);
        outcome.record_error(&FetchError::NotFound);
        outcome.record_error(&FetchError::Unauthorized);
        outcome.record_error(&FetchError::UnexpectedStatus(503));

        assert_eq!(outcome.rate_limits.load(Ordering::Relaxed), 1);
        assert_eq!(outcome.not_founds.load(Ordering::Relaxed), 1);
        assert_eq!(outcome.other_errs.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn snapshot_resets_tick_counters() {
        let outcome = Outcome::default();
        outcome.successes.fetch_add(3, Ordering::Relaxed);
        outcome.not_founds.fetch_add(1, Ordering::Relaxed);
        outcome.sent_to_backup.fetch_add(2, Ordering::Relaxed);

        let snapshot = outcome.snapshot_and_reset();
        assert_eq!(snapshot.successes, 3);
        assert_eq!(snapshot.not_founds, 1);
        assert_eq!(snapshot.total_requests(), 4);
        assert_eq!(snapshot.success_rate(), 75.0);

        assert_eq!(outcome.successes.load(Ordering::Relaxed), 0);
        assert_eq!(outcome.not_founds.load(Ordering::Relaxed), 0);
        // sent_to_backup survives ticks
        assert_eq!(outcome.sent_to_backup.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn state_summary_averages_then_truncates() {
        let mut state = State::default();
        state.record_batch(7, 1020, 4, 5, 2);
        state.record_batch(8, 1040, 6, 5, 3);
        state.record_age(100);
        state.record_age(200);

        let summary = state.tick_summary();
        assert_eq!(summary.batch_id, 8);
        assert_eq!(summary.highest_id, 1040);
        assert_eq!(summary.avg_thresholds_count, 5.0);
        assert_eq!(summary.avg_offset, 5.0);
        assert_eq!(summary.avg_hit_level, 2.5);
        assert_eq!(summary.avg_age_ms, 150.0);

        let empty = state.tick_summary();
        assert_eq!(empty.avg_thresholds_count, 0.0);
        assert_eq!(empty.avg_age_ms, 0.0);
        // the batch cursor is not a sample, it survives the reset
        assert_eq!(empty.batch_id, 8);
        assert_eq!(empty.highest_id, 1040);
    }

    #[test]
    fn http_error_inference() {
        assert!(matches!(
            infer_http_error(StatusCode::UNAUTHORIZED),
            FetchError::Unauthorized
        ));
        assert!(matches!(
            infer_http_error(StatusCode::NOT_FOUND),
            FetchError::NotFound
        ));
        assert!(matches!(
            infer_http_error(StatusCode::TOO_MANY_REQUESTS),
            FetchError::RateLimit
        ));
        assert!(matches!(
            infer_http_error(StatusCode::BAD_GATEWAY),
            FetchError::UnexpectedStatus(502)
        ));
    }
}
