const STATUS_TICK: Duration = Duration::from_secs(1);

// One snapshot-and-reset pass per tick. Besides operator visibility this is
// what re-arms the rate-limit brake: zeroing rate_limits lets traffic resume
// after a 429 storm.
async fn status_loop(
    cancel: CancellationToken,
    outcome: Arc<Outcome>,
    state: Arc<Mutex<State>>,
    mut log_file: File,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("status aggregator finished due to cancellation");
                return;
            }
            _ = tokio::time::sleep(STATUS_TICK) => {}
        }

        let snapshot = outcome.snapshot_and_reset();
        let summary = state.lock().unwrap().tick_summary();

        if let Err(err) = log_file.write_all(format_status_record(&snapshot, &summary).as_bytes())
        {
            error!("error writing the status log: {err}");
        }
    }
}

fn format_status_record(snapshot: &OutcomeSnapshot, summary: &StateSummary) -> String {
    format!(
        "{} STATUS\n\
         Reqs: {}, Success: {:.2}%\n\
         RateLimits (429): {}, NotFounds (404): {}, OtherErrs: {}\n\
         Recovered from backup: {}, Lost from backup: {}\n\
         BatchID: {}, HighestID: {}\n\
         AvgThreshAmount: {:.2}, AvgThreshOffset: {:.2}\n\
         AvgHitThreshLevel: {:.2}, AvgAge: {:.2}\n\n",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        snapshot.total_requests(),
        snapshot.success_rate(),
        snapshot.rate_limits,
        snapshot.not_founds,
        snapshot.other_errs,
        snapshot.recovered,
        snapshot.lost,
        summary.batch_id,
        summary.highest_id,
        summary.avg_thresholds_count,
        summary.avg_offset,
        summary.avg_hit_level,
        summary.avg_age_ms,
    )
}

#[cfg(test)]
mod status_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn record_carries_every_tick_field() {
        let snapshot = OutcomeSnapshot {
            rate_limits: 2,
            not_founds: 5,
            other_errs: 1,
            successes: 12,
            recovered: 3,
            lost: 1,
        };
        let summary = StateSummary {
            batch_id: 9,
            highest_id: 123_456,
            avg_thresholds_count: 4.5,
            avg_offset: 5.25,
            avg_hit_level: 2.0,
            avg_age_ms: 640.5,
        };

        let record = format_status_record(&snapshot, &summary);
        assert!(record.contains("Reqs: 20, Success: 60.00%"));
        assert!(record.contains("RateLimits (429): 2, NotFounds (404): 5, OtherErrs: 1"));
        assert!(record.contains("Recovered from backup: 3, Lost from backup: 1"));
        assert!(record.contains("BatchID: 9, HighestID: 123456"));
        assert!(record.contains("AvgThreshAmount: 4.50, AvgThreshOffset: 5.25"));
        assert!(record.contains("AvgHitThreshLevel: 2.00, AvgAge: 640.50"));
        assert!(record.ends_with("\n\n"));
    }

    #[test]
    fn record_reports_a_zero_rate_without_requests() {
        let snapshot = OutcomeSnapshot {
            rate_limits: 0,
            not_founds: 0,
            other_errs: 0,
            successes: 0,
            recovered: 0,
            lost: 0,
        };
        let summary = StateSummary {
            batch_id: 0,
            highest_id: 0,
            avg_thresholds_count: 0.0,
            avg_offset: 0.0,
            avg_hit_level: 0.0,
            avg_age_ms: 0.0,
        };

        let record = format_status_record(&snapshot, &summary);
        assert!(record.contains("Reqs: 0, Success: 0.00%"));
    }
}
