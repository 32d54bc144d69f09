// Orchestrates one batch per iteration: probe the frontier with a stack of
// spaced ids, unwind the stack to find how far the content actually reaches,
// flood the gaps below it, and feed the hit level back to the controller.
struct BatchManager {
    cfg: Arc<Config>,
    controller: ThresholdsController,
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
    probe_tx: async_channel::Sender<ProbeRequest>,
    probe_results_rx: mpsc::Receiver<FetchResult>,
    gap_tx: async_channel::Sender<GapRequest>,
    results_tx: mpsc::Sender<ResultsPayload>,
    rng: SmallRng,
    batch_id: u16,
    highest_id: i64,
    offset: i64,
    initial_offset: i64,
}

impl BatchManager {
    async fn run(mut self) {
        info!(initial_id = self.highest_id, "batch manager started");
        while self.run_batch().await {}
        debug!("worker finished due to cancellation");
    }

    // One full batch. Returns false once the pipeline is shutting down.
    async fn run_batch(&mut self) -> bool {
        let last_succ_id = self.highest_id;
        let mut count = self.controller.count();
        let limits = &self.cfg.core.batch_limits;
        if limits.enable && limits.max_batch_size > 0 {
            count = count.min(limits.max_batch_size);
        }
        let issued_count = count;

        self.offset = walk_offset(self.offset, self.initial_offset, &mut self.rng);

        let mut results: HashMap<i64, FetchResult> = HashMap::with_capacity(usize::from(count));
        for _ in 0..count {
            self.highest_id += self.offset;
            let request = ProbeRequest {
                item_id: self.highest_id,
                batch_id: self.batch_id,
            };
            if self.probe_tx.send(request).await.is_err() {
                return false;
            }
        }

        let mut top_age_ms: u32 = 0;
        'collect: while count > 0 {
            let mut result = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                result = self.probe_results_rx.recv() => match result {
                    Some(result) => result,
                    None => return false,
                },
            };

            // results of earlier batches can still be in flight; they are
            // filtered here rather than drained between batches
            if result.item_id < last_succ_id {
                continue;
            }

            if result.success {
                if let Some(payload) = result.payload.take() {
                    let forward = ResultsPayload {
                        payload,
                        item_id: result.item_id,
                    };
                    if self.results_tx.send(forward).await.is_err() {
                        return false;
                    }
                }
            }
            results.insert(result.item_id, result);

            // unwind the probe stack: pop contiguous failures from the top
            // until the top probe is a success (the hit level) or the whole
            // stack has collapsed
            while count > 0 {
                let Some(top) = results.get(&self.highest_id) else {
                    break; // the top probe is still in flight
                };
                if top.success {
                    top_age_ms = top.age_ms;
                    break 'collect;
                }
                count -= 1;
                self.highest_id -= self.offset;
            }
        }

        let hit_level = count;
        let timestamp = if hit_level == 0 { 0 } else { top_age_ms };

        if hit_level > 0 {
            let mut success_ids = results
                .iter()
                .filter(|(_, result)| result.success)
                .map(|(item_id, _)| *item_id)
                .collect::<Vec<_>>();
            success_ids.sort_unstable();

            for item_id in gap_ids(last_succ_id, &success_ids) {
                let request = GapRequest {
                    item_id,
                    batch_id: self.batch_id,
                };
                if self.gap_tx.send(request).await.is_err() {
                    return false;
                }
            }
        }

        debug!(
            batch_id = self.batch_id,
            hit_level,
            thresholds_amount = self.controller.count(),
            ref_timestamp = self.controller.ref_timestamp(),
            offset = self.offset,
            last_succ_id,
            highest_id = self.highest_id,
            "batch completed"
        );

        self.state.lock().unwrap().record_batch(
            self.batch_id,
            self.highest_id,
            issued_count,
            self.offset,
            hit_level,
        );

        self.batch_id = self.batch_id.wrapping_add(1);
        self.controller.update(hit_level, timestamp);
        true
    }
}

// Random-walk the probe spacing by one step; reset to the configured value
// whenever the walk leaves [0.5x, 2x] of it.
fn walk_offset(current: i64, initial: i64, rng: &mut SmallRng) -> i64 {
    let walked = current + rng.gen_range(0i64..3) - 1;
    let abs = walked.abs() as f64;
    let initial_abs = initial.abs() as f64;
    if abs >= 2.0 * initial_abs || abs <= 0.5 * initial_abs {
        initial
    } else {
        walked
    }
}

// The ids the subordinates must fill: everything strictly between the last
// successful id and each successful probe, the probes themselves excluded.
fn gap_ids(last_succ_id: i64, sorted_success_ids: &[i64]) -> Vec<i64> {
    let mut ids = Vec::new();
    let mut last_succ = last_succ_id;
    for &interrupt_id in sorted_success_ids {
        ids.extend((last_succ + 1)..interrupt_id);
        last_succ = interrupt_id;
    }
    ids
}
