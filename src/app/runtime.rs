pub async fn run() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let cancel = CancellationToken::new();
    install_root_cancel(cancel.clone());
    tokio::spawn(handle_signals(cancel.clone()));

    info!("crawler started");

    let cfg = Arc::new(unwrap_or_fatal(
        Config::from_file(&cli.config_file),
        "error loading the config file",
    ));
    let proxies = unwrap_or_fatal(
        load_proxies(&cli.proxies_file),
        "error loading the proxies file",
    );
    let user_agents = unwrap_or_fatal(
        load_user_agents(&cli.user_agents_file),
        "error loading the user agents file",
    );
    let status_log = unwrap_or_fatal(
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cli.status_log_file),
        "error opening the status log file",
    );

    let policies = unwrap_or_fatal(
        compile_policies(&cfg.policies),
        "error compiling the thresholds adjustment policies",
    );
    let controller = unwrap_or_fatal(
        ThresholdsController::new(u16::from(cfg.core.thresholds_initial_amount), policies),
        "error building the thresholds controller",
    );

    let (pools, refresh_rxs) =
        HttpPools::init(proxies, &user_agents, cfg.http.cookies_sessions_amount);
    let pools = Arc::new(pools);
    info!(
        proxies = pools.proxies.len(),
        profiles = pools.profiles.len(),
        sessions = pools.sessions.len(),
        "request pools initialized"
    );

    let conns = Arc::new(dial_websockets(&cfg).await);

    let expected_max = usize::from(cfg.core.expected_max_thresholds_amount);
    let sub_workers = expected_max * usize::from(cfg.core.thresholds_offset);
    let backup_workers = backup_worker_count(
        sub_workers,
        cfg.http.max_retries_per_item,
        cfg.http.delay_between_retries_milli,
    );

    let (probe_tx, probe_rx) = async_channel::bounded::<ProbeRequest>(expected_max);
    let (probe_results_tx, probe_results_rx) = mpsc::channel::<FetchResult>(expected_max);
    let (gap_tx, gap_rx) = async_channel::bounded::<GapRequest>(sub_workers * 3);
    let (backup_tx, backup_rx) = async_channel::bounded::<BackupRequest>(backup_workers * 3);
    let (results_tx, results_rx) = mpsc::channel::<ResultsPayload>(backup_workers);

    let outcome = Arc::new(Outcome::default());
    let state = Arc::new(Mutex::new(State::default()));
    let env = WorkerEnv {
        cfg: cfg.clone(),
        pools: pools.clone(),
        outcome: outcome.clone(),
        state: state.clone(),
        cancel: cancel.clone(),
    };

    let mut workers = JoinSet::new();

    // every session owner starts first, and the frontier fetch below waits
    // until each one has completed its initial cookie fetch
    let mut ready_rxs = Vec::with_capacity(refresh_rxs.len());
    for (index, refresh_rx) in refresh_rxs.into_iter().enumerate() {
        let (ready_tx, ready_rx) = oneshot::channel();
        ready_rxs.push(ready_rx);
        let session = pools.sessions[index].clone();
        workers.spawn(
            cookie_refresher(env.clone(), session, refresh_rx, ready_tx)
                .instrument(info_span!("refresher", id = index + 1)),
        );
    }
    for ready_rx in ready_rxs {
        let _ = ready_rx.await;
    }
    info!("all cookie sessions ready");

    let initial_id = {
        let mut rng = SmallRng::from_entropy();
        let jar = pools.pick_session(&mut rng).jar();
        unwrap_or_fatal(
            fetch_highest_id(&cfg, &pools, jar, &mut rng).await,
            "the highest id fetch must succeed to start the crawler",
        )
    };

    for id in 0..expected_max {
        workers.spawn(
            thresholds_worker(env.clone(), probe_rx.clone(), probe_results_tx.clone())
                .instrument(info_span!("thresholds", id = id + 1)),
        );
    }
    for id in 0..sub_workers {
        workers.spawn(
            subordinate_worker(
                env.clone(),
                gap_rx.clone(),
                results_tx.clone(),
                backup_tx.clone(),
            )
            .instrument(info_span!("subordinate", id = id + 1)),
        );
    }
    for id in 0..backup_workers {
        workers.spawn(
            backup_worker(env.clone(), backup_rx.clone(), results_tx.clone())
                .instrument(info_span!("backup", id = id + 1)),
        );
    }
    workers.spawn(
        websocket_fanout(cancel.clone(), results_rx, conns).instrument(info_span!("fanout")),
    );

    let initial_offset = i64::from(cfg.core.thresholds_offset);
    let manager = BatchManager {
        cfg: cfg.clone(),
        controller,
        state: state.clone(),
        cancel: cancel.clone(),
        probe_tx,
        probe_results_rx,
        gap_tx,
        results_tx,
        rng: SmallRng::from_entropy(),
        batch_id: 0,
        highest_id: initial_id,
        offset: initial_offset,
        initial_offset,
    };
    workers.spawn(manager.run().instrument(info_span!("manager")));

    info!(
        thresholds_workers = expected_max,
        subordinate_workers = sub_workers,
        backup_workers,
        initial_id,
        "workers started"
    );

    tokio::spawn(supervise(workers, cancel.clone()));

    status_loop(cancel, outcome, state, status_log).await;

    // the cancel owner (signal handler or fatal assertion) is already
    // tearing the process down; a long-running crawler never exits 0
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    std::process::exit(1);
}

// A worker that stops while the pipeline is supposed to be running has hit
// an unrecoverable state, panics included.
async fn supervise(mut workers: JoinSet<()>, cancel: CancellationToken) {
    while let Some(joined) = workers.join_next().await {
        if cancel.is_cancelled() {
            continue;
        }
        match joined {
            Ok(()) => fatal("a worker returned while the crawler was running"),
            Err(err) if err.is_panic() => fatal(&format!("a worker panicked: {err}")),
            Err(err) => fatal(&format!("a worker task failed: {err}")),
        }
    }
}

async fn handle_signals(cancel: CancellationToken) {
    wait_for_signal().await;
    error!("interrupt received: stopping the crawler and aborting all in-flight requests");
    cancel.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    std::process::exit(1);
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// Sized so the tier can absorb every subordinate failing at once, each item
// retrying with its configured delay on top of a ~1s baseline request time.
// Tripling the worker count instead would waste resources under that
// pessimistic all-fail assumption; the input channel gets the 3x instead.
fn backup_worker_count(
    sub_workers: usize,
    max_retries_per_item: u8,
    delay_between_retries_ms: u64,
) -> usize {
    const BASELINE_REQUEST_MS: f64 = 1000.0;
    let retries = f64::from(max_retries_per_item.max(1));
    ((sub_workers as f64) * retries * (1.0 + delay_between_retries_ms as f64 / BASELINE_REQUEST_MS))
        .ceil() as usize
}
