struct AbortTaskOnDrop(tokio::task::AbortHandle);

impl Drop for AbortTaskOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// The sole mechanism bounding the aggregate request rate: the status
// aggregator zeroes the counter every tick, so a breach stalls every worker
// for the configured wait.
async fn rate_limit_brake(env: &WorkerEnv) {
    if env
        .outcome
        .rate_limits_exceeded(env.cfg.http.max_rate_limits_per_second)
    {
        tokio::time::sleep(Duration::from_secs(env.cfg.http.rate_limit_wait_seconds)).await;
    }
}

fn parse_timestamp(raw: &str, format: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_str(raw, format)
        .map(|parsed| parsed.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, format).map(|naive| Utc.from_utc_datetime(&naive))
        })
}

// A malformed success payload means the origin changed its schema; carrying
// on would forward garbage, so it is a fatal assertion.
fn publish_age_ms(cfg: &Config, payload: &Value, suffix_appended: bool) -> u32 {
    let keys = &cfg.standard.item_response;
    let (item_key, timestamp_key) = if suffix_appended {
        (
            keys.item_when_url_suffix.as_str(),
            keys.timestamp_when_url_suffix.as_str(),
        )
    } else {
        (keys.item.as_str(), keys.timestamp.as_str())
    };

    let raw = payload
        .get(item_key)
        .and_then(|item| item.get(timestamp_key))
        .and_then(Value::as_str)
        .unwrap_or_else(|| {
            fatal(&format!(
                "item response is missing {item_key}.{timestamp_key}, the origin schema changed"
            ))
        });

    let published = match parse_timestamp(raw, &cfg.standard.timestamp_format) {
        Ok(published) => published,
        Err(err) => fatal(&format!(
            "item timestamp {raw:?} does not match the configured format: {err}"
        )),
    };

    // origins occasionally publish timestamps slightly in the future while
    // their caches sync, so the age is clamped at zero
    (Utc::now() - published)
        .num_milliseconds()
        .clamp(0, i64::from(u32::MAX)) as u32
}

// Probe fetcher: every received probe produces exactly one result on
// results_tx, failed fetches included.
async fn thresholds_worker(
    env: WorkerEnv,
    probe_rx: async_channel::Receiver<ProbeRequest>,
    results_tx: mpsc::Sender<FetchResult>,
) {
    let mut rng = SmallRng::from_entropy();

    loop {
        let request = tokio::select! {
            _ = env.cancel.cancelled() => {
                debug!("worker finished due to cancellation");
                return;
            }
            request = probe_rx.recv() => match request {
                Ok(request) => request,
                Err(_) => return,
            },
        };

        rate_limit_brake(&env).await;

        let session = env.pools.pick_session(&mut rng).clone();
        let (suffix_appended, fetched) = fetch_item(
            &env.cfg,
            &env.pools,
            session.jar(),
            request.item_id,
            &mut rng,
        )
        .await;

        match fetched {
            Err(err) => {
                if matches!(err, FetchError::Unauthorized) {
                    session.signal_refresh();
                }
                env.outcome.record_error(&err);
                warn!(
                    item_id = request.item_id,
                    batch_id = request.batch_id,
                    "error fetching threshold item: {err}"
                );
                let _ = results_tx
                    .send(FetchResult {
                        payload: None,
                        item_id: request.item_id,
                        success: false,
                        age_ms: 0,
                    })
                    .await;
            }
            Ok(payload) => {
                env.outcome.successes.fetch_add(1, Ordering::Relaxed);
                let age_ms = publish_age_ms(&env.cfg, &payload, suffix_appended);
                env.state.lock().unwrap().record_age(age_ms);
                debug!(
                    item_id = request.item_id,
                    batch_id = request.batch_id,
                    age_ms,
                    "threshold item fetched"
                );
                let _ = results_tx
                    .send(FetchResult {
                        payload: Some(payload),
                        item_id: request.item_id,
                        success: true,
                        age_ms,
                    })
                    .await;
            }
        }
    }
}

// Gap fetcher: successes go straight to the fanout, any failure is handed to
// the backup tier instead of being reported upstream.
async fn subordinate_worker(
    env: WorkerEnv,
    gap_rx: async_channel::Receiver<GapRequest>,
    results_tx: mpsc::Sender<ResultsPayload>,
    backup_tx: async_channel::Sender<BackupRequest>,
) {
    let mut rng = SmallRng::from_entropy();

    loop {
        let request = tokio::select! {
            _ = env.cancel.cancelled() => {
                debug!("worker finished due to cancellation");
                return;
            }
            request = gap_rx.recv() => match request {
                Ok(request) => request,
                Err(_) => return,
            },
        };

        rate_limit_brake(&env).await;

        let session = env.pools.pick_session(&mut rng).clone();
        let (suffix_appended, fetched) = fetch_item(
            &env.cfg,
            &env.pools,
            session.jar(),
            request.item_id,
            &mut rng,
        )
        .await;

        match fetched {
            Err(err) => {
                if matches!(err, FetchError::Unauthorized) {
                    session.signal_refresh();
                }
                env.outcome.record_error(&err);
                if matches!(err, FetchError::NotFound) {
                    env.outcome.consecutive_errs.fetch_add(1, Ordering::Relaxed);
                }
                env.outcome.sent_to_backup.fetch_add(1, Ordering::Relaxed);
                warn!(
                    item_id = request.item_id,
                    batch_id = request.batch_id,
                    "error fetching item, handing it to backup: {err}"
                );
                let _ = backup_tx
                    .send(BackupRequest {
                        item_id: request.item_id,
                        suffix_appended,
                    })
                    .await;
            }
            Ok(payload) => {
                env.outcome.successes.fetch_add(1, Ordering::Relaxed);
                env.outcome.consecutive_errs.store(0, Ordering::Relaxed);
                let age_ms = publish_age_ms(&env.cfg, &payload, suffix_appended);
                env.state.lock().unwrap().record_age(age_ms);
                debug!(
                    item_id = request.item_id,
                    batch_id = request.batch_id,
                    age_ms,
                    "item fetched"
                );
                let _ = results_tx
                    .send(ResultsPayload {
                        payload,
                        item_id: request.item_id,
                    })
                    .await;
            }
        }
    }
}

// Last line of recovery: retries each handed-over item with a fixed delay
// until it either lands or exhausts its budget and is declared lost.
async fn backup_worker(
    env: WorkerEnv,
    backup_rx: async_channel::Receiver<BackupRequest>,
    results_tx: mpsc::Sender<ResultsPayload>,
) {
    let mut rng = SmallRng::from_entropy();
    // max_retries_per_item = 0 leaves this at -1: a single attempt, lost on
    // its first failure
    let max_retries = i32::from(env.cfg.http.max_retries_per_item) - 1;
    let retry_delay = Duration::from_millis(env.cfg.http.delay_between_retries_milli);

    loop {
        let request = tokio::select! {
            _ = env.cancel.cancelled() => {
                debug!("worker finished due to cancellation");
                return;
            }
            request = backup_rx.recv() => match request {
                Ok(request) => request,
                Err(_) => return,
            },
        };

        rate_limit_brake(&env).await;

        let urls = &env.cfg.standard.urls;
        let mut url = format!("{}{}", urls.item_url, request.item_id);
        if request.suffix_appended {
            url.push_str(&urls.item_url_after_id);
        }

        let mut retries: i32 = 0;
        let (mut s401, mut s404, mut s429, mut s_other) = (0u32, 0u32, 0u32, 0u32);

        loop {
            let session = env.pools.pick_session(&mut rng).clone();
            match fetch_json(
                &env.pools,
                session.jar(),
                &url,
                env.cfg.http.requests_timeout_seconds,
                &mut rng,
            )
            .await
            {
                Err(err) => {
                    match err {
                        FetchError::Unauthorized => {
                            session.signal_refresh();
                            s401 += 1;
                        }
                        FetchError::RateLimit => s429 += 1,
                        FetchError::NotFound => s404 += 1,
                        _ => s_other += 1,
                    }

                    retries += 1;
                    if retries > max_retries {
                        env.outcome.lost.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            item_id = request.item_id,
                            attempts = retries,
                            s401,
                            s404,
                            s429,
                            s_other,
                            "item skipped after exhausting its retry budget"
                        );
                        break;
                    }

                    tokio::select! {
                        _ = env.cancel.cancelled() => return,
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
                Ok(payload) => {
                    env.outcome.recovered.fetch_add(1, Ordering::Relaxed);
                    let age_ms = publish_age_ms(&env.cfg, &payload, request.suffix_appended);
                    env.state.lock().unwrap().record_age(age_ms);
                    debug!(
                        item_id = request.item_id,
                        attempts = retries + 1,
                        s401,
                        s404,
                        s429,
                        s_other,
                        age_ms,
                        "item recovered"
                    );
                    let _ = results_tx
                        .send(ResultsPayload {
                            payload,
                            item_id: request.item_id,
                        })
                        .await;
                    break;
                }
            }
        }
    }
}

// Owns one session jar: fetches it once at startup (gating the manager
// through ready_tx), then keeps it fresh on a cadence and on demand.
async fn cookie_refresher(
    env: WorkerEnv,
    session: Arc<CookieSession>,
    mut refresh_rx: mpsc::Receiver<()>,
    ready_tx: oneshot::Sender<()>,
) {
    let mut rng = SmallRng::from_entropy();

    match fetch_cookie(&env.cfg, &env.pools, &session, &mut rng).await {
        Ok(()) => info!("first cookie fetched"),
        Err(err) => {
            if env.cfg.http.crash_on_first_cookie_fetch_error {
                fatal(&format!("error fetching first cookie: {err}"));
            }
            warn!("error fetching first cookie: {err}");
        }
    }

    let _ = ready_tx.send(());

    let periodic = {
        let env = env.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let mut rng = SmallRng::from_entropy();
            let delay = Duration::from_secs(env.cfg.http.cookies_refresh_delay);
            loop {
                // plain sleep instead of an interval: the delay counts from
                // the end of one fetch to the start of the next
                tokio::select! {
                    _ = env.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(err) = fetch_cookie(&env.cfg, &env.pools, &session, &mut rng).await {
                    error!("error fetching cookie: {err}");
                }
            }
        })
    };
    let _periodic_guard = AbortTaskOnDrop(periodic.abort_handle());

    loop {
        tokio::select! {
            _ = env.cancel.cancelled() => {
                debug!("worker finished due to cancellation");
                return;
            }
            signal = refresh_rx.recv() => {
                if signal.is_none() {
                    return;
                }
                if let Err(err) = fetch_cookie(&env.cfg, &env.pools, &session, &mut rng).await {
                    warn!("error refreshing cookie on demand: {err}");
                }
                // discard the refresh requests that queued up in the
                // meantime, the fetch above already covers them
                while refresh_rx.try_recv().is_ok() {}
            }
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct SafeConn {
    conn: AsyncMutex<WsStream>,
}

impl SafeConn {
    fn new(stream: WsStream) -> SafeConn {
        SafeConn {
            conn: AsyncMutex::new(stream),
        }
    }

    async fn send_text(&self, text: String) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        self.conn.lock().await.send(Message::Text(text)).await
    }
}

async fn dial_websockets(cfg: &Config) -> Vec<SafeConn> {
    let websocket = &cfg.standard.websocket;
    let mut conns = Vec::with_capacity(websocket.ws_urls.len());

    for ws_url in &websocket.ws_urls {
        let mut request = unwrap_or_fatal(
            ws_url.as_str().into_client_request(),
            "error building websocket request",
        );
        for (name, value) in &websocket.ws_headers {
            let header_name = unwrap_or_fatal(
                HeaderName::from_bytes(name.as_bytes()),
                "invalid websocket header name",
            );
            for value in header_values(value) {
                let header_value = unwrap_or_fatal(
                    HeaderValue::from_str(&value),
                    "invalid websocket header value",
                );
                request.headers_mut().append(header_name.clone(), header_value);
            }
        }

        let (stream, _) = unwrap_or_fatal(
            connect_async(request).await,
            "error connecting to websocket",
        );
        info!("connected to websocket with url: {ws_url}");
        conns.push(SafeConn::new(stream));
    }

    conns
}

fn header_values(value: &serde_yaml::Value) -> Vec<String> {
    match value {
        serde_yaml::Value::String(text) => vec![text.clone()],
        serde_yaml::Value::Number(number) => vec![number.to_string()],
        serde_yaml::Value::Bool(flag) => vec![flag.to_string()],
        serde_yaml::Value::Sequence(entries) => entries.iter().flat_map(header_values).collect(),
        _ => Vec::new(),
    }
}

// Round-robins payloads across the outbound connections. Encoding and the
// send itself run in their own task, so ordering across payloads is not
// preserved; each payload is attempted exactly once on exactly one
// connection.
async fn websocket_fanout(
    cancel: CancellationToken,
    mut results_rx: mpsc::Receiver<ResultsPayload>,
    conns: Arc<Vec<SafeConn>>,
) {
    let conns_amount = conns.len();
    let mut current_conn_idx: usize = 0;

    loop {
        let element = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("worker finished due to cancellation");
                return;
            }
            element = results_rx.recv() => match element {
                Some(element) => element,
                None => return,
            },
        };

        let conns = conns.clone();
        let conn_idx = current_conn_idx;
        tokio::spawn(async move {
            let text = match serde_json::to_string(&element.payload) {
                Ok(text) => text,
                Err(err) => {
                    error!(
                        item_id = element.item_id,
                        "error encoding item, impossible sending to websocket: {err}"
                    );
                    return;
                }
            };
            if let Err(err) = conns[conn_idx].send_text(text).await {
                error!(
                    item_id = element.item_id,
                    "error sending item to websocket: {err}"
                );
            }
        });

        current_conn_idx = (current_conn_idx + 1) % conns_amount;
    }
}
