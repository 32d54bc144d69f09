const REFRESH_SIGNAL_CAPACITY: usize = 10_000;

// Small pools the profile generator combines with every user agent. The
// cartesian product gives each request an independently plausible header
// surface.
const REFERRERS: &[&str] = &[
    "https://www.google.com/",
    "https://www.bing.com/",
    "https://www.reddit.com/",
    "https://www.youtube.com/",
    "https://www.wikipedia.org/",
    "https://duckduckgo.com/",
];

const ACCEPT_LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-US,en;q=0.9,en-CA;q=0.8",
    "en-GB,en;q=0.9,en-US;q=0.8",
    "en-US,es;q=0.8",
];

#[derive(Debug, Clone)]
struct HeaderProfile {
    headers: HeaderMap,
}

// One cookie jar shared by many readers; the refresher task is the only
// writer and swaps the whole jar on a successful refresh.
struct CookieSession {
    jar: RwLock<Arc<Jar>>,
    refresh_tx: mpsc::Sender<()>,
}

impl CookieSession {
    fn jar(&self) -> Arc<Jar> {
        self.jar.read().unwrap().clone()
    }

    fn replace_jar(&self, jar: Arc<Jar>) {
        *self.jar.write().unwrap() = jar;
    }

    // Non-blocking: a full channel means the refresher already has work
    // queued that subsumes this request.
    fn signal_refresh(&self) {
        let _ = self.refresh_tx.try_send(());
    }
}

// Initialized once at startup, read-only afterwards.
struct HttpPools {
    proxies: Vec<Url>,
    profiles: Vec<HeaderProfile>,
    sessions: Vec<Arc<CookieSession>>,
}

impl HttpPools {
    fn init(
        proxies: Vec<Url>,
        user_agents: &[String],
        sessions_amount: u16,
    ) -> (HttpPools, Vec<mpsc::Receiver<()>>) {
        let mut sessions = Vec::with_capacity(usize::from(sessions_amount));
        let mut refresh_rxs = Vec::with_capacity(usize::from(sessions_amount));
        for _ in 0..sessions_amount {
            let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_SIGNAL_CAPACITY);
            sessions.push(Arc::new(CookieSession {
                jar: RwLock::new(Arc::new(Jar::default())),
                refresh_tx,
            }));
            refresh_rxs.push(refresh_rx);
        }

        let pools = HttpPools {
            proxies,
            profiles: generate_profiles(user_agents),
            sessions,
        };
        (pools, refresh_rxs)
    }

    fn pick_proxy(&self, rng: &mut SmallRng) -> Option<&Url> {
        self.proxies.choose(rng)
    }

    // The two pickers below are not bounds-checked: init is handed validated,
    // non-empty asset lists.
    fn pick_profile(&self, rng: &mut SmallRng) -> &HeaderProfile {
        &self.profiles[rng.gen_range(0..self.profiles.len())]
    }

    fn pick_session(&self, rng: &mut SmallRng) -> &Arc<CookieSession> {
        &self.sessions[rng.gen_range(0..self.sessions.len())]
    }
}

fn generate_profiles(user_agents: &[String]) -> Vec<HeaderProfile> {
    let mut profiles = Vec::new();

    for user_agent in user_agents {
        let Ok(user_agent_value) = HeaderValue::from_str(user_agent) else {
            warn!("skipping user agent with non-header characters: {user_agent:?}");
            continue;
        };

        for &referrer in REFERRERS {
            for &accept_language in ACCEPT_LANGUAGES {
                let mut headers = HeaderMap::new();
                headers.insert(USER_AGENT, user_agent_value.clone());
                headers.insert(REFERER, HeaderValue::from_static(referrer));
                headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(accept_language));
                headers.insert(
                    ACCEPT,
                    HeaderValue::from_static("application/json, text/plain, */*"),
                );
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
                headers.insert(
                    HeaderName::from_static("sec-fetch-site"),
                    HeaderValue::from_static("none"),
                );
                headers.insert(
                    HeaderName::from_static("sec-fetch-mode"),
                    HeaderValue::from_static("navigate"),
                );
                headers.insert(
                    HeaderName::from_static("sec-fetch-dest"),
                    HeaderValue::from_static("document"),
                );
                headers.insert(
                    HeaderName::from_static("upgrade-insecure-requests"),
                    HeaderValue::from_static("1"),
                );
                profiles.push(HeaderProfile { headers });
            }
        }
    }

    profiles
}

// One client per request: proxy and header profile are sampled independently
// for every call, so transports are never shared across requests.
fn build_client(
    pools: &HttpPools,
    jar: Arc<Jar>,
    timeout_seconds: u64,
    rng: &mut SmallRng,
) -> Result<Client, FetchError> {
    let profile = pools.pick_profile(rng);
    let mut builder = Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .default_headers(profile.headers.clone())
        .cookie_provider(jar);

    if let Some(proxy) = pools.pick_proxy(rng) {
        builder = builder.proxy(Proxy::all(proxy.as_str())?);
    }

    Ok(builder.build()?)
}

async fn fetch_json(
    pools: &HttpPools,
    jar: Arc<Jar>,
    url: &str,
    timeout_seconds: u64,
    rng: &mut SmallRng,
) -> Result<Value, FetchError> {
    let client = build_client(pools, jar, timeout_seconds, rng)?;
    let response = client.get(url).send().await?;

    if response.status() != StatusCode::OK {
        return Err(infer_http_error(response.status()));
    }

    match response.json::<Value>().await {
        Ok(decoded) => Ok(decoded),
        // a 200 whose body is not the expected JSON means the origin changed
        // its schema; continuing would forward meaningless data
        Err(err) if err.is_decode() => fatal(&format!(
            "undecodable success response from {url}: {err}"
        )),
        Err(err) => Err(err.into()),
    }
}

// The suffix coin flip happens before the request so the caller knows which
// response key set applies even when the fetch fails.
async fn fetch_item(
    cfg: &Config,
    pools: &HttpPools,
    jar: Arc<Jar>,
    item_id: i64,
    rng: &mut SmallRng,
) -> (bool, Result<Value, FetchError>) {
    let urls = &cfg.standard.urls;
    let mut url = format!("{}{}", urls.item_url, item_id);

    let suffix_appended = !urls.randomize_item_url_addition || rng.gen_range(0..2) == 1;
    if suffix_appended {
        url.push_str(&urls.item_url_after_id);
    }

    let result = fetch_json(
        pools,
        jar,
        &url,
        cfg.http.requests_timeout_seconds,
        rng,
    )
    .await;
    (suffix_appended, result)
}

async fn fetch_highest_id(
    cfg: &Config,
    pools: &HttpPools,
    jar: Arc<Jar>,
    rng: &mut SmallRng,
) -> Result<i64, FetchError> {
    let decoded = fetch_json(
        pools,
        jar,
        &cfg.standard.urls.items_url,
        cfg.http.requests_timeout_seconds,
        rng,
    )
    .await?;

    let items = decoded
        .get(&cfg.standard.items_response.items)
        .and_then(Value::as_array)
        .ok_or(FetchError::ListingShape("items field is not a list"))?;

    let mut highest: f64 = 0.0;
    for item in items {
        let item_id = item
            .get(&cfg.standard.items_response.id)
            .and_then(Value::as_f64)
            .ok_or(FetchError::ListingShape("item id is not a number"))?;
        highest = highest.max(item_id);
    }

    Ok(highest as i64)
}

// Refresh protocol: build a temporary jar carrying the currently held
// non-target cookies, GET the base url through it, and only swap the session
// jar in when every target cookie name showed up in the response.
async fn fetch_cookie(
    cfg: &Config,
    pools: &HttpPools,
    session: &CookieSession,
    rng: &mut SmallRng,
) -> Result<(), FetchError> {
    let base = Url::parse(&cfg.standard.urls.base_url)?;
    let target_names = &cfg.standard.session_cookie_names;

    let tmp_jar = Arc::new(Jar::default());
    for pair in cookie_pairs(session.jar().cookies(&base)) {
        let name = pair.split_once('=').map(|(name, _)| name).unwrap_or(&pair);
        if !target_names.iter().any(|target| target == name) {
            tmp_jar.add_cookie_str(&pair, &base);
        }
    }

    let client = build_client(
        pools,
        tmp_jar.clone(),
        cfg.http.requests_timeout_seconds,
        rng,
    )?;
    let response = client.get(base.clone()).send().await?;
    if response.status() != StatusCode::OK {
        return Err(infer_http_error(response.status()));
    }
    drop(response);

    let refreshed_names = cookie_pairs(tmp_jar.cookies(&base))
        .into_iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(name, _)| name.to_string())
                .unwrap_or(pair)
        })
        .collect::<HashSet<_>>();

    let missing = target_names
        .iter()
        .filter(|target| !refreshed_names.contains(*target))
        .count();
    if missing > 0 {
        return Err(FetchError::MissingTargetCookies { missing });
    }

    session.replace_jar(tmp_jar);
    Ok(())
}

fn cookie_pairs(header: Option<HeaderValue>) -> Vec<String> {
    let Some(header) = header else {
        return Vec::new();
    };
    let Ok(raw) = header.to_str() else {
        return Vec::new();
    };
    raw.split("; ").map(str::to_string).collect()
}

#[cfg(test)]
mod network_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_pools() -> (Arc<HttpPools>, Vec<mpsc::Receiver<()>>) {
        let (pools, refresh_rxs) =
            HttpPools::init(Vec::new(), &["test-agent/1.0".to_string()], 1);
        (Arc::new(pools), refresh_rxs)
    }

    fn test_rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    #[test]
    fn profiles_cover_the_header_pools() {
        let profiles = generate_profiles(&["agent-a".to_string(), "agent-b".to_string()]);
        assert_eq!(profiles.len(), 2 * REFERRERS.len() * ACCEPT_LANGUAGES.len());
        assert!(
            profiles
                .iter()
                .all(|profile| profile.headers.contains_key(USER_AGENT))
        );
    }

    #[tokio::test]
    async fn fetch_item_appends_the_suffix_when_randomization_is_off() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/42"))
            .and(query_param("full", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "post": { "created_at": "2024-05-01 10:00:00" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = test_config(&server.uri());
        let (pools, _refresh_rxs) = test_pools();
        let mut rng = test_rng();

        let jar = pools.pick_session(&mut rng).jar();
        let (suffix_appended, result) = fetch_item(&cfg, &pools, jar, 42, &mut rng).await;
        assert!(suffix_appended);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn fetch_json_classifies_http_statuses() {
        let server = MockServer::start().await;
        for (route, status) in [
            ("/s401", 401),
            ("/s404", 404),
            ("/s429", 429),
            ("/s500", 500),
        ] {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }

        let (pools, _refresh_rxs) = test_pools();
        let mut rng = test_rng();
        let jar = pools.pick_session(&mut rng).jar();

        let mut classified = Vec::new();
        for route in ["/s401", "/s404", "/s429", "/s500"] {
            let url = format!("{}{route}", server.uri());
            classified.push(
                fetch_json(&pools, jar.clone(), &url, 5, &mut rng)
                    .await
                    .unwrap_err(),
            );
        }

        assert!(matches!(classified[0], FetchError::Unauthorized));
        assert!(matches!(classified[1], FetchError::NotFound));
        assert!(matches!(classified[2], FetchError::RateLimit));
        assert!(matches!(classified[3], FetchError::UnexpectedStatus(500)));
    }

    #[tokio::test]
    async fn fetch_highest_id_takes_the_listing_maximum() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "id": 3 }, { "id": 9 }, { "id": 4 }]
            })))
            .mount(&server)
            .await;

        let cfg = test_config(&server.uri());
        let (pools, _refresh_rxs) = test_pools();
        let mut rng = test_rng();
        let jar = pools.pick_session(&mut rng).jar();

        let highest = fetch_highest_id(&cfg, &pools, jar, &mut rng).await.unwrap();
        assert_eq!(highest, 9);
    }

    #[tokio::test]
    async fn fetch_highest_id_rejects_a_malformed_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "items": "not-a-list" })),
            )
            .mount(&server)
            .await;

        let cfg = test_config(&server.uri());
        let (pools, _refresh_rxs) = test_pools();
        let mut rng = test_rng();
        let jar = pools.pick_session(&mut rng).jar();

        assert!(matches!(
            fetch_highest_id(&cfg, &pools, jar, &mut rng).await,
            Err(FetchError::ListingShape(_))
        ));
    }

    #[tokio::test]
    async fn cookie_refresh_swaps_the_jar_when_targets_arrive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("set-cookie", "sess=fresh; Path=/"),
            )
            .mount(&server)
            .await;

        let cfg = test_config(&server.uri());
        let (pools, _refresh_rxs) = test_pools();
        let mut rng = test_rng();
        let session = pools.pick_session(&mut rng).clone();

        // a held non-target cookie must survive the refresh
        let base = Url::parse(&cfg.standard.urls.base_url).unwrap();
        session.jar().add_cookie_str("other=kept", &base);

        fetch_cookie(&cfg, &pools, &session, &mut rng).await.unwrap();

        let pairs = cookie_pairs(session.jar().cookies(&base));
        assert!(pairs.iter().any(|pair| pair == "sess=fresh"));
        assert!(pairs.iter().any(|pair| pair == "other=kept"));
    }

    #[tokio::test]
    async fn cookie_refresh_fails_without_the_target_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).insert_header("set-cookie", "unrelated=1; Path=/"),
            )
            .mount(&server)
            .await;

        let cfg = test_config(&server.uri());
        let (pools, _refresh_rxs) = test_pools();
        let mut rng = test_rng();
        let session = pools.pick_session(&mut rng).clone();

        assert!(matches!(
            fetch_cookie(&cfg, &pools, &session, &mut rng).await,
            Err(FetchError::MissingTargetCookies { missing: 1 })
        ));

        // the session jar was not swapped
        let base = Url::parse(&cfg.standard.urls.base_url).unwrap();
        assert!(cookie_pairs(session.jar().cookies(&base)).is_empty());
    }
}
