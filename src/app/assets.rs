#[derive(Debug, Error)]
enum AssetsError {
    #[error("error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("error parsing config file {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid proxy line {line:?}: should be host:port or host:port:username:password")]
    InvalidProxyLine { line: String },

    #[error("error parsing proxy url {url}: {source}")]
    InvalidProxyUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("no entries found in {path}")]
    EmptyAssetFile { path: String },
}

#[derive(Debug, Clone, Deserialize)]
struct Config {
    core: CoreCfg,
    http: HttpCfg,
    standard: StandardCfg,
    #[serde(rename = "thresholds_adjustment_policies")]
    policies: Vec<PolicyCfg>,
}

#[derive(Debug, Clone, Deserialize)]
struct CoreCfg {
    thresholds_initial_amount: u8,
    expected_max_thresholds_amount: u8,
    thresholds_offset: u8,
    batch_limits: BatchLimitsCfg,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchLimitsCfg {
    enable: bool,
    max_batch_size: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpCfg {
    requests_timeout_seconds: u64,
    cookies_sessions_amount: u16,
    cookies_refresh_delay: u64,
    crash_on_first_cookie_fetch_error: bool,
    max_retries_per_item: u8,
    delay_between_retries_milli: u64,
    max_rate_limits_per_second: i64,
    rate_limit_wait_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct StandardCfg {
    urls: UrlsCfg,
    items_response: ItemsResponseCfg,
    item_response: ItemResponseCfg,
    websocket: WebsocketCfg,
    session_cookie_names: Vec<String>,
    timestamp_format: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UrlsCfg {
    base_url: String,
    items_url: String,
    item_url: String,
    item_url_after_id: String,
    randomize_item_url_addition: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ItemsResponseCfg {
    items: String,
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ItemResponseCfg {
    item: String,
    timestamp: String,
    item_when_url_suffix: String,
    timestamp_when_url_suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WebsocketCfg {
    ws_urls: Vec<String>,
    #[serde(default)]
    ws_headers: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct PolicyCfg {
    percentage: f32,
    compute_increment: String,
}

impl Config {
    fn from_file(path: &str) -> Result<Config, AssetsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AssetsError::Io {
            path: path.to_string(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|source| AssetsError::Yaml {
            path: path.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AssetsError> {
        if self.core.thresholds_initial_amount == 0 {
            return Err(AssetsError::InvalidConfig(
                "core.thresholds_initial_amount must be greater than 0".to_string(),
            ));
        }
        if self.core.expected_max_thresholds_amount == 0 {
            return Err(AssetsError::InvalidConfig(
                "core.expected_max_thresholds_amount must be greater than 0".to_string(),
            ));
        }
        if self.core.thresholds_offset == 0 {
            return Err(AssetsError::InvalidConfig(
                "core.thresholds_offset must be greater than 0".to_string(),
            ));
        }
        if self.http.cookies_sessions_amount == 0 {
            return Err(AssetsError::InvalidConfig(
                "http.cookies_sessions_amount must be greater than 0".to_string(),
            ));
        }
        if self.standard.websocket.ws_urls.is_empty() {
            return Err(AssetsError::InvalidConfig(
                "standard.websocket.ws_urls must list at least one url".to_string(),
            ));
        }
        if self.standard.session_cookie_names.is_empty() {
            return Err(AssetsError::InvalidConfig(
                "standard.session_cookie_names must list at least one cookie".to_string(),
            ));
        }
        Ok(())
    }
}

fn load_user_agents(path: &str) -> Result<Vec<String>, AssetsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| AssetsError::Io {
        path: path.to_string(),
        source,
    })?;

    let user_agents = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();

    if user_agents.is_empty() {
        return Err(AssetsError::EmptyAssetFile {
            path: path.to_string(),
        });
    }
    Ok(user_agents)
}

fn load_proxies(path: &str) -> Result<Vec<Url>, AssetsError> {
    let raw = std::fs::read_to_string(path).map_err(|source| AssetsError::Io {
        path: path.to_string(),
        source,
    })?;

    let mut proxies = Vec::new();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let formatted = proxy_line_to_url(line)?;
        let parsed = Url::parse(&formatted).map_err(|source| AssetsError::InvalidProxyUrl {
            url: formatted,
            source,
        })?;
        proxies.push(parsed);
    }

    if proxies.is_empty() {
        return Err(AssetsError::EmptyAssetFile {
            path: path.to_string(),
        });
    }
    Ok(proxies)
}

// host:port becomes an http proxy without auth, host:port:user:password one
// with basic auth. Anything else is rejected.
fn proxy_line_to_url(line: &str) -> Result<String, AssetsError> {
    let fields = line.split(':').collect::<Vec<_>>();
    match fields.as_slice() {
        [host, port] => Ok(format!("http://{host}:{port}")),
        [host, port, user, password] => Ok(format!("http://{user}:{password}@{host}:{port}")),
        _ => Err(AssetsError::InvalidProxyLine {
            line: line.to_string(),
        }),
    }
}

#[cfg(test)]
fn test_config(base: &str) -> Config {
    let yaml = format!(
        r#"
core:
  thresholds_initial_amount: 4
  expected_max_thresholds_amount: 8
  thresholds_offset: 5
  batch_limits:
    enable: false
    max_batch_size: 64
http:
  requests_timeout_seconds: 5
  cookies_sessions_amount: 2
  cookies_refresh_delay: 60
  crash_on_first_cookie_fetch_error: false
  max_retries_per_item: 2
  delay_between_retries_milli: 10
  max_rate_limits_per_second: 1000
  rate_limit_wait_seconds: 1
standard:
  urls:
    base_url: {base}/
    items_url: {base}/items
    item_url: {base}/item/
    item_url_after_id: "?full=1"
    randomize_item_url_addition: false
  items_response:
    items: items
    id: id
  item_response:
    item: post
    timestamp: created_at
    item_when_url_suffix: post
    timestamp_when_url_suffix: created_at
  websocket:
    ws_urls: ["ws://127.0.0.1:9/sink"]
    ws_headers: {{}}
  session_cookie_names: ["sess"]
  timestamp_format: "%Y-%m-%d %H:%M:%S"
thresholds_adjustment_policies:
  - percentage: 0.9
    compute_increment: "2"
  - percentage: 0.0
    compute_increment: "-1"
"#
    );
    serde_yaml::from_str(&yaml).expect("test config must parse")
}

#[cfg(test)]
mod assets_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    #[test]
    fn proxy_line_without_auth() {
        assert_eq!(
            proxy_line_to_url("1.2.3.4:8080").unwrap(),
            "http://1.2.3.4:8080"
        );
    }

    #[test]
    fn proxy_line_with_auth() {
        assert_eq!(
            proxy_line_to_url("1.2.3.4:8080:u:p").unwrap(),
            "http://u:p@1.2.3.4:8080"
        );
    }

    #[test]
    fn proxy_line_with_wrong_field_count_is_rejected() {
        assert!(matches!(
            proxy_line_to_url("1.2.3.4:8080:user"),
            Err(AssetsError::InvalidProxyLine { .. })
        ));
        assert!(matches!(
            proxy_line_to_url("1.2.3.4"),
            Err(AssetsError::InvalidProxyLine { .. })
        ));
    }

    #[test]
    fn user_agents_file_skips_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Mozilla/5.0 first").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "Mozilla/5.0 second").unwrap();

        let agents = load_user_agents(file.path().to_str().unwrap()).unwrap();
        assert_eq!(agents, vec!["Mozilla/5.0 first", "Mozilla/5.0 second"]);
    }

    #[test]
    fn empty_user_agents_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            load_user_agents(file.path().to_str().unwrap()),
            Err(AssetsError::EmptyAssetFile { .. })
        ));
    }

    #[test]
    fn proxies_file_parses_both_forms() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.1:3128").unwrap();
        writeln!(file, "10.0.0.2:3128:alice:s3cret").unwrap();

        let proxies = load_proxies(file.path().to_str().unwrap()).unwrap();
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].as_str(), "http://10.0.0.1:3128/");
        assert_eq!(proxies[1].username(), "alice");
        assert_eq!(proxies[1].password(), Some("s3cret"));
    }

    #[test]
    fn config_parses_and_validates() {
        let config = test_config("http://example.invalid");
        assert_eq!(config.core.thresholds_initial_amount, 4);
        assert_eq!(config.http.cookies_sessions_amount, 2);
        assert_eq!(config.policies.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_with_zero_initial_amount_is_rejected() {
        let mut config = test_config("http://example.invalid");
        config.core.thresholds_initial_amount = 0;
        assert!(matches!(
            config.validate(),
            Err(AssetsError::InvalidConfig(_))
        ));
    }
}
