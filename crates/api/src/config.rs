/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Bound on draining running jobs at shutdown, in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins = split_list(
            &std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "http://localhost:5173".into()),
        );

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let shutdown_timeout_secs: u64 = std::env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("SHUTDOWN_TIMEOUT_SECS must be a valid u64");

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
        }
    }
}

/// Where the external collaborators live.
///
/// Any missing URL means the in-memory implementation is used instead.
#[derive(Debug, Clone, Default)]
pub struct CollaboratorConfig {
    pub prompt_service_url: Option<String>,
    pub image_service_url: Option<String>,
    pub asset_service_url: Option<String>,
    /// `(platform, base_url)` pairs from `PUBLISHER_URLS`.
    pub publishers: Vec<(String, String)>,
}

impl CollaboratorConfig {
    /// Load `PROMPT_SERVICE_URL`, `IMAGE_SERVICE_URL`, `ASSET_SERVICE_URL`
    /// and `PUBLISHER_URLS` (`name=url,name=url`).
    ///
    /// # Panics
    ///
    /// Panics if a `PUBLISHER_URLS` entry is not of the form `name=url`.
    pub fn from_env() -> Self {
        let publishers = std::env::var("PUBLISHER_URLS")
            .map(|raw| {
                parse_publisher_urls(&raw)
                    .unwrap_or_else(|e| panic!("PUBLISHER_URLS is invalid: {e}"))
            })
            .unwrap_or_default();

        Self {
            prompt_service_url: non_empty_var("PROMPT_SERVICE_URL"),
            image_service_url: non_empty_var("IMAGE_SERVICE_URL"),
            asset_service_url: non_empty_var("ASSET_SERVICE_URL"),
            publishers,
        }
    }

    /// True when no external service is configured at all.
    pub fn is_empty(&self) -> bool {
        self.prompt_service_url.is_none()
            && self.image_service_url.is_none()
            && self.asset_service_url.is_none()
            && self.publishers.is_empty()
    }
}

/// Parse `name=url,name=url` into pairs.
pub fn parse_publisher_urls(raw: &str) -> Result<Vec<(String, String)>, String> {
    split_list(raw)
        .into_iter()
        .map(|entry| match entry.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                Ok((name.trim().to_string(), url.trim().to_string()))
            }
            _ => Err(format!("expected name=url, got '{entry}'")),
        })
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_urls_parse_pairs() {
        let parsed = parse_publisher_urls("printify=http://a:1, etsy = http://b:2 ,").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("printify".to_string(), "http://a:1".to_string()),
                ("etsy".to_string(), "http://b:2".to_string()),
            ]
        );
    }

    #[test]
    fn publisher_urls_reject_missing_url() {
        assert!(parse_publisher_urls("printify").is_err());
        assert!(parse_publisher_urls("=http://a").is_err());
    }

    #[test]
    fn empty_collaborator_config_is_empty() {
        assert!(CollaboratorConfig::default().is_empty());
    }
}
