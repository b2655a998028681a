//! Configuration loading from disk and the process environment.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{GatewayConfig, LogFormat, RouteConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {reason}")]
    Env { var: &'static str, reason: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Backend services the gateway fronts, keyed by the environment variable
/// that carries their base URL.
pub const SERVICE_ROUTES: &[(&str, &str, bool)] = &[
    ("USER_SERVICE_URL", "/api/v1/user", false),
    ("POST_SERVICE_URL", "/api/v1/post", false),
    ("FEED_SERVICE_URL", "/api/v1/feed", false),
    ("CHAT_SERVICE_URL", "/api/v1/chat", true),
    ("NOTIFICATION_SERVICE_URL", "/api/v1/notification", true),
];

const CORS_ORIGIN_VARS: &[&str] = &["FRONTEND_HOST_URL", "FRONTEND_AUTH_URL"];

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let config = parse_config(&fs::read_to_string(path)?)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Parse configuration text without validating it.
pub fn parse_config(content: &str) -> Result<GatewayConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Resolve the startup configuration: optional file, then environment
/// overrides, then validation.
pub fn load(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let mut config = match path {
        Some(path) => parse_config(&fs::read_to_string(path)?)?,
        None => GatewayConfig::default(),
    };
    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Overlay environment variables onto `config`.
///
/// `lookup` abstracts the environment so overrides can be exercised without
/// mutating process state.
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("PORT") {
        let port: u16 = port.trim().parse().map_err(|_| ConfigError::Env {
            var: "PORT",
            reason: format!("`{port}` is not a port number"),
        })?;
        let host = config
            .listener
            .bind_address
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        config.listener.bind_address = format!("{host}:{port}");
    }

    for &(var, prefix, websocket) in SERVICE_ROUTES {
        let Some(backend) = lookup(var).filter(|v| !v.trim().is_empty()) else {
            continue;
        };
        let backend = backend.trim().to_string();
        match config.routes.iter_mut().find(|r| r.prefix == prefix) {
            Some(route) => route.backend = backend,
            None => config.routes.push(RouteConfig {
                prefix: prefix.to_string(),
                backend,
                websocket,
            }),
        }
    }

    for &var in CORS_ORIGIN_VARS {
        if let Some(origin) = lookup(var).filter(|v| !v.trim().is_empty()) {
            let origin = origin.trim().trim_end_matches('/').to_string();
            if !config.cors.allowed_origins.contains(&origin) {
                config.cors.allowed_origins.push(origin);
            }
        }
    }

    if let Some(window) = lookup("RATE_LIMIT_WINDOW_SECS") {
        config.rate_limit.window_secs = window.trim().parse().map_err(|_| ConfigError::Env {
            var: "RATE_LIMIT_WINDOW_SECS",
            reason: format!("`{window}` is not a number of seconds"),
        })?;
    }
    if let Some(max) = lookup("RATE_LIMIT_MAX_REQUESTS") {
        config.rate_limit.max_requests = max.trim().parse().map_err(|_| ConfigError::Env {
            var: "RATE_LIMIT_MAX_REQUESTS",
            reason: format!("`{max}` is not a request count"),
        })?;
    }

    if let Some(level) = lookup("LOG_LEVEL") {
        config.observability.log_level = level;
    }
    if let Some(format) = lookup("LOG_FORMAT") {
        config.observability.log_format = match format.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => {
                return Err(ConfigError::Env {
                    var: "LOG_FORMAT",
                    reason: format!("`{format}` is neither `pretty` nor `json`"),
                })
            }
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn service_urls_build_route_table_in_order() {
        let mut config = GatewayConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("CHAT_SERVICE_URL", "http://chat:4000"),
                ("USER_SERVICE_URL", "http://users:4001"),
            ]),
        )
        .unwrap();

        assert_eq!(
            config.routes,
            vec![
                RouteConfig {
                    prefix: "/api/v1/user".into(),
                    backend: "http://users:4001".into(),
                    websocket: false,
                },
                RouteConfig {
                    prefix: "/api/v1/chat".into(),
                    backend: "http://chat:4000".into(),
                    websocket: true,
                },
            ]
        );
    }

    #[test]
    fn service_url_replaces_file_backend() {
        let mut config = parse_config(
            r#"
            [[routes]]
            prefix = "/api/v1/user"
            backend = "http://old:1"
            "#,
        )
        .unwrap();
        apply_env_overrides(&mut config, env(&[("USER_SERVICE_URL", "http://new:2")])).unwrap();
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].backend, "http://new:2");
    }

    #[test]
    fn port_keeps_bind_host() {
        let mut config = GatewayConfig::default();
        config.listener.bind_address = "127.0.0.1:8080".into();
        apply_env_overrides(&mut config, env(&[("PORT", "9000")])).unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:9000");
    }

    #[test]
    fn bad_port_is_reported() {
        let mut config = GatewayConfig::default();
        let err = apply_env_overrides(&mut config, env(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "PORT", .. }));
    }

    #[test]
    fn frontend_urls_join_cors_allow_list() {
        let mut config = GatewayConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("FRONTEND_HOST_URL", "https://app.example.com/"),
                ("FRONTEND_AUTH_URL", "https://auth.example.com"),
            ]),
        )
        .unwrap();
        assert_eq!(
            config.cors.allowed_origins,
            ["https://app.example.com", "https://auth.example.com"]
        );
    }

    #[test]
    fn bundled_example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("gateway.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.routes.len(), 5);
        assert_eq!(
            config.routes.iter().filter(|r| r.websocket).count(),
            2
        );
    }
}
