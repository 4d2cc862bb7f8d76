//! Configuration: CLI flags plus the YAML service-configuration file.
//!
//! The file maps service names to per-service settings. The reserved
//! top-level keys are `auth` (required), `err`, `http-addr`,
//! `handshake-timeout` and `default`; every other top-level key declares a
//! service. Each service starts from the resolved `default` configuration
//! and overrides individual fields. Hyphenated and underscored key spellings
//! are interchangeable.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::cache::{MessageCache, RedisMessageCache};
use crate::hooks::webhook::{
    Webhook, WebhookAuthenticator, WebhookErrorHandler, WebhookForwardHandler,
    WebhookLoginHandler, WebhookLogoutHandler, WebhookMessageHandler, WebhookPushHandler,
    WebhookSubscribeHandler, WebhookUnsubscribeHandler,
};
use crate::hooks::{
    Authenticator, ErrorHandler, ForwardRequestHandler, LoginHandler, LogoutHandler,
    MessageHandler, PushHandler, SubscribeHandler, UnsubscribeHandler,
};
use crate::hub::ServiceConfig;
use crate::push::{PushService, UniqushPushClient};

/// Webhook timeout applied when neither the hook nor its service sets one.
const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(3);

/// TTL bound for forward requests when the hook config omits `max-ttl`.
const DEFAULT_MAX_TTL: Duration = Duration::from_secs(24 * 3600);

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8964";

/// courier message-delivery hub
#[derive(Parser, Clone, Debug)]
#[command(name = "courier-server", version, about = "per-service message-delivery hub")]
pub struct Cli {
    /// Path to the YAML service configuration file
    #[arg(long, env = "COURIER_CONFIG", default_value = "./courier.yaml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "COURIER_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented YAML config template and exit
    #[arg(long)]
    pub generate_config: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("top level of the config should be a map")]
    TopLevel,

    #[error("no authentication webhook configured")]
    MissingAuth,

    #[error("[service={service}][field={field}] {reason}")]
    Field {
        service: String,
        field: String,
        reason: String,
    },

    #[error("invalid duration {0:?}")]
    Duration(String),

    #[error("failed to build HTTP client: {0}")]
    Http(String),
}

fn field_err(service: &str, field: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Field {
        service: service.to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ---- raw file shapes -------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
struct WebhookDef {
    #[serde(default)]
    url: String,
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    default: Option<String>,
    /// Forward-request hooks only.
    #[serde(default, rename = "max-ttl", alias = "max_ttl")]
    max_ttl: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UniqushDef {
    addr: String,
    #[serde(default)]
    timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct DbDef {
    #[serde(default = "default_db_engine")]
    engine: String,
    #[serde(default)]
    addr: String,
    #[serde(default)]
    password: String,
    /// Numeric database index; accepts a bare integer or a string.
    #[serde(default)]
    name: Option<serde_yaml::Value>,
}

fn default_db_engine() -> String {
    "redis".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ServiceDef {
    #[serde(default)]
    timeout: Option<String>,
    #[serde(default)]
    msg: Option<WebhookDef>,
    #[serde(default)]
    login: Option<WebhookDef>,
    #[serde(default)]
    logout: Option<WebhookDef>,
    #[serde(default)]
    err: Option<WebhookDef>,
    #[serde(default)]
    fwd: Option<WebhookDef>,
    #[serde(default)]
    push: Option<WebhookDef>,
    #[serde(default)]
    subscribe: Option<WebhookDef>,
    #[serde(default)]
    unsubscribe: Option<WebhookDef>,
    #[serde(default, rename = "uniqush-push", alias = "uniqush_push")]
    uniqush_push: Option<UniqushDef>,
    #[serde(default)]
    db: Option<DbDef>,
    #[serde(default, rename = "max-conns", alias = "max_conns")]
    max_conns: Option<i64>,
    #[serde(default, rename = "max-online-users", alias = "max_online_users")]
    max_online_users: Option<i64>,
    #[serde(default, rename = "max-conns-per-user", alias = "max_conns_per_user")]
    max_conns_per_user: Option<i64>,
}

/// The top-level file, split into reserved keys and service declarations.
/// The top level is walked by hand because every unreserved key is a service
/// name.
#[derive(Debug, Default)]
struct ConfigFile {
    auth: Option<WebhookDef>,
    err: Option<WebhookDef>,
    http_addr: Option<String>,
    handshake_timeout: Option<String>,
    default: Option<ServiceDef>,
    services: Vec<(String, Option<ServiceDef>)>,
}

impl ConfigFile {
    fn parse(text: &str) -> Result<Self, ConfigError> {
        let root: serde_yaml::Value = serde_yaml::from_str(text)?;
        let serde_yaml::Value::Mapping(map) = root else {
            return Err(ConfigError::TopLevel);
        };

        let mut file = ConfigFile::default();
        for (key, value) in map {
            let Some(key) = key.as_str().map(str::to_string) else {
                return Err(ConfigError::TopLevel);
            };
            match key.as_str() {
                "auth" => file.auth = Some(serde_yaml::from_value(value)?),
                "err" => file.err = Some(serde_yaml::from_value(value)?),
                "http-addr" | "http_addr" => {
                    file.http_addr = Some(serde_yaml::from_value(value)?)
                }
                "handshake-timeout" | "handshake_timeout" => {
                    file.handshake_timeout = Some(serde_yaml::from_value(value)?)
                }
                "default" => file.default = serde_yaml::from_value(value)?,
                _ => {
                    let def = serde_yaml::from_value(value)
                        .map_err(|e| field_err(&key, "definition", e))?;
                    file.services.push((key, def));
                }
            }
        }
        Ok(file)
    }
}

// ---- resolved runtime configuration ---------------------------------------

/// Intermediate per-service settings; turned into a `ServiceConfig` once the
/// push-service slot moves behind its lock.
#[derive(Default, Clone)]
struct ServiceParts {
    max_conns: usize,
    max_users: usize,
    max_conns_per_user: usize,
    msg_cache: Option<Arc<dyn MessageCache>>,
    login_handler: Option<Arc<dyn LoginHandler>>,
    logout_handler: Option<Arc<dyn LogoutHandler>>,
    message_handler: Option<Arc<dyn MessageHandler>>,
    forward_handler: Option<Arc<dyn ForwardRequestHandler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    subscribe_handler: Option<Arc<dyn SubscribeHandler>>,
    unsubscribe_handler: Option<Arc<dyn UnsubscribeHandler>>,
    push_handler: Option<Arc<dyn PushHandler>>,
    push_service: Option<Arc<dyn PushService>>,
}

impl ServiceParts {
    fn build(self) -> ServiceConfig {
        ServiceConfig {
            max_conns: self.max_conns,
            max_users: self.max_users,
            max_conns_per_user: self.max_conns_per_user,
            msg_cache: self.msg_cache,
            login_handler: self.login_handler,
            logout_handler: self.logout_handler,
            message_handler: self.message_handler,
            forward_handler: self.forward_handler,
            error_handler: self.error_handler,
            subscribe_handler: self.subscribe_handler,
            unsubscribe_handler: self.unsubscribe_handler,
            push_handler: self.push_handler,
            push_service: tokio::sync::RwLock::new(self.push_service),
        }
    }
}

pub struct Config {
    pub http_addr: String,
    /// Bound on the authentication round during connection handshakes;
    /// zero disables the bound.
    pub handshake_timeout: Duration,
    pub auth: Arc<dyn Authenticator>,
    /// Top-level error hook; receives authentication and admission errors.
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    default_config: Arc<ServiceConfig>,
    services: HashMap<String, Arc<ServiceConfig>>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("http_addr", &self.http_addr)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Minimal configuration for embedding and tests: an authenticator and
    /// nothing else.
    pub fn new(auth: Arc<dyn Authenticator>) -> Self {
        Self {
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            handshake_timeout: Duration::ZERO,
            auth,
            error_handler: None,
            default_config: Arc::new(ServiceConfig::default()),
            services: HashMap::new(),
        }
    }

    /// Register or replace a service's configuration.
    pub fn add_service(&mut self, name: impl Into<String>, config: Arc<ServiceConfig>) {
        self.services.insert(name.into(), config);
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let file = ConfigFile::parse(text)?;

        let auth_def = file.auth.ok_or(ConfigError::MissingAuth)?;
        let auth: Arc<dyn Authenticator> = Arc::new(WebhookAuthenticator {
            hook: build_hook("", "auth", &auth_def, DEFAULT_HOOK_TIMEOUT)?,
        });

        let error_handler: Option<Arc<dyn ErrorHandler>> = match &file.err {
            Some(def) => Some(Arc::new(WebhookErrorHandler {
                hook: build_hook("", "err", def, DEFAULT_HOOK_TIMEOUT)?,
            })),
            None => None,
        };

        let default_parts = match &file.default {
            Some(def) => parse_service("default", def, None)?,
            None => ServiceParts::default(),
        };

        let mut services = HashMap::new();
        for (name, def) in &file.services {
            let parts = match def {
                Some(def) => parse_service(name, def, Some(&default_parts))?,
                // A bare service name inherits the default wholesale.
                None => default_parts.clone(),
            };
            services.insert(name.clone(), Arc::new(parts.build()));
        }

        let handshake_timeout = match &file.handshake_timeout {
            Some(s) => parse_duration(s)?,
            None => Duration::ZERO,
        };

        Ok(Self {
            http_addr: file
                .http_addr
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            handshake_timeout,
            auth,
            error_handler,
            default_config: Arc::new(default_parts.build()),
            services,
        })
    }

    /// The configuration for a service; unlisted services share the default.
    pub fn service_config(&self, service: &str) -> Arc<ServiceConfig> {
        self.services
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Names of explicitly configured services, sorted.
    pub fn all_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }
}

fn parse_service(
    service: &str,
    def: &ServiceDef,
    base: Option<&ServiceParts>,
) -> Result<ServiceParts, ConfigError> {
    let timeout = match &def.timeout {
        Some(s) => parse_duration(s).map_err(|e| field_err(service, "timeout", e))?,
        None => DEFAULT_HOOK_TIMEOUT,
    };

    let mut parts = base.cloned().unwrap_or_default();

    if let Some(d) = &def.msg {
        parts.message_handler = Some(Arc::new(WebhookMessageHandler {
            hook: build_hook(service, "msg", d, timeout)?,
        }));
    }
    if let Some(d) = &def.login {
        parts.login_handler = Some(Arc::new(WebhookLoginHandler {
            hook: build_hook(service, "login", d, timeout)?,
        }));
    }
    if let Some(d) = &def.logout {
        parts.logout_handler = Some(Arc::new(WebhookLogoutHandler {
            hook: build_hook(service, "logout", d, timeout)?,
        }));
    }
    if let Some(d) = &def.err {
        parts.error_handler = Some(Arc::new(WebhookErrorHandler {
            hook: build_hook(service, "err", d, timeout)?,
        }));
    }
    if let Some(d) = &def.fwd {
        let max_ttl = match &d.max_ttl {
            Some(s) => parse_duration(s).map_err(|e| field_err(service, "fwd.max-ttl", e))?,
            None => DEFAULT_MAX_TTL,
        };
        parts.forward_handler = Some(Arc::new(WebhookForwardHandler {
            hook: build_hook(service, "fwd", d, timeout)?,
            max_ttl,
        }));
    }
    if let Some(d) = &def.push {
        parts.push_handler = Some(Arc::new(WebhookPushHandler {
            hook: build_hook(service, "push", d, timeout)?,
        }));
    }
    if let Some(d) = &def.subscribe {
        parts.subscribe_handler = Some(Arc::new(WebhookSubscribeHandler {
            hook: build_hook(service, "subscribe", d, timeout)?,
        }));
    }
    if let Some(d) = &def.unsubscribe {
        parts.unsubscribe_handler = Some(Arc::new(WebhookUnsubscribeHandler {
            hook: build_hook(service, "unsubscribe", d, timeout)?,
        }));
    }

    if let Some(d) = &def.uniqush_push {
        // The address must resolve as a TCP endpoint up front.
        d.addr
            .to_socket_addrs()
            .map_err(|e| field_err(service, "uniqush-push.addr", e))?
            .next()
            .ok_or_else(|| field_err(service, "uniqush-push.addr", "resolves to no address"))?;
        let push_timeout = match &d.timeout {
            Some(s) => {
                parse_duration(s).map_err(|e| field_err(service, "uniqush-push.timeout", e))?
            }
            None => timeout,
        };
        let client = UniqushPushClient::new(&d.addr, push_timeout)
            .map_err(|e| ConfigError::Http(e.to_string()))?;
        parts.push_service = Some(Arc::new(client));
    }

    if let Some(d) = &def.db {
        if d.engine != "redis" {
            return Err(field_err(
                service,
                "db.engine",
                format!("database {:?} is not supported", d.engine),
            ));
        }
        let db_index = parse_db_index(d.name.as_ref())
            .map_err(|reason| field_err(service, "db.name", reason))?;
        let cache = RedisMessageCache::new(&d.addr, &d.password, db_index)
            .map_err(|e| field_err(service, "db.addr", e))?;
        parts.msg_cache = Some(Arc::new(cache));
    }

    if let Some(v) = def.max_conns {
        parts.max_conns = cap(v);
    }
    if let Some(v) = def.max_online_users {
        parts.max_users = cap(v);
    }
    if let Some(v) = def.max_conns_per_user {
        parts.max_conns_per_user = cap(v);
    }

    Ok(parts)
}

fn build_hook(
    service: &str,
    field: &str,
    def: &WebhookDef,
    fallback_timeout: Duration,
) -> Result<Webhook, ConfigError> {
    let timeout = match &def.timeout {
        Some(s) => parse_duration(s).map_err(|e| field_err(service, field, e))?,
        None => fallback_timeout,
    };
    let default_allow = def.default.as_deref() == Some("allow");
    Webhook::new(def.url.clone(), timeout, default_allow)
        .map_err(|e| ConfigError::Http(e.to_string()))
}

/// Caps are unsigned; zero or negative means unlimited.
fn cap(v: i64) -> usize {
    if v > 0 {
        v as usize
    } else {
        0
    }
}

fn parse_db_index(value: Option<&serde_yaml::Value>) -> Result<i64, String> {
    let index = match value {
        None => 0,
        Some(serde_yaml::Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| format!("invalid database name: {}", n))?,
        Some(serde_yaml::Value::String(s)) => s
            .parse::<i64>()
            .map_err(|_| format!("invalid database name: {:?}", s))?,
        Some(other) => return Err(format!("invalid database name: {:?}", other)),
    };
    if index < 0 {
        return Err(format!("invalid database name: {}", index));
    }
    Ok(index)
}

/// Parse a Go-style duration string: one or more `<number><unit>` groups,
/// where the unit is one of ns, us, ms, s, m, h. Compound values such as
/// `1h30m` are accepted.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::Duration(s.to_string()));
    }
    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let mut unit = String::from(c);
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let value: f64 = number
            .parse()
            .map_err(|_| ConfigError::Duration(s.to_string()))?;
        number.clear();
        let unit_secs = match unit.as_str() {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(ConfigError::Duration(s.to_string())),
        };
        total += Duration::from_secs_f64(value * unit_secs);
    }
    if !number.is_empty() {
        // Trailing number with no unit.
        return Err(ConfigError::Duration(s.to_string()));
    }
    Ok(total)
}

/// Generate a commented YAML config template.
pub fn generate_config_template() -> String {
    r#"# courier-server configuration
# Place this file at ./courier.yaml or point at it with --config <path>.
# Every top-level key that is not listed below declares a service.

# HTTP bind address for the connection and delivery API (default: 0.0.0.0:8964)
# http-addr: 0.0.0.0:8964

# Bound on the authentication round during connection handshakes
# handshake-timeout: 5s

# Authentication webhook (required). A blank url or "none" skips the call
# and every handshake is decided by `default` ("allow" accepts, anything
# else rejects).
auth:
  url: http://localhost:8080/auth
  timeout: 3s
  default: allow

# Top-level error webhook; receives authentication and admission errors.
# err:
#   url: http://localhost:8080/err

# Template applied to every service before its own overrides.
# default:
#   timeout: 3s
#   max-conns-per-user: 10

# A service named "web":
# web:
#   msg:
#     url: http://localhost:8080/msg
#   login:
#     url: http://localhost:8080/login
#   logout:
#     url: http://localhost:8080/logout
#   fwd:
#     url: http://localhost:8080/fwd
#     default: allow
#     max-ttl: 24h
#   push:
#     url: http://localhost:8080/push
#     default: allow
#   uniqush-push:
#     addr: localhost:9898
#     timeout: 5s
#   db:
#     engine: redis
#     addr: localhost:6379
#     name: 0
#   max-conns: 2048
#   max-online-users: 1024
#   max-conns-per-user: 10
"#
    .to_string()
}
