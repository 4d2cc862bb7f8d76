//! Configuration-file parsing tests: synonym keys, default-service
//! inheritance, validation failures.

use std::time::Duration;

use courier_server::config::{Config, ConfigError};
use courier_server::hooks::ForwardRequestHandler;

const BASE: &str = r#"
auth:
  url: http://localhost:8080/auth
  default: allow
"#;

#[test]
fn minimal_config_parses() {
    let config = Config::from_yaml(BASE).unwrap();
    assert_eq!(config.http_addr, "0.0.0.0:8964");
    assert_eq!(config.handshake_timeout, Duration::ZERO);
    assert!(config.all_services().is_empty());
}

#[test]
fn missing_auth_is_fatal() {
    let err = Config::from_yaml("http-addr: 127.0.0.1:8964\n").unwrap_err();
    assert!(matches!(err, ConfigError::MissingAuth));
}

#[test]
fn hyphen_and_underscore_keys_are_synonyms() {
    let hyphens = format!(
        "{BASE}
http-addr: 127.0.0.1:7777
handshake-timeout: 5s
web:
  max-conns: 10
  max-online-users: 5
  max-conns-per-user: 2
"
    );
    let underscores = format!(
        "{BASE}
http_addr: 127.0.0.1:7777
handshake_timeout: 5s
web:
  max_conns: 10
  max_online_users: 5
  max_conns_per_user: 2
"
    );
    for text in [hyphens, underscores] {
        let config = Config::from_yaml(&text).unwrap();
        assert_eq!(config.http_addr, "127.0.0.1:7777");
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        let web = config.service_config("web");
        assert_eq!(web.max_conns, 10);
        assert_eq!(web.max_users, 5);
        assert_eq!(web.max_conns_per_user, 2);
    }
}

#[test]
fn services_inherit_the_default_template() {
    let text = format!(
        "{BASE}
default:
  max-conns-per-user: 5
  login:
    url: http://localhost:8080/login
web:
  max-conns: 100
"
    );
    let config = Config::from_yaml(&text).unwrap();

    let web = config.service_config("web");
    assert_eq!(web.max_conns, 100);
    assert_eq!(web.max_conns_per_user, 5);
    assert!(web.login_handler.is_some());

    // Unlisted services resolve to the shared default.
    let other = config.service_config("unlisted");
    assert_eq!(other.max_conns, 0);
    assert_eq!(other.max_conns_per_user, 5);
    assert!(other.login_handler.is_some());
}

#[test]
fn bare_service_name_inherits_default_wholesale() {
    let text = format!(
        "{BASE}
default:
  max-conns-per-user: 7
web:
"
    );
    let config = Config::from_yaml(&text).unwrap();
    assert_eq!(config.all_services(), vec!["web".to_string()]);
    assert_eq!(config.service_config("web").max_conns_per_user, 7);
}

#[test]
fn forward_hook_defaults_to_a_day_of_ttl() {
    let text = format!(
        "{BASE}
web:
  fwd:
    url: http://localhost:8080/fwd
chat:
  fwd:
    url: http://localhost:8080/fwd
    max-ttl: 2h
"
    );
    let config = Config::from_yaml(&text).unwrap();
    let web = config.service_config("web");
    assert_eq!(
        web.forward_handler.as_ref().unwrap().max_ttl(),
        Duration::from_secs(24 * 3600)
    );
    let chat = config.service_config("chat");
    assert_eq!(
        chat.forward_handler.as_ref().unwrap().max_ttl(),
        Duration::from_secs(2 * 3600)
    );
}

#[test]
fn all_hooks_and_caps_resolve() {
    let text = format!(
        "{BASE}
err:
  url: http://localhost:8080/err
web:
  timeout: 2s
  msg:
    url: http://localhost:8080/msg
  login:
    url: http://localhost:8080/login
  logout:
    url: http://localhost:8080/logout
  err:
    url: http://localhost:8080/svc-err
  push:
    url: http://localhost:8080/push
    default: allow
  subscribe:
    url: http://localhost:8080/subscribe
    default: allow
  unsubscribe:
    url: http://localhost:8080/unsubscribe
"
    );
    let config = Config::from_yaml(&text).unwrap();
    assert!(config.error_handler.is_some());
    let web = config.service_config("web");
    assert!(web.message_handler.is_some());
    assert!(web.login_handler.is_some());
    assert!(web.logout_handler.is_some());
    assert!(web.error_handler.is_some());
    assert!(web.push_handler.is_some());
    assert!(web.subscribe_handler.is_some());
    assert!(web.unsubscribe_handler.is_some());
}

#[test]
fn uniqush_push_requires_a_resolvable_address() {
    let good = format!(
        "{BASE}
web:
  uniqush-push:
    addr: 127.0.0.1:9898
"
    );
    let config = Config::from_yaml(&good).unwrap();
    // The slot is populated; reading it needs the lock, so just probe presence
    // through a blocking read on a fresh runtime-free lock.
    assert!(config
        .service_config("web")
        .push_service
        .try_read()
        .unwrap()
        .is_some());

    let bad = format!(
        "{BASE}
web:
  uniqush-push:
    addr: not-an-address
"
    );
    let err = Config::from_yaml(&bad).unwrap_err();
    assert!(matches!(err, ConfigError::Field { .. }), "{err}");
}

#[test]
fn cache_accepts_only_redis() {
    let good = format!(
        "{BASE}
web:
  db:
    engine: redis
    addr: 127.0.0.1:6379
    name: 2
"
    );
    let config = Config::from_yaml(&good).unwrap();
    assert!(config.service_config("web").msg_cache.is_some());

    let bad_engine = format!(
        "{BASE}
web:
  db:
    engine: leveldb
    addr: 127.0.0.1:6379
"
    );
    let err = Config::from_yaml(&bad_engine).unwrap_err();
    assert!(matches!(err, ConfigError::Field { .. }), "{err}");

    for bad_name in ["abc", "-1"] {
        let text = format!(
            "{BASE}
web:
  db:
    engine: redis
    addr: 127.0.0.1:6379
    name: \"{bad_name}\"
"
        );
        let err = Config::from_yaml(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Field { .. }), "{err}");
    }
}

#[test]
fn negative_caps_mean_unlimited() {
    let text = format!(
        "{BASE}
web:
  max-conns: -1
"
    );
    let config = Config::from_yaml(&text).unwrap();
    assert_eq!(config.service_config("web").max_conns, 0);
}

#[test]
fn bad_duration_is_reported_with_context() {
    let text = format!(
        "{BASE}
web:
  timeout: fast
"
    );
    let err = Config::from_yaml(&text).unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("service=web"), "{rendered}");
    assert!(rendered.contains("timeout"), "{rendered}");
}
