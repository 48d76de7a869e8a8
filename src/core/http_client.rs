use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use trackhaul_core::models::settings::{BackendSettings, ProxySettings};

pub const SIGNING_KEY_HEADER: &str = "x-signing-key";

pub fn proxy_url(proxy: &ProxySettings) -> Option<String> {
    if !proxy.enabled || proxy.host.is_empty() {
        return None;
    }
    let scheme = match proxy.proxy_type.as_str() {
        "socks5" => "socks5",
        "https" => "https",
        _ => "http",
    };
    if !proxy.username.is_empty() {
        Some(format!(
            "{}://{}:{}@{}:{}",
            scheme, proxy.username, proxy.password, proxy.host, proxy.port
        ))
    } else {
        Some(format!("{}://{}:{}", scheme, proxy.host, proxy.port))
    }
}

pub fn apply_proxy(
    builder: reqwest::ClientBuilder,
    proxy: &ProxySettings,
) -> reqwest::ClientBuilder {
    let Some(url) = proxy_url(proxy) else {
        return builder;
    };
    match reqwest::Proxy::all(&url) {
        Ok(p) => builder.proxy(p),
        Err(e) => {
            tracing::warn!("Invalid proxy URL: {}", e);
            builder
        }
    }
}

fn signing_headers(backend: &BackendSettings) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if !backend.signing_key.is_empty() {
        let mut value = HeaderValue::from_str(&backend.signing_key)?;
        value.set_sensitive(true);
        headers.insert(HeaderName::from_static(SIGNING_KEY_HEADER), value);
    }
    Ok(headers)
}

/// Client for request/response calls. `timeout` of `None` is for the
/// long-lived event stream, whose body never finishes on its own.
pub fn build_client(
    backend: &BackendSettings,
    proxy: &ProxySettings,
    timeout: Option<Duration>,
) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .default_headers(signing_headers(backend)?)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("trackhaul/", env!("CARGO_PKG_VERSION")));
    if let Some(t) = timeout {
        builder = builder.timeout(t);
    }
    let builder = apply_proxy(builder, proxy);
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_disabled_yields_none() {
        let proxy = ProxySettings {
            enabled: false,
            host: "localhost".into(),
            ..Default::default()
        };
        assert_eq!(proxy_url(&proxy), None);
    }

    #[test]
    fn proxy_with_credentials() {
        let proxy = ProxySettings {
            enabled: true,
            proxy_type: "socks5".into(),
            host: "10.0.0.2".into(),
            port: 1080,
            username: "u".into(),
            password: "p".into(),
        };
        assert_eq!(proxy_url(&proxy).as_deref(), Some("socks5://u:p@10.0.0.2:1080"));
    }

    #[test]
    fn unknown_proxy_type_falls_back_to_http() {
        let proxy = ProxySettings {
            enabled: true,
            proxy_type: "gopher".into(),
            host: "proxy".into(),
            port: 3128,
            ..Default::default()
        };
        assert_eq!(proxy_url(&proxy).as_deref(), Some("http://proxy:3128"));
    }

    #[test]
    fn signing_key_header_only_when_configured() {
        let mut backend = BackendSettings::default();
        assert!(signing_headers(&backend).unwrap().is_empty());
        backend.signing_key = "secret".into();
        let headers = signing_headers(&backend).unwrap();
        assert_eq!(headers.get(SIGNING_KEY_HEADER).unwrap(), "secret");
    }
}
