use url::Url;

use crate::errors::EngineError;

/// Query keys stripped during normalization so tracking variants of one
/// page collapse to the same monitor key.
const TRACKING_KEYS: &[&str] = &["fbclid", "gclid"];

/// Canonical form of a URL: lowercase scheme and host, fragment dropped,
/// tracking parameters removed, remaining query keys sorted. Path case is
/// preserved.
pub fn normalize_url(raw: &str) -> Result<String, EngineError> {
    let mut url = Url::parse(raw)
        .map_err(|err| EngineError::ConfigInvalid(format!("invalid url {raw:?}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(EngineError::ConfigInvalid(format!(
            "unsupported scheme {:?}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(EngineError::ConfigInvalid(format!("url {raw:?} has no host")));
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_key(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        let query = serializer.finish();
        url.set_query(Some(&query));
    }

    Ok(url.to_string())
}

fn is_tracking_key(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_KEYS.contains(&key)
}

/// Circuit-breaker key for a normalized URL: scheme plus authority.
pub fn host_key(normalized: &str) -> Result<String, EngineError> {
    let url = Url::parse(normalized)
        .map_err(|err| EngineError::ConfigInvalid(format!("invalid url {normalized:?}: {err}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| EngineError::ConfigInvalid(format!("url {normalized:?} has no host")))?;
    match url.port() {
        Some(port) => Ok(format!("{}://{}:{}", url.scheme(), host, port)),
        None => Ok(format!("{}://{}", url.scheme(), host)),
    }
}
