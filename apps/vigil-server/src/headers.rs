use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

/// One coherent browser identity: the UA string plus the client-hint
/// headers a real browser of that family would send.
pub struct BrowserSignature {
    pub user_agent: &'static str,
    sec_ch_ua: Option<&'static str>,
    platform: Option<&'static str>,
}

/// Realistic desktop signatures, rotated per request.
static SIGNATURES: &[BrowserSignature] = &[
    BrowserSignature {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        sec_ch_ua: Some("\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\""),
        platform: Some("\"Windows\""),
    },
    BrowserSignature {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        sec_ch_ua: Some("\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\""),
        platform: Some("\"macOS\""),
    },
    BrowserSignature {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        sec_ch_ua: Some("\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\""),
        platform: Some("\"Linux\""),
    },
    BrowserSignature {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0",
        sec_ch_ua: None,
        platform: None,
    },
    BrowserSignature {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/119.0",
        sec_ch_ua: None,
        platform: None,
    },
    BrowserSignature {
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_1) AppleWebKit/605.1.15 \
                     (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
        sec_ch_ua: None,
        platform: None,
    },
    BrowserSignature {
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
        sec_ch_ua: Some("\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Microsoft Edge\";v=\"120\""),
        platform: Some("\"Windows\""),
    },
];

static REFERERS: &[&str] = &[
    "https://www.google.com/",
    "https://duckduckgo.com/",
    "https://www.bing.com/",
];

pub fn pick_signature() -> &'static BrowserSignature {
    let mut rng = rand::thread_rng();
    SIGNATURES
        .choose(&mut rng)
        .expect("signature pool is non-empty")
}

impl BrowserSignature {
    /// Full header set for one request.
    pub fn headers(&self) -> HeaderMap {
        let mut rng = rand::thread_rng();
        let mut headers = HeaderMap::new();
        insert(&mut headers, "user-agent", self.user_agent);
        insert(
            &mut headers,
            "accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        );
        insert(&mut headers, "accept-language", "en-US,en;q=0.9");
        insert(&mut headers, "accept-encoding", "gzip, deflate, br");
        insert(&mut headers, "upgrade-insecure-requests", "1");
        insert(&mut headers, "sec-fetch-dest", "document");
        insert(&mut headers, "sec-fetch-mode", "navigate");
        insert(&mut headers, "sec-fetch-site", "cross-site");
        if let Some(referer) = REFERERS.choose(&mut rng) {
            insert(&mut headers, "referer", referer);
        }
        if let Some(sec_ch_ua) = self.sec_ch_ua {
            insert(&mut headers, "sec-ch-ua", sec_ch_ua);
            insert(&mut headers, "sec-ch-ua-mobile", "?0");
            if let Some(platform) = self.platform {
                insert(&mut headers, "sec-ch-ua-platform", platform);
            }
        }
        headers
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_signature_builds_a_coherent_header_set() {
        for signature in SIGNATURES {
            let headers = signature.headers();
            assert_eq!(
                headers.get("user-agent").unwrap().to_str().unwrap(),
                signature.user_agent
            );
            assert!(headers.contains_key("accept"));
            assert!(headers.contains_key("accept-language"));
            assert!(headers.contains_key("accept-encoding"));
            assert!(headers.contains_key("referer"));
            // Client hints only for Chromium-family signatures.
            assert_eq!(
                headers.contains_key("sec-ch-ua"),
                signature.sec_ch_ua.is_some()
            );
        }
    }

    #[test]
    fn rotation_draws_from_the_pool() {
        for _ in 0..32 {
            let signature = pick_signature();
            assert!(SIGNATURES
                .iter()
                .any(|s| std::ptr::eq(s, signature)));
        }
    }
}
