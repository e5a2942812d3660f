use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerRegistry, Permit, Transition};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::governor::Governor;
use crate::headers;
use crate::metrics::Metrics;
use crate::robots::RobotsCache;
use crate::singleflight::Singleflight;
use crate::urlnorm::{host_key, normalize_url};

/// Body of a completed fetch. 2xx/3xx only; everything else surfaces as an
/// [`EngineError`].
#[derive(Debug, Clone, PartialEq)]
pub struct PageBody {
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

pub type FetchResult = Result<PageBody, EngineError>;

/// Emitted once when a host's breaker trips open, so the chat layer can
/// tell affected users their monitors are cooling down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownEvent {
    pub host: String,
}

/// Single gateway for all outbound HTTP. Collapses concurrent fetches of
/// one normalized URL, caches completed results briefly, paces requests
/// through the governor, and feeds the per-host circuit breakers.
pub struct RequestManager {
    client: reqwest::Client,
    flights: Singleflight<FetchResult>,
    cache: Cache<String, FetchResult>,
    governor: Arc<Governor>,
    breakers: Arc<BreakerRegistry>,
    robots: RobotsCache,
    cooldown_tx: mpsc::UnboundedSender<CooldownEvent>,
    metrics: Arc<Metrics>,
    http_timeout: Duration,
    jitter_min: Duration,
    jitter_max: Duration,
}

impl RequestManager {
    pub fn new(
        config: &EngineConfig,
        governor: Arc<Governor>,
        breakers: Arc<BreakerRegistry>,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CooldownEvent>) {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.http_timeout)
            .build()
            .expect("http client");
        let (cooldown_tx, cooldown_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            client,
            flights: Singleflight::default(),
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(config.result_cache_ttl)
                .build(),
            governor,
            breakers,
            robots: RobotsCache::new(config.robots_ttl),
            cooldown_tx,
            metrics,
            http_timeout: config.http_timeout,
            jitter_min: config.jitter_min,
            jitter_max: config.jitter_max,
        });
        (manager, cooldown_rx)
    }

    /// Fetch a URL with collapsing and caching. Concurrent calls for the
    /// same normalized URL observe one network round trip and the same
    /// result; completed results are served for the cache TTL.
    pub async fn fetch(&self, url: &str) -> FetchResult {
        let normalized = normalize_url(url)?;
        loop {
            if let Some(cached) = self.cache.get(&normalized).await {
                debug!(target: "requests", url = %normalized, "cache hit");
                return cached;
            }
            let mut guard = self.flights.begin(&normalized);
            if guard.is_leader() {
                let outcome = self.fetch_uncollapsed(url, &normalized).await;
                if is_cacheable(&outcome) {
                    self.cache.insert(normalized.clone(), outcome.clone()).await;
                }
                guard.publish(outcome.clone());
                return outcome;
            }
            debug!(target: "requests", url = %normalized, "collapsing into active fetch");
            if let Some(shared) = guard.wait().await {
                return shared;
            }
            // Leader vanished without a result; take over on the next turn.
        }
    }

    async fn fetch_uncollapsed(&self, original_url: &str, normalized: &str) -> FetchResult {
        let host = host_key(normalized)?;

        match self.breakers.check(&host) {
            Permit::Denied => return Err(EngineError::CircuitOpen(host)),
            Permit::Allowed | Permit::Probe => {}
        }

        let signature = headers::pick_signature();
        let path = reqwest::Url::parse(normalized)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| "/".to_string());
        if !self
            .robots
            .allows(&self.client, &host, signature.user_agent, &path)
            .await
        {
            info!(target: "requests", url = %normalized, "skipped by robots policy");
            self.breakers.release_probe(&host);
            return Err(EngineError::PolicyBlocked);
        }

        self.governor.acquire_fetch().await;
        self.pre_request_delay().await;

        let started = Instant::now();
        let request = async {
            let resp = self
                .client
                .get(original_url)
                .headers(signature.headers())
                .send()
                .await?;
            let status = resp.status().as_u16();
            let body = resp.text().await?;
            Ok::<(u16, String), reqwest::Error>((status, body))
        };
        let outcome = match tokio::time::timeout(self.http_timeout, request).await {
            Err(_) => Err(EngineError::FetchTimeout(self.http_timeout)),
            Ok(Err(err)) => Err(EngineError::NetworkError(err.to_string())),
            Ok(Ok((status, _))) if status >= 400 => Err(EngineError::HttpStatusError(status)),
            Ok(Ok((status, body))) => {
                // A 2xx/3xx only counts as success when it carries real
                // content; challenge shells are failures like any other.
                if let Some(reason) = vigil_page::detect_block_page(&body) {
                    info!(
                        target: "requests",
                        url = %normalized,
                        reason = reason.as_str(),
                        "block page served instead of content"
                    );
                    Err(EngineError::BlockPageDetected)
                } else {
                    Ok(PageBody {
                        status,
                        body,
                        fetched_at: Utc::now(),
                    })
                }
            }
        };
        self.metrics
            .record_request(started.elapsed(), outcome.is_ok(), Utc::now().timestamp());

        match &outcome {
            Ok(_) => {
                self.breakers.record_success(&host);
            }
            Err(err) if err.counts_for_breaker() => self.note_failure(&host),
            Err(_) => {}
        }
        outcome
    }

    /// Uniform random delay before each outbound request, so patrol bursts
    /// do not land on targets as lockstep scanners.
    async fn pre_request_delay(&self) {
        if self.jitter_max.is_zero() {
            return;
        }
        let min = self.jitter_min.as_millis() as u64;
        let max = self.jitter_max.as_millis() as u64;
        let millis = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            max
        };
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// Record a content-level failure (a block page discovered after the
    /// HTTP exchange succeeded) against the host's breaker.
    pub fn record_content_failure(&self, normalized_url: &str) {
        if let Ok(host) = host_key(normalized_url) {
            self.note_failure(&host);
        }
    }

    fn note_failure(&self, host: &str) {
        match self.breakers.record_failure(host) {
            Some(Transition::Opened) | Some(Transition::Reopened) => {
                warn!(target: "requests", host, "circuit opened, emitting cooldown");
                let _ = self.cooldown_tx.send(CooldownEvent {
                    host: host.to_string(),
                });
            }
            _ => {}
        }
    }
}

fn is_cacheable(outcome: &FetchResult) -> bool {
    match outcome {
        Ok(_) => true,
        // Only outcomes of an executed request are cached; fast-fails and
        // policy skips must not mask the next attempt.
        Err(err) => err.counts_for_breaker(),
    }
}
