use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

/// One `User-agent` group from a robots.txt file.
#[derive(Debug, Clone, Default)]
struct Group {
    agents: Vec<String>,
    disallow: Vec<String>,
}

/// Parsed robots policy for one host. Only `Disallow` rules are honoured;
/// an unreachable or malformed file allows everything.
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    groups: Vec<Group>,
}

impl RobotsPolicy {
    pub fn parse(text: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current: Option<Group> = None;
        let mut agents_open = false;

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    if !agents_open {
                        if let Some(done) = current.take() {
                            groups.push(done);
                        }
                        current = Some(Group::default());
                        agents_open = true;
                    }
                    if let Some(group) = current.as_mut() {
                        group.agents.push(value.to_ascii_lowercase());
                    }
                }
                "disallow" => {
                    agents_open = false;
                    if let Some(group) = current.as_mut() {
                        if !value.is_empty() {
                            group.disallow.push(value.to_string());
                        }
                    }
                }
                "allow" | "crawl-delay" | "sitemap" => {
                    agents_open = false;
                }
                _ => {}
            }
        }
        if let Some(done) = current.take() {
            groups.push(done);
        }
        RobotsPolicy { groups }
    }

    /// Whether the given user agent may fetch `path`. Groups naming the UA
    /// family specifically take precedence over `*` groups.
    pub fn allows(&self, user_agent: &str, path: &str) -> bool {
        let ua = user_agent.to_ascii_lowercase();
        let specific: Vec<&Group> = self
            .groups
            .iter()
            .filter(|g| g.agents.iter().any(|a| a != "*" && ua.contains(a.as_str())))
            .collect();
        let applicable: Vec<&Group> = if !specific.is_empty() {
            specific
        } else {
            self.groups
                .iter()
                .filter(|g| g.agents.iter().any(|a| a == "*"))
                .collect()
        };
        !applicable
            .iter()
            .any(|g| g.disallow.iter().any(|rule| path.starts_with(rule.as_str())))
    }
}

/// Per-host robots.txt cache with a long TTL; a robots miss costs one fetch
/// per host per day.
pub struct RobotsCache {
    cache: Cache<String, Arc<RobotsPolicy>>,
}

impl RobotsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Fetch (or reuse) the policy for `host_key` (`scheme://authority`) and
    /// test `path` against it.
    pub async fn allows(
        &self,
        client: &reqwest::Client,
        host_key: &str,
        user_agent: &str,
        path: &str,
    ) -> bool {
        let policy = self
            .cache
            .get_with(host_key.to_string(), async {
                Arc::new(fetch_policy(client, host_key).await)
            })
            .await;
        policy.allows(user_agent, path)
    }
}

async fn fetch_policy(client: &reqwest::Client, host_key: &str) -> RobotsPolicy {
    let url = format!("{host_key}/robots.txt");
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            Ok(body) => RobotsPolicy::parse(&body),
            Err(err) => {
                debug!(target: "robots", host = host_key, %err, "robots body unreadable");
                RobotsPolicy::default()
            }
        },
        Ok(resp) => {
            debug!(target: "robots", host = host_key, status = %resp.status(), "no robots policy");
            RobotsPolicy::default()
        }
        Err(err) => {
            debug!(target: "robots", host = host_key, %err, "robots fetch failed");
            RobotsPolicy::default()
        }
    }
}
