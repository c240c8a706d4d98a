use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::ControllerConfig;
use crate::error::ControlError;

pub const SELECTOR_TYPE: &str = "Selector";

/// Members that name built-in outbounds rather than real proxies.
const BUILTIN_MEMBERS: [&str; 3] = ["DIRECT", "REJECT", "GLOBAL"];

/// Client for the proxy daemon's local control API.
#[derive(Debug, Clone)]
pub struct ControlClient {
    client: Client,
    base_url: String,
    secret: Option<String>,
}

/// A proxy group as reported by `GET /proxies`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyGroup {
    pub name: String,
    /// Selector, URLTest, Fallback, ...
    pub group_type: String,
    pub members: Vec<String>,
    pub current: Option<String>,
}

impl ProxyGroup {
    pub fn is_selector(&self) -> bool {
        self.group_type == SELECTOR_TYPE
    }

    pub fn has_member(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }
}

/// Outcome of one delay measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    Measured(u64),
    Unreachable,
}

#[derive(Debug, Deserialize)]
struct ProxiesResponse {
    proxies: HashMap<String, ProxyEntry>,
}

#[derive(Debug, Deserialize)]
struct ProxyEntry {
    #[serde(rename = "type")]
    proxy_type: String,
    all: Option<Vec<String>>,
    now: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DelayResponse {
    delay: i64,
}

impl ControlClient {
    pub fn new(
        base_url: impl Into<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ControlError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::Unavailable(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.filter(|s| !s.is_empty()),
        })
    }

    pub fn from_config(config: &ControllerConfig) -> Result<Self, ControlError> {
        Self::new(&config.address, config.secret.clone(), config.timeout())
    }

    /// Every proxy group keyed by name. Plain proxies (no member list) are left out.
    pub async fn list_groups(&self) -> Result<HashMap<String, ProxyGroup>, ControlError> {
        let url = format!("{}/proxies", self.base_url);
        let resp = self.send(self.client.get(&url)).await?;
        let resp = check_status(resp).await?;
        let body = resp.bytes().await?;
        let parsed: ProxiesResponse = serde_json::from_slice(&body)
            .map_err(|e| ControlError::Protocol(format!("invalid /proxies response: {}", e)))?;

        Ok(parsed
            .proxies
            .into_iter()
            .filter_map(|(name, entry)| {
                let members = entry.all?;
                Some((
                    name.clone(),
                    ProxyGroup {
                        name,
                        group_type: entry.proxy_type,
                        members,
                        current: entry.now.filter(|n| !n.is_empty()),
                    },
                ))
            })
            .collect())
    }

    /// Switch the active member of a selector group.
    pub async fn set_member(&self, group: &str, member: &str) -> Result<(), ControlError> {
        let url = format!("{}/proxies/{}", self.base_url, urlencoding::encode(group));
        let payload = serde_json::json!({ "name": member });
        let resp = self.send(self.client.put(&url).json(&payload)).await?;
        check_status(resp).await?;
        debug!("Selected {} in group {}", member, group);
        Ok(())
    }

    /// Ask the daemon to measure one proxy against one test URL.
    pub async fn measure_delay(
        &self,
        proxy_name: &str,
        test_url: &str,
        timeout_ms: u64,
    ) -> Result<Delay, ControlError> {
        let url = format!(
            "{}/proxies/{}/delay",
            self.base_url,
            urlencoding::encode(proxy_name)
        );
        let timeout = timeout_ms.to_string();
        let request = self
            .client
            .get(&url)
            .query(&[("url", test_url), ("timeout", timeout.as_str())])
            // leave room for the daemon to report its own timeout
            .timeout(Duration::from_millis(timeout_ms + 1000));
        let resp = self.send(request).await?;

        // a failed or timed out test comes back as 408/503/504
        match resp.status().as_u16() {
            408 | 503 | 504 => return Ok(Delay::Unreachable),
            _ => {}
        }
        let resp = check_status(resp).await?;
        let body = resp.bytes().await?;
        let parsed: DelayResponse = serde_json::from_slice(&body)
            .map_err(|e| ControlError::Protocol(format!("invalid delay response: {}", e)))?;

        if parsed.delay > 0 {
            Ok(Delay::Measured(parsed.delay as u64))
        } else {
            Ok(Delay::Unreachable)
        }
    }

    /// Members worth probing: those of `GLOBAL`, or of the first selector
    /// (by name) if there is no `GLOBAL` selector, minus built-ins.
    pub async fn probe_targets(&self) -> Result<Vec<String>, ControlError> {
        let groups = self.list_groups().await?;
        let group = groups
            .get("GLOBAL")
            .filter(|g| g.is_selector())
            .or_else(|| {
                let mut selectors: Vec<&ProxyGroup> =
                    groups.values().filter(|g| g.is_selector()).collect();
                selectors.sort_by(|a, b| a.name.cmp(&b.name));
                selectors.into_iter().next()
            })
            .ok_or_else(|| ControlError::Protocol("no selector group found".into()))?;

        Ok(group
            .members
            .iter()
            .filter(|m| !BUILTIN_MEMBERS.contains(&m.as_str()))
            .cloned()
            .collect())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ControlError> {
        let request = match &self.secret {
            Some(secret) => request.bearer_auth(secret),
            None => request,
        };
        request
            .send()
            .await
            .map_err(|e| ControlError::Unavailable(e.to_string()))
    }
}

async fn check_status(resp: Response) -> Result<Response, ControlError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ControlError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-process stand-in for the daemon's control API.

    use axum::{
        Json, Router,
        extract::{Path, Query, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::{get, put},
    };
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub struct MockGroup {
        pub group_type: String,
        pub members: Vec<String>,
        pub now: Option<String>,
    }

    #[derive(Default)]
    pub struct MockState {
        pub groups: BTreeMap<String, MockGroup>,
        /// proxy name -> delay reported per test URL; a missing URL means 503,
        /// a proxy that is neither here nor a group member means 404.
        pub delays: HashMap<String, HashMap<String, i64>>,
        /// Groups whose PUT is refused.
        pub reject_switch: Vec<String>,
        /// Groups whose PUT is answered only after this many milliseconds.
        pub slow_switch: HashMap<String, u64>,
        pub switch_log: Vec<(String, String)>,
    }

    pub type Shared = Arc<Mutex<MockState>>;

    pub fn selector(members: &[&str], now: &str) -> MockGroup {
        MockGroup {
            group_type: "Selector".into(),
            members: members.iter().map(|m| m.to_string()).collect(),
            now: Some(now.to_string()),
        }
    }

    /// Serve `state` on an ephemeral loopback port, returning its base URL.
    pub async fn serve(state: Shared) -> String {
        let app = Router::new()
            .route("/proxies", get(list))
            .route("/proxies/{name}", put(select))
            .route("/proxies/{name}/delay", get(delay))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    async fn list(State(state): State<Shared>) -> Json<serde_json::Value> {
        let state = state.lock().unwrap();
        let mut proxies = serde_json::Map::new();
        for (name, group) in &state.groups {
            proxies.insert(
                name.clone(),
                json!({
                    "name": name,
                    "type": group.group_type,
                    "all": group.members,
                    "now": group.now,
                }),
            );
            for member in &group.members {
                proxies.entry(member.clone()).or_insert_with(|| {
                    json!({ "name": member, "type": "Shadowsocks", "history": [] })
                });
            }
        }
        Json(json!({ "proxies": proxies }))
    }

    #[derive(Deserialize)]
    struct SelectBody {
        name: String,
    }

    async fn select(
        State(state): State<Shared>,
        Path(group): Path<String>,
        Json(body): Json<SelectBody>,
    ) -> Response {
        let wait = state.lock().unwrap().slow_switch.get(&group).copied();
        if let Some(ms) = wait {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }
        let mut state = state.lock().unwrap();
        if state.reject_switch.contains(&group) {
            return (StatusCode::BAD_REQUEST, Json(json!({"message": "refused"}))).into_response();
        }
        let Some(entry) = state.groups.get_mut(&group) else {
            return (StatusCode::NOT_FOUND, Json(json!({"message": "not found"}))).into_response();
        };
        if !entry.members.contains(&body.name) {
            return (StatusCode::BAD_REQUEST, Json(json!({"message": "no such member"})))
                .into_response();
        }
        entry.now = Some(body.name.clone());
        state.switch_log.push((group, body.name));
        StatusCode::NO_CONTENT.into_response()
    }

    async fn delay(
        State(state): State<Shared>,
        Path(name): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Response {
        let state = state.lock().unwrap();
        let url = query.get("url").cloned().unwrap_or_default();
        let known = state.delays.contains_key(&name)
            || state.groups.values().any(|g| g.members.contains(&name));
        if !known {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"message": "resource not found"})),
            )
                .into_response();
        }
        match state.delays.get(&name).and_then(|per_url| per_url.get(&url)) {
            Some(delay) => Json(json!({ "delay": delay })).into_response(),
            None => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"message": "An error occurred in the delay test"})),
            )
                .into_response(),
        }
    }
}
