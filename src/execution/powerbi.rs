//! Power BI REST "Execute Queries" executor and Azure AD client-credentials auth.
//!
//! Workspace and dataset are resolved by name once per executor and memoized.
//! Every HTTP call goes through [`retry_with_backoff`], so throttling and 5xx
//! responses are retried while auth and request errors surface immediately.

use crate::config::PowerBiSettings;
use crate::error::{PipelineError, Result};
use crate::execution::engine::{QueryExecutor, QueryLanguage};
use crate::execution::result::{QueryResult, Row};
use crate::execution::retry::{hint_for_status, retry_with_backoff, RetryPolicy};
use crate::llm::truncate;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const DEFAULT_API_BASE: &str = "https://api.powerbi.com/v1.0/myorg";
pub const POWER_BI_SCOPE: &str = "https://analysis.windows.net/powerbi/api/.default";

const EXECUTE_TIMEOUT: Duration = Duration::from_secs(120);
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Client-credentials token source for the Power BI resource.
pub struct AzureAdTokenProvider {
    client: Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    scope: String,
    retry: RetryPolicy,
    cached: Mutex<Option<CachedToken>>,
}

impl AzureAdTokenProvider {
    pub fn new(client: Client, settings: &PowerBiSettings, retry: RetryPolicy) -> Self {
        Self {
            client,
            authority: DEFAULT_AUTHORITY.to_string(),
            tenant_id: settings.tenant_id.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            scope: POWER_BI_SCOPE.to_string(),
            retry,
            cached: Mutex::new(None),
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into().trim_end_matches('/').to_string();
        self
    }

    pub async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if Instant::now() + TOKEN_EXPIRY_MARGIN < entry.expires_at {
                return Ok(entry.token.clone());
            }
        }

        let (token, expires_in) = retry_with_backoff(self.retry, "Azure AD token request", move || self.request_token()).await?;
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(token)
    }

    async fn request_token(&self) -> Result<(String, u64)> {
        let url = format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id);
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let response = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| PipelineError::power_bi(format!("Token request failed: {}", e), None))?;

        let status = response.status().as_u16();
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::power_bi(format!("Invalid token response: {}", e), Some(status)))?;

        match body.access_token {
            Some(token) if status < 400 => Ok((token, body.expires_in.unwrap_or(3600))),
            _ => Err(PipelineError::power_bi(
                format!(
                    "Failed to acquire token: {} {}",
                    body.error.unwrap_or_else(|| format!("HTTP {}", status)),
                    body.error_description.unwrap_or_default()
                )
                .trim_end()
                .to_string(),
                Some(status),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NamedList {
    #[serde(default)]
    value: Vec<NamedItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct NamedItem {
    id: String,
    name: String,
}

/// Workspace name from `powerbi://api.powerbi.com/v1.0/myorg/<Workspace>`.
pub fn parse_workspace_name(endpoint: &str) -> Result<String> {
    let rest = endpoint.strip_prefix("powerbi://").ok_or_else(|| {
        PipelineError::Config(format!(
            "Power BI endpoint must start with powerbi:// (got '{}')",
            endpoint
        ))
    })?;
    let name = rest
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && rest.contains('/'))
        .ok_or_else(|| PipelineError::Config(format!("No workspace name in endpoint '{}'", endpoint)))?;
    Ok(name.replace("%20", " "))
}

/// `Table[Column]` and `[Measure]` keys become `Column` and `Measure`.
pub fn normalize_column_name(name: &str) -> String {
    match (name.rfind('['), name.ends_with(']')) {
        (Some(open), true) => name[open + 1..name.len() - 1].to_string(),
        _ => name.to_string(),
    }
}

/// Bare column names unless two keys would collapse onto the same name.
pub(crate) fn normalize_rows(rows: Vec<Row>) -> (Vec<String>, Vec<Row>) {
    let raw: Vec<String> = rows.first().map(|r| r.keys().cloned().collect()).unwrap_or_default();
    let bare: Vec<String> = raw.iter().map(|c| normalize_column_name(c)).collect();
    let unique = bare.iter().collect::<std::collections::HashSet<_>>().len() == bare.len();
    if !unique {
        return (raw, rows);
    }
    let rows = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|(k, v)| (normalize_column_name(&k), v))
                .collect::<Row>()
        })
        .collect();
    (bare, rows)
}

fn status_error(context: &str, status: u16, body: &str) -> PipelineError {
    let mut message = format!("{} failed: HTTP {}: {}", context, status, truncate(body, 500));
    if let Some(hint) = hint_for_status(Some(status)) {
        message.push_str(" | Hint: ");
        message.push_str(hint);
    }
    PipelineError::power_bi(message, Some(status))
}

pub struct PowerBiRestExecutor {
    client: Client,
    api_base: String,
    tokens: AzureAdTokenProvider,
    workspace_name: String,
    dataset_name: String,
    dataset_id: Option<String>,
    retry: RetryPolicy,
    resolved: Mutex<Option<(String, String)>>,
}

impl PowerBiRestExecutor {
    pub fn new(settings: &PowerBiSettings, retry: RetryPolicy) -> Result<Self> {
        let workspace_name = parse_workspace_name(&settings.endpoint)?;
        let client = Client::builder()
            .timeout(EXECUTE_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            tokens: AzureAdTokenProvider::new(client.clone(), settings, retry),
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            workspace_name,
            dataset_name: settings.dataset_name.clone(),
            dataset_id: settings.dataset_id.clone(),
            retry,
            resolved: Mutex::new(None),
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.tokens = self.tokens.with_authority(authority);
        self
    }

    pub fn workspace_name(&self) -> &str {
        &self.workspace_name
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str, context: &str) -> Result<T> {
        retry_with_backoff(self.retry, context, move || async move {
            let token = self.tokens.token().await?;
            let response = self
                .client
                .get(url)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| PipelineError::power_bi(format!("{} failed: {}", context, e), None))?;
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .map_err(|e| PipelineError::power_bi(format!("{} failed: {}", context, e), None))?;
            if status >= 400 {
                return Err(status_error(context, status, &text));
            }
            serde_json::from_str(&text)
                .map_err(|e| PipelineError::power_bi(format!("{}: invalid JSON: {}", context, e), Some(status)))
        })
        .await
    }

    async fn resolve_workspace(&self) -> Result<String> {
        let groups: NamedList = self
            .get_json(&format!("{}/groups", self.api_base), "List workspaces")
            .await?;
        let found = groups
            .value
            .iter()
            .find(|g| g.name == self.workspace_name)
            .or_else(|| {
                groups
                    .value
                    .iter()
                    .find(|g| g.name.eq_ignore_ascii_case(&self.workspace_name))
            });
        match found {
            Some(group) => Ok(group.id.clone()),
            None => {
                let available: Vec<&str> = groups.value.iter().map(|g| g.name.as_str()).collect();
                Err(PipelineError::power_bi(
                    format!(
                        "Workspace '{}' not found. Available: {}",
                        self.workspace_name,
                        if available.is_empty() { "(none)".to_string() } else { available.join(", ") }
                    ),
                    Some(404),
                ))
            }
        }
    }

    async fn resolve_dataset(&self, group_id: &str) -> Result<String> {
        let datasets: NamedList = self
            .get_json(&format!("{}/groups/{}/datasets", self.api_base, group_id), "List datasets")
            .await?;
        let found = match &self.dataset_id {
            Some(id) => datasets.value.iter().find(|d| d.id.eq_ignore_ascii_case(id)),
            None => datasets
                .value
                .iter()
                .find(|d| d.name == self.dataset_name)
                .or_else(|| {
                    datasets
                        .value
                        .iter()
                        .find(|d| d.name.eq_ignore_ascii_case(&self.dataset_name))
                }),
        };
        found.map(|d| d.id.clone()).ok_or_else(|| {
            let wanted = self.dataset_id.as_deref().unwrap_or(&self.dataset_name);
            let available: Vec<&str> = datasets.value.iter().map(|d| d.name.as_str()).collect();
            PipelineError::power_bi(
                format!(
                    "Dataset '{}' not found in workspace '{}'. Available: {}",
                    wanted,
                    self.workspace_name,
                    available.join(", ")
                ),
                Some(404),
            )
        })
    }

    /// Workspace and dataset ids, resolved once.
    pub async fn resolve(&self) -> Result<(String, String)> {
        let mut resolved = self.resolved.lock().await;
        if let Some(ids) = resolved.as_ref() {
            return Ok(ids.clone());
        }
        let group_id = self.resolve_workspace().await?;
        let dataset_id = self.resolve_dataset(&group_id).await?;
        info!(
            "Resolved Power BI workspace '{}' ({}) dataset {}",
            self.workspace_name, group_id, dataset_id
        );
        *resolved = Some((group_id.clone(), dataset_id.clone()));
        Ok((group_id, dataset_id))
    }

    async fn execute_queries(&self, group_id: &str, dataset_id: &str, dax: &str) -> Result<Vec<Row>> {
        let url = format!(
            "{}/groups/{}/datasets/{}/executeQueries",
            self.api_base, group_id, dataset_id
        );
        let body = serde_json::json!({
            "queries": [{"query": dax}],
            "serializerSettings": {"includeNulls": true}
        });

        let (url, body) = (&url, &body);
        let payload: Value = retry_with_backoff(self.retry, "Execute DAX", move || async move {
            let token = self.tokens.token().await?;
            let response = self
                .client
                .post(url)
                .bearer_auth(&token)
                .json(body)
                .send()
                .await
                .map_err(|e| PipelineError::power_bi(format!("Execute DAX failed: {}", e), None))?;
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .map_err(|e| PipelineError::power_bi(format!("Execute DAX failed: {}", e), None))?;
            if status >= 400 {
                return Err(status_error("Execute DAX", status, &text));
            }
            serde_json::from_str(&text)
                .map_err(|e| PipelineError::power_bi(format!("Execute DAX: invalid JSON: {}", e), Some(status)))
        })
        .await?;

        if let Some(err) = payload["results"][0].get("error").or_else(|| payload.get("error"))
            .filter(|e| !e.is_null())
        {
            return Err(PipelineError::power_bi(format!("Execute DAX failed: {}", err), Some(400)));
        }

        let rows = payload["results"][0]["tables"][0]["rows"]
            .as_array()
            .map(|rows| rows.iter().filter_map(|r| r.as_object().cloned()).collect())
            .unwrap_or_default();
        Ok(rows)
    }
}

#[async_trait]
impl QueryExecutor for PowerBiRestExecutor {
    fn name(&self) -> &'static str {
        "powerbi-rest"
    }

    fn language(&self) -> QueryLanguage {
        QueryLanguage::Dax
    }

    async fn execute(&self, query: &str) -> Result<QueryResult> {
        let start = Instant::now();
        let (group_id, dataset_id) = self.resolve().await?;
        let rows = self.execute_queries(&group_id, &dataset_id, query).await?;
        let (columns, rows) = normalize_rows(rows);
        let elapsed = start.elapsed().as_millis() as u64;
        debug!("Power BI returned {} rows in {} ms", rows.len(), elapsed);
        Ok(QueryResult::ok(self.name(), columns, rows, elapsed))
    }

    async fn health_check(&self) -> Result<bool> {
        self.resolve().await?;
        Ok(true)
    }
}
