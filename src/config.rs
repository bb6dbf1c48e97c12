//! Environment-driven configuration.
//!
//! Every section is optional so that commands needing only part of the stack
//! (e.g. `validate-dax` with a cached schema) still start without a full `.env`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_AZURE_API_VERSION: &str = "2024-12-01-preview";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum LlmProvider {
    AzureOpenAi {
        endpoint: String,
        deployment: String,
        api_version: String,
    },
    OpenAi {
        base_url: String,
        model: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmSettings {
    #[serde(skip)]
    pub api_key: String,
    pub provider: LlmProvider,
}

#[derive(Debug, Clone, Serialize)]
pub struct AzureSqlSettings {
    pub server: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip)]
    pub password: String,
    pub trust_cert: bool,
}

impl AzureSqlSettings {
    /// Parameters identifying the database for the schema cache. Never includes the password.
    pub fn connection_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("server".to_string(), self.server.clone());
        params.insert("database".to_string(), self.database.clone());
        params.insert("username".to_string(), self.username.clone());
        params.insert("port".to_string(), self.port.to_string());
        params
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PowerBiSettings {
    pub tenant_id: String,
    pub client_id: String,
    #[serde(skip)]
    pub client_secret: String,
    pub endpoint: String,
    pub dataset_name: String,
    pub dataset_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSettings {
    pub enable_query_cache: bool,
    pub compare_results: bool,
    pub save_results: bool,
    pub cache_dir: PathBuf,
    pub results_dir: PathBuf,
    pub schema_max_age_hours: f64,
    pub query_cache_ttl_secs: u64,
    pub dax_retries: u32,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            enable_query_cache: true,
            compare_results: true,
            save_results: true,
            cache_dir: PathBuf::from("cache"),
            results_dir: PathBuf::from("results"),
            schema_max_age_hours: 24.0,
            query_cache_ttl_secs: 3600,
            dax_retries: 3,
            llm_temperature: 0.1,
            llm_max_tokens: 2000,
        }
    }
}

impl PipelineSettings {
    pub fn query_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("queries")
    }

    pub fn schema_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("schema")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Section {
    Llm,
    AzureSql,
    PowerBi,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineConfig {
    pub llm: Option<LlmSettings>,
    pub sql: Option<AzureSqlSettings>,
    pub power_bi: Option<PowerBiSettings>,
    pub pipeline: PipelineSettings,
    #[serde(skip)]
    missing: BTreeMap<Section, Vec<&'static str>>,
}

impl PipelineConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut missing = BTreeMap::new();

        let llm = match read_llm(&get) {
            Ok(settings) => Some(settings),
            Err(vars) => {
                missing.insert(Section::Llm, vars);
                None
            }
        };
        let sql = match read_sql(&get) {
            Ok(settings) => Some(settings),
            Err(vars) => {
                missing.insert(Section::AzureSql, vars);
                None
            }
        };
        let power_bi = match read_power_bi(&get) {
            Ok(settings) => Some(settings),
            Err(vars) => {
                missing.insert(Section::PowerBi, vars);
                None
            }
        };

        let defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            enable_query_cache: get("ENABLE_QUERY_CACHING")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.enable_query_cache),
            compare_results: get("COMPARE_SQL_DAX_RESULTS")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.compare_results),
            save_results: get("SAVE_PIPELINE_RESULTS")
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.save_results),
            cache_dir: get("NL2DAX_CACHE_DIR").map(PathBuf::from).unwrap_or(defaults.cache_dir),
            results_dir: get("NL2DAX_RESULTS_DIR").map(PathBuf::from).unwrap_or(defaults.results_dir),
            schema_max_age_hours: get("SCHEMA_CACHE_MAX_AGE_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.schema_max_age_hours),
            query_cache_ttl_secs: get("QUERY_CACHE_TTL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.query_cache_ttl_secs),
            dax_retries: get("DAX_EXECUTION_RETRIES")
                .and_then(|v| v.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.dax_retries),
            llm_temperature: get("LLM_TEMPERATURE")
                .and_then(|v| v.parse().ok())
                .filter(|t: &f32| (0.0..=2.0).contains(t))
                .unwrap_or(defaults.llm_temperature),
            llm_max_tokens: get("LLM_MAX_TOKENS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.llm_max_tokens),
        };

        Self {
            llm,
            sql,
            power_bi,
            pipeline,
            missing,
        }
    }

    /// Variables that are unset for the requested sections.
    pub fn missing(&self, sections: &[Section]) -> Vec<&'static str> {
        sections
            .iter()
            .filter_map(|s| self.missing.get(s))
            .flatten()
            .copied()
            .collect()
    }
}

pub fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn read_llm<G>(get: &G) -> Result<LlmSettings, Vec<&'static str>>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(endpoint) = get("AZURE_OPENAI_ENDPOINT") {
        let key = get("AZURE_OPENAI_API_KEY");
        let deployment = get("AZURE_OPENAI_DEPLOYMENT_NAME");
        return match (key, deployment) {
            (Some(api_key), Some(deployment)) => Ok(LlmSettings {
                api_key,
                provider: LlmProvider::AzureOpenAi {
                    endpoint: endpoint.trim_end_matches('/').to_string(),
                    deployment,
                    api_version: get("AZURE_OPENAI_API_VERSION")
                        .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string()),
                },
            }),
            (key, deployment) => {
                let mut vars = Vec::new();
                if key.is_none() {
                    vars.push("AZURE_OPENAI_API_KEY");
                }
                if deployment.is_none() {
                    vars.push("AZURE_OPENAI_DEPLOYMENT_NAME");
                }
                Err(vars)
            }
        };
    }

    match get("OPENAI_API_KEY") {
        Some(api_key) => Ok(LlmSettings {
            api_key,
            provider: LlmProvider::OpenAi {
                base_url: get("OPENAI_BASE_URL")
                    .map(|u| u.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
                model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            },
        }),
        None => Err(vec![
            "AZURE_OPENAI_API_KEY",
            "AZURE_OPENAI_ENDPOINT",
            "AZURE_OPENAI_DEPLOYMENT_NAME",
        ]),
    }
}

fn read_sql<G>(get: &G) -> Result<AzureSqlSettings, Vec<&'static str>>
where
    G: Fn(&str) -> Option<String>,
{
    let server = get("AZURE_SQL_SERVER");
    let database = get("AZURE_SQL_DB");
    let username = get("AZURE_SQL_USER");
    let password = get("AZURE_SQL_PASSWORD");

    match (server, database, username, password) {
        (Some(server), Some(database), Some(username), Some(password)) => {
            let (host, embedded_port) = split_server(&server);
            let port = get("AZURE_SQL_PORT")
                .and_then(|p| p.parse().ok())
                .or(embedded_port)
                .unwrap_or(1433);
            Ok(AzureSqlSettings {
                server: host,
                port,
                database,
                username,
                password,
                trust_cert: get("AZURE_SQL_TRUST_CERT").map(|v| parse_bool(&v)).unwrap_or(false),
            })
        }
        (server, database, username, password) => {
            let mut vars = Vec::new();
            if server.is_none() {
                vars.push("AZURE_SQL_SERVER");
            }
            if database.is_none() {
                vars.push("AZURE_SQL_DB");
            }
            if username.is_none() {
                vars.push("AZURE_SQL_USER");
            }
            if password.is_none() {
                vars.push("AZURE_SQL_PASSWORD");
            }
            Err(vars)
        }
    }
}

fn read_power_bi<G>(get: &G) -> Result<PowerBiSettings, Vec<&'static str>>
where
    G: Fn(&str) -> Option<String>,
{
    let required = [
        "PBI_TENANT_ID",
        "PBI_CLIENT_ID",
        "PBI_CLIENT_SECRET",
        "PBI_XMLA_ENDPOINT",
        "PBI_DATASET_NAME",
    ];
    let values: Vec<Option<String>> = required.iter().map(|k| get(k)).collect();
    let missing: Vec<&'static str> = required
        .iter()
        .zip(&values)
        .filter(|(_, v)| v.is_none())
        .map(|(k, _)| *k)
        .collect();
    if !missing.is_empty() {
        return Err(missing);
    }

    let mut values = values.into_iter().flatten();
    let mut next = || values.next().unwrap_or_default();
    Ok(PowerBiSettings {
        tenant_id: next(),
        client_id: next(),
        client_secret: next(),
        endpoint: next(),
        dataset_name: next(),
        dataset_id: get("PBI_DATASET_ID"),
    })
}

/// Accepts `tcp:host,port`, `host,port` and `host`.
fn split_server(raw: &str) -> (String, Option<u16>) {
    let raw = raw.strip_prefix("tcp:").unwrap_or(raw);
    match raw.split_once(',') {
        Some((host, port)) => (host.trim().to_string(), port.trim().parse().ok()),
        None => (raw.trim().to_string(), None),
    }
}
