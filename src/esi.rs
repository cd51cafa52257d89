use crate::cache::{keys, Cache, CacheValue};
use crate::http::{FetchError, HttpClient};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Successful lookups are memoised this long.
const POSITIVE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Not-found is a legitimate negative result; cache it briefly so repeated
/// enrichment of the same missing entity skips the round trip.
const NEGATIVE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Error)]
pub enum EsiError {
    #[error("system {0} not found")]
    SystemNotFound(u32),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected body: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiCharacter {
    pub name: String,
    #[serde(default)]
    pub corporation_id: Option<u64>,
    #[serde(default)]
    pub alliance_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiCorporation {
    pub name: String,
    #[serde(default)]
    pub ticker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiAlliance {
    pub name: String,
    #[serde(default)]
    pub ticker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiSystem {
    pub name: String,
    #[serde(default)]
    pub security_status: Option<f64>,
    #[serde(default)]
    pub constellation_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiType {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiVictim {
    #[serde(default)]
    pub character_id: Option<u64>,
    #[serde(default)]
    pub corporation_id: Option<u64>,
    #[serde(default)]
    pub alliance_id: Option<u64>,
    #[serde(default)]
    pub ship_type_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiAttacker {
    #[serde(default)]
    pub character_id: Option<u64>,
    #[serde(default)]
    pub corporation_id: Option<u64>,
    #[serde(default)]
    pub alliance_id: Option<u64>,
    #[serde(default)]
    pub ship_type_id: Option<u64>,
    #[serde(default)]
    pub final_blow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EsiKillmail {
    pub killmail_id: u64,
    pub killmail_time: String,
    pub solar_system_id: u32,
    pub victim: EsiVictim,
    #[serde(default)]
    pub attackers: Vec<EsiAttacker>,
}

/// Game-catalog adapter. Each call is memoised in the cache under a distinct
/// `esi:<resource>:<id>` key; errors are never cached.
#[derive(Debug, Clone)]
pub struct EsiClient {
    http: Arc<HttpClient>,
    cache: Arc<Cache>,
    base: String,
}

impl EsiClient {
    pub fn new(http: Arc<HttpClient>, cache: Arc<Cache>, base: String) -> Self {
        Self {
            http,
            cache,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub async fn get_character(&self, id: u64) -> Result<EsiCharacter, EsiError> {
        self.fetch_cached("character", &id.to_string(), &format!("characters/{id}/"))
            .await
    }

    pub async fn get_corporation(&self, id: u64) -> Result<EsiCorporation, EsiError> {
        self.fetch_cached(
            "corporation",
            &id.to_string(),
            &format!("corporations/{id}/"),
        )
        .await
    }

    pub async fn get_alliance(&self, id: u64) -> Result<EsiAlliance, EsiError> {
        self.fetch_cached("alliance", &id.to_string(), &format!("alliances/{id}/"))
            .await
    }

    pub async fn get_system(&self, id: u32) -> Result<EsiSystem, EsiError> {
        self.fetch_cached(
            "system",
            &id.to_string(),
            &format!("universe/systems/{id}/"),
        )
        .await
        .map_err(|err| match err {
            EsiError::NotFound => EsiError::SystemNotFound(id),
            other => other,
        })
    }

    pub async fn get_type(&self, id: u64) -> Result<EsiType, EsiError> {
        self.fetch_cached("type", &id.to_string(), &format!("universe/types/{id}/"))
            .await
    }

    pub async fn get_killmail(&self, id: u64, hash: &str) -> Result<EsiKillmail, EsiError> {
        self.fetch_cached(
            "killmail",
            &id.to_string(),
            &format!("killmails/{id}/{hash}/"),
        )
        .await
    }

    /// Resolve inventory type IDs by name.
    #[allow(dead_code)]
    pub async fn search_inventory_type(
        &self,
        query: &str,
        strict: bool,
    ) -> Result<Vec<u64>, EsiError> {
        let cache_id = format!("{query}:{strict}");
        let key = keys::esi("search", &cache_id);
        match self.cache.get(&key) {
            Some(CacheValue::Json(serde_json::Value::Null)) => return Err(EsiError::NotFound),
            Some(CacheValue::Json(body)) => return parse_search(&body),
            _ => {}
        }

        let mut url = self.url("search/").map_err(EsiError::Decode)?;
        url.query_pairs_mut()
            .append_pair("categories", "inventory_type")
            .append_pair("search", query)
            .append_pair("strict", if strict { "true" } else { "false" });

        match self.http.get_json(url, None).await {
            Ok(body) => {
                self.cache
                    .set(&key, CacheValue::Json(body.clone()), POSITIVE_TTL);
                parse_search(&body)
            }
            Err(FetchError::NotFound) => {
                self.cache
                    .set(&key, CacheValue::Json(serde_json::Value::Null), NEGATIVE_TTL);
                Err(EsiError::NotFound)
            }
            Err(err) => Err(EsiError::Fetch(err)),
        }
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, String> {
        reqwest::Url::parse(&format!("{}/latest/{path}", self.base)).map_err(|e| e.to_string())
    }

    async fn fetch_cached<T: DeserializeOwned>(
        &self,
        resource: &str,
        cache_id: &str,
        path: &str,
    ) -> Result<T, EsiError> {
        let key = keys::esi(resource, cache_id);
        match self.cache.get(&key) {
            Some(CacheValue::Json(serde_json::Value::Null)) => return Err(EsiError::NotFound),
            Some(CacheValue::Json(body)) => {
                return serde_json::from_value(body).map_err(|e| EsiError::Decode(e.to_string()))
            }
            _ => {}
        }

        let url = self.url(path).map_err(EsiError::Decode)?;
        match self.http.get_json(url, None).await {
            Ok(body) => {
                self.cache
                    .set(&key, CacheValue::Json(body.clone()), POSITIVE_TTL);
                serde_json::from_value(body).map_err(|e| EsiError::Decode(e.to_string()))
            }
            Err(FetchError::NotFound) => {
                self.cache
                    .set(&key, CacheValue::Json(serde_json::Value::Null), NEGATIVE_TTL);
                Err(EsiError::NotFound)
            }
            Err(err) => Err(EsiError::Fetch(err)),
        }
    }
}

fn parse_search(body: &serde_json::Value) -> Result<Vec<u64>, EsiError> {
    match body.get("inventory_type") {
        Some(serde_json::Value::Array(ids)) => Ok(ids
            .iter()
            .filter_map(|v| v.as_u64())
            .collect()),
        _ => Ok(Vec::new()),
    }
}
