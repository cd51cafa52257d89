use crate::events::{extract_character, extract_system};
use crate::http::{FetchError, HttpClient};
use crate::registry::{TrackedCharacter, TrackedSystem};
use serde_json::Value;
use std::sync::Arc;

/// Wormhole class/static details served by the map for a single system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticInfo {
    pub class_title: Option<String>,
    pub statics: Vec<String>,
    pub region_name: Option<String>,
}

/// Client for the upstream map API. Only used for the startup snapshot and
/// on-demand static info; the live feed arrives over SSE.
#[derive(Debug, Clone)]
pub struct MapApiClient {
    http: Arc<HttpClient>,
    base: String,
    slug: String,
    token: String,
}

impl MapApiClient {
    pub fn new(http: Arc<HttpClient>, base: String, slug: String, token: String) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            slug,
            token,
        }
    }

    pub async fn systems(&self) -> Result<Vec<TrackedSystem>, FetchError> {
        let url = self.url(&format!("/api/maps/{}/systems", self.slug))?;
        let body = self.http.get_json(url, Some(&self.token)).await?;
        Ok(parse_systems(&body))
    }

    pub async fn user_characters(&self) -> Result<Vec<TrackedCharacter>, FetchError> {
        let mut url = self.url("/api/map/user_characters")?;
        url.query_pairs_mut().append_pair("slug", &self.slug);
        let body = self.http.get_json(url, Some(&self.token)).await?;
        Ok(parse_user_characters(&body))
    }

    #[allow(dead_code)]
    pub async fn system_static_info(&self, id: u32) -> Result<StaticInfo, FetchError> {
        let mut url = self.url("/api/common/system-static-info")?;
        url.query_pairs_mut().append_pair("id", &id.to_string());
        let body = self.http.get_json(url, Some(&self.token)).await?;
        Ok(parse_static_info(&body))
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, FetchError> {
        reqwest::Url::parse(&format!("{}{path}", self.base))
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

fn parse_systems(body: &Value) -> Vec<TrackedSystem> {
    let rows = body
        .get("systems")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut systems = Vec::with_capacity(rows.len());
    for row in &rows {
        match extract_system(row) {
            Ok(system) => systems.push(system),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed system row in snapshot");
            }
        }
    }
    systems
}

fn parse_user_characters(body: &Value) -> Vec<TrackedCharacter> {
    let groups = body
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut characters = Vec::new();
    for group in &groups {
        let rows = group
            .get("characters")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for row in &rows {
            match extract_character(row) {
                Ok(character) => characters.push(character),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed character row in snapshot");
                }
            }
        }
    }
    characters
}

fn parse_static_info(body: &Value) -> StaticInfo {
    let data = body.get("data").unwrap_or(body);
    StaticInfo {
        class_title: data
            .get("class_title")
            .and_then(Value::as_str)
            .map(str::to_string),
        statics: data
            .get("statics")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        region_name: data
            .get("region_name")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}
