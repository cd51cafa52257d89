use crate::registry::{
    is_character_id, is_solar_system_id, TrackedCharacter, TrackedSystem,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// One event from a map stream. All five fields are required on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEvent {
    pub id: String,
    pub event_type: String,
    pub map_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EventError {
    #[error("invalid event format: {0}")]
    InvalidFormat(String),
    #[error("missing fields: {0:?}")]
    MissingFields(Vec<&'static str>),
    #[error("invalid payload")]
    InvalidPayload,
}

/// Parse and validate one SSE data frame.
pub fn parse_event(data: &str) -> Result<MapEvent, EventError> {
    let raw: Value =
        serde_json::from_str(data).map_err(|e| EventError::InvalidFormat(e.to_string()))?;
    validate_event(&raw)
}

pub fn validate_event(raw: &Value) -> Result<MapEvent, EventError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| EventError::InvalidFormat("event is not an object".to_string()))?;

    let mut missing = Vec::new();
    let id = obj.get("id").and_then(Value::as_str);
    if id.is_none() {
        missing.push("id");
    }
    let event_type = obj.get("type").and_then(Value::as_str);
    if event_type.is_none() {
        missing.push("type");
    }
    let map_id = obj.get("map_id").and_then(Value::as_str);
    if map_id.is_none() {
        missing.push("map_id");
    }
    let timestamp = obj.get("timestamp").and_then(Value::as_str);
    if timestamp.is_none() {
        missing.push("timestamp");
    }
    let payload = obj.get("payload");
    if payload.is_none() {
        missing.push("payload");
    }
    if !missing.is_empty() {
        return Err(EventError::MissingFields(missing));
    }

    let payload = payload.cloned().unwrap_or(Value::Null);
    match &payload {
        Value::Object(map) if !map.is_empty() => {}
        _ => return Err(EventError::InvalidPayload),
    }

    let timestamp = DateTime::parse_from_rfc3339(timestamp.unwrap_or_default())
        .map_err(|e| EventError::InvalidFormat(format!("bad timestamp: {e}")))?
        .with_timezone(&Utc);

    Ok(MapEvent {
        id: id.unwrap_or_default().to_string(),
        event_type: event_type.unwrap_or_default().to_string(),
        map_id: map_id.unwrap_or_default().to_string(),
        timestamp,
        payload,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    System,
    Character,
    Rally,
    Reserved,
    Special,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SystemAdded,
    SystemRemoved,
    SystemUpdated,
    CharacterAdded,
    CharacterRemoved,
    CharacterUpdated,
    RallyAdded,
    RallyRemoved,
    /// Connection/signature/ACL events are accepted but currently ignored.
    Reserved,
    Connected,
    MapKill,
    Unknown,
}

impl EventKind {
    pub fn category(self) -> EventCategory {
        match self {
            EventKind::SystemAdded | EventKind::SystemRemoved | EventKind::SystemUpdated => {
                EventCategory::System
            }
            EventKind::CharacterAdded
            | EventKind::CharacterRemoved
            | EventKind::CharacterUpdated => EventCategory::Character,
            EventKind::RallyAdded | EventKind::RallyRemoved => EventCategory::Rally,
            EventKind::Reserved => EventCategory::Reserved,
            EventKind::Connected | EventKind::MapKill => EventCategory::Special,
            EventKind::Unknown => EventCategory::Unknown,
        }
    }
}

/// Pure categorisation by event type string.
pub fn categorise(event_type: &str) -> EventKind {
    match event_type {
        "add_system" => EventKind::SystemAdded,
        "deleted_system" => EventKind::SystemRemoved,
        "system_metadata_changed" => EventKind::SystemUpdated,
        "character_added" => EventKind::CharacterAdded,
        "character_removed" => EventKind::CharacterRemoved,
        "character_updated" => EventKind::CharacterUpdated,
        "rally_point_added" => EventKind::RallyAdded,
        "rally_point_removed" => EventKind::RallyRemoved,
        "connected" => EventKind::Connected,
        "map_kill" => EventKind::MapKill,
        other => {
            if other.starts_with("connection")
                || other.starts_with("signature")
                || other.starts_with("acl")
            {
                EventKind::Reserved
            } else {
                EventKind::Unknown
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    #[error("payload carries no usable id")]
    MissingId,
    #[error("payload carries conflicting ids: {candidates:?}")]
    AmbiguousId { candidates: Vec<u64> },
    #[error("id {id} outside the expected range")]
    OutOfRange { id: u64 },
    #[error("payload carries no name")]
    MissingName,
}

/// Accept a numeric id written as a JSON number or a decimal string.
fn as_u64_lenient(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse::<u64>().ok(),
        _ => None,
    }
}

/// Pick the entity id out of a payload that may spell it several ways.
/// Multiple spellings are fine as long as they agree; conflicting candidates
/// are rejected rather than guessed at.
fn extract_id(obj: &serde_json::Map<String, Value>, spellings: &[&str]) -> Result<u64, ExtractError> {
    let mut candidates: Vec<u64> = spellings
        .iter()
        .filter_map(|k| obj.get(*k).and_then(as_u64_lenient))
        .collect();
    candidates.sort_unstable();
    candidates.dedup();
    match candidates.len() {
        0 => Err(ExtractError::MissingId),
        1 => Ok(candidates[0]),
        _ => Err(ExtractError::AmbiguousId { candidates }),
    }
}

const SYSTEM_ID_SPELLINGS: &[&str] = &["solar_system_id", "system_id", "id"];
const CHARACTER_ID_SPELLINGS: &[&str] = &["eve_id", "character_id", "id"];

/// Keys consumed by the system normaliser; everything else lands in metadata.
const SYSTEM_KNOWN_KEYS: &[&str] = &[
    "solar_system_id",
    "system_id",
    "id",
    "name",
    "system_name",
    "custom_name",
    "temporary_name",
    "class_title",
    "statics",
    "region_name",
];

pub fn extract_system(payload: &Value) -> Result<TrackedSystem, ExtractError> {
    let obj = payload.as_object().ok_or(ExtractError::MissingId)?;
    let id = extract_id(obj, SYSTEM_ID_SPELLINGS)?;
    let id = u32::try_from(id).map_err(|_| ExtractError::OutOfRange { id })?;
    if !is_solar_system_id(id) {
        return Err(ExtractError::OutOfRange { id: u64::from(id) });
    }

    let name = obj
        .get("name")
        .or_else(|| obj.get("system_name"))
        .and_then(Value::as_str)
        .ok_or(ExtractError::MissingName)?
        .to_string();

    let custom_name = obj
        .get("custom_name")
        .or_else(|| obj.get("temporary_name"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let class_title = obj
        .get("class_title")
        .and_then(Value::as_str)
        .map(str::to_string);

    let statics = obj
        .get("statics")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let region_name = obj
        .get("region_name")
        .and_then(Value::as_str)
        .map(str::to_string);

    let metadata: BTreeMap<String, Value> = obj
        .iter()
        .filter(|(k, _)| !SYSTEM_KNOWN_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(TrackedSystem {
        solar_system_id: id,
        name,
        custom_name,
        class_title,
        statics,
        region_name,
        metadata,
    })
}

/// Extract just the system id, for removal events that carry a bare id.
pub fn extract_system_id(payload: &Value) -> Result<u32, ExtractError> {
    let obj = payload.as_object().ok_or(ExtractError::MissingId)?;
    let id = extract_id(obj, SYSTEM_ID_SPELLINGS)?;
    let id = u32::try_from(id).map_err(|_| ExtractError::OutOfRange { id })?;
    if !is_solar_system_id(id) {
        return Err(ExtractError::OutOfRange { id: u64::from(id) });
    }
    Ok(id)
}

pub fn extract_character(payload: &Value) -> Result<TrackedCharacter, ExtractError> {
    // Some producers nest the entity under a `character` key.
    let payload = payload.get("character").unwrap_or(payload);
    let obj = payload.as_object().ok_or(ExtractError::MissingId)?;
    let id = extract_id(obj, CHARACTER_ID_SPELLINGS)?;
    if !is_character_id(id) {
        return Err(ExtractError::OutOfRange { id });
    }

    let name = obj
        .get("name")
        .or_else(|| obj.get("character_name"))
        .and_then(Value::as_str)
        .ok_or(ExtractError::MissingName)?
        .to_string();

    Ok(TrackedCharacter {
        eve_id: id,
        name,
        corporation_id: obj.get("corporation_id").and_then(as_u64_lenient),
        alliance_id: obj.get("alliance_id").and_then(as_u64_lenient),
        ship_type_id: obj.get("ship_type_id").and_then(as_u64_lenient),
        online: obj.get("online").and_then(Value::as_bool),
    })
}

pub fn extract_character_id(payload: &Value) -> Result<u64, ExtractError> {
    let payload = payload.get("character").unwrap_or(payload);
    let obj = payload.as_object().ok_or(ExtractError::MissingId)?;
    let id = extract_id(obj, CHARACTER_ID_SPELLINGS)?;
    if !is_character_id(id) {
        return Err(ExtractError::OutOfRange { id });
    }
    Ok(id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RallyPoint {
    pub id: u64,
    pub solar_system_id: Option<u32>,
    pub message: Option<String>,
    pub created_by: Option<String>,
}

pub fn extract_rally(payload: &Value) -> Result<RallyPoint, ExtractError> {
    let obj = payload.as_object().ok_or(ExtractError::MissingId)?;
    let id = extract_id(obj, &["rally_point_id", "id"])?;
    let solar_system_id = obj
        .get("solar_system_id")
        .or_else(|| obj.get("system_id"))
        .and_then(as_u64_lenient)
        .and_then(|v| u32::try_from(v).ok());
    Ok(RallyPoint {
        id,
        solar_system_id,
        message: obj
            .get("message")
            .or_else(|| obj.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        created_by: obj
            .get("character_name")
            .or_else(|| obj.get("created_by"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Value {
        json!({
            "id": "01JBX6T1R7N9M7V9Z3D4E5F6G7",
            "type": "add_system",
            "map_id": "7c9f6f9e-4a6e-4e58-9e2f-1f2a3b4c5d6e",
            "timestamp": "2025-11-02T12:00:00Z",
            "payload": { "solar_system_id": 31_000_001, "name": "J123456" }
        })
    }

    #[test]
    fn well_formed_event_validates() {
        let ev = validate_event(&envelope()).unwrap();
        assert_eq!(ev.event_type, "add_system");
        assert_eq!(ev.map_id, "7c9f6f9e-4a6e-4e58-9e2f-1f2a3b4c5d6e");
    }

    #[test]
    fn missing_fields_are_reported_together() {
        let mut raw = envelope();
        raw.as_object_mut().unwrap().remove("id");
        raw.as_object_mut().unwrap().remove("timestamp");
        match validate_event(&raw) {
            Err(EventError::MissingFields(fields)) => {
                assert_eq!(fields, vec!["id", "timestamp"]);
            }
            other => panic!("expected MissingFields, got {other:?}"),
        }
    }

    #[test]
    fn empty_payload_is_invalid() {
        let mut raw = envelope();
        raw["payload"] = json!({});
        assert_eq!(validate_event(&raw), Err(EventError::InvalidPayload));
    }

    #[test]
    fn bad_timestamp_is_invalid_format() {
        let mut raw = envelope();
        raw["timestamp"] = json!("yesterday");
        assert!(matches!(
            validate_event(&raw),
            Err(EventError::InvalidFormat(_))
        ));
    }

    #[test]
    fn categorisation_covers_the_partition() {
        assert_eq!(categorise("add_system"), EventKind::SystemAdded);
        assert_eq!(categorise("deleted_system"), EventKind::SystemRemoved);
        assert_eq!(
            categorise("system_metadata_changed"),
            EventKind::SystemUpdated
        );
        assert_eq!(categorise("character_added"), EventKind::CharacterAdded);
        assert_eq!(categorise("character_removed"), EventKind::CharacterRemoved);
        assert_eq!(categorise("character_updated"), EventKind::CharacterUpdated);
        assert_eq!(categorise("rally_point_added"), EventKind::RallyAdded);
        assert_eq!(categorise("rally_point_removed"), EventKind::RallyRemoved);
        assert_eq!(categorise("connected"), EventKind::Connected);
        assert_eq!(categorise("map_kill"), EventKind::MapKill);
        assert_eq!(categorise("connection_added"), EventKind::Reserved);
        assert_eq!(categorise("signature_updated"), EventKind::Reserved);
        assert_eq!(categorise("acl_member_added"), EventKind::Reserved);
        assert_eq!(categorise("something_else"), EventKind::Unknown);
    }

    #[test]
    fn system_extraction_accepts_spelling_variants() {
        for key in ["solar_system_id", "system_id", "id"] {
            let payload = json!({ key: 31_000_001, "name": "J123456" });
            let sys = extract_system(&payload).unwrap();
            assert_eq!(sys.solar_system_id, 31_000_001);
        }
        // Agreeing duplicates are fine.
        let payload = json!({
            "solar_system_id": 31_000_001,
            "id": 31_000_001,
            "name": "J123456"
        });
        assert!(extract_system(&payload).is_ok());
    }

    #[test]
    fn conflicting_ids_are_rejected() {
        let payload = json!({
            "solar_system_id": 31_000_001,
            "id": 31_000_002,
            "name": "J123456"
        });
        assert!(matches!(
            extract_system(&payload),
            Err(ExtractError::AmbiguousId { .. })
        ));
    }

    #[test]
    fn out_of_range_system_id_is_rejected() {
        let payload = json!({ "solar_system_id": 12345, "name": "nope" });
        assert!(matches!(
            extract_system(&payload),
            Err(ExtractError::OutOfRange { .. })
        ));
    }

    #[test]
    fn system_extraction_captures_extras_as_metadata() {
        let payload = json!({
            "solar_system_id": 31_000_001,
            "name": "J123456",
            "temporary_name": "Staging",
            "class_title": "C3",
            "statics": ["D845", "N968"],
            "locked": true
        });
        let sys = extract_system(&payload).unwrap();
        assert_eq!(sys.custom_name.as_deref(), Some("Staging"));
        assert_eq!(sys.statics, vec!["D845".to_string(), "N968".to_string()]);
        assert_eq!(sys.metadata.get("locked"), Some(&json!(true)));
        assert!(!sys.metadata.contains_key("name"));
    }

    #[test]
    fn character_extraction_handles_nesting_and_string_ids() {
        let payload = json!({
            "character": {
                "eve_id": "95000001",
                "name": "Pilot One",
                "corporation_id": 1_000_001,
                "online": true
            }
        });
        let ch = extract_character(&payload).unwrap();
        assert_eq!(ch.eve_id, 95_000_001);
        assert_eq!(ch.corporation_id, Some(1_000_001));
        assert_eq!(ch.online, Some(true));
    }

    #[test]
    fn character_id_range_is_enforced() {
        let payload = json!({ "character_id": 42, "name": "nope" });
        assert!(matches!(
            extract_character(&payload),
            Err(ExtractError::OutOfRange { .. })
        ));
    }

    #[test]
    fn rally_extraction() {
        let payload = json!({
            "rally_point_id": 17,
            "solar_system_id": 31_000_001,
            "message": "Form up",
            "character_name": "Pilot One"
        });
        let rally = extract_rally(&payload).unwrap();
        assert_eq!(rally.id, 17);
        assert_eq!(rally.solar_system_id, Some(31_000_001));
        assert_eq!(rally.message.as_deref(), Some("Form up"));
        assert_eq!(rally.created_by.as_deref(), Some("Pilot One"));
    }
}
