use serde_json::Value;
use std::time::Instant;

/// zkb-style summary attached to a killmail id on the feed. The hash is
/// what unlocks the full body from the game catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ZkbSummary {
    pub hash: String,
    pub total_value: Option<f64>,
    pub points: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawKillmail {
    pub killmail_id: u64,
    pub zkb: ZkbSummary,
}

/// Normalised pipeline item with its arrival timestamp.
#[derive(Debug, Clone)]
pub struct PendingKill {
    pub killmail_id: u64,
    pub hash: String,
    pub total_value: Option<f64>,
    pub points: Option<u32>,
    pub received_at: Instant,
}

pub fn normalise(raw: RawKillmail) -> PendingKill {
    PendingKill {
        killmail_id: raw.killmail_id,
        hash: raw.zkb.hash,
        total_value: raw.zkb.total_value,
        points: raw.zkb.points,
        received_at: Instant::now(),
    }
}

/// Parse a killmail feed envelope. Accepts the plain shape
/// `{"killmail_id": .., "zkb": {..}}` as well as the long-poll wrapper
/// `{"package": {"killID": .., "zkb": {..}}}`; an empty package (feed idle)
/// yields `None`.
pub fn parse_feed_envelope(value: &Value) -> Option<RawKillmail> {
    let body = match value.get("package") {
        Some(Value::Null) => return None,
        Some(package) => package,
        None => value,
    };

    let killmail_id = body
        .get("killmail_id")
        .or_else(|| body.get("killID"))
        .and_then(Value::as_u64)?;

    let zkb = body.get("zkb")?;
    let hash = zkb.get("hash").and_then(Value::as_str)?.to_string();
    if hash.is_empty() {
        return None;
    }

    Some(RawKillmail {
        killmail_id,
        zkb: ZkbSummary {
            hash,
            total_value: zkb.get("totalValue").and_then(Value::as_f64),
            points: zkb
                .get("points")
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok()),
        },
    })
}

/// Compact ISK rendering for notification text.
pub fn format_isk(value: f64) -> String {
    let abs = value.abs();
    if abs >= 1_000_000_000.0 {
        format!("{:.1}b ISK", value / 1_000_000_000.0)
    } else if abs >= 1_000_000.0 {
        format!("{:.1}m ISK", value / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{:.1}k ISK", value / 1_000.0)
    } else {
        format!("{value:.0} ISK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_envelope_parses() {
        let raw = parse_feed_envelope(&json!({
            "killmail_id": 100,
            "zkb": { "hash": "h", "totalValue": 1_500_000.0, "points": 10 }
        }))
        .unwrap();
        assert_eq!(raw.killmail_id, 100);
        assert_eq!(raw.zkb.hash, "h");
        assert_eq!(raw.zkb.total_value, Some(1_500_000.0));
        assert_eq!(raw.zkb.points, Some(10));
    }

    #[test]
    fn long_poll_wrapper_parses() {
        let raw = parse_feed_envelope(&json!({
            "package": {
                "killID": 101,
                "zkb": { "hash": "abc" }
            }
        }))
        .unwrap();
        assert_eq!(raw.killmail_id, 101);
        assert_eq!(raw.zkb.hash, "abc");
        assert_eq!(raw.zkb.total_value, None);
    }

    #[test]
    fn idle_or_malformed_envelopes_yield_none() {
        assert_eq!(parse_feed_envelope(&json!({ "package": null })), None);
        assert_eq!(parse_feed_envelope(&json!({ "killmail_id": 100 })), None);
        assert_eq!(
            parse_feed_envelope(&json!({ "killmail_id": 100, "zkb": { "hash": "" } })),
            None
        );
        assert_eq!(
            parse_feed_envelope(&json!({ "zkb": { "hash": "h" } })),
            None
        );
    }

    #[test]
    fn normalise_keeps_identity_and_summary() {
        let pending = normalise(RawKillmail {
            killmail_id: 7,
            zkb: ZkbSummary {
                hash: "h7".to_string(),
                total_value: Some(42.0),
                points: None,
            },
        });
        assert_eq!(pending.killmail_id, 7);
        assert_eq!(pending.hash, "h7");
        assert_eq!(pending.total_value, Some(42.0));
    }

    #[test]
    fn isk_formatting_scales() {
        assert_eq!(format_isk(2_450_000_000.0), "2.5b ISK");
        assert_eq!(format_isk(350_500_000.0), "350.5m ISK");
        assert_eq!(format_isk(12_300.0), "12.3k ISK");
        assert_eq!(format_isk(950.0), "950 ISK");
    }
}
