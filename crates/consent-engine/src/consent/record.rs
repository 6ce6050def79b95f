//! The persisted consent record and its storage form.
//!
//! Stored values use compact single-letter keys to keep the persisted
//! footprint small; the scheme is internal and only round-trip behavior
//! is a contract. Legacy deployments stored a bare boolean, which still
//! deserializes to a decided record.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::consent::ConsentState;

const KEY_STATE: &str = "s";
const KEY_STRING: &str = "r";
const KEY_DIRTY: &str = "d";
const KEY_METADATA: &str = "m";
const KEY_PURPOSES: &str = "pc";
const KEY_TCF_VERSION: &str = "v";

const META_KEY_STRING_TYPE: &str = "cst";
const META_KEY_ADDITIONAL: &str = "ac";
const META_KEY_GDPR: &str = "ga";
const META_KEY_PURPOSE_ONE: &str = "po";

/// Value recorded for a single purpose. Unset purposes are never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurposeValue {
    Accepted,
    Rejected,
}

impl PurposeValue {
    pub fn is_accepted(self) -> bool {
        matches!(self, PurposeValue::Accepted)
    }
}

/// Encoding of the opaque consent string, as reported by the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentStringType {
    TcfV1,
    TcfV2,
    UsPrivacyString,
    GlobalPrivacyControl,
}

impl ConsentStringType {
    pub fn code(self) -> u8 {
        match self {
            ConsentStringType::TcfV1 => 1,
            ConsentStringType::TcfV2 => 2,
            ConsentStringType::UsPrivacyString => 3,
            ConsentStringType::GlobalPrivacyControl => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ConsentStringType::TcfV1),
            2 => Some(ConsentStringType::TcfV2),
            3 => Some(ConsentStringType::UsPrivacyString),
            4 => Some(ConsentStringType::GlobalPrivacyControl),
            _ => None,
        }
    }
}

impl Serialize for ConsentStringType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}

/// Supplementary data attached to a consent decision. Every field is
/// independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_string_type: Option<ConsentStringType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_consent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gdpr_applies: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose_one: Option<bool>,
}

impl ConsentMetadata {
    pub fn is_empty(&self) -> bool {
        self.consent_string_type.is_none()
            && self.additional_consent.is_none()
            && self.gdpr_applies.is_none()
            && self.purpose_one.is_none()
    }
}

/// Snapshot of one instance's consent decision. Every mutation builds a
/// new record; records are compared, not edited in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsentRecord {
    pub state: ConsentState,
    pub consent_string: Option<String>,
    pub metadata: Option<ConsentMetadata>,
    pub purpose_consents: Option<HashMap<String, PurposeValue>>,
    pub is_dirty: bool,
    pub tcf_policy_version: Option<u32>,
}

impl ConsentRecord {
    /// Record carrying only a state, everything else unset.
    pub fn new(state: ConsentState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }
}

/// Legacy boolean form of a state: `Some(true)` accepted, `Some(false)`
/// rejected, `None` for every transient state.
pub fn legacy_state_value(state: ConsentState) -> Option<bool> {
    match state {
        ConsentState::Accepted => Some(true),
        ConsentState::Rejected => Some(false),
        _ => None,
    }
}

/// Storage form of a record, or `None` when the state is not decided
/// (transient states leave nothing durable behind).
pub fn serialize(record: &ConsentRecord) -> Option<Value> {
    let accepted = legacy_state_value(record.state)?;
    let mut map = Map::new();
    map.insert(KEY_STATE.to_string(), json!(if accepted { 1 } else { 0 }));
    if let Some(consent_string) = stored_string(record) {
        map.insert(KEY_STRING.to_string(), json!(consent_string));
    }
    if record.is_dirty {
        map.insert(KEY_DIRTY.to_string(), json!(1));
    }
    if let Some(metadata) = stored_metadata(record) {
        map.insert(KEY_METADATA.to_string(), metadata_to_value(metadata));
    }
    if let Some(purposes) = stored_purposes(record) {
        let encoded: Map<String, Value> = purposes
            .iter()
            .map(|(id, value)| (id.clone(), json!(value.is_accepted())))
            .collect();
        map.insert(KEY_PURPOSES.to_string(), Value::Object(encoded));
    }
    if let Some(version) = record.tcf_policy_version {
        map.insert(KEY_TCF_VERSION.to_string(), json!(version));
    }
    Some(Value::Object(map))
}

/// Restore a record from its stored value. Unrecognizable input yields an
/// `Unknown` record; malformed individual fields are dropped and the rest
/// of the record is still produced.
pub fn deserialize(value: Option<&Value>) -> ConsentRecord {
    let Some(value) = value else {
        return ConsentRecord::new(ConsentState::Unknown);
    };
    match value {
        // legacy deployments stored the decision as a bare boolean
        Value::Bool(accepted) => ConsentRecord::new(if *accepted {
            ConsentState::Accepted
        } else {
            ConsentState::Rejected
        }),
        Value::Object(map) => deserialize_object(map),
        other => {
            tracing::warn!("unrecognized stored consent value {other}, treating as unknown");
            ConsentRecord::new(ConsentState::Unknown)
        }
    }
}

fn deserialize_object(map: &Map<String, Value>) -> ConsentRecord {
    let state = match map.get(KEY_STATE) {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(1) => ConsentState::Accepted,
            Some(0) => ConsentState::Rejected,
            _ => ConsentState::Unknown,
        },
        Some(Value::Bool(true)) => ConsentState::Accepted,
        Some(Value::Bool(false)) => ConsentState::Rejected,
        _ => ConsentState::Unknown,
    };
    let consent_string = map
        .get(KEY_STRING)
        .and_then(Value::as_str)
        .map(str::to_string);
    let is_dirty = match map.get(KEY_DIRTY) {
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::Bool(dirty)) => *dirty,
        _ => false,
    };
    let metadata = map.get(KEY_METADATA).and_then(|value| match value {
        Value::Object(meta) => {
            let metadata = metadata_from_map(meta);
            (!metadata.is_empty()).then_some(metadata)
        }
        other => {
            tracing::warn!("dropping malformed consent metadata {other}");
            None
        }
    });
    let purpose_consents = map.get(KEY_PURPOSES).and_then(|value| match value {
        Value::Object(purposes) => {
            let parsed = purposes_from_map(purposes);
            (!parsed.is_empty()).then_some(parsed)
        }
        other => {
            tracing::warn!("dropping malformed purpose consents {other}");
            None
        }
    });
    let tcf_policy_version = map
        .get(KEY_TCF_VERSION)
        .and_then(Value::as_u64)
        .map(|version| version as u32);
    ConsentRecord {
        state,
        consent_string,
        metadata,
        purpose_consents,
        is_dirty,
        tcf_policy_version,
    }
}

fn metadata_to_value(metadata: &ConsentMetadata) -> Value {
    let mut map = Map::new();
    if let Some(string_type) = metadata.consent_string_type {
        map.insert(META_KEY_STRING_TYPE.to_string(), json!(string_type.code()));
    }
    if let Some(additional) = &metadata.additional_consent {
        map.insert(META_KEY_ADDITIONAL.to_string(), json!(additional));
    }
    if let Some(gdpr) = metadata.gdpr_applies {
        map.insert(META_KEY_GDPR.to_string(), json!(gdpr));
    }
    if let Some(purpose_one) = metadata.purpose_one {
        map.insert(META_KEY_PURPOSE_ONE.to_string(), json!(purpose_one));
    }
    Value::Object(map)
}

fn metadata_from_map(map: &Map<String, Value>) -> ConsentMetadata {
    let consent_string_type = map.get(META_KEY_STRING_TYPE).and_then(|value| {
        let parsed = value.as_i64().and_then(ConsentStringType::from_code);
        if parsed.is_none() {
            tracing::warn!("dropping unrecognized consent string type {value}");
        }
        parsed
    });
    let additional_consent = map.get(META_KEY_ADDITIONAL).and_then(|value| {
        let parsed = value.as_str().map(str::to_string);
        if parsed.is_none() {
            tracing::warn!("dropping non-string additional consent {value}");
        }
        parsed
    });
    let gdpr_applies = map.get(META_KEY_GDPR).and_then(|value| {
        let parsed = value.as_bool();
        if parsed.is_none() {
            tracing::warn!("dropping non-boolean gdprApplies {value}");
        }
        parsed
    });
    let purpose_one = map.get(META_KEY_PURPOSE_ONE).and_then(|value| {
        let parsed = value.as_bool();
        if parsed.is_none() {
            tracing::warn!("dropping non-boolean purposeOne {value}");
        }
        parsed
    });
    ConsentMetadata {
        consent_string_type,
        additional_consent,
        gdpr_applies,
        purpose_one,
    }
}

fn purposes_from_map(map: &Map<String, Value>) -> HashMap<String, PurposeValue> {
    let mut parsed = HashMap::new();
    for (id, value) in map {
        match value.as_bool() {
            Some(true) => {
                parsed.insert(id.clone(), PurposeValue::Accepted);
            }
            Some(false) => {
                parsed.insert(id.clone(), PurposeValue::Rejected);
            }
            None => {
                tracing::warn!("dropping non-boolean purpose consent for {id}");
            }
        }
    }
    parsed
}

/// Whether two records produce the same stored value. `force_dirty`
/// overrides `a`'s dirty flag, for callers that have a pending dirty
/// request not yet folded into the record.
pub fn same_stored_value(a: &ConsentRecord, b: &ConsentRecord, force_dirty: Option<bool>) -> bool {
    let a_dirty = force_dirty.unwrap_or(a.is_dirty);
    legacy_state_value(a.state) == legacy_state_value(b.state)
        && stored_string(a) == stored_string(b)
        && stored_metadata(a) == stored_metadata(b)
        && stored_purposes(a) == stored_purposes(b)
        && a_dirty == b.is_dirty
        && a.tcf_policy_version == b.tcf_policy_version
}

/// Merge an incoming state with the previously known one.
///
/// Dismissal preserves whatever was known before; "not required" never
/// overrides an actual decision; an explicit `Unknown` clears one.
pub fn reconcile(new_state: ConsentState, previous: Option<ConsentState>) -> ConsentState {
    match new_state {
        ConsentState::Dismissed => previous.unwrap_or(ConsentState::Unknown),
        ConsentState::NotRequired => match previous {
            Some(prev @ (ConsentState::Accepted | ConsentState::Rejected)) => prev,
            _ => ConsentState::NotRequired,
        },
        other => other,
    }
}

fn stored_string(record: &ConsentRecord) -> Option<&str> {
    record
        .consent_string
        .as_deref()
        .filter(|value| !value.is_empty())
}

fn stored_metadata(record: &ConsentRecord) -> Option<&ConsentMetadata> {
    record
        .metadata
        .as_ref()
        .filter(|metadata| !metadata.is_empty())
}

fn stored_purposes(record: &ConsentRecord) -> Option<&HashMap<String, PurposeValue>> {
    record
        .purpose_consents
        .as_ref()
        .filter(|purposes| !purposes.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_record(state: ConsentState) -> ConsentRecord {
        let mut purposes = HashMap::new();
        purposes.insert("analytics".to_string(), PurposeValue::Accepted);
        purposes.insert("ads".to_string(), PurposeValue::Rejected);
        ConsentRecord {
            state,
            consent_string: Some("opaque-string".to_string()),
            metadata: Some(ConsentMetadata {
                consent_string_type: Some(ConsentStringType::TcfV2),
                additional_consent: Some("1~1.2.3".to_string()),
                gdpr_applies: Some(true),
                purpose_one: Some(false),
            }),
            purpose_consents: Some(purposes),
            is_dirty: false,
            tcf_policy_version: Some(4),
        }
    }

    #[test]
    fn round_trips_decided_records() {
        for state in [ConsentState::Accepted, ConsentState::Rejected] {
            let record = full_record(state);
            let stored = serialize(&record).expect("stored value");
            assert_eq!(deserialize(Some(&stored)), record);
        }
    }

    #[test]
    fn round_trips_dirty_flag() {
        let mut record = full_record(ConsentState::Accepted);
        record.is_dirty = true;
        let stored = serialize(&record).expect("stored value");
        assert_eq!(stored.get("d"), Some(&json!(1)));
        assert_eq!(deserialize(Some(&stored)), record);
    }

    #[test]
    fn transient_states_serialize_to_nothing() {
        for state in [
            ConsentState::Unknown,
            ConsentState::Dismissed,
            ConsentState::NotRequired,
        ] {
            assert!(serialize(&ConsentRecord::new(state)).is_none());
        }
    }

    #[test]
    fn compact_form_omits_empty_fields() {
        let record = ConsentRecord {
            state: ConsentState::Accepted,
            consent_string: Some("str1".to_string()),
            ..ConsentRecord::default()
        };
        assert_eq!(
            serialize(&record),
            Some(json!({"s": 1, "r": "str1"}))
        );
    }

    #[test]
    fn legacy_boolean_values_deserialize() {
        assert_eq!(
            deserialize(Some(&json!(true))).state,
            ConsentState::Accepted
        );
        assert_eq!(
            deserialize(Some(&json!(false))).state,
            ConsentState::Rejected
        );
    }

    #[test]
    fn unrecognizable_values_degrade_to_unknown() {
        assert_eq!(deserialize(None).state, ConsentState::Unknown);
        assert_eq!(deserialize(Some(&json!("junk"))).state, ConsentState::Unknown);
        assert_eq!(deserialize(Some(&json!({}))).state, ConsentState::Unknown);
    }

    #[test]
    fn malformed_purpose_entries_are_dropped_not_fatal() {
        let stored = json!({"s": 1, "pc": {"a": true, "b": "yes", "c": false}});
        let record = deserialize(Some(&stored));
        let purposes = record.purpose_consents.expect("purposes");
        assert_eq!(purposes.get("a"), Some(&PurposeValue::Accepted));
        assert_eq!(purposes.get("c"), Some(&PurposeValue::Rejected));
        assert!(!purposes.contains_key("b"));
        assert_eq!(record.state, ConsentState::Accepted);
    }

    #[test]
    fn malformed_metadata_fields_are_dropped_not_fatal() {
        let stored = json!({"s": 0, "m": {"cst": 99, "ac": "1~2", "ga": true}});
        let record = deserialize(Some(&stored));
        let metadata = record.metadata.expect("metadata");
        assert!(metadata.consent_string_type.is_none());
        assert_eq!(metadata.additional_consent.as_deref(), Some("1~2"));
        assert_eq!(metadata.gdpr_applies, Some(true));
    }

    #[test]
    fn reconcile_follows_precedence() {
        use ConsentState::*;
        assert_eq!(reconcile(Dismissed, Some(Rejected)), Rejected);
        assert_eq!(reconcile(Dismissed, Some(Accepted)), Accepted);
        assert_eq!(reconcile(Dismissed, Some(Unknown)), Unknown);
        assert_eq!(reconcile(Dismissed, None), Unknown);
        assert_eq!(reconcile(NotRequired, Some(Accepted)), Accepted);
        assert_eq!(reconcile(NotRequired, Some(Rejected)), Rejected);
        assert_eq!(reconcile(NotRequired, Some(Dismissed)), NotRequired);
        assert_eq!(reconcile(NotRequired, None), NotRequired);
        assert_eq!(reconcile(Unknown, Some(Accepted)), Unknown);
        assert_eq!(reconcile(Accepted, Some(Rejected)), Accepted);
        assert_eq!(reconcile(Rejected, None), Rejected);
    }

    #[test]
    fn same_stored_value_ignores_transient_distinctions() {
        let a = ConsentRecord::new(ConsentState::Dismissed);
        let b = ConsentRecord::new(ConsentState::Unknown);
        assert!(same_stored_value(&a, &b, None));
    }

    #[test]
    fn same_stored_value_detects_differences() {
        let a = full_record(ConsentState::Accepted);
        let mut b = full_record(ConsentState::Accepted);
        assert!(same_stored_value(&a, &b, None));

        b.consent_string = Some("other".to_string());
        assert!(!same_stored_value(&a, &b, None));
    }

    #[test]
    fn same_stored_value_honors_dirty_override() {
        let a = full_record(ConsentState::Accepted);
        let b = full_record(ConsentState::Accepted);
        assert!(!same_stored_value(&a, &b, Some(true)));

        let mut dirty_b = b.clone();
        dirty_b.is_dirty = true;
        assert!(same_stored_value(&a, &dirty_b, Some(true)));
    }

    #[test]
    fn empty_supplements_compare_like_absent_ones() {
        let mut a = ConsentRecord::new(ConsentState::Accepted);
        a.metadata = Some(ConsentMetadata::default());
        a.consent_string = Some(String::new());
        a.purpose_consents = Some(HashMap::new());
        let b = ConsentRecord::new(ConsentState::Accepted);
        assert!(same_stored_value(&a, &b, None));
        assert_eq!(serialize(&a), Some(json!({"s": 1})));
    }
}
