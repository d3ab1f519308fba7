use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::limits::MAX_TAGS_PER_ATTRACTION;

/// Metadata kinds an attraction can carry.
///
/// Simple kinds are presence-only; structured kinds carry a value that must
/// match the kind's schema exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagKind {
    #[serde(rename = "FASTPASS")]
    FastPass,
    #[serde(rename = "MAY_GET_WET")]
    MayGetWet,
    #[serde(rename = "UNSUITABLE_PREGNANT")]
    UnsuitablePregnant,
    #[serde(rename = "ONRIDE_PHOTO")]
    OnRidePhoto,
    #[serde(rename = "CHILD_SWAP")]
    ChildSwap,
    #[serde(rename = "SINGLE_RIDER")]
    SingleRider,
    #[serde(rename = "LOCATION")]
    Location,
    #[serde(rename = "MINIMUM_HEIGHT")]
    MinimumHeight,
    #[serde(rename = "MAXIMUM_HEIGHT")]
    MaximumHeight,
}

const ALL_KINDS: [TagKind; 9] = [
    TagKind::FastPass,
    TagKind::MayGetWet,
    TagKind::UnsuitablePregnant,
    TagKind::OnRidePhoto,
    TagKind::ChildSwap,
    TagKind::SingleRider,
    TagKind::Location,
    TagKind::MinimumHeight,
    TagKind::MaximumHeight,
];

#[derive(Debug, Clone, Copy)]
enum FieldRule {
    Latitude,
    Longitude,
    NonNegativeNumber,
    OneOf(&'static [&'static str]),
}

const LOCATION_SCHEMA: &[(&str, FieldRule)] = &[
    ("latitude", FieldRule::Latitude),
    ("longitude", FieldRule::Longitude),
];

const HEIGHT_SCHEMA: &[(&str, FieldRule)] = &[
    ("height", FieldRule::NonNegativeNumber),
    ("unit", FieldRule::OneOf(&["cm", "in"])),
];

impl TagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagKind::FastPass => "FASTPASS",
            TagKind::MayGetWet => "MAY_GET_WET",
            TagKind::UnsuitablePregnant => "UNSUITABLE_PREGNANT",
            TagKind::OnRidePhoto => "ONRIDE_PHOTO",
            TagKind::ChildSwap => "CHILD_SWAP",
            TagKind::SingleRider => "SINGLE_RIDER",
            TagKind::Location => "LOCATION",
            TagKind::MinimumHeight => "MINIMUM_HEIGHT",
            TagKind::MaximumHeight => "MAXIMUM_HEIGHT",
        }
    }

    /// Parse a wire name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        ALL_KINDS.into_iter().find(|k| k.as_str() == name)
    }

    pub fn is_simple(&self) -> bool {
        self.schema().is_none()
    }

    fn schema(&self) -> Option<&'static [(&'static str, FieldRule)]> {
        match self {
            TagKind::Location => Some(LOCATION_SCHEMA),
            TagKind::MinimumHeight | TagKind::MaximumHeight => Some(HEIGHT_SCHEMA),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub key: Option<String>,
    pub kind: TagKind,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Tag {
    pub fn new(key: Option<&str>, kind: TagKind, value: Option<Value>) -> Self {
        Self {
            key: key.map(str::to_string),
            kind,
            value,
        }
    }

    /// Presence-only tag.
    pub fn simple(kind: TagKind) -> Self {
        Self::new(None, kind, None)
    }

    fn matches(&self, key: Option<&str>, kind: TagKind) -> bool {
        self.kind == kind && self.key.as_deref() == key
    }
}

/// What a tag write resolves to after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum TagChange {
    Set(Option<Value>),
    Remove,
    Reject,
}

fn field_ok(rule: FieldRule, value: &Value) -> bool {
    match rule {
        FieldRule::Latitude => value
            .as_f64()
            .is_some_and(|v| (-90.0..=90.0).contains(&v)),
        FieldRule::Longitude => value
            .as_f64()
            .is_some_and(|v| (-180.0..=180.0).contains(&v)),
        FieldRule::NonNegativeNumber => value.as_f64().is_some_and(|v| v >= 0.0),
        FieldRule::OneOf(allowed) => value.as_str().is_some_and(|s| allowed.contains(&s)),
    }
}

/// Check a structured value against its schema: every declared key present
/// and valid, and nothing else.
fn matches_schema(schema: &[(&str, FieldRule)], value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    if obj.len() != schema.len() {
        return false;
    }
    schema
        .iter()
        .all(|(name, rule)| obj.get(*name).is_some_and(|v| field_ok(*rule, v)))
}

/// Validate and normalize a tag write.
pub fn normalize(kind: TagKind, value: Option<Value>) -> TagChange {
    match kind.schema() {
        None => match value {
            None | Some(Value::Null) | Some(Value::Bool(true)) => TagChange::Set(None),
            Some(Value::Bool(false)) => TagChange::Remove,
            Some(_) => TagChange::Reject,
        },
        Some(schema) => match value {
            Some(v) if matches_schema(schema, &v) => TagChange::Set(Some(v)),
            _ => TagChange::Reject,
        },
    }
}

/// Apply a tag write to an attraction's tag list. Returns false when the write
/// was rejected; the list is untouched in that case.
pub fn apply(tags: &mut Vec<Tag>, key: Option<&str>, kind: TagKind, value: Option<Value>) -> bool {
    match normalize(kind, value) {
        TagChange::Reject => false,
        TagChange::Remove => {
            remove(tags, key, kind);
            true
        }
        TagChange::Set(value) => {
            if let Some(existing) = tags.iter_mut().find(|t| t.matches(key, kind)) {
                existing.value = value;
                return true;
            }
            if tags.len() >= MAX_TAGS_PER_ATTRACTION {
                return false;
            }
            tags.push(Tag::new(key, kind, value));
            true
        }
    }
}

/// Remove a key+kind pair. Returns whether anything was removed.
pub fn remove(tags: &mut Vec<Tag>, key: Option<&str>, kind: TagKind) -> bool {
    let before = tags.len();
    tags.retain(|t| !t.matches(key, kind));
    tags.len() != before
}
