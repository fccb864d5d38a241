//! In-memory DICOM JSON attribute model.
//!
//! An [`AttributeModel`] maps tags to [`Attribute`]s. It serialises to, and deserialises
//! from, the DICOM JSON model (`{"0020000D": {"vr": "UI", "Value": ["1.2.3"]}}`), and its
//! canonical form is what content hashes are computed over: keys in tag order, values
//! always as lists, keys that are not valid tags dropped.

use crate::tags::{dictionary_vr, parse_tag, tag_key, PrivateTag, TagRef};
use dicom_core::{Tag, VR};
use serde::de::Error as DeError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

const PRIVATE_BLOCK_FIRST: u16 = 0x10;
const PRIVATE_BLOCK_END: u16 = 0x40;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("no free private block for creator {creator} in group {group:04X}")]
    PrivateBlocksExhausted { creator: String, group: u16 },

    #[error("unknown attribute name: {0}")]
    UnknownName(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Person name components, as in the DICOM JSON model.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PersonName {
    #[serde(rename = "Alphabetic", default, skip_serializing_if = "Option::is_none")]
    pub alphabetic: Option<String>,
    #[serde(rename = "Ideographic", default, skip_serializing_if = "Option::is_none")]
    pub ideographic: Option<String>,
    #[serde(rename = "Phonetic", default, skip_serializing_if = "Option::is_none")]
    pub phonetic: Option<String>,
}

impl PersonName {
    /// Splits an encoded person name into its `=` separated component groups.
    pub fn parse(value: &str) -> Self {
        let mut groups = value.splitn(3, '=').map(|group| {
            let group = group.trim_end();
            if group.is_empty() {
                None
            } else {
                Some(group.to_string())
            }
        });
        Self {
            alphabetic: groups.next().flatten(),
            ideographic: groups.next().flatten(),
            phonetic: groups.next().flatten(),
        }
    }
}

/// A single value of a primitive attribute.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    PersonName(PersonName),
}

impl Scalar {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            Scalar::PersonName(name) => name.alphabetic.as_deref(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(i) => Some(*i),
            Scalar::UInt(u) => i64::try_from(*u).ok(),
            Scalar::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Scalar::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::UInt(u) => write!(f, "{u}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Str(s) => f.write_str(s),
            Scalar::PersonName(name) => f.write_str(name.alphabetic.as_deref().unwrap_or("")),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Str(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(value.into())
    }
}

impl From<u16> for Scalar {
    fn from(value: u16) -> Self {
        Scalar::Int(value.into())
    }
}

impl From<u32> for Scalar {
    fn from(value: u32) -> Self {
        Scalar::Int(value.into())
    }
}

impl From<usize> for Scalar {
    fn from(value: usize) -> Self {
        match i64::try_from(value) {
            Ok(i) => Scalar::Int(i),
            Err(_) => Scalar::UInt(value as u64),
        }
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<PersonName> for Scalar {
    fn from(value: PersonName) -> Self {
        Scalar::PersonName(value)
    }
}

/// Where the content of an attribute lives.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Zero length attribute.
    Empty,
    Values(Vec<Scalar>),
    /// Sequence items. Only ever used with VR `SQ`.
    Items(Vec<AttributeModel>),
    /// Base64 encoded binary content.
    InlineBinary(String),
    /// Content stored outside the model, referenced by URI.
    BulkDataUri(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub vr: VR,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(vr: VR, value: AttributeValue) -> Self {
        Self { vr, value }
    }

    pub fn empty(vr: VR) -> Self {
        Self::new(vr, AttributeValue::Empty)
    }

    pub fn values<I, S>(vr: VR, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        Self::new(
            vr,
            AttributeValue::Values(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn items(items: Vec<AttributeModel>) -> Self {
        Self::new(VR::SQ, AttributeValue::Items(items))
    }

    /// The primitive values, if this attribute holds any.
    pub fn scalars(&self) -> Option<&[Scalar]> {
        match &self.value {
            AttributeValue::Values(values) => Some(values),
            _ => None,
        }
    }

    pub fn first_str(&self) -> Option<&str> {
        self.scalars()
            .and_then(|values| values.first())
            .and_then(Scalar::as_str)
    }
}

impl Serialize for Attribute {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = if self.value == AttributeValue::Empty { 1 } else { 2 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("vr", self.vr.to_string())?;
        match &self.value {
            AttributeValue::Empty => {}
            AttributeValue::Values(values) => map.serialize_entry("Value", values)?,
            AttributeValue::Items(items) => map.serialize_entry("Value", items)?,
            AttributeValue::InlineBinary(data) => map.serialize_entry("InlineBinary", data)?,
            AttributeValue::BulkDataUri(uri) => map.serialize_entry("BulkDataURI", uri)?,
        }
        map.end()
    }
}

// Intermediate representation; the meaning of "Value" depends on the VR.
#[derive(Deserialize)]
struct OwnedAttributeRepr {
    #[serde(default)]
    vr: Option<String>,
    #[serde(rename = "Value", default)]
    value: Option<serde_json::Value>,
    #[serde(rename = "InlineBinary", default)]
    inline_binary: Option<String>,
    #[serde(rename = "BulkDataURI", default)]
    bulk_data_uri: Option<String>,
}

impl<'de> Deserialize<'de> for Attribute {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = OwnedAttributeRepr::deserialize(deserializer)?;
        let vr = repr
            .vr
            .as_deref()
            .and_then(|vr| vr.parse::<VR>().ok())
            .unwrap_or(VR::UN);

        let value = if let Some(uri) = repr.bulk_data_uri {
            AttributeValue::BulkDataUri(uri)
        } else if let Some(data) = repr.inline_binary {
            AttributeValue::InlineBinary(data)
        } else {
            match repr.value {
                None | Some(serde_json::Value::Null) => AttributeValue::Empty,
                Some(value) => {
                    // a bare value is normalised to a single element list
                    let value = match value {
                        serde_json::Value::Array(_) => value,
                        other => serde_json::Value::Array(vec![other]),
                    };
                    if vr == VR::SQ {
                        let items: Vec<AttributeModel> =
                            serde_json::from_value(value).map_err(D::Error::custom)?;
                        AttributeValue::Items(items)
                    } else {
                        let values: Vec<Scalar> =
                            serde_json::from_value(value).map_err(D::Error::custom)?;
                        AttributeValue::Values(values)
                    }
                }
            }
        };
        Ok(Attribute { vr, value })
    }
}

/// The result of looking an attribute up, keeping "absent" and "empty" apart.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    Absent,
    Empty,
    Single(&'a Scalar),
    Multiple(&'a [Scalar]),
    /// Sequences and binary content have no scalar form.
    Complex(&'a Attribute),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeModel(BTreeMap<Tag, Attribute>);

impl AttributeModel {
    pub fn new() -> Self {
        AttributeModel(BTreeMap::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.0.contains_key(&tag)
    }

    pub fn attribute(&self, tag: Tag) -> Option<&Attribute> {
        self.0.get(&tag)
    }

    pub fn attribute_mut(&mut self, tag: Tag) -> Option<&mut Attribute> {
        self.0.get_mut(&tag)
    }

    pub fn insert(&mut self, tag: Tag, attribute: Attribute) -> Option<Attribute> {
        self.0.insert(tag, attribute)
    }

    pub fn take(&mut self, tag: Tag) -> Option<Attribute> {
        self.0.remove(&tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &Attribute)> {
        self.0.iter()
    }

    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.0.keys().copied()
    }

    /// Resolves a tag reference without modifying the model.
    ///
    /// Returns `None` for unknown names, and for private tags whose creator has no block.
    pub fn find_tag<'a>(&self, tag: impl Into<TagRef<'a>>) -> Option<Tag> {
        match tag.into() {
            TagRef::Tag(tag) => Some(tag),
            TagRef::Named(name) => parse_tag(name),
            TagRef::Private(private) => self.find_private_block(&private).0,
        }
    }

    /// Resolves a tag reference, claiming a private block for the creator when needed.
    pub fn find_or_create_tag<'a>(&mut self, tag: impl Into<TagRef<'a>>) -> Result<Tag> {
        match tag.into() {
            TagRef::Tag(tag) => Ok(tag),
            TagRef::Named(name) => parse_tag(name).ok_or_else(|| Error::UnknownName(name.into())),
            TagRef::Private(private) => {
                let (found, free) = self.find_private_block(&private);
                if let Some(tag) = found {
                    return Ok(tag);
                }
                let group = private.tag.group();
                let offset = free.ok_or_else(|| Error::PrivateBlocksExhausted {
                    creator: private.creator.to_string(),
                    group,
                })?;
                self.0.insert(
                    Tag(group, offset),
                    Attribute::values(VR::LO, [private.creator]),
                );
                Ok(private_block_tag(&private, offset))
            }
        }
    }

    // Scans the block reservations of the group, returning the matching tag and the first
    // unused block offset.
    fn find_private_block(&self, private: &PrivateTag) -> (Option<Tag>, Option<u16>) {
        let group = private.tag.group();
        let mut free = None;
        for offset in PRIVATE_BLOCK_FIRST..PRIVATE_BLOCK_END {
            match self.0.get(&Tag(group, offset)) {
                None => {
                    free.get_or_insert(offset);
                }
                Some(creator) if creator.first_str() == Some(private.creator) => {
                    return (Some(private_block_tag(private, offset)), free);
                }
                Some(_) => {}
            }
        }
        (None, free)
    }

    pub fn get<'a>(&self, tag: impl Into<TagRef<'a>>) -> Lookup<'_> {
        let Some(attribute) = self.find_tag(tag).and_then(|tag| self.0.get(&tag)) else {
            return Lookup::Absent;
        };
        match &attribute.value {
            AttributeValue::Empty => Lookup::Empty,
            AttributeValue::Values(values) => match values.as_slice() {
                [] => Lookup::Empty,
                [single] => Lookup::Single(single),
                many => Lookup::Multiple(many),
            },
            _ => Lookup::Complex(attribute),
        }
    }

    /// The first value of a primitive attribute.
    pub fn get_scalar<'a>(&self, tag: impl Into<TagRef<'a>>) -> Option<&Scalar> {
        self.get_list(tag).and_then(|values| values.first())
    }

    /// The first value of a primitive attribute, as a string.
    pub fn get_str<'a>(&self, tag: impl Into<TagRef<'a>>) -> Option<&str> {
        self.get_scalar(tag).and_then(Scalar::as_str)
    }

    /// All values of a primitive attribute. An empty attribute yields an empty list.
    pub fn get_list<'a>(&self, tag: impl Into<TagRef<'a>>) -> Option<&[Scalar]> {
        let attribute = self.find_tag(tag).and_then(|tag| self.0.get(&tag))?;
        match &attribute.value {
            AttributeValue::Values(values) => Some(values),
            AttributeValue::Empty => Some(&[]),
            _ => None,
        }
    }

    pub fn get_items<'a>(&self, tag: impl Into<TagRef<'a>>) -> Option<&[AttributeModel]> {
        let attribute = self.find_tag(tag).and_then(|tag| self.0.get(&tag))?;
        match &attribute.value {
            AttributeValue::Items(items) => Some(items),
            _ => None,
        }
    }

    /// Replaces the values of an attribute, returning the resolved tag.
    pub fn set<'a, I, S>(&mut self, tag: impl Into<TagRef<'a>>, values: I) -> Result<Tag>
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        let tag = tag.into();
        let resolved = self.find_or_create_tag(tag)?;
        let vr = self.vr_for(resolved, &tag);
        self.0.insert(resolved, Attribute::values(vr, values));
        Ok(resolved)
    }

    /// Appends a value, creating the attribute when absent.
    pub fn push<'a>(&mut self, tag: impl Into<TagRef<'a>>, value: impl Into<Scalar>) -> Result<Tag> {
        let tag = tag.into();
        let resolved = self.find_or_create_tag(tag)?;
        let vr = self.vr_for(resolved, &tag);
        let attribute = self
            .0
            .entry(resolved)
            .or_insert_with(|| Attribute::values(vr, Vec::<Scalar>::new()));
        match &mut attribute.value {
            AttributeValue::Values(values) => values.push(value.into()),
            other => *other = AttributeValue::Values(vec![value.into()]),
        }
        Ok(resolved)
    }

    pub fn remove<'a>(&mut self, tag: impl Into<TagRef<'a>>) -> Option<Attribute> {
        let tag = self.find_tag(tag)?;
        self.0.remove(&tag)
    }

    fn vr_for(&self, tag: Tag, tag_ref: &TagRef) -> VR {
        if let Some(existing) = self.0.get(&tag) {
            return existing.vr;
        }
        if let Some(vr) = dictionary_vr(tag) {
            return vr;
        }
        match tag_ref {
            TagRef::Private(private) => private.vr,
            _ => VR::UN,
        }
    }
}

fn private_block_tag(private: &PrivateTag, offset: u16) -> Tag {
    Tag(private.tag.group(), (offset << 8) | (private.tag.element() & 0x00FF))
}

impl FromIterator<(Tag, Attribute)> for AttributeModel {
    fn from_iter<T: IntoIterator<Item = (Tag, Attribute)>>(iter: T) -> Self {
        AttributeModel(iter.into_iter().collect())
    }
}

impl IntoIterator for AttributeModel {
    type Item = (Tag, Attribute);
    type IntoIter = std::collections::btree_map::IntoIter<Tag, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Serialize for AttributeModel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (tag, attribute) in &self.0 {
            map.serialize_entry(&tag_key(*tag), attribute)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for AttributeModel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string_map: BTreeMap<String, Attribute> = BTreeMap::deserialize(deserializer)?;

        // Keys that do not name a tag (e.g. "undefined") are dropped
        let model = string_map
            .into_iter()
            .filter_map(|(key, attribute)| parse_tag(&key).map(|tag| (tag, attribute)))
            .collect();
        Ok(model)
    }
}
