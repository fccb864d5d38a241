//! Attribute tags used by the archive, and the closed [`TagRef`] union accepted by
//! [`AttributeModel`](crate::model::AttributeModel) accessors.

use dicom_core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom_core::{Tag, VR};
use dicom_dictionary_std::StandardDataDictionary;

pub use dicom_dictionary_std::tags::*;

pub const AVAILABLE_TRANSFER_SYNTAX_UID: Tag = Tag(0x0008, 0x3002);
pub const ENCAPSULATED_DOCUMENT: Tag = Tag(0x0042, 0x0011);
pub const MIME_TYPE_OF_ENCAPSULATED_DOCUMENT: Tag = Tag(0x0042, 0x0012);
pub const ITEM_DELIMITATION_ITEM: Tag = Tag(0xFFFE, 0xE00D);

const MAXIMUM_UID_LENGTH: usize = 64;

/// Private creator owning the deduplication bookkeeping attributes.
pub const DEDUPPED_CREATOR: &str = "dedupped";

/// A private attribute addressed through its creator rather than a fixed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateTag {
    pub creator: &'static str,
    /// The element byte of `tag` is the offset inside the creator's block.
    pub tag: Tag,
    pub vr: VR,
}

/// Hashes of the fragments a residual instance record depends on, 1..n values.
pub const DEDUPPED_REF: PrivateTag = PrivateTag {
    creator: DEDUPPED_CREATOR,
    tag: Tag(0x0009, 0x1010),
    vr: VR::LO,
};

/// The content hash of the model carrying it.
pub const DEDUPPED_HASH: PrivateTag = PrivateTag {
    creator: DEDUPPED_CREATOR,
    tag: Tag(0x0009, 0x1011),
    vr: VR::LO,
};

/// The [`DedupKind`](crate::tag_lists::DedupKind) of the model carrying it.
pub const DEDUPPED_TYPE: PrivateTag = PrivateTag {
    creator: DEDUPPED_CREATOR,
    tag: Tag(0x0009, 0x1012),
    vr: VR::LO,
};

/// Any of the ways a caller may name an attribute.
///
/// Resolved once, at the [`AttributeModel`](crate::model::AttributeModel) boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagRef<'a> {
    Tag(Tag),
    /// An 8 hex digit key such as `"0020000D"`, or a dictionary keyword such as
    /// `"StudyInstanceUID"`.
    Named(&'a str),
    Private(PrivateTag),
}

impl From<Tag> for TagRef<'_> {
    fn from(tag: Tag) -> Self {
        TagRef::Tag(tag)
    }
}

impl From<u32> for TagRef<'_> {
    fn from(value: u32) -> Self {
        TagRef::Tag(Tag((value >> 16) as u16, (value & 0xFFFF) as u16))
    }
}

impl<'a> From<&'a str> for TagRef<'a> {
    fn from(name: &'a str) -> Self {
        TagRef::Named(name)
    }
}

impl From<PrivateTag> for TagRef<'_> {
    fn from(tag: PrivateTag) -> Self {
        TagRef::Private(tag)
    }
}

/// Formats a tag the way attribute keys are written: 8 upper-case hex digits.
pub fn tag_key(tag: Tag) -> String {
    format!("{:04X}{:04X}", tag.group(), tag.element())
}

/// Parses an attribute key (`"0020000D"`), a parenthesised tag (`"(0020,000D)"`) or a
/// dictionary keyword.
pub fn parse_tag(name: &str) -> Option<Tag> {
    let trimmed = name.trim();
    if trimmed.len() == 8 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        let group = u16::from_str_radix(&trimmed[..4], 16).ok()?;
        let element = u16::from_str_radix(&trimmed[4..], 16).ok()?;
        return Some(Tag(group, element));
    }
    if let Ok(tag) = trimmed.parse::<Tag>() {
        return Some(tag);
    }
    StandardDataDictionary
        .by_name(trimmed)
        .map(|entry| entry.tag())
}

/// Looks up the value representation for a tag in the standard dictionary.
pub fn dictionary_vr(tag: Tag) -> Option<VR> {
    StandardDataDictionary
        .by_tag(tag)
        .map(|entry| entry.vr().relaxed())
}

/// Tags with odd group numbers are private.
pub fn is_private_tag(tag: Tag) -> bool {
    tag.group() % 2 != 0
}

/// Checks that a value is a DICOM UID: dot separated digit components, at most 64
/// characters. Only such values are used as directory names.
pub fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= MAXIMUM_UID_LENGTH
        && uid
            .split('.')
            .all(|component| !component.is_empty() && component.bytes().all(|b| b.is_ascii_digit()))
}

/// Group length elements carry no information once the stream has been parsed.
pub fn is_group_length(tag: Tag) -> bool {
    tag.element() == 0x0000
}
