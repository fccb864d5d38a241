//! Conversion of a raw data set into an [`AttributeModel`].
//!
//! Each element is either decoded inline or handed to a [`BulkDataHandler`], depending on
//! its size. Pixel data at the top level is always split into frames and handed over frame
//! by frame, or as a single stream for video transfer syntaxes.

mod frames;
mod value;

pub use frames::{number_of_frames, video_extension};

use crate::config::Config;
use crate::dataset::{DataSetView, RawElement};
use crate::model::{Attribute, AttributeModel, AttributeValue};
use crate::store;
use crate::tags::{self, dictionary_vr, is_group_length, is_private_tag};
use dicom_core::{Tag, VR};
use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot import: no Study Instance UID")]
    CannotImport,

    #[error("pixel data frame {index} of {count} not found")]
    MissingFrame { index: usize, count: usize },

    #[error("failed to store bulk data: {0}")]
    BulkData(#[from] store::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Details passed along with externalised bulk data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkDataOptions {
    /// MIME type of an encapsulated document.
    pub mime_type: Option<String>,
}

/// Receives the content that does not stay inline, returning the URI to reference it by.
///
/// Calls for one instance happen in element order, and frames in ascending index order.
pub trait BulkDataHandler {
    fn bulkdata(&mut self, bytes: &[u8], options: &BulkDataOptions) -> store::Result<String>;

    fn image_frame(&mut self, frame: &[u8], index: usize) -> store::Result<String>;

    /// Receives the whole pixel data stream of a video.
    fn video(&mut self, stream: &[u8], extension: &str) -> store::Result<String>;
}

const FIRST_BODY_GROUP: u16 = 0x0008;

#[derive(Debug, Clone)]
pub struct Extractor {
    maximum_inline_public_length: u32,
    maximum_inline_private_length: u32,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Extractor {
    pub fn new(maximum_inline_public_length: u32, maximum_inline_private_length: u32) -> Self {
        Self {
            maximum_inline_public_length,
            maximum_inline_private_length,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.maximum_inline_public_length(),
            config.maximum_inline_private_length(),
        )
    }

    /// Builds the attribute model of a data set.
    ///
    /// Fails with [`Error::CannotImport`] before any bulk data is written when the data set
    /// has no Study Instance UID.
    pub fn extract<H: BulkDataHandler + ?Sized>(
        &self,
        data_set: DataSetView<'_>,
        handler: &mut H,
    ) -> Result<AttributeModel> {
        let has_study = data_set
            .string(tags::STUDY_INSTANCE_UID, 0)
            .is_some_and(|uid| !uid.is_empty());
        if !has_study {
            return Err(Error::CannotImport);
        }

        let transfer_syntax = data_set
            .string(tags::TRANSFER_SYNTAX_UID, 0)
            .unwrap_or_default();
        let mut model = self.data_set(&data_set, &transfer_syntax, handler, true)?;

        if let Some(attribute) = model.take(tags::TRANSFER_SYNTAX_UID) {
            model.insert(tags::AVAILABLE_TRANSFER_SYNTAX_UID, attribute);
        }
        Ok(model)
    }

    fn data_set<H: BulkDataHandler + ?Sized>(
        &self,
        view: &DataSetView<'_>,
        transfer_syntax: &str,
        handler: &mut H,
        top_level: bool,
    ) -> Result<AttributeModel> {
        let mut model = AttributeModel::new();
        for element in view.elements {
            if skip_element(element.tag) {
                continue;
            }
            let Some(vr) = element_vr(element) else {
                debug!("skipping element {} without VR", element.tag);
                continue;
            };
            let value = self.element_value(view, element, vr, transfer_syntax, handler, top_level)?;
            model.insert(element.tag, Attribute::new(vr, value));
        }
        Ok(model)
    }

    fn element_value<H: BulkDataHandler + ?Sized>(
        &self,
        view: &DataSetView<'_>,
        element: &RawElement,
        vr: VR,
        transfer_syntax: &str,
        handler: &mut H,
        top_level: bool,
    ) -> Result<AttributeValue> {
        if top_level && element.tag == tags::PIXEL_DATA && !element.is_empty() {
            return Ok(
                match frames::extract_frames(view, element, transfer_syntax, handler)? {
                    Some(uri) => AttributeValue::BulkDataUri(uri),
                    None => AttributeValue::Empty,
                },
            );
        }

        if element.items.is_some() {
            let mut items = Vec::new();
            for item in view.items(element) {
                items.push(self.data_set(&item, transfer_syntax, handler, false)?);
            }
            return Ok(if items.is_empty() {
                AttributeValue::Empty
            } else {
                AttributeValue::Items(items)
            });
        }

        if let Some(encapsulated) = &element.encapsulated {
            let fragments: Vec<_> = encapsulated.fragments.iter().collect();
            let bytes = frames::concat(view, &fragments);
            if bytes.is_empty() {
                return Ok(AttributeValue::Empty);
            }
            if bytes.len() <= self.inline_limit(element.tag) {
                return Ok(value::inline_binary(&bytes));
            }
            let uri = handler.bulkdata(&bytes, &BulkDataOptions::default())?;
            return Ok(AttributeValue::BulkDataUri(uri));
        }

        if element.length == Some(0) {
            return Ok(AttributeValue::Empty);
        }

        if self.is_inline(element) {
            return Ok(value::decode(view, element, vr));
        }

        let mime_type = if element.tag == tags::ENCAPSULATED_DOCUMENT {
            view.string(tags::MIME_TYPE_OF_ENCAPSULATED_DOCUMENT, 0)
        } else {
            None
        };
        let uri = handler.bulkdata(view.bytes(element), &BulkDataOptions { mime_type })?;
        Ok(AttributeValue::BulkDataUri(uri))
    }

    fn inline_limit(&self, tag: Tag) -> usize {
        let limit = if is_private_tag(tag) {
            self.maximum_inline_private_length
        } else {
            self.maximum_inline_public_length
        };
        limit as usize
    }

    fn is_inline(&self, element: &RawElement) -> bool {
        element
            .length
            .map_or(true, |length| length as usize <= self.inline_limit(element.tag))
    }
}

// File meta elements other than the transfer syntax, group lengths and delimiters carry
// no attribute.
fn skip_element(tag: Tag) -> bool {
    (tag.group() < FIRST_BODY_GROUP && tag != tags::TRANSFER_SYNTAX_UID)
        || is_group_length(tag)
        || tag == tags::ITEM_DELIMITATION_ITEM
}

fn element_vr(element: &RawElement) -> Option<VR> {
    if element.items.is_some() {
        return Some(VR::SQ);
    }
    if let Some(vr) = element.vr.or_else(|| dictionary_vr(element.tag)) {
        return Some(vr);
    }
    if is_private_tag(element.tag) && (0x0010..=0x00FF).contains(&element.tag.element()) {
        return Some(VR::LO);
    }
    if element.is_empty() {
        None
    } else {
        Some(VR::UN)
    }
}
