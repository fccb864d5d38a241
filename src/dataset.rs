//! Raw element view of a parsed DICOM data set.
//!
//! The extractor works on elements that point into one contiguous byte buffer, the way a
//! streaming Part-10 parser reports them: tag, declared VR, length, data offset, nested
//! items for sequences and fragment positions for encapsulated pixel data.

use crate::tags;
use dicom_core::header::Header;
use dicom_core::value::Value;
use dicom_core::{PrimitiveValue, Tag, VR};
use dicom_object::mem::InMemDicomObject;
use dicom_object::DefaultDicomObject;

/// Size of an item header (tag plus 32 bit length) in an encapsulated pixel sequence.
pub const ITEM_HEADER_LENGTH: u32 = 8;

/// An encapsulated pixel data fragment.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Fragment {
    /// Offset of the fragment item relative to the first fragment item, as used by the
    /// basic offset table.
    pub offset: u32,
    /// Position of the fragment bytes in the buffer.
    pub position: usize,
    pub length: usize,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Encapsulated {
    pub basic_offset_table: Vec<u32>,
    pub fragments: Vec<Fragment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawElement {
    pub tag: Tag,
    /// VR as declared in the stream, absent for implicit VR encodings.
    pub vr: Option<VR>,
    /// Value length, `None` when undefined.
    pub length: Option<u32>,
    pub data_offset: usize,
    pub items: Option<Vec<Vec<RawElement>>>,
    pub encapsulated: Option<Encapsulated>,
}

impl RawElement {
    pub fn is_empty(&self) -> bool {
        self.length == Some(0)
            && self.items.as_ref().map_or(true, Vec::is_empty)
            && self.encapsulated.is_none()
    }

    fn shift(&mut self, delta: usize) {
        self.data_offset += delta;
        for item in self.items.iter_mut().flatten() {
            for element in item {
                element.shift(delta);
            }
        }
        if let Some(encapsulated) = &mut self.encapsulated {
            for fragment in &mut encapsulated.fragments {
                fragment.position += delta;
            }
        }
    }
}

/// An owned data set: the byte buffer and the top level elements pointing into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDataSet {
    byte_array: Vec<u8>,
    elements: Vec<RawElement>,
}

impl RawDataSet {
    pub fn new(byte_array: Vec<u8>, elements: Vec<RawElement>) -> Self {
        Self {
            byte_array,
            elements,
        }
    }

    pub fn view(&self) -> DataSetView<'_> {
        DataSetView {
            byte_array: &self.byte_array,
            elements: &self.elements,
        }
    }

    pub fn byte_array(&self) -> &[u8] {
        &self.byte_array
    }

    pub fn elements(&self) -> &[RawElement] {
        &self.elements
    }

    /// Builds the raw view of a parsed Part-10 file.
    ///
    /// The transfer syntax of the file meta group is reported first, followed by the
    /// elements of the main data set.
    pub fn from_dicom_object(obj: &DefaultDicomObject) -> Self {
        let transfer_syntax = obj
            .meta()
            .transfer_syntax
            .trim_end_matches(['\0', ' '])
            .to_string();
        let builder = RawDataSetBuilder::new().element(
            tags::TRANSFER_SYNTAX_UID,
            Some(VR::UI),
            transfer_syntax.as_bytes(),
        );
        push_object(builder, obj).build()
    }
}

fn push_object(mut builder: RawDataSetBuilder, obj: &InMemDicomObject) -> RawDataSetBuilder {
    for element in obj {
        let tag = element.tag();
        let vr = element.vr();
        builder = match element.value() {
            Value::Primitive(value) => builder.element(tag, Some(vr), &primitive_bytes(vr, value)),
            Value::Sequence(sequence) => {
                let items = sequence
                    .items()
                    .iter()
                    .map(|item| push_object(RawDataSetBuilder::new(), item))
                    .collect();
                builder.sequence(tag, items)
            }
            Value::PixelSequence(sequence) => builder.encapsulated(
                tag,
                Some(vr),
                sequence.offset_table().to_vec(),
                sequence.fragments(),
            ),
        };
    }
    builder
}

fn le_bytes<T, const N: usize>(values: &[T], to_le: impl Fn(&T) -> [u8; N]) -> Vec<u8> {
    values.iter().flat_map(to_le).collect()
}

// Binary VRs are re-encoded little endian; everything else is text.
fn primitive_bytes(vr: VR, value: &PrimitiveValue) -> Vec<u8> {
    match (vr, value) {
        (_, PrimitiveValue::Empty) => Vec::new(),
        (VR::IS | VR::DS, _) => value.to_str().into_owned().into_bytes(),
        (_, PrimitiveValue::U8(values)) => values.to_vec(),
        (_, PrimitiveValue::I16(values)) => le_bytes(values, |v| v.to_le_bytes()),
        (_, PrimitiveValue::U16(values)) => le_bytes(values, |v| v.to_le_bytes()),
        (_, PrimitiveValue::I32(values)) => le_bytes(values, |v| v.to_le_bytes()),
        (_, PrimitiveValue::U32(values)) => le_bytes(values, |v| v.to_le_bytes()),
        (_, PrimitiveValue::I64(values)) => le_bytes(values, |v| v.to_le_bytes()),
        (_, PrimitiveValue::U64(values)) => le_bytes(values, |v| v.to_le_bytes()),
        (_, PrimitiveValue::F32(values)) => le_bytes(values, |v| v.to_le_bytes()),
        (_, PrimitiveValue::F64(values)) => le_bytes(values, |v| v.to_le_bytes()),
        (_, PrimitiveValue::Tags(values)) => le_bytes(values, |t| {
            let [g0, g1] = t.group().to_le_bytes();
            let [e0, e1] = t.element().to_le_bytes();
            [g0, g1, e0, e1]
        }),
        _ => value.to_str().into_owned().into_bytes(),
    }
}

/// Incrementally assembles a [`RawDataSet`].
#[derive(Debug, Clone, Default)]
pub struct RawDataSetBuilder {
    buffer: Vec<u8>,
    elements: Vec<RawElement>,
}

impl RawDataSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a primitive element holding `bytes`.
    pub fn element(self, tag: Tag, vr: Option<VR>, bytes: &[u8]) -> Self {
        let length = u32::try_from(bytes.len()).ok();
        self.element_with_length(tag, vr, bytes, length)
    }

    /// Appends a primitive element with an explicit, possibly undefined, length.
    pub fn element_with_length(
        mut self,
        tag: Tag,
        vr: Option<VR>,
        bytes: &[u8],
        length: Option<u32>,
    ) -> Self {
        let data_offset = self.buffer.len();
        self.buffer.extend_from_slice(bytes);
        self.elements.push(RawElement {
            tag,
            vr,
            length,
            data_offset,
            items: None,
            encapsulated: None,
        });
        self
    }

    /// Appends a sequence whose items are the given data sets.
    pub fn sequence(mut self, tag: Tag, items: Vec<RawDataSetBuilder>) -> Self {
        let data_offset = self.buffer.len();
        let mut raw_items = Vec::with_capacity(items.len());
        for item in items {
            let delta = self.buffer.len();
            self.buffer.extend_from_slice(&item.buffer);
            let mut elements = item.elements;
            for element in &mut elements {
                element.shift(delta);
            }
            raw_items.push(elements);
        }
        self.elements.push(RawElement {
            tag,
            vr: Some(VR::SQ),
            length: None,
            data_offset,
            items: Some(raw_items),
            encapsulated: None,
        });
        self
    }

    /// Appends encapsulated pixel data made of the given fragments.
    pub fn encapsulated<F: AsRef<[u8]>>(
        mut self,
        tag: Tag,
        vr: Option<VR>,
        basic_offset_table: Vec<u32>,
        fragments: &[F],
    ) -> Self {
        let data_offset = self.buffer.len();
        let mut offset = 0_u32;
        let mut raw_fragments = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let bytes = fragment.as_ref();
            raw_fragments.push(Fragment {
                offset,
                position: self.buffer.len(),
                length: bytes.len(),
            });
            self.buffer.extend_from_slice(bytes);
            offset = offset.saturating_add(ITEM_HEADER_LENGTH + bytes.len() as u32);
        }
        self.elements.push(RawElement {
            tag,
            vr,
            length: None,
            data_offset,
            items: None,
            encapsulated: Some(Encapsulated {
                basic_offset_table,
                fragments: raw_fragments,
            }),
        });
        self
    }

    pub fn build(self) -> RawDataSet {
        RawDataSet::new(self.buffer, self.elements)
    }
}

/// A borrowed data set: the top level of a [`RawDataSet`] or one sequence item.
#[derive(Debug, Clone, Copy)]
pub struct DataSetView<'a> {
    pub byte_array: &'a [u8],
    pub elements: &'a [RawElement],
}

impl<'a> DataSetView<'a> {
    pub fn element(&self, tag: Tag) -> Option<&'a RawElement> {
        self.elements.iter().find(|element| element.tag == tag)
    }

    /// The item views of a sequence element.
    pub fn items(&self, element: &'a RawElement) -> Vec<DataSetView<'a>> {
        element
            .items
            .iter()
            .flatten()
            .map(|elements| DataSetView {
                byte_array: self.byte_array,
                elements,
            })
            .collect()
    }

    /// The value bytes of a primitive element, clamped to the buffer.
    pub fn bytes(&self, element: &RawElement) -> &'a [u8] {
        let start = element.data_offset.min(self.byte_array.len());
        let length = element.length.unwrap_or(0) as usize;
        let end = start.saturating_add(length).min(self.byte_array.len());
        &self.byte_array[start..end]
    }

    pub fn fragment_bytes(&self, fragment: &Fragment) -> &'a [u8] {
        let start = fragment.position.min(self.byte_array.len());
        let end = start.saturating_add(fragment.length).min(self.byte_array.len());
        &self.byte_array[start..end]
    }

    fn value_bytes(&self, tag: Tag) -> Option<&'a [u8]> {
        self.element(tag).map(|element| self.bytes(element))
    }

    /// The `index`th backslash separated value, without trailing padding.
    pub fn string(&self, tag: Tag, index: usize) -> Option<String> {
        let bytes = self.value_bytes(tag)?;
        let text = String::from_utf8_lossy(bytes);
        text.split('\\')
            .nth(index)
            .map(|value| value.trim_end_matches(['\0', ' ']).to_string())
    }

    fn fixed<const N: usize>(&self, tag: Tag, index: usize) -> Option<[u8; N]> {
        let bytes = self.value_bytes(tag)?;
        let start = index.checked_mul(N)?;
        bytes.get(start..start + N)?.try_into().ok()
    }

    pub fn uint16(&self, tag: Tag, index: usize) -> Option<u16> {
        self.fixed(tag, index).map(u16::from_le_bytes)
    }

    pub fn int16(&self, tag: Tag, index: usize) -> Option<i16> {
        self.fixed(tag, index).map(i16::from_le_bytes)
    }

    pub fn uint32(&self, tag: Tag, index: usize) -> Option<u32> {
        self.fixed(tag, index).map(u32::from_le_bytes)
    }

    pub fn int32(&self, tag: Tag, index: usize) -> Option<i32> {
        self.fixed(tag, index).map(i32::from_le_bytes)
    }

    pub fn float(&self, tag: Tag, index: usize) -> Option<f32> {
        self.fixed(tag, index).map(f32::from_le_bytes)
    }

    pub fn double(&self, tag: Tag, index: usize) -> Option<f64> {
        self.fixed(tag, index).map(f64::from_le_bytes)
    }
}
