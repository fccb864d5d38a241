//! Inline decoding of primitive element values per VR.

use crate::dataset::{DataSetView, RawElement};
use crate::model::{AttributeValue, PersonName, Scalar};
use base64::Engine;
use dicom_core::VR;

/// Numeric lists longer than this are kept as binary.
const MAX_NUMERIC_VALUES: usize = 65536;

pub(crate) fn inline_binary(bytes: &[u8]) -> AttributeValue {
    AttributeValue::InlineBinary(base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn trim_padding(value: &str) -> &str {
    value.trim_end_matches(['\0', ' '])
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn strings(bytes: &[u8]) -> Vec<String> {
    text(bytes)
        .split('\\')
        .map(|value| trim_padding(value).to_string())
        .collect()
}

fn number_or_text<T>(value: String, parse: impl Fn(&str) -> Option<T>) -> Scalar
where
    T: Into<Scalar>,
{
    match parse(value.trim()) {
        Some(number) => number.into(),
        None => Scalar::Str(value),
    }
}

fn finite(value: f64) -> Scalar {
    if value.is_finite() {
        Scalar::Float(value)
    } else {
        Scalar::Str(value.to_string())
    }
}

fn numbers<const N: usize>(bytes: &[u8], convert: impl Fn([u8; N]) -> Scalar) -> AttributeValue {
    if bytes.len() % N != 0 || bytes.len() / N > MAX_NUMERIC_VALUES {
        return inline_binary(bytes);
    }
    let values = bytes
        .chunks_exact(N)
        .filter_map(|chunk| <[u8; N]>::try_from(chunk).ok())
        .map(convert)
        .collect();
    AttributeValue::Values(values)
}

/// Decodes the value of `element` for placement in the model.
pub(crate) fn decode(view: &DataSetView<'_>, element: &RawElement, vr: VR) -> AttributeValue {
    let bytes = view.bytes(element);
    if bytes.is_empty() {
        return AttributeValue::Empty;
    }

    let values: Vec<Scalar> = match vr {
        VR::AE | VR::AS | VR::CS | VR::DA | VR::DT | VR::LO | VR::SH | VR::TM | VR::UI | VR::UC => {
            strings(bytes).into_iter().map(Scalar::Str).collect()
        }
        VR::LT | VR::ST | VR::UT | VR::UR => {
            vec![Scalar::Str(trim_padding(&text(bytes)).to_string())]
        }
        VR::PN => strings(bytes)
            .iter()
            .map(|name| Scalar::PersonName(PersonName::parse(name)))
            .collect(),
        VR::DS => strings(bytes)
            .into_iter()
            .map(|value| match value.trim().parse::<f64>() {
                Ok(number) if number.is_finite() => Scalar::Float(number),
                _ => Scalar::Str(value),
            })
            .collect(),
        VR::IS => strings(bytes)
            .into_iter()
            .map(|value| number_or_text(value, |v| v.parse::<i64>().ok()))
            .collect(),
        VR::AT => {
            if bytes.len() % 4 != 0 {
                return inline_binary(bytes);
            }
            bytes
                .chunks_exact(4)
                .map(|chunk| {
                    let group = u16::from_le_bytes([chunk[0], chunk[1]]);
                    let element = u16::from_le_bytes([chunk[2], chunk[3]]);
                    Scalar::Str(format!("{group:04X}{element:04X}"))
                })
                .collect()
        }
        VR::US => return numbers(bytes, |b: [u8; 2]| Scalar::Int(u16::from_le_bytes(b).into())),
        VR::SS => return numbers(bytes, |b: [u8; 2]| Scalar::Int(i16::from_le_bytes(b).into())),
        VR::UL => return numbers(bytes, |b: [u8; 4]| Scalar::Int(u32::from_le_bytes(b).into())),
        VR::SL => return numbers(bytes, |b: [u8; 4]| Scalar::Int(i32::from_le_bytes(b).into())),
        VR::SV => return numbers(bytes, |b: [u8; 8]| Scalar::Int(i64::from_le_bytes(b))),
        VR::UV => return numbers(bytes, |b: [u8; 8]| Scalar::UInt(u64::from_le_bytes(b))),
        VR::FL => return numbers(bytes, |b: [u8; 4]| finite(f32::from_le_bytes(b).into())),
        VR::FD => return numbers(bytes, |b: [u8; 8]| finite(f64::from_le_bytes(b))),
        _ => return inline_binary(bytes),
    };
    AttributeValue::Values(values)
}
