//! Splitting pixel data into frames.

use super::{BulkDataHandler, Error, Result};
use crate::dataset::{DataSetView, Encapsulated, Fragment, RawElement};
use crate::tags;
use std::borrow::Cow;

const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Container extension for video transfer syntaxes.
pub fn video_extension(transfer_syntax: &str) -> Option<&'static str> {
    match transfer_syntax {
        "1.2.840.10008.1.2.4.100" | "1.2.840.10008.1.2.4.101" => Some("mpg"),
        "1.2.840.10008.1.2.4.102"
        | "1.2.840.10008.1.2.4.103"
        | "1.2.840.10008.1.2.4.104"
        | "1.2.840.10008.1.2.4.105"
        | "1.2.840.10008.1.2.4.106" => Some("mp4"),
        "1.2.840.10008.1.2.4.107" | "1.2.840.10008.1.2.4.108" => Some("h265"),
        _ => None,
    }
}

/// Frame count from Number of Frames, 1 when absent or unusable.
pub fn number_of_frames(view: &DataSetView<'_>) -> usize {
    view.string(tags::NUMBER_OF_FRAMES, 0)
        .and_then(|frames| frames.trim().parse::<usize>().ok())
        .filter(|frames| *frames > 0)
        .unwrap_or(1)
}

fn uncompressed_frame_size(view: &DataSetView<'_>) -> usize {
    let read = |tag| view.uint16(tag, 0).map(usize::from).unwrap_or(0);
    read(tags::ROWS) * read(tags::COLUMNS) * read(tags::SAMPLES_PER_PIXEL) * read(tags::BITS_ALLOCATED) / 8
}

// A fragment closes a frame when it ends in a JPEG end of image marker, allowing for
// one byte of padding.
fn ends_frame(bytes: &[u8]) -> bool {
    let unpadded = match bytes {
        [rest @ .., 0] => rest,
        all => all,
    };
    unpadded.ends_with(&JPEG_EOI) || bytes.ends_with(&JPEG_EOI)
}

pub(super) fn concat<'a>(view: &DataSetView<'a>, fragments: &[&Fragment]) -> Cow<'a, [u8]> {
    match fragments {
        [single] => Cow::Borrowed(view.fragment_bytes(single)),
        many => Cow::Owned(
            many.iter()
                .flat_map(|fragment| view.fragment_bytes(fragment).iter().copied())
                .collect(),
        ),
    }
}

/// Groups the fragments of an encapsulated pixel data element into frames.
fn encapsulated_frames<'e>(
    encapsulated: &'e Encapsulated,
    number_of_frames: usize,
    view: &DataSetView<'_>,
) -> Vec<Vec<&'e Fragment>> {
    let fragments = &encapsulated.fragments;
    let table = &encapsulated.basic_offset_table;

    if !table.is_empty() {
        return (0..table.len())
            .map(|index| {
                let start = table[index];
                let end = table.get(index + 1).copied().unwrap_or(u32::MAX);
                fragments
                    .iter()
                    .filter(|fragment| fragment.offset >= start && fragment.offset < end)
                    .collect()
            })
            .collect();
    }

    if number_of_frames == 1 {
        return vec![fragments.iter().collect()];
    }

    if number_of_frames != fragments.len() {
        let mut frames = Vec::new();
        let mut current = Vec::new();
        for fragment in fragments {
            current.push(fragment);
            if ends_frame(view.fragment_bytes(fragment)) {
                frames.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            frames.push(current);
        }
        return frames;
    }

    fragments.iter().map(|fragment| vec![fragment]).collect()
}

/// Hands every frame of the pixel data to the handler, returning the last URI.
pub(super) fn extract_frames<H: BulkDataHandler + ?Sized>(
    view: &DataSetView<'_>,
    element: &RawElement,
    transfer_syntax: &str,
    handler: &mut H,
) -> Result<Option<String>> {
    let number_of_frames = number_of_frames(view);

    if let Some(extension) = video_extension(transfer_syntax) {
        let stream: Cow<[u8]> = match &element.encapsulated {
            Some(encapsulated) => concat(view, &encapsulated.fragments.iter().collect::<Vec<_>>()),
            None => Cow::Borrowed(view.bytes(element)),
        };
        return Ok(Some(handler.video(&stream, extension)?));
    }

    let mut uri = None;
    match &element.encapsulated {
        Some(encapsulated) => {
            let frames = encapsulated_frames(encapsulated, number_of_frames, view);
            for index in 0..number_of_frames {
                let fragments = frames
                    .get(index)
                    .filter(|fragments| !fragments.is_empty())
                    .ok_or(Error::MissingFrame {
                        index,
                        count: number_of_frames,
                    })?;
                let frame = concat(view, fragments);
                uri = Some(handler.image_frame(&frame, index)?);
            }
        }
        None => {
            let pixels = view.bytes(element);
            let frame_size = uncompressed_frame_size(view);
            if frame_size == 0 {
                // without geometry the whole value is one frame
                return Ok(Some(handler.image_frame(pixels, 0)?));
            }
            for index in 0..number_of_frames {
                let start = index * frame_size;
                let frame = pixels.get(start..start + frame_size).ok_or(Error::MissingFrame {
                    index,
                    count: number_of_frames,
                })?;
                uri = Some(handler.image_frame(frame, index)?);
            }
        }
    }
    Ok(uri)
}
