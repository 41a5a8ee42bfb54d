//! Per-frame access to the pixel data of a parsed dataset.
//!
//! The [`FrameSource`] capability hides where frame bytes come from: a
//! contiguous native buffer, a single-frame fragment list, one-fragment-per-
//! frame RLE, or a JPEG fragment stream that has to be matched to frames by
//! scanning for start-of-image markers. Fragment positions and the native
//! buffer are computed once and memoized.

use bytes::Bytes;
use dicom::core::value::Value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::cell::RefCell;
use thiserror::Error;

use crate::pixel::{DescriptorError, ImageDescriptor, MaskArea, TransferSyntaxKind};
use crate::types::UI;

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

#[derive(Debug, Error)]
pub enum FrameError {
	#[error(transparent)]
	Descriptor(#[from] DescriptorError),
	#[error("frame {frame} is out of the pixel data stream limit")]
	FrameOutOfBounds { frame: usize },
	#[error("cannot match all the fragments to all the frames")]
	FragmentMismatch,
}

/// Lazy accessor over the pixel data of one instance.
pub trait FrameSource {
	fn descriptor(&self) -> &ImageDescriptor;

	/// Bytes of frame `frame`, computed on demand.
	fn frame_bytes(&self, frame: usize) -> Result<Bytes, FrameError>;

	/// Transfer syntax the frame bytes are encoded in.
	fn transfer_syntax(&self) -> &str;

	/// A fresh dataset holding only the palette color lookup table
	/// descriptor/data tags and their segmented variants, when present.
	fn palette_color_lut(&self) -> InMemDicomObject;
}

/// Decides whether the instance needs its pixel data reassembled: either a
/// mask must be burned in (and the inbound syntax is not lossy video), or the
/// chosen outbound syntax differs from an encapsulated inbound one.
pub fn image_transcode<'a>(
	dataset: &'a InMemDicomObject,
	original_tsuid: &str,
	supported_tsuid: &str,
	mask: Option<&MaskArea>,
) -> Result<Option<DatasetFrameSource<'a>>, FrameError> {
	let kind = TransferSyntaxKind::of(original_tsuid);
	let has_pixel_data = dataset.get(tags::PIXEL_DATA).is_some();

	let mask_trigger = mask.is_some() && has_pixel_data && !kind.is_lossy_video();
	let syntax_trigger = supported_tsuid != original_tsuid && kind.is_encapsulated();

	if mask_trigger || syntax_trigger {
		Ok(Some(DatasetFrameSource::new(dataset, original_tsuid)?))
	} else {
		Ok(None)
	}
}

/// [`FrameSource`] backed by a parsed dataset.
pub struct DatasetFrameSource<'a> {
	dataset: &'a InMemDicomObject,
	descriptor: ImageDescriptor,
	tsuid: UI,
	native_buffer: RefCell<Option<Bytes>>,
	single_frame: RefCell<Option<Bytes>>,
	frame_starts: RefCell<Option<Vec<usize>>>,
}

impl<'a> DatasetFrameSource<'a> {
	pub fn new(dataset: &'a InMemDicomObject, tsuid: &str) -> Result<Self, FrameError> {
		let descriptor = ImageDescriptor::from_dataset(dataset)?;
		Ok(Self {
			dataset,
			descriptor,
			tsuid: UI::from(tsuid),
			native_buffer: RefCell::new(None),
			single_frame: RefCell::new(None),
			frame_starts: RefCell::new(None),
		})
	}

	fn native_frame(&self, frame: usize) -> Result<Bytes, FrameError> {
		let buffer = {
			let mut cached = self.native_buffer.borrow_mut();
			if cached.is_none() {
				let bytes = self
					.dataset
					.get(tags::PIXEL_DATA)
					.and_then(|element| element.to_bytes().ok())
					.map(|bytes| Bytes::copy_from_slice(&bytes))
					.unwrap_or_default();
				*cached = Some(bytes);
			}
			cached.as_ref().cloned().unwrap_or_default()
		};

		let frame_length = self.descriptor.frame_length();
		let start = frame * frame_length;
		let end = start + frame_length;
		if buffer.len() < end {
			return Err(FrameError::FrameOutOfBounds { frame });
		}
		Ok(buffer.slice(start..end))
	}

	fn encapsulated_frame(&self, fragments: &[Vec<u8>], frame: usize) -> Result<Bytes, FrameError> {
		if self.descriptor.number_of_frames == 1 {
			let mut cached = self.single_frame.borrow_mut();
			if cached.is_none() {
				let length = fragments.iter().map(Vec::len).sum();
				let mut out = Vec::with_capacity(length);
				for fragment in fragments {
					out.extend_from_slice(fragment);
				}
				*cached = Some(Bytes::from(out));
			}
			return Ok(cached.as_ref().cloned().unwrap_or_default());
		}

		let starts = self.fragment_starts(fragments);
		if starts.len() != self.descriptor.number_of_frames {
			return Err(FrameError::FragmentMismatch);
		}
		if frame >= starts.len() {
			return Err(FrameError::FrameOutOfBounds { frame });
		}

		let start = starts[frame];
		let end = starts.get(frame + 1).copied().unwrap_or(fragments.len());
		let length = fragments[start..end].iter().map(Vec::len).sum();
		let mut out = Vec::with_capacity(length);
		for fragment in &fragments[start..end] {
			out.extend_from_slice(fragment);
		}
		Ok(Bytes::from(out))
	}

	/// Frame-start fragment indices, scanned once. RLE carries exactly one
	/// fragment per frame; JPEG-family streams are matched by their SOI
	/// markers because a frame may span several fragments.
	fn fragment_starts(&self, fragments: &[Vec<u8>]) -> Vec<usize> {
		let mut cached = self.frame_starts.borrow_mut();
		if cached.is_none() {
			let starts = if TransferSyntaxKind::of(&self.tsuid) == TransferSyntaxKind::RleLossless
			{
				(0..fragments.len()).collect()
			} else {
				fragments
					.iter()
					.enumerate()
					.filter(|(_, fragment)| fragment.starts_with(&JPEG_SOI))
					.map(|(index, _)| index)
					.collect()
			};
			*cached = Some(starts);
		}
		cached.clone().unwrap_or_default()
	}
}

impl FrameSource for DatasetFrameSource<'_> {
	fn descriptor(&self) -> &ImageDescriptor {
		&self.descriptor
	}

	fn frame_bytes(&self, frame: usize) -> Result<Bytes, FrameError> {
		if self.descriptor.bits_stored < 1 {
			return Ok(Bytes::new());
		}
		let Some(element) = self.dataset.get(tags::PIXEL_DATA) else {
			return Ok(Bytes::new());
		};

		match element.value() {
			Value::PixelSequence(sequence) => {
				self.encapsulated_frame(sequence.fragments(), frame)
			}
			_ => self.native_frame(frame),
		}
	}

	fn transfer_syntax(&self) -> &str {
		&self.tsuid
	}

	fn palette_color_lut(&self) -> InMemDicomObject {
		let mut lut = InMemDicomObject::new_empty();
		for tag in [
			tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
			tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
			tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
			tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DATA,
			tags::GREEN_PALETTE_COLOR_LOOKUP_TABLE_DATA,
			tags::BLUE_PALETTE_COLOR_LOOKUP_TABLE_DATA,
			tags::SEGMENTED_RED_PALETTE_COLOR_LOOKUP_TABLE_DATA,
			tags::SEGMENTED_GREEN_PALETTE_COLOR_LOOKUP_TABLE_DATA,
			tags::SEGMENTED_BLUE_PALETTE_COLOR_LOOKUP_TABLE_DATA,
		] {
			if let Some(element) = self.dataset.get(tag) {
				lut.put(element.clone());
			}
		}
		lut
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::value::PixelFragmentSequence;
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use dicom::dicom_value;
	use dicom::dictionary_std::uids;

	fn base_object(rows: u16, columns: u16, frames: u16) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [rows])),
			DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [columns])),
			DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [8])),
			DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [8])),
			DataElement::new(
				tags::NUMBER_OF_FRAMES,
				VR::IS,
				dicom_value!(Str, frames.to_string()),
			),
		])
	}

	fn native_dataset(rows: u16, columns: u16, frames: u16, pixels: Vec<u8>) -> InMemDicomObject {
		let mut dataset = base_object(rows, columns, frames);
		dataset.put(DataElement::new(
			tags::PIXEL_DATA,
			VR::OB,
			Value::Primitive(PrimitiveValue::U8(pixels.into())),
		));
		dataset
	}

	fn encapsulated_dataset(
		rows: u16,
		columns: u16,
		frames: u16,
		fragments: Vec<Vec<u8>>,
	) -> InMemDicomObject {
		let mut dataset = base_object(rows, columns, frames);
		dataset.put(DataElement::new(
			tags::PIXEL_DATA,
			VR::OB,
			Value::PixelSequence(PixelFragmentSequence::new(vec![], fragments)),
		));
		dataset
	}

	#[test]
	fn native_frames_tile_the_payload() {
		let pixels: Vec<u8> = (0..24).collect();
		let dataset = native_dataset(2, 3, 4, pixels.clone());
		let source =
			DatasetFrameSource::new(&dataset, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();

		let mut tiled = Vec::new();
		for frame in 0..4 {
			let bytes = source.frame_bytes(frame).unwrap();
			assert_eq!(bytes.len(), 6);
			tiled.extend_from_slice(&bytes);
		}
		assert_eq!(tiled, pixels);
	}

	#[test]
	fn native_frame_out_of_range_fails() {
		let dataset = native_dataset(2, 3, 1, vec![0; 6]);
		let source =
			DatasetFrameSource::new(&dataset, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
		assert!(matches!(
			source.frame_bytes(1),
			Err(FrameError::FrameOutOfBounds { frame: 1 })
		));
	}

	#[test]
	fn single_frame_concatenates_all_fragments() {
		let dataset = encapsulated_dataset(
			1,
			2,
			1,
			vec![vec![0xFF, 0xD8, 0x01], vec![0x02, 0x03]],
		);
		let source = DatasetFrameSource::new(&dataset, uids::JPEG_BASELINE8_BIT).unwrap();
		let bytes = source.frame_bytes(0).unwrap();
		assert_eq!(&bytes[..], &[0xFF, 0xD8, 0x01, 0x02, 0x03]);
	}

	#[test]
	fn rle_maps_one_fragment_per_frame() {
		let dataset =
			encapsulated_dataset(1, 1, 3, vec![vec![1, 1], vec![2, 2], vec![3, 3]]);
		let source = DatasetFrameSource::new(&dataset, uids::RLE_LOSSLESS).unwrap();
		assert_eq!(&source.frame_bytes(0).unwrap()[..], &[1, 1]);
		assert_eq!(&source.frame_bytes(1).unwrap()[..], &[2, 2]);
		assert_eq!(&source.frame_bytes(2).unwrap()[..], &[3, 3]);
	}

	#[test]
	fn jpeg_frames_are_matched_by_soi_markers() {
		// Frame 0 spans two fragments; frame 1 is a single fragment.
		let dataset = encapsulated_dataset(
			1,
			1,
			2,
			vec![
				vec![0xFF, 0xD8, 0xAA],
				vec![0xBB, 0xCC],
				vec![0xFF, 0xD8, 0xDD],
			],
		);
		let source = DatasetFrameSource::new(&dataset, uids::JPEG_BASELINE8_BIT).unwrap();
		assert_eq!(&source.frame_bytes(0).unwrap()[..], &[0xFF, 0xD8, 0xAA, 0xBB, 0xCC]);
		assert_eq!(&source.frame_bytes(1).unwrap()[..], &[0xFF, 0xD8, 0xDD]);
	}

	#[test]
	fn jpeg_frame_count_mismatch_is_an_error() {
		let dataset = encapsulated_dataset(
			1,
			1,
			3,
			vec![vec![0xFF, 0xD8, 0xAA], vec![0xFF, 0xD8, 0xBB]],
		);
		let source = DatasetFrameSource::new(&dataset, uids::JPEG_BASELINE8_BIT).unwrap();
		assert!(matches!(
			source.frame_bytes(0),
			Err(FrameError::FragmentMismatch)
		));
	}

	#[test]
	fn transcode_triggers_on_mask_or_syntax_change() {
		let native = native_dataset(1, 1, 1, vec![0]);
		let mask = MaskArea::full_image();

		// Mask alone triggers, even for a native syntax.
		assert!(image_transcode(
			&native,
			uids::EXPLICIT_VR_LITTLE_ENDIAN,
			uids::EXPLICIT_VR_LITTLE_ENDIAN,
			Some(&mask),
		)
		.unwrap()
		.is_some());

		// Same syntax, no mask: pass through untouched.
		assert!(image_transcode(
			&native,
			uids::EXPLICIT_VR_LITTLE_ENDIAN,
			uids::EXPLICIT_VR_LITTLE_ENDIAN,
			None,
		)
		.unwrap()
		.is_none());

		// Native mismatch without mask stays untouched as well; plain
		// re-serialization handles byte order and VR form.
		assert!(image_transcode(
			&native,
			uids::IMPLICIT_VR_LITTLE_ENDIAN,
			uids::EXPLICIT_VR_LITTLE_ENDIAN,
			None,
		)
		.unwrap()
		.is_none());

		// Encapsulated mismatch triggers.
		let rle = encapsulated_dataset(1, 1, 1, vec![vec![0]]);
		assert!(image_transcode(
			&rle,
			uids::RLE_LOSSLESS,
			uids::EXPLICIT_VR_LITTLE_ENDIAN,
			None,
		)
		.unwrap()
		.is_some());
	}

	#[test]
	fn palette_lut_extracts_only_lut_tags() {
		let mut dataset = base_object(1, 1, 1);
		dataset.put(DataElement::new(
			tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR,
			VR::US,
			dicom_value!(U16, [256, 0, 8]),
		));
		dataset.put(DataElement::new(
			tags::PATIENT_ID,
			VR::LO,
			dicom_value!(Str, "X"),
		));
		let source =
			DatasetFrameSource::new(&dataset, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();

		let lut = source.palette_color_lut();
		assert!(lut
			.get(tags::RED_PALETTE_COLOR_LOOKUP_TABLE_DESCRIPTOR)
			.is_some());
		assert!(lut.get(tags::PATIENT_ID).is_none());
	}
}
