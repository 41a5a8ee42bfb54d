//! Frame decoding, mask burn-in and re-encoding to the outbound syntax.
//!
//! Decoding happens eagerly for all frames of the instance; the resulting
//! [`OutputPixelData`] is written either as raw pixel data after the header
//! (native outbound syntax) or as re-encoded encapsulated fragments, with the
//! codec-dependent header tags rewritten to describe the new stream.

use dicom::core::header::Header;
use dicom::core::value::{PixelFragmentSequence, Value};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat};
use std::io::Write;
use thiserror::Error;
use tracing::trace;

use crate::pixel::frames::{FrameError, FrameSource};
use crate::pixel::rle::{self, RleError};
use crate::pixel::{ImageDescriptor, MaskArea, PlanarImage, TransferSyntaxKind};
use crate::types::UI;

/// Default quality for lossy JPEG re-encoding.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum TranscodeError {
	#[error("no decoder available for transfer syntax '{0}'")]
	UnsupportedDecoder(UI),
	#[error("no encoder available for transfer syntax '{0}'")]
	UnsupportedEncoder(UI),
	#[error("pixel layout of {samples} samples at {bits} bits cannot be encoded")]
	UnsupportedLayout { samples: u16, bits: u16 },
	#[error("unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error(transparent)]
	Frame(#[from] FrameError),
	#[error(transparent)]
	Rle(#[from] RleError),
	#[error("JPEG codec error: {0}")]
	Jpeg(#[from] image::ImageError),
	#[error("failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
}

/// Parameters of one transcode run.
#[derive(Debug, Clone)]
pub struct TranscodeParams {
	pub output_tsuid: UI,
	pub jpeg_quality: u8,
}

impl TranscodeParams {
	pub fn new(output_tsuid: &str) -> Self {
		Self {
			output_tsuid: UI::from(output_tsuid),
			jpeg_quality: DEFAULT_JPEG_QUALITY,
		}
	}

	pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
		self.jpeg_quality = quality;
		self
	}
}

/// Decoded frames of one instance, bundled with the descriptor they came from
/// and the syntax they will be written under.
pub struct OutputPixelData {
	frames: Vec<PlanarImage>,
	descriptor: ImageDescriptor,
	output_tsuid: UI,
	jpeg_quality: u8,
}

/// Decodes every frame of the source, burning in the mask when one is
/// configured.
pub fn decode_frames(
	source: &dyn FrameSource,
	mask: Option<&MaskArea>,
	params: &TranscodeParams,
) -> Result<OutputPixelData, TranscodeError> {
	let descriptor = source.descriptor().clone();
	let kind = TransferSyntaxKind::of(source.transfer_syntax());

	let mut frames = Vec::with_capacity(descriptor.number_of_frames);
	for index in 0..descriptor.number_of_frames {
		let bytes = source.frame_bytes(index)?;
		let mut frame = decode_frame(kind, source.transfer_syntax(), &bytes, &descriptor)?;
		if let Some(mask) = mask {
			mask.apply(&mut frame);
		}
		frames.push(frame);
	}
	trace!(
		frames = frames.len(),
		output_tsuid = params.output_tsuid,
		"decoded pixel data for transcoding"
	);

	Ok(OutputPixelData {
		frames,
		descriptor,
		output_tsuid: params.output_tsuid.clone(),
		jpeg_quality: params.jpeg_quality,
	})
}

fn decode_frame(
	kind: TransferSyntaxKind,
	tsuid: &str,
	bytes: &[u8],
	descriptor: &ImageDescriptor,
) -> Result<PlanarImage, TranscodeError> {
	match kind {
		TransferSyntaxKind::Native => Ok(PlanarImage {
			rows: descriptor.rows,
			columns: descriptor.columns,
			samples_per_pixel: descriptor.samples_per_pixel,
			bits_allocated: descriptor.bits_allocated,
			pixel_representation: descriptor.pixel_representation,
			data: bytes.to_vec(),
		}),
		TransferSyntaxKind::RleLossless => Ok(rle::decode_frame(descriptor, bytes)?),
		TransferSyntaxKind::JpegBaseline => decode_jpeg_frame(bytes, descriptor),
		TransferSyntaxKind::JpegFamily
		| TransferSyntaxKind::Video
		| TransferSyntaxKind::Unknown => Err(TranscodeError::UnsupportedDecoder(UI::from(tsuid))),
	}
}

fn decode_jpeg_frame(
	bytes: &[u8],
	descriptor: &ImageDescriptor,
) -> Result<PlanarImage, TranscodeError> {
	let decoded = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?;
	let (columns, rows) = (decoded.width(), decoded.height());
	let (samples, data) = if descriptor.samples_per_pixel == 3 {
		(3, decoded.into_rgb8().into_raw())
	} else {
		(1, decoded.into_luma8().into_raw())
	};

	Ok(PlanarImage {
		rows,
		columns,
		samples_per_pixel: samples,
		bits_allocated: 8,
		pixel_representation: 0,
		data,
	})
}

/// Whether the syntax carries pixel data without encapsulation.
pub fn is_native_syntax(tsuid: &str) -> bool {
	TransferSyntaxKind::of(tsuid).is_native()
}

impl OutputPixelData {
	pub fn output_tsuid(&self) -> &str {
		&self.output_tsuid
	}

	pub fn frames(&self) -> &[PlanarImage] {
		&self.frames
	}

	/// Serializes header plus raw pixel data under the (native) output syntax.
	pub fn write_raw<W: Write>(
		&self,
		header: &InMemDicomObject,
		out: &mut W,
	) -> Result<(), TranscodeError> {
		let mut dataset = header.clone();
		self.adapt_tags_native(&mut dataset);

		let length: usize = self.frames.iter().map(|frame| frame.data.len()).sum();
		let mut pixels = Vec::with_capacity(length + 1);
		for frame in &self.frames {
			pixels.extend_from_slice(&frame.data);
		}
		if pixels.len() % 2 != 0 {
			pixels.push(0);
		}
		dataset.put(DataElement::new(
			tags::PIXEL_DATA,
			VR::OB,
			Value::Primitive(PrimitiveValue::U8(pixels.into())),
		));

		let transfer_syntax = TransferSyntaxRegistry
			.get(&self.output_tsuid)
			.ok_or_else(|| TranscodeError::UnknownTransferSyntax(self.output_tsuid.clone()))?;
		dataset.write_dataset_with_ts(out, transfer_syntax)?;
		Ok(())
	}

	/// Re-encodes every frame, rewrites the codec-dependent tags and emits
	/// the encapsulated dataset under the output syntax.
	pub fn write_compressed<W: Write>(
		&self,
		header: &InMemDicomObject,
		out: &mut W,
	) -> Result<(), TranscodeError> {
		if TransferSyntaxKind::of(&self.output_tsuid) != TransferSyntaxKind::JpegBaseline {
			return Err(TranscodeError::UnsupportedEncoder(self.output_tsuid.clone()));
		}

		let mut fragments = Vec::with_capacity(self.frames.len());
		for frame in &self.frames {
			fragments.push(encode_jpeg_frame(frame, self.jpeg_quality)?);
		}

		let mut dataset = header.clone();
		self.adapt_tags_compressed(&mut dataset);
		dataset.put(DataElement::new(
			tags::PIXEL_DATA,
			VR::OB,
			Value::PixelSequence(PixelFragmentSequence::new(vec![], fragments)),
		));

		let transfer_syntax = TransferSyntaxRegistry
			.get(&self.output_tsuid)
			.ok_or_else(|| TranscodeError::UnknownTransferSyntax(self.output_tsuid.clone()))?;
		dataset.write_dataset_with_ts(out, transfer_syntax)?;
		Ok(())
	}

	fn adapt_tags_native(&self, dataset: &mut InMemDicomObject) {
		let Some(first) = self.frames.first() else {
			return;
		};
		let bits = first.bits_allocated;
		let bits_stored = self.descriptor.bits_stored.min(bits);
		let photometric = if first.samples_per_pixel == 3 {
			"RGB"
		} else if self.descriptor.photometric_interpretation == "MONOCHROME1" {
			"MONOCHROME1"
		} else {
			"MONOCHROME2"
		};
		put_pixel_module_tags(
			dataset,
			first,
			bits,
			bits_stored,
			photometric,
			self.frames.len(),
		);
	}

	fn adapt_tags_compressed(&self, dataset: &mut InMemDicomObject) {
		let Some(first) = self.frames.first() else {
			return;
		};
		let photometric = if first.samples_per_pixel == 3 {
			"YBR_FULL_422"
		} else {
			"MONOCHROME2"
		};
		put_pixel_module_tags(dataset, first, 8, 8, photometric, self.frames.len());
		dataset.put(DataElement::new(
			tags::LOSSY_IMAGE_COMPRESSION,
			VR::CS,
			dicom_value!(Str, "01"),
		));
		dataset.put(DataElement::new(
			tags::LOSSY_IMAGE_COMPRESSION_METHOD,
			VR::CS,
			dicom_value!(Str, "ISO_10918_1"),
		));
	}
}

fn put_pixel_module_tags(
	dataset: &mut InMemDicomObject,
	frame: &PlanarImage,
	bits_allocated: u16,
	bits_stored: u16,
	photometric: &str,
	number_of_frames: usize,
) {
	dataset.put(DataElement::new(
		tags::ROWS,
		VR::US,
		dicom_value!(U16, [frame.rows as u16]),
	));
	dataset.put(DataElement::new(
		tags::COLUMNS,
		VR::US,
		dicom_value!(U16, [frame.columns as u16]),
	));
	dataset.put(DataElement::new(
		tags::SAMPLES_PER_PIXEL,
		VR::US,
		dicom_value!(U16, [frame.samples_per_pixel]),
	));
	dataset.put(DataElement::new(
		tags::BITS_ALLOCATED,
		VR::US,
		dicom_value!(U16, [bits_allocated]),
	));
	dataset.put(DataElement::new(
		tags::BITS_STORED,
		VR::US,
		dicom_value!(U16, [bits_stored]),
	));
	dataset.put(DataElement::new(
		tags::HIGH_BIT,
		VR::US,
		dicom_value!(U16, [bits_stored.saturating_sub(1)]),
	));
	dataset.put(DataElement::new(
		tags::PIXEL_REPRESENTATION,
		VR::US,
		dicom_value!(U16, [frame.pixel_representation]),
	));
	dataset.put(DataElement::new(
		tags::PHOTOMETRIC_INTERPRETATION,
		VR::CS,
		dicom_value!(Str, photometric),
	));
	if frame.samples_per_pixel > 1 {
		dataset.put(DataElement::new(
			tags::PLANAR_CONFIGURATION,
			VR::US,
			dicom_value!(U16, [0]),
		));
	}
	dataset.put(DataElement::new(
		tags::NUMBER_OF_FRAMES,
		VR::IS,
		dicom_value!(Str, number_of_frames.to_string()),
	));
}

fn encode_jpeg_frame(frame: &PlanarImage, quality: u8) -> Result<Vec<u8>, TranscodeError> {
	let color_type = match (frame.samples_per_pixel, frame.bits_allocated) {
		(1, 8) => ExtendedColorType::L8,
		(3, 8) => ExtendedColorType::Rgb8,
		(samples, bits) => return Err(TranscodeError::UnsupportedLayout { samples, bits }),
	};

	let mut fragment = Vec::new();
	let mut encoder = JpegEncoder::new_with_quality(&mut fragment, quality);
	encoder.encode(&frame.data, frame.columns, frame.rows, color_type)?;
	if fragment.len() % 2 != 0 {
		fragment.push(0);
	}
	Ok(fragment)
}

/// Copies every element up to, but excluding, the pixel data. Elements are
/// stored in tag order, so everything before (7FE0,0010) survives.
pub fn header_without_pixel_data(dataset: &InMemDicomObject) -> InMemDicomObject {
	let mut header = InMemDicomObject::new_empty();
	for element in dataset {
		if element.tag() == tags::PIXEL_DATA {
			break;
		}
		header.put(element.clone());
	}
	header
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pixel::frames::DatasetFrameSource;
	use crate::pixel::MaskRect;
	use dicom::dictionary_std::uids;
	use dicom::encoding::TransferSyntaxIndex;
	use dicom::transfer_syntax::TransferSyntaxRegistry;

	fn rle_frame_bytes(pixels: &[u8]) -> Vec<u8> {
		// Single literal-run segment.
		let mut body = vec![pixels.len() as u8 - 1];
		body.extend_from_slice(pixels);
		let mut data = vec![0u8; 64];
		data[0..4].copy_from_slice(&1u32.to_le_bytes());
		data[4..8].copy_from_slice(&64u32.to_le_bytes());
		data.extend_from_slice(&body);
		data
	}

	fn rle_dataset(rows: u16, columns: u16, pixels: &[u8]) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			DataElement::new(
				tags::SOP_CLASS_UID,
				VR::UI,
				dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
			),
			DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3")),
			DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [rows])),
			DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [columns])),
			DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [8])),
			DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [8])),
			DataElement::new(
				tags::PHOTOMETRIC_INTERPRETATION,
				VR::CS,
				dicom_value!(Str, "MONOCHROME2"),
			),
			DataElement::new(
				tags::PIXEL_DATA,
				VR::OB,
				Value::PixelSequence(PixelFragmentSequence::new(
					vec![],
					vec![rle_frame_bytes(pixels)],
				)),
			),
		])
	}

	#[test]
	fn rle_to_native_with_full_mask() {
		let dataset = rle_dataset(2, 2, &[10, 20, 30, 40]);
		let source = DatasetFrameSource::new(&dataset, uids::RLE_LOSSLESS).unwrap();
		let output = decode_frames(
			&source,
			Some(&MaskArea::full_image()),
			&TranscodeParams::new(uids::EXPLICIT_VR_LITTLE_ENDIAN),
		)
		.unwrap();

		let header = header_without_pixel_data(&dataset);
		let mut encoded = Vec::new();
		output.write_raw(&header, &mut encoded).unwrap();

		let transfer_syntax = TransferSyntaxRegistry
			.get(uids::EXPLICIT_VR_LITTLE_ENDIAN)
			.unwrap();
		let written =
			InMemDicomObject::read_dataset_with_ts(encoded.as_slice(), transfer_syntax).unwrap();

		assert_eq!(
			written.get(tags::BITS_ALLOCATED).unwrap().to_int::<u16>().unwrap(),
			8
		);
		assert_eq!(
			written.get(tags::BITS_STORED).unwrap().to_int::<u16>().unwrap(),
			8
		);
		assert_eq!(
			written.get(tags::HIGH_BIT).unwrap().to_int::<u16>().unwrap(),
			7
		);
		assert_eq!(
			written
				.get(tags::PIXEL_REPRESENTATION)
				.unwrap()
				.to_int::<u16>()
				.unwrap(),
			0
		);
		assert_eq!(
			written
				.get(tags::PHOTOMETRIC_INTERPRETATION)
				.unwrap()
				.to_str()
				.unwrap()
				.trim(),
			"MONOCHROME2"
		);
		// The full-image mask zeroed every pixel.
		let pixels = written.get(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
		assert_eq!(pixels.as_ref(), &[0u8, 0, 0, 0]);
	}

	#[test]
	fn partial_mask_preserves_unmasked_pixels() {
		let dataset = rle_dataset(1, 4, &[1, 2, 3, 4]);
		let source = DatasetFrameSource::new(&dataset, uids::RLE_LOSSLESS).unwrap();
		let mask = MaskArea::new(
			vec![MaskRect {
				x: 0,
				y: 0,
				width: 2,
				height: 1,
			}],
			0,
		);
		let output = decode_frames(
			&source,
			Some(&mask),
			&TranscodeParams::new(uids::EXPLICIT_VR_LITTLE_ENDIAN),
		)
		.unwrap();
		assert_eq!(output.frames()[0].data, vec![0, 0, 3, 4]);
	}

	#[test]
	fn jpeg_round_trip_survives_masking() {
		// Encode a uniform gray frame, decode it back, mask half of it.
		let frame = PlanarImage {
			rows: 8,
			columns: 8,
			samples_per_pixel: 1,
			bits_allocated: 8,
			pixel_representation: 0,
			data: vec![128; 64],
		};
		let encoded = encode_jpeg_frame(&frame, 100).unwrap();
		let descriptor = ImageDescriptor {
			rows: 8,
			columns: 8,
			samples_per_pixel: 1,
			bits_allocated: 8,
			bits_stored: 8,
			photometric_interpretation: String::from("MONOCHROME2"),
			number_of_frames: 1,
			planar_configuration: 0,
			pixel_representation: 0,
		};
		let decoded = decode_jpeg_frame(&encoded, &descriptor).unwrap();
		assert_eq!(decoded.rows, 8);
		assert_eq!(decoded.columns, 8);
		assert_eq!(decoded.data.len(), 64);
	}

	#[test]
	fn compressed_output_rewrites_lossy_markers() {
		let dataset = rle_dataset(8, 8, &[100; 64]);
		let source = DatasetFrameSource::new(&dataset, uids::RLE_LOSSLESS).unwrap();
		let output = decode_frames(
			&source,
			None,
			&TranscodeParams::new(uids::JPEG_BASELINE8_BIT),
		)
		.unwrap();

		let header = header_without_pixel_data(&dataset);
		let mut encoded = Vec::new();
		output.write_compressed(&header, &mut encoded).unwrap();

		let transfer_syntax = TransferSyntaxRegistry.get(uids::JPEG_BASELINE8_BIT).unwrap();
		let written =
			InMemDicomObject::read_dataset_with_ts(encoded.as_slice(), transfer_syntax).unwrap();
		assert_eq!(
			written
				.get(tags::LOSSY_IMAGE_COMPRESSION)
				.unwrap()
				.to_str()
				.unwrap()
				.trim(),
			"01"
		);
	}

	#[test]
	fn header_stops_before_pixel_data() {
		let dataset = rle_dataset(1, 1, &[1]);
		let header = header_without_pixel_data(&dataset);
		assert!(header.get(tags::PIXEL_DATA).is_none());
		assert!(header.get(tags::SOP_INSTANCE_UID).is_some());
	}
}
