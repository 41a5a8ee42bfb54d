//! Pixel-data model: image descriptors, decoded planar frames, mask burn-in
//! and transfer-syntax classification.

pub mod frames;
pub mod rle;

use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use dicom::object::Tag;
use thiserror::Error;

use crate::types::UI;

/// Broad class of a transfer syntax, as far as pixel-data handling cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSyntaxKind {
	/// Uncompressed pixel data, no encapsulation (implicit/explicit VR).
	Native,
	RleLossless,
	JpegBaseline,
	/// Other encapsulated JPEG-family syntaxes (extended, lossless, LS, 2000).
	JpegFamily,
	/// MPEG2/MPEG4/HEVC lossy video.
	Video,
	Unknown,
}

impl TransferSyntaxKind {
	pub fn of(tsuid: &str) -> Self {
		match tsuid {
			uids::IMPLICIT_VR_LITTLE_ENDIAN
			| uids::EXPLICIT_VR_LITTLE_ENDIAN
			| uids::EXPLICIT_VR_BIG_ENDIAN => Self::Native,
			uids::RLE_LOSSLESS => Self::RleLossless,
			uids::JPEG_BASELINE8_BIT => Self::JpegBaseline,
			_ if tsuid.starts_with("1.2.840.10008.1.2.4.10") => Self::Video,
			_ if tsuid.starts_with("1.2.840.10008.1.2.4.") => Self::JpegFamily,
			_ => Self::Unknown,
		}
	}

	pub const fn is_native(self) -> bool {
		matches!(self, Self::Native)
	}

	/// Whether pixel data is carried in encapsulated fragments.
	pub const fn is_encapsulated(self) -> bool {
		matches!(
			self,
			Self::RleLossless | Self::JpegBaseline | Self::JpegFamily | Self::Video
		)
	}

	pub const fn is_lossy_video(self) -> bool {
		matches!(self, Self::Video)
	}
}

#[derive(Debug, Error)]
pub enum DescriptorError {
	#[error("mandatory image attribute {0} is missing or malformed")]
	MissingAttribute(Tag),
}

/// Image geometry and sample layout derived from the dataset header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
	pub rows: u32,
	pub columns: u32,
	pub samples_per_pixel: u16,
	pub bits_allocated: u16,
	pub bits_stored: u16,
	pub photometric_interpretation: String,
	pub number_of_frames: usize,
	pub planar_configuration: u16,
	pub pixel_representation: u16,
}

impl ImageDescriptor {
	pub fn from_dataset(dataset: &InMemDicomObject) -> Result<Self, DescriptorError> {
		let rows = read_u32(dataset, tags::ROWS)
			.ok_or(DescriptorError::MissingAttribute(tags::ROWS))?;
		let columns = read_u32(dataset, tags::COLUMNS)
			.ok_or(DescriptorError::MissingAttribute(tags::COLUMNS))?;
		let bits_allocated = read_u16(dataset, tags::BITS_ALLOCATED)
			.ok_or(DescriptorError::MissingAttribute(tags::BITS_ALLOCATED))?;
		let bits_stored = read_u16(dataset, tags::BITS_STORED).unwrap_or(bits_allocated);
		let samples_per_pixel = read_u16(dataset, tags::SAMPLES_PER_PIXEL).unwrap_or(1);
		let number_of_frames = read_u32(dataset, tags::NUMBER_OF_FRAMES).unwrap_or(1).max(1);
		let planar_configuration = read_u16(dataset, tags::PLANAR_CONFIGURATION).unwrap_or(0);
		let pixel_representation = read_u16(dataset, tags::PIXEL_REPRESENTATION).unwrap_or(0);
		let photometric_interpretation = dataset
			.get(tags::PHOTOMETRIC_INTERPRETATION)
			.and_then(|element| element.to_str().ok())
			.map(|value| value.trim().to_owned())
			.unwrap_or_else(|| String::from("MONOCHROME2"));

		Ok(Self {
			rows,
			columns,
			samples_per_pixel,
			bits_allocated,
			bits_stored,
			photometric_interpretation,
			number_of_frames: number_of_frames as usize,
			planar_configuration,
			pixel_representation,
		})
	}

	/// Length in bytes of one uncompressed frame. Chroma-subsampled YBR 422
	/// carries two samples worth of bytes per pixel pair less than RGB.
	pub fn frame_length(&self) -> usize {
		let pixels = self.rows as usize * self.columns as usize;
		if self.photometric_interpretation == "YBR_FULL_422" && self.bits_allocated == 8 {
			return pixels * 2;
		}
		(pixels * self.samples_per_pixel as usize * self.bits_allocated as usize + 7) / 8
	}
}

fn read_u16(dataset: &InMemDicomObject, tag: Tag) -> Option<u16> {
	dataset.get(tag).and_then(|element| element.to_int::<u16>().ok())
}

fn read_u32(dataset: &InMemDicomObject, tag: Tag) -> Option<u32> {
	dataset.get(tag).and_then(|element| element.to_int::<u32>().ok())
}

/// One decoded frame, samples interleaved, values little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanarImage {
	pub rows: u32,
	pub columns: u32,
	pub samples_per_pixel: u16,
	pub bits_allocated: u16,
	pub pixel_representation: u16,
	pub data: Vec<u8>,
}

impl PlanarImage {
	fn bytes_per_sample(&self) -> usize {
		usize::from(self.bits_allocated / 8).max(1)
	}
}

/// Axis-aligned region of a [`MaskArea`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskRect {
	pub x: u32,
	pub y: u32,
	pub width: u32,
	pub height: u32,
}

/// Regions burned into decoded pixel data for de-identification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskArea {
	regions: Vec<MaskRect>,
	fill: u16,
}

impl MaskArea {
	pub fn new(regions: Vec<MaskRect>, fill: u16) -> Self {
		Self { regions, fill }
	}

	/// A mask covering the whole image, regardless of its dimensions.
	pub fn full_image() -> Self {
		Self::new(
			vec![MaskRect {
				x: 0,
				y: 0,
				width: u32::MAX,
				height: u32::MAX,
			}],
			0,
		)
	}

	/// Overwrites every masked region of the decoded frame with the fill
	/// value, across all samples.
	pub fn apply(&self, image: &mut PlanarImage) {
		let bytes_per_sample = image.bytes_per_sample();
		let samples = usize::from(image.samples_per_pixel);
		let fill = self.fill.to_le_bytes();
		for region in &self.regions {
			let x_end = region.x.saturating_add(region.width).min(image.columns);
			let y_end = region.y.saturating_add(region.height).min(image.rows);
			for y in region.y.min(image.rows)..y_end {
				for x in region.x..x_end {
					let pixel = (y as usize * image.columns as usize + x as usize) * samples;
					for sample in 0..samples {
						let offset = (pixel + sample) * bytes_per_sample;
						for byte in 0..bytes_per_sample {
							image.data[offset + byte] = fill[byte.min(1)];
						}
					}
				}
			}
		}
	}
}

/// Substitution applied before negotiating the outbound syntax: syntaxes the
/// writer side cannot emit natively are promoted to Explicit VR Little Endian.
pub fn substitute_tsuid(tsuid: &str) -> &str {
	if tsuid == uids::RLE_LOSSLESS
		|| tsuid == uids::IMPLICIT_VR_LITTLE_ENDIAN
		|| tsuid == uids::EXPLICIT_VR_BIG_ENDIAN
	{
		uids::EXPLICIT_VR_LITTLE_ENDIAN
	} else {
		tsuid
	}
}

/// Returns a fresh `UI` for the outbound syntax on web uploads, where only
/// implicit VR and big endian are promoted up front.
pub fn substitute_web_tsuid(tsuid: &str) -> UI {
	if tsuid == uids::IMPLICIT_VR_LITTLE_ENDIAN || tsuid == uids::EXPLICIT_VR_BIG_ENDIAN {
		UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN)
	} else {
		UI::from(tsuid)
	}
}
