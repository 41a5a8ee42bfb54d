//! RLE Lossless frame decoding (DICOM PS3.5 Annex G).
//!
//! A frame is a 64-byte header (segment count plus up to 15 offsets) followed
//! by PackBits-encoded segments. Segments carry one byte plane each, most
//! significant plane first; samples are interleaved back into little-endian
//! order on the way out.

use byteorder::ByteOrder;
use thiserror::Error;

use crate::pixel::{ImageDescriptor, PlanarImage};

#[derive(Debug, Error)]
pub enum RleError {
	#[error("RLE header is incomplete")]
	IncompleteHeader,
	#[error("RLE segment count {0} is invalid")]
	InvalidSegmentCount(usize),
	#[error("RLE segment {0} has invalid bounds")]
	InvalidSegmentBounds(usize),
	#[error("RLE segment {0} is malformed")]
	MalformedSegment(usize),
	#[error("RLE layout of {segments} segments for {samples} samples of {bits} bits is unsupported")]
	UnsupportedLayout {
		segments: usize,
		samples: u16,
		bits: u16,
	},
}

/// Decodes one RLE frame into an interleaved planar image.
pub fn decode_frame(descriptor: &ImageDescriptor, data: &[u8]) -> Result<PlanarImage, RleError> {
	let pixel_count = descriptor.rows as usize * descriptor.columns as usize;
	let segments = decode_segments(data, pixel_count)?;

	let data = match (
		descriptor.samples_per_pixel,
		descriptor.bits_allocated,
		segments.as_slice(),
	) {
		(1, 8, [gray]) => gray.clone(),
		(1, 16, [high, low]) => {
			let mut out = Vec::with_capacity(pixel_count * 2);
			for i in 0..pixel_count {
				out.push(low[i]);
				out.push(high[i]);
			}
			out
		}
		(3, 8, [red, green, blue]) => {
			let mut out = Vec::with_capacity(pixel_count * 3);
			for i in 0..pixel_count {
				out.push(red[i]);
				out.push(green[i]);
				out.push(blue[i]);
			}
			out
		}
		_ => {
			return Err(RleError::UnsupportedLayout {
				segments: segments.len(),
				samples: descriptor.samples_per_pixel,
				bits: descriptor.bits_allocated,
			})
		}
	};

	Ok(PlanarImage {
		rows: descriptor.rows,
		columns: descriptor.columns,
		samples_per_pixel: descriptor.samples_per_pixel,
		bits_allocated: descriptor.bits_allocated,
		pixel_representation: descriptor.pixel_representation,
		data,
	})
}

fn decode_segments(data: &[u8], expected_length: usize) -> Result<Vec<Vec<u8>>, RleError> {
	if data.len() < 64 {
		return Err(RleError::IncompleteHeader);
	}

	let number_of_segments = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
	if number_of_segments == 0 || number_of_segments > 15 {
		return Err(RleError::InvalidSegmentCount(number_of_segments));
	}

	let mut segment_offsets = vec![0u32; number_of_segments];
	byteorder::LittleEndian::read_u32_into(
		&data[4..(4 + number_of_segments * 4)],
		&mut segment_offsets,
	);

	let mut segments = Vec::with_capacity(number_of_segments);
	for i in 0..number_of_segments {
		let start = segment_offsets[i] as usize;
		let end = if i + 1 == number_of_segments {
			data.len()
		} else {
			segment_offsets[i + 1] as usize
		};

		let rle_data = data
			.get(start..end)
			.ok_or(RleError::InvalidSegmentBounds(i))?;
		let segment = decode_segment(rle_data, expected_length)
			.map_err(|()| RleError::MalformedSegment(i))?;
		segments.push(segment);
	}

	Ok(segments)
}

/// PackBits: a literal run for `n <= 127` (n + 1 bytes follow), a replicate
/// run for `n >= 129` (next byte repeated 257 - n times), 128 is a no-op.
fn decode_segment(mut rle_data: &[u8], expected_length: usize) -> Result<Vec<u8>, ()> {
	let mut result = Vec::with_capacity(expected_length);

	loop {
		if result.len() >= expected_length {
			result.truncate(expected_length);
			return Ok(result);
		}

		if rle_data.len() < 2 {
			return Err(());
		}

		let n = rle_data[0];
		if n <= 127 {
			let literal_length = usize::from(n) + 1;
			if rle_data.len() < 1 + literal_length {
				return Err(());
			}
			result.extend_from_slice(&rle_data[1..=literal_length]);
			rle_data = &rle_data[1 + literal_length..];
		} else if n == 128 {
			rle_data = &rle_data[1..];
		} else {
			let run_length = 257 - usize::from(n);
			result.extend(std::iter::repeat(rle_data[1]).take(run_length));
			rle_data = &rle_data[2..];
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn descriptor(rows: u32, columns: u32, samples: u16, bits: u16) -> ImageDescriptor {
		ImageDescriptor {
			rows,
			columns,
			samples_per_pixel: samples,
			bits_allocated: bits,
			bits_stored: bits,
			photometric_interpretation: if samples == 3 {
				String::from("RGB")
			} else {
				String::from("MONOCHROME2")
			},
			number_of_frames: 1,
			planar_configuration: 0,
			pixel_representation: 0,
		}
	}

	fn frame(segments: &[&[u8]]) -> Vec<u8> {
		let mut header = vec![0u8; 64];
		header[0..4].copy_from_slice(&(segments.len() as u32).to_le_bytes());
		let mut body = Vec::new();
		let mut offset = 64u32;
		for (i, segment) in segments.iter().enumerate() {
			header[4 + i * 4..8 + i * 4].copy_from_slice(&offset.to_le_bytes());
			body.extend_from_slice(segment);
			offset += segment.len() as u32;
		}
		header.extend_from_slice(&body);
		header
	}

	#[test]
	fn decodes_replicate_and_literal_runs() {
		// 254 => repeat next byte 3 times, then a 3-byte literal run.
		let encoded = frame(&[&[254, 9, 2, 1, 2, 3]]);
		let image = decode_frame(&descriptor(2, 3, 1, 8), &encoded).unwrap();
		assert_eq!(image.data, vec![9, 9, 9, 1, 2, 3]);
	}

	#[test]
	fn interleaves_sixteen_bit_planes_little_endian() {
		// Segment order is MSB plane then LSB plane.
		let encoded = frame(&[&[1, 0x12, 0x34], &[1, 0xAB, 0xCD]]);
		let image = decode_frame(&descriptor(1, 2, 1, 16), &encoded).unwrap();
		assert_eq!(image.data, vec![0xAB, 0x12, 0xCD, 0x34]);
	}

	#[test]
	fn interleaves_rgb_planes() {
		let encoded = frame(&[&[0, 1], &[0, 2], &[0, 3]]);
		let image = decode_frame(&descriptor(1, 1, 3, 8), &encoded).unwrap();
		assert_eq!(image.data, vec![1, 2, 3]);
	}

	#[test]
	fn rejects_truncated_header() {
		let error = decode_frame(&descriptor(1, 1, 1, 8), &[0u8; 10]).unwrap_err();
		assert!(matches!(error, RleError::IncompleteHeader));
	}

	#[test]
	fn rejects_short_segment() {
		let encoded = frame(&[&[0, 1]]);
		let error = decode_frame(&descriptor(2, 2, 1, 8), &encoded).unwrap_err();
		assert!(matches!(error, RleError::MalformedSegment(0)));
	}
}
