//! STOW-RS single-file upload client and the lazy payload it consumes.
//!
//! Uploads go out as `multipart/related; type="application/dicom"` bodies
//! with a single part holding the complete DICOM file (preamble, file meta
//! information, data set). Transcoded instances are wrapped in a [`Payload`]
//! that re-encodes the bitstream on every call, so an HTTP retry observes
//! the same bytes.

use async_trait::async_trait;
use dicom::object::meta::FileMetaTable;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use reqwest::header::CONTENT_TYPE;
use std::io::Read;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::transcode::{header_without_pixel_data, is_native_syntax, OutputPixelData, TranscodeError};
use crate::types::UI;

const DICM_MAGIC: &[u8; 4] = b"DICM";

#[derive(Debug, Error)]
pub enum StowError {
	#[error("STOW-RS request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("file meta information error: {0}")]
	Meta(String),
	#[error("failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error(transparent)]
	Transcode(#[from] TranscodeError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// A deferred request body. `bytes` rebuilds the full DICOM file on every
/// call; the total size is unknown up front.
pub trait Payload: Send + Sync {
	fn size(&self) -> i64 {
		-1
	}

	fn bytes(&self) -> Result<Vec<u8>, StowError>;
}

/// STOW-RS store transaction against one endpoint.
/// <https://dicom.nema.org/medical/dicom/current/output/html/part18.html#sect_10.5>
#[async_trait]
pub trait StowClient: Send + Sync {
	/// Uploads a raw data set stream under prebuilt file meta information.
	async fn upload_stream(
		&self,
		meta: FileMetaTable,
		stream: Box<dyn Read + Send>,
	) -> Result<(), StowError>;

	/// Serializes and uploads a parsed data set under the given syntax.
	async fn upload_dataset(&self, dataset: &InMemDicomObject, tsuid: &str)
		-> Result<(), StowError>;

	/// Uploads a deferred payload.
	async fn upload_payload(&self, payload: &dyn Payload) -> Result<(), StowError>;
}

/// Builds file meta information for `(cuid, iuid, tsuid)`.
pub fn build_file_meta(cuid: &str, iuid: &str, tsuid: &str) -> Result<FileMetaTable, StowError> {
	FileMetaTableBuilder::new()
		.media_storage_sop_class_uid(cuid)
		.media_storage_sop_instance_uid(iuid)
		.transfer_syntax(tsuid)
		.build()
		.map_err(|e| StowError::Meta(e.to_string()))
}

/// `reqwest`-backed STOW-RS client.
pub struct DicomStowRs {
	client: reqwest::Client,
	url: String,
	headers: Vec<(String, String)>,
}

impl DicomStowRs {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			client: reqwest::Client::new(),
			url: url.into(),
			headers: Vec::new(),
		}
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));
		self
	}

	#[instrument(skip_all, fields(url = %self.url))]
	async fn post_part(&self, part: Vec<u8>) -> Result<(), StowError> {
		let boundary = format!("dicom-relay-{}", Uuid::new_v4());
		let mut body: Vec<u8> = Vec::with_capacity(part.len() + 256);
		body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
		body.extend_from_slice(b"Content-Type: application/dicom\r\n\r\n");
		body.extend_from_slice(&part);
		body.extend_from_slice(b"\r\n");
		body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

		let mut request = self
			.client
			.post(&self.url)
			.header(
				CONTENT_TYPE,
				format!("multipart/related; type=\"application/dicom\"; boundary={boundary}"),
			)
			.body(body);
		for (name, value) in &self.headers {
			request = request.header(name, value);
		}

		let response = request.send().await?;
		debug!(status = response.status().as_u16(), "STOW-RS response");
		response.error_for_status()?;
		Ok(())
	}
}

#[async_trait]
impl StowClient for DicomStowRs {
	async fn upload_stream(
		&self,
		meta: FileMetaTable,
		mut stream: Box<dyn Read + Send>,
	) -> Result<(), StowError> {
		let mut part = Vec::new();
		write_preamble_and_meta(&meta, &mut part)?;
		stream.read_to_end(&mut part)?;
		self.post_part(part).await
	}

	async fn upload_dataset(
		&self,
		dataset: &InMemDicomObject,
		tsuid: &str,
	) -> Result<(), StowError> {
		let meta = file_meta_from_dataset(dataset, tsuid)?;
		let file = dataset.clone().with_exact_meta(meta);
		let mut part = Vec::new();
		file.write_all(&mut part)?;
		self.post_part(part).await
	}

	async fn upload_payload(&self, payload: &dyn Payload) -> Result<(), StowError> {
		self.post_part(payload.bytes()?).await
	}
}

fn write_preamble_and_meta(meta: &FileMetaTable, out: &mut Vec<u8>) -> Result<(), StowError> {
	out.extend_from_slice(&[0u8; 128]);
	out.extend_from_slice(DICM_MAGIC);
	meta.write(&mut *out)
		.map_err(|e| StowError::Meta(e.to_string()))?;
	Ok(())
}

fn file_meta_from_dataset(
	dataset: &InMemDicomObject,
	tsuid: &str,
) -> Result<FileMetaTable, StowError> {
	let cuid = dataset
		.get(dicom::dictionary_std::tags::SOP_CLASS_UID)
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
		.unwrap_or_default();
	let iuid = dataset
		.get(dicom::dictionary_std::tags::SOP_INSTANCE_UID)
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
		.unwrap_or_default();
	build_file_meta(&cuid, &iuid, tsuid)
}

/// Payload wrapping a transcoded instance. The header elements and decoded
/// frames are captured once; every `bytes` call re-encodes the full file, so
/// repeated invocations are idempotent.
pub struct TranscodedPayload {
	header: InMemDicomObject,
	output: OutputPixelData,
	output_tsuid: UI,
}

impl Payload for TranscodedPayload {
	fn bytes(&self) -> Result<Vec<u8>, StowError> {
		let meta = file_meta_from_dataset(&self.header, &self.output_tsuid)?;
		let mut out = Vec::new();
		write_preamble_and_meta(&meta, &mut out)?;
		if is_native_syntax(&self.output_tsuid) {
			self.output.write_raw(&self.header, &mut out)?;
		} else {
			self.output.write_compressed(&self.header, &mut out)?;
		}
		Ok(out)
	}
}

/// Bundles the non-pixel header of a dataset with its transcoded pixel data
/// into a payload for STOW-RS.
pub fn prepare_payload(
	dataset: &InMemDicomObject,
	output_tsuid: &str,
	output: OutputPixelData,
) -> Result<TranscodedPayload, StowError> {
	Ok(TranscodedPayload {
		header: header_without_pixel_data(dataset),
		output,
		output_tsuid: UI::from(output_tsuid),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pixel::frames::DatasetFrameSource;
	use crate::transcode::{decode_frames, TranscodeParams};
	use dicom::core::value::{PixelFragmentSequence, Value};
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;
	use dicom::dictionary_std::{tags, uids};

	fn rle_dataset() -> InMemDicomObject {
		let mut frame = vec![0u8; 64];
		frame[0..4].copy_from_slice(&1u32.to_le_bytes());
		frame[4..8].copy_from_slice(&64u32.to_le_bytes());
		frame.extend_from_slice(&[3, 1, 2, 3, 4]);

		InMemDicomObject::from_element_iter([
			DataElement::new(
				tags::SOP_CLASS_UID,
				VR::UI,
				dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
			),
			DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3.4")),
			DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [2])),
			DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [2])),
			DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [8])),
			DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [8])),
			DataElement::new(
				tags::PIXEL_DATA,
				VR::OB,
				Value::PixelSequence(PixelFragmentSequence::new(vec![], vec![frame])),
			),
		])
	}

	#[test]
	fn payload_bytes_are_idempotent() {
		let dataset = rle_dataset();
		let source = DatasetFrameSource::new(&dataset, uids::RLE_LOSSLESS).unwrap();
		let output = decode_frames(
			&source,
			None,
			&TranscodeParams::new(uids::EXPLICIT_VR_LITTLE_ENDIAN),
		)
		.unwrap();
		let payload =
			prepare_payload(&dataset, uids::EXPLICIT_VR_LITTLE_ENDIAN, output).unwrap();

		let first = payload.bytes().unwrap();
		let second = payload.bytes().unwrap();
		assert_eq!(first, second);
		assert_eq!(payload.size(), -1);

		// A complete DICOM file: preamble, magic, meta, data set.
		assert_eq!(&first[128..132], b"DICM");
	}

	#[test]
	fn file_meta_carries_identifiers() {
		let meta = build_file_meta("1.2.840.10008.5.1.4.1.1.7", "1.2.3", "1.2.840.10008.1.2.1")
			.unwrap();
		assert_eq!(
			meta.media_storage_sop_instance_uid().trim_end_matches('\0'),
			"1.2.3"
		);
		assert_eq!(meta.transfer_syntax().trim_end_matches('\0'), "1.2.840.10008.1.2.1");
	}
}
