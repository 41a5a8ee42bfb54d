//! The forward controller: fan-out orchestration for one inbound instance.
//!
//! Entry points are [`store_one_destination`] and
//! [`store_multiple_destination`]. The controller decides per destination
//! whether the inbound byte stream can be copied verbatim or must be parsed,
//! edited and possibly transcoded, then dispatches to the C-STORE service of
//! a DICOM peer or the STOW-RS client of a web endpoint. Failure handling is
//! per destination: a file-level problem marks that destination failed and
//! moves on, a connection-level abort releases the inbound association and
//! stops the whole invocation.

use dicom::dictionary_std::uids;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use std::fmt::{Display, Formatter};
use std::io::Read;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, instrument, warn};

use crate::association::scu::StoreScu;
use crate::association::{
	Association, AssociationError, CompositeStoreError, DataWriter, InboundAssociation,
};
use crate::editor::{apply_editors, Abort, AttributeEditor, AttributeEditorContext};
use crate::pixel::frames::{image_transcode, FrameError};
use crate::pixel::{substitute_tsuid, substitute_web_tsuid, MaskArea};
use crate::transcode::{
	decode_frames, header_without_pixel_data, is_native_syntax, TranscodeError, TranscodeParams,
	DEFAULT_JPEG_QUALITY,
};
use crate::types::{status, ProgressStatus, UI, US};
use crate::web::{build_file_meta, prepare_payload, StowClient, StowError};

/// All association (re)negotiation in the process funnels through this gate:
/// a reopen reshuffles peer state, so two destinations must not reconfigure
/// concurrently. Steady-state C-STORE traffic runs outside the gate.
static PREPARE_GATE: AsyncMutex<()> = AsyncMutex::const_new(());

/// Identity of the forwarding node an instance arrived at, used for error
/// reporting and logging.
#[derive(Debug, Clone)]
pub struct ForwardNode {
	pub aet: String,
}

impl ForwardNode {
	pub fn new(aet: impl Into<String>) -> Self {
		Self { aet: aet.into() }
	}
}

impl Display for ForwardNode {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.aet)
	}
}

/// The inbound byte stream of one instance. It has exactly one consumer: the
/// first destination that needs bytes takes it; fan-out re-materializes the
/// others from the parsed copy.
pub struct DataStream(Mutex<Option<Box<dyn Read + Send>>>);

impl DataStream {
	pub fn new(reader: impl Read + Send + 'static) -> Self {
		Self(Mutex::new(Some(Box::new(reader))))
	}

	pub fn take(&self) -> Option<Box<dyn Read + Send>> {
		self.0.lock().unwrap().take()
	}
}

impl std::fmt::Debug for DataStream {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "DataStream")
	}
}

/// One inbound instance: identifiers, the read-once data stream and a handle
/// to the inbound association for releasing it on fatal abort.
pub struct Params {
	iuid: UI,
	cuid: UI,
	tsuid: UI,
	pcid: u8,
	data: DataStream,
	inbound: Option<Arc<dyn InboundAssociation>>,
}

impl std::fmt::Debug for Params {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Params")
			.field("iuid", &self.iuid)
			.field("cuid", &self.cuid)
			.field("tsuid", &self.tsuid)
			.field("pcid", &self.pcid)
			.finish_non_exhaustive()
	}
}

impl Params {
	pub fn new(
		iuid: impl Into<UI>,
		cuid: impl Into<UI>,
		tsuid: impl Into<UI>,
		pcid: u8,
		data: DataStream,
		inbound: Option<Arc<dyn InboundAssociation>>,
	) -> Self {
		Self {
			iuid: iuid.into(),
			cuid: cuid.into(),
			tsuid: tsuid.into(),
			pcid,
			data,
			inbound,
		}
	}

	pub fn iuid(&self) -> &str {
		&self.iuid
	}

	pub fn cuid(&self) -> &str {
		&self.cuid
	}

	pub fn tsuid(&self) -> &str {
		&self.tsuid
	}

	pub fn pcid(&self) -> u8 {
		self.pcid
	}
}

/// Receives the terminal state of every (destination, instance) transfer.
pub trait ProgressSink: Send + Sync {
	fn notify(&self, iuid: &str, cuid: &str, status: US, progress: ProgressStatus, remaining: usize);
}

/// Progress sink that only logs, for hosts without a progress UI.
pub struct LogProgress;

impl ProgressSink for LogProgress {
	fn notify(
		&self,
		iuid: &str,
		cuid: &str,
		status: US,
		progress: ProgressStatus,
		_remaining: usize,
	) {
		tracing::debug!(iuid, cuid, status, "transfer {progress}");
	}
}

/// A DICOM peer reached over C-STORE on a long-lived association.
pub struct DicomForwardDestination {
	scu: Arc<StoreScu>,
	editors: Vec<Arc<dyn AttributeEditor>>,
	progress: Arc<dyn ProgressSink>,
	mask: Option<MaskArea>,
	jpeg_quality: u8,
}

impl DicomForwardDestination {
	pub fn new(scu: Arc<StoreScu>, progress: Arc<dyn ProgressSink>) -> Self {
		Self {
			scu,
			editors: Vec::new(),
			progress,
			mask: None,
			jpeg_quality: DEFAULT_JPEG_QUALITY,
		}
	}

	pub fn with_editors(mut self, editors: Vec<Arc<dyn AttributeEditor>>) -> Self {
		self.editors = editors;
		self
	}

	pub fn with_mask(mut self, mask: MaskArea) -> Self {
		self.mask = Some(mask);
		self
	}

	pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
		self.jpeg_quality = quality;
		self
	}

	pub fn scu(&self) -> &Arc<StoreScu> {
		&self.scu
	}
}

/// A web endpoint reached with STOW-RS single-file uploads.
pub struct WebForwardDestination {
	stow: Arc<dyn StowClient>,
	editors: Vec<Arc<dyn AttributeEditor>>,
	progress: Arc<dyn ProgressSink>,
	mask: Option<MaskArea>,
	jpeg_quality: u8,
}

impl WebForwardDestination {
	pub fn new(stow: Arc<dyn StowClient>, progress: Arc<dyn ProgressSink>) -> Self {
		Self {
			stow,
			editors: Vec::new(),
			progress,
			mask: None,
			jpeg_quality: DEFAULT_JPEG_QUALITY,
		}
	}

	pub fn with_editors(mut self, editors: Vec<Arc<dyn AttributeEditor>>) -> Self {
		self.editors = editors;
		self
	}

	pub fn with_mask(mut self, mask: MaskArea) -> Self {
		self.mask = Some(mask);
		self
	}

	pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
		self.jpeg_quality = quality;
		self
	}
}

/// Where an instance is relayed to.
pub enum ForwardDestination {
	Dicom(DicomForwardDestination),
	Web(WebForwardDestination),
}

#[derive(Debug, Error)]
pub enum ForwardError {
	#[error("cannot find a forward destination from {0}")]
	NoDestination(String),
	#[error("association not ready for transfer")]
	AssociationClosed,
	#[error("the remote destination has no matching presentation context")]
	NoPresentationContext,
	#[error("inbound data stream was already consumed")]
	StreamConsumed,
	#[error("unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("{message}")]
	Abort { kind: Abort, message: String },
	#[error("failed to read DICOM object: {0}")]
	Parse(#[from] dicom::object::ReadError),
	#[error("failed to write DICOM object: {0}")]
	Write(#[from] dicom::object::WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Store(#[from] CompositeStoreError),
	#[error(transparent)]
	Frame(#[from] FrameError),
	#[error(transparent)]
	Transcode(#[from] TranscodeError),
	#[error(transparent)]
	Stow(#[from] StowError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl ForwardError {
	/// Connection-level aborts stop the whole invocation; everything else is
	/// confined to one destination.
	pub fn is_connection_abort(&self) -> bool {
		matches!(
			self,
			Self::Abort {
				kind: Abort::ConnectionException,
				..
			}
		)
	}
}

/// Chooses the outbound presentation context for an instance: the inbound
/// pcid if the peer accepted the inbound syntax on it, otherwise the first
/// context advertised for the SOP class that accepted the inbound syntax,
/// otherwise the first accepted as Explicit VR Little Endian.
pub fn select_transfer_syntax(association: &dyn Association, params: &Params) -> Option<u8> {
	if association.accepted_transfer_syntax(params.pcid, &params.tsuid) {
		return Some(params.pcid);
	}

	association
		.request()
		.pcids_for(&params.cuid)
		.find(|&pcid| association.accepted_transfer_syntax(pcid, &params.tsuid))
		.or_else(|| {
			association
				.request()
				.pcids_for(&params.cuid)
				.find(|&pcid| {
					association.accepted_transfer_syntax(pcid, uids::EXPLICIT_VR_LITTLE_ENDIAN)
				})
		})
}

/// Registers presentation contexts for `(cuid, tsuid)` on the destination's
/// association and (re)opens it as needed. Serialized process-wide: only one
/// association may be reconfigured at a time.
pub async fn prepare_transfer(
	destination: &DicomForwardDestination,
	cuid: &str,
	tsuid: &str,
) -> Result<(), AssociationError> {
	let _gate = PREPARE_GATE.lock().await;

	let out_tsuid = substitute_tsuid(tsuid);
	let scu = &destination.scu;

	if !scu.is_open() {
		scu.propose_context(cuid, out_tsuid);
		if out_tsuid != uids::EXPLICIT_VR_LITTLE_ENDIAN {
			scu.propose_context(cuid, uids::EXPLICIT_VR_LITTLE_ENDIAN);
		}
		scu.open().await?;
	} else {
		// Handle a dynamically new SOP class or transfer syntax: the peer
		// only learns about it through a renegotiation.
		let missing = !scu.request_contains(cuid, out_tsuid);
		scu.propose_context(cuid, out_tsuid);
		if out_tsuid != uids::EXPLICIT_VR_LITTLE_ENDIAN {
			scu.propose_context(cuid, uids::EXPLICIT_VR_LITTLE_ENDIAN);
		}
		if missing {
			scu.close(true).await;
			scu.open().await?;
		}
	}
	Ok(())
}

/// Forwards one instance to a single destination.
pub async fn store_one_destination(
	source: &ForwardNode,
	destination: &ForwardDestination,
	params: &Params,
) -> Result<(), ForwardError> {
	match destination {
		ForwardDestination::Dicom(dest) => {
			prepare_transfer(dest, &params.cuid, &params.tsuid).await?;
			transfer_dicom(source, dest, None, params).await
		}
		ForwardDestination::Web(dest) => transfer_web(source, dest, None, params).await,
	}
}

/// Forwards one instance to every destination in list order. The dataset is
/// parsed at most once; destinations after the first receive deep copies.
#[instrument(skip_all, fields(source = %source, iuid = %params.iuid, cuid = %params.cuid))]
pub async fn store_multiple_destination(
	source: &ForwardNode,
	destinations: &[ForwardDestination],
	params: &Params,
) -> Result<(), ForwardError> {
	if destinations.is_empty() {
		return Err(ForwardError::NoDestination(source.to_string()));
	}

	// Exclude DICOMDIR
	if params.cuid == uids::MEDIA_STORAGE_DIRECTORY_STORAGE {
		warn!(iuid = %params.iuid, "Cannot send DICOMDIR");
		return Ok(());
	}

	if destinations.len() == 1 {
		return store_one_destination(source, &destinations[0], params).await;
	}

	let mut connected = Vec::with_capacity(destinations.len());
	for destination in destinations {
		if let ForwardDestination::Dicom(dest) = destination {
			if let Err(e) = prepare_transfer(dest, &params.cuid, &params.tsuid).await {
				error!("Cannot connect to the final destination: {e}");
				continue;
			}
		}
		connected.push(destination);
	}

	match connected.len() {
		0 => Ok(()),
		1 => store_one_destination(source, connected[0], params).await,
		_ => {
			let mut copy = InMemDicomObject::new_empty();
			let first = connected[0];
			match first {
				ForwardDestination::Dicom(dest) => {
					transfer_dicom(source, dest, Some(&mut copy), params).await?;
				}
				ForwardDestination::Web(dest) => {
					transfer_web(source, dest, Some(&mut copy), params).await?;
				}
			}

			if is_empty_dataset(&copy) {
				return Ok(());
			}

			for destination in &connected[1..] {
				match destination {
					ForwardDestination::Dicom(dest) => {
						transfer_dicom_other(source, dest, &copy, params).await?;
					}
					ForwardDestination::Web(dest) => {
						transfer_web_other(source, dest, &copy, params).await?;
					}
				}
			}
			Ok(())
		}
	}
}

/// Deep-copies every element of a dataset into another.
pub fn copy_dataset(from: &InMemDicomObject, into: &mut InMemDicomObject) {
	for element in from {
		into.put(element.clone());
	}
}

fn is_empty_dataset(dataset: &InMemDicomObject) -> bool {
	dataset.into_iter().next().is_none()
}

/// First-destination transfer to a DICOM peer. When `copy` is given, the
/// parsed dataset is duplicated into it before this destination's editors run.
#[instrument(skip_all, fields(source = %source, iuid = %params.iuid))]
pub async fn transfer_dicom(
	source: &ForwardNode,
	destination: &DicomForwardDestination,
	copy: Option<&mut InMemDicomObject>,
	params: &Params,
) -> Result<(), ForwardError> {
	let mut iuid = params.iuid.clone();
	let result = transfer_dicom_inner(destination, copy, params, &mut iuid, true).await;
	let outcome = conclude(destination.progress.as_ref(), &iuid, &params.cuid, result);
	destination.scu.arm_idle_close();
	outcome
}

/// Subsequent-destination transfer to a DICOM peer, re-materialized from the
/// parsed copy; the inbound stream is never touched here.
#[instrument(skip_all, fields(source = %source, iuid = %params.iuid))]
pub async fn transfer_dicom_other(
	source: &ForwardNode,
	destination: &DicomForwardDestination,
	copy: &InMemDicomObject,
	params: &Params,
) -> Result<(), ForwardError> {
	let mut iuid = params.iuid.clone();
	let result = transfer_dicom_other_inner(destination, copy, params, &mut iuid).await;
	let outcome = conclude(destination.progress.as_ref(), &iuid, &params.cuid, result);
	destination.scu.arm_idle_close();
	outcome
}

async fn transfer_dicom_inner(
	destination: &DicomForwardDestination,
	copy: Option<&mut InMemDicomObject>,
	params: &Params,
	iuid: &mut UI,
	release_inbound: bool,
) -> Result<(), ForwardError> {
	if !destination.scu.is_open() {
		return Err(ForwardError::AssociationClosed);
	}
	let association = destination
		.scu
		.association()
		.ok_or(ForwardError::AssociationClosed)?;

	let pcid = select_transfer_syntax(association.as_ref(), params)
		.ok_or(ForwardError::NoPresentationContext)?;
	let supported_tsuid = association
		.transfer_syntax(pcid)
		.ok_or(ForwardError::NoPresentationContext)?
		.to_owned();

	let editors = &destination.editors;
	let pass_through = copy.is_none()
		&& editors.is_empty()
		&& destination.mask.is_none()
		&& supported_tsuid == params.tsuid;

	let writer: DataWriter = if pass_through {
		let mut reader = params.data.take().ok_or(ForwardError::StreamConsumed)?;
		Box::new(move |out, _tsuid| {
			std::io::copy(&mut reader, out)?;
			Ok(())
		})
	} else {
		let mut context = AttributeEditorContext::new(destination.mask.clone());
		let reader = params.data.take().ok_or(ForwardError::StreamConsumed)?;
		let transfer_syntax = TransferSyntaxRegistry
			.get(&params.tsuid)
			.ok_or_else(|| ForwardError::UnknownTransferSyntax(params.tsuid.clone()))?;
		let mut data = InMemDicomObject::read_dataset_with_ts(reader, transfer_syntax)?;

		if let Some(copy) = copy {
			copy_dataset(&data, copy);
		}

		if !editors.is_empty() {
			if let Some(new_iuid) = apply_editors(editors, &mut data, &mut context) {
				*iuid = new_iuid;
			}
		}
		check_abort(&context, params, release_inbound)?;

		build_data_writer(
			data,
			&params.tsuid,
			&supported_tsuid,
			&context,
			destination.jpeg_quality,
		)?
	};

	association
		.cstore(&params.cuid, iuid, writer, &supported_tsuid)
		.await?;
	Ok(())
}

async fn transfer_dicom_other_inner(
	destination: &DicomForwardDestination,
	copy: &InMemDicomObject,
	params: &Params,
	iuid: &mut UI,
) -> Result<(), ForwardError> {
	if !destination.scu.is_open() {
		return Err(ForwardError::AssociationClosed);
	}
	let association = destination
		.scu
		.association()
		.ok_or(ForwardError::AssociationClosed)?;

	let pcid = select_transfer_syntax(association.as_ref(), params)
		.ok_or(ForwardError::NoPresentationContext)?;
	let supported_tsuid = association
		.transfer_syntax(pcid)
		.ok_or(ForwardError::NoPresentationContext)?
		.to_owned();

	let mut context = AttributeEditorContext::new(destination.mask.clone());
	let mut data = InMemDicomObject::new_empty();
	copy_dataset(copy, &mut data);

	if !destination.editors.is_empty() {
		if let Some(new_iuid) = apply_editors(&destination.editors, &mut data, &mut context) {
			*iuid = new_iuid;
		}
	}
	check_abort(&context, params, false)?;

	let writer = build_data_writer(
		data,
		&params.tsuid,
		&supported_tsuid,
		&context,
		destination.jpeg_quality,
	)?;

	association
		.cstore(&params.cuid, iuid, writer, &supported_tsuid)
		.await?;
	Ok(())
}

/// First-destination transfer to a web endpoint.
#[instrument(skip_all, fields(source = %source, iuid = %params.iuid))]
pub async fn transfer_web(
	source: &ForwardNode,
	destination: &WebForwardDestination,
	copy: Option<&mut InMemDicomObject>,
	params: &Params,
) -> Result<(), ForwardError> {
	let mut iuid = params.iuid.clone();
	let result = transfer_web_inner(destination, copy, params, &mut iuid, true).await;
	conclude(destination.progress.as_ref(), &iuid, &params.cuid, result)
}

/// Subsequent-destination transfer to a web endpoint, from the parsed copy.
#[instrument(skip_all, fields(source = %source, iuid = %params.iuid))]
pub async fn transfer_web_other(
	source: &ForwardNode,
	destination: &WebForwardDestination,
	copy: &InMemDicomObject,
	params: &Params,
) -> Result<(), ForwardError> {
	let mut iuid = params.iuid.clone();
	let mut duplicate = InMemDicomObject::new_empty();
	copy_dataset(copy, &mut duplicate);
	let result = transfer_web_dataset(destination, duplicate, params, &mut iuid, false).await;
	conclude(destination.progress.as_ref(), &iuid, &params.cuid, result)
}

async fn transfer_web_inner(
	destination: &WebForwardDestination,
	copy: Option<&mut InMemDicomObject>,
	params: &Params,
	iuid: &mut UI,
	release_inbound: bool,
) -> Result<(), ForwardError> {
	let output_tsuid = substitute_web_tsuid(&params.tsuid);
	let needs_substitution = output_tsuid != params.tsuid;

	let pass_through = !needs_substitution
		&& copy.is_none()
		&& destination.editors.is_empty()
		&& destination.mask.is_none();

	if pass_through {
		let meta = build_file_meta(&params.cuid, &params.iuid, &output_tsuid)?;
		let stream = params.data.take().ok_or(ForwardError::StreamConsumed)?;
		destination.stow.upload_stream(meta, stream).await?;
		return Ok(());
	}

	let reader = params.data.take().ok_or(ForwardError::StreamConsumed)?;
	let transfer_syntax = TransferSyntaxRegistry
		.get(&params.tsuid)
		.ok_or_else(|| ForwardError::UnknownTransferSyntax(params.tsuid.clone()))?;
	let mut data = InMemDicomObject::read_dataset_with_ts(reader, transfer_syntax)?;
	if let Some(copy) = copy {
		copy_dataset(&data, copy);
	}

	transfer_web_dataset(destination, data, params, iuid, release_inbound).await
}

/// Edits and uploads an already-materialized dataset.
async fn transfer_web_dataset(
	destination: &WebForwardDestination,
	mut data: InMemDicomObject,
	params: &Params,
	iuid: &mut UI,
	release_inbound: bool,
) -> Result<(), ForwardError> {
	let mut context = AttributeEditorContext::new(destination.mask.clone());

	if !destination.editors.is_empty() {
		if let Some(new_iuid) = apply_editors(&destination.editors, &mut data, &mut context) {
			*iuid = new_iuid;
		}
	}
	check_abort(&context, params, release_inbound)?;

	let mut output_tsuid = substitute_web_tsuid(&params.tsuid);
	if output_tsuid == uids::RLE_LOSSLESS {
		// No RLE writer is available for STOW uploads.
		output_tsuid = UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN);
	}

	let transcoded = image_transcode(&data, &params.tsuid, &output_tsuid, context.mask_area())?;
	match transcoded {
		None => {
			destination.stow.upload_dataset(&data, &output_tsuid).await?;
		}
		Some(source) => {
			let transcode_params = TranscodeParams::new(&output_tsuid)
				.with_jpeg_quality(destination.jpeg_quality);
			let output = decode_frames(&source, context.mask_area(), &transcode_params)?;
			let payload = prepare_payload(&data, &output_tsuid, output)?;
			destination.stow.upload_payload(&payload).await?;
		}
	}
	Ok(())
}

/// Builds the writer that serializes the dataset for the chosen outbound
/// syntax, transcoding the pixel data when required.
fn build_data_writer(
	data: InMemDicomObject,
	original_tsuid: &str,
	supported_tsuid: &str,
	context: &AttributeEditorContext,
	jpeg_quality: u8,
) -> Result<DataWriter, ForwardError> {
	// The frame source borrows `data`; decode eagerly so the writer below
	// only captures owned values.
	let transcoded = {
		match image_transcode(&data, original_tsuid, supported_tsuid, context.mask_area())? {
			Some(source) => {
				let params =
					TranscodeParams::new(supported_tsuid).with_jpeg_quality(jpeg_quality);
				let output = decode_frames(&source, context.mask_area(), &params)?;
				Some((output, header_without_pixel_data(&data)))
			}
			None => None,
		}
	};

	if let Some((output, header)) = transcoded {
		let native = is_native_syntax(supported_tsuid);
		Ok(Box::new(move |out, _tsuid| {
			if native {
				output.write_raw(&header, out)?;
			} else {
				output.write_compressed(&header, out)?;
			}
			Ok(())
		}))
	} else {
		Ok(Box::new(move |out, tsuid| {
			let transfer_syntax = TransferSyntaxRegistry
				.get(tsuid)
				.ok_or_else(|| ForwardError::UnknownTransferSyntax(UI::from(tsuid)))?;
			data.write_dataset_with_ts(out, transfer_syntax)?;
			Ok(())
		}))
	}
}

/// Maps the editor abort signal onto the error taxonomy, releasing the
/// inbound association when a connection abort happens on the path that owns
/// the inbound stream.
fn check_abort(
	context: &AttributeEditorContext,
	params: &Params,
	release_inbound: bool,
) -> Result<(), ForwardError> {
	match context.abort() {
		Abort::None => Ok(()),
		Abort::FileException => Err(ForwardError::Abort {
			kind: Abort::FileException,
			message: context.abort_message().to_owned(),
		}),
		Abort::ConnectionException => {
			if release_inbound {
				if let Some(inbound) = &params.inbound {
					inbound.release();
				}
			}
			Err(ForwardError::Abort {
				kind: Abort::ConnectionException,
				message: format!("DICOM association abort: {}", context.abort_message()),
			})
		}
	}
}

/// Notifies progress exactly once and decides whether the invocation
/// continues: connection aborts re-raise, anything else is confined to this
/// destination.
fn conclude(
	progress: &dyn ProgressSink,
	iuid: &str,
	cuid: &str,
	result: Result<(), ForwardError>,
) -> Result<(), ForwardError> {
	match result {
		Ok(()) => {
			progress.notify(iuid, cuid, status::SUCCESS, ProgressStatus::Completed, 0);
			Ok(())
		}
		Err(e) if e.is_connection_abort() => {
			progress.notify(
				iuid,
				cuid,
				status::PROCESSING_FAILURE,
				ProgressStatus::Failed,
				0,
			);
			error!("{e}");
			Err(e)
		}
		Err(e) => {
			progress.notify(
				iuid,
				cuid,
				status::PROCESSING_FAILURE,
				ProgressStatus::Failed,
				0,
			);
			error!("Error when forwarding to the final destination: {e}");
			Ok(())
		}
	}
}
