//! Production association backend on top of `dicom::ul`.
//!
//! The `dicom-rs` upper layer uses blocking reads and writes, so every
//! association owns a dedicated OS thread. The async side talks to it through
//! an mpsc command channel with oneshot replies; dropping the channel makes
//! the backend abort the association and exit.

use async_trait::async_trait;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType, PresentationContextResultReason};
use dicom::ul::Pdu;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
	next_message_id, Association, AssociationError, AssociationRequest, ChannelError,
	CompositeStoreCommand, CompositeStoreError, Connector, DataWriter, NegotiatedContext,
};
use crate::types::{Priority, StatusType, AE, US};

/// Opens associations towards one fixed DICOM peer.
pub struct DimseConnector {
	pub calling_aet: AE,
	pub called_aet: AE,
	pub address: SocketAddr,
	pub timeout: Duration,
}

impl DimseConnector {
	pub fn new(calling_aet: AE, called_aet: AE, address: SocketAddr) -> Self {
		Self {
			calling_aet,
			called_aet,
			address,
			timeout: Duration::from_secs(30),
		}
	}
}

#[async_trait]
impl Connector for DimseConnector {
	async fn connect(
		&self,
		request: AssociationRequest,
	) -> Result<Box<dyn Association>, AssociationError> {
		let association = DimseAssociation::establish(
			self.calling_aet.clone(),
			self.called_aet.clone(),
			self.address,
			request,
			self.timeout,
		)
		.await?;
		info!(
			backend_uuid = association.uuid.to_string(),
			called_aet = self.called_aet,
			"opened outbound association"
		);
		Ok(Box::new(association))
	}
}

#[derive(Debug)]
enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
	Release(oneshot::Sender<()>),
}

pub struct DimseAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	request: AssociationRequest,
	negotiated: Vec<NegotiatedContext>,
	timeout: Duration,
}

impl DimseAssociation {
	async fn establish(
		calling_aet: AE,
		called_aet: AE,
		address: SocketAddr,
		request: AssociationRequest,
		timeout: Duration,
	) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let mut options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(calling_aet)
			.called_ae_title(called_aet);
		for context in request.contexts() {
			options = options.with_presentation_context(
				context.abstract_syntax.clone(),
				vec![context.transfer_syntax.clone()],
			);
		}

		let _handle = thread::Builder::new()
			.name(String::from("dimse-association"))
			.spawn(move || {
				let mut association = match options.establish(address) {
					Ok(mut association) => {
						let presentation_contexts = Vec::from(association.presentation_contexts());
						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream should be cloneable");

						connect_tx
							.send(Ok((stream, presentation_contexts)))
							.map_err(|_| ())?;

						association
					}
					Err(e) => {
						error!(backend_uuid = uuid.to_string(), "Failed to connect: {e}");
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				let mut released = false;
				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = emit_pdu(&mut association, &pdu);
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result =
								association.receive().map_err(AssociationError::Client);
							reply_to
								.send(receive_result)
								.map_err(|_| ChannelError::Closed)
						}
						Command::Release(reply_to) => {
							released = true;
							let _ = reply_to.send(());
							break;
						}
					};
					if let Some(err) = result.err() {
						error!(
							backend_uuid = uuid.to_string(),
							"Error in association backend: {err}"
						);
						return Err(());
					}
				}

				rx.close();

				let end_result = if released {
					association.release()
				} else {
					association.abort()
				};
				if let Err(err) = end_result {
					debug!(
						backend_uuid = uuid.to_string(),
						"Failed to end association: {err}"
					);
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) =
			connect_result.await.map_err(|_| ChannelError::Closed)??;

		let negotiated = presentation_contexts
			.iter()
			.map(|context| NegotiatedContext {
				id: context.id,
				transfer_syntax: context.transfer_syntax.clone(),
				accepted: context.reason == PresentationContextResultReason::Acceptance,
			})
			.collect();

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			request,
			negotiated,
			timeout,
		})
	}

	async fn send(&self, pdu: Pdu) -> Result<(), AssociationError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		tokio::time::timeout(self.timeout, async {
			self.channel
				.send(Command::Send(pdu, reply_tx))
				.await
				.map_err(|_| ChannelError::Closed)?;
			reply_rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
		.map_err(AssociationError::Channel)?
	}

	async fn receive(&self) -> Result<Pdu, AssociationError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		tokio::time::timeout(self.timeout, async {
			self.channel
				.send(Command::Receive(reply_tx))
				.await
				.map_err(|_| ChannelError::Closed)?;
			reply_rx.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)?
		.map_err(AssociationError::Channel)?
	}

	/// Reads the C-STORE-RSP command set and extracts its status.
	async fn read_store_response(&self) -> Result<US, CompositeStoreError> {
		let mut command_fragments = Vec::new();
		loop {
			let pdu = self.receive().await?;
			let Pdu::PData { data } = pdu else {
				return Err(CompositeStoreError::UnexpectedPdu);
			};
			for mut pdv in data {
				if pdv.value_type != PDataValueType::Command {
					return Err(CompositeStoreError::UnexpectedPdu);
				}
				command_fragments.append(&mut pdv.data);
				if pdv.is_last {
					let command = InMemDicomObject::read_dataset_with_ts(
						command_fragments.as_slice(),
						&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
					)?;
					return command
						.get(tags::STATUS)
						.map(InMemElement::to_int::<US>)
						.and_then(Result::ok)
						.ok_or(CompositeStoreError::MissingStatus);
				}
			}
		}
	}
}

#[async_trait]
impl Association for DimseAssociation {
	fn request(&self) -> &AssociationRequest {
		&self.request
	}

	fn negotiated(&self) -> &[NegotiatedContext] {
		&self.negotiated
	}

	async fn cstore(
		&self,
		cuid: &str,
		iuid: &str,
		writer: DataWriter,
		tsuid: &str,
	) -> Result<(), CompositeStoreError> {
		let pcid = self
			.negotiated
			.iter()
			.find(|context| {
				context.accepted
					&& context.transfer_syntax == tsuid
					&& self.request.abstract_syntax(context.id) == Some(cuid)
			})
			.map(|context| context.id)
			.ok_or(CompositeStoreError::NoPresentationContext)?;

		// Resolving up front keeps an unknown output syntax from surfacing as
		// a writer error mid-association.
		TransferSyntaxRegistry
			.get(tsuid)
			.ok_or(CompositeStoreError::NoPresentationContext)?;

		let command = CompositeStoreCommand {
			affected_sop_class_uid: cuid.into(),
			affected_sop_instance_uid: iuid.into(),
			message_id: next_message_id(),
			priority: Priority::Medium as US,
		}
		.into_object();

		let mut command_buf = Vec::new();
		command.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
		self.send(Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: pcid,
				is_last: true,
				data: command_buf,
			}],
		})
		.await?;

		let mut data_buf = Vec::new();
		writer(&mut data_buf, tsuid).map_err(CompositeStoreError::DataWriter)?;
		self.send(Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Data,
				presentation_context_id: pcid,
				is_last: true,
				data: data_buf,
			}],
		})
		.await?;

		let status = self.read_store_response().await?;
		match StatusType::try_from(status) {
			Ok(StatusType::Success | StatusType::Warning) => Ok(()),
			_ => Err(CompositeStoreError::Rejected(status)),
		}
	}

	async fn release(&self) {
		let (reply_tx, reply_rx) = oneshot::channel();
		if self.channel.send(Command::Release(reply_tx)).await.is_ok() {
			let _ = reply_rx.await;
		}
	}
}

impl Drop for DimseAssociation {
	fn drop(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}
}

/// Puts one PDU on the wire. A data set PDV may exceed the maximum PDU size
/// the acceptor negotiated; such a PDV cannot go out as a single P-DATA-TF,
/// so it is replayed through the upper layer's chunking writer. Command set
/// PDVs never overflow.
fn emit_pdu(
	association: &mut dicom::ul::ClientAssociation<TcpStream>,
	pdu: &Pdu,
) -> Result<(), AssociationError> {
	let Pdu::PData { data: values } = pdu else {
		return association.send(pdu).map_err(AssociationError::Client);
	};

	let pdu_size_limit = association.acceptor_max_pdu_length() as usize;
	let oversized_data_set = values
		.iter()
		.any(|value| value.value_type == PDataValueType::Data && value.data.len() > pdu_size_limit);

	if !oversized_data_set {
		return association.send(pdu).map_err(AssociationError::Client);
	}

	for value in values {
		let mut chunker = association.send_pdata(value.presentation_context_id);
		chunker
			.write_all(&value.data)
			.map_err(AssociationError::ChunkWriter)?;
	}
	Ok(())
}
