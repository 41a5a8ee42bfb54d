//! Outbound association interface.
//!
//! The forward controller talks to DICOM peers through the [`Association`]
//! trait: a negotiated upper-layer association that can run C-STORE with a
//! caller-provided data writer. [`scu::StoreScu`] manages the lifecycle of
//! one long-lived association per destination; [`dimse`] provides the
//! production implementation on top of `dicom::ul`.

pub mod dimse;
pub mod scu;

use async_trait::async_trait;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::sync::atomic::{AtomicU16, Ordering};
use thiserror::Error;

use crate::types::{UI, US};

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message
/// contains a data set.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has
/// no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;

/// Serializes a data set into `out` under the given transfer syntax UID.
/// Invoked at most once, when the association is ready to emit the data PDU.
pub type DataWriter = Box<
	dyn FnOnce(&mut Vec<u8>, &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send,
>;

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("failed to spawn thread")]
	OsThread(std::io::Error),
	#[error("failed to write P-DATA chunk: {0}")]
	ChunkWriter(std::io::Error),
	#[error("no presentation context proposed for the association")]
	EmptyRequest,
	#[error(transparent)]
	Client(#[from] dicom::ul::association::client::Error),
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("timed out")]
	Timeout,
	#[error("channel is closed")]
	Closed,
}

#[derive(Debug, Error)]
pub enum CompositeStoreError {
	#[error("no presentation context accepted for the store operation")]
	NoPresentationContext,
	#[error("C-STORE-RSP reported status 0x{0:04X}")]
	Rejected(US),
	#[error("C-STORE-RSP carries no status")]
	MissingStatus,
	#[error("received unexpected PDU")]
	UnexpectedPdu,
	#[error("failed to produce the data set: {0}")]
	DataWriter(#[source] Box<dyn std::error::Error + Send + Sync>),
	#[error("failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
}

/// One proposed presentation context of the association request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedContext {
	pub id: u8,
	pub abstract_syntax: UI,
	pub transfer_syntax: UI,
}

/// The requested presentation contexts, with their locally assigned ids.
/// Ids are odd, in order of proposal, as the upper layer protocol demands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssociationRequest {
	contexts: Vec<ProposedContext>,
}

impl AssociationRequest {
	/// Adds a `(abstract syntax, transfer syntax)` pair unless it is already
	/// proposed. Returns whether the request changed.
	pub fn propose(&mut self, cuid: &str, tsuid: &str) -> bool {
		if self.contains(cuid, tsuid) {
			return false;
		}
		let id = self
			.contexts
			.last()
			.map(|context| context.id + 2)
			.unwrap_or(1);
		self.contexts.push(ProposedContext {
			id,
			abstract_syntax: UI::from(cuid),
			transfer_syntax: UI::from(tsuid),
		});
		true
	}

	pub fn contains(&self, cuid: &str, tsuid: &str) -> bool {
		self.contexts
			.iter()
			.any(|context| context.abstract_syntax == cuid && context.transfer_syntax == tsuid)
	}

	pub fn contexts(&self) -> &[ProposedContext] {
		&self.contexts
	}

	pub fn is_empty(&self) -> bool {
		self.contexts.is_empty()
	}

	/// Presentation context ids advertised for an abstract syntax.
	pub fn pcids_for<'a>(&'a self, cuid: &'a str) -> impl Iterator<Item = u8> + 'a {
		self.contexts
			.iter()
			.filter(move |context| context.abstract_syntax == cuid)
			.map(|context| context.id)
	}

	pub fn abstract_syntax(&self, pcid: u8) -> Option<&str> {
		self.contexts
			.iter()
			.find(|context| context.id == pcid)
			.map(|context| context.abstract_syntax.as_str())
	}
}

/// Outcome of negotiation for one proposed context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
	pub id: u8,
	pub transfer_syntax: UI,
	pub accepted: bool,
}

/// A negotiated upper-layer association towards one peer.
#[async_trait]
pub trait Association: Send + Sync {
	/// The request this association was negotiated from.
	fn request(&self) -> &AssociationRequest;

	/// The acceptor's answer, one entry per proposed context.
	fn negotiated(&self) -> &[NegotiatedContext];

	/// Runs the C-STORE service: command set, then the data set produced by
	/// `writer` under `tsuid`, then waits for the C-STORE-RSP.
	async fn cstore(
		&self,
		cuid: &str,
		iuid: &str,
		writer: DataWriter,
		tsuid: &str,
	) -> Result<(), CompositeStoreError>;

	/// Releases the association gracefully.
	async fn release(&self);

	/// The transfer syntax accepted on a presentation context, if any.
	fn transfer_syntax(&self, pcid: u8) -> Option<&str> {
		self.negotiated()
			.iter()
			.find(|context| context.id == pcid && context.accepted)
			.map(|context| context.transfer_syntax.as_str())
	}

	fn accepted_transfer_syntax(&self, pcid: u8, tsuid: &str) -> bool {
		self.transfer_syntax(pcid) == Some(tsuid)
	}

	/// An association is usable iff at least one context was accepted.
	fn has_accepted_context(&self) -> bool {
		self.negotiated().iter().any(|context| context.accepted)
	}
}

/// Opens a fresh association for a set of proposed presentation contexts.
#[async_trait]
pub trait Connector: Send + Sync {
	async fn connect(
		&self,
		request: AssociationRequest,
	) -> Result<Box<dyn Association>, AssociationError>;
}

/// Handle to the inbound association an instance arrived on; released when an
/// editor demands a connection abort.
pub trait InboundAssociation: Send + Sync {
	fn release(&self);
}

/// C-STORE-RQ command set.
pub struct CompositeStoreCommand {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub message_id: US,
	pub priority: US,
}

impl CompositeStoreCommand {
	#[rustfmt::skip]
	pub fn into_object(self) -> InMemDicomObject {
		InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, self.affected_sop_class_uid)),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, self.affected_sop_instance_uid)),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [self.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [self.priority])),
		])
	}
}

/// Returns a new message id by incrementing a global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(0);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn proposes_odd_ids_in_order() {
		let mut request = AssociationRequest::default();
		assert!(request.propose("1.2.840.10008.5.1.4.1.1.7", "1.2.840.10008.1.2.1"));
		assert!(request.propose("1.2.840.10008.5.1.4.1.1.7", "1.2.840.10008.1.2.4.50"));
		assert!(request.propose("1.2.840.10008.5.1.4.1.1.2", "1.2.840.10008.1.2.1"));

		let ids: Vec<u8> = request.contexts().iter().map(|context| context.id).collect();
		assert_eq!(ids, vec![1, 3, 5]);
	}

	#[test]
	fn duplicate_proposal_is_a_no_op() {
		let mut request = AssociationRequest::default();
		assert!(request.propose("1.2", "3.4"));
		assert!(!request.propose("1.2", "3.4"));
		assert_eq!(request.contexts().len(), 1);
	}

	#[test]
	fn pcids_are_filtered_by_abstract_syntax() {
		let mut request = AssociationRequest::default();
		request.propose("1.1", "2.1");
		request.propose("1.2", "2.1");
		request.propose("1.1", "2.2");

		let pcids: Vec<u8> = request.pcids_for("1.1").collect();
		assert_eq!(pcids, vec![1, 5]);
		assert_eq!(request.abstract_syntax(3), Some("1.2"));
	}
}
