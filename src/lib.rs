//! Store-and-forward engine for DICOM composite objects.
//!
//! Each inbound instance is relayed to one or more downstream destinations:
//! - Classical DICOM peers are reached over a long-lived outbound association
//!   with the C-STORE service (see [`association`]).
//! - DICOMweb endpoints are reached with STOW-RS single-file uploads
//!   (see [`web`]).
//!
//! On the way out, an ordered chain of attribute editors may rewrite the
//! dataset per destination, and the pixel data may be transcoded to a
//! transfer syntax the destination actually accepts, optionally burning in
//! masked regions for de-identification.
//!
//! The inbound listener that produces [`forward::Params`] tuples, the CLI and
//! the logging subscriber are the host's concern; this crate starts where a
//! `(iuid, cuid, tsuid, pcid, data)` tuple exists and ends when every
//! destination has been notified.

pub mod association;
pub mod config;
pub mod editor;
pub mod forward;
pub mod pixel;
pub mod transcode;
pub mod types;
pub mod web;

/// Default application entity title used when the host does not configure one.
pub const DEFAULT_AET: &str = "DICOM-RELAY";

pub use forward::{
	prepare_transfer, select_transfer_syntax, store_multiple_destination, store_one_destination,
	DicomForwardDestination, ForwardDestination, ForwardError, ForwardNode, Params,
	WebForwardDestination,
};
pub use web::prepare_payload;
