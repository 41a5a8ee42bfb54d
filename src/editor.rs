//! Attribute editors rewrite a parsed dataset before it is relayed.
//!
//! Editors run in list order with a shared [`AttributeEditorContext`]. An
//! editor may flag the context to abort the current file or the whole
//! connection; the forward controller inspects the flag after the chain ran.

use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use std::sync::Arc;

use crate::pixel::MaskArea;
use crate::types::UI;

/// Abort signal raised by an attribute editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Abort {
	#[default]
	None,
	/// Abort this instance only; the association stays usable.
	FileException,
	/// Release the inbound association and abort the whole invocation.
	ConnectionException,
}

/// Per-destination, per-instance mutable state shared by all editors.
#[derive(Debug, Default)]
pub struct AttributeEditorContext {
	abort: Abort,
	abort_message: String,
	mask: Option<MaskArea>,
}

impl AttributeEditorContext {
	pub fn new(mask: Option<MaskArea>) -> Self {
		Self {
			abort: Abort::None,
			abort_message: String::new(),
			mask,
		}
	}

	pub fn abort(&self) -> Abort {
		self.abort
	}

	pub fn abort_message(&self) -> &str {
		&self.abort_message
	}

	pub fn set_abort(&mut self, abort: Abort, message: impl Into<String>) {
		self.abort = abort;
		self.abort_message = message.into();
	}

	pub fn mask_area(&self) -> Option<&MaskArea> {
		self.mask.as_ref()
	}
}

/// A single dataset rewrite step.
pub trait AttributeEditor: Send + Sync {
	fn apply(&self, dataset: &mut InMemDicomObject, context: &mut AttributeEditorContext);
}

impl<F> AttributeEditor for F
where
	F: Fn(&mut InMemDicomObject, &mut AttributeEditorContext) + Send + Sync,
{
	fn apply(&self, dataset: &mut InMemDicomObject, context: &mut AttributeEditorContext) {
		self(dataset, context);
	}
}

/// Runs the editor chain in order. The SOP Instance UID is re-read after each
/// editor because editors are free to rewrite it; the last observed value is
/// returned so progress notifications and the C-STORE command carry the
/// post-edit identity.
pub fn apply_editors(
	editors: &[Arc<dyn AttributeEditor>],
	dataset: &mut InMemDicomObject,
	context: &mut AttributeEditorContext,
) -> Option<UI> {
	let mut iuid = None;
	for editor in editors {
		editor.apply(dataset, context);
		iuid = sop_instance_uid(dataset).or(iuid);
	}
	iuid
}

/// Reads the SOP Instance UID of a dataset, trimming trailing padding.
pub fn sop_instance_uid(dataset: &InMemDicomObject) -> Option<UI> {
	dataset
		.get(tags::SOP_INSTANCE_UID)
		.and_then(|element| element.to_str().ok())
		.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
}

#[cfg(test)]
mod tests {
	use super::*;
	use dicom::core::{DataElement, VR};
	use dicom::dicom_value;

	fn instance(iuid: &str) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([DataElement::new(
			tags::SOP_INSTANCE_UID,
			VR::UI,
			dicom_value!(Str, iuid),
		)])
	}

	#[test]
	fn refreshes_iuid_after_each_editor() {
		let rewrite: Arc<dyn AttributeEditor> =
			Arc::new(|dataset: &mut InMemDicomObject, _: &mut AttributeEditorContext| {
				dataset.put(DataElement::new(
					tags::SOP_INSTANCE_UID,
					VR::UI,
					dicom_value!(Str, "1.2.3.4"),
				));
			});

		let mut dataset = instance("1.2.3");
		let mut context = AttributeEditorContext::default();
		let iuid = apply_editors(&[rewrite], &mut dataset, &mut context);

		assert_eq!(iuid.as_deref(), Some("1.2.3.4"));
		assert_eq!(context.abort(), Abort::None);
	}

	#[test]
	fn abort_signal_is_observable_after_the_chain() {
		let bomb: Arc<dyn AttributeEditor> =
			Arc::new(|_: &mut InMemDicomObject, context: &mut AttributeEditorContext| {
				context.set_abort(Abort::FileException, "patient opted out");
			});

		let mut dataset = instance("1.2.3");
		let mut context = AttributeEditorContext::default();
		apply_editors(&[bomb], &mut dataset, &mut context);

		assert_eq!(context.abort(), Abort::FileException);
		assert_eq!(context.abort_message(), "patient opted out");
	}

	#[test]
	fn editors_run_in_list_order() {
		let first: Arc<dyn AttributeEditor> =
			Arc::new(|dataset: &mut InMemDicomObject, _: &mut AttributeEditorContext| {
				dataset.put(DataElement::new(
					tags::SOP_INSTANCE_UID,
					VR::UI,
					dicom_value!(Str, "9.9.1"),
				));
			});
		let second: Arc<dyn AttributeEditor> =
			Arc::new(|dataset: &mut InMemDicomObject, _: &mut AttributeEditorContext| {
				dataset.put(DataElement::new(
					tags::SOP_INSTANCE_UID,
					VR::UI,
					dicom_value!(Str, "9.9.2"),
				));
			});

		let mut dataset = instance("1.2.3");
		let mut context = AttributeEditorContext::default();
		let iuid = apply_editors(&[first, second], &mut dataset, &mut context);

		assert_eq!(iuid.as_deref(), Some("9.9.2"));
	}
}
