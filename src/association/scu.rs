//! Long-lived store SCU for one outbound destination.
//!
//! The SCU accumulates proposed presentation contexts across instances and
//! keeps a single open association that all transfers of the destination
//! share. Adding a context to an already-open association requires a close
//! and reopen so the peer renegotiates with the extended set; the forward
//! controller serializes those reconfigurations behind a process-wide gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Association, AssociationError, AssociationRequest, Connector};

pub struct StoreScu {
	connector: Box<dyn Connector>,
	state: Mutex<ScuState>,
	idle_timeout: Option<Duration>,
	/// Bumped whenever the idle timer is re-armed; a pending close fires only
	/// when its snapshot is still current.
	idle_generation: AtomicU64,
}

#[derive(Default)]
struct ScuState {
	request: AssociationRequest,
	active: Option<Arc<dyn Association>>,
}

impl StoreScu {
	pub fn new(connector: Box<dyn Connector>) -> Self {
		Self {
			connector,
			state: Mutex::new(ScuState::default()),
			idle_timeout: None,
			idle_generation: AtomicU64::new(0),
		}
	}

	pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
		self.idle_timeout = Some(timeout);
		self
	}

	/// An association is open iff its presentation context table holds at
	/// least one negotiated pair.
	pub fn is_open(&self) -> bool {
		self.state
			.lock()
			.unwrap()
			.active
			.as_ref()
			.is_some_and(|association| association.has_accepted_context())
	}

	pub fn association(&self) -> Option<Arc<dyn Association>> {
		self.state.lock().unwrap().active.clone()
	}

	/// Adds a presentation context to the request for the next (re)open.
	pub fn propose_context(&self, cuid: &str, tsuid: &str) {
		self.state.lock().unwrap().request.propose(cuid, tsuid);
	}

	/// Probes whether the current request already advertises the pair.
	pub fn request_contains(&self, cuid: &str, tsuid: &str) -> bool {
		self.state.lock().unwrap().request.contains(cuid, tsuid)
	}

	pub async fn open(&self) -> Result<(), AssociationError> {
		let request = self.state.lock().unwrap().request.clone();
		if request.is_empty() {
			return Err(AssociationError::EmptyRequest);
		}
		let association = self.connector.connect(request).await?;
		let mut state = self.state.lock().unwrap();
		state.active = Some(Arc::from(association));
		Ok(())
	}

	/// Releases the active association. `reopen` marks a close performed only
	/// to renegotiate the presentation context set.
	pub async fn close(&self, reopen: bool) {
		let active = self.state.lock().unwrap().active.take();
		if let Some(association) = active {
			association.release().await;
			debug!(reopen, "closed outbound association");
		}
	}

	/// Arms the idle-close timer. Called at the end of every transfer; the
	/// association closes once no transfer re-armed the timer within the
	/// configured idle period.
	pub fn arm_idle_close(self: &Arc<Self>) {
		let Some(timeout) = self.idle_timeout else {
			return;
		};
		let generation = self.idle_generation.fetch_add(1, Ordering::SeqCst) + 1;
		let scu = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(timeout).await;
			if scu.idle_generation.load(Ordering::SeqCst) == generation && scu.is_open() {
				warn!("closing idle outbound association");
				scu.close(false).await;
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::association::{CompositeStoreError, DataWriter, NegotiatedContext};
	use async_trait::async_trait;
	use std::sync::atomic::AtomicUsize;

	struct StubAssociation {
		request: AssociationRequest,
		negotiated: Vec<NegotiatedContext>,
	}

	#[async_trait]
	impl Association for StubAssociation {
		fn request(&self) -> &AssociationRequest {
			&self.request
		}

		fn negotiated(&self) -> &[NegotiatedContext] {
			&self.negotiated
		}

		async fn cstore(
			&self,
			_cuid: &str,
			_iuid: &str,
			_writer: DataWriter,
			_tsuid: &str,
		) -> Result<(), CompositeStoreError> {
			Ok(())
		}

		async fn release(&self) {}
	}

	struct StubConnector {
		connects: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl Connector for StubConnector {
		async fn connect(
			&self,
			request: AssociationRequest,
		) -> Result<Box<dyn Association>, AssociationError> {
			self.connects.fetch_add(1, Ordering::SeqCst);
			let negotiated = request
				.contexts()
				.iter()
				.map(|context| NegotiatedContext {
					id: context.id,
					transfer_syntax: context.transfer_syntax.clone(),
					accepted: true,
				})
				.collect();
			Ok(Box::new(StubAssociation {
				request,
				negotiated,
			}))
		}
	}

	#[tokio::test]
	async fn open_requires_a_proposed_context() {
		let scu = StoreScu::new(Box::new(StubConnector {
			connects: Arc::new(AtomicUsize::new(0)),
		}));
		assert!(matches!(
			scu.open().await,
			Err(AssociationError::EmptyRequest)
		));
	}

	#[tokio::test]
	async fn open_close_cycle_tracks_state() {
		let connects = Arc::new(AtomicUsize::new(0));
		let scu = StoreScu::new(Box::new(StubConnector {
			connects: Arc::clone(&connects),
		}));
		scu.propose_context("1.2", "3.4");
		assert!(!scu.is_open());

		scu.open().await.unwrap();
		assert!(scu.is_open());
		assert!(scu.request_contains("1.2", "3.4"));
		assert_eq!(connects.load(Ordering::SeqCst), 1);

		scu.close(true).await;
		assert!(!scu.is_open());

		// Reopening after a close-for-renegotiation reconnects.
		scu.open().await.unwrap();
		assert!(scu.is_open());
		assert_eq!(connects.load(Ordering::SeqCst), 2);
	}
}
