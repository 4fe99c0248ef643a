//! Licence-dependent capabilities.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::Result;

/// Pluggable entitlement check.
///
/// Token validation lives behind this trait; the orchestrator only asks
/// whether editing is allowed and re-activates providers after a licence change.
#[async_trait]
pub trait Entitlements: Send + Sync {
	async fn activate_providers(&self) -> Result<()>;

	fn allows_editing(&self) -> bool;
}

/// Fixed entitlements, toggled in place.
#[derive(Debug, Default)]
pub struct StaticEntitlements {
	editing: AtomicBool,
	activations: AtomicUsize,
}

impl StaticEntitlements {
	pub fn new(editing: bool) -> Self {
		Self {
			editing: AtomicBool::new(editing),
			activations: AtomicUsize::new(0),
		}
	}

	pub fn set_editing(&self, editing: bool) {
		self.editing.store(editing, Ordering::Release);
	}

	/// Number of times providers were activated.
	pub fn activations(&self) -> usize {
		self.activations.load(Ordering::Acquire)
	}
}

#[async_trait]
impl Entitlements for StaticEntitlements {
	async fn activate_providers(&self) -> Result<()> {
		self.activations.fetch_add(1, Ordering::AcqRel);
		Ok(())
	}

	fn allows_editing(&self) -> bool {
		self.editing.load(Ordering::Acquire)
	}
}
