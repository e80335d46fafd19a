//! Deterministic pump for unit tests: no kernel, no filesystem, full
//! control over failures and aliasing.

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
};

use super::{translate_kinds, EventPump, PumpError, PumpEvent, RawEvent, WatchHandle};

#[derive(Debug, Clone, Copy)]
pub(crate) enum MockFailure {
	Gone,
	Hard,
}

#[derive(Debug, Default)]
pub(crate) struct MockPump {
	pub native_recursion: bool,
	/// Raw paths with a live registration.
	pub registered: Vec<PathBuf>,
	/// Every unregistered raw path, in release order.
	pub released: Vec<PathBuf>,
	/// Forced failures by raw path.
	pub fail_with: HashMap<PathBuf, MockFailure>,
	/// Registrations allowed before the kernel limit kicks in.
	pub watch_budget: Option<usize>,
	/// Canonicalization overrides, identity when absent.
	pub aliases: HashMap<PathBuf, PathBuf>,
	/// Events released by the next `tick` call.
	pub pending_ticks: Vec<PumpEvent>,
}

impl MockPump {
	pub fn recursive_kernel() -> Self {
		Self {
			native_recursion: true,
			..Self::default()
		}
	}

	pub fn live_count(&self) -> usize {
		self.registered.len()
	}
}

impl EventPump for MockPump {
	fn native_recursion(&self) -> bool {
		self.native_recursion
	}

	fn register(&mut self, path: &Path, _recursive: bool) -> Result<WatchHandle, PumpError> {
		match self.fail_with.get(path) {
			Some(MockFailure::Gone) => return Err(PumpError::Gone(path.to_path_buf())),
			Some(MockFailure::Hard) => {
				return Err(PumpError::Register {
					path: path.to_path_buf(),
					source: notify::Error::generic("forced failure"),
				})
			}
			None => {}
		}

		if let Some(budget) = self.watch_budget {
			if self.registered.len() >= budget {
				return Err(PumpError::WatchLimit);
			}
		}

		self.registered.push(path.to_path_buf());

		let canonical = self
			.aliases
			.get(path)
			.cloned()
			.unwrap_or_else(|| path.to_path_buf());
		Ok(WatchHandle::new(path.to_path_buf(), canonical))
	}

	fn unregister(&mut self, handle: &WatchHandle) {
		if let Some(pos) = self.registered.iter().position(|p| p == handle.raw()) {
			self.registered.remove(pos);
		}
		self.released.push(handle.raw().to_path_buf());
	}

	fn translate(&mut self, raw: RawEvent) -> Vec<PumpEvent> {
		match raw {
			Ok(event) if event.need_rescan() => vec![PumpEvent::Overflow {
				scope: event.paths.into_iter().next(),
			}],
			Ok(event) => translate_kinds(event),
			Err(_) => vec![],
		}
	}

	fn tick(&mut self) -> Vec<PumpEvent> {
		std::mem::take(&mut self.pending_ticks)
	}
}
