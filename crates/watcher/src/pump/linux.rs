//! Linux backend: inotify, one non-recursive watch per directory.
//!
//! inotify has no native recursion, so the tree builder owns the descent and
//! this pump only ever registers single directories. The kernel silently
//! drops a watch when its directory disappears (IN_IGNORED); that signal is
//! treated as a no-op here because the tree-driven removal is authoritative.

use std::{
	path::Path,
	time::{Duration, Instant},
};

use async_channel::Sender;
use notify::{Config, INotifyWatcher, RecursiveMode, Watcher};
use tracing::{error, trace, warn};

use super::{
	log_raw_error, translate_kinds, EventPump, PumpError, PumpEvent, RawEvent, WatchHandle,
};

pub struct NativePump {
	watcher: INotifyWatcher,
	overflow_debounce: Duration,
	pending_reset: Option<Instant>,
}

impl NativePump {
	/// Failing to open the inotify facility at all is the caller's fatal
	/// GIVEUP case.
	pub fn new(events_tx: Sender<RawEvent>, overflow_debounce: Duration) -> notify::Result<Self> {
		let watcher = INotifyWatcher::new(
			move |result| {
				if events_tx.send_blocking(result).is_err() {
					error!("Raw event channel closed, dropping kernel event;");
				}
			},
			Config::default(),
		)?;

		Ok(Self {
			watcher,
			overflow_debounce,
			pending_reset: None,
		})
	}
}

impl EventPump for NativePump {
	fn native_recursion(&self) -> bool {
		false
	}

	fn register(&mut self, path: &Path, _recursive: bool) -> Result<WatchHandle, PumpError> {
		self.watcher
			.watch(path, RecursiveMode::NonRecursive)
			.map_err(|e| PumpError::from_notify(path, e))?;

		let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
		Ok(WatchHandle::new(path.to_path_buf(), canonical))
	}

	fn unregister(&mut self, handle: &WatchHandle) {
		if let Err(e) = self.watcher.unwatch(handle.raw()) {
			// Expected aftermath of a deletion: the kernel got there first.
			trace!(path = %handle.raw().display(), ?e, "Releasing already-dead watch;");
		}
	}

	fn translate(&mut self, raw: RawEvent) -> Vec<PumpEvent> {
		match raw {
			Ok(event) if event.need_rescan() => {
				if self.pending_reset.is_none() {
					warn!("inotify event queue overflowed, scheduling reset;");
					self.pending_reset = Some(Instant::now());
				}
				vec![]
			}
			Ok(event) => translate_kinds(event),
			Err(e) => {
				log_raw_error(&e);
				vec![]
			}
		}
	}

	fn tick(&mut self) -> Vec<PumpEvent> {
		match self.pending_reset {
			Some(marked_at) if marked_at.elapsed() >= self.overflow_debounce => {
				self.pending_reset = None;
				vec![PumpEvent::Overflow { scope: None }]
			}
			_ => vec![],
		}
	}
}
