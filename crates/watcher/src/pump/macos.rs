//! macOS backend: FSEvents.
//!
//! One watcher instance; each root gets a recursive stream with the
//! facility's own coalescing latency, so the tree builder never descends
//! here. FSEvents signals lost precision with the must-scan-subdirs flag,
//! which surfaces as a scoped overflow; everything else arrives as ordinary
//! path events.

use std::{path::Path, time::Duration};

use async_channel::Sender;
use notify::{Config, FsEventWatcher, RecursiveMode, Watcher};
use tracing::{error, warn};

use super::{
	log_raw_error, translate_kinds, EventPump, PumpError, PumpEvent, RawEvent, WatchHandle,
};

pub struct NativePump {
	watcher: FsEventWatcher,
}

impl NativePump {
	pub fn new(events_tx: Sender<RawEvent>, _overflow_debounce: Duration) -> notify::Result<Self> {
		let watcher = FsEventWatcher::new(
			move |result| {
				if events_tx.send_blocking(result).is_err() {
					error!("Raw event channel closed, dropping kernel event;");
				}
			},
			Config::default(),
		)?;

		Ok(Self { watcher })
	}
}

impl EventPump for NativePump {
	fn native_recursion(&self) -> bool {
		true
	}

	fn register(&mut self, path: &Path, recursive: bool) -> Result<WatchHandle, PumpError> {
		let mode = if recursive {
			RecursiveMode::Recursive
		} else {
			RecursiveMode::NonRecursive
		};

		self.watcher
			.watch(path, mode)
			.map_err(|e| PumpError::from_notify(path, e))?;

		let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
		Ok(WatchHandle::new(path.to_path_buf(), canonical))
	}

	fn unregister(&mut self, handle: &WatchHandle) {
		if let Err(e) = self.watcher.unwatch(handle.raw()) {
			warn!(path = %handle.raw().display(), ?e, "Unable to release FSEvents stream;");
		}
	}

	fn translate(&mut self, raw: RawEvent) -> Vec<PumpEvent> {
		match raw {
			Ok(event) if event.need_rescan() => {
				warn!(paths = ?event.paths, "FSEvents requested a subtree rescan;");
				vec![PumpEvent::Overflow {
					scope: event.paths.into_iter().next(),
				}]
			}
			Ok(event) => translate_kinds(event),
			Err(e) => {
				log_raw_error(&e);
				vec![]
			}
		}
	}

	fn tick(&mut self) -> Vec<PumpEvent> {
		vec![]
	}
}
