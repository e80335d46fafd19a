//! Windows backend: ReadDirectoryChangesW.
//!
//! One watcher per watched drive, each watching the drive root recursively
//! with its own delivery thread (the facility's model), events filtered
//! against the root set downstream. A buffer overflow only poisons one
//! drive; the drive is marked dirty and reported as a single scoped
//! overflow after a debounce wait instead of a flood of per-file events.

use std::{
	collections::HashMap,
	path::{Component, Path, PathBuf, Prefix},
	time::{Duration, Instant},
};

use async_channel::Sender;
use notify::{Config, ReadDirectoryChangesWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, warn};

use super::{
	log_raw_error, translate_kinds, EventPump, PumpError, PumpEvent, RawEvent, WatchHandle,
};

struct DriveWatcher {
	watcher: ReadDirectoryChangesWatcher,
	registrations: usize,
}

pub struct NativePump {
	events_tx: Sender<RawEvent>,
	drives: HashMap<PathBuf, DriveWatcher>,
	dirty_drives: HashMap<PathBuf, Instant>,
	globally_dirty: Option<Instant>,
	overflow_debounce: Duration,
}

impl NativePump {
	pub fn new(events_tx: Sender<RawEvent>, overflow_debounce: Duration) -> notify::Result<Self> {
		// Watchers are created lazily per drive; opening the facility can
		// only fail once a root arrives, and that failure stays scoped to
		// its drive.
		Ok(Self {
			events_tx,
			drives: HashMap::new(),
			dirty_drives: HashMap::new(),
			globally_dirty: None,
			overflow_debounce,
		})
	}

	fn drive_watcher(&mut self, drive: &Path) -> Result<&mut DriveWatcher, PumpError> {
		if !self.drives.contains_key(drive) {
			let events_tx = self.events_tx.clone();
			let mut watcher = ReadDirectoryChangesWatcher::new(
				move |result| {
					if events_tx.send_blocking(result).is_err() {
						error!("Raw event channel closed, dropping kernel event;");
					}
				},
				Config::default(),
			)
			.map_err(|e| PumpError::from_notify(drive, e))?;

			watcher
				.watch(drive, RecursiveMode::Recursive)
				.map_err(|e| PumpError::from_notify(drive, e))?;

			debug!(drive = %drive.display(), "Opened drive watcher;");
			self.drives.insert(drive.to_path_buf(), DriveWatcher {
				watcher,
				registrations: 0,
			});
		}

		Ok(self
			.drives
			.get_mut(drive)
			.expect("drive watcher inserted above"))
	}
}

/// The `X:\` ancestor of a path, when it has one.
fn drive_root(path: &Path) -> Option<PathBuf> {
	match path.components().next() {
		Some(Component::Prefix(prefix)) => match prefix.kind() {
			Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
				Some(PathBuf::from(format!("{}:\\", letter as char)))
			}
			_ => None,
		},
		_ => None,
	}
}

impl EventPump for NativePump {
	fn native_recursion(&self) -> bool {
		true
	}

	fn register(&mut self, path: &Path, _recursive: bool) -> Result<WatchHandle, PumpError> {
		// The whole drive is already under watch; registration only pins
		// the drive watcher alive. Flat roots are filtered downstream like
		// every other event.
		let drive = drive_root(path).ok_or_else(|| PumpError::Gone(path.to_path_buf()))?;

		self.drive_watcher(&drive)?.registrations += 1;

		let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
		Ok(WatchHandle::new(path.to_path_buf(), canonical))
	}

	fn unregister(&mut self, handle: &WatchHandle) {
		let Some(drive) = drive_root(handle.raw()) else {
			return;
		};

		let drop_drive = match self.drives.get_mut(&drive) {
			Some(entry) => {
				entry.registrations = entry.registrations.saturating_sub(1);
				entry.registrations == 0
			}
			None => false,
		};

		if drop_drive {
			if let Some(mut entry) = self.drives.remove(&drive) {
				if let Err(e) = entry.watcher.unwatch(&drive) {
					warn!(drive = %drive.display(), ?e, "Unable to release drive watch;");
				}
				debug!(drive = %drive.display(), "Closed drive watcher;");
			}
			self.dirty_drives.remove(&drive);
		}
	}

	fn translate(&mut self, raw: RawEvent) -> Vec<PumpEvent> {
		match raw {
			Ok(event) if event.need_rescan() => {
				match event.paths.first().and_then(|path| drive_root(path)) {
					Some(drive) => {
						warn!(drive = %drive.display(), "Drive buffer overflowed;");
						self.dirty_drives.entry(drive).or_insert_with(Instant::now);
					}
					None => {
						warn!("Unattributable buffer overflow;");
						self.globally_dirty.get_or_insert_with(Instant::now);
					}
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
		let mut events = Vec::new();
		let debounce = self.overflow_debounce;

		if let Some(marked_at) = self.globally_dirty {
			if marked_at.elapsed() >= debounce {
				self.globally_dirty = None;
				events.push(PumpEvent::Overflow { scope: None });
			}
		}

		let expired: Vec<_> = self
			.dirty_drives
			.iter()
			.filter(|(_, marked_at)| marked_at.elapsed() >= debounce)
			.map(|(drive, _)| drive.clone())
			.collect();

		for drive in expired {
			self.dirty_drives.remove(&drive);
			events.push(PumpEvent::Overflow { scope: Some(drive) });
		}

		events
	}
}
