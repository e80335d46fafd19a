//! Platform event pumps.
//!
//! A pump owns the kernel notification facility and translates its raw
//! deliveries into the small abstract vocabulary the rest of the daemon
//! speaks. Registration and translation always run on the service task; the
//! only thing a kernel delivery thread ever does is push the raw event into
//! the channel wired up at construction time.

use std::path::{Path, PathBuf};

use notify::{
	event::{AccessKind, AccessMode, ModifyKind, RenameMode},
	EventKind,
};
use thiserror::Error;
use tracing::{error, trace};

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::NativePump;

#[cfg(target_os = "macos")]
pub use macos::NativePump;

#[cfg(windows)]
pub use windows::NativePump;

#[cfg(test)]
pub(crate) mod mock;

/// Raw deliveries as they leave the kernel callback.
pub type RawEvent = notify::Result<notify::Event>;

/// Identity of one registered kernel watch.
///
/// The canonical path is the stable identity used for alias/collision
/// detection; the raw path is what the facility was given and what
/// unregistration needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchHandle {
	raw: PathBuf,
	canonical: PathBuf,
}

impl WatchHandle {
	pub fn new(raw: PathBuf, canonical: PathBuf) -> Self {
		Self { raw, canonical }
	}

	pub fn raw(&self) -> &Path {
		&self.raw
	}

	pub fn canonical(&self) -> &Path {
		&self.canonical
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
	Created,
	Changed,
	Deleted,
	StatsChanged,
}

/// What a pump hands back to the service loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEvent {
	Entry { kind: EntryKind, path: PathBuf },
	/// The kernel lost events. `scope` narrows the damage to one subtree
	/// when the platform can attribute it; `None` means everything is
	/// suspect.
	Overflow { scope: Option<PathBuf> },
}

impl PumpEvent {
	fn entry(kind: EntryKind, path: PathBuf) -> Self {
		Self::Entry { kind, path }
	}
}

#[derive(Error, Debug)]
pub enum PumpError {
	#[error("watch target vanished: <path='{}'>", .0.display())]
	Gone(PathBuf),

	#[error("kernel watch limit reached")]
	WatchLimit,

	#[error("failed to register watch: <path='{}'> ({source})", .path.display())]
	Register {
		path: PathBuf,
		#[source]
		source: notify::Error,
	},
}

impl PumpError {
	pub(crate) fn from_notify(path: &Path, source: notify::Error) -> Self {
		match source.kind {
			notify::ErrorKind::MaxFilesWatch => Self::WatchLimit,
			notify::ErrorKind::PathNotFound => Self::Gone(path.to_path_buf()),
			notify::ErrorKind::Io(ref io_err)
				if io_err.kind() == std::io::ErrorKind::NotFound =>
			{
				Self::Gone(path.to_path_buf())
			}
			_ => Self::Register {
				path: path.to_path_buf(),
				source,
			},
		}
	}
}

/// One OS backend behind a common contract.
///
/// Concurrency contract: every method is called from the single service
/// task that owns the watch tree. Implementations may run kernel delivery
/// threads internally, but those threads only ever feed the raw-event
/// channel.
pub trait EventPump: Send {
	/// Whether the kernel facility descends into subdirectories on its own.
	/// When false the tree builder enumerates and registers every directory
	/// itself.
	fn native_recursion(&self) -> bool;

	fn register(&mut self, path: &Path, recursive: bool) -> Result<WatchHandle, PumpError>;

	/// Releasing a watch the kernel already dropped is a no-op, never an
	/// error; the tree-driven removal is authoritative.
	fn unregister(&mut self, handle: &WatchHandle);

	/// Translate one raw kernel delivery.
	fn translate(&mut self, raw: RawEvent) -> Vec<PumpEvent>;

	/// Periodic housekeeping, e.g. releasing debounced overflow marks.
	fn tick(&mut self) -> Vec<PumpEvent>;
}

/// The shared kind mapping; platform quirks are applied by the pumps before
/// delegating here.
pub(crate) fn translate_kinds(event: notify::Event) -> Vec<PumpEvent> {
	use EntryKind::*;

	let kind = event.kind;
	let paths = event.paths;

	match kind {
		EventKind::Create(_) => single(Created, paths),
		EventKind::Remove(_) => single(Deleted, paths),
		EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
			single(Changed, paths)
		}
		EventKind::Modify(ModifyKind::Metadata(_)) => single(StatsChanged, paths),
		EventKind::Modify(ModifyKind::Name(RenameMode::From)) => single(Deleted, paths),
		EventKind::Modify(ModifyKind::Name(RenameMode::To)) => single(Created, paths),
		EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
			let mut paths = paths.into_iter();
			let mut events = Vec::with_capacity(2);
			if let Some(from) = paths.next() {
				events.push(PumpEvent::entry(Deleted, from));
			}
			if let Some(to) = paths.next() {
				events.push(PumpEvent::entry(Created, to));
			}
			events
		}
		// FSEvents reports renames without a direction; a stat probe
		// decides which side of the move this path is on.
		EventKind::Modify(ModifyKind::Name(RenameMode::Any | RenameMode::Other)) => paths
			.into_iter()
			.map(|path| {
				let kind = if std::fs::symlink_metadata(&path).is_ok() {
					Created
				} else {
					Deleted
				};
				PumpEvent::entry(kind, path)
			})
			.collect(),
		EventKind::Access(AccessKind::Close(AccessMode::Write)) => single(Changed, paths),
		other => {
			trace!(kind = ?other, "Ignoring kernel event kind;");
			vec![]
		}
	}
}

fn single(kind: EntryKind, paths: Vec<PathBuf>) -> Vec<PumpEvent> {
	paths
		.into_iter()
		.map(|path| PumpEvent::entry(kind, path))
		.collect()
}

/// Raw channel errors never carry enough context to act on; surface them in
/// the log and keep pumping.
pub(crate) fn log_raw_error(source: &notify::Error) {
	error!(?source, "Kernel watch stream error;");
}
