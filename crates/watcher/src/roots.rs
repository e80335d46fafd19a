//! Root manager: owns the requested root set and the watch tree built for
//! it.
//!
//! Every ROOTS command replaces the whole set: the previous tree is torn
//! down handle by handle, the mount table is re-read, and a fresh tree is
//! built per surviving root. All of it happens on the single service task,
//! so teardown can never race event delivery.

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use itertools::Itertools;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{
	mounts::{mount_for, mounts_inside, MountProvider},
	protocol::{Report, RootSpec},
	pump::{EntryKind, EventPump, PumpError, PumpEvent},
	tree::{InsertOutcome, NodeId, WatchTree},
};

const WATCH_LIMIT_MESSAGE: &str = "Watch limit reached: some subtrees will only get coarse \
	notifications. On Linux, raise fs.inotify.max_user_watches.";

/// The watch bookkeeping no longer matches the kernel. Nothing the daemon
/// reports can be trusted after this; the caller must give up.
#[derive(Error, Debug)]
#[error("watch bookkeeping corrupted: <path='{}'>", .0.display())]
pub struct TreeCorrupted(pub PathBuf);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootState {
	Live(NodeId),
	/// Target does not exist; retried on every poll tick.
	Missing,
	/// The watch limit was hit under this root; precise events may be
	/// incomplete and the parent was told via RECDIRTY.
	Degraded(Option<NodeId>),
}

#[derive(Debug)]
struct WatchRoot {
	spec: RootSpec,
	state: RootState,
	inner_mounts: Vec<PathBuf>,
}

impl WatchRoot {
	fn node(&self) -> Option<NodeId> {
		match self.state {
			RootState::Live(id) => Some(id),
			RootState::Degraded(id) => id,
			RootState::Missing => None,
		}
	}

	/// Whether an event for `path` belongs to this root: inside the root,
	/// not past an inner mount, and no deeper than one level for flat
	/// roots.
	fn accepts(&self, path: &Path) -> bool {
		if self.state == RootState::Missing || !path.starts_with(&self.spec.path) {
			return false;
		}

		if self
			.inner_mounts
			.iter()
			.any(|mount| path.starts_with(mount))
		{
			return false;
		}

		self.spec.recursive
			|| path == self.spec.path
			|| path.parent() == Some(self.spec.path.as_path())
	}
}

/// Everything `update_roots` has to tell the parent.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RootsOutcome {
	pub unwatchable: Vec<PathBuf>,
	pub remap: Vec<(PathBuf, PathBuf)>,
	/// Side reports produced while building (degraded-mode MESSAGE and
	/// RECDIRTY), sent after the response blocks.
	pub reports: Vec<Report>,
}

#[cfg(windows)]
fn is_unc(path: &Path) -> bool {
	use std::path::{Component, Prefix};

	matches!(
		path.components().next(),
		Some(Component::Prefix(prefix))
			if matches!(prefix.kind(), Prefix::UNC(..) | Prefix::VerbatimUNC(..))
	)
}

enum WatchAttempt {
	Watched(NodeId),
	Missing,
	/// No watch and no descent: inner mount, alias, or an entry that
	/// vanished or turned unreadable mid-walk.
	Ignored,
	/// The kernel ran out of watches; coverage below this point is gone.
	Exhausted,
	/// Hard OS error; the subtree has been unwound.
	Failed,
}

pub struct RootManager<P> {
	pump: P,
	tree: WatchTree,
	roots: Vec<WatchRoot>,
	mounts: Arc<dyn MountProvider>,
	limit_message_sent: bool,
}

impl<P: EventPump> RootManager<P> {
	pub fn new(pump: P, mounts: Arc<dyn MountProvider>) -> Self {
		Self {
			pump,
			tree: WatchTree::new(),
			roots: Vec::new(),
			mounts,
			limit_message_sent: false,
		}
	}

	/// Replaces the whole root set.
	pub fn update_roots(&mut self, specs: Vec<RootSpec>) -> Result<RootsOutcome, TreeCorrupted> {
		self.teardown();

		let mut outcome = RootsOutcome::default();

		if specs.is_empty() {
			return Ok(outcome);
		}

		match self.mounts.remaps() {
			Ok(remap) => outcome.remap = remap,
			Err(e) => error!(?e, "Unable to read drive remappings;"),
		}

		let mount_table = match self.mounts.mounts() {
			Ok(table) => table,
			Err(e) => {
				// Best effort: with no table every root counts as watchable.
				error!(?e, "Unable to read mount table;");
				Vec::new()
			}
		};

		for spec in specs.into_iter().unique() {
			if spec.path.parent().is_none() {
				// Watching the entire tree is always refused.
				warn!(path = %spec.path.display(), "Refusing to watch whole filesystem;");
				outcome.unwatchable.push(spec.path);
				continue;
			}

			#[cfg(windows)]
			if is_unc(&spec.path) {
				// UNC shares have no drive watcher to attach to.
				debug!(path = %spec.path.display(), "Refusing UNC root;");
				outcome.unwatchable.push(spec.path);
				continue;
			}

			if let Some(mount) = mount_for(&mount_table, &spec.path) {
				if !mount.watchable() {
					debug!(
						path = %spec.path.display(),
						mount = %mount.directory.display(),
						"Root lives on an unwatchable mount;"
					);
					outcome.unwatchable.push(spec.path);
					continue;
				}
			}

			let inner_mounts: Vec<_> = mounts_inside(&mount_table, &spec.path)
				.filter(|mount| !mount.watchable())
				.map(|mount| mount.directory.clone())
				.collect();
			outcome.unwatchable.extend(inner_mounts.iter().cloned());

			self.roots.push(WatchRoot {
				spec,
				state: RootState::Missing,
				inner_mounts,
			});
		}

		let mut dropped = Vec::new();
		for index in 0..self.roots.len() {
			let spec = self.roots[index].spec.clone();
			let inner_mounts = self.roots[index].inner_mounts.clone();

			self.roots[index].state = match self.watch(
				&spec.path,
				spec.recursive,
				&inner_mounts,
				None,
				&mut outcome.reports,
			)? {
				WatchAttempt::Watched(id) => RootState::Live(id),
				WatchAttempt::Missing => RootState::Missing,
				WatchAttempt::Exhausted => RootState::Degraded(self.tree.node_at(&spec.path)),
				WatchAttempt::Ignored => {
					// Covered through an alias of another root.
					dropped.push(index);
					continue;
				}
				WatchAttempt::Failed => {
					outcome.unwatchable.push(spec.path.clone());
					dropped.push(index);
					continue;
				}
			};
		}
		for index in dropped.into_iter().rev() {
			self.roots.remove(index);
		}

		outcome.unwatchable = outcome.unwatchable.into_iter().unique().collect();
		Ok(outcome)
	}

	/// Releases every watch and forgets every root.
	pub fn teardown(&mut self) {
		for id in self.tree.node_ids() {
			for handle in self.tree.remove_subtree(id) {
				self.pump.unregister(&handle);
			}
		}
		self.roots.clear();
	}

	/// Retries roots whose target did not exist, synthesizing CREATE and
	/// CHANGE when one appears.
	pub fn poll_missing(&mut self) -> Result<Vec<Report>, TreeCorrupted> {
		let mut reports = Vec::new();

		for index in 0..self.roots.len() {
			if self.roots[index].state != RootState::Missing {
				continue;
			}

			let spec = self.roots[index].spec.clone();
			if std::fs::symlink_metadata(&spec.path).is_err() {
				continue;
			}

			let inner_mounts = self.roots[index].inner_mounts.clone();
			match self.watch(&spec.path, spec.recursive, &inner_mounts, None, &mut reports)? {
				WatchAttempt::Watched(id) => {
					debug!(path = %spec.path.display(), "Missing root appeared;");
					self.roots[index].state = RootState::Live(id);
					reports.push(Report::Create(spec.path.clone()));
					reports.push(Report::Change(spec.path));
				}
				WatchAttempt::Exhausted => {
					self.roots[index].state = RootState::Degraded(self.tree.node_at(&spec.path));
				}
				WatchAttempt::Missing | WatchAttempt::Ignored | WatchAttempt::Failed => {}
			}
		}

		Ok(reports)
	}

	/// Resolves one abstract pump event into parent-facing reports,
	/// keeping the tree in sync along the way.
	pub fn handle_event(&mut self, event: PumpEvent) -> Result<Vec<Report>, TreeCorrupted> {
		match event {
			PumpEvent::Entry { kind, path } => self.handle_entry(kind, path),
			PumpEvent::Overflow { scope } => Ok(self.handle_overflow(scope)),
		}
	}

	fn handle_entry(
		&mut self,
		kind: EntryKind,
		path: PathBuf,
	) -> Result<Vec<Report>, TreeCorrupted> {
		let mut reports = Vec::new();

		let accepted = self.roots.iter().any(|root| root.accepts(&path));
		if !accepted {
			trace!(?kind, path = %path.display(), "Event outside the watched set;");
			return Ok(reports);
		}

		match kind {
			EntryKind::Created => {
				reports.push(Report::Create(path.clone()));
				self.extend_tree(&path, &mut reports)?;
			}
			EntryKind::Changed => reports.push(Report::Change(path.clone())),
			EntryKind::StatsChanged => reports.push(Report::Stats(path.clone())),
			EntryKind::Deleted => {
				reports.push(Report::Delete(path.clone()));
				self.prune_tree(&path);
			}
		}

		Ok(reports)
	}

	/// A directory appeared under a live recursive root: grow the tree
	/// there (only needed where the kernel does not descend on its own).
	fn extend_tree(
		&mut self,
		path: &Path,
		reports: &mut Vec<Report>,
	) -> Result<(), TreeCorrupted> {
		if self.pump.native_recursion() || self.tree.node_at(path).is_some() {
			return Ok(());
		}

		let Ok(metadata) = std::fs::symlink_metadata(path) else {
			return Ok(());
		};
		if !metadata.is_dir() {
			return Ok(());
		}

		let Some(root_index) = self.roots.iter().position(|root| {
			root.spec.recursive && root.node().is_some() && root.accepts(path)
		}) else {
			return Ok(());
		};

		let parent = path.parent().and_then(|parent| self.tree.node_at(parent));
		if parent.is_none() {
			// The parent watch is already gone (raced a deletion); the
			// parent directory's own CREATE will re-enumerate if needed.
			return Ok(());
		}

		let inner_mounts = self.roots[root_index].inner_mounts.clone();
		match self.watch(path, true, &inner_mounts, parent, reports)? {
			WatchAttempt::Exhausted => {
				let spec_path = self.roots[root_index].spec.path.clone();
				self.roots[root_index].state =
					RootState::Degraded(self.tree.node_at(&spec_path));
			}
			WatchAttempt::Watched(_)
			| WatchAttempt::Missing
			| WatchAttempt::Ignored
			| WatchAttempt::Failed => {}
		}

		Ok(())
	}

	fn prune_tree(&mut self, path: &Path) {
		if let Some(id) = self.tree.node_at(path) {
			for handle in self.tree.remove_subtree(id) {
				self.pump.unregister(&handle);
			}
		}

		// A root losing its own path goes back to the missing state and
		// gets retried by the poll loop.
		for root in &mut self.roots {
			if root.spec.path == path && root.state != RootState::Missing {
				debug!(path = %path.display(), "Live root disappeared;");
				root.state = RootState::Missing;
			}
		}
	}

	fn handle_overflow(&mut self, scope: Option<PathBuf>) -> Vec<Report> {
		let Some(scope) = scope else {
			warn!("Global overflow, resetting parent state;");
			return vec![Report::Reset];
		};

		let mut reports: Vec<_> = self
			.roots
			.iter()
			.filter_map(|root| {
				if root.node().is_none() {
					return None;
				}

				// The dirty subtree is the deeper of the overflow scope and
				// the root it intersects.
				if scope.starts_with(&root.spec.path) && root.accepts(&scope) {
					Some(Report::RecDirty(scope.clone()))
				} else if root.spec.path.starts_with(&scope) {
					Some(Report::RecDirty(root.spec.path.clone()))
				} else {
					None
				}
			})
			.unique()
			.collect();

		if reports.is_empty() {
			warn!(scope = %scope.display(), "Overflow outside the watched set, resetting;");
			reports.push(Report::Reset);
		}

		reports
	}

	/// Registers a watch for `path`, descending into subdirectories when
	/// the kernel facility does not.
	fn watch(
		&mut self,
		path: &Path,
		recursive: bool,
		inner_mounts: &[PathBuf],
		parent: Option<NodeId>,
		reports: &mut Vec<Report>,
	) -> Result<WatchAttempt, TreeCorrupted> {
		let metadata = match std::fs::symlink_metadata(path) {
			Ok(metadata) => metadata,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Ok(WatchAttempt::Missing)
			}
			Err(e) => {
				warn!(path = %path.display(), ?e, "Unable to stat watch target;");
				return Ok(WatchAttempt::Failed);
			}
		};

		if inner_mounts.iter().any(|mount| mount == path) {
			trace!(path = %path.display(), "Skipping inner mount;");
			return Ok(WatchAttempt::Ignored);
		}

		if self.tree.node_at(path).is_some() {
			// Overlapping roots: the first registration owns the subtree.
			trace!(path = %path.display(), "Already watched;");
			return Ok(WatchAttempt::Ignored);
		}

		let handle = match self.pump.register(path, recursive) {
			Ok(handle) => handle,
			Err(PumpError::Gone(_)) => return Ok(WatchAttempt::Missing),
			Err(PumpError::WatchLimit) => {
				if !self.limit_message_sent {
					self.limit_message_sent = true;
					reports.push(Report::Message(WATCH_LIMIT_MESSAGE.to_string()));
				}
				reports.push(Report::RecDirty(path.to_path_buf()));
				return Ok(WatchAttempt::Exhausted);
			}
			Err(e @ PumpError::Register { .. }) => {
				error!(path = %path.display(), ?e, "Watch registration failed;");
				return Ok(WatchAttempt::Failed);
			}
		};

		let id = match self.tree.insert(parent, path.to_path_buf(), handle) {
			InsertOutcome::Inserted(id) => id,
			InsertOutcome::Alias { .. } => {
				// Same kernel watch as an existing node; releasing it here
				// would kill the original, so only the bookkeeping is
				// skipped.
				return Ok(WatchAttempt::Ignored);
			}
			InsertOutcome::Corrupt { .. } => return Err(TreeCorrupted(path.to_path_buf())),
		};

		if !(recursive && metadata.is_dir() && !self.pump.native_recursion()) {
			return Ok(WatchAttempt::Watched(id));
		}

		let entries = match std::fs::read_dir(path) {
			Ok(entries) => entries,
			Err(e) => {
				// The watch itself stands; an unreadable directory only
				// loses its children.
				warn!(path = %path.display(), ?e, "Unable to enumerate directory;");
				return Ok(WatchAttempt::Watched(id));
			}
		};

		for entry in entries {
			let Ok(entry) = entry else { continue };

			let Ok(file_type) = entry.file_type() else {
				continue;
			};
			// Symlinks are never followed during enumeration.
			if !file_type.is_dir() || file_type.is_symlink() {
				continue;
			}

			match self.watch(&entry.path(), true, inner_mounts, Some(id), reports)? {
				WatchAttempt::Watched(_) | WatchAttempt::Missing | WatchAttempt::Ignored => {}
				WatchAttempt::Exhausted => return Ok(WatchAttempt::Exhausted),
				WatchAttempt::Failed => {
					// Hard error below: unwind everything built under this
					// node before giving up on the subtree.
					for handle in self.tree.remove_subtree(id) {
						self.pump.unregister(&handle);
					}
					return Ok(WatchAttempt::Failed);
				}
			}
		}

		Ok(WatchAttempt::Watched(id))
	}

	pub fn translate(&mut self, raw: crate::pump::RawEvent) -> Vec<PumpEvent> {
		self.pump.translate(raw)
	}

	pub fn pump_tick(&mut self) -> Vec<PumpEvent> {
		self.pump.tick()
	}

	#[cfg(test)]
	pub(crate) fn pump(&self) -> &P {
		&self.pump
	}

	#[cfg(test)]
	pub(crate) fn watch_count(&self) -> usize {
		self.tree.len()
	}
}
