//! Mount and filesystem classification.
//!
//! Decides which parts of the namespace are worth native watches at all:
//! pseudo filesystems produce no useful events, network filesystems do not
//! deliver remote changes, and on Windows some SMB shares masquerade as
//! NTFS. The table is re-read on every ROOTS update and never cached.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
	#[error("failed to read mount table: {0}")]
	Io(#[from] std::io::Error),

	#[error("platform error: {0}")]
	Platform(String),
}

/// Filesystem classification, from the mount table's type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilesystemKind {
	/// A local, physically backed filesystem.
	Physical(String),
	/// Locally backed FUSE (fuseblk and friends).
	Fuse(String),
	/// Network or otherwise remote; changes happen on another machine.
	Network(String),
	/// Kernel-generated pseudo filesystem.
	Virtual(String),
}

impl FilesystemKind {
	pub fn from_kind_str(kind: &str) -> Self {
		let kind = kind.to_lowercase();

		if matches!(
			kind.as_str(),
			"proc" | "procfs"
				| "sysfs" | "devfs"
				| "devtmpfs" | "devpts"
				| "swap" | "autofs"
				| "cgroup" | "cgroup2"
				| "debugfs" | "tracefs"
				| "securityfs" | "fusectl"
				| "binfmt_misc" | "mqueue"
				| "hugetlbfs" | "pstore"
				| "configfs" | "bpf"
				| "efivarfs" | "selinuxfs"
				| "rpc_pipefs" | "nfsd"
		) {
			return Self::Virtual(kind);
		}

		if matches!(
			kind.as_str(),
			"nfs" | "nfs4"
				| "cifs" | "smb"
				| "smbfs" | "smb3"
				| "9p" | "afs"
				| "ncpfs" | "coda"
				| "sshfs" | "ftpfs"
				| "curlftpfs" | "davfs"
		) {
			return Self::Network(kind);
		}

		if let Some(subtype) = kind.strip_prefix("fuse.") {
			// Remote FUSE mounts behave like network filesystems; local
			// ones (encfs, bindfs, ...) pass events through.
			return if matches!(
				subtype,
				"sshfs" | "ftpfs" | "curlftpfs" | "s3fs" | "rclone" | "cephfs" | "glusterfs"
			) {
				Self::Network(kind.clone())
			} else {
				Self::Fuse(kind.clone())
			};
		}

		if kind == "fuseblk" || kind == "fuse" {
			return Self::Fuse(kind);
		}

		Self::Physical(kind)
	}

	/// Whether a native watch inside this filesystem can observe changes.
	pub fn is_watchable(&self) -> bool {
		matches!(self, Self::Physical(_) | Self::Fuse(_))
	}
}

/// Per-mount option flags; only meaningful on macOS, where a volume must be
/// both local and journaled to be watchable. Other platforms report both as
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountFlags {
	pub local: bool,
	pub journaled: bool,
}

impl Default for MountFlags {
	fn default() -> Self {
		Self {
			local: true,
			journaled: true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
	pub directory: PathBuf,
	pub kind: FilesystemKind,
	pub flags: MountFlags,
}

impl MountPoint {
	pub fn new(directory: impl Into<PathBuf>, kind: FilesystemKind) -> Self {
		Self {
			directory: directory.into(),
			kind,
			flags: MountFlags::default(),
		}
	}

	pub fn watchable(&self) -> bool {
		self.kind.is_watchable() && self.flags.local && self.flags.journaled
	}
}

/// The deepest mount containing `path`.
pub fn mount_for<'a>(mounts: &'a [MountPoint], path: &Path) -> Option<&'a MountPoint> {
	mounts
		.iter()
		.filter(|mount| path.starts_with(&mount.directory))
		.max_by_key(|mount| mount.directory.components().count())
}

/// Mounts strictly inside `root` (the root's own mount excluded).
pub fn mounts_inside<'a>(
	mounts: &'a [MountPoint],
	root: &'a Path,
) -> impl Iterator<Item = &'a MountPoint> {
	mounts
		.iter()
		.filter(move |mount| mount.directory != root && mount.directory.starts_with(root))
}

/// Source of the current mount table. Production uses the OS; tests inject
/// fixed tables.
pub trait MountProvider: Send + Sync {
	fn mounts(&self) -> Result<Vec<MountPoint>, MountError>;

	/// Drive-letter remappings to report to the parent (`subst` on
	/// Windows); empty elsewhere.
	fn remaps(&self) -> Result<Vec<(PathBuf, PathBuf)>, MountError> {
		Ok(Vec::new())
	}
}

/// The live mount table of this machine.
#[derive(Debug, Default)]
pub struct SystemMounts;

impl MountProvider for SystemMounts {
	fn mounts(&self) -> Result<Vec<MountPoint>, MountError> {
		#[cfg(target_os = "linux")]
		{
			linux::mounts()
		}

		#[cfg(target_os = "macos")]
		{
			macos::mounts()
		}

		#[cfg(windows)]
		{
			windows::mounts()
		}
	}

	fn remaps(&self) -> Result<Vec<(PathBuf, PathBuf)>, MountError> {
		#[cfg(windows)]
		{
			windows::remaps()
		}

		#[cfg(not(windows))]
		{
			Ok(Vec::new())
		}
	}
}

/// Parses the `/proc/mounts` format: `device directory fstype options 0 0`,
/// with octal escapes in the directory field.
pub fn parse_proc_mounts(table: &str) -> Vec<MountPoint> {
	table
		.lines()
		.filter_map(|line| {
			let mut fields = line.split_ascii_whitespace();
			let _device = fields.next()?;
			let directory = unescape_mount_path(fields.next()?);
			let kind = FilesystemKind::from_kind_str(fields.next()?);

			Some(MountPoint::new(directory, kind))
		})
		.collect()
}

// The kernel escapes space, tab, newline and backslash as \040-style octal.
fn unescape_mount_path(raw: &str) -> PathBuf {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars();

	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}

		let digits: String = chars.clone().take(3).collect();
		match u8::from_str_radix(&digits, 8) {
			Ok(byte) if digits.len() == 3 => {
				out.push(byte as char);
				chars.nth(2);
			}
			_ => out.push(c),
		}
	}

	PathBuf::from(out)
}

/// Parses BSD `mount` output: `device on /dir (fstype, opt, opt, ...)`.
pub fn parse_mount_output(output: &str) -> Vec<MountPoint> {
	output
		.lines()
		.filter_map(|line| {
			let (_, rest) = line.split_once(" on ")?;
			let (directory, options) = rest.rsplit_once(" (")?;
			let options = options.strip_suffix(')')?;

			let mut parts = options.split(", ");
			let kind = FilesystemKind::from_kind_str(parts.next()?);
			let opts: Vec<_> = parts.collect();

			let mut mount = MountPoint::new(directory, kind);
			mount.flags = MountFlags {
				local: opts.iter().any(|o| *o == "local"),
				journaled: opts.iter().any(|o| *o == "journaled"),
			};

			Some(mount)
		})
		.collect()
}

/// The SMB-masquerading heuristic: a share claiming to be NTFS while
/// missing reparse-point support and the NTFS 255-char component limit is a
/// remote filesystem in disguise.
pub fn smells_like_masqueraded_smb(
	fs_name: &str,
	supports_reparse_points: bool,
	max_component_length: u32,
) -> bool {
	fs_name.eq_ignore_ascii_case("ntfs") && !supports_reparse_points && max_component_length != 255
}

#[cfg(target_os = "linux")]
mod linux {
	use super::*;

	pub fn mounts() -> Result<Vec<MountPoint>, MountError> {
		let table = std::fs::read_to_string("/proc/mounts")?;
		Ok(parse_proc_mounts(&table))
	}
}

#[cfg(target_os = "macos")]
mod macos {
	use super::*;
	use std::process::Command;
	use sysinfo::Disks;

	pub fn mounts() -> Result<Vec<MountPoint>, MountError> {
		let output = Command::new("mount")
			.output()
			.map_err(|e| MountError::Platform(format!("failed to run mount: {e}")))?;

		let mut mounts = parse_mount_output(&String::from_utf8_lossy(&output.stdout));

		// The disk list carries cleaner filesystem names than the mount
		// summary; prefer them where both know the volume.
		let disks = Disks::new_with_refreshed_list();
		for disk in disks.list() {
			let fs = disk.file_system().to_string_lossy();
			if let Some(mount) = mounts
				.iter_mut()
				.find(|mount| mount.directory == disk.mount_point())
			{
				mount.kind = FilesystemKind::from_kind_str(&fs);
			}
		}

		Ok(mounts)
	}
}

#[cfg(windows)]
mod windows {
	use super::*;
	use std::ffi::OsString;
	use std::os::windows::ffi::OsStringExt;
	use windows::Win32::Storage::FileSystem::{
		GetDriveTypeW, GetLogicalDrives, GetVolumeInformationW, QueryDosDeviceW,
		FILE_SUPPORTS_REPARSE_POINTS, DRIVE_CDROM, DRIVE_FIXED, DRIVE_RAMDISK, DRIVE_REMOTE,
		DRIVE_REMOVABLE,
	};

	fn wide(path: &str) -> Vec<u16> {
		OsString::from(path)
			.encode_wide()
			.chain(std::iter::once(0))
			.collect()
	}

	fn drive_letters() -> impl Iterator<Item = char> {
		let mask = unsafe { GetLogicalDrives() };
		(0..26u32)
			.filter(move |i| mask & (1 << i) != 0)
			.map(|i| (b'A' + i as u8) as char)
	}

	pub fn mounts() -> Result<Vec<MountPoint>, MountError> {
		let mut mounts = Vec::new();

		for letter in drive_letters() {
			let root = format!("{letter}:\\");
			let wide_root = wide(&root);

			let drive_type = unsafe { GetDriveTypeW(::windows::core::PCWSTR(wide_root.as_ptr())) };

			let kind = match drive_type {
				DRIVE_REMOTE => FilesystemKind::Network("unc".into()),
				DRIVE_CDROM | DRIVE_RAMDISK => FilesystemKind::Virtual("removable-media".into()),
				DRIVE_FIXED | DRIVE_REMOVABLE => classify_volume(&root),
				_ => FilesystemKind::Virtual("unknown".into()),
			};

			mounts.push(MountPoint::new(PathBuf::from(root), kind));
		}

		Ok(mounts)
	}

	fn classify_volume(root: &str) -> FilesystemKind {
		let wide_root = wide(root);
		let mut fs_name_buf = [0u16; 256];
		let mut serial_number = 0;
		let mut max_component_length = 0;
		let mut flags = 0;

		let success = unsafe {
			GetVolumeInformationW(
				::windows::core::PCWSTR(wide_root.as_ptr()),
				None,
				Some(&mut serial_number),
				Some(&mut max_component_length),
				Some(&mut flags),
				Some(&mut fs_name_buf),
			)
		};

		if success.is_err() {
			return FilesystemKind::Virtual("unreadable".into());
		}

		let fs_name = String::from_utf16_lossy(&fs_name_buf)
			.trim_matches(char::from(0))
			.to_string();

		let supports_reparse_points = flags & FILE_SUPPORTS_REPARSE_POINTS != 0;
		if smells_like_masqueraded_smb(&fs_name, supports_reparse_points, max_component_length) {
			return FilesystemKind::Network("smb-masquerade".into());
		}

		FilesystemKind::from_kind_str(&fs_name)
	}

	/// `subst` drive mappings: a DOS device resolving to `\??\X:\path` is a
	/// local alias the parent needs the real path for. One level only;
	/// nested substitutions are left unresolved.
	pub fn remaps() -> Result<Vec<(PathBuf, PathBuf)>, MountError> {
		let mut remaps = Vec::new();

		for letter in drive_letters() {
			let device = format!("{letter}:");
			let wide_device = wide(&device);
			let mut target_buf = [0u16; 1024];

			let len = unsafe {
				QueryDosDeviceW(
					::windows::core::PCWSTR(wide_device.as_ptr()),
					Some(&mut target_buf),
				)
			};
			if len == 0 {
				continue;
			}

			let target = String::from_utf16_lossy(&target_buf[..len as usize]);
			let target = target.trim_matches(char::from(0));

			if let Some(real) = target.strip_prefix("\\??\\") {
				// Real volumes resolve to \Device\...; only subst drives
				// carry a second drive-letter path here.
				if real.len() >= 2 && real.as_bytes()[1] == b':' {
					remaps.push((PathBuf::from(format!("{letter}:\\")), PathBuf::from(real)));
				}
			}
		}

		Ok(remaps)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pseudo_and_network_filesystems_are_rejected() {
		for kind in ["proc", "sysfs", "devtmpfs", "cgroup2", "nfs4", "cifs", "9p"] {
			assert!(
				!FilesystemKind::from_kind_str(kind).is_watchable(),
				"{kind} must not be watchable"
			);
		}
	}

	#[test]
	fn physical_and_local_fuse_are_watchable() {
		for kind in ["ext4", "btrfs", "xfs", "ntfs", "apfs", "fuseblk", "fuse.bindfs", "tmpfs"] {
			assert!(
				FilesystemKind::from_kind_str(kind).is_watchable(),
				"{kind} must be watchable"
			);
		}
	}

	#[test]
	fn remote_fuse_counts_as_network() {
		assert_eq!(
			FilesystemKind::from_kind_str("fuse.sshfs"),
			FilesystemKind::Network("fuse.sshfs".into())
		);
	}

	#[test]
	fn proc_mounts_parsing_with_escapes() {
		let table = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec 0 0
/dev/sdb1 /mnt/with\\040space ext4 rw 0 0
server:/export /data/remote nfs4 rw,addr=10.0.0.1 0 0
";
		let mounts = parse_proc_mounts(table);

		assert_eq!(mounts.len(), 4);
		assert_eq!(mounts[0].directory, PathBuf::from("/"));
		assert!(mounts[0].watchable());
		assert!(!mounts[1].watchable());
		assert_eq!(mounts[2].directory, PathBuf::from("/mnt/with space"));
		assert_eq!(mounts[3].kind, FilesystemKind::Network("nfs4".into()));
	}

	#[test]
	fn mount_output_parsing_reads_flags() {
		let output = "\
/dev/disk3s1 on / (apfs, sealed, local, read-only, journaled)
devfs on /dev (devfs, local, nobrowse)
//user@server/share on /Volumes/share (smbfs, nodev, nosuid, mounted by user)
";
		let mounts = parse_mount_output(output);

		assert_eq!(mounts.len(), 3);
		assert!(mounts[0].watchable());
		// devfs is local but neither journaled nor a real filesystem
		assert!(!mounts[1].watchable());
		assert!(!mounts[2].flags.local);
		assert!(!mounts[2].watchable());
	}

	#[test]
	fn deepest_mount_wins() {
		let mounts = vec![
			MountPoint::new("/", FilesystemKind::from_kind_str("ext4")),
			MountPoint::new("/data", FilesystemKind::from_kind_str("xfs")),
			MountPoint::new("/data/remote", FilesystemKind::from_kind_str("cifs")),
		];

		let mount = mount_for(&mounts, Path::new("/data/remote/dir")).unwrap();
		assert_eq!(mount.directory, PathBuf::from("/data/remote"));

		let mount = mount_for(&mounts, Path::new("/data/local")).unwrap();
		assert_eq!(mount.directory, PathBuf::from("/data"));
	}

	#[test]
	fn inner_mounts_are_strict() {
		let mounts = vec![
			MountPoint::new("/", FilesystemKind::from_kind_str("ext4")),
			MountPoint::new("/data", FilesystemKind::from_kind_str("xfs")),
			MountPoint::new("/data/remote", FilesystemKind::from_kind_str("nfs")),
		];

		let inside: Vec<_> = mounts_inside(&mounts, Path::new("/data"))
			.map(|m| m.directory.clone())
			.collect();
		assert_eq!(inside, vec![PathBuf::from("/data/remote")]);
	}

	#[test]
	fn masquerade_heuristic() {
		assert!(smells_like_masqueraded_smb("NTFS", false, 230));
		assert!(!smells_like_masqueraded_smb("NTFS", true, 230));
		assert!(!smells_like_masqueraded_smb("NTFS", false, 255));
		assert!(!smells_like_masqueraded_smb("exFAT", false, 230));
	}
}
