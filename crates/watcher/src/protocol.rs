//! The line protocol spoken with the parent process.
//!
//! Commands arrive on stdin, one per line; reports leave on stdout. Both
//! sides are newline-framed, so a path containing a newline cannot be
//! transported and is stripped before writing. Parsing is a small state
//! machine with no I/O of its own, the service loop feeds it one line at a
//! time.

use std::io;
use std::path::{Path, PathBuf};

use tokio::{
	io::{AsyncWrite, AsyncWriteExt, BufWriter},
	sync::Mutex,
};
use tracing::warn;

/// One requested watch root, as written by the parent.
///
/// A leading `|` on the protocol line marks the root as flat: only the
/// directory itself and its direct children are reported, nothing below.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RootSpec {
	pub path: PathBuf,
	pub recursive: bool,
}

impl RootSpec {
	pub fn parse(line: &str) -> Self {
		match line.strip_prefix('|') {
			Some(rest) => Self {
				path: PathBuf::from(rest),
				recursive: false,
			},
			None => Self {
				path: PathBuf::from(line),
				recursive: true,
			},
		}
	}
}

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
	Roots(Vec<RootSpec>),
	Exit,
}

/// Stdin command parser.
///
/// `ROOTS` opens a block of root-path lines terminated by `#`; `EXIT` asks
/// for clean shutdown. Anything else received while idle is logged and
/// dropped, per the protocol's tolerance for garbage between commands.
#[derive(Debug, Default)]
pub struct CommandParser {
	pending_roots: Option<Vec<RootSpec>>,
}

impl CommandParser {
	pub fn new() -> Self {
		Self::default()
	}

	/// True while inside an unterminated ROOTS block. The service treats
	/// EOF in this state as a protocol violation, which still maps to a
	/// clean exit.
	pub fn mid_block(&self) -> bool {
		self.pending_roots.is_some()
	}

	pub fn feed(&mut self, line: &str) -> Option<Command> {
		// Parents on Windows may frame with CRLF
		let line = line.strip_suffix('\r').unwrap_or(line);

		if let Some(roots) = self.pending_roots.as_mut() {
			return match line {
				"#" => self.pending_roots.take().map(Command::Roots),
				"" => None,
				_ => {
					roots.push(RootSpec::parse(line));
					None
				}
			};
		}

		match line {
			"ROOTS" => {
				self.pending_roots = Some(Vec::new());
				None
			}
			"EXIT" => Some(Command::Exit),
			"" => None,
			other => {
				warn!(line = other, "Ignoring unrecognized command line;");
				None
			}
		}
	}
}

/// Everything the daemon can say to the parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Report {
	Create(PathBuf),
	Change(PathBuf),
	Delete(PathBuf),
	Stats(PathBuf),
	/// The subtree under the path must be treated as entirely dirty.
	RecDirty(PathBuf),
	/// All previously reported state must be discarded.
	Reset,
	/// Fatal: the kernel notification facility is unavailable.
	GiveUp,
	/// Non-fatal diagnostic for the parent's log.
	Message(String),
}

impl Report {
	fn write_into(&self, buf: &mut String) {
		match self {
			Self::Create(path) => tagged_path(buf, "CREATE", path),
			Self::Change(path) => tagged_path(buf, "CHANGE", path),
			Self::Delete(path) => tagged_path(buf, "DELETE", path),
			Self::Stats(path) => tagged_path(buf, "STATS", path),
			Self::RecDirty(path) => tagged_path(buf, "RECDIRTY", path),
			Self::Reset => buf.push_str("RESET\n"),
			Self::GiveUp => buf.push_str("GIVEUP\n"),
			Self::Message(text) => {
				buf.push_str("MESSAGE\n");
				push_line(buf, text);
			}
		}
	}
}

fn tagged_path(buf: &mut String, tag: &str, path: &Path) {
	buf.push_str(tag);
	buf.push('\n');
	push_line(buf, &path.to_string_lossy());
}

// Newlines cannot survive line framing; strip rather than corrupt the stream.
fn push_line(buf: &mut String, text: &str) {
	buf.extend(text.chars().filter(|c| *c != '\n' && *c != '\r'));
	buf.push('\n');
}

/// Serializes report bursts onto stdout.
///
/// All writes for one burst happen under one lock acquisition and end with a
/// flush, so bursts from different tasks can never interleave and the parent
/// never waits on a buffered line.
#[derive(Debug)]
pub struct Reporter<W> {
	out: Mutex<BufWriter<W>>,
}

impl<W: AsyncWrite + Unpin> Reporter<W> {
	pub fn new(out: W) -> Self {
		Self {
			out: Mutex::new(BufWriter::new(out)),
		}
	}

	pub async fn send(&self, report: &Report) -> io::Result<()> {
		self.send_all(std::slice::from_ref(report)).await
	}

	/// Writes a burst of reports as one atomic unit.
	pub async fn send_all(&self, reports: &[Report]) -> io::Result<()> {
		if reports.is_empty() {
			return Ok(());
		}

		let mut buf = String::new();
		for report in reports {
			report.write_into(&mut buf);
		}

		let mut out = self.out.lock().await;
		out.write_all(buf.as_bytes()).await?;
		out.flush().await
	}

	/// The two-block response to a ROOTS command, written as one burst.
	pub async fn roots_response(
		&self,
		unwatchable: &[PathBuf],
		remap: &[(PathBuf, PathBuf)],
	) -> io::Result<()> {
		let mut buf = String::new();

		buf.push_str("UNWATCHEABLE\n");
		for path in unwatchable {
			push_line(&mut buf, &path.to_string_lossy());
		}
		buf.push_str("#\n");

		buf.push_str("REMAP\n");
		for (drive, target) in remap {
			push_line(&mut buf, &drive.to_string_lossy());
			push_line(&mut buf, &target.to_string_lossy());
		}
		buf.push_str("#\n");

		let mut out = self.out.lock().await;
		out.write_all(buf.as_bytes()).await?;
		out.flush().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn feed_all(parser: &mut CommandParser, lines: &[&str]) -> Vec<Command> {
		lines.iter().filter_map(|line| parser.feed(line)).collect()
	}

	#[test]
	fn roots_block_with_flatten_prefix() {
		let mut parser = CommandParser::new();
		let commands = feed_all(&mut parser, &["ROOTS", "/home/a", "|/home/b", "#"]);

		assert_eq!(
			commands,
			vec![Command::Roots(vec![
				RootSpec {
					path: PathBuf::from("/home/a"),
					recursive: true,
				},
				RootSpec {
					path: PathBuf::from("/home/b"),
					recursive: false,
				},
			])]
		);
		assert!(!parser.mid_block());
	}

	#[test]
	fn empty_roots_block() {
		let mut parser = CommandParser::new();
		assert_eq!(
			feed_all(&mut parser, &["ROOTS", "#"]),
			vec![Command::Roots(vec![])]
		);
	}

	#[test]
	fn crlf_framing_is_tolerated() {
		let mut parser = CommandParser::new();
		let commands = feed_all(&mut parser, &["ROOTS\r", "/tmp/x\r", "#\r", "EXIT\r"]);

		assert_eq!(commands.len(), 2);
		assert_eq!(commands[1], Command::Exit);
		match &commands[0] {
			Command::Roots(roots) => assert_eq!(roots[0].path, PathBuf::from("/tmp/x")),
			other => panic!("expected ROOTS, got {other:?}"),
		}
	}

	#[test]
	fn unknown_idle_lines_are_dropped() {
		let mut parser = CommandParser::new();
		assert_eq!(feed_all(&mut parser, &["PING", "", "GARBAGE 123"]), vec![]);
		assert_eq!(parser.feed("EXIT"), Some(Command::Exit));
	}

	#[test]
	fn unterminated_block_is_visible() {
		let mut parser = CommandParser::new();
		feed_all(&mut parser, &["ROOTS", "/tmp/x"]);
		assert!(parser.mid_block());
	}

	#[tokio::test]
	async fn reports_are_line_framed() {
		let reporter = Reporter::new(Vec::new());
		reporter
			.send_all(&[
				Report::Create(PathBuf::from("/tmp/w/a.txt")),
				Report::Change(PathBuf::from("/tmp/w/a.txt")),
				Report::Reset,
				Report::Message("watch limit reached".into()),
			])
			.await
			.unwrap();

		let out = reporter.out.into_inner().into_inner();
		assert_eq!(
			String::from_utf8(out).unwrap(),
			"CREATE\n/tmp/w/a.txt\nCHANGE\n/tmp/w/a.txt\nRESET\nMESSAGE\nwatch limit reached\n"
		);
	}

	#[tokio::test]
	async fn roots_response_blocks_are_terminated() {
		let reporter = Reporter::new(Vec::new());
		reporter
			.roots_response(
				&[PathBuf::from("/data/remote")],
				&[(PathBuf::from("X:\\"), PathBuf::from("C:\\real"))],
			)
			.await
			.unwrap();

		let out = reporter.out.into_inner().into_inner();
		assert_eq!(
			String::from_utf8(out).unwrap(),
			"UNWATCHEABLE\n/data/remote\n#\nREMAP\nX:\\\nC:\\real\n#\n"
		);
	}

	#[tokio::test]
	async fn empty_roots_response() {
		let reporter = Reporter::new(Vec::new());
		reporter.roots_response(&[], &[]).await.unwrap();

		let out = reporter.out.into_inner().into_inner();
		assert_eq!(String::from_utf8(out).unwrap(), "UNWATCHEABLE\n#\nREMAP\n#\n");
	}

	#[test]
	fn embedded_newlines_are_stripped() {
		let mut buf = String::new();
		Report::Create(PathBuf::from("/tmp/a\nb")).write_into(&mut buf);
		assert_eq!(buf, "CREATE\n/tmp/ab\n");
	}
}
