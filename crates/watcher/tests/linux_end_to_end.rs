//! End-to-end protocol runs against the real inotify backend.

#![cfg(target_os = "linux")]

use std::{path::Path, sync::Arc, time::Duration};

use fsn_watcher::{
	mounts::SystemMounts,
	pump::NativePump,
	service::{Service, ServiceConfig, ServiceError},
};
use tokio::{
	io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines},
	task::JoinHandle,
	time::timeout,
};

const WIRE_TIMEOUT: Duration = Duration::from_secs(10);

struct Daemon {
	commands: DuplexStream,
	reports: Lines<BufReader<DuplexStream>>,
	handle: JoinHandle<Result<(), ServiceError>>,
}

fn spawn_daemon() -> Daemon {
	let (commands, stdin) = tokio::io::duplex(8192);
	let (stdout, reports) = tokio::io::duplex(8192);
	let (events_tx, events_rx) = async_channel::unbounded();

	let pump = NativePump::new(events_tx, Duration::from_millis(100))
		.expect("inotify must be available");
	let service = Service::new(
		pump,
		Arc::new(SystemMounts),
		ServiceConfig {
			poll_interval: Duration::from_millis(200),
		},
	);

	let handle =
		tokio::spawn(async move { service.run(events_rx, BufReader::new(stdin), stdout).await });

	Daemon {
		commands,
		reports: BufReader::new(reports).lines(),
		handle,
	}
}

impl Daemon {
	async fn send(&mut self, text: &str) {
		self.commands.write_all(text.as_bytes()).await.unwrap();
	}

	async fn send_roots(&mut self, roots: &[&Path]) {
		let mut block = String::from("ROOTS\n");
		for root in roots {
			block.push_str(&root.display().to_string());
			block.push('\n');
		}
		block.push_str("#\n");
		self.send(&block).await;

		self.expect_lines(&["UNWATCHEABLE", "#", "REMAP", "#"]).await;
	}

	async fn next_line(&mut self) -> String {
		timeout(WIRE_TIMEOUT, self.reports.next_line())
			.await
			.expect("timed out waiting for a report")
			.unwrap()
			.expect("report stream ended unexpectedly")
	}

	async fn expect_lines(&mut self, expected: &[&str]) {
		for want in expected {
			let got = self.next_line().await;
			assert_eq!(&got, want);
		}
	}

	/// Reads reports until `tag` is seen for `path`, tolerating unrelated
	/// reports in between (kernels differ in how chatty they are).
	async fn await_report(&mut self, tag: &str, path: &Path) {
		let want_path = path.display().to_string();
		loop {
			let got_tag = self.next_line().await;
			if got_tag == "RESET" || got_tag == "GIVEUP" {
				continue;
			}
			let got_path = self.next_line().await;
			if got_tag == tag && got_path == want_path {
				return;
			}
		}
	}

	async fn exit(mut self) {
		self.send("EXIT\n").await;
		self.handle.await.unwrap().unwrap();
	}
}

#[tokio::test]
async fn create_change_delete_round_trip() {
	let root = tempfile::tempdir().unwrap();
	let file = root.path().join("a.txt");

	let mut daemon = spawn_daemon();
	daemon.send_roots(&[root.path()]).await;

	std::fs::write(&file, b"first").unwrap();
	daemon.await_report("CREATE", &file).await;
	daemon.await_report("CHANGE", &file).await;

	let mut handle = std::fs::OpenOptions::new()
		.append(true)
		.open(&file)
		.unwrap();
	std::io::Write::write_all(&mut handle, b"more").unwrap();
	drop(handle);
	daemon.await_report("CHANGE", &file).await;

	std::fs::remove_file(&file).unwrap();
	daemon.await_report("DELETE", &file).await;

	daemon.exit().await;
}

#[tokio::test]
async fn missing_root_is_picked_up_by_polling() {
	let parent = tempfile::tempdir().unwrap();
	let root = parent.path().join("x");

	let mut daemon = spawn_daemon();
	daemon.send_roots(&[root.as_path()]).await;

	// the root does not exist yet; creating it must surface without a new
	// ROOTS command
	std::fs::create_dir(&root).unwrap();
	daemon.await_report("CREATE", &root).await;
	daemon.await_report("CHANGE", &root).await;

	// and the recovered root must actually be watched
	let file = root.join("after.txt");
	std::fs::write(&file, b"x").unwrap();
	daemon.await_report("CREATE", &file).await;

	daemon.exit().await;
}

#[tokio::test]
async fn new_subdirectories_join_the_watch_tree() {
	let root = tempfile::tempdir().unwrap();
	let sub = root.path().join("sub");

	let mut daemon = spawn_daemon();
	daemon.send_roots(&[root.path()]).await;

	std::fs::create_dir(&sub).unwrap();
	daemon.await_report("CREATE", &sub).await;

	// events from inside the new directory prove its watch is live
	let file = sub.join("inner.txt");
	std::fs::write(&file, b"x").unwrap();
	daemon.await_report("CREATE", &file).await;

	daemon.exit().await;
}

#[tokio::test]
async fn flat_roots_ignore_deep_changes() {
	let root = tempfile::tempdir().unwrap();
	let sub = root.path().join("sub");
	std::fs::create_dir(&sub).unwrap();

	let mut daemon = spawn_daemon();

	let mut block = String::from("ROOTS\n|");
	block.push_str(&root.path().display().to_string());
	block.push_str("\n#\n");
	daemon.send(&block).await;
	daemon
		.expect_lines(&["UNWATCHEABLE", "#", "REMAP", "#"])
		.await;

	// deep change first: it must never appear
	std::fs::write(sub.join("deep.txt"), b"x").unwrap();

	// direct child change arrives as usual
	let direct = root.path().join("direct.txt");
	std::fs::write(&direct, b"x").unwrap();
	daemon.await_report("CREATE", &direct).await;

	daemon.exit().await;
}

#[tokio::test]
async fn repeated_roots_commands_are_idempotent() {
	let root = tempfile::tempdir().unwrap();

	let mut daemon = spawn_daemon();
	daemon.send_roots(&[root.path()]).await;
	daemon.send_roots(&[root.path()]).await;

	// the rebuilt tree still delivers
	let file = root.path().join("a.txt");
	std::fs::write(&file, b"x").unwrap();
	daemon.await_report("CREATE", &file).await;

	daemon.exit().await;
}
