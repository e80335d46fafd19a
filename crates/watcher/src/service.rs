//! The service loop.
//!
//! One task owns the parser, the root manager and with it the whole watch
//! tree. Stdin lines, raw kernel events and the poll tick are merged into a
//! single stream, so the await on that stream is the only suspension point
//! and no source can starve another.

use std::{pin::pin, sync::Arc, time::Duration};

use futures::StreamExt;
use futures_concurrency::stream::Merge;
use thiserror::Error;
use tokio::{
	io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite},
	time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::{IntervalStream, LinesStream};
use tracing::{debug, info, warn};

use crate::{
	mounts::MountProvider,
	protocol::{Command, CommandParser, Report, Reporter},
	pump::{EventPump, PumpEvent, RawEvent},
	roots::{RootManager, TreeCorrupted},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_OVERFLOW_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
	/// How often missing roots are retried and debounced overflow marks
	/// are released.
	pub poll_interval: Duration,
}

impl Default for ServiceConfig {
	fn default() -> Self {
		Self {
			poll_interval: DEFAULT_POLL_INTERVAL,
		}
	}
}

#[derive(Error, Debug)]
pub enum ServiceError {
	#[error("report stream failed: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Corrupted(#[from] TreeCorrupted),
}

pub struct Service<P> {
	roots: RootManager<P>,
	parser: CommandParser,
	config: ServiceConfig,
}

impl<P: EventPump> Service<P> {
	pub fn new(pump: P, mounts: Arc<dyn MountProvider>, config: ServiceConfig) -> Self {
		Self {
			roots: RootManager::new(pump, mounts),
			parser: CommandParser::new(),
			config,
		}
	}

	/// Runs until EXIT, stdin EOF, or an unrecoverable failure.
	pub async fn run<R, W>(
		mut self,
		events_rx: async_channel::Receiver<RawEvent>,
		input: R,
		output: W,
	) -> Result<(), ServiceError>
	where
		R: AsyncBufRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		enum StreamMessage {
			Command(std::io::Result<String>),
			Eof,
			Kernel(RawEvent),
			Tick,
		}

		let reporter = Reporter::new(output);

		let mut poll_interval = interval_at(
			Instant::now() + self.config.poll_interval,
			self.config.poll_interval,
		);
		poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

		let mut messages = pin!((
			LinesStream::new(input.lines())
				.map(StreamMessage::Command)
				.chain(futures::stream::once(std::future::ready(
					StreamMessage::Eof
				))),
			events_rx.map(StreamMessage::Kernel),
			IntervalStream::new(poll_interval).map(|_| StreamMessage::Tick),
		)
			.merge());

		while let Some(message) = messages.next().await {
			match message {
				StreamMessage::Command(Ok(line)) => {
					let Some(command) = self.parser.feed(&line) else {
						continue;
					};

					match command {
						Command::Roots(specs) => {
							debug!(roots = specs.len(), "Replacing root set;");
							let outcome = match self.roots.update_roots(specs) {
								Ok(outcome) => outcome,
								Err(e) => return Self::give_up(&reporter, e).await,
							};

							reporter
								.roots_response(&outcome.unwatchable, &outcome.remap)
								.await?;
							reporter.send_all(&outcome.reports).await?;
						}
						Command::Exit => {
							info!("Parent requested exit;");
							break;
						}
					}
				}

				StreamMessage::Command(Err(e)) => {
					// An unreadable stdin and a closed one end the same way.
					warn!(?e, "Failed to read command stream, exiting;");
					break;
				}

				StreamMessage::Eof => {
					if self.parser.mid_block() {
						warn!("Command stream ended inside a ROOTS block;");
					} else {
						debug!("Command stream ended;");
					}
					break;
				}

				StreamMessage::Kernel(raw) => {
					let events = self.roots.translate(raw);
					self.dispatch(events, &reporter).await?;
				}

				StreamMessage::Tick => {
					let events = self.roots.pump_tick();
					self.dispatch(events, &reporter).await?;

					match self.roots.poll_missing() {
						Ok(reports) => reporter.send_all(&reports).await?,
						Err(e) => return Self::give_up(&reporter, e).await,
					}
				}
			}
		}

		self.roots.teardown();
		Ok(())
	}

	async fn dispatch<W: AsyncWrite + Unpin>(
		&mut self,
		events: Vec<PumpEvent>,
		reporter: &Reporter<W>,
	) -> Result<(), ServiceError> {
		for event in events {
			match self.roots.handle_event(event) {
				Ok(reports) => reporter.send_all(&reports).await?,
				Err(e) => return Self::give_up(reporter, e).await,
			}
		}

		Ok(())
	}

	async fn give_up<W: AsyncWrite + Unpin>(
		reporter: &Reporter<W>,
		cause: TreeCorrupted,
	) -> Result<(), ServiceError> {
		// Best effort: the parent may already be gone.
		reporter.send(&Report::GiveUp).await.ok();
		Err(cause.into())
	}
}
