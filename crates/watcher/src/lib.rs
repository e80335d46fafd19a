//! Core of the fs-notifier daemon.
//!
//! A parent process hands over a set of watch roots through a line protocol
//! on stdin; this crate maps them onto the platform's change-notification
//! facility (inotify, FSEvents or ReadDirectoryChangesW) and streams
//! change/overflow/removal reports back on stdout. Delivery is best effort:
//! the parent owns any stronger guarantees.

pub mod mounts;
pub mod protocol;
pub mod pump;
pub mod roots;
pub mod service;
pub mod tree;

pub use service::{
	Service, ServiceConfig, ServiceError, DEFAULT_OVERFLOW_DEBOUNCE, DEFAULT_POLL_INTERVAL,
};
