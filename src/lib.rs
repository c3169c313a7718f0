#![warn(clippy::pedantic, clippy::nursery, clippy::cargo, clippy::perf)]

//! # `multiproc_metrics`
//!
//! One set of Prometheus counters shared by every worker process on a host.
//!
//! Each process builds a [`Collector`] with the same lock and socket paths and calls
//! [`Collector::start`]. The first to take an advisory lock on the lock file becomes the
//! leader: it owns the [`Registry`] and serves it on a Unix socket. Every other process
//! becomes a follower that forwards its increments to the leader through a background queue
//! and asks the leader when queried. Callers see the same API either way.
//!
//! Counters can be used directly through [`Collector::counter`], or through the
//! [`metrics`](https://docs.rs/metrics) facade by installing a [`CollectorRecorder`].
//!
//! ## Wire format
//!
//! Requests are framed as `$<len>\r\n<op>\r\n<arg>\r\n...\r\n`, where `<len>` counts the
//! payload between the header and the final `\r\n`. A single `?` byte asks for the
//! exposition text, which comes back as `<len>\r\n<text>\r\n`.
//!
//! This crate relies on `flock` and Unix domain sockets, so it only supports Unix platforms.

mod collector;
mod config;
mod counter;
mod error;
mod events;
mod labels;
mod recorder;
mod registry;

pub use collector::{Collector, Role};
pub use config::{CollectorConfig, LOCK_PATH_ENV, SOCKET_PATH_ENV};
pub use counter::Counter;
pub use error::{CollectorError, FrameError};
pub use events::{Frame, MetricEvent, MetricKind, decode, decode_response, encode_response};
pub use labels::LabelSet;
pub use recorder::CollectorRecorder;
pub use registry::{Entry, Registry};

/// Content type of the text returned by [`Collector::query`].
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";
