//! vidforge library crate.
//!
//! Acquires a video from an upload, a direct link, a stream-manifest page or
//! a torrent, runs one ffmpeg operation over it and hands the result back to
//! whichever chat transport drives the [`orchestrator::Orchestrator`].

pub mod acquire;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod preferences;
pub mod progress;
pub mod session;
pub mod transcode;
pub mod utils;

pub use error::{Error, Result};
