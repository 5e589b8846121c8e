//! Attach/scan core for UBI-formatted NAND/NOR media.
//!
//! This crate implements the hard first step of bringing up a UBI-style
//! flash translation layer: given a freshly opened erase-block medium, read
//! every PEB, decode its erase-counter and volume-identifier headers,
//! classify it, reconcile duplicate copies of logical eraseblocks, and
//! produce the in-memory [`attach::AttachInfo`] snapshot that the
//! wear-leveler, the logical-to-physical mapper, and the volume-table
//! reader consume to initialize themselves.
//!
//! The medium itself is abstracted behind [`medium::Medium`]; an in-memory
//! simulator with fault injection ([`medium::SimMedium`]) backs the test
//! suite. Optional features (fastmap dispatch, TLC statistics, low-page
//! backup recovery) are selected through [`attach::AttachOptions`].
//!
//! Whether a volume mounts read-write, read-only, or not at all is decided
//! here: headers are CRC-checked, sequence numbers and image stamps are
//! cross-validated, power-cut remnants are separated from genuine
//! corruption, and a post-scan self-check can verify the snapshot before it
//! is handed over.

pub mod attach;
pub mod error;
pub mod headers;
pub mod medium;

pub use attach::{attach, AttachInfo, AttachOptions, FastmapOutcome, FastmapReader};
pub use error::{AttachError, Result};
