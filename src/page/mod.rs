//! Page formats and validation.
//!
//! This module contains:
//! - [`Frame`] - The raw 16KB data container
//! - [`layout`] - Fixed on-page offsets, system records, directory
//! - [`records`] - Record format and [`FieldLayout`]
//! - [`build`] - In-place record appends for manufacturing pages
//! - [`checksum`] - Corruption detection and checksum stamping

pub mod build;
pub mod checksum;
mod frame;
pub mod layout;
pub mod records;

pub use frame::Frame;
pub use layout::PageType;
pub use records::{ColVal, Field, FieldKind, FieldLayout};
