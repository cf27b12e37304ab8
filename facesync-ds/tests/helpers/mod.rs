//! Test helpers shared by the facesync-ds integration suites

#![allow(dead_code)]

pub mod fixtures;
pub mod mock_device;

pub use fixtures::{png_bytes, roster_entry, sync_config, write_roster};
pub use mock_device::{MockDevice, PASSWORD, USERNAME};
