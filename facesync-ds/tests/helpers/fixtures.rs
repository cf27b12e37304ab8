//! Roster, photo and config fixtures

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;

use facesync_ds::config::SyncConfig;
use facesync_ds::models::{Contact, Identity, IdentityKind, RosterEntry};

/// Small solid-colour PNG
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([196, 148, 120]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .unwrap();
    bytes
}

/// `u-<n>` / `inv-<n>` roster row
pub fn roster_entry(n: usize, photo_url: Option<String>) -> RosterEntry {
    RosterEntry {
        identity: Identity {
            identity_id: format!("u-{}", n),
            invite_id: format!("inv-{}", n),
            display_name: format!("Guest {}", n),
            document_ref: Some(format!("DOC-{:04}", n)),
            contact: Contact {
                email: Some(format!("guest{}@example.test", n)),
                phone: None,
            },
            kind: IdentityKind::Primary,
        },
        photo_source_url: photo_url,
    }
}

pub fn write_roster(path: &Path, entries: &[RosterEntry]) {
    std::fs::write(path, serde_json::to_vec_pretty(entries).unwrap()).unwrap();
}

/// Config for a file roster and the given device addresses, tuned for fast tests
pub fn sync_config(roster_path: &Path, devices: &[String], password: &str) -> SyncConfig {
    let mut toml_text = format!(
        r#"
        [roster]
        file = "{}"

        [device_defaults]
        username = "admin"
        request_timeout_secs = 5
        settle_delay_ms = 0
        retry_attempts = 1

        [photos]
        download_timeout_secs = 1
        max_concurrent_downloads = 4

        [orchestrator]
        device_timeout_secs = 60
        "#,
        roster_path.display()
    );
    for address in devices {
        toml_text.push_str(&format!(
            "\n[[devices]]\naddress = \"{}\"\npassword = \"{}\"\n",
            address, password
        ));
    }

    let config: SyncConfig = toml::from_str(&toml_text).unwrap();
    config.validate().unwrap();
    config
}
