//! Roster identities as delivered by the upstream record store

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::services::transcoder::ProcessedPhoto;

/// Enrollment kind; a SECONDARY record overrides a PRIMARY one for the same invite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityKind {
    Primary,
    Secondary,
}

impl IdentityKind {
    /// Higher value wins when two records share an invite
    fn priority(self) -> u8 {
        match self {
            IdentityKind::Primary => 0,
            IdentityKind::Secondary => 1,
        }
    }
}

/// Optional contact fields carried through to the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// A person to enroll on devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Device-facing user id; may be rotated upstream
    pub identity_id: String,
    /// Stable cross-device key
    pub invite_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ref: Option<String>,
    #[serde(default)]
    pub contact: Contact,
    pub kind: IdentityKind,
}

/// One row of the upstream roster: an identity plus where its photo lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    #[serde(flatten)]
    pub identity: Identity,
    #[serde(default)]
    pub photo_source_url: Option<String>,
}

/// Identity whose photo is ready to send
#[derive(Debug, Clone)]
pub struct PreparedIdentity {
    pub identity: Identity,
    pub photo: ProcessedPhoto,
}

/// Collapse a raw roster to one entry per invite
///
/// SECONDARY beats PRIMARY; among equal kinds the later record wins. Output keeps
/// the position of each invite's first appearance so runs are deterministic.
pub fn merge_roster(entries: Vec<RosterEntry>) -> Vec<RosterEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut chosen: HashMap<String, RosterEntry> = HashMap::new();

    for entry in entries {
        let invite = entry.identity.invite_id.clone();
        match chosen.get(&invite) {
            Some(existing)
                if existing.identity.kind.priority() > entry.identity.kind.priority() =>
            {
                tracing::debug!(
                    invite_id = %invite,
                    kept = %existing.identity.identity_id,
                    dropped = %entry.identity.identity_id,
                    "Keeping higher-priority roster record"
                );
            }
            Some(_) => {
                chosen.insert(invite, entry);
            }
            None => {
                order.push(invite.clone());
                chosen.insert(invite, entry);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|invite| chosen.remove(&invite))
        .collect()
}
