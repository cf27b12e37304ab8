//! Payload preparation
//!
//! Turns merged roster entries into device-ready identities: fetch the photo
//! through the cache, then transcode it. Identities whose photo cannot be
//! prepared are reported as processing failures and left out of the batch;
//! they never abort the cycle.

use futures::stream::{self, StreamExt};
use std::sync::Arc;

use crate::models::{PreparedIdentity, ProcessingFailure, RosterEntry};
use crate::services::image_cache::{ImageCache, PhotoError};
use crate::services::transcoder::{ProcessedPhoto, Transcoder};

/// Prepared batch plus the identities that fell out
#[derive(Debug, Default)]
pub struct PreparedRoster {
    pub prepared: Vec<PreparedIdentity>,
    pub failures: Vec<ProcessingFailure>,
}

pub struct PayloadPreparer {
    cache: Arc<ImageCache>,
    transcoder: Transcoder,
    max_concurrent: usize,
}

impl PayloadPreparer {
    pub fn new(cache: Arc<ImageCache>, transcoder: Transcoder, max_concurrent: usize) -> Self {
        Self {
            cache,
            transcoder,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    /// Prepare every entry, keeping roster order
    pub async fn prepare(&self, entries: Vec<RosterEntry>) -> PreparedRoster {
        let total = entries.len();
        let outcomes: Vec<(RosterEntry, Result<ProcessedPhoto, PhotoError>)> =
            stream::iter(entries)
                .map(|entry| async move {
                    let photo = self.prepare_one(&entry).await;
                    (entry, photo)
                })
                .buffered(self.max_concurrent)
                .collect()
                .await;

        let mut roster = PreparedRoster::default();
        for (entry, photo) in outcomes {
            match photo {
                Ok(photo) => roster.prepared.push(PreparedIdentity {
                    identity: entry.identity,
                    photo,
                }),
                Err(e) => {
                    tracing::warn!(
                        identity = %entry.identity.identity_id,
                        error = %e,
                        "Photo preparation failed, identity skipped this run"
                    );
                    roster.failures.push(ProcessingFailure {
                        identity_id: entry.identity.identity_id,
                        invite_id: entry.identity.invite_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            total,
            prepared = roster.prepared.len(),
            failed = roster.failures.len(),
            "Payload preparation complete"
        );
        roster
    }

    async fn prepare_one(&self, entry: &RosterEntry) -> Result<ProcessedPhoto, PhotoError> {
        let url = entry
            .photo_source_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(PhotoError::MissingSource)?;
        let local = self
            .cache
            .ensure_local(url, &entry.identity.identity_id)
            .await?;
        match self.transcoder.transcode(&local).await {
            // Cached bytes are not an image (error page, truncated body); drop them so
            // the next run fetches the source again
            Err(PhotoError::Decode(reason)) => {
                if let Err(e) = self.cache.evict(url).await {
                    tracing::warn!(url = %url, error = %e, "Could not evict undecodable photo");
                }
                Err(PhotoError::Decode(reason))
            }
            other => other,
        }
    }
}
