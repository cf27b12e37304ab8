//! Registry mirror into an external key-value cache
//!
//! One set per device, `facesync:device:<device>`, holding `identityId:inviteId`
//! members. The mirror is a derived index: the registry writes it after the
//! primary commit, ignores its failures, and can replay it at any time.

use async_trait::async_trait;
use thiserror::Error;

/// Key prefix of per-device mirror sets
pub const MIRROR_KEY_PREFIX: &str = "facesync:device:";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Mirror unavailable: {0}")]
    Unavailable(String),

    #[error("Mirror command failed: {0}")]
    Command(String),

    #[error("Mirror operation timed out")]
    Timeout,
}

/// Set key for one device
pub fn mirror_key(device: &str) -> String {
    format!("{}{}", MIRROR_KEY_PREFIX, device)
}

/// Mirror member for one registry entry
pub fn mirror_member(identity_id: &str, invite_id: &str) -> String {
    format!("{}:{}", identity_id, invite_id)
}

#[async_trait]
pub trait RegistryMirror: Send + Sync {
    async fn add(&self, device: &str, members: &[String]) -> Result<(), MirrorError>;

    async fn remove(&self, device: &str, members: &[String]) -> Result<(), MirrorError>;

    /// Replace the device's whole set
    async fn replace(&self, device: &str, members: &[String]) -> Result<(), MirrorError>;

    async fn contains(&self, device: &str, member: &str) -> Result<bool, MirrorError>;
}

/// Mirror used when no external cache is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMirror;

#[async_trait]
impl RegistryMirror for NoopMirror {
    async fn add(&self, _device: &str, _members: &[String]) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn remove(&self, _device: &str, _members: &[String]) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn replace(&self, _device: &str, _members: &[String]) -> Result<(), MirrorError> {
        Ok(())
    }

    async fn contains(&self, _device: &str, _member: &str) -> Result<bool, MirrorError> {
        Ok(false)
    }
}

#[cfg(feature = "redis-mirror")]
pub use redis_mirror::RedisMirror;

#[cfg(feature = "redis-mirror")]
mod redis_mirror {
    use super::*;
    use redis::aio::MultiplexedConnection;
    use std::future::Future;
    use std::time::Duration;

    const OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

    /// Redis-backed mirror; one multiplexed connection per operation
    pub struct RedisMirror {
        client: redis::Client,
    }

    impl RedisMirror {
        pub fn new(url: &str) -> Result<Self, MirrorError> {
            let client =
                redis::Client::open(url).map_err(|e| MirrorError::Unavailable(e.to_string()))?;
            Ok(Self { client })
        }

        async fn with_connection<T, F, Fut>(&self, op: F) -> Result<T, MirrorError>
        where
            F: FnOnce(MultiplexedConnection) -> Fut,
            Fut: Future<Output = redis::RedisResult<T>>,
        {
            let work = async {
                let conn = self
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| MirrorError::Unavailable(e.to_string()))?;
                op(conn)
                    .await
                    .map_err(|e| MirrorError::Command(e.to_string()))
            };

            tokio::time::timeout(OPERATION_TIMEOUT, work)
                .await
                .map_err(|_| MirrorError::Timeout)?
        }
    }

    #[async_trait]
    impl RegistryMirror for RedisMirror {
        async fn add(&self, device: &str, members: &[String]) -> Result<(), MirrorError> {
            if members.is_empty() {
                return Ok(());
            }
            let key = mirror_key(device);
            self.with_connection(|mut conn| async move {
                redis::cmd("SADD")
                    .arg(&key)
                    .arg(members)
                    .query_async::<_, ()>(&mut conn)
                    .await
            })
            .await
        }

        async fn remove(&self, device: &str, members: &[String]) -> Result<(), MirrorError> {
            if members.is_empty() {
                return Ok(());
            }
            let key = mirror_key(device);
            self.with_connection(|mut conn| async move {
                redis::cmd("SREM")
                    .arg(&key)
                    .arg(members)
                    .query_async::<_, ()>(&mut conn)
                    .await
            })
            .await
        }

        async fn replace(&self, device: &str, members: &[String]) -> Result<(), MirrorError> {
            let key = mirror_key(device);
            self.with_connection(|mut conn| async move {
                let mut pipe = redis::pipe();
                pipe.atomic().cmd("DEL").arg(&key).ignore();
                if !members.is_empty() {
                    pipe.cmd("SADD").arg(&key).arg(members).ignore();
                }
                pipe.query_async::<_, ()>(&mut conn).await
            })
            .await
        }

        async fn contains(&self, device: &str, member: &str) -> Result<bool, MirrorError> {
            let key = mirror_key(device);
            self.with_connection(|mut conn| async move {
                redis::cmd("SISMEMBER")
                    .arg(&key)
                    .arg(member)
                    .query_async::<_, bool>(&mut conn)
                    .await
            })
            .await
        }
    }
}
