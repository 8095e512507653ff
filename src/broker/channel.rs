//! Notification channel names and advisory lock keys.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::BrokerError;

/// PostgreSQL truncates identifiers (and so channel names) past this length.
pub const MAX_CHANNEL_LEN: usize = 63;

static QUEUE_NAME_RE: OnceLock<Regex> = OnceLock::new();
static ACTOR_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// Suffix naming what a channel-style identifier is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelIdentifier {
    Enqueue,
    Lock,
}

impl ChannelIdentifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Lock => "lock",
        }
    }
}

impl fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{prefix}.tasks.{queue}.{identifier}`
pub fn channel_name(prefix: &str, queue_name: &str, identifier: ChannelIdentifier) -> String {
    format!("{}.tasks.{}.{}", prefix, queue_name, identifier)
}

/// Checks a queue name's characters and that its enqueue channel fits.
pub fn validate_queue_name(prefix: &str, queue_name: &str) -> Result<(), BrokerError> {
    let re = QUEUE_NAME_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_:\-]+$").expect("Invalid queue name regex"));
    if !re.is_match(queue_name) {
        return Err(BrokerError::InvalidQueueName(queue_name.to_string()));
    }

    let channel = channel_name(prefix, queue_name, ChannelIdentifier::Enqueue);
    if channel.len() > MAX_CHANNEL_LEN {
        return Err(BrokerError::ChannelTooLong {
            len: channel.len(),
            channel,
        });
    }
    Ok(())
}

/// Actor names are dotted paths such as `mail.send_welcome`.
pub fn validate_actor_name(actor_name: &str) -> Result<(), BrokerError> {
    let re = ACTOR_NAME_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*(\.[A-Za-z_][A-Za-z0-9_\-]*)*$")
            .expect("Invalid actor name regex")
    });
    if actor_name.len() > 255 || !re.is_match(actor_name) {
        return Err(BrokerError::InvalidActorName(actor_name.to_string()));
    }
    Ok(())
}

/// Maps a name onto the 64-bit advisory lock keyspace.
pub fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Advisory lock key electing the scheduler leader for a prefix.
pub fn scheduler_lock_key(prefix: &str) -> i64 {
    lock_key(&channel_name(prefix, "scheduler", ChannelIdentifier::Lock))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_format() {
        assert_eq!(
            channel_name("pgtask", "default", ChannelIdentifier::Enqueue),
            "pgtask.tasks.default.enqueue"
        );
        assert_eq!(
            channel_name("app", "mail", ChannelIdentifier::Lock),
            "app.tasks.mail.lock"
        );
    }

    #[test]
    fn test_validate_queue_name() {
        assert!(validate_queue_name("pgtask", "default").is_ok());
        assert!(validate_queue_name("pgtask", "mail:high-priority").is_ok());
        assert!(validate_queue_name("pgtask", "").is_err());
        assert!(validate_queue_name("pgtask", "has space").is_err());
        assert!(validate_queue_name("pgtask", "dot.ted").is_err());
    }

    #[test]
    fn test_channel_length_limit() {
        // "pgtask.tasks." + queue + ".enqueue" = 21 + queue
        let fits = "q".repeat(MAX_CHANNEL_LEN - 21);
        assert!(validate_queue_name("pgtask", &fits).is_ok());

        let too_long = "q".repeat(MAX_CHANNEL_LEN - 20);
        assert!(matches!(
            validate_queue_name("pgtask", &too_long),
            Err(BrokerError::ChannelTooLong { len: 64, .. })
        ));
    }

    #[test]
    fn test_validate_actor_name() {
        assert!(validate_actor_name("echo").is_ok());
        assert!(validate_actor_name("mail.send_welcome").is_ok());
        assert!(validate_actor_name("").is_err());
        assert!(validate_actor_name("bad..name").is_err());
        assert!(validate_actor_name("9lives").is_err());
    }

    #[test]
    fn test_lock_key_is_stable_and_distinct() {
        assert_eq!(lock_key("a"), lock_key("a"));
        assert_ne!(lock_key("a"), lock_key("b"));
        assert_ne!(scheduler_lock_key("pgtask"), scheduler_lock_key("other"));
    }
}
