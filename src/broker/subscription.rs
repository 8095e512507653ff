//! Waiting for enqueue notifications without polling.
//!
//! A notification is a hint that a task *may* be claimable. Subscribers must
//! still claim, and must treat "nothing claimed" as normal: another worker may
//! have won, or the row may carry a future `eta`.

use std::time::Duration;

use futures::Stream;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BrokerError;

/// Why [`Subscription::next_wake`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake {
    /// A task was committed to a subscribed queue.
    Notified { queue_channel: String, message_id: Uuid },
    /// The listener connection was lost and re-established; notifications
    /// sent in between are gone, so callers should sweep.
    Reconnected,
    /// Nothing arrived before the deadline.
    TimedOut,
}

/// A `LISTEN` session on one or more enqueue channels.
pub struct Subscription {
    listener: PgListener,
    channels: Vec<String>,
}

impl Subscription {
    pub(crate) async fn open(pool: &PgPool, channels: Vec<String>) -> Result<Self, BrokerError> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener
            .listen_all(channels.iter().map(String::as_str))
            .await?;
        debug!(channels = ?channels, "Listening for enqueue notifications");
        Ok(Self { listener, channels })
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Waits up to `max_wait` for the next notification.
    ///
    /// On a lost connection the listener reconnects and re-subscribes on the
    /// next call; this call reports [`Wake::Reconnected`].
    pub async fn next_wake(&mut self, max_wait: Duration) -> Result<Wake, BrokerError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let received = match tokio::time::timeout_at(deadline, self.listener.try_recv()).await
            {
                Err(_) => return Ok(Wake::TimedOut),
                Ok(received) => received?,
            };

            let Some(notification) = received else {
                warn!("Notification listener connection lost, reconnecting");
                return Ok(Wake::Reconnected);
            };

            match notification.payload().parse::<Uuid>() {
                Ok(message_id) => {
                    return Ok(Wake::Notified {
                        queue_channel: notification.channel().to_string(),
                        message_id,
                    })
                }
                Err(_) => {
                    warn!(
                        channel = notification.channel(),
                        payload = notification.payload(),
                        "Ignoring notification with malformed payload"
                    );
                }
            }
        }
    }

    /// Turns the subscription into an endless stream of wakes.
    ///
    /// Each item waits at most `max_wait`, so the stream also ticks with
    /// [`Wake::TimedOut`] when idle. It ends after the first error.
    pub fn into_stream(mut self, max_wait: Duration) -> impl Stream<Item = Result<Wake, BrokerError>> {
        async_stream::stream! {
            loop {
                match self.next_wake(max_wait).await {
                    Ok(wake) => yield Ok(wake),
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}
