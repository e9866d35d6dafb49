//! Reconnect loop shared by the update feed and terminal connections.
//!
//! Cancellation is cooperative: the loop samples the [`CancelToken`] every
//! [`CANCEL_POLL_INTERVAL`] while a connection is open, so a cancelled
//! subscription closes within one interval plus the socket close time.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::stream::client::ConnectionError;

/// Upper bound on how long a cancel request goes unnoticed.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Pause between reconnect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);

/// Cloneable cancel flag for one subscription.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Token that is not cancelled yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent, visible to every clone.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`CancelToken::cancel`] was called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Resolves when the supervisor asks the current connection to close.
#[derive(Debug)]
pub struct CloseSignal {
    rx: oneshot::Receiver<()>,
}

impl CloseSignal {
    /// Signal paired with a sender that requests the close.
    pub fn pair() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Completes once a close was requested or the supervisor went away.
    /// Must not be awaited again after it completed.
    pub async fn requested(&mut self) {
        let _ = (&mut self.rx).await;
    }
}

/// Reconnect, cancel and login settings for one subscription.
pub struct SubscribeOptions {
    /// Reconnect after the connection closes.
    pub retry: bool,
    /// Pause between a close and the next attempt.
    pub retry_delay: Duration,
    /// Stops the subscription when cancelled.
    pub cancel: CancelToken,
    /// Runs once when the loop exits because of `cancel`.
    pub on_cancel: Option<Box<dyn FnOnce() + Send>>,
    /// How long a connection may wait for `LOGGED_IN`. `None` waits forever.
    pub login_timeout: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            retry: true,
            retry_delay: DEFAULT_RETRY_DELAY,
            cancel: CancelToken::new(),
            on_cancel: None,
            login_timeout: None,
        }
    }
}

impl SubscribeOptions {
    /// Default options stopped by `cancel`.
    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Reconnect after closes. On by default.
    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Pause between attempts.
    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Callback run once on cancellation.
    pub fn on_cancel(mut self, on_cancel: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(on_cancel));
        self
    }

    /// Ends an attempt that is not logged in after `login_timeout`.
    pub fn login_timeout(mut self, login_timeout: Duration) -> Self {
        self.login_timeout = Some(login_timeout);
        self
    }
}

/// Keeps a connection alive until cancelled.
///
/// `connect` opens and runs one connection until it closes. A connection
/// error is logged and handled exactly like a close. Returns once the token
/// is cancelled, or after the first close when `retry` is off.
pub async fn subscribe<F, Fut>(mut connect: F, options: SubscribeOptions)
where
    F: FnMut(CloseSignal) -> Fut,
    Fut: Future<Output = Result<(), ConnectionError>>,
{
    let SubscribeOptions {
        retry,
        retry_delay,
        cancel,
        mut on_cancel,
        login_timeout: _,
    } = options;
    let mut attempt: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            debug!(event = "subscription_cancelled", attempts = attempt);
            if let Some(on_cancel) = on_cancel.take() {
                on_cancel();
            }
            return;
        }

        attempt += 1;
        let (close_tx, close_signal) = CloseSignal::pair();
        let result = supervise_connection(connect(close_signal), close_tx, &cancel).await;
        match result {
            Ok(()) => debug!(event = "connection_closed", attempt),
            Err(err) => warn!(event = "connection_failed", attempt, error = %err),
        }

        if cancel.is_cancelled() {
            continue;
        }
        if !retry {
            return;
        }
        sleep_unless_cancelled(retry_delay, &cancel).await;
    }
}

/// Waits for one connection, asking it to close as soon as `cancel` is
/// observed. A connection still running one tick after the close request
/// is dropped.
async fn supervise_connection<Fut>(
    connection: Fut,
    close_tx: oneshot::Sender<()>,
    cancel: &CancelToken,
) -> Result<(), ConnectionError>
where
    Fut: Future<Output = Result<(), ConnectionError>>,
{
    tokio::pin!(connection);
    let mut close_tx = Some(close_tx);
    let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = &mut connection => return result,
            _ = ticker.tick() => {
                if !cancel.is_cancelled() {
                    continue;
                }
                match close_tx.take() {
                    Some(tx) => {
                        debug!(event = "connection_close_requested");
                        let _ = tx.send(());
                    }
                    None => {
                        warn!(event = "connection_dropped_after_close_request");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut sleep => return,
            _ = ticker.tick() => {
                if cancel.is_cancelled() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{subscribe, CancelToken, SubscribeOptions, CANCEL_POLL_INTERVAL};
    use crate::stream::client::ConnectionError;
    use crate::stream::handshake::HandshakeError;

    #[tokio::test]
    async fn cancelled_token_exits_before_connecting() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        let on_cancel = Arc::clone(&cancelled);
        subscribe(
            |_close| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            SubscribeOptions::with_cancel(cancel).on_cancel(move || {
                on_cancel.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_retry_returns_after_first_close() {
        let attempts = Arc::new(AtomicUsize::new(0));

        subscribe(
            |_close| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            SubscribeOptions::default().retry(false),
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_errors_are_retried_like_closes() {
        let cancel = CancelToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let token = cancel.clone();
        let counter = Arc::clone(&attempts);
        subscribe(
            move |_close| {
                if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                    token.cancel();
                }
                async { Err(ConnectionError::Handshake(HandshakeError::MissingCredentials)) }
            },
            SubscribeOptions::with_cancel(cancel).retry_delay(Duration::from_millis(1)),
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_ignoring_close_is_dropped_one_tick_later() {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });

        let started = Instant::now();
        subscribe(
            |_close| std::future::pending::<Result<(), ConnectionError>>(),
            SubscribeOptions::with_cancel(cancel),
        )
        .await;

        assert!(started.elapsed() <= Duration::from_millis(200) + CANCEL_POLL_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_closes_open_connection_within_one_poll_interval() {
        let cancel = CancelToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            token.cancel();
        });

        let counter = Arc::clone(&attempts);
        let started = Instant::now();
        subscribe(
            move |mut close| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    close.requested().await;
                    Ok(())
                }
            },
            SubscribeOptions::with_cancel(cancel),
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() <= Duration::from_millis(1200) + CANCEL_POLL_INTERVAL);
    }
}
