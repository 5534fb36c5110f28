use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, warn, Span};
use tracing_futures::Instrument;

use crate::error::TokenAcquisitionError;
use crate::types::Token;

/// Obtains a new token from upstream
///
/// `now` is the instant the refresh started; tokens anchor their expiry to it.
#[async_trait]
pub(crate) trait Refresh: Send + Sync + 'static {
    async fn refresh(&self, now: DateTime<Utc>) -> Result<Token, TokenAcquisitionError>;
}

pub(crate) trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

type Outcome = Result<Arc<Token>, TokenAcquisitionError>;

/// Caches the token produced by a [`Refresh`] and deduplicates concurrent refreshes
///
/// Cache hits only take a read lock. On a miss, callers serialize on `in_flight`, re-check the
/// cache and then either join the running refresh or start a new one. The refresh runs in its
/// own task, so a caller that stops waiting never aborts it. Errors are handed to everyone
/// waiting on that refresh but are not cached.
pub(crate) struct TokenCache<R> {
    inner: Arc<Inner<R>>,
}

struct Inner<R> {
    refresher: R,
    clock: Arc<dyn Clock>,
    skew: TimeDelta,
    token: RwLock<Option<Arc<Token>>>,
    in_flight: Mutex<Option<watch::Receiver<Option<Outcome>>>>,
}

impl<R: Refresh> TokenCache<R> {
    pub(crate) fn new(refresher: R, skew: TimeDelta) -> Self {
        Self::with_clock(refresher, skew, Arc::new(SystemClock))
    }

    pub(crate) fn with_clock(refresher: R, skew: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                refresher,
                clock,
                skew,
                token: RwLock::new(None),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn refresher(&self) -> &R {
        &self.inner.refresher
    }

    pub(crate) async fn get(&self) -> Result<Arc<Token>, TokenAcquisitionError> {
        if let Some(token) = self.inner.cached().await {
            return Ok(token);
        }

        let mut rx = {
            let mut in_flight = self.inner.in_flight.lock().await;
            // A refresh may have finished while we waited for the lock
            if let Some(token) = self.inner.cached().await {
                return Ok(token);
            }

            // A closed channel means the refresh task died without publishing
            match in_flight.as_ref().filter(|rx| rx.has_changed().is_ok()) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *in_flight = Some(rx.clone());
                    let inner = self.inner.clone();
                    tokio::spawn(inner.refresh(tx).instrument(Span::current()));
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TokenAcquisitionError::Interrupted)?
            .clone();
        outcome.unwrap_or(Err(TokenAcquisitionError::Interrupted))
    }
}

impl<R> Clone for TokenCache<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for TokenCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("refresher", &self.inner.refresher)
            .field("skew", &self.inner.skew)
            .finish_non_exhaustive()
    }
}

impl<R: Refresh> Inner<R> {
    async fn cached(&self) -> Option<Arc<Token>> {
        let now = self.clock.now();
        self.token
            .read()
            .await
            .as_ref()
            .filter(|token| token.is_fresh_at(now, self.skew))
            .cloned()
    }

    async fn refresh(self: Arc<Self>, tx: watch::Sender<Option<Outcome>>) {
        let now = self.clock.now();
        debug!(%now, "refreshing token");
        let outcome = match self.refresher.refresh(now).await {
            Ok(token) => {
                let token = Arc::new(token);
                if !token.is_fresh_at(now, self.skew) {
                    warn!(
                        expires_at = %token.expires_at(),
                        "new token expires within the refresh skew"
                    );
                }
                *self.token.write().await = Some(token.clone());
                Ok(token)
            }
            Err(err) => {
                warn!(?err, "token refresh failed");
                Err(err)
            }
        };

        self.in_flight.lock().await.take();
        tx.send_replace(Some(outcome));
    }
}
