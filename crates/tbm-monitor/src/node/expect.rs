//! Request/response on top of the event stream.
//!
//! An `Expectation` is armed before the request is sent so that a reply
//! arriving immediately is not missed. It captures at most one line, the
//! first matching one after arming, and owns the bus registration that
//! feeds it: the listener is removed when the wait ends, however it ends,
//! or when the expectation is dropped unwaited.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::sleep;
use tracing::debug;

use tbm_protocol::{expect_pattern, LineMatch};

use super::Node;
use crate::bus::Subscription;
use crate::channel::{self, ChannelState};
use crate::error::{MonitorError, Result};

/// Per-step reply timeout of `send_sequence_to_app`.
pub const DEFAULT_SEQUENCE_TIMEOUT: Duration = Duration::from_secs(3);

/// Attempts per step of `send_sequence_to_app`.
pub const DEFAULT_SEQUENCE_TRIES: u32 = 4;

/// A pending one-shot wait for a line from one node.
#[must_use = "an expectation does nothing unless waited on"]
pub struct Expectation {
    node: String,
    pattern: String,
    reply: oneshot::Receiver<LineMatch>,
    subscription: Subscription,
    channel: watch::Receiver<ChannelState>,
}

impl Expectation {
    /// Waits up to `limit` for the matching line.
    ///
    /// Returns `Ok(None)` on timeout and `Err(ChannelClosed)` if the
    /// down-channel is lost first. The listener is gone when this returns.
    pub async fn wait(self, limit: Duration) -> Result<Option<LineMatch>> {
        let Self {
            node,
            pattern,
            reply,
            subscription,
            channel,
        } = self;

        let outcome = tokio::select! {
            biased;
            received = reply => Ok(received.ok()),
            _ = sleep(limit) => Ok(None),
            _ = channel::lost(channel) => Err(MonitorError::ChannelClosed),
        };
        subscription.cancel();

        match &outcome {
            Ok(Some(_)) => debug!(node = %node, pattern = %pattern, "Expectation met"),
            Ok(None) => debug!(node = %node, pattern = %pattern, ?limit, "Expectation timed out"),
            Err(e) => debug!(node = %node, pattern = %pattern, error = %e, "Expectation failed"),
        }
        outcome
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("node", &self.node)
            .field("pattern", &self.pattern)
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl Node {
    /// Arms a wait for the next line from this node matching `pattern`.
    ///
    /// `pattern` is a regular expression matched anywhere after the address
    /// prefix of each record. Lines received before arming never match.
    pub fn expect(&self, pattern: &str) -> Result<Expectation> {
        let addr = self.address().ok_or_else(|| MonitorError::NodeUnseen {
            gid: self.gid().clone(),
        })?;
        let regex = expect_pattern(&addr.ip, addr.port, pattern)?;

        let ctx = &self.inner.ctx;
        let channel = ctx.channel.watch_state();
        let (tx, reply) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let subscription = ctx.bus.subscribe_scoped(regex, move |m| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(m.clone());
            }
        });

        Ok(Expectation {
            node: self.to_string(),
            pattern: pattern.to_string(),
            reply,
            subscription,
            channel,
        })
    }

    /// Sends `message` to the application and waits for `pattern`.
    ///
    /// Each of the `tries` attempts arms a fresh expectation, sends the
    /// message and waits up to `limit`. Returns `true` on the first reply
    /// and `false` once every attempt timed out.
    pub async fn send_to_app_and_expect(
        &self,
        message: &str,
        pattern: &str,
        limit: Duration,
        tries: u32,
    ) -> Result<bool> {
        for attempt in 1..=tries {
            let expectation = self.expect(pattern)?;
            self.send_to_app(message, 0).await?;
            if expectation.wait(limit).await?.is_some() {
                return Ok(true);
            }
            debug!(node = %self, attempt, tries, msg = %message, "No reply from application");
        }
        Ok(false)
    }

    /// Runs `(message, pattern)` steps in order, stopping at the first step
    /// that gets no reply.
    pub async fn send_sequence_to_app<S>(
        &self,
        steps: &[(S, S)],
        limit: Duration,
        tries: u32,
    ) -> Result<bool>
    where
        S: AsRef<str>,
    {
        for (index, (message, pattern)) in steps.iter().enumerate() {
            let replied = self
                .send_to_app_and_expect(message.as_ref(), pattern.as_ref(), limit, tries)
                .await?;
            if !replied {
                debug!(node = %self, step = index, "Sequence stopped");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
