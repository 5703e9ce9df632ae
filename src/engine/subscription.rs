//! Reconnecting per-account order event subscriptions
//!
//! Each account gets one background task cycling through
//! `Connecting -> Connected -> Disconnected -> Connecting ...`. Reconnect delays
//! grow exponentially up to a cap and reset after every successful connect.
//! Events are forwarded onto the engine's bounded queue; when the queue is full the
//! task waits rather than dropping anything.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::grid::{with_deadline, AccountKey, ExchangeGateway, GridError, GridResult, UserOrderEvent};

/// Observable connection lifecycle of one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected { last_error: Option<String> },
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles the one after, up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Handle to a running account subscription
pub struct AccountSubscription {
    account: AccountKey,
    gateway: Arc<dyn ExchangeGateway>,
    state_rx: watch::Receiver<ConnectionState>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    call_timeout: Duration,
}

impl AccountSubscription {
    /// Start the subscription task for the gateway's account
    pub fn spawn(
        gateway: Arc<dyn ExchangeGateway>,
        events: mpsc::Sender<UserOrderEvent>,
        backoff: Backoff,
        call_timeout: Duration,
    ) -> Self {
        let account = gateway.account();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_subscription(
            gateway.clone(),
            events,
            backoff,
            call_timeout,
            state_tx,
            stop_rx,
        ));

        Self {
            account,
            gateway,
            state_rx,
            stop_tx,
            handle,
            call_timeout,
        }
    }

    pub fn account(&self) -> &AccountKey {
        &self.account
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Receiver for connection state changes
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the task and close the venue stream. Once this returns no further
    /// event from this subscription reaches the queue.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!("Subscription task for {} ended abnormally: {}", self.account, e);
        }

        if let Err(e) = with_deadline(
            "unsubscribe_account_orders",
            self.call_timeout,
            self.gateway.unsubscribe_account_orders(),
        )
        .await
        {
            warn!("Unsubscribe for {} failed: {}", self.account, e);
        }
        info!("Subscription for {} stopped", self.account);
    }
}

/// Wait for the outcome of the current connection attempt
pub async fn wait_connected(
    mut state_rx: watch::Receiver<ConnectionState>,
    deadline: Duration,
) -> GridResult<()> {
    let outcome = tokio::time::timeout(deadline, async {
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected { last_error } => {
                    return Err(GridError::Subscription(
                        last_error.unwrap_or_else(|| "subscription closed".into()),
                    ))
                }
                ConnectionState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(GridError::Subscription("subscription task exited".into()));
            }
        }
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(GridError::Timeout {
            operation: "subscribe_account_orders".into(),
            after_ms: deadline.as_millis() as u64,
        }),
    }
}

/// Resolves when a stop is requested or the handle is dropped
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    while !*stop_rx.borrow_and_update() {
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn run_subscription(
    gateway: Arc<dyn ExchangeGateway>,
    events: mpsc::Sender<UserOrderEvent>,
    mut backoff: Backoff,
    call_timeout: Duration,
    state_tx: watch::Sender<ConnectionState>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let account = gateway.account();

    'reconnect: loop {
        state_tx.send_replace(ConnectionState::Connecting);
        debug!("Connecting order stream for {}", account);

        let connected = tokio::select! {
            _ = stopped(&mut stop_rx) => break 'reconnect,
            result = with_deadline(
                "subscribe_account_orders",
                call_timeout,
                gateway.subscribe_account_orders(),
            ) => result,
        };

        let last_error = match connected {
            Ok(mut stream) => {
                backoff.reset();
                state_tx.send_replace(ConnectionState::Connected);
                info!("Order stream connected for {}", account);

                loop {
                    let item = tokio::select! {
                        _ = stopped(&mut stop_rx) => break 'reconnect,
                        item = stream.next() => item,
                    };

                    match item {
                        Some(Ok(event)) => {
                            // Blocks while the queue is full
                            tokio::select! {
                                _ = stopped(&mut stop_rx) => break 'reconnect,
                                sent = events.send(event) => {
                                    if sent.is_err() {
                                        debug!("Event queue closed, ending subscription for {}", account);
                                        break 'reconnect;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream closed by venue".to_string(),
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        let delay = backoff.next_delay();
        warn!(
            "Order stream for {} disconnected: {}; reconnecting in {:?}",
            account, last_error, delay
        );
        state_tx.send_replace(ConnectionState::Disconnected {
            last_error: Some(last_error),
        });

        tokio::select! {
            _ = stopped(&mut stop_rx) => break 'reconnect,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state_tx.send_replace(ConnectionState::Disconnected { last_error: None });
}
