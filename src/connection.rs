//! Connection state machine and configuration handshake.
//!
//! ```text
//!  Disconnected ──link up──▶ Connecting ──config complete──▶ Connected
//!       ▲                                                     │   ▲
//!       │ sleep timer / permanent loss      link lost, power  │   │ config complete
//!       └──────────────────────────── DeviceSleep ◀───saving──┘   │
//!                                          └──────────────────────┘
//! ```
//!
//! Entering `DeviceSleep` arms a timer of `ls_secs + sleep_margin`; any transition cancels it.
//! Registered [`StateObserver`]s hear every transition, in order, while the transition lock is
//! held. Observers must not call back into the state machine.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ConnectError, TransportError};
use crate::protobuf::{CONFIG_ONLY_NONCE, NODE_INFO_NONCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    /// Link is up but the configuration exchange has not finished.
    Connecting,
    Connected,
    /// Link dropped while the radio is expected to be light sleeping.
    DeviceSleep,
}

#[derive(Debug, Clone)]
pub struct ConnectionTuning {
    pub sleep_margin: Duration,
    pub config_timeout: Duration,
    pub config_attempts: u32,
    pub heartbeat: Option<Duration>,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            sleep_margin: Duration::from_secs(30),
            config_timeout: Duration::from_secs(10),
            config_attempts: 3,
            heartbeat: Some(Duration::from_secs(300)),
        }
    }
}

/// Power-related device settings learned during the config exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PowerSettings {
    pub is_power_saving: bool,
    pub is_router: bool,
    pub ls_secs: u32,
}

impl PowerSettings {
    pub fn light_sleep_enabled(&self) -> bool {
        self.is_power_saving || self.is_router
    }
}

pub trait StateObserver: Send + Sync {
    fn on_state_change(&self, from: ConnectionState, to: ConnectionState);
}

struct Guarded {
    power: PowerSettings,
    sleep_timer: Option<JoinHandle<()>>,
    generation: u64,
    observers: Vec<Arc<dyn StateObserver>>,
}

struct MachineInner {
    state_tx: watch::Sender<ConnectionState>,
    guarded: Mutex<Guarded>,
    tuning: ConnectionTuning,
    handle: Handle,
}

#[derive(Clone)]
pub struct ConnectionStateMachine {
    inner: Arc<MachineInner>,
}

impl ConnectionStateMachine {
    /// Must be created inside a tokio runtime; the sleep timer is spawned on it.
    pub fn new(tuning: ConnectionTuning) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(MachineInner {
                state_tx,
                guarded: Mutex::new(Guarded {
                    power: PowerSettings::default(),
                    sleep_timer: None,
                    generation: 0,
                    observers: Vec::new(),
                }),
                tuning,
                handle: Handle::current(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Guarded> {
        self.inner
            .guarded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn StateObserver>) {
        self.lock().observers.push(observer);
    }

    pub fn power(&self) -> PowerSettings {
        self.lock().power
    }

    pub fn set_power(&self, power: PowerSettings) {
        debug!(
            "power settings: power_saving={} router={} ls_secs={}",
            power.is_power_saving, power.is_router, power.ls_secs
        );
        self.lock().power = power;
    }

    pub fn update_power(&self, f: impl FnOnce(&mut PowerSettings)) {
        let mut guard = self.lock();
        f(&mut guard.power);
    }

    /// Transport reports the link is up. Only a disconnected machine moves to `Connecting`;
    /// a sleeping one stays asleep until the handshake completes, but its sleep timer stops.
    pub fn link_up(&self) {
        let mut guard = self.lock();
        match self.state() {
            ConnectionState::Disconnected => {
                self.transition_locked(&mut guard, ConnectionState::Connecting);
            }
            ConnectionState::DeviceSleep => {
                guard.generation += 1;
                if let Some(timer) = guard.sleep_timer.take() {
                    timer.abort();
                    debug!("radio is back; device sleep timer cancelled");
                }
            }
            _ => {}
        }
    }

    /// Configuration exchange finished.
    pub fn config_complete(&self) {
        let mut guard = self.lock();
        self.transition_locked(&mut guard, ConnectionState::Connected);
    }

    /// Transport lost the link.
    pub fn link_lost(&self, permanent: bool) {
        let mut guard = self.lock();
        let next = if permanent {
            ConnectionState::Disconnected
        } else if guard.power.light_sleep_enabled() {
            ConnectionState::DeviceSleep
        } else {
            debug!("link lost with light sleep disabled");
            ConnectionState::Disconnected
        };
        if next == ConnectionState::DeviceSleep && self.state() == ConnectionState::DeviceSleep {
            // Woke, then dropped again before the handshake finished.
            if guard.sleep_timer.is_none() {
                guard.generation += 1;
                self.arm_sleep_locked(&mut guard);
            }
            return;
        }
        self.transition_locked(&mut guard, next);
    }

    /// Force a state. Returns whether anything happened.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut guard = self.lock();
        self.transition_locked(&mut guard, next)
    }

    fn transition_locked(&self, guard: &mut Guarded, next: ConnectionState) -> bool {
        let prev = self.state();
        if prev == next && next != ConnectionState::Connected {
            return false;
        }

        guard.generation += 1;
        if let Some(timer) = guard.sleep_timer.take() {
            timer.abort();
        }
        if next == ConnectionState::DeviceSleep {
            self.arm_sleep_locked(guard);
        }

        if prev != next {
            info!("connection state {:?} -> {:?}", prev, next);
        }
        self.inner.state_tx.send_replace(next);
        for observer in &guard.observers {
            observer.on_state_change(prev, next);
        }
        true
    }

    fn arm_sleep_locked(&self, guard: &mut Guarded) {
        let timeout =
            Duration::from_secs(u64::from(guard.power.ls_secs)) + self.inner.tuning.sleep_margin;
        guard.sleep_timer = Some(self.arm_sleep_timer(guard.generation, timeout));
        debug!("device sleep timer armed for {:?}", timeout);
    }

    fn arm_sleep_timer(&self, generation: u64, timeout: Duration) -> JoinHandle<()> {
        let weak: Weak<MachineInner> = Arc::downgrade(&self.inner);
        self.inner.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            let machine = ConnectionStateMachine { inner };
            let mut guard = machine.lock();
            if guard.generation == generation && machine.state() == ConnectionState::DeviceSleep {
                warn!("device did not wake within {:?}, giving up", timeout);
                // The timer is finishing on its own; don't let the transition abort it.
                guard.sleep_timer = None;
                machine.transition_locked(&mut guard, ConnectionState::Disconnected);
            }
        })
    }
}

/// Sends the configuration requests for a [`ConnectAttempt`].
#[async_trait]
pub trait ConfigRequester: Send + Sync {
    async fn request_config(&self, nonce: u32) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStep {
    RequestConfig,
    AwaitConfig,
    RequestNodeDb,
    AwaitNodeDb,
    Done,
}

/// One pass of the two-stage configuration exchange: settings first, node database second.
pub struct ConnectAttempt<R> {
    requester: R,
    completions: watch::Receiver<Option<u32>>,
    timeout: Duration,
    max_attempts: u32,
}

impl<R: ConfigRequester> ConnectAttempt<R> {
    /// `completions` carries the most recent `config_complete_id` seen on the link.
    pub fn new(
        requester: R,
        completions: watch::Receiver<Option<u32>>,
        tuning: &ConnectionTuning,
    ) -> Self {
        Self {
            requester,
            completions,
            timeout: tuning.config_timeout,
            max_attempts: tuning.config_attempts.max(1),
        }
    }

    pub async fn run(mut self) -> Result<(), ConnectError> {
        let mut step = ConnectStep::RequestConfig;
        let mut attempts = 0u32;
        loop {
            debug!("handshake step {:?} (attempt {})", step, attempts + 1);
            step = match step {
                ConnectStep::RequestConfig => {
                    attempts += 1;
                    self.requester
                        .request_config(CONFIG_ONLY_NONCE)
                        .await
                        .map_err(ConnectError::RequestConfig)?;
                    ConnectStep::AwaitConfig
                }
                ConnectStep::AwaitConfig => {
                    if self.await_nonce(CONFIG_ONLY_NONCE).await? {
                        attempts = 0;
                        ConnectStep::RequestNodeDb
                    } else if attempts < self.max_attempts {
                        ConnectStep::RequestConfig
                    } else {
                        return Err(ConnectError::AwaitConfig { attempts });
                    }
                }
                ConnectStep::RequestNodeDb => {
                    attempts += 1;
                    self.requester
                        .request_config(NODE_INFO_NONCE)
                        .await
                        .map_err(ConnectError::RequestNodeDb)?;
                    ConnectStep::AwaitNodeDb
                }
                ConnectStep::AwaitNodeDb => {
                    if self.await_nonce(NODE_INFO_NONCE).await? {
                        ConnectStep::Done
                    } else if attempts < self.max_attempts {
                        ConnectStep::RequestNodeDb
                    } else {
                        return Err(ConnectError::AwaitNodeDb { attempts });
                    }
                }
                ConnectStep::Done => return Ok(()),
            };
        }
    }

    /// `Ok(false)` on timeout.
    async fn await_nonce(&mut self, nonce: u32) -> Result<bool, ConnectError> {
        let wait = self.completions.wait_for(|seen| *seen == Some(nonce));
        match tokio::time::timeout(self.timeout, wait).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) => Err(ConnectError::LinkLost),
            Err(_) => {
                warn!("no config_complete_id={} within {:?}", nonce, self.timeout);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder(Mutex<Vec<(ConnectionState, ConnectionState)>>);

    impl StateObserver for Recorder {
        fn on_state_change(&self, from: ConnectionState, to: ConnectionState) {
            self.0.lock().unwrap().push((from, to));
        }
    }

    #[tokio::test]
    async fn same_state_is_noop_except_connected() {
        let machine = ConnectionStateMachine::new(ConnectionTuning::default());
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        machine.add_observer(rec.clone());
        assert!(!machine.transition(ConnectionState::Disconnected));
        machine.link_up();
        machine.link_up();
        machine.config_complete();
        machine.config_complete();
        let seen = rec.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
                (ConnectionState::Connected, ConnectionState::Connected),
            ]
        );
    }

    #[tokio::test]
    async fn loss_without_power_saving_disconnects() {
        let machine = ConnectionStateMachine::new(ConnectionTuning::default());
        machine.link_up();
        machine.config_complete();
        machine.link_lost(false);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn router_role_enables_sleep() {
        let machine = ConnectionStateMachine::new(ConnectionTuning::default());
        machine.set_power(PowerSettings {
            is_router: true,
            ..Default::default()
        });
        machine.link_up();
        machine.config_complete();
        machine.link_lost(false);
        assert_eq!(machine.state(), ConnectionState::DeviceSleep);
        machine.link_lost(true);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    struct CountingRequester {
        calls: Arc<AtomicUsize>,
        completions: Arc<watch::Sender<Option<u32>>>,
        answer: bool,
    }

    #[async_trait]
    impl ConfigRequester for CountingRequester {
        async fn request_config(&self, nonce: u32) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.answer {
                self.completions.send_replace(Some(nonce));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_walks_both_stages() {
        let (tx, rx) = watch::channel(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let requester = CountingRequester {
            calls: calls.clone(),
            completions: Arc::new(tx),
            answer: true,
        };
        ConnectAttempt::new(requester, rx, &ConnectionTuning::default())
            .run()
            .await
            .expect("handshake");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_gives_up_after_attempts() {
        let (tx, rx) = watch::channel(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let requester = CountingRequester {
            calls: calls.clone(),
            completions: Arc::new(tx),
            answer: false,
        };
        let err = ConnectAttempt::new(requester, rx, &ConnectionTuning::default())
            .run()
            .await
            .unwrap_err();
        assert_eq!(err, ConnectError::AwaitConfig { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
