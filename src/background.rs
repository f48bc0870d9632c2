//! Single-worker background loop.
//!
//! A [`BackgroundLoop`] runs one [`Iteration`] implementation on a dedicated thread until it
//! is cancelled. Iterations that find no work call [`LoopContext::idle`], which announces the
//! idle period and sleeps for the configured delay unless woken or cancelled first. A failing
//! iteration stops the loop; the failure is published as a [`LoopEvent::Failed`] when it
//! happens and returned again from [`BackgroundLoop::dispose`].

use crate::collections::lock;
use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Returned by work that observed a cancellation request. Never reported as a failure.
#[derive(Debug, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("background loop {0} is already started")]
    AlreadyStarted(String),
    #[error("background loop {0} is disposed")]
    Disposed(String),
    #[error("background loop {0} needs a positive idle delay")]
    InvalidIdleDelay(String),
    #[error("background loop {name} failed: {source:#}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("background loop {name} panicked: {message}")]
    Panicked { name: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    /// The loop found no work and sleeps for the given delay.
    Idle(Duration),
    /// An iteration failed; the loop has stopped.
    Failed(String),
}

/// One unit of background work, invoked repeatedly by [`BackgroundLoop`].
pub trait Iteration: Send + 'static {
    fn iteration(&mut self, ctx: &LoopContext) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Wakeup {
    pending: Mutex<bool>,
    signal: Condvar,
}

impl Wakeup {
    fn notify(&self) {
        *lock(&self.pending) = true;
        self.signal.notify_all();
    }

    fn wait(&self, timeout: Duration, token: &CancellationToken) {
        let guard = lock(&self.pending);
        let (mut pending, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |pending| {
                !*pending && !token.is_cancelled()
            })
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *pending = false;
    }
}

/// Handed to every iteration.
pub struct LoopContext {
    token: CancellationToken,
    idle_delay: Duration,
    wakeup: Arc<Wakeup>,
    events: broadcast::Sender<LoopEvent>,
}

impl LoopContext {
    /// Announce that there is nothing to do and back off for the idle delay.
    pub fn idle(&self) {
        let _ = self.events.send(LoopEvent::Idle(self.idle_delay));
        trace!(delay_ms = self.idle_delay.as_millis() as u64, "Idle");
        self.wakeup.wait(self.idle_delay, &self.token);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The loop's shutdown token. Child tokens observe shutdown too.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

enum LoopState {
    Ready,
    Running(JoinHandle<anyhow::Result<()>>),
    Disposed,
}

pub struct BackgroundLoop {
    name: String,
    idle_delay: Duration,
    token: CancellationToken,
    wakeup: Arc<Wakeup>,
    events: broadcast::Sender<LoopEvent>,
    state: Mutex<LoopState>,
}

impl BackgroundLoop {
    /// Fails if `idle_delay` is zero.
    pub fn new(name: impl Into<String>, idle_delay: Duration) -> Result<Self, LoopError> {
        let name = name.into();
        if idle_delay.is_zero() {
            return Err(LoopError::InvalidIdleDelay(name));
        }

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            name,
            idle_delay,
            token: CancellationToken::new(),
            wakeup: Arc::new(Wakeup::default()),
            events,
            state: Mutex::new(LoopState::Ready),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the worker thread. Fails if the loop was already started or disposed.
    pub fn run<I: Iteration>(&self, mut work: I) -> Result<(), LoopError> {
        let mut state = lock(&self.state);
        match *state {
            LoopState::Running(_) => return Err(LoopError::AlreadyStarted(self.name.clone())),
            LoopState::Disposed => return Err(LoopError::Disposed(self.name.clone())),
            LoopState::Ready => {}
        }

        let ctx = LoopContext {
            token: self.token.clone(),
            idle_delay: self.idle_delay,
            wakeup: self.wakeup.clone(),
            events: self.events.clone(),
        };
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                debug!(name = %name, "Background loop started");
                while !ctx.is_cancelled() {
                    if let Err(e) = work.iteration(&ctx) {
                        if e.is::<Cancelled>() || ctx.is_cancelled() {
                            break;
                        }
                        error!(name = %name, error = %format!("{:#}", e), "Background loop failed");
                        let _ = ctx.events.send(LoopEvent::Failed(format!("{:#}", e)));
                        return Err(e);
                    }
                }
                debug!(name = %name, "Background loop stopped");
                Ok(())
            })
            .map_err(|e| LoopError::Failed {
                name: self.name.clone(),
                source: anyhow::Error::new(e).context("failed to spawn worker thread"),
            })?;

        *state = LoopState::Running(handle);
        Ok(())
    }

    /// Wake the worker if it is idling.
    pub fn wake(&self) {
        self.wakeup.notify();
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.state), LoopState::Running(_))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events.subscribe()
    }

    /// Cancel the worker and wait for it to exit, returning the failure that stopped it, if
    /// any. Disposing twice is a no-op.
    pub fn dispose(&self) -> Result<(), LoopError> {
        let previous = std::mem::replace(&mut *lock(&self.state), LoopState::Disposed);
        self.token.cancel();
        self.wakeup.notify();

        let LoopState::Running(handle) = previous else {
            return Ok(());
        };

        match handle.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(LoopError::Failed {
                name: self.name.clone(),
                source,
            }),
            Err(payload) => Err(LoopError::Panicked {
                name: self.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            error!(error = %e, "Background loop failure discovered on drop");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
