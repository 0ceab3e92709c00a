use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::DrainError;
use crate::error::ServeError;
use crate::error::ShutdownError;
use crate::tasks::BackgroundTasks;

/// A serving endpoint that can be drained.
pub trait Endpoint: Send + Sync + 'static {
    /// Runs the accept loop until it stops, and says why.
    ///
    /// Must resolve to [`ServeError::Closed`] once [`Endpoint::drain`] has
    /// been requested, and to anything else when it stops on its own.
    fn serve(&self) -> impl Future<Output = ServeError> + Send;

    /// Stops accepting connections and waits for active ones to finish, or
    /// for `deadline` to pass.
    fn drain(&self, deadline: Instant) -> impl Future<Output = Result<(), DrainError>> + Send;
}

/// Lifecycle of a [`Shutdown`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShutdownState::Running => "running",
            ShutdownState::Draining => "draining",
            ShutdownState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A termination request from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Interrupt => f.write_str("interrupt"),
            Signal::Terminate => f.write_str("terminated"),
        }
    }
}

/// Listeners for SIGINT and SIGTERM.
///
/// Handlers are registered by [`TerminationSignals::install`], so a signal
/// arriving before anyone awaits [`TerminationSignals::recv`] is buffered,
/// not lost.
#[derive(Debug)]
pub struct TerminationSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    /// Must be called from within a tokio runtime.
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    pub async fn recv(&mut self) -> Signal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => Signal::Interrupt,
                _ = self.terminate.recv() => Signal::Terminate,
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            Signal::Interrupt
        }
    }
}

/// Coordinates a graceful exit.
///
/// [`Shutdown::run`] serves an [`Endpoint`] until a termination signal
/// arrives (or the endpoint stops on its own), then drains the endpoint and
/// waits for outstanding [`BackgroundTasks`], all within one deadline.
#[derive(Debug)]
pub struct Shutdown {
    drain_timeout: Duration,
    tasks: BackgroundTasks,
    state: watch::Sender<ShutdownState>,
}

impl Shutdown {
    pub fn new(drain_timeout: Duration, tasks: BackgroundTasks) -> Self {
        Self {
            drain_timeout,
            tasks,
            state: watch::Sender::new(ShutdownState::Running),
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Serve `endpoint` until shutdown completes.
    ///
    /// Returns `Ok(())` only if serving stopped because of the drain and the
    /// drain finished in time. A serving fault is reported in preference to a
    /// drain error. Either way this does not return before the drain
    /// sequence has finished.
    pub async fn run<E, S>(self, endpoint: Arc<E>, signal: S) -> Result<(), ShutdownError>
    where
        E: Endpoint,
        S: Future<Output = Signal> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<Result<(), DrainError>>();
        let fault = Arc::new(Notify::new());

        {
            let endpoint = Arc::clone(&endpoint);
            let tasks = self.tasks.clone();
            let state = self.state.clone();
            let fault = Arc::clone(&fault);
            let drain_timeout = self.drain_timeout;

            tokio::spawn(async move {
                tokio::select! {
                    signal = signal => {
                        tracing::info!(%signal, "shutting down server");
                    }
                    _ = fault.notified() => {
                        tracing::warn!("server stopped without a shutdown request, draining");
                    }
                }
                state.send_replace(ShutdownState::Draining);

                let result = drain(endpoint.as_ref(), &tasks, drain_timeout).await;
                if let Err(err) = &result {
                    tracing::error!(error = %err, "shutdown error");
                }
                let _ = done_tx.send(result);
            });
        }

        tracing::info!("starting server");
        let serve_fault = match endpoint.serve().await {
            ServeError::Closed => None,
            err => {
                tracing::error!(error = %err, "serve error");
                fault.notify_one();
                Some(err)
            }
        };

        let drained = match done_rx.await {
            Ok(result) => result.map_err(ShutdownError::from),
            Err(_) => Err(ShutdownError::SupervisorLost),
        };
        self.state.send_replace(ShutdownState::Stopped);

        match (serve_fault, drained) {
            (Some(err), _) => Err(err.into()),
            (None, Err(err)) => Err(err),
            (None, Ok(())) => {
                tracing::info!("stopped server");
                Ok(())
            }
        }
    }
}

async fn drain<E: Endpoint>(
    endpoint: &E,
    tasks: &BackgroundTasks,
    timeout: Duration,
) -> Result<(), DrainError> {
    let deadline = Instant::now() + timeout;

    // Connections first: a handler still running may launch more tasks
    let drained = endpoint.drain(deadline).await;

    // Tasks are waited for even when the endpoint failed to close cleanly
    let idle = tokio::time::timeout_at(deadline, tasks.wait_idle()).await;

    drained?;
    if idle.is_err() {
        return Err(DrainError::TasksOutstanding {
            remaining: tasks.outstanding(),
        });
    }
    Ok(())
}
