use std::io;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::net::ToSocketAddrs;
use tokio::sync::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::DrainError;
use crate::error::ServeError;
use crate::shutdown::Endpoint;

/// An axum [`Router`] served over TCP, drained through axum's graceful
/// shutdown.
///
/// Draining closes the listener and idle connections at once; in-flight
/// requests are allowed to finish until the deadline.
#[derive(Debug)]
pub struct HttpEndpoint {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    router: Router,
    drain_requested: watch::Sender<bool>,
    finished: watch::Sender<bool>,
}

impl HttpEndpoint {
    pub async fn bind(addr: impl ToSocketAddrs, router: Router) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            router,
            drain_requested: watch::Sender::new(false),
            finished: watch::Sender::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Endpoint for HttpEndpoint {
    async fn serve(&self) -> ServeError {
        // Checked under the listener lock so a concurrent drain is seen either
        // before the listener is taken or after serving has started
        let listener = {
            let mut listener = self.listener.lock().await;
            if *self.drain_requested.borrow() {
                return ServeError::Closed;
            }
            match listener.take() {
                Some(listener) => listener,
                None => return ServeError::AlreadyStarted,
            }
        };

        let mut drain = self.drain_requested.subscribe();
        let server = axum::serve(
            listener,
            self.router
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = drain.wait_for(|requested| *requested).await;
        });

        let finished = self.finished.clone();
        let mut handle = tokio::spawn(async move {
            let result = server.await;
            finished.send_replace(true);
            result
        });

        let mut drain = self.drain_requested.subscribe();
        tokio::select! {
            biased;
            _ = drain.wait_for(|requested| *requested) => ServeError::Closed,
            joined = &mut handle => match joined {
                Ok(Ok(())) => ServeError::Stopped,
                Ok(Err(err)) => ServeError::Io(err),
                Err(err) => ServeError::Io(io::Error::other(err)),
            },
        }
    }

    async fn drain(&self, deadline: Instant) -> Result<(), DrainError> {
        {
            let mut listener = self.listener.lock().await;
            self.drain_requested.send_replace(true);
            // Never served: release the port and report done
            if listener.take().is_some() {
                self.finished.send_replace(true);
            }
        }

        let mut finished = self.finished.subscribe();
        match tokio::time::timeout_at(deadline, finished.wait_for(|done| *done)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(DrainError::DeadlineExceeded),
        }
    }
}
