/// Signal handling for graceful shutdown.
///
/// First SIGINT (Ctrl-C): stop the current session, export it, then exit.
/// Second SIGINT within 3s: exit immediately.
/// SIGTERM: same as a single SIGINT.
use std::time::{Duration, Instant};
use tokio::sync::watch;

const DOUBLE_PRESS_WINDOW: Duration = Duration::from_secs(3);

/// Exit code used when a second interrupt forces termination.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Received {
    Interrupt,
    Terminate,
}

pub struct SignalHandler {
    requests: watch::Receiver<u32>,
}

impl SignalHandler {
    /// Start listening for shutdown signals.
    pub fn install() -> std::io::Result<Self> {
        let (tx, requests) = watch::channel(0u32);
        let mut listener = Listener::new()?;

        tokio::spawn(async move {
            let mut last_interrupt: Option<Instant> = None;
            while let Some(received) = listener.next().await {
                if received == Received::Interrupt {
                    let now = Instant::now();
                    if is_double_press(last_interrupt, now) {
                        tracing::warn!("second interrupt, exiting immediately");
                        std::process::exit(FORCED_EXIT_CODE);
                    }
                    last_interrupt = Some(now);
                    tracing::info!("interrupt received, finishing current session (press Ctrl-C again to force exit)");
                } else {
                    tracing::info!("terminate received, finishing current session");
                }
                tx.send_modify(|n| *n += 1);
            }
        });

        Ok(Self { requests })
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.requests.borrow() > 0
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&mut self) {
        // The sender lives as long as the listener task; if it is gone no
        // request can arrive.
        if self.requests.wait_for(|n| *n > 0).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn is_double_press(last: Option<Instant>, now: Instant) -> bool {
    last.is_some_and(|prev| now.duration_since(prev) <= DOUBLE_PRESS_WINDOW)
}

struct Listener {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Listener {
    fn new() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    /// `None` once signals can no longer be received.
    async fn next(&mut self) -> Option<Received> {
        #[cfg(unix)]
        {
            tokio::select! {
                res = tokio::signal::ctrl_c() => res.ok().map(|_| Received::Interrupt),
                sig = self.terminate.recv() => sig.map(|_| Received::Terminate),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .ok()
                .map(|_| Received::Interrupt)
        }
    }
}
