//! Signal handling for graceful shutdown.
//!
//! [`create`] hands out a [`CancellationToken`] that is cancelled by the first
//! SIGINT (Ctrl-C), together with a [`Release`] guard that tears the handler
//! down. The handler is one-shot: once an interrupt has been seen, or the
//! guard released, SIGINT goes back to its default disposition. A process
//! that does not react to the token can still be stopped with a second Ctrl-C.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The OS refused to deliver interrupt notifications.
#[derive(Debug)]
pub struct RegistrationError {
    source: std::io::Error,
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to register interrupt handler: {}", self.source)
    }
}

impl std::error::Error for RegistrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<std::io::Error> for RegistrationError {
    fn from(source: std::io::Error) -> Self {
        RegistrationError { source }
    }
}

impl From<nix::Error> for RegistrationError {
    fn from(errno: nix::Error) -> Self {
        RegistrationError {
            source: errno.into(),
        }
    }
}

/// Lifecycle of a cancellation source. There is no way back to `Armed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Listening for an interrupt.
    Armed,
    /// An interrupt arrived; the token is cancelled and the handler removed.
    Triggered,
    /// The guard was released.
    Released,
}

/// Feeds interrupt notifications into the source's one-slot channel.
pub trait Notifier: Send + 'static {
    /// Start delivering notifications into `slot`.
    fn arm(&mut self, slot: mpsc::Sender<()>) -> Result<(), RegistrationError>;

    /// Stop delivering and drop `slot`, which closes the channel.
    ///
    /// Called at most once, and only after a successful `arm`.
    fn disarm(&mut self);
}

/// SIGINT delivered through the tokio signal driver.
#[derive(Debug, Default)]
pub struct CtrlC {
    relay: Option<JoinHandle<()>>,
}

impl Notifier for CtrlC {
    fn arm(&mut self, slot: mpsc::Sender<()>) -> Result<(), RegistrationError> {
        // Registered before returning so an interrupt that lands before the
        // relay is first polled is still recorded by the driver.
        let mut interrupts = signal(SignalKind::interrupt())?;
        disposition::arm()?;

        self.relay = Some(tokio::spawn(async move {
            if interrupts.recv().await.is_some() {
                // The slot holds one notification; anything beyond it is noise.
                let _ = slot.try_send(());
            }
        }));
        Ok(())
    }

    fn disarm(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
            disposition::disarm();
        }
    }
}

struct Shared {
    state: SourceState,
    interrupted: bool,
    notifier: Box<dyn Notifier>,
}

struct Source {
    shared: Mutex<Shared>,
    token: CancellationToken,
}

impl Source {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Armed -> Triggered. A notification that loses the race against
    /// `release` is dropped.
    fn trigger(&self) {
        let mut shared = self.lock();
        if shared.state != SourceState::Armed {
            tracing::debug!(state = ?shared.state, "ignoring interrupt, source no longer armed");
            return;
        }
        tracing::info!("interrupt received, cancelling");
        shared.notifier.disarm();
        shared.state = SourceState::Triggered;
        shared.interrupted = true;
        drop(shared);
        self.token.cancel();
    }

    fn release(&self) {
        let mut shared = self.lock();
        match shared.state {
            SourceState::Released => return,
            SourceState::Armed => shared.notifier.disarm(),
            SourceState::Triggered => {}
        }
        shared.state = SourceState::Released;
        drop(shared);
        tracing::debug!("cancellation source released");
        self.token.cancel();
    }
}

/// Guard returned by [`create`]. Releasing it stops listening for interrupts
/// and cancels the token.
///
/// Release is idempotent and also happens on drop, so an explicit
/// `release()` can be combined with early returns safely.
pub struct Release {
    source: Arc<Source>,
    listener: Option<JoinHandle<()>>,
}

impl Release {
    /// Deregister the interrupt handler, close the channel, and cancel the
    /// token. Calls after the first do nothing.
    pub fn release(&self) {
        self.source.release();
    }

    /// Whether the token was cancelled by an interrupt rather than by release.
    pub fn was_interrupted(&self) -> bool {
        self.source.lock().interrupted
    }

    /// Wait for the background listener to exit. It exits right after an
    /// interrupt or a release, so call this after `release()`.
    pub async fn listener_exited(&mut self) {
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                tracing::warn!(error = %e, "interrupt listener ended abnormally");
            }
        }
    }
}

#[cfg(test)]
impl Release {
    pub fn state(&self) -> SourceState {
        self.source.lock().state
    }

    /// Whether the background listener is still waiting on the channel.
    pub fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.is_finished())
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.source.release();
    }
}

/// Create a token cancelled by the first SIGINT. Must be called from within
/// a tokio runtime.
pub fn create() -> Result<(CancellationToken, Release), RegistrationError> {
    create_with(CtrlC::default())
}

/// Like [`create`], with interrupts supplied by `notifier`.
pub fn create_with<N: Notifier>(
    mut notifier: N,
) -> Result<(CancellationToken, Release), RegistrationError> {
    let (slot, mut pending) = mpsc::channel(1);
    notifier.arm(slot)?;

    let source = Arc::new(Source {
        shared: Mutex::new(Shared {
            state: SourceState::Armed,
            interrupted: false,
            notifier: Box::new(notifier),
        }),
        token: CancellationToken::new(),
    });

    let listener = tokio::spawn({
        let source = Arc::clone(&source);
        async move {
            // None means release closed the channel and already cancelled.
            if pending.recv().await.is_some() {
                source.trigger();
            }
        }
    });

    let token = source.token.clone();
    Ok((
        token,
        Release {
            source,
            listener: Some(listener),
        },
    ))
}

/// Process-wide SIGINT disposition.
///
/// The tokio driver installs its handler once and never removes it, which
/// would swallow every later Ctrl-C. When the last armed source disarms, the
/// default disposition is restored and the driver's handler parked; the next
/// source to arm puts it back.
mod disposition {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    struct Disposition {
        armed: usize,
        parked: Option<SigAction>,
    }

    static DISPOSITION: Mutex<Disposition> = Mutex::new(Disposition {
        armed: 0,
        parked: None,
    });

    fn lock() -> MutexGuard<'static, Disposition> {
        DISPOSITION.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn arm() -> nix::Result<()> {
        let mut disposition = lock();
        if let Some(handler) = disposition.parked.take() {
            // SAFETY: reinstates the handler the tokio driver installed,
            // exactly as it was before `disarm` displaced it.
            if let Err(errno) = unsafe { sigaction(Signal::SIGINT, &handler) } {
                disposition.parked = Some(handler);
                return Err(errno);
            }
        }
        disposition.armed += 1;
        Ok(())
    }

    pub(super) fn disarm() {
        let mut disposition = lock();
        disposition.armed = disposition.armed.saturating_sub(1);
        if disposition.armed > 0 {
            return;
        }

        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        // SAFETY: SIG_DFL runs no code in this process.
        match unsafe { sigaction(Signal::SIGINT, &default) } {
            Ok(previous) => {
                if !matches!(previous.handler(), SigHandler::SigDfl) {
                    disposition.parked = Some(previous);
                }
            }
            Err(errno) => {
                tracing::warn!(error = %errno, "failed to restore default SIGINT disposition");
            }
        }
    }
}
