//! Alert delivery.
//!
//! The pipeline hands an annotated JPEG and a destination to a `Notifier` and
//! moves on. Implementations must return promptly: delivery happens on the
//! notifier's own threads, and a refused hand-off is reported as
//! `PipelineError::NotifierUnavailable`.

mod cooldown;
mod telegram;

use std::sync::Arc;

use crate::error::PipelineError;

pub use cooldown::{Cooldown, DEFAULT_COOLDOWN};
pub use telegram::{TelegramConfig, TelegramNotifier, DEFAULT_API_BASE};

pub trait Notifier: Send + Sync {
    /// Queue `jpeg` for delivery to `destination`. Must not block on I/O.
    fn send_alert(&self, jpeg: Vec<u8>, destination: &str) -> Result<(), PipelineError>;

    /// Whether hand-offs can currently be accepted.
    fn is_available(&self) -> bool;

    /// Stop accepting alerts and wind down delivery threads.
    fn shutdown(&self) {}
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Notifier used when no bot credentials are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn send_alert(&self, _jpeg: Vec<u8>, _destination: &str) -> Result<(), PipelineError> {
        Err(PipelineError::NotifierUnavailable(
            "no bot token configured".to_string(),
        ))
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Build the notifier for `config`: Telegram when a token is present,
/// otherwise `DisabledNotifier`.
pub fn build_notifier(config: Option<TelegramConfig>) -> anyhow::Result<SharedNotifier> {
    match config {
        Some(config) => Ok(Arc::new(TelegramNotifier::start(config)?)),
        None => {
            log::warn!("notifier: no bot token configured; alerts are disabled");
            Ok(Arc::new(DisabledNotifier))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_notifier_refuses_every_alert() {
        let notifier = build_notifier(None).unwrap();
        assert!(!notifier.is_available());
        let err = notifier.send_alert(vec![1, 2, 3], "123").unwrap_err();
        assert!(matches!(err, PipelineError::NotifierUnavailable(_)));
    }
}
