pub mod line;

use async_trait::async_trait;

/// A text message received from the messaging platform, normalised out of
/// the platform's event shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Platform-assigned user id of the sender
    pub user_id: String,
    /// The message text
    pub text: String,
}

/// Outcome of a best-effort push.
///
/// Failures are reported here and logged by the sender, never propagated:
/// the caller carries on as if the message went out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Failed(String),
}

/// Pushes plain-text messages to a user outside of any reply context.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn push(&self, user_id: &str, text: &str) -> Delivery;
}
