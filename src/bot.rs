use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{Config, UnauthorizedPolicy};
use crate::entitlements::{InMemoryUserSet, UserSet};
use crate::llm::{Completer, CompletionClient};
use crate::platform::line::{Event, LineClient};
use crate::platform::{Delivery, Messenger};

pub const PAYMENT_REQUIRED: &str = "This is a paid feature. \
    Please complete payment to receive fortune readings.";

pub fn disclosure_message(user_id: &str) -> String {
    format!("Your user ID is: {}", user_id)
}

pub const ACCESS_GRANTED: &str =
    "Your payment has been confirmed. You can now receive fortune readings!";

pub const ACCESS_REVOKED: &str = "Your access to fortune readings has been removed.";

/// How a webhook batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every event was looked at.
    Completed,
    /// Processing stopped at an unentitled user (`UnauthorizedPolicy::AbortBatch`).
    Unauthorized { user_id: String },
}

/// Shared application state
pub struct AppState {
    paid_users: Arc<dyn UserSet>,
    disclosed: Arc<dyn UserSet>,
    llm: Arc<dyn Completer>,
    messenger: Arc<dyn Messenger>,
    policy: UnauthorizedPolicy,
    channel_secret: String,
    admin_token: Option<String>,
}

impl AppState {
    /// Wire up the production stores and clients from config.
    pub fn new(config: &Config) -> Self {
        Self::from_parts(
            config,
            Arc::new(InMemoryUserSet::with_users(
                config.entitlements.paid_user_ids.iter().cloned(),
            )),
            Arc::new(InMemoryUserSet::new()),
            Arc::new(CompletionClient::new(config.llm.clone())),
            Arc::new(LineClient::new(&config.line)),
        )
    }

    /// Build state around caller-supplied stores and clients.
    pub fn from_parts(
        config: &Config,
        paid_users: Arc<dyn UserSet>,
        disclosed: Arc<dyn UserSet>,
        llm: Arc<dyn Completer>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            paid_users,
            disclosed,
            llm,
            messenger,
            policy: config.entitlements.on_unauthorized,
            channel_secret: config.line.channel_secret.clone(),
            admin_token: config.server.admin_token.clone(),
        }
    }

    pub fn channel_secret(&self) -> &str {
        &self.channel_secret
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    pub async fn paid_user_count(&self) -> usize {
        self.paid_users.len().await
    }

    /// Process a webhook batch in order.
    ///
    /// Each sender is told their user id the first time they are seen. Text
    /// messages from entitled users get a reading; anything else is skipped.
    /// With `AbortBatch`, the first unentitled sender ends the whole batch.
    pub async fn handle_events(&self, events: &[Event]) -> BatchOutcome {
        for event in events {
            let Some(user_id) = event.user_id() else {
                warn!("Skipping '{}' event without a source user id", event.kind);
                continue;
            };

            if self.disclosed.insert(user_id).await {
                self.messenger
                    .push(user_id, &disclosure_message(user_id))
                    .await;
            }

            let Some(incoming) = event.incoming() else {
                debug!("Ignoring non-text '{}' event from {}", event.kind, user_id);
                continue;
            };

            info!("Message from {}: {}", incoming.user_id, incoming.text);

            if !self.paid_users.contains(&incoming.user_id).await {
                info!("User {} is not entitled", incoming.user_id);
                self.messenger
                    .push(&incoming.user_id, PAYMENT_REQUIRED)
                    .await;

                match self.policy {
                    UnauthorizedPolicy::AbortBatch => {
                        return BatchOutcome::Unauthorized {
                            user_id: incoming.user_id,
                        };
                    }
                    UnauthorizedPolicy::SkipEvent => continue,
                }
            }

            let reading = self.llm.reading(&incoming.text).await;
            if let Delivery::Failed(reason) = self.messenger.push(&incoming.user_id, &reading).await
            {
                warn!("Reading for {} was not delivered: {}", incoming.user_id, reason);
            }
        }

        BatchOutcome::Completed
    }

    /// Entitle `user_id` and tell them. Granting twice is harmless.
    pub async fn grant(&self, user_id: &str) {
        if self.paid_users.insert(user_id).await {
            info!("Granted paid access to {}", user_id);
        } else {
            debug!("{} already had paid access", user_id);
        }
        self.messenger.push(user_id, ACCESS_GRANTED).await;
    }

    /// Revoke `user_id`'s entitlement. Returns `false`, sending nothing, if
    /// they were not entitled.
    pub async fn revoke(&self, user_id: &str) -> bool {
        if !self.paid_users.remove(user_id).await {
            return false;
        }
        info!("Revoked paid access from {}", user_id);
        self.messenger.push(user_id, ACCESS_REVOKED).await;
        true
    }

    #[cfg(test)]
    pub async fn is_paid(&self, user_id: &str) -> bool {
        self.paid_users.contains(user_id).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::llm::FALLBACK_READING;
    use serde_json::json;

    #[tokio::test]
    async fn test_entitled_user_gets_reading() {
        let h = harness(&["U1"]);
        let outcome = h
            .state
            .handle_events(&events(vec![text_event("U1", "Will I be rich?")]))
            .await;

        assert_eq!(outcome, BatchOutcome::Completed);
        assert_eq!(h.llm.prompts(), vec!["Will I be rich?"]);
        assert_eq!(
            h.messenger.pushes(),
            vec![
                ("U1".to_string(), disclosure_message("U1")),
                ("U1".to_string(), "reading: Will I be rich?".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_disclosure_sent_once_per_user() {
        let h = harness(&["U1"]);
        h.state
            .handle_events(&events(vec![text_event("U1", "first")]))
            .await;
        h.state
            .handle_events(&events(vec![text_event("U1", "second")]))
            .await;

        let disclosures = h
            .messenger
            .pushes()
            .into_iter()
            .filter(|(_, text)| text == &disclosure_message("U1"))
            .count();
        assert_eq!(disclosures, 1);
    }

    #[tokio::test]
    async fn test_unentitled_user_gets_payment_notice_only() {
        let h = harness(&[]);
        let outcome = h
            .state
            .handle_events(&events(vec![text_event("U1", "hello")]))
            .await;

        assert_eq!(
            outcome,
            BatchOutcome::Unauthorized {
                user_id: "U1".to_string()
            }
        );
        assert!(h.llm.prompts().is_empty());
        let payment_notices = h
            .messenger
            .pushes()
            .into_iter()
            .filter(|(to, text)| to == "U1" && text == PAYMENT_REQUIRED)
            .count();
        assert_eq!(payment_notices, 1);
    }

    #[tokio::test]
    async fn test_unauthorized_user_aborts_rest_of_batch() {
        let h = harness(&["U2"]);
        let outcome = h
            .state
            .handle_events(&events(vec![
                text_event("U1", "me first"),
                text_event("U2", "my turn"),
            ]))
            .await;

        assert_eq!(
            outcome,
            BatchOutcome::Unauthorized {
                user_id: "U1".to_string()
            }
        );
        assert!(h.llm.prompts().is_empty());
        assert_eq!(
            h.messenger.pushes(),
            vec![
                ("U1".to_string(), disclosure_message("U1")),
                ("U1".to_string(), PAYMENT_REQUIRED.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_skip_event_policy_continues_batch() {
        let h = harness_with(
            &["U2"],
            test_config(UnauthorizedPolicy::SkipEvent, None),
            ScriptedCompleter::default(),
        );
        let outcome = h
            .state
            .handle_events(&events(vec![
                text_event("U1", "me first"),
                text_event("U2", "my turn"),
            ]))
            .await;

        assert_eq!(outcome, BatchOutcome::Completed);
        assert_eq!(h.llm.prompts(), vec!["my turn"]);
        let pushes = h.messenger.pushes();
        assert!(pushes.contains(&("U1".to_string(), PAYMENT_REQUIRED.to_string())));
        assert!(pushes.contains(&("U2".to_string(), "reading: my turn".to_string())));
    }

    #[tokio::test]
    async fn test_failed_completion_relays_fallback() {
        let h = harness_with(
            &["U1"],
            test_config(UnauthorizedPolicy::AbortBatch, None),
            ScriptedCompleter::failing(),
        );
        let outcome = h
            .state
            .handle_events(&events(vec![text_event("U1", "hello")]))
            .await;

        assert_eq!(outcome, BatchOutcome::Completed);
        let last = h.messenger.pushes().pop().unwrap();
        assert_eq!(last, ("U1".to_string(), FALLBACK_READING.to_string()));
    }

    #[tokio::test]
    async fn test_unreachable_completion_api_relays_fallback() {
        let mut config = test_config(UnauthorizedPolicy::AbortBatch, None);
        config.llm.base_url = "http://127.0.0.1:9".to_string();
        let messenger = Arc::new(RecordingMessenger::default());
        let state = AppState::from_parts(
            &config,
            Arc::new(InMemoryUserSet::with_users(["U1"])),
            Arc::new(InMemoryUserSet::new()),
            Arc::new(CompletionClient::new(config.llm.clone())),
            messenger.clone(),
        );

        let outcome = state
            .handle_events(&events(vec![text_event("U1", "hello")]))
            .await;

        assert_eq!(outcome, BatchOutcome::Completed);
        assert_eq!(
            messenger.pushes(),
            vec![
                ("U1".to_string(), disclosure_message("U1")),
                ("U1".to_string(), FALLBACK_READING.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_text_event_discloses_then_is_ignored() {
        let h = harness(&[]);
        let outcome = h
            .state
            .handle_events(&events(vec![
                json!({ "type": "follow", "source": { "type": "user", "userId": "U1" } }),
                json!({
                    "type": "message",
                    "source": { "type": "user", "userId": "U1" },
                    "message": { "id": "2", "type": "sticker", "packageId": "1", "stickerId": "1" }
                }),
            ]))
            .await;

        assert_eq!(outcome, BatchOutcome::Completed);
        assert_eq!(
            h.messenger.pushes(),
            vec![("U1".to_string(), disclosure_message("U1"))]
        );
        assert!(h.llm.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_event_without_user_is_skipped() {
        let h = harness(&["U2"]);
        let outcome = h
            .state
            .handle_events(&events(vec![
                json!({ "type": "join", "source": { "type": "group", "groupId": "C1" } }),
                text_event("U2", "hi"),
            ]))
            .await;

        assert_eq!(outcome, BatchOutcome::Completed);
        assert_eq!(h.llm.prompts(), vec!["hi"]);
    }

    #[tokio::test]
    async fn test_grant_then_revoke_round_trip() {
        let h = harness(&[]);
        h.state.grant("U1").await;
        assert!(h.state.is_paid("U1").await);

        assert!(h.state.revoke("U1").await);
        assert!(!h.state.is_paid("U1").await);
        assert_eq!(
            h.messenger.pushes(),
            vec![
                ("U1".to_string(), ACCESS_GRANTED.to_string()),
                ("U1".to_string(), ACCESS_REVOKED.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_grant_is_idempotent() {
        let h = harness(&["U1"]);
        h.state.grant("U1").await;
        assert!(h.state.is_paid("U1").await);
        assert_eq!(h.state.paid_user_count().await, 1);
    }

    #[tokio::test]
    async fn test_revoke_unknown_user_sends_nothing() {
        let h = harness(&[]);
        assert!(!h.state.revoke("U404").await);
        assert!(h.messenger.pushes().is_empty());
    }
}
