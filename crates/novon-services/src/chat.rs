//! Chat service. Validates viewer chat lines and rebroadcasts them.
//!
//! Chat arrives as JSON envelopes on the control channel. A line carrying a
//! donation is only rebroadcast after the donation checks out. The sender
//! always gets a `"success"` or `"error: ..."` reply first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use novon_core::message::{
    ChatMessage, DeleteChatMessage, Envelope, CHAT_MESSAGE, DELETE_CHAT_MESSAGE, OWNER_ROLE,
};
use novon_core::overlay::{MessageId, Payload};

use crate::balancer::Broadcaster;
use crate::donation::{DonationValidator, ValidationFailure};
use crate::viewers::ViewerRegistry;

pub const SUCCESS_REPLY: &str = "success";

pub fn rejection_reply(reason: &ValidationFailure) -> String {
    format!("error: donation validation error - {reason}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    Posted(ChatMessage),
    Rejected(ValidationFailure),
    Deleted(u64),
    /// Malformed, unknown type, or not permitted.
    Ignored,
}

pub struct ChatService {
    validator: Arc<DonationValidator>,
    broadcaster: Arc<dyn Broadcaster>,
    viewers: Arc<ViewerRegistry>,
    owner: String,
    next_id: AtomicU64,
}

impl ChatService {
    pub fn new(
        validator: Arc<DonationValidator>,
        broadcaster: Arc<dyn Broadcaster>,
        viewers: Arc<ViewerRegistry>,
        owner: String,
    ) -> Self {
        Self {
            validator,
            broadcaster,
            viewers,
            owner,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn validator(&self) -> &Arc<DonationValidator> {
        &self.validator
    }

    /// Handle one envelope. Validation may wait on the ledger for a long
    /// time, so callers on the receive path should spawn this.
    pub async fn process(&self, src: &str, message_id: MessageId, raw: &[u8]) -> ChatOutcome {
        let envelope = match Envelope::from_bytes(raw) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(src, error = %e, "dropping undecodable message");
                return ChatOutcome::Ignored;
            }
        };

        match envelope.kind.as_str() {
            CHAT_MESSAGE => {
                let mut chat = match ChatMessage::from_content(&envelope.content) {
                    Ok(chat) => chat,
                    Err(e) => {
                        tracing::debug!(src, error = %e, "dropping malformed chat message");
                        return ChatOutcome::Ignored;
                    }
                };
                chat.src = src.to_string();
                chat.role.clear();
                chat.id = 0;
                self.post(chat, message_id).await
            }
            DELETE_CHAT_MESSAGE => {
                if src != self.owner {
                    tracing::debug!(src, "delete-chat-message from non-owner dropped");
                    return ChatOutcome::Ignored;
                }
                let delete: DeleteChatMessage = match serde_json::from_value(envelope.content) {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping malformed delete-chat-message");
                        return ChatOutcome::Ignored;
                    }
                };
                let text = String::from_utf8_lossy(raw).into_owned();
                self.broadcaster
                    .multicast(self.viewers.all_addresses(), Payload::text(text));
                tracing::info!(msg_id = delete.msg_id, "chat message deleted");
                ChatOutcome::Deleted(delete.msg_id)
            }
            other => {
                tracing::debug!(src, kind = other, "unknown message type");
                ChatOutcome::Ignored
            }
        }
    }

    async fn post(&self, mut chat: ChatMessage, message_id: MessageId) -> ChatOutcome {
        if let Err(reason) = self.validator.validate(&chat).await {
            tracing::info!(src = %chat.src, %reason, "chat rejected");
            self.broadcaster.unicast(
                &chat.src,
                Payload::text(rejection_reply(&reason)).in_reply_to(message_id),
            );
            return ChatOutcome::Rejected(reason);
        }
        self.broadcaster
            .unicast(&chat.src, Payload::text(SUCCESS_REPLY).in_reply_to(message_id));

        chat.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if chat.src == self.owner {
            chat.role = OWNER_ROLE.to_string();
        }

        match serde_json::to_string(&chat) {
            Ok(json) => {
                self.broadcaster
                    .multicast(self.viewers.all_addresses(), Payload::text(json));
                tracing::debug!(id = chat.id, src = %chat.src, "chat message posted");
            }
            Err(e) => tracing::warn!(error = %e, "chat message serialization failed"),
        }
        ChatOutcome::Posted(chat)
    }
}
