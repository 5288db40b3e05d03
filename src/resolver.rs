//! Conversation resolution
//!
//! Given a booking or inquiry key and the signed-in account, works out which
//! side of the conversation the user is on, who the counterpart's profile is,
//! and whether new messages are currently allowed. All lookups are read-only.

use crate::{
    Error, Result,
    storage::{ConversationKey, Profile, Role},
    store::{AuthContext, ChatContext, Directory},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Whether the current user may send into a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Side the current user is on
    pub role: Role,
    /// False for completed/cancelled bookings and closed inquiries
    pub send_allowed: bool,
    /// Why sending is disabled, for the composer's disabled state
    pub read_only_reason: Option<String>,
}

/// Fully resolved participants of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationAccess {
    /// Conversation being resolved
    pub conversation: ConversationKey,
    /// Side the current user is on, and whether they may send
    pub permission: Permission,
    /// Current user's profile id
    pub sender_profile_id: String,
    /// Counterpart's profile id
    pub receiver_profile_id: String,
}

impl ConversationAccess {
    /// Shorthand for `permission.send_allowed`
    pub fn send_allowed(&self) -> bool {
        self.permission.send_allowed
    }
}

/// Participant accounts and status of a booking or inquiry
struct Scope {
    customer_account_id: String,
    provider_id: String,
    read_only_reason: Option<String>,
}

/// Resolves receivers and send permission for the signed-in account
#[derive(Clone)]
pub struct ConversationResolver {
    directory: Arc<dyn Directory>,
    auth: AuthContext,
}

impl ConversationResolver {
    /// Create a resolver for the context's account
    pub fn new(ctx: &ChatContext) -> Self {
        Self {
            directory: ctx.directory.clone(),
            auth: ctx.auth.clone(),
        }
    }

    /// Profile of the signed-in account
    pub async fn self_profile(&self) -> Result<Profile> {
        self.directory
            .profile_for_account(&self.auth.account_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("profile for account {}", self.auth.account_id))
            })
    }

    /// Determine the user's side and send permission without resolving the receiver
    pub async fn permission(&self, conversation: &ConversationKey) -> Result<Permission> {
        let scope = self.scope(conversation).await?;
        let (role, _) = self.sides(conversation, &scope).await?;
        Ok(Permission {
            role,
            send_allowed: scope.read_only_reason.is_none(),
            read_only_reason: scope.read_only_reason,
        })
    }

    /// Resolve both participants' profiles and the send permission
    ///
    /// # Errors
    /// * `Error::NotFound` - the booking/inquiry or the user's own profile doesn't exist
    /// * `Error::ReceiverNotFound` - the user isn't a participant, or the
    ///   counterpart has no profile
    pub async fn resolve(&self, conversation: &ConversationKey) -> Result<ConversationAccess> {
        let scope = self.scope(conversation).await?;
        let (role, counterpart_account) = self.sides(conversation, &scope).await?;

        let receiver = self
            .directory
            .profile_for_account(&counterpart_account)
            .await?
            .ok_or_else(|| {
                Error::ReceiverNotFound(format!(
                    "no profile for counterpart account {} in {}",
                    counterpart_account, conversation
                ))
            })?;
        let sender = self.self_profile().await?;

        debug!(
            "Resolved {} for {}: {:?}, receiver {}",
            conversation, self.auth.account_id, role, receiver.id
        );

        Ok(ConversationAccess {
            conversation: conversation.clone(),
            permission: Permission {
                role,
                send_allowed: scope.read_only_reason.is_none(),
                read_only_reason: scope.read_only_reason,
            },
            sender_profile_id: sender.id,
            receiver_profile_id: receiver.id,
        })
    }

    async fn scope(&self, conversation: &ConversationKey) -> Result<Scope> {
        match conversation {
            ConversationKey::Booking(id) => {
                let booking = self
                    .directory
                    .booking(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("booking {}", id)))?;
                Ok(Scope {
                    read_only_reason: booking
                        .status
                        .is_read_only()
                        .then(|| format!("booking is {}", booking.status.as_str())),
                    customer_account_id: booking.customer_account_id,
                    provider_id: booking.provider_id,
                })
            }
            ConversationKey::Inquiry(id) => {
                let inquiry = self
                    .directory
                    .inquiry(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("inquiry {}", id)))?;
                Ok(Scope {
                    read_only_reason: inquiry
                        .is_read_only()
                        .then(|| "inquiry is closed".to_string()),
                    customer_account_id: inquiry.customer_account_id,
                    provider_id: inquiry.provider_id,
                })
            }
        }
    }

    /// Returns the user's role and the counterpart's account id
    async fn sides(&self, conversation: &ConversationKey, scope: &Scope) -> Result<(Role, String)> {
        let provider = self
            .directory
            .provider(&scope.provider_id)
            .await?
            .ok_or_else(|| {
                Error::ReceiverNotFound(format!("provider {} not found", scope.provider_id))
            })?;

        if self.auth.account_id == scope.customer_account_id {
            Ok((Role::Customer, provider.owner_account_id))
        } else if self.auth.account_id == provider.owner_account_id {
            Ok((Role::Provider, scope.customer_account_id.clone()))
        } else {
            Err(Error::ReceiverNotFound(format!(
                "account {} is not a participant of {}",
                self.auth.account_id, conversation
            )))
        }
    }
}
