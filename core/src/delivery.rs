/// Delivery state machine for optimistic message slots
use crate::types::{DeliveryTag, MessageId};

/// Input for one slot's delivery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryTransition {
    /// Server response or real-time echo confirmed the slot.
    Confirm,
    /// The send request failed.
    Fail,
    /// User asked to resend a failed slot.
    Retry,
}

/// Rejection reason for illegal delivery transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRejection {
    AlreadyConfirmed,
    NotSending,
    NotFailed,
}

pub type DeliveryResult = Result<DeliveryTag, DeliveryRejection>;

impl DeliveryTag {
    /// Applies one transition.
    ///
    /// `Sent` is terminal. `Sending` may confirm or fail, `Error` may only be retried.
    pub fn apply(self, transition: DeliveryTransition) -> DeliveryResult {
        match (self, transition) {
            (DeliveryTag::Sent, _) => Err(DeliveryRejection::AlreadyConfirmed),
            (DeliveryTag::Sending(_), DeliveryTransition::Confirm) => Ok(DeliveryTag::Sent),
            (DeliveryTag::Sending(temp_id), DeliveryTransition::Fail) => Ok(DeliveryTag::Error(temp_id)),
            (DeliveryTag::Error(temp_id), DeliveryTransition::Retry) => Ok(DeliveryTag::Sending(temp_id)),
            // An echo can confirm a slot whose HTTP request already failed.
            (DeliveryTag::Error(_), DeliveryTransition::Confirm) => Ok(DeliveryTag::Sent),
            (DeliveryTag::Error(_), DeliveryTransition::Fail) => Err(DeliveryRejection::NotSending),
            (DeliveryTag::Sending(_), DeliveryTransition::Retry) => Err(DeliveryRejection::NotFailed),
        }
    }

    /// Temporary id of a pending slot.
    pub fn temp_id(&self) -> Option<MessageId> {
        match self {
            DeliveryTag::Sending(id) | DeliveryTag::Error(id) => Some(*id),
            DeliveryTag::Sent => None,
        }
    }
}
