use fe2o3_amqp::types::messaging::Outcome as DeliveryOutcome;

use crate::link::LinkId;

/// Remote outcome of a delivery forwarded to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected,
    Released,
    Modified,
}

impl From<&DeliveryOutcome> for Outcome {
    fn from(outcome: &DeliveryOutcome) -> Self {
        match outcome {
            DeliveryOutcome::Accepted(_) => Outcome::Accepted,
            DeliveryOutcome::Rejected(_) => Outcome::Rejected,
            DeliveryOutcome::Released(_) => Outcome::Released,
            DeliveryOutcome::Modified(_) => Outcome::Modified,
        }
    }
}

/// Reacts to settled deliveries.
///
/// Once a message is handed to a consumer it counts as delivered; a handler
/// may observe the outcome but the broker core never requeues on its own.
pub trait SettlementHandler: Send {
    fn on_settled(&mut self, link: LinkId, outcome: Outcome);
}

/// Ignores every outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreSettlement;

impl SettlementHandler for IgnoreSettlement {
    fn on_settled(&mut self, _link: LinkId, _outcome: Outcome) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use fe2o3_amqp::types::messaging::{Accepted, Modified, Rejected, Released};

    #[test]
    fn test_each_delivery_outcome_keeps_its_kind() {
        let cases = [
            (DeliveryOutcome::Accepted(Accepted {}), Outcome::Accepted),
            (DeliveryOutcome::Rejected(Rejected { error: None }), Outcome::Rejected),
            (DeliveryOutcome::Released(Released {}), Outcome::Released),
            (
                DeliveryOutcome::Modified(Modified {
                    delivery_failed: Some(true),
                    undeliverable_here: None,
                    message_annotations: None,
                }),
                Outcome::Modified,
            ),
        ];
        for (outcome, expected) in &cases {
            assert_eq!(Outcome::from(outcome), *expected);
        }
    }
}
