//! Progressive disclosure state machine for a match pair
//!
//! ANONYMOUS → TEASER → NDA_PENDING → DISCLOSED, strictly in that order.
//! WITHDRAWN is reachable from any non-terminal stage.

use crate::error::EngineError;
use crate::models::{DisclosureStage, Party};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DisclosureEvent {
    /// Compatibility crossed the teaser threshold.
    TeaserUnlocked { compatibility: f64 },
    InterestExpressed { party: Party },
    /// External NDA service confirmed one party's acceptance.
    NdaAccepted { party: Party },
    Withdrawn { party: Party },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub from: DisclosureStage,
    pub to: DisclosureStage,
    pub event: DisclosureEvent,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PartyFlags {
    pub initiator: bool,
    pub counterparty: bool,
}

impl PartyFlags {
    fn set(&mut self, party: Party) -> bool {
        let slot = match party {
            Party::Initiator => &mut self.initiator,
            Party::Counterparty => &mut self.counterparty,
        };
        let changed = !*slot;
        *slot = true;
        changed
    }

    pub fn both(&self) -> bool {
        self.initiator && self.counterparty
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisclosureState {
    pub stage: DisclosureStage,
    pub interest: PartyFlags,
    pub nda: PartyFlags,
    pub history: Vec<Transition>,
}

impl Default for DisclosureState {
    fn default() -> Self {
        Self {
            stage: DisclosureStage::Anonymous,
            interest: PartyFlags::default(),
            nda: PartyFlags::default(),
            history: Vec::new(),
        }
    }
}

impl DisclosureState {
    /// Fresh state for a new pair, unlocking the teaser when compatibility allows.
    pub fn initial(compatibility: f64, teaser_threshold: f64) -> Self {
        let mut state = Self::default();
        state.refresh(compatibility, teaser_threshold);
        state
    }

    /// Re-evaluate the automatic ANONYMOUS → TEASER step. Never moves backwards.
    pub fn refresh(&mut self, compatibility: f64, teaser_threshold: f64) {
        if self.stage == DisclosureStage::Anonymous && compatibility > teaser_threshold {
            // Only fails outside ANONYMOUS, which was checked above.
            let _ = self.apply(DisclosureEvent::TeaserUnlocked { compatibility });
        }
    }

    pub fn apply(&mut self, event: DisclosureEvent) -> Result<DisclosureStage> {
        let from = self.stage;
        if from.is_terminal() {
            return Err(self.reject(format!("stage is terminal, cannot apply {:?}", event)));
        }

        let to = match event {
            DisclosureEvent::TeaserUnlocked { .. } => {
                if from != DisclosureStage::Anonymous {
                    return Err(self.reject("teaser already unlocked".to_string()));
                }
                DisclosureStage::Teaser
            }
            DisclosureEvent::InterestExpressed { party } => {
                if from != DisclosureStage::Teaser {
                    return Err(self.reject("interest can only be expressed on a teaser".to_string()));
                }
                if !self.interest.set(party) {
                    return Ok(from);
                }
                if self.interest.both() {
                    DisclosureStage::NdaPending
                } else {
                    from
                }
            }
            DisclosureEvent::NdaAccepted { party } => {
                if from != DisclosureStage::NdaPending {
                    return Err(self.reject("NDA requires mutual interest first".to_string()));
                }
                if !self.nda.set(party) {
                    return Ok(from);
                }
                if self.nda.both() {
                    DisclosureStage::Disclosed
                } else {
                    from
                }
            }
            DisclosureEvent::Withdrawn { .. } => DisclosureStage::Withdrawn,
        };

        self.stage = to;
        self.history.push(Transition {
            from,
            to,
            event,
            at: Utc::now(),
        });
        Ok(to)
    }

    fn reject(&self, reason: String) -> EngineError {
        EngineError::InvalidTransition {
            from: self.stage,
            reason,
        }
    }
}
