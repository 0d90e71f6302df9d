//! Negotiation proposals and their lifecycle.
//!
//! `pending -> accepted | rejected | countered`. A counter atomically marks
//! the original `countered` and opens a new `pending` proposal whose
//! `parent_id` points back at it. A pending proposal whose `expires_at` has
//! been reached counts as rejected no matter what the stored state says.

use crate::chat::{ChatMessage, MessageKind};
use crate::error::{Result, SessionError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    Price,
    Exchange,
    Meetup,
    Terms,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Pending,
    Accepted,
    Rejected,
    Countered,
}

impl ProposalState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ProposalState::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Accept,
    Reject,
    Counter,
}

impl ResponseAction {
    fn target(self) -> ProposalState {
        match self {
            ResponseAction::Accept => ProposalState::Accepted,
            ResponseAction::Reject => ProposalState::Rejected,
            ResponseAction::Counter => ProposalState::Countered,
        }
    }
}

impl fmt::Display for ResponseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseAction::Accept => "accept",
            ResponseAction::Reject => "reject",
            ResponseAction::Counter => "counter",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    #[serde(default, alias = "authorId", alias = "proposer_id")]
    pub author_id: String,
    #[serde(alias = "proposal_type")]
    pub kind: ProposalKind,
    pub description: String,
    #[serde(default, alias = "proposedPrice")]
    pub proposed_price: Option<f64>,
    #[serde(default, alias = "proposedMeetupTime")]
    pub proposed_meetup_time: Option<DateTime<Utc>>,
    #[serde(default, alias = "proposedLocation")]
    pub proposed_location: Option<String>,
    #[serde(alias = "status")]
    pub state: ProposalState,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(alias = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, alias = "parentId", alias = "counter_of")]
    pub parent_id: Option<String>,
}

impl Proposal {
    /// Expiry boundary is inclusive: at `expires_at` the offer is gone.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.state == ProposalState::Pending && !self.is_expired(now)
    }

    /// State as the user should see it.
    pub fn effective_state(&self, now: DateTime<Utc>) -> ProposalState {
        if self.state == ProposalState::Pending && self.is_expired(now) {
            ProposalState::Rejected
        } else {
            self.state
        }
    }
}

/// User input for a new proposal or a counter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProposalDraft {
    pub kind: Option<ProposalKind>,
    pub description: String,
    pub proposed_price: Option<f64>,
    pub proposed_meetup_time: Option<DateTime<Utc>>,
    pub proposed_location: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProposalDraft {
    pub fn new(kind: ProposalKind, description: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn price(amount: f64, description: impl Into<String>) -> Self {
        Self {
            proposed_price: Some(amount),
            ..Self::new(ProposalKind::Price, description)
        }
    }

    pub fn meetup(
        at: DateTime<Utc>,
        location: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            proposed_meetup_time: Some(at),
            proposed_location: Some(location.into()),
            ..Self::new(ProposalKind::Meetup, description)
        }
    }

    pub fn kind(&self) -> ProposalKind {
        self.kind.unwrap_or(ProposalKind::Other)
    }

    pub fn validate(&self) -> Result<()> {
        if self.description.trim().is_empty() {
            return Err(SessionError::Validation(
                "proposal description is required".to_string(),
            ));
        }
        match self.proposed_price {
            Some(price) if !price.is_finite() || price < 0.0 => {
                return Err(SessionError::Validation(
                    "proposed price must be a positive amount".to_string(),
                ));
            }
            None if self.kind() == ProposalKind::Price => {
                return Err(SessionError::Validation(
                    "price proposals need a proposed price".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

/// What a respond call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Accepted(String),
    Rejected(String),
    Countered { original: String, counter: Proposal },
}

/// Marks a proposal as having a response in flight. Hand it back through
/// `complete_response` or `cancel_response`.
#[must_use]
#[derive(Debug)]
pub struct ResponseTicket {
    proposal_id: String,
    action: ResponseAction,
}

impl ResponseTicket {
    pub fn proposal_id(&self) -> &str {
        &self.proposal_id
    }

    pub fn action(&self) -> ResponseAction {
        self.action
    }
}

/// Proposal traffic carried in message metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum ProposalEvent {
    Created(Proposal),
    Responded {
        proposal_id: String,
        action: ResponseAction,
        counter: Option<Proposal>,
    },
}

#[derive(Deserialize)]
struct CreatedPayload {
    proposal: Proposal,
}

#[derive(Deserialize)]
struct RespondedPayload {
    #[serde(alias = "proposalId")]
    proposal_id: String,
    action: ResponseAction,
    #[serde(default, alias = "counterProposal")]
    counter_proposal: Option<Proposal>,
}

impl ProposalEvent {
    pub fn from_message(message: &ChatMessage) -> Option<Self> {
        let metadata = message.metadata.clone()?;
        match message.kind {
            MessageKind::Proposal => serde_json::from_value::<CreatedPayload>(metadata)
                .ok()
                .map(|p| ProposalEvent::Created(p.proposal)),
            MessageKind::ProposalResponse => serde_json::from_value::<RespondedPayload>(metadata)
                .ok()
                .map(|p| ProposalEvent::Responded {
                    proposal_id: p.proposal_id,
                    action: p.action,
                    counter: p.counter_proposal,
                }),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ProposalManager {
    proposals: Vec<Proposal>,
    index: HashMap<String, usize>,
    in_flight: HashSet<String>,
    ttl: Duration,
}

impl ProposalManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            proposals: Vec::new(),
            index: HashMap::new(),
            in_flight: HashSet::new(),
            ttl,
        }
    }

    /// Open a new pending proposal authored locally.
    pub fn submit(
        &mut self,
        draft: ProposalDraft,
        author_id: &str,
        now: DateTime<Utc>,
    ) -> Result<&Proposal> {
        draft.validate()?;
        let proposal = self.build(draft, author_id, now, None);
        let slot = self.insert(proposal);
        Ok(&self.proposals[slot])
    }

    /// Accept, reject or counter a proposal in one step.
    pub fn respond(
        &mut self,
        proposal_id: &str,
        action: ResponseAction,
        counter: Option<ProposalDraft>,
        responder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let counter = match (action, counter) {
            (ResponseAction::Counter, Some(draft)) => {
                draft.validate()?;
                Some(draft)
            }
            (ResponseAction::Counter, None) => {
                return Err(SessionError::Validation(
                    "a counter needs a new offer".to_string(),
                ))
            }
            _ => None,
        };
        let ticket = self.begin_response(proposal_id, action, now)?;
        let counter = counter.map(|draft| self.build(draft, responder_id, now, Some(proposal_id)));
        self.complete_response(ticket, counter)
    }

    /// Reserve a proposal for a response. Fails while another response is in
    /// flight or once the proposal is no longer open.
    pub fn begin_response(
        &mut self,
        proposal_id: &str,
        action: ResponseAction,
        now: DateTime<Utc>,
    ) -> Result<ResponseTicket> {
        let proposal = self
            .get(proposal_id)
            .ok_or_else(|| unknown_proposal(proposal_id))?;
        if proposal.state.is_terminal() {
            return Err(SessionError::InvalidState(format!(
                "this proposal was already {}",
                state_label(proposal.state)
            )));
        }
        if proposal.is_expired(now) {
            return Err(SessionError::InvalidState("this proposal has expired".to_string()));
        }
        if !self.in_flight.insert(proposal_id.to_string()) {
            return Err(SessionError::InvalidState(
                "a response to this proposal is already in progress".to_string(),
            ));
        }
        Ok(ResponseTicket {
            proposal_id: proposal_id.to_string(),
            action,
        })
    }

    /// Apply a reserved response. For counters, `counter` is the new pending
    /// proposal (server record or locally built).
    pub fn complete_response(
        &mut self,
        ticket: ResponseTicket,
        counter: Option<Proposal>,
    ) -> Result<Resolution> {
        self.in_flight.remove(&ticket.proposal_id);
        self.transition(&ticket.proposal_id, ticket.action, counter)
    }

    pub fn cancel_response(&mut self, ticket: ResponseTicket) {
        self.in_flight.remove(&ticket.proposal_id);
    }

    pub fn is_in_flight(&self, proposal_id: &str) -> bool {
        self.in_flight.contains(proposal_id)
    }

    /// Latest proposal that can still be answered.
    pub fn active_proposal(&self, now: DateTime<Utc>) -> Option<&Proposal> {
        self.proposals
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_open(now))
            .max_by_key(|(seq, p)| (p.created_at, *seq))
            .map(|(_, p)| p)
    }

    /// Merge a proposal learned from the server. Terminal states never regress.
    /// Returns true when anything changed.
    pub fn upsert_remote(&mut self, proposal: Proposal) -> bool {
        match self.index.get(&proposal.id) {
            None => {
                self.insert(proposal);
                true
            }
            Some(&slot) => {
                let existing = &mut self.proposals[slot];
                if existing.state == ProposalState::Pending && proposal.state.is_terminal() {
                    existing.state = proposal.state;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Apply a response made elsewhere (the counterpart, or the echo of our
    /// own). Unknown or already-resolved proposals are left alone.
    pub fn apply_remote_response(
        &mut self,
        proposal_id: &str,
        action: ResponseAction,
        counter: Option<Proposal>,
    ) -> bool {
        let Some(&slot) = self.index.get(proposal_id) else {
            return false;
        };
        let mut changed = false;
        if self.proposals[slot].state == ProposalState::Pending {
            self.proposals[slot].state = action.target();
            changed = true;
        }
        if let (ResponseAction::Counter, Some(mut counter)) = (action, counter) {
            counter.parent_id.get_or_insert_with(|| proposal_id.to_string());
            changed |= self.upsert_remote(counter);
        }
        changed
    }

    pub fn get(&self, proposal_id: &str) -> Option<&Proposal> {
        self.index.get(proposal_id).map(|&slot| &self.proposals[slot])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proposal> {
        self.proposals.iter()
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    /// Negotiation thread ending at `proposal_id`, oldest first.
    pub fn chain(&self, proposal_id: &str) -> Vec<&Proposal> {
        let mut chain = Vec::new();
        let mut cursor = self.get(proposal_id);
        while let Some(p) = cursor {
            if chain.len() > self.proposals.len() {
                break;
            }
            chain.push(p);
            cursor = p.parent_id.as_deref().and_then(|id| self.get(id));
        }
        chain.reverse();
        chain
    }

    pub fn default_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.ttl
    }

    /// Counter to record when the server confirmed a counter without
    /// returning the new proposal. A child already delivered by the realtime
    /// echo wins over a locally built one.
    pub fn local_counter(
        &self,
        parent_id: &str,
        draft: ProposalDraft,
        author_id: &str,
        now: DateTime<Utc>,
    ) -> Proposal {
        let echoed = self
            .proposals
            .iter()
            .filter(|p| p.parent_id.as_deref() == Some(parent_id))
            .max_by_key(|p| p.created_at);
        match echoed {
            Some(existing) => existing.clone(),
            None => self.build(draft, author_id, now, Some(parent_id)),
        }
    }

    fn build(
        &self,
        draft: ProposalDraft,
        author_id: &str,
        now: DateTime<Utc>,
        parent_id: Option<&str>,
    ) -> Proposal {
        let kind = draft.kind();
        Proposal {
            id: format!("prop-{}", Uuid::new_v4().simple()),
            author_id: author_id.to_string(),
            kind,
            description: draft.description.trim().to_string(),
            proposed_price: draft.proposed_price,
            proposed_meetup_time: draft.proposed_meetup_time,
            proposed_location: draft.proposed_location,
            state: ProposalState::Pending,
            created_at: now,
            expires_at: draft.expires_at.unwrap_or_else(|| self.default_expiry(now)),
            parent_id: parent_id.map(str::to_string),
        }
    }

    fn insert(&mut self, proposal: Proposal) -> usize {
        let slot = self.proposals.len();
        self.index.insert(proposal.id.clone(), slot);
        self.proposals.push(proposal);
        slot
    }

    fn transition(
        &mut self,
        proposal_id: &str,
        action: ResponseAction,
        counter: Option<Proposal>,
    ) -> Result<Resolution> {
        let slot = *self
            .index
            .get(proposal_id)
            .ok_or_else(|| unknown_proposal(proposal_id))?;
        let target = action.target();
        let current = self.proposals[slot].state;
        // The realtime echo of this very response may have landed first.
        if current != ProposalState::Pending && current != target {
            return Err(SessionError::InvalidState(format!(
                "this proposal was already {}",
                state_label(current)
            )));
        }

        let resolution = match action {
            ResponseAction::Accept => Resolution::Accepted(proposal_id.to_string()),
            ResponseAction::Reject => Resolution::Rejected(proposal_id.to_string()),
            ResponseAction::Counter => {
                let mut counter = counter.ok_or_else(|| {
                    SessionError::Validation("a counter needs a new offer".to_string())
                })?;
                counter.parent_id = Some(proposal_id.to_string());
                counter.state = ProposalState::Pending;
                if !self.index.contains_key(&counter.id) {
                    self.insert(counter.clone());
                }
                Resolution::Countered {
                    original: proposal_id.to_string(),
                    counter,
                }
            }
        };
        self.proposals[slot].state = target;
        Ok(resolution)
    }
}

fn unknown_proposal(proposal_id: &str) -> SessionError {
    SessionError::InvalidState(format!("unknown proposal {}", proposal_id))
}

fn state_label(state: ProposalState) -> &'static str {
    match state {
        ProposalState::Pending => "pending",
        ProposalState::Accepted => "accepted",
        ProposalState::Rejected => "rejected",
        ProposalState::Countered => "countered",
    }
}
