//! Disambiguation gate: at most one outstanding "which did you mean?" at a time.

use crate::error::SessionError;
use crate::models::{DisambiguationRequest, SheetEntry};
use crate::resolver::{ReferenceResolver, Resolution};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "state", content = "request", rename_all = "snake_case")]
pub enum GateState {
    #[default]
    Closed,
    Open(DisambiguationRequest),
}

/// Result of choosing a candidate: the placeholder to fill and what the
/// chosen reference resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub pending_entry: SheetEntry,
    pub resolution: Resolution,
}

#[derive(Debug, Default)]
pub struct DisambiguationGate {
    state: GateState,
}

impl DisambiguationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, GateState::Open(_))
    }

    pub fn pending(&self) -> Option<&DisambiguationRequest> {
        match &self.state {
            GateState::Open(request) => Some(request),
            GateState::Closed => None,
        }
    }

    pub fn open(&mut self, request: DisambiguationRequest) -> Result<(), SessionError> {
        if let GateState::Open(current) = &self.state {
            return Err(SessionError::DisambiguationPending(
                current.original_ref.clone(),
            ));
        }
        tracing::debug!(
            citation = %request.original_ref,
            candidates = request.candidates.len(),
            "disambiguation opened"
        );
        self.state = GateState::Open(request);
        Ok(())
    }

    /// Drop the pending entry and close.
    pub fn cancel(&mut self) -> Result<DisambiguationRequest, SessionError> {
        match std::mem::take(&mut self.state) {
            GateState::Open(request) => {
                tracing::debug!(citation = %request.original_ref, "disambiguation cancelled");
                Ok(request)
            }
            GateState::Closed => Err(SessionError::NoDisambiguation),
        }
    }

    /// Re-resolve the chosen candidate and close the gate.
    ///
    /// The gate stays open if `reference` was not offered, or if the future is
    /// dropped before the lookup finishes.
    pub async fn select(
        &mut self,
        resolver: &ReferenceResolver,
        reference: &str,
    ) -> Result<Selection, SessionError> {
        let request = self.pending().ok_or(SessionError::NoDisambiguation)?;
        if !request
            .candidates
            .iter()
            .any(|candidate| candidate.reference == reference)
        {
            return Err(SessionError::UnknownCandidate(reference.to_string()));
        }

        let resolution = resolver.resolve_selected(reference).await;

        let request = self.cancel()?;
        Ok(Selection {
            pending_entry: request.pending_entry,
            resolution,
        })
    }
}
