//! Deterministic stand-ins for subsystems and council members

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meridian_coordination::deliberation::{
    MessageKind, ParticipantMessage, ParticipantReply, ParticipantResult,
};
use meridian_coordination::{
    Participant, ParticipantRole, SharedParticipant, SharedSubsystem, Subsystem, SubsystemError,
    SubsystemKind, SubsystemRegistry, SubsystemRequest, SubsystemResponse, SubsystemResult, Vote,
};

/// Answers with fixed content, optionally after a delay
pub struct StubSubsystem {
    pub name: String,
    pub kind: SubsystemKind,
    pub answer: String,
    pub confidence: f64,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl StubSubsystem {
    pub fn new(name: &str, kind: SubsystemKind, answer: &str, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            answer: answer.to_string(),
            confidence,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(name: &str, kind: SubsystemKind, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            answer: format!("{} answer", name),
            confidence: 0.8,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subsystem for StubSubsystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SubsystemKind {
        self.kind
    }

    async fn invoke(&self, _request: &SubsystemRequest) -> SubsystemResult<SubsystemResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(SubsystemResponse::new(
            &self.name,
            self.kind,
            self.answer.clone(),
            self.confidence,
        ))
    }
}

/// Always fails
pub struct BrokenSubsystem {
    pub name: String,
}

#[async_trait]
impl Subsystem for BrokenSubsystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Reasoning
    }

    async fn invoke(&self, _request: &SubsystemRequest) -> SubsystemResult<SubsystemResponse> {
        Err(SubsystemError::failed(&self.name, "backend exploded"))
    }
}

pub fn broken(name: &str) -> SharedSubsystem {
    Arc::new(BrokenSubsystem {
        name: name.to_string(),
    })
}

/// Knowledge and reasoning stubs under their default names
pub fn default_registry() -> SubsystemRegistry {
    SubsystemRegistry::new()
        .with(StubSubsystem::new(
            "knowledge",
            SubsystemKind::Knowledge,
            "Water boils at 100 degrees Celsius at sea level.",
            0.9,
        ))
        .with(StubSubsystem::new(
            "reasoning",
            SubsystemKind::Reasoning,
            "At lower pressure the boiling point drops.",
            0.8,
        ))
}

/// Council member that accepts every invite, contributes a fixed view and
/// votes the same way every time
pub struct StubParticipant {
    id: String,
    role: ParticipantRole,
    vote: Vote,
}

#[async_trait]
impl Participant for StubParticipant {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> ParticipantRole {
        self.role
    }

    async fn respond(&self, message: &ParticipantMessage) -> ParticipantResult<ParticipantReply> {
        Ok(match message.kind {
            MessageKind::CollaborationInvite => ParticipantReply::accept(),
            MessageKind::PhaseExecution => ParticipantReply::contribution(
                format!(
                    "{} view during {}",
                    self.id,
                    message.phase.clone().unwrap_or_default()
                ),
                vec![format!("{} insight", self.id)],
                0.8,
            ),
            MessageKind::ConsensusRequest => {
                ParticipantReply::vote(self.vote, Some("Phase the rollout".to_string()), 0.8)
            }
        })
    }
}

pub fn participant(role: ParticipantRole, vote: Vote) -> SharedParticipant {
    Arc::new(StubParticipant {
        id: role.as_str().to_string(),
        role,
        vote,
    })
}

/// Analyst, strategist, researcher, critic and coordinator, all voting `vote`
pub fn council(vote: Vote) -> Vec<SharedParticipant> {
    [
        ParticipantRole::Analyst,
        ParticipantRole::Strategist,
        ParticipantRole::Researcher,
        ParticipantRole::Critic,
        ParticipantRole::Coordinator,
    ]
    .into_iter()
    .map(|role| participant(role, vote))
    .collect()
}
