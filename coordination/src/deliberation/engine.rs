//! Discussion runner.
//!
//! Each call to [`DeliberationEngine::process`] owns one discussion record,
//! keyed by a fresh id, from creation until it is removed on exit. The
//! record is removed on every path, including failures.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::authority::{AuthorityInput, Decision, DecisionAuthority};
use super::participant::{
    Contribution, MessageKind, ParticipantError, ParticipantMessage, ParticipantReply,
    ParticipantResult, ParticipantRole, SharedParticipant,
};
use super::voting::{tally, ConsensusResult};
use super::workflows::{analyze_task, workflow_for, DeliberationWorkflow, TaskAnalysis, TaskType};
use super::{DeliberationError, DeliberationResult};
use crate::config::DeliberationConfig;
use crate::events::{CoordinationEvent, SharedEventBus};
use crate::subsystems::{
    Subsystem, SubsystemKind, SubsystemRequest, SubsystemResponse, SubsystemResult, DELIBERATION,
};

/// Insights forwarded to participants in each phase message
const MAX_PRIOR_INSIGHTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionState {
    Idle,
    Initiated,
    PhaseExecution,
    Consensus,
    Decided,
}

/// Read-only view of an active discussion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionSummary {
    pub id: String,
    pub workflow: String,
    pub state: DiscussionState,
    pub participants: Vec<String>,
    pub current_phase: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// One message sent to the council
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub discussion_id: String,
    pub kind: MessageKind,
    pub phase: Option<String>,
    pub recipients: usize,
    pub responses: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: String,
    pub responded: usize,
    pub active: usize,
    /// `responded / active` reached the success ratio
    pub successful: bool,
}

/// Everything a discussion produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationOutcome {
    pub discussion_id: String,
    pub workflow: String,
    pub task_type: TaskType,
    pub participants: Vec<String>,
    pub phases: Vec<PhaseOutcome>,
    pub contributions: Vec<Contribution>,
    pub consensus: Option<ConsensusResult>,
    pub decision: Decision,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliberationStats {
    pub discussions: u64,
    /// Non-fallback decisions
    pub decisions: u64,
    pub consensus_achieved: u64,
    pub fallbacks: u64,
    /// Mean confidence over all decisions, fallbacks included
    pub average_confidence: f64,
}

/// Per-discussion scratch space
#[derive(Debug, Default)]
pub struct SharedContext {
    entries: Mutex<HashMap<String, Map<String, Value>>>,
}

impl SharedContext {
    pub fn get(&self, discussion_id: &str, key: &str) -> Option<Value> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(discussion_id).and_then(|m| m.get(key)).cloned()
    }

    pub fn set(&self, discussion_id: &str, key: &str, value: Value) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(discussion_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Drop everything stored for a discussion
    pub fn remove(&self, discussion_id: &str) -> Option<Map<String, Value>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(discussion_id)
    }

    pub fn entries(&self, discussion_id: &str) -> Map<String, Value> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(discussion_id).cloned().unwrap_or_default()
    }
}

/// Shared handle to the engine
pub type SharedDeliberationEngine = Arc<DeliberationEngine>;

struct Discussion {
    workflow: String,
    state: DiscussionState,
    participants: Vec<String>,
    current_phase: Option<String>,
    started_at: DateTime<Utc>,
}

/// What a discussion has gathered so far; survives a failed run
#[derive(Default)]
struct Progress {
    participants: Vec<String>,
    phases: Vec<PhaseOutcome>,
    contributions: Vec<Contribution>,
    consensus: Option<ConsensusResult>,
}

#[derive(Default)]
struct StatsAccumulator {
    stats: DeliberationStats,
    confidence_sum: f64,
}

pub struct DeliberationEngine {
    participants: Vec<SharedParticipant>,
    config: DeliberationConfig,
    authority: DecisionAuthority,
    active: RwLock<HashMap<String, Discussion>>,
    broadcasts: Mutex<VecDeque<Broadcast>>,
    shared_context: SharedContext,
    stats: Mutex<StatsAccumulator>,
    events: Option<SharedEventBus>,
}

impl DeliberationEngine {
    pub fn new(participants: Vec<SharedParticipant>, config: DeliberationConfig) -> Self {
        Self {
            participants,
            authority: DecisionAuthority::new(config.conflict_threshold),
            config,
            active: RwLock::new(HashMap::new()),
            broadcasts: Mutex::new(VecDeque::new()),
            shared_context: SharedContext::default(),
            stats: Mutex::new(StatsAccumulator::default()),
            events: None,
        }
    }

    pub fn with_events(mut self, bus: SharedEventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn shared(self) -> SharedDeliberationEngine {
        Arc::new(self)
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.id().to_string()).collect()
    }

    /// Run one discussion. Never fails: errors become a fallback decision.
    pub async fn process(&self, input: &str, context: &Map<String, Value>) -> DeliberationOutcome {
        let started = Instant::now();
        let discussion_id = Uuid::new_v4().to_string();
        let analysis = analyze_task(input, context);
        let workflow = workflow_for(analysis.task_type);

        info!(
            discussion_id = %discussion_id,
            workflow = %workflow.name,
            complexity = analysis.complexity,
            "Starting deliberation"
        );

        let mut progress = Progress::default();
        let result = match self.open(&discussion_id, &workflow).await {
            Ok(()) => {
                self.run(&discussion_id, input, context, &analysis, &workflow, &mut progress)
                    .await
            }
            Err(e) => Err(e),
        };
        self.close(&discussion_id).await;

        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                warn!(discussion_id = %discussion_id, error = %e, "Deliberation fell back");
                Decision::fallback(e.to_string())
            }
        };

        let consensus_achieved = progress.consensus.as_ref().is_some_and(|c| c.achieved);
        self.record_stats(&decision, consensus_achieved);

        if let Some(bus) = &self.events {
            bus.publish(CoordinationEvent::DeliberationDecided {
                discussion_id: discussion_id.clone(),
                workflow: workflow.name.clone(),
                confidence: decision.confidence,
                consensus_achieved,
                quality_level: decision.quality.level,
                timestamp: Utc::now(),
            });
        }

        info!(
            discussion_id = %discussion_id,
            confidence = decision.confidence,
            quality = %decision.quality.level,
            fallback = decision.fallback,
            "Deliberation decided"
        );

        DeliberationOutcome {
            discussion_id,
            workflow: workflow.name,
            task_type: analysis.task_type,
            participants: progress.participants,
            phases: progress.phases,
            contributions: progress.contributions,
            consensus: progress.consensus,
            decision,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run(
        &self,
        discussion_id: &str,
        input: &str,
        context: &Map<String, Value>,
        analysis: &TaskAnalysis,
        workflow: &DeliberationWorkflow,
        progress: &mut Progress,
    ) -> DeliberationResult<Decision> {
        let selected = self.select_participants(workflow, analysis)?;

        // ── Invitation ──
        let replies = self
            .broadcast(
                discussion_id,
                workflow,
                MessageKind::CollaborationInvite,
                None,
                input,
                context,
                Vec::new(),
                None,
                &selected,
                self.config.phase_timeout(),
            )
            .await;
        let active: Vec<SharedParticipant> = replies
            .into_iter()
            .filter_map(|(participant, reply)| match reply {
                Ok(reply) if reply.success => Some(participant),
                Ok(_) => {
                    debug!(participant = participant.id(), "Participant declined invitation");
                    None
                }
                Err(e) => {
                    warn!(participant = participant.id(), error = %e, "Invitation failed");
                    None
                }
            })
            .collect();
        if active.is_empty() {
            return Err(DeliberationError::NoParticipants);
        }
        progress.participants = active.iter().map(|p| p.id().to_string()).collect();
        self.update(discussion_id, |d| {
            d.participants = progress.participants.clone();
        })
        .await;

        // ── Phases ──
        for phase in &workflow.phases {
            self.transition(discussion_id, DiscussionState::PhaseExecution, Some(phase))
                .await;
            let prior = prior_insights(&progress.contributions);
            let replies = self
                .broadcast(
                    discussion_id,
                    workflow,
                    MessageKind::PhaseExecution,
                    Some(phase),
                    input,
                    context,
                    prior,
                    None,
                    &active,
                    self.config.phase_timeout(),
                )
                .await;

            let mut phase_insights = Vec::new();
            let mut responded = 0;
            for (participant, reply) in replies {
                match reply {
                    Ok(reply) if reply.success => {
                        responded += 1;
                        phase_insights.extend(reply.insights.iter().cloned());
                        progress.contributions.push(Contribution {
                            participant_id: participant.id().to_string(),
                            role: participant.role(),
                            phase: phase.clone(),
                            payload: reply.content.unwrap_or_default(),
                            insights: reply.insights,
                            confidence: reply.confidence.clamp(0.0, 1.0),
                            timestamp: Utc::now(),
                        });
                    }
                    Ok(_) => debug!(participant = participant.id(), phase = %phase, "No contribution"),
                    Err(e) => warn!(participant = participant.id(), phase = %phase, error = %e, "Contribution failed"),
                }
            }

            let successful =
                responded as f64 / active.len() as f64 >= self.config.phase_success_ratio;
            if !successful {
                warn!(
                    discussion_id,
                    phase = %phase,
                    responded,
                    active = active.len(),
                    "Phase below success ratio, keeping partial contributions"
                );
            }
            self.shared_context
                .set(discussion_id, phase, json!(phase_insights));
            progress.phases.push(PhaseOutcome {
                phase: phase.clone(),
                responded,
                active: active.len(),
                successful,
            });
        }

        // ── Vote ──
        if workflow.requires_consensus {
            self.transition(discussion_id, DiscussionState::Consensus, None)
                .await;
            let proposal = proposal(&progress.contributions);
            let replies = self
                .broadcast(
                    discussion_id,
                    workflow,
                    MessageKind::ConsensusRequest,
                    None,
                    input,
                    context,
                    prior_insights(&progress.contributions),
                    proposal,
                    &active,
                    self.config.vote_timeout(),
                )
                .await;
            let votes: Vec<(String, ParticipantReply)> = replies
                .into_iter()
                .filter_map(|(participant, reply)| match reply {
                    Ok(reply) if reply.success => Some((participant.id().to_string(), reply)),
                    _ => None,
                })
                .collect();
            let consensus = tally(&votes, self.config.consensus_threshold);
            debug!(
                discussion_id,
                score = consensus.score,
                achieved = consensus.achieved,
                voters = votes.len(),
                "Vote tallied"
            );
            progress.consensus = Some(consensus);
        }

        // ── Decision ──
        self.transition(discussion_id, DiscussionState::Decided, None)
            .await;
        self.authority.decide(AuthorityInput {
            analysis,
            contributions: &progress.contributions,
            consensus: progress.consensus.as_ref(),
        })
    }

    /// Required roles must be present; optional roles join when one of
    /// their specialties is needed; coordinators always join.
    fn select_participants(
        &self,
        workflow: &DeliberationWorkflow,
        analysis: &TaskAnalysis,
    ) -> DeliberationResult<Vec<SharedParticipant>> {
        for role in &workflow.required {
            if !self.participants.iter().any(|p| p.role() == *role) {
                return Err(DeliberationError::MissingRequiredRole(*role));
            }
        }
        let selected = self
            .participants
            .iter()
            .filter(|p| {
                let role = p.role();
                workflow.required.contains(&role)
                    || role == ParticipantRole::Coordinator
                    || (workflow.optional.contains(&role)
                        && p.specialties()
                            .iter()
                            .any(|s| analysis.required_expertise.contains(s)))
            })
            .cloned()
            .collect();
        Ok(selected)
    }

    #[allow(clippy::too_many_arguments)]
    async fn broadcast(
        &self,
        discussion_id: &str,
        workflow: &DeliberationWorkflow,
        kind: MessageKind,
        phase: Option<&String>,
        input: &str,
        context: &Map<String, Value>,
        prior_insights: Vec<String>,
        proposal: Option<String>,
        recipients: &[SharedParticipant],
        deadline: Duration,
    ) -> Vec<(SharedParticipant, ParticipantResult<ParticipantReply>)> {
        let message = ParticipantMessage {
            kind,
            discussion_id: discussion_id.to_string(),
            workflow: workflow.name.clone(),
            phase: phase.cloned(),
            input: input.to_string(),
            context: context.clone(),
            prior_insights,
            proposal,
        };
        let timeout_ms = deadline.as_millis() as u64;

        let calls = recipients.iter().map(|participant| {
            let message = &message;
            async move {
                let result = match tokio::time::timeout(deadline, participant.respond(message)).await {
                    Ok(result) => result,
                    Err(_) => Err(ParticipantError::Timeout {
                        participant: participant.id().to_string(),
                        timeout_ms,
                    }),
                };
                (participant.clone(), result)
            }
        });
        let results = join_all(calls).await;

        let responses = results
            .iter()
            .filter(|(_, r)| r.as_ref().is_ok_and(|reply| reply.success))
            .count();
        self.record_broadcast(Broadcast {
            discussion_id: discussion_id.to_string(),
            kind,
            phase: phase.cloned(),
            recipients: recipients.len(),
            responses,
            timestamp: Utc::now(),
        });
        results
    }

    // ── Discussion records ──────────────────────────────────────────

    async fn open(&self, discussion_id: &str, workflow: &DeliberationWorkflow) -> DeliberationResult<()> {
        let mut active = self.active.write().await;
        if active.len() >= self.config.max_active_discussions {
            return Err(DeliberationError::TooManyDiscussions {
                limit: self.config.max_active_discussions,
            });
        }
        active.insert(
            discussion_id.to_string(),
            Discussion {
                workflow: workflow.name.clone(),
                state: DiscussionState::Initiated,
                participants: Vec::new(),
                current_phase: None,
                started_at: Utc::now(),
            },
        );
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.stats.discussions += 1;
        Ok(())
    }

    async fn close(&self, discussion_id: &str) {
        self.active.write().await.remove(discussion_id);
        self.shared_context.remove(discussion_id);
    }

    async fn update(&self, discussion_id: &str, f: impl FnOnce(&mut Discussion)) {
        if let Some(discussion) = self.active.write().await.get_mut(discussion_id) {
            f(discussion);
        }
    }

    async fn transition(&self, discussion_id: &str, state: DiscussionState, phase: Option<&String>) {
        self.update(discussion_id, |d| {
            d.state = state;
            d.current_phase = phase.cloned();
        })
        .await;
    }

    fn record_broadcast(&self, broadcast: Broadcast) {
        let mut history = self.broadcasts.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() >= self.config.broadcast_history_size.max(1) {
            history.pop_front();
        }
        history.push_back(broadcast);
    }

    fn record_stats(&self, decision: &Decision, consensus_achieved: bool) {
        let mut acc = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        if decision.fallback {
            acc.stats.fallbacks += 1;
        } else {
            acc.stats.decisions += 1;
        }
        if consensus_achieved {
            acc.stats.consensus_achieved += 1;
        }
        acc.confidence_sum += decision.confidence;
        let decided = acc.stats.decisions + acc.stats.fallbacks;
        acc.stats.average_confidence = acc.confidence_sum / decided as f64;
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// State of a discussion; `Idle` once it has finished or if unknown
    pub async fn discussion_state(&self, discussion_id: &str) -> DiscussionState {
        self.active
            .read()
            .await
            .get(discussion_id)
            .map(|d| d.state)
            .unwrap_or(DiscussionState::Idle)
    }

    pub async fn active_discussions(&self) -> Vec<DiscussionSummary> {
        let active = self.active.read().await;
        let mut summaries: Vec<DiscussionSummary> = active
            .iter()
            .map(|(id, d)| DiscussionSummary {
                id: id.clone(),
                workflow: d.workflow.clone(),
                state: d.state,
                participants: d.participants.clone(),
                current_phase: d.current_phase.clone(),
                started_at: d.started_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    /// Most recent broadcasts, newest last
    pub fn broadcast_history(&self, limit: usize) -> Vec<Broadcast> {
        let history = self.broadcasts.lock().unwrap_or_else(|e| e.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn shared_context(&self) -> &SharedContext {
        &self.shared_context
    }

    pub fn stats(&self) -> DeliberationStats {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats
            .clone()
    }
}

fn prior_insights(contributions: &[Contribution]) -> Vec<String> {
    let mut insights: Vec<String> = Vec::new();
    for insight in contributions.iter().rev().flat_map(|c| c.insights.iter()) {
        if insights.len() == MAX_PRIOR_INSIGHTS {
            break;
        }
        if !insights.contains(insight) {
            insights.push(insight.clone());
        }
    }
    insights
}

/// Highest-confidence contribution from the latest phase that produced any
fn proposal(contributions: &[Contribution]) -> Option<String> {
    let last_phase = &contributions.last()?.phase;
    contributions
        .iter()
        .filter(|c| &c.phase == last_phase && !c.payload.trim().is_empty())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        .map(|c| c.payload.clone())
}

#[async_trait]
impl Subsystem for DeliberationEngine {
    fn name(&self) -> &str {
        DELIBERATION
    }

    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Deliberation
    }

    async fn invoke(&self, request: &SubsystemRequest) -> SubsystemResult<SubsystemResponse> {
        let mut context = request.context.clone();
        if !request.sources.is_empty() {
            context.insert("sources".to_string(), json!(request.sources));
        }
        let outcome = self.process(&request.text, &context).await;
        let decision = &outcome.decision;

        let mut response = SubsystemResponse::new(
            DELIBERATION,
            SubsystemKind::Deliberation,
            decision.recommendation.clone(),
            decision.confidence,
        );
        response.reasoning = Some(decision.rationale.clone());
        response.sources = outcome.participants.clone();
        response
            .metadata
            .insert("discussion_id".to_string(), json!(outcome.discussion_id));
        response
            .metadata
            .insert("workflow".to_string(), json!(outcome.workflow));
        response
            .metadata
            .insert("quality_level".to_string(), json!(decision.quality.level));
        response.metadata.insert(
            "consensus_achieved".to_string(),
            json!(outcome.consensus.as_ref().is_some_and(|c| c.achieved)),
        );
        response
            .metadata
            .insert("fallback".to_string(), json!(decision.fallback));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliberation::participant::Participant;
    use crate::deliberation::voting::Vote;
    use crate::events::EventBus;

    struct StubParticipant {
        id: String,
        role: ParticipantRole,
        vote: Vote,
        delay: Option<Duration>,
    }

    impl StubParticipant {
        fn shared(role: ParticipantRole, vote: Vote) -> SharedParticipant {
            Arc::new(Self {
                id: role.as_str().to_string(),
                role,
                vote,
                delay: None,
            })
        }

        fn slow(role: ParticipantRole, delay: Duration) -> SharedParticipant {
            Arc::new(Self {
                id: role.as_str().to_string(),
                role,
                vote: Vote::Agree,
                delay: Some(delay),
            })
        }
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
            if let (Some(delay), MessageKind::PhaseExecution) = (self.delay, message.kind) {
                tokio::time::sleep(delay).await;
            }
            Ok(match message.kind {
                MessageKind::CollaborationInvite => ParticipantReply::accept(),
                MessageKind::PhaseExecution => ParticipantReply::contribution(
                    format!("{} view on {}", self.id, message.phase.clone().unwrap_or_default()),
                    vec![format!("{} insight", self.id)],
                    0.8,
                ),
                MessageKind::ConsensusRequest => {
                    ParticipantReply::vote(self.vote, Some("Adjust pricing gradually".to_string()), 0.8)
                }
            })
        }
    }

    fn council(vote: Vote) -> Vec<SharedParticipant> {
        vec![
            StubParticipant::shared(ParticipantRole::Analyst, vote),
            StubParticipant::shared(ParticipantRole::Strategist, vote),
            StubParticipant::shared(ParticipantRole::Researcher, vote),
            StubParticipant::shared(ParticipantRole::Critic, vote),
            StubParticipant::shared(ParticipantRole::Coordinator, vote),
        ]
    }

    const PRICING: &str = "Assess the risk of our pricing change";

    #[tokio::test]
    async fn test_problem_solving_reaches_consensus() {
        let bus = EventBus::new().shared();
        let engine = DeliberationEngine::new(council(Vote::Agree), DeliberationConfig::default())
            .with_events(bus.clone());

        let outcome = engine.process(PRICING, &Map::new()).await;

        assert_eq!(outcome.workflow, "problem_solving");
        // researcher has no matching specialty for "risk"
        assert_eq!(outcome.participants, vec!["analyst", "strategist", "critic", "coordinator"]);
        assert_eq!(outcome.phases.len(), 4);
        assert!(outcome.phases.iter().all(|p| p.successful));
        assert_eq!(outcome.contributions.len(), 16);
        let consensus = outcome.consensus.unwrap();
        assert!(consensus.achieved);
        assert_eq!(consensus.score, 0.75);
        assert!(!outcome.decision.fallback);
        assert_eq!(outcome.decision.recommendation, "Adjust pricing gradually");

        assert!(engine.active_discussions().await.is_empty());
        assert_eq!(
            engine.discussion_state(&outcome.discussion_id).await,
            DiscussionState::Idle
        );
        assert!(engine.shared_context().entries(&outcome.discussion_id).is_empty());

        let stats = engine.stats();
        assert_eq!(stats.discussions, 1);
        assert_eq!(stats.decisions, 1);
        assert_eq!(stats.consensus_achieved, 1);
        assert_eq!(bus.history().of_type("deliberation_decided", 10).len(), 1);
    }

    #[tokio::test]
    async fn test_missing_required_role_falls_back() {
        let engine = DeliberationEngine::new(
            vec![StubParticipant::shared(ParticipantRole::Creative, Vote::Agree)],
            DeliberationConfig::default(),
        );
        let outcome = engine.process(PRICING, &Map::new()).await;

        assert!(outcome.decision.fallback);
        assert_eq!(outcome.decision.confidence, 0.1);
        assert!(engine.active_discussions().await.is_empty());
        assert_eq!(engine.stats().fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_participants_keep_partial_phase() {
        let config = DeliberationConfig {
            phase_timeout_ms: 50,
            ..Default::default()
        };
        let engine = DeliberationEngine::new(
            vec![
                StubParticipant::slow(ParticipantRole::Analyst, Duration::from_secs(5)),
                StubParticipant::slow(ParticipantRole::Strategist, Duration::from_secs(5)),
                StubParticipant::shared(ParticipantRole::Coordinator, Vote::Agree),
            ],
            config,
        );
        let outcome = engine.process(PRICING, &Map::new()).await;

        assert_eq!(outcome.participants.len(), 3);
        for phase in &outcome.phases {
            assert_eq!(phase.responded, 1);
            assert!(!phase.successful);
        }
        // partial contributions are still used
        assert_eq!(outcome.contributions.len(), 4);
        assert!(!outcome.decision.fallback);
    }

    #[tokio::test]
    async fn test_content_creation_skips_vote() {
        let engine = DeliberationEngine::new(
            vec![
                StubParticipant::shared(ParticipantRole::Creative, Vote::Agree),
                StubParticipant::shared(ParticipantRole::Coordinator, Vote::Agree),
            ],
            DeliberationConfig::default(),
        );
        let outcome = engine.process("Draft a slogan for the launch", &Map::new()).await;
        assert_eq!(outcome.workflow, "content_creation");
        assert!(outcome.consensus.is_none());
        assert_eq!(outcome.phases.len(), 3);
        assert!(!outcome.decision.fallback);
    }

    #[tokio::test]
    async fn test_broadcast_history_is_bounded() {
        let config = DeliberationConfig {
            broadcast_history_size: 3,
            ..Default::default()
        };
        let engine = DeliberationEngine::new(council(Vote::Agree), config);
        engine.process(PRICING, &Map::new()).await;

        let history = engine.broadcast_history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().map(|b| b.kind), Some(MessageKind::ConsensusRequest));
    }

    #[tokio::test]
    async fn test_invoke_as_subsystem() {
        let engine = DeliberationEngine::new(council(Vote::StronglyAgree), DeliberationConfig::default());
        let response = engine.invoke(&SubsystemRequest::new(PRICING)).await.unwrap();
        assert_eq!(response.subsystem, DELIBERATION);
        assert_eq!(response.kind, SubsystemKind::Deliberation);
        assert_eq!(response.content, "Adjust pricing gradually");
        assert_eq!(response.metadata.get("consensus_achieved"), Some(&json!(true)));
    }

    #[test]
    fn test_shared_context_accessors() {
        let ctx = SharedContext::default();
        ctx.set("d-1", "analysis", json!(["a"]));
        assert_eq!(ctx.get("d-1", "analysis"), Some(json!(["a"])));
        assert_eq!(ctx.get("d-2", "analysis"), None);
        assert!(ctx.remove("d-1").is_some());
        assert!(ctx.entries("d-1").is_empty());
    }
}
