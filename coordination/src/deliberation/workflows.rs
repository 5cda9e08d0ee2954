//! Council workflows and task analysis.
//!
//! | Workflow            | Required              | Optional                | Phases                                   | Vote |
//! |---------------------|-----------------------|-------------------------|------------------------------------------|------|
//! | problem_solving     | analyst, strategist   | researcher, critic      | analysis, ideation, evaluation, planning | yes  |
//! | knowledge_synthesis | researcher, analyst   | critic                  | gathering, analysis, synthesis           | yes  |
//! | content_creation    | creative              | critic, strategist      | ideation, drafting, review               | no   |
//! | tool_execution      | executor              | analyst                 | planning, execution, verification        | no   |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::participant::ParticipantRole;

/// Kind of work the council is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ProblemSolving,
    KnowledgeSynthesis,
    ContentCreation,
    ToolExecution,
}

/// Template for one discussion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliberationWorkflow {
    pub name: String,
    pub task_type: TaskType,
    pub required: Vec<ParticipantRole>,
    pub optional: Vec<ParticipantRole>,
    pub phases: Vec<String>,
    pub requires_consensus: bool,
}

fn workflow(
    name: &str,
    task_type: TaskType,
    required: &[ParticipantRole],
    optional: &[ParticipantRole],
    phases: &[&str],
    requires_consensus: bool,
) -> DeliberationWorkflow {
    DeliberationWorkflow {
        name: name.to_string(),
        task_type,
        required: required.to_vec(),
        optional: optional.to_vec(),
        phases: phases.iter().map(|p| p.to_string()).collect(),
        requires_consensus,
    }
}

/// Workflow for a task type
pub fn workflow_for(task_type: TaskType) -> DeliberationWorkflow {
    use ParticipantRole::*;
    match task_type {
        TaskType::ProblemSolving => workflow(
            "problem_solving",
            task_type,
            &[Analyst, Strategist],
            &[Researcher, Critic],
            &["analysis", "ideation", "evaluation", "planning"],
            true,
        ),
        TaskType::KnowledgeSynthesis => workflow(
            "knowledge_synthesis",
            task_type,
            &[Researcher, Analyst],
            &[Critic],
            &["gathering", "analysis", "synthesis"],
            true,
        ),
        TaskType::ContentCreation => workflow(
            "content_creation",
            task_type,
            &[Creative],
            &[Critic, Strategist],
            &["ideation", "drafting", "review"],
            false,
        ),
        TaskType::ToolExecution => workflow(
            "tool_execution",
            task_type,
            &[Executor],
            &[Analyst],
            &["planning", "execution", "verification"],
            false,
        ),
    }
}

/// What the council needs to know about the input before it starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAnalysis {
    pub task_type: TaskType,
    pub complexity: f64,
    /// Specialty tags an optional participant must offer to be invited
    pub required_expertise: Vec<String>,
    pub time_pressure: f64,
    pub stakeholder_count: usize,
}

const TOOL_TERMS: &[&str] = &["run", "execute", "deploy", "invoke", "command", "script", "tool"];
const CREATIVE_TERMS: &[&str] = &["write", "draft", "compose", "story", "slogan", "design", "poem"];
const KNOWLEDGE_TERMS: &[&str] = &["summarize", "summary", "research", "overview", "sources", "literature"];

const EXPERTISE_TERMS: &[(&str, &str)] = &[
    ("risk", "risk"),
    ("security", "security"),
    ("review", "review"),
    ("evidence", "evidence"),
    ("data", "data"),
    ("research", "research"),
    ("plan", "planning"),
    ("strategy", "strategy"),
    ("goal", "goals"),
    ("idea", "ideation"),
    ("write", "writing"),
    ("metric", "metrics"),
    ("automate", "automation"),
];

fn number(context: &Map<String, Value>, key: &str) -> Option<f64> {
    context.get(key).and_then(Value::as_f64)
}

/// Classify the council task from text and the optional context signals
/// `reasoning_depth` (0..1), `memory_hits` (count) and
/// `emotional_intensity` (0..1).
pub fn analyze_task(input: &str, context: &Map<String, Value>) -> TaskAnalysis {
    let lowered = input.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has_any = |terms: &[&str]| words.iter().any(|w| terms.contains(w));

    let reasoning_depth = number(context, "reasoning_depth").map(|d| d.clamp(0.0, 1.0));
    let memory_hits = number(context, "memory_hits").map(|m| m.max(0.0));
    let emotional_intensity = number(context, "emotional_intensity").map(|e| e.clamp(0.0, 1.0));

    let task_type = if has_any(TOOL_TERMS) {
        TaskType::ToolExecution
    } else if has_any(CREATIVE_TERMS) || emotional_intensity.is_some_and(|e| e > 0.6) {
        TaskType::ContentCreation
    } else if has_any(KNOWLEDGE_TERMS) || memory_hits.is_some_and(|m| m >= 3.0) {
        TaskType::KnowledgeSynthesis
    } else {
        TaskType::ProblemSolving
    };

    let complexity = match (reasoning_depth, memory_hits, emotional_intensity) {
        (None, None, None) => (words.len() as f64 / 60.0).clamp(0.1, 1.0),
        (depth, hits, intensity) => {
            let depth = depth.unwrap_or(0.5);
            let hits = hits.map(|h| (h / 10.0).min(1.0)).unwrap_or(0.0);
            let intensity = intensity.unwrap_or(0.0);
            (0.5 * depth + 0.3 * hits + 0.2 * intensity).clamp(0.0, 1.0)
        }
    };

    let mut required_expertise: Vec<String> = Vec::new();
    for (term, tag) in EXPERTISE_TERMS {
        if words.iter().any(|w| w.starts_with(term)) && !required_expertise.iter().any(|t| t == tag) {
            required_expertise.push(tag.to_string());
        }
    }

    let time_pressure = number(context, "time_pressure")
        .or_else(|| number(context, "urgency"))
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);
    let stakeholder_count = context
        .get("stakeholders")
        .and_then(|v| match v {
            Value::Array(items) => Some(items.len()),
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            _ => None,
        })
        .unwrap_or(1);

    TaskAnalysis {
        task_type,
        complexity,
        required_expertise,
        time_pressure,
        stakeholder_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_task_type_from_keywords() {
        let empty = Map::new();
        assert_eq!(analyze_task("Run the migration script", &empty).task_type, TaskType::ToolExecution);
        assert_eq!(analyze_task("Draft a launch post", &empty).task_type, TaskType::ContentCreation);
        assert_eq!(
            analyze_task("Summarize the literature on caching", &empty).task_type,
            TaskType::KnowledgeSynthesis
        );
        assert_eq!(
            analyze_task("Our churn doubled, what now", &empty).task_type,
            TaskType::ProblemSolving
        );
    }

    #[test]
    fn test_context_signals() {
        let ctx = context(&[
            ("reasoning_depth", json!(0.8)),
            ("memory_hits", json!(5)),
            ("emotional_intensity", json!(0.2)),
        ]);
        let analysis = analyze_task("Why did churn double", &ctx);
        assert_eq!(analysis.task_type, TaskType::KnowledgeSynthesis);
        let expected = 0.5 * 0.8 + 0.3 * 0.5 + 0.2 * 0.2;
        assert!((analysis.complexity - expected).abs() < 1e-9);

        let ctx = context(&[("emotional_intensity", json!(0.9))]);
        assert_eq!(analyze_task("Help me respond", &ctx).task_type, TaskType::ContentCreation);
    }

    #[test]
    fn test_expertise_and_stakeholders() {
        let ctx = context(&[("stakeholders", json!(["ops", "legal", "sales"])), ("urgency", json!(0.9))]);
        let analysis = analyze_task("Assess the security risk of the plan", &ctx);
        assert_eq!(analysis.required_expertise, vec!["risk", "security", "planning"]);
        assert_eq!(analysis.stakeholder_count, 3);
        assert_eq!(analysis.time_pressure, 0.9);
    }

    #[test]
    fn test_workflow_table() {
        let wf = workflow_for(TaskType::ProblemSolving);
        assert_eq!(wf.phases.len(), 4);
        assert!(wf.requires_consensus);
        assert!(!workflow_for(TaskType::ContentCreation).requires_consensus);
    }
}
