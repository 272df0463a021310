use bench_core::{AdvisoryKind, Message};
use std::collections::BTreeSet;

/// Conversations in this domain get corrective advisories between turns.
pub const GUARDED_DOMAIN: &str = "swe-verified";

pub const SHELL_TOOL: &str = "shell";
pub const DEBUG_TOOL: &str = "debug_script";
pub const PLANNING_TOOL: &str = "strategic_planning";
pub const CRITIQUE_TOOL: &str = "critique";
pub const UPDATE_TOOL: &str = "update_textdoc";
pub const CREATE_TOOL: &str = "create_textdoc";

const EXPLORATION_TOOLS: &[&str] = &[
    "tree",
    "cat",
    "search_symbol_definition",
    "search_symbol_usages",
    "search_pattern",
    "search_semantic",
    SHELL_TOOL,
];

/// Ordered checklist; each stage is satisfied once any of its tools was called.
pub const STAGES: [&[&str]; 4] = [
    EXPLORATION_TOOLS,
    &[DEBUG_TOOL],
    &[PLANNING_TOOL],
    &[CRITIQUE_TOOL],
];

const SHELL_BURST: usize = 5;
const DEBUG_LIMIT: usize = 3;
const DIFFICULTY_WINDOW: usize = 20;

pub fn applies_to(domain: &str) -> bool {
    domain == GUARDED_DOMAIN
}

/// Tool-call history of one conversation, rebuilt from scratch every turn.
#[derive(Debug)]
pub struct GuardState<'a> {
    turns: Vec<Vec<&'a str>>,
    current: Vec<&'a str>,
}

impl<'a> GuardState<'a> {
    pub fn from_history(messages: &'a [Message]) -> Self {
        let turns: Vec<Vec<&str>> = messages
            .iter()
            .filter(|m| m.tool_calls.is_some())
            .map(Message::tool_names)
            .collect();
        let current = messages
            .last()
            .map(Message::tool_names)
            .unwrap_or_default();
        Self { turns, current }
    }

    fn total(&self, tool: &str) -> usize {
        self.turns
            .iter()
            .flatten()
            .filter(|name| **name == tool)
            .count()
    }

    fn current_count(&self, tool: &str) -> usize {
        self.current.iter().filter(|name| **name == tool).count()
    }

    fn current_calls(&self, tool: &str) -> bool {
        self.current_count(tool) > 0
    }

    /// Index of the first stage with no matching call anywhere in history.
    pub fn first_unsatisfied_stage(&self) -> Option<usize> {
        STAGES.iter().position(|tools| {
            !self
                .turns
                .iter()
                .flatten()
                .any(|name| tools.contains(name))
        })
    }

    fn window_tool_set(&self) -> BTreeSet<&'a str> {
        let skip = self.turns.len().saturating_sub(DIFFICULTY_WINDOW);
        self.turns.iter().skip(skip).flatten().copied().collect()
    }
}

fn advisory_text(kind: AdvisoryKind, current: &[&str]) -> String {
    match kind {
        AdvisoryKind::PreferDebugger => "💿 Use `debug_script()` instead of `shell()`. Dig deeper than previous attempts, use breakpoints inside the project.".to_string(),
        AdvisoryKind::DebuggerLimit => "💿 You cannot call debug_script more than 3 times.".to_string(),
        AdvisoryKind::PlanBeforeEdit => "💿 Call strategic_planning() before changing the project.".to_string(),
        AdvisoryKind::Difficulties => "💿 If you have difficulties with the correct solution, consider using `debug_script()` or `strategic_planning()`".to_string(),
        AdvisoryKind::RevisitedStage => format!(
            "💿 You cannot call {:?} since you are revisiting a previous step. Please, follow the strategy",
            current
        ),
    }
}

/// Picks the single advisory the latest turn earns, if any.
pub fn evaluate(messages: &[Message]) -> Option<Message> {
    let state = GuardState::from_history(messages);
    if state.current.is_empty() {
        return None;
    }
    if state.first_unsatisfied_stage().is_some() {
        return None;
    }

    let shell_count = state.current_count(SHELL_TOOL);
    let edits_now = state.current_calls(UPDATE_TOOL) || state.current_calls(CREATE_TOOL);

    let kind = if shell_count > 0 && shell_count % SHELL_BURST == 0 {
        Some(AdvisoryKind::PreferDebugger)
    } else if state.current_calls(DEBUG_TOOL) && state.total(DEBUG_TOOL) > DEBUG_LIMIT {
        Some(AdvisoryKind::DebuggerLimit)
    } else if edits_now && state.total(PLANNING_TOOL) == 0 && state.total(DEBUG_TOOL) > 0 {
        Some(AdvisoryKind::PlanBeforeEdit)
    } else if is_edit_loop(&state.window_tool_set()) && !difficulties_issued_recently(messages) {
        Some(AdvisoryKind::Difficulties)
    } else if revisits_passed_stage(&state.current) {
        Some(AdvisoryKind::RevisitedStage)
    } else {
        None
    };

    kind.map(|kind| Message::advisory(kind, advisory_text(kind, &state.current)))
}

/// Appends at most one advisory to `messages` and reports which one.
pub fn apply(messages: &mut Vec<Message>) -> Option<AdvisoryKind> {
    let advisory = evaluate(messages)?;
    let kind = advisory.advisory;
    messages.push(advisory);
    kind
}

fn is_edit_loop(tools: &BTreeSet<&str>) -> bool {
    let shell_edit: BTreeSet<&str> = [SHELL_TOOL, UPDATE_TOOL].into_iter().collect();
    let shell_edit_create: BTreeSet<&str> =
        [SHELL_TOOL, UPDATE_TOOL, CREATE_TOOL].into_iter().collect();
    *tools == shell_edit || *tools == shell_edit_create
}

fn difficulties_issued_recently(messages: &[Message]) -> bool {
    let skip = messages.len().saturating_sub(DIFFICULTY_WINDOW);
    messages
        .iter()
        .skip(skip)
        .any(|m| m.advisory == Some(AdvisoryKind::Difficulties))
}

// With every stage satisfied the last stage is current; tools that belong
// only to earlier stages count as going back.
fn revisits_passed_stage(current: &[&str]) -> bool {
    let current_stage = STAGES.len() - 1;
    current.iter().any(|name| {
        !STAGES[current_stage].contains(name)
            && STAGES[..current_stage].iter().any(|tools| tools.contains(name))
    })
}
