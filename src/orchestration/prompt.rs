//! Instruction text handed to the code-generation tool.

use std::fmt::Write;
use std::path::Path;

use crate::core::{Phase, ResultRecord, Task};
use crate::util::truncate_chars;

const CONTEXT_NOTES_LIMIT: usize = 400;
const CONTEXT_FILES_LIMIT: usize = 20;

/// Condensed view of an earlier task's latest result.
#[derive(Debug, Clone)]
pub struct ContextSummary {
    pub task_id: String,
    pub title: String,
    pub result: ResultRecord,
}

fn phase_guidance(phase: Phase) -> &'static str {
    match phase {
        Phase::Plan => {
            "Produce an implementation plan in PLAN.md at the workspace root. \
             Do not change any other file."
        }
        Phase::Apply => {
            "Implement the task. Make the code changes needed to satisfy every \
             acceptance criterion."
        }
        Phase::Test => {
            "Verify the implementation. Add or update tests covering the \
             acceptance criteria, run them, and fix any failures you find."
        }
    }
}

/// Render the context section for earlier tasks.
pub fn render_context(context: &[ContextSummary]) -> String {
    let mut out = String::new();
    for item in context {
        let r = &item.result;
        let _ = writeln!(out, "- {} ({}): {} in {} phase", item.task_id, item.title, r.status, r.phase);
        if !r.notes.trim().is_empty() {
            let _ = writeln!(out, "  notes: {}", truncate_chars(&r.notes, CONTEXT_NOTES_LIMIT));
        }
        let touched: Vec<&String> = r
            .files
            .created
            .iter()
            .chain(r.files.modified.iter())
            .take(CONTEXT_FILES_LIMIT)
            .collect();
        if !touched.is_empty() {
            let list: Vec<&str> = touched.iter().map(|s| s.as_str()).collect();
            let _ = write!(out, "  files: {}", list.join(", "));
            let more = r.files.total().saturating_sub(touched.len());
            if more > 0 {
                let _ = write!(out, " (+{more} more)");
            }
            out.push('\n');
        }
    }
    out
}

/// Build the full instruction for one phase run.
pub fn build_instruction(
    task: &Task,
    role: &str,
    phase: Phase,
    workspace: &Path,
    context: &[ContextSummary],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "You are the {role} engineer working on task {}.", task.id);
    let _ = writeln!(out, "\n# Task: {}", task.title);
    if !task.description.trim().is_empty() {
        let _ = writeln!(out, "\n{}", task.description.trim());
    }
    if !task.acceptance_criteria.is_empty() {
        out.push_str("\n## Acceptance criteria\n");
        for criterion in &task.acceptance_criteria {
            let _ = writeln!(out, "- {criterion}");
        }
    }
    if !context.is_empty() {
        out.push_str("\n## Context from earlier tasks\n");
        out.push_str(&render_context(context));
    }
    let _ = writeln!(out, "\n## Phase: {phase}\n{}", phase_guidance(phase));
    let _ = writeln!(
        out,
        "\n## Workspace\nWork only inside {}. Do not read or modify anything outside this directory.",
        workspace.display()
    );
    out
}
