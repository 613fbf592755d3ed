//! Deterministic prompt rendering for one iteration.

use crate::types::{Epic, Note, Task};

/// Pure function of iteration context. Same input always yields byte-identical
/// output.
pub fn build_prompt(
    iteration: u32,
    epic: &Epic,
    task: &Task,
    epic_notes: &[Note],
    human_notes: &[Note],
) -> String {
    let mut out = String::new();

    out.push_str(&format!("# Iteration {}\n\n", iteration));

    if !epic_notes.is_empty() {
        out.push_str("## Review epic notes first\n\n");
        for note in epic_notes {
            out.push_str(&format!("- {}\n", note.text));
        }
        out.push('\n');
    }

    out.push_str(&format!("## Epic: {}\n\n", epic.title));
    out.push_str(&epic.description);
    out.push_str("\n\n");

    match &task.parent_epic {
        Some(_) => out.push_str(&format!("## Current task [{}]\n\n", task.id)),
        None => out.push_str("## Current task\n\n"),
    }
    out.push_str(&task.title);
    out.push_str("\n\n");
    out.push_str(&task.description);
    out.push('\n');

    if !human_notes.is_empty() {
        out.push_str("\n## Human feedback on this task\n\n");
        for note in human_notes {
            out.push_str(&format!("- {}\n", note.text));
        }
    }

    if let Some(criteria) = extract_acceptance_criteria(&task.description) {
        out.push_str("\n## Acceptance criteria\n\n");
        out.push_str(&criteria);
        out.push('\n');
    }

    out.push_str(
        "\n## Instructions\n\n\
         When you finish this task, mark it complete in the tracker, attach a \
         summary reason, and add an epic note describing what changed.\n\n\
         If you cannot proceed, emit one of these control directives on its own line:\n\
         - `<promise>EJECT: reason</promise>` — give up on this task\n\
         - `<promise>BLOCKED: reason</promise>` — blocked by something outside this task\n\
         - `<promise>APPROVAL_NEEDED: reason</promise>` — needs human approval\n\
         - `<promise>INPUT_NEEDED: reason</promise>` — needs human input\n\
         - `<promise>REVIEW_REQUESTED: reason</promise>` — needs human review\n\
         - `<promise>CONTENT_REVIEW: reason</promise>` — needs human content review\n\
         - `<promise>ESCALATE: reason</promise>` — needs escalation\n\
         - `<promise>CHECKPOINT: reason</promise>` — needs a checkpoint before continuing\n",
    );

    out
}

const MARKERS: &[&str] = &[
    "Acceptance Criteria:",
    "## Acceptance Criteria",
    "### Acceptance Criteria",
];

fn extract_acceptance_criteria(description: &str) -> Option<String> {
    let lower = description.to_lowercase();
    let mut best: Option<usize> = None;
    let mut marker_len = 0;

    for marker in MARKERS {
        if let Some(idx) = lower.find(&marker.to_lowercase()) {
            let is_better = match best {
                Some(b) => idx < b,
                None => true,
            };
            if is_better {
                best = Some(idx);
                marker_len = marker.len();
            }
        }
    }

    let idx = best?;
    let rest = &description[idx + marker_len..];
    let trimmed = rest.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EpicStatus, NoteAuthor, TaskStatus};

    fn epic() -> Epic {
        Epic {
            id: "e1".into(),
            title: "Ship the thing".into(),
            status: EpicStatus::Open,
            kind: "epic".into(),
            description: "Do the thing end to end.".into(),
        }
    }

    fn task(description: &str) -> Task {
        Task {
            id: "t1".into(),
            parent_epic: Some("e1".into()),
            title: "Implement feature X".into(),
            description: description.into(),
            status: TaskStatus::Open,
            priority: 0,
            blocked_by: vec![],
            awaiting: None,
            requires: None,
        }
    }

    fn note(text: &str) -> Note {
        Note {
            id: "n1".into(),
            issue_id: "e1".into(),
            text: text.into(),
            created_at: chrono::Utc::now(),
            author: NoteAuthor::Human,
        }
    }

    #[test]
    fn deterministic_same_input_same_output() {
        let e = epic();
        let t = task("desc");
        let a = build_prompt(1, &e, &t, &[], &[]);
        let b = build_prompt(1, &e, &t, &[], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn omits_notes_block_when_empty() {
        let out = build_prompt(1, &epic(), &task("desc"), &[], &[]);
        assert!(!out.contains("Review epic notes first"));
    }

    #[test]
    fn includes_notes_block_when_nonempty() {
        let out = build_prompt(1, &epic(), &task("desc"), &[note("watch out for X")], &[]);
        assert!(out.contains("Review epic notes first"));
        assert!(out.contains("watch out for X"));
    }

    #[test]
    fn extracts_acceptance_criteria_case_insensitively() {
        let out = build_prompt(
            1,
            &epic(),
            &task("Do stuff.\n\n## acceptance criteria\n\n- must pass tests"),
            &[],
            &[],
        );
        assert!(out.contains("must pass tests"));
    }

    #[test]
    fn task_heading_includes_id_when_present() {
        let out = build_prompt(1, &epic(), &task("desc"), &[], &[]);
        assert!(out.contains("[t1]"));
    }
}
