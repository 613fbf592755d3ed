//! Extracts `<promise>NAME</promise>` control directives from agent output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

fn promise_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<promise>([^<]*)</promise>").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Complete,
    Eject,
    Blocked,
    ApprovalNeeded,
    InputNeeded,
    ReviewRequested,
    ContentReview,
    Escalate,
    Checkpoint,
}

impl SignalKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "COMPLETE" => Self::Complete,
            "EJECT" => Self::Eject,
            "BLOCKED" => Self::Blocked,
            "APPROVAL_NEEDED" => Self::ApprovalNeeded,
            "INPUT_NEEDED" => Self::InputNeeded,
            "REVIEW_REQUESTED" => Self::ReviewRequested,
            "CONTENT_REVIEW" => Self::ContentReview,
            "ESCALATE" => Self::Escalate,
            "CHECKPOINT" => Self::Checkpoint,
            _ => return None,
        })
    }

    /// Maps a non-COMPLETE signal to the `awaiting` tag it puts a task into.
    pub fn awaiting_tag(self) -> Option<crate::types::AwaitingTag> {
        use crate::types::AwaitingTag;
        match self {
            Self::Complete => None,
            Self::Eject => Some(AwaitingTag::Work),
            Self::Blocked => Some(AwaitingTag::Input),
            Self::ApprovalNeeded => Some(AwaitingTag::Approval),
            Self::InputNeeded => Some(AwaitingTag::Input),
            Self::ReviewRequested => Some(AwaitingTag::Review),
            Self::ContentReview => Some(AwaitingTag::Content),
            Self::Escalate => Some(AwaitingTag::Escalation),
            Self::Checkpoint => Some(AwaitingTag::Checkpoint),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub kind: SignalKind,
    pub reason: String,
}

/// Scans text for `<promise>...</promise>` directives and returns the
/// highest-priority one: COMPLETE > EJECT > BLOCKED > first-by-byte-offset
/// among the rest. Malformed tags (missing close, wrong case) are skipped.
pub fn parse_signal(text: &str) -> Option<Signal> {
    let re = promise_regex();

    let mut best: Option<(usize, Signal)> = None;

    for caps in re.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let body = caps.get(1).unwrap().as_str();

        let (name, reason) = match body.split_once(':') {
            Some((n, r)) => (n.trim(), r.trim().to_string()),
            None => (body.trim(), String::new()),
        };

        let Some(kind) = SignalKind::from_name(name) else {
            continue;
        };

        let offset = whole.start();
        let candidate = Signal { kind, reason };

        best = Some(match best {
            None => (offset, candidate),
            Some((best_offset, best_signal)) => {
                if priority_rank(candidate.kind) < priority_rank(best_signal.kind) {
                    (offset, candidate)
                } else if priority_rank(candidate.kind) == priority_rank(best_signal.kind)
                    && offset < best_offset
                {
                    (offset, candidate)
                } else {
                    (best_offset, best_signal)
                }
            }
        });
    }

    best.map(|(_, signal)| signal)
}

/// Lower rank wins. COMPLETE and EJECT and BLOCKED get dedicated tiers; every
/// other signal shares one tier and ties break by byte offset.
fn priority_rank(kind: SignalKind) -> u8 {
    match kind {
        SignalKind::Complete => 0,
        SignalKind::Eject => 1,
        SignalKind::Blocked => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AwaitingTag;

    #[test]
    fn parses_bare_directive() {
        let s = parse_signal("hello <promise>COMPLETE</promise> world").unwrap();
        assert_eq!(s.kind, SignalKind::Complete);
        assert_eq!(s.reason, "");
    }

    #[test]
    fn parses_directive_with_reason() {
        let s = parse_signal("<promise>APPROVAL_NEEDED: please review migration</promise>").unwrap();
        assert_eq!(s.kind, SignalKind::ApprovalNeeded);
        assert_eq!(s.reason, "please review migration");
        assert_eq!(s.kind.awaiting_tag(), Some(AwaitingTag::Approval));
    }

    #[test]
    fn complete_wins_over_any_other_signal() {
        let text = "<promise>BLOCKED: x</promise> and <promise>COMPLETE</promise>";
        let s = parse_signal(text).unwrap();
        assert_eq!(s.kind, SignalKind::Complete);
    }

    #[test]
    fn eject_wins_over_blocked_without_complete() {
        let text = "<promise>BLOCKED: x</promise> and <promise>EJECT</promise>";
        let s = parse_signal(text).unwrap();
        assert_eq!(s.kind, SignalKind::Eject);
    }

    #[test]
    fn ties_among_other_signals_break_by_byte_offset() {
        let text = "<promise>REVIEW_REQUESTED</promise> ... <promise>ESCALATE</promise>";
        let s = parse_signal(text).unwrap();
        assert_eq!(s.kind, SignalKind::ReviewRequested);
    }

    #[test]
    fn malformed_tag_missing_close_yields_nothing() {
        assert!(parse_signal("<promise>COMPLETE").is_none());
    }

    #[test]
    fn wrong_case_yields_nothing() {
        assert!(parse_signal("<promise>complete</promise>").is_none());
    }

    #[test]
    fn unknown_name_is_skipped_but_others_still_found() {
        let text = "<promise>NONSENSE</promise> <promise>BLOCKED</promise>";
        let s = parse_signal(text).unwrap();
        assert_eq!(s.kind, SignalKind::Blocked);
    }

    #[test]
    fn no_signal_returns_none() {
        assert!(parse_signal("just some ordinary agent output").is_none());
    }
}
