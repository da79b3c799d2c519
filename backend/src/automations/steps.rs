// Step graph vocabulary for automation definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One node in an automation's step graph.
///
/// `next` pointers reference step ids within the same definition; a missing
/// pointer means the execution completes after the step's effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    SendMessage {
        /// Message body, interpolated against the execution's bindings.
        content: String,
        /// Variable that receives the gateway delivery receipt id.
        #[serde(default)]
        receipt_variable: Option<String>,
        #[serde(default)]
        next: Option<String>,
    },
    SendTemplate {
        template_name: String,
        /// Positional template body parameters, interpolated.
        #[serde(default)]
        variables: Vec<String>,
        #[serde(default)]
        receipt_variable: Option<String>,
        #[serde(default)]
        next: Option<String>,
    },
    SetVariable {
        variable: String,
        /// Literal or `{{name}}`-interpolated value.
        value: String,
        #[serde(default)]
        next: Option<String>,
    },
    Delay {
        seconds: u64,
        #[serde(default)]
        next: Option<String>,
    },
    Branch {
        #[serde(default)]
        arms: Vec<BranchArm>,
        #[serde(default)]
        default_next: Option<String>,
    },
    WaitForReply {
        /// Variable the contact's reply is bound to on resume.
        variable: String,
        #[serde(default)]
        accept: Option<ReplyFilter>,
        /// Overrides the configured default when set.
        #[serde(default)]
        timeout_minutes: Option<i64>,
        #[serde(default)]
        next: Option<String>,
    },
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchArm {
    pub predicate: Predicate,
    pub next: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub variable: String,
    pub op: PredicateOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Equals,
    Contains,
}

impl Predicate {
    /// Evaluate against the current variable bindings. An unbound variable
    /// never matches.
    pub fn evaluate(&self, bindings: &HashMap<String, String>) -> bool {
        let Some(value) = bindings.get(&self.variable) else {
            return false;
        };
        match self.op {
            PredicateOp::Equals => value.trim().eq_ignore_ascii_case(self.value.trim()),
            PredicateOp::Contains => value.to_lowercase().contains(&self.value.to_lowercase()),
        }
    }
}

/// Accepted-input filter for wait_for_reply steps.
///
/// Filters are advisory: a reply that does not satisfy the filter still
/// resumes the execution (strict rejection would deadlock the conversation),
/// but the mismatch is logged so product can audit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyFilter {
    /// Any free-text reply.
    FreeText,
    /// A specific set of button/list reply ids.
    ReplyIds { ids: Vec<String> },
}

impl ReplyFilter {
    pub fn accepts(&self, text: &str, reply_id: Option<&str>) -> bool {
        match self {
            Self::FreeText => !text.trim().is_empty(),
            Self::ReplyIds { ids } => {
                reply_id.map(|id| ids.iter().any(|i| i == id)).unwrap_or(false)
            }
        }
    }
}
