use serde::{Deserialize, Serialize};

use flowrelay_core::FlowDocument;

/// One problem found in a flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks a flow before the editor commits to it.
pub trait FlowValidator: Send + Sync {
    fn validate(&self, flow: &FlowDocument) -> ValidationReport;
}

/// Accepts every flow. Real rules plug in behind [`FlowValidator`].
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl FlowValidator for AcceptAll {
    fn validate(&self, _flow: &FlowDocument) -> ValidationReport {
        ValidationReport::default()
    }
}
