//! Issue normaliser: engine-native `OperationOutcome` issues into the common [`Issue`] shape.

use crate::constants::{LOCATION_SEPARATOR, NO_DETAILS_PLACEHOLDER};
use crate::issue::{Issue, Severity};
use crate::position::resolve_position;
use fhir::{ElementNode, OperationOutcome, OutcomeIssue};

/// Normalise every issue of `outcome`, preserving the engine's order.
///
/// `document` is the parsed resource used for position resolution; pass `None` when the
/// resource could not be parsed.
pub fn normalize_outcome(outcome: &OperationOutcome, document: Option<&ElementNode>) -> Vec<Issue> {
    outcome
        .issue
        .iter()
        .map(|issue| normalize_issue(issue, document))
        .collect()
}

pub fn normalize_issue(issue: &OutcomeIssue, document: Option<&ElementNode>) -> Issue {
    Issue::new(
        Severity::normalize(&issue.severity),
        issue_message(issue),
        issue_location(issue),
        resolve_position(issue, document),
    )
}

/// Details text, else diagnostics, else a fixed placeholder.
fn issue_message(issue: &OutcomeIssue) -> String {
    issue
        .details
        .as_ref()
        .and_then(|details| details.text.as_deref())
        .or(issue.diagnostics.as_deref())
        .unwrap_or(NO_DETAILS_PLACEHOLDER)
        .to_string()
}

fn issue_location(issue: &OutcomeIssue) -> String {
    let locations = if issue.location.is_empty() {
        &issue.expression
    } else {
        &issue.location
    };
    locations.join(LOCATION_SEPARATOR)
}
