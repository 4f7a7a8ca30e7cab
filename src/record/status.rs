use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow state of a loan file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Received,
    DocumentsCollecting,
    DocumentsComplete,
    InitialReviewComplete,
    CreditOrdered,
    AppraisalOrdered,
    Submitted,
    UnderwritingReview,
    Suspended,
    ConditionsPending,
    ConditionsSubmitted,
    Approved,
    ClearToClose,
    Denied,
    Withdrawn,
}

impl LoanStatus {
    pub const ALL: [LoanStatus; 15] = [
        Self::Received,
        Self::DocumentsCollecting,
        Self::DocumentsComplete,
        Self::InitialReviewComplete,
        Self::CreditOrdered,
        Self::AppraisalOrdered,
        Self::Submitted,
        Self::UnderwritingReview,
        Self::Suspended,
        Self::ConditionsPending,
        Self::ConditionsSubmitted,
        Self::Approved,
        Self::ClearToClose,
        Self::Denied,
        Self::Withdrawn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::DocumentsCollecting => "documents_collecting",
            Self::DocumentsComplete => "documents_complete",
            Self::InitialReviewComplete => "initial_review_complete",
            Self::CreditOrdered => "credit_ordered",
            Self::AppraisalOrdered => "appraisal_ordered",
            Self::Submitted => "submitted",
            Self::UnderwritingReview => "underwriting_review",
            Self::Suspended => "suspended",
            Self::ConditionsPending => "conditions_pending",
            Self::ConditionsSubmitted => "conditions_submitted",
            Self::Approved => "approved",
            Self::ClearToClose => "clear_to_close",
            Self::Denied => "denied",
            Self::Withdrawn => "withdrawn",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ClearToClose | Self::Denied | Self::Withdrawn)
    }

    /// Position in the pre-submission verification pipeline, if the status belongs to it.
    /// Verification tasks finish in any order, so within the pipeline a loan only moves forward.
    pub fn pipeline_rank(&self) -> Option<u8> {
        match self {
            Self::Received => Some(0),
            Self::DocumentsCollecting => Some(1),
            Self::DocumentsComplete => Some(2),
            Self::InitialReviewComplete => Some(3),
            Self::CreditOrdered => Some(4),
            Self::AppraisalOrdered => Some(5),
            _ => None,
        }
    }

    /// True once the loan has at least reached `other` in the overall workflow
    pub fn is_at_least(&self, other: LoanStatus) -> bool {
        match (self.pipeline_rank(), other.pipeline_rank()) {
            (Some(a), Some(b)) => a >= b,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (None, None) => self == &other,
        }
    }

    pub fn can_transition_to(&self, next: LoanStatus) -> bool {
        use LoanStatus::*;

        if self.is_terminal() || *self == next {
            return false;
        }
        if next == Withdrawn {
            return true;
        }

        if let (Some(from), Some(to)) = (self.pipeline_rank(), next.pipeline_rank()) {
            return to > from;
        }

        match (*self, next) {
            (DocumentsComplete | InitialReviewComplete | CreditOrdered | AppraisalOrdered, Submitted) => true,
            (Submitted, UnderwritingReview | Approved | ConditionsPending | Suspended | Denied) => true,
            (UnderwritingReview, Approved | ConditionsPending | Suspended | Denied) => true,
            (Suspended, Submitted | Denied) => true,
            (ConditionsPending, ConditionsSubmitted | Denied) => true,
            // Cleared conditions go back to the underwriter
            (ConditionsSubmitted, Submitted | ConditionsPending | Approved | Denied) => true,
            (Approved, ClearToClose | ConditionsPending | Denied) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
