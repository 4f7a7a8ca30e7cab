pub mod documents;
pub mod loan_file;
pub mod status;
pub mod underwriting;

pub use documents::{Document, DocumentKind, DocumentStatus, DocumentType};
pub use loan_file::{AuditEntry, BorrowerProfile, FinancialMetrics, LoanFile, LoanTerms, PropertyInfo};
pub use status::LoanStatus;
pub use underwriting::{
    ConditionSeverity, ConditionStatus, ConditionType, DecisionType, UnderwritingCondition,
    UnderwritingDecision,
};

#[cfg(test)]
pub(crate) use loan_file::fixtures;
