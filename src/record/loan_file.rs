use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::documents::{Document, DocumentStatus, DocumentType};
use super::status::LoanStatus;
use super::underwriting::{ConditionStatus, UnderwritingCondition, UnderwritingDecision};
use crate::core::errors::{ExternalError, LoanError, Result};

/// One entry of the append-only audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in this loan's audit history, starting at 1. Zero marks an
    /// entry written before sequencing existed.
    #[serde(default)]
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub details: String,
    #[serde(default)]
    pub status_before: Option<LoanStatus>,
    #[serde(default)]
    pub status_after: Option<LoanStatus>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AuditEntry {
    pub fn is_status_change(&self) -> bool {
        self.status_before.is_some() && self.status_after.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanTerms {
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub loan_amount: Decimal,
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub purchase_price: Option<Decimal>,
    /// Annual rate in percent
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub interest_rate: Option<Decimal>,
    pub term_months: u32,
    pub loan_type: String,
    pub loan_purpose: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorrowerProfile {
    pub borrower_id: String,
    pub first_name: String,
    pub last_name: String,
    /// Only the last four digits are ever stored
    pub ssn_last4: String,
    pub employer_name: String,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub stated_monthly_income: Decimal,
    #[serde(default)]
    pub credit_score: Option<u16>,
    #[serde(default)]
    pub employment_verified: bool,
}

impl BorrowerProfile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    #[serde(default)]
    pub flood_zone: Option<String>,
    #[serde(default)]
    pub flood_insurance_required: bool,
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub appraised_value: Option<Decimal>,
}

/// Ratios and amounts computed while processing the file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialMetrics {
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub ltv_ratio: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub dti_ratio: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub front_end_ratio: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub monthly_housing_payment: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub total_monthly_debt: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::arbitrary_precision_option")]
    pub verified_monthly_income: Option<Decimal>,
}

/// The loan file: aggregate root persisted per loan number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanFile {
    pub loan_number: String,
    pub status: LoanStatus,
    pub loan: LoanTerms,
    pub borrower: BorrowerProfile,
    pub property: PropertyInfo,
    #[serde(default)]
    pub financial_metrics: FinancialMetrics,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub conditions: Vec<UnderwritingCondition>,
    #[serde(default)]
    pub decisions: Vec<UnderwritingDecision>,
    #[serde(default)]
    pub audit_trail: Vec<AuditEntry>,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Open issues from the latest underwriting review of each area
    #[serde(default)]
    pub review_issues: BTreeMap<String, Vec<String>>,
    /// Last sequence number handed to an audit entry. Survives rotation.
    #[serde(default)]
    pub audit_sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoanFile {
    pub fn new(
        loan_number: impl Into<String>,
        loan: LoanTerms,
        borrower: BorrowerProfile,
        property: PropertyInfo,
    ) -> Self {
        let now = Utc::now();
        let mut file = Self {
            loan_number: loan_number.into(),
            status: LoanStatus::Received,
            loan,
            borrower,
            property,
            financial_metrics: FinancialMetrics::default(),
            documents: Vec::new(),
            conditions: Vec::new(),
            decisions: Vec::new(),
            audit_trail: Vec::new(),
            flags: Vec::new(),
            review_issues: BTreeMap::new(),
            audit_sequence: 0,
            created_at: now,
            updated_at: now,
        };
        file.add_audit_entry("system", "file_created", "Loan application received");
        file
    }

    pub fn entity_id(&self) -> &str {
        &self.loan_number
    }

    pub fn add_audit_entry(
        &mut self,
        actor: impl Into<String>,
        action: impl Into<String>,
        details: impl Into<String>,
    ) -> &mut AuditEntry {
        self.push_audit(AuditEntry {
            sequence: 0,
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            details: details.into(),
            status_before: None,
            status_after: None,
            metadata: BTreeMap::new(),
        })
    }

    // Clock steps backwards are clamped so the trail stays non-decreasing
    fn push_audit(&mut self, mut entry: AuditEntry) -> &mut AuditEntry {
        if let Some(last) = self.audit_trail.last() {
            if entry.timestamp < last.timestamp {
                entry.timestamp = last.timestamp;
            }
        }
        let last_sequence = self.audit_trail.last().map_or(0, |e| e.sequence);
        self.audit_sequence = self.audit_sequence.max(last_sequence) + 1;
        entry.sequence = self.audit_sequence;
        self.updated_at = entry.timestamp;
        let index = self.audit_trail.len();
        self.audit_trail.push(entry);
        &mut self.audit_trail[index]
    }

    /// Move to `new_status`, recording exactly one audit entry.
    pub fn update_status(
        &mut self,
        new_status: LoanStatus,
        actor: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(LoanError::InvalidTransition {
                entity_id: self.loan_number.clone(),
                from: self.status.to_string(),
                to: new_status.to_string(),
            });
        }
        let before = self.status;
        self.status = new_status;
        self.push_audit(AuditEntry {
            sequence: 0,
            timestamp: Utc::now(),
            actor: actor.into(),
            action: "status_change".to_string(),
            details: reason.into(),
            status_before: Some(before),
            status_after: Some(new_status),
            metadata: BTreeMap::new(),
        });
        Ok(())
    }

    /// Like `update_status`, but a transition that would move the file
    /// backwards (or is otherwise not allowed) is skipped instead of failing.
    /// Returns whether the status changed.
    pub fn advance_status(
        &mut self,
        new_status: LoanStatus,
        actor: impl Into<String>,
        reason: impl Into<String>,
    ) -> bool {
        self.update_status(new_status, actor, reason).is_ok()
    }

    pub fn add_document(&mut self, document: Document) -> Result<&Document> {
        if self.document(&document.document_id).is_some() {
            return Err(LoanError::DuplicateDocument {
                entity_id: self.loan_number.clone(),
                document_id: document.document_id,
            });
        }
        self.updated_at = Utc::now().max(self.updated_at);
        let index = self.documents.len();
        self.documents.push(document);
        Ok(&self.documents[index])
    }

    pub fn document(&self, document_id: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.document_id == document_id)
    }

    pub fn documents_of_type<'a>(
        &'a self,
        document_type: &'a DocumentType,
    ) -> impl Iterator<Item = &'a Document> + 'a {
        self.documents
            .iter()
            .filter(move |d| &d.document_type == document_type)
    }

    /// Required supporting documents that have not been received yet
    pub fn missing_required_documents(&self) -> Vec<DocumentType> {
        DocumentType::REQUIRED
            .iter()
            .filter(|required| {
                !self.documents_of_type(required).any(|d| {
                    matches!(
                        d.status,
                        DocumentStatus::Received | DocumentStatus::UnderReview | DocumentStatus::Approved
                    )
                })
            })
            .cloned()
            .collect()
    }

    pub fn add_condition(&mut self, condition: UnderwritingCondition) -> Result<()> {
        if self
            .conditions
            .iter()
            .any(|c| c.condition_id == condition.condition_id)
        {
            return Err(LoanError::DuplicateCondition {
                entity_id: self.loan_number.clone(),
                condition_id: condition.condition_id,
            });
        }
        self.conditions.push(condition);
        Ok(())
    }

    pub fn clear_condition(
        &mut self,
        condition_id: &str,
        clearing_documents: Vec<String>,
        notes: Option<String>,
        actor: &str,
    ) -> Result<()> {
        let condition = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_id == condition_id)
            .ok_or_else(|| LoanError::internal(format!("no condition {}", condition_id)))?;
        condition.status = ConditionStatus::Cleared;
        condition.cleared_at = Some(Utc::now());
        condition.clearing_documents = clearing_documents;
        condition.clearing_notes = notes;
        let details = format!("Cleared condition {}", condition_id);
        self.add_audit_entry(actor, "condition_cleared", details);
        Ok(())
    }

    pub fn open_conditions(&self) -> impl Iterator<Item = &UnderwritingCondition> {
        self.conditions.iter().filter(|c| c.status.is_open())
    }

    pub fn record_decision(&mut self, decision: UnderwritingDecision) {
        let details = format!("{:?}: {}", decision.decision, decision.reason);
        let actor = decision.underwriter.clone();
        self.decisions.push(decision);
        self.add_audit_entry(actor, "underwriting_decision", details);
    }

    /// Replace the issues found for one review area and audit the review.
    /// The issue list is copied into the entry's metadata.
    pub fn record_review(
        &mut self,
        area: &str,
        issues: Vec<String>,
        actor: &str,
        details: impl Into<String>,
    ) -> &mut AuditEntry {
        let listed = Value::from(issues.clone());
        self.review_issues.insert(area.to_string(), issues);
        let entry = self.add_audit_entry(actor, format!("{}_review", area), details);
        entry.metadata.insert("issues".to_string(), listed);
        entry
    }

    /// Audit entry and flag for a classified external failure.
    /// The status is left alone.
    pub fn record_external_failure(&mut self, actor: &str, action: &str, error: &ExternalError) {
        let entry = self.add_audit_entry(actor, format!("{}_failed", action), error.to_string());
        entry
            .metadata
            .insert("error_kind".to_string(), Value::from(error.kind.as_str()));
        entry
            .metadata
            .insert("system".to_string(), Value::from(error.system.as_str()));
        self.add_flag(format!("{} failed: {}", action, error.kind));
    }

    /// Flags are never deduplicated here
    pub fn add_flag(&mut self, flag: impl Into<String>) {
        self.flags.push(flag.into());
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::sample_loan_file;
    use super::*;
    use crate::record::underwriting::{ConditionSeverity, ConditionType, DecisionType, UnderwritingDecision};

    #[test]
    fn test_new_file_starts_received() {
        let file = sample_loan_file("LN-0001");
        assert_eq!(file.status, LoanStatus::Received);
        assert_eq!(file.audit_trail.len(), 1);
        assert!(!file.audit_trail[0].is_status_change());
    }

    #[test]
    fn test_status_change_writes_one_audit_entry() {
        let mut file = sample_loan_file("LN-0001");
        file.update_status(LoanStatus::DocumentsComplete, "loan_processor", "docs in")
            .unwrap();

        let entry = file.audit_trail.last().unwrap();
        assert_eq!(file.audit_trail.len(), 2);
        assert_eq!(entry.status_before, Some(LoanStatus::Received));
        assert_eq!(entry.status_after, Some(LoanStatus::DocumentsComplete));
    }

    #[test]
    fn test_invalid_transition_leaves_file_untouched() {
        let mut file = sample_loan_file("LN-0001");
        file.update_status(LoanStatus::CreditOrdered, "loan_processor", "credit")
            .unwrap();
        let before = file.clone();

        let err = file
            .update_status(LoanStatus::DocumentsCollecting, "loan_processor", "late")
            .unwrap_err();
        assert!(matches!(err, LoanError::InvalidTransition { .. }));
        assert_eq!(file, before);
        assert!(!file.advance_status(LoanStatus::DocumentsComplete, "loan_processor", "late"));
        assert_eq!(file.status, LoanStatus::CreditOrdered);
    }

    #[test]
    fn test_audit_timestamps_never_go_backwards() {
        let mut file = sample_loan_file("LN-0001");
        let future = Utc::now() + chrono::Duration::hours(1);
        file.audit_trail[0].timestamp = future;

        file.add_audit_entry("system", "ping", "after a clock step");
        assert_eq!(file.audit_trail[1].timestamp, future);
    }

    #[test]
    fn test_record_decision_audits_and_keeps_order() {
        let mut file = sample_loan_file("LN-0001");
        let first = UnderwritingDecision::new("underwriter", DecisionType::ApproveWithConditions, "2 conditions")
            .with_conditions(vec!["COND-1".to_string(), "COND-2".to_string()]);
        let second = UnderwritingDecision::new("underwriter", DecisionType::Approve, "conditions cleared");
        file.record_decision(first.clone());
        file.record_decision(second.clone());

        assert_eq!(file.decisions, vec![first, second]);
        let entry = file.audit_trail.last().unwrap();
        assert_eq!(entry.action, "underwriting_decision");
        assert_eq!(entry.actor, "underwriter");
        assert!(entry.details.contains("conditions cleared"));
        assert!(!entry.is_status_change());
        assert_eq!(file.status, LoanStatus::Received);
    }

    #[test]
    fn test_record_review_replaces_area_issues() {
        let mut file = sample_loan_file("LN-0001");
        file.record_review("credit", vec!["Derogatory items present".to_string()], "underwriter", "first pass");
        file.record_review("credit", Vec::new(), "underwriter", "second pass");

        assert_eq!(file.review_issues["credit"], Vec::<String>::new());
        let entry = file.audit_trail.last().unwrap();
        assert_eq!(entry.action, "credit_review");
        assert_eq!(entry.metadata["issues"], serde_json::json!([]));
    }

    #[test]
    fn test_audit_sequence_survives_trimming() {
        let mut file = sample_loan_file("LN-0001");
        file.add_audit_entry("system", "ping", "one");
        file.audit_trail.drain(..2);

        let entry = file.add_audit_entry("system", "ping", "two");
        assert_eq!(entry.sequence, 3);
        assert_eq!(file.audit_sequence, 3);
    }

    #[test]
    fn test_duplicate_document_rejected() {
        let mut file = sample_loan_file("LN-0001");
        let doc = Document::approved(DocumentType::W2, "loan_processor");
        file.add_document(doc.clone()).unwrap();
        let err = file.add_document(doc).unwrap_err();
        assert!(matches!(err, LoanError::DuplicateDocument { .. }));
        assert_eq!(file.documents.len(), 1);
    }

    #[test]
    fn test_missing_required_documents() {
        let mut file = sample_loan_file("LN-0001");
        assert_eq!(file.missing_required_documents().len(), DocumentType::REQUIRED.len());

        for doc_type in DocumentType::REQUIRED {
            file.add_document(Document::approved(doc_type, "loan_processor")).unwrap();
        }
        assert!(file.missing_required_documents().is_empty());
    }

    #[test]
    fn test_conditions() {
        let mut file = sample_loan_file("LN-0001");
        let condition = UnderwritingCondition::new(
            ConditionType::Voe,
            ConditionSeverity::PriorToDocs,
            "employment",
            "Verbal VOE within 10 days of closing",
            "Employment gap",
        );
        let id = condition.condition_id.clone();
        file.add_condition(condition.clone()).unwrap();
        assert!(file.add_condition(condition).is_err());
        assert_eq!(file.open_conditions().count(), 1);

        file.clear_condition(&id, vec!["DOC-1".into()], None, "loan_processor")
            .unwrap();
        assert_eq!(file.open_conditions().count(), 0);
    }

    #[test]
    fn test_decimals_serialize_as_plain_numbers() {
        let mut file = sample_loan_file("LN-0001");
        file.financial_metrics.dti_ratio = Some(Decimal::new(3_612_345_678_901_234, 14));

        let json = serde_json::to_string(&file).unwrap();
        assert!(json.contains("\"loan_amount\":360000"));
        assert!(json.contains("\"dti_ratio\":36.12345678901234"));

        let back: LoanFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.financial_metrics.dti_ratio, file.financial_metrics.dti_ratio);
        assert_eq!(back, file);
    }
}
