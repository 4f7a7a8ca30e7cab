use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Voe,
    Vod,
    Vom,
    Loe,
    Voa,
    Paystub,
    BankStatement,
    TaxReturn,
    CreditSupplement,
    Appraisal,
    AppraisalUpdate,
    TitleUpdate,
    Insurance,
    Reserves,
    GiftDocumentation,
    RepairBid,
    HoaDocs,
    Other,
}

/// When a condition has to be cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSeverity {
    Required,
    PriorToDocs,
    PriorToFunding,
    PostClosing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStatus {
    Pending,
    InProgress,
    Cleared,
    Waived,
}

impl ConditionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderwritingCondition {
    pub condition_id: String,
    pub condition_type: ConditionType,
    pub severity: ConditionSeverity,
    pub category: String,
    pub description: String,
    pub reason: String,
    pub status: ConditionStatus,
    pub assigned_to: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cleared_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clearing_documents: Vec<String>,
    #[serde(default)]
    pub clearing_notes: Option<String>,
}

impl ConditionType {
    /// Best guess from a free-text condition description
    pub fn from_description(description: &str) -> Self {
        let text = description.to_uppercase();
        let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));
        if has(&["VOE", "EMPLOY"]) {
            Self::Voe
        } else if has(&["VOA", "ASSET", "BANK STATEMENT"]) {
            Self::Voa
        } else if has(&["LOE", "LETTER", "EXPLAIN"]) {
            Self::Loe
        } else if has(&["APPRAISAL", "VALUE"]) {
            Self::Appraisal
        } else if has(&["TITLE"]) {
            Self::TitleUpdate
        } else if has(&["INSURANCE", "PMI"]) {
            Self::Insurance
        } else if has(&["RESERVE"]) {
            Self::Reserves
        } else {
            Self::Other
        }
    }
}

impl UnderwritingCondition {
    pub fn new(
        condition_type: ConditionType,
        severity: ConditionSeverity,
        category: impl Into<String>,
        description: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
        Self {
            condition_id: format!("COND-{}", &id[..12]),
            condition_type,
            severity,
            category: category.into(),
            description: description.into(),
            reason: reason.into(),
            status: ConditionStatus::Pending,
            assigned_to: "loan_processor".to_string(),
            created_at: Utc::now(),
            cleared_at: None,
            clearing_documents: Vec::new(),
            clearing_notes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    /// Recommendation returned by the automated underwriting system
    AutomatedFindings,
    Approve,
    ApproveWithConditions,
    Suspend,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnderwritingDecision {
    pub decision_id: String,
    pub decided_at: DateTime<Utc>,
    pub underwriter: String,
    pub decision: DecisionType,
    pub reason: String,
    /// Conditions attached to this decision
    #[serde(default)]
    pub condition_ids: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub required_documents: Vec<String>,
}

impl UnderwritingDecision {
    pub fn new(underwriter: impl Into<String>, decision: DecisionType, reason: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
        Self {
            decision_id: format!("DEC-{}", &id[..8]),
            decided_at: Utc::now(),
            underwriter: underwriter.into(),
            decision,
            reason: reason.into(),
            condition_ids: Vec::new(),
            notes: None,
            findings: Vec::new(),
            required_documents: Vec::new(),
        }
    }

    pub fn with_conditions(mut self, condition_ids: Vec<String>) -> Self {
        self.condition_ids = condition_ids;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_findings(mut self, findings: Vec<String>, required_documents: Vec<String>) -> Self {
        self.findings = findings;
        self.required_documents = required_documents;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_type_from_description() {
        assert_eq!(ConditionType::from_description("VOE - Verify stable employment"), ConditionType::Voe);
        assert_eq!(ConditionType::from_description("LOE - Explain credit inquiries"), ConditionType::Loe);
        assert_eq!(ConditionType::from_description("PMI certificate"), ConditionType::Insurance);
        assert_eq!(ConditionType::from_description("Value below purchase price"), ConditionType::Appraisal);
        assert_eq!(ConditionType::from_description("Survey of the lot"), ConditionType::Other);
    }

    #[test]
    fn test_decision_serde_defaults() {
        let decision = UnderwritingDecision::new("underwriter", DecisionType::Deny, "DTI too high");
        assert!(decision.decision_id.starts_with("DEC-"));

        let mut value = serde_json::to_value(&decision).unwrap();
        let map = value.as_object_mut().unwrap();
        map.remove("findings");
        map.remove("required_documents");
        let back: UnderwritingDecision = serde_json::from_value(value).unwrap();
        assert_eq!(back, decision);
        assert_eq!(serde_json::to_value(DecisionType::AutomatedFindings).unwrap(), "automated_findings");
    }
}
