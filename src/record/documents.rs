use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::core::errors::{LoanError, Result};

/// Document kinds tracked in a loan file.
///
/// Serialized as its canonical name. `Other` is stored with an `other:`
/// prefix so a value such as `Other("paystub")` reloads as `Other` and not
/// as the alias it happens to spell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DocumentType {
    Urla,
    Paystub,
    W2,
    TaxReturn,
    BankStatement,
    AssetStatement,
    CreditReport,
    Appraisal,
    TitleReport,
    EmploymentVerification,
    LetterOfExplanation,
    GiftLetter,
    DivorceDecree,
    BankruptcyDischarge,
    FloodCertification,
    HomeownersInsurance,
    PurchaseAgreement,
    Other(String),
}

/// Outcome of classifying a free-text document name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentKind {
    Recognized(DocumentType),
    Unrecognized(String),
}

impl DocumentKind {
    /// Unrecognized names are kept verbatim as `DocumentType::Other`
    pub fn into_type(self) -> DocumentType {
        match self {
            Self::Recognized(t) => t,
            Self::Unrecognized(original) => DocumentType::Other(original),
        }
    }
}

const ALIASES: &[(&str, DocumentType)] = &[
    ("urla", DocumentType::Urla),
    ("1003", DocumentType::Urla),
    ("loan_application", DocumentType::Urla),
    ("uniform_residential_loan_application", DocumentType::Urla),
    ("paystub", DocumentType::Paystub),
    ("pay_stub", DocumentType::Paystub),
    ("paystubs", DocumentType::Paystub),
    ("w2", DocumentType::W2),
    ("w_2", DocumentType::W2),
    ("tax_return", DocumentType::TaxReturn),
    ("tax_returns", DocumentType::TaxReturn),
    ("1040", DocumentType::TaxReturn),
    ("bank_statement", DocumentType::BankStatement),
    ("bank_statements", DocumentType::BankStatement),
    ("asset_statement", DocumentType::AssetStatement),
    ("credit_report", DocumentType::CreditReport),
    ("appraisal", DocumentType::Appraisal),
    ("appraisal_report", DocumentType::Appraisal),
    ("title_report", DocumentType::TitleReport),
    ("title", DocumentType::TitleReport),
    ("employment_verification", DocumentType::EmploymentVerification),
    ("voe", DocumentType::EmploymentVerification),
    ("letter_of_explanation", DocumentType::LetterOfExplanation),
    ("loe", DocumentType::LetterOfExplanation),
    ("gift_letter", DocumentType::GiftLetter),
    ("divorce_decree", DocumentType::DivorceDecree),
    ("bankruptcy_discharge", DocumentType::BankruptcyDischarge),
    ("flood_certification", DocumentType::FloodCertification),
    ("flood_cert", DocumentType::FloodCertification),
    ("homeowners_insurance", DocumentType::HomeownersInsurance),
    ("hoi", DocumentType::HomeownersInsurance),
    ("purchase_agreement", DocumentType::PurchaseAgreement),
    ("purchase_contract", DocumentType::PurchaseAgreement),
];

impl DocumentType {
    /// Supporting documents every file needs before it counts as complete
    pub const REQUIRED: [DocumentType; 4] = [
        DocumentType::Paystub,
        DocumentType::W2,
        DocumentType::BankStatement,
        DocumentType::PurchaseAgreement,
    ];

    /// Classify a document name against the alias table.
    /// Matching is exact after normalising case, spaces and dashes.
    pub fn parse(name: &str) -> DocumentKind {
        let normalized = normalize(name);
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == normalized)
            .map(|(_, doc_type)| DocumentKind::Recognized(doc_type.clone()))
            .unwrap_or_else(|| DocumentKind::Unrecognized(name.trim().to_string()))
    }

    /// Strict variant of `parse` for callers that must reject unknown names
    pub fn from_alias(name: &str) -> Result<DocumentType> {
        match Self::parse(name) {
            DocumentKind::Recognized(doc_type) => Ok(doc_type),
            DocumentKind::Unrecognized(original) => Err(LoanError::UnrecognizedDocumentType(original)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Urla => "urla",
            Self::Paystub => "paystub",
            Self::W2 => "w2",
            Self::TaxReturn => "tax_return",
            Self::BankStatement => "bank_statement",
            Self::AssetStatement => "asset_statement",
            Self::CreditReport => "credit_report",
            Self::Appraisal => "appraisal",
            Self::TitleReport => "title_report",
            Self::EmploymentVerification => "employment_verification",
            Self::LetterOfExplanation => "letter_of_explanation",
            Self::GiftLetter => "gift_letter",
            Self::DivorceDecree => "divorce_decree",
            Self::BankruptcyDischarge => "bankruptcy_discharge",
            Self::FloodCertification => "flood_certification",
            Self::HomeownersInsurance => "homeowners_insurance",
            Self::PurchaseAgreement => "purchase_agreement",
            Self::Other(original) => original,
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

const OTHER_PREFIX: &str = "other:";

impl From<String> for DocumentType {
    fn from(name: String) -> Self {
        match name.strip_prefix(OTHER_PREFIX) {
            Some(original) => Self::Other(original.to_string()),
            None => Self::parse(&name).into_type(),
        }
    }
}

impl From<DocumentType> for String {
    fn from(doc_type: DocumentType) -> Self {
        match doc_type {
            DocumentType::Other(original) => format!("{}{}", OTHER_PREFIX, original),
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Required,
    Requested,
    Received,
    UnderReview,
    Approved,
    Rejected,
    Missing,
    Expired,
}

/// A document tracked in the loan file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub document_type: DocumentType,
    pub status: DocumentStatus,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reviewed_by: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Document {
    pub fn new(document_type: DocumentType, status: DocumentStatus) -> Self {
        Self {
            document_id: new_document_id(),
            document_type,
            status,
            received_at: None,
            reviewed_at: None,
            reviewed_by: None,
            issues: Vec::new(),
            notes: None,
            metadata: BTreeMap::new(),
        }
    }

    /// A document received and approved in one step by `reviewer`
    pub fn approved(document_type: DocumentType, reviewer: &str) -> Self {
        let now = Utc::now();
        Self {
            received_at: Some(now),
            reviewed_at: Some(now),
            reviewed_by: Some(reviewer.to_string()),
            ..Self::new(document_type, DocumentStatus::Approved)
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

fn new_document_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!("DOC-{}", &id[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_lookup() {
        assert_eq!(DocumentType::parse("Pay Stub"), DocumentKind::Recognized(DocumentType::Paystub));
        assert_eq!(DocumentType::parse(" W-2 "), DocumentKind::Recognized(DocumentType::W2));
        assert_eq!(DocumentType::parse("VOE"), DocumentKind::Recognized(DocumentType::EmploymentVerification));
    }

    #[test]
    fn test_no_fuzzy_matching() {
        // A substring of a known alias is not a match
        assert_eq!(
            DocumentType::parse("recent paystub copy"),
            DocumentKind::Unrecognized("recent paystub copy".to_string())
        );
        assert!(matches!(
            DocumentType::from_alias("utility bill"),
            Err(LoanError::UnrecognizedDocumentType(name)) if name == "utility bill"
        ));
    }

    #[test]
    fn test_serde_keeps_unrecognized_names() {
        let other = DocumentType::parse("Utility Bill").into_type();
        assert_eq!(other, DocumentType::Other("Utility Bill".to_string()));

        let json = serde_json::to_string(&other).unwrap();
        assert_eq!(json, "\"other:Utility Bill\"");
        let back: DocumentType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, other);
        assert_eq!(back.to_string(), "Utility Bill");

        let known: DocumentType = serde_json::from_str("\"flood_certification\"").unwrap();
        assert_eq!(known, DocumentType::FloodCertification);

        // Files written before the prefix existed still load
        let legacy: DocumentType = serde_json::from_str("\"Utility Bill\"").unwrap();
        assert_eq!(legacy, other);
    }

    #[test]
    fn test_other_named_like_an_alias_stays_other() {
        for name in ["paystub", "W-2", "voe"] {
            let other = DocumentType::Other(name.to_string());
            let json = serde_json::to_string(&other).unwrap();
            let back: DocumentType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, other, "{}", json);
        }

        let doc = Document::approved(DocumentType::Other("paystub".to_string()), "tester");
        let back: Document = serde_json::from_value(serde_json::to_value(&doc).unwrap()).unwrap();
        assert_eq!(back.document_type, DocumentType::Other("paystub".to_string()));
        assert_ne!(back.document_type, DocumentType::Paystub);
    }

    #[test]
    fn test_document_ids_are_distinct() {
        let ids: std::collections::HashSet<String> = (0..100)
            .map(|_| Document::new(DocumentType::Paystub, DocumentStatus::Received).document_id)
            .collect();
        assert_eq!(ids.len(), 100);
    }
}
