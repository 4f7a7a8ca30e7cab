#![allow(dead_code)]

use loanflow::record::{BorrowerProfile, LoanTerms, PropertyInfo};
use loanflow::{LoanFile, LoanFileManager, StoreConfig};
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;

pub fn loan_file(loan_number: &str) -> LoanFile {
    LoanFile::new(
        loan_number,
        LoanTerms {
            loan_amount: Decimal::new(320_000, 0),
            purchase_price: Some(Decimal::new(400_000, 0)),
            interest_rate: Some(Decimal::new(65, 1)),
            term_months: 360,
            loan_type: "conventional".to_string(),
            loan_purpose: "purchase".to_string(),
        },
        BorrowerProfile {
            borrower_id: "B-100".to_string(),
            first_name: "Sam".to_string(),
            last_name: "Okafor".to_string(),
            ssn_last4: "7730".to_string(),
            employer_name: "Harbor Freight Lines".to_string(),
            stated_monthly_income: Decimal::new(11_000, 0),
            credit_score: None,
            employment_verified: false,
        },
        PropertyInfo {
            street: "402 Cedar Court".to_string(),
            city: "Boise".to_string(),
            state: "ID".to_string(),
            zip_code: "83702".to_string(),
            flood_zone: None,
            flood_insurance_required: false,
            appraised_value: None,
        },
    )
}

pub fn store_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::builder()
        .base_dir(dir.path())
        .build()
        .unwrap()
}

/// Manager over a fresh directory with one loan already created
pub async fn manager_with_loan(dir: &TempDir, loan_number: &str) -> Arc<LoanFileManager> {
    let files = LoanFileManager::new(store_config(dir)).unwrap();
    files.create(loan_file(loan_number)).await.unwrap();
    files
}
