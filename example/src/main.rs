use anyhow::{Context, Result};
use loanflow::record::{BorrowerProfile, LoanTerms, PropertyInfo};
use loanflow::{
    closing_graph, init_tracing, loan_operations, underwriting_graph, ExternalSystems, LoanFile,
    LoanFileManager, LoanStatus, LoanflowConfig, TaskContext, TaskGraph, WorkflowDriver,
};
use rust_decimal::Decimal;
use std::path::Path;
use tracing::{info, Level};

fn sample_application(loan_number: &str) -> LoanFile {
    LoanFile::new(
        loan_number,
        LoanTerms {
            loan_amount: Decimal::new(425_000, 0),
            purchase_price: Some(Decimal::new(500_000, 0)),
            interest_rate: Some(Decimal::new(6875, 3)),
            term_months: 360,
            loan_type: "conventional".to_string(),
            loan_purpose: "purchase".to_string(),
        },
        BorrowerProfile {
            borrower_id: "B-4471".to_string(),
            first_name: "Priya".to_string(),
            last_name: "Raman".to_string(),
            ssn_last4: "2291".to_string(),
            employer_name: "Northgate Logistics".to_string(),
            stated_monthly_income: Decimal::new(12_500, 0),
            credit_score: None,
            employment_verified: false,
        },
        PropertyInfo {
            street: "1187 Willow Bend".to_string(),
            city: "Houston".to_string(),
            state: "TX".to_string(),
            zip_code: "77002".to_string(),
            flood_zone: None,
            flood_insurance_required: false,
            appraised_value: None,
        },
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(Level::INFO)?;

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "loanflow.yaml".to_string());
    let config = if Path::new(&config_path).exists() {
        LoanflowConfig::from_yaml_file(&config_path)
            .with_context(|| format!("loading {}", config_path))?
    } else {
        LoanflowConfig::default()
    };

    let files = LoanFileManager::new(config.store.clone())?;
    let graph = TaskGraph::from_yaml_file("pipeline.yaml", &loan_operations())
        .context("loading pipeline.yaml")?;

    let loan_number = format!("LN-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).to_uppercase();
    files.create(sample_application(&loan_number)).await?;
    info!(loan = %loan_number, "Application received");

    let ctx = TaskContext::new(files.clone(), ExternalSystems::simulated());
    let driver = WorkflowDriver::new(ctx, config.scheduler.clone())?;
    let report = driver.run(&graph, &loan_number).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if files.snapshot(&loan_number).await?.status == LoanStatus::Submitted {
        let underwriting = driver.run(&underwriting_graph()?, &loan_number).await?;
        info!(loan = %loan_number, success = underwriting.is_success(), "Underwriting finished");
        if underwriting.is_success() {
            let closing = driver.run(&closing_graph()?, &loan_number).await?;
            info!(loan = %loan_number, success = closing.is_success(), "Closing finished");
        }
    }

    let file = files.snapshot(&loan_number).await?;
    println!("Status: {}", file.status);
    println!("Documents: {}", file.documents.len());
    println!("Conditions: {}", file.conditions.len());
    for decision in &file.decisions {
        println!("  decision: {:?} by {} ({})", decision.decision, decision.underwriter, decision.reason);
    }
    println!("Metrics: {:#?}", file.financial_metrics);
    for flag in &file.flags {
        println!("  flag: {}", flag);
    }

    let stats = files.store().storage_stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
