//! Loan processor operations.
//!
//! Every operation that talks to an outside system follows the same shape:
//! snapshot the loan under its lock, call out with no lock held, then
//! reload-mutate-save under the lock. A classified external failure is
//! written to the audit trail and reported as `TaskOutcome::Failed`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::errors::{ExternalError, ExternalErrorKind, LoanError, Result};
use crate::external::{ExternalRequest, ExternalResponse, ExternalSystem};
use crate::record::{Document, DocumentType, LoanFile, LoanStatus};
use crate::tasks::{Operation, OperationRegistry, Task, TaskContext, TaskGraph, TaskOutcome};

pub mod underwriting;

pub use underwriting::{
    closing_graph, underwriting_graph, ClearConditions, DenyLoan, IssueFinalApproval,
    IssueUnderwritingConditions, Review, RunAutomatedUnderwriting, CLEAR_CONDITIONS, DENY_LOAN,
    ISSUE_FINAL_APPROVAL, ISSUE_UNDERWRITING_CONDITIONS, REVIEWS, REVIEW_ASSETS_RESERVES,
    REVIEW_CREDIT_PROFILE, REVIEW_INCOME_EMPLOYMENT, REVIEW_PROPERTY_APPRAISAL,
    RUN_AUTOMATED_UNDERWRITING,
};

pub const VERIFY_DOCUMENTS: &str = "verify_documents";
pub const ORDER_CREDIT: &str = "order_credit";
pub const ORDER_APPRAISAL: &str = "order_appraisal";
pub const ORDER_FLOOD: &str = "order_flood";
pub const VERIFY_EMPLOYMENT: &str = "verify_employment";
pub const CALCULATE_RATIOS: &str = "calculate_ratios";
pub const SUBMIT_TO_UNDERWRITING: &str = "submit_to_underwriting";

const ACTOR: &str = "loan_processor";

pub const INSUFFICIENT_CREDIT_FLAG: &str = "Insufficient credit history - alternative docs needed";
const DEROGATORY_PREFIX: &str = "Derogatory item: ";

const DTI_LIMIT: Decimal = Decimal::from_parts(43, 0, 0, false, 0);
const LTV_LIMIT: Decimal = Decimal::from_parts(80, 0, 0, false, 0);

/// Registry holding every loan processor and underwriter operation
pub fn loan_operations() -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry.register(Arc::new(VerifyDocuments));
    registry.register(Arc::new(OrderCredit));
    registry.register(Arc::new(OrderAppraisal));
    registry.register(Arc::new(OrderFlood));
    registry.register(Arc::new(VerifyEmployment));
    registry.register(Arc::new(CalculateRatios));
    registry.register(Arc::new(SubmitToUnderwriting));
    underwriting::register(&mut registry);
    registry
}

/// The standard processing workflow.
///
/// The five verification tasks run together; ratio calculation waits for
/// credit, and submission waits for ratios and documents. Both of those
/// run alone.
pub fn loan_processing_graph() -> Result<TaskGraph> {
    let ops = loan_operations();
    TaskGraph::from_tasks([
        Task::new(VERIFY_DOCUMENTS, ops.get(VERIFY_DOCUMENTS)?)
            .estimated(Duration::from_secs(2))
            .with_params(json!({"document_type": "urla"})),
        Task::new(ORDER_CREDIT, ops.get(ORDER_CREDIT)?).estimated(Duration::from_secs(3)),
        Task::new(ORDER_APPRAISAL, ops.get(ORDER_APPRAISAL)?).estimated(Duration::from_secs(5)),
        Task::new(ORDER_FLOOD, ops.get(ORDER_FLOOD)?).estimated(Duration::from_secs(2)),
        Task::new(VERIFY_EMPLOYMENT, ops.get(VERIFY_EMPLOYMENT)?).estimated(Duration::from_secs(4)),
        Task::new(CALCULATE_RATIOS, ops.get(CALCULATE_RATIOS)?)
            .depends_on([ORDER_CREDIT])
            .sequential()
            .estimated(Duration::from_secs(1)),
        Task::new(SUBMIT_TO_UNDERWRITING, ops.get(SUBMIT_TO_UNDERWRITING)?)
            .depends_on([CALCULATE_RATIOS, VERIFY_DOCUMENTS])
            .sequential()
            .estimated(Duration::from_secs(1)),
    ])
}

// Phase two of an external call: a failure is recorded on the file and
// turned into a `Failed` outcome, with any extra flags in the same save.
async fn record_failure(
    ctx: &TaskContext,
    entity_id: &str,
    action: &str,
    error: ExternalError,
    extra_flags: &[&str],
) -> Result<TaskOutcome> {
    ctx.files
        .update(entity_id, |file| {
            file.record_external_failure(ACTOR, action, &error);
            for flag in extra_flags {
                file.add_flag(*flag);
            }
            Ok(())
        })
        .await?;
    Ok(TaskOutcome::failed(
        error.kind,
        format!("{} failed ({}): {}", action, error.kind, error.message),
    ))
}

async fn call(
    ctx: &TaskContext,
    system: &Arc<dyn ExternalSystem>,
    entity_id: &str,
    params: Value,
) -> std::result::Result<ExternalResponse, ExternalError> {
    let request = ExternalRequest::new(entity_id, params);
    ctx.call(system.as_ref(), &request).await
}

fn add_warnings(file: &mut LoanFile, response: &ExternalResponse) {
    for warning in &response.warnings {
        file.add_flag(warning.clone());
    }
}

pub struct VerifyDocuments;

#[async_trait]
impl Operation for VerifyDocuments {
    fn name(&self) -> &str {
        VERIFY_DOCUMENTS
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, params: &Value) -> Result<TaskOutcome> {
        let name = params
            .get("document_type")
            .and_then(Value::as_str)
            .unwrap_or("urla");
        let document_type = DocumentType::parse(name).into_type();

        // Only checks the loan exists before calling out
        ctx.files.snapshot(entity_id).await?;

        let response = match call(
            ctx,
            &ctx.systems.document_review,
            entity_id,
            json!({"document": document_type.as_str()}),
        )
        .await
        {
            Ok(response) => response,
            Err(e) => return record_failure(ctx, entity_id, "document_review", e, &[]).await,
        };

        let summary = ctx
            .files
            .update(entity_id, |file| {
                let document = Document::approved(document_type, ACTOR)
                    .with_metadata("transaction_id", response.transaction_id.clone())
                    .with_metadata("pages", response.data["pages"].clone());
                let document_id = file.add_document(document)?.document_id.clone();

                let missing = file.missing_required_documents();
                for doc_type in &missing {
                    file.add_flag(format!("Missing required document: {}", doc_type.as_str()));
                }
                let target = if missing.is_empty() {
                    LoanStatus::DocumentsComplete
                } else {
                    LoanStatus::DocumentsCollecting
                };
                let details = format!("Verified document {}; {} required missing", document_id, missing.len());
                if !file.advance_status(target, ACTOR, details.clone()) {
                    file.add_audit_entry(ACTOR, "documents_verified", details.clone());
                }
                Ok(details)
            })
            .await?;
        Ok(TaskOutcome::completed(summary))
    }
}

pub struct OrderCredit;

#[async_trait]
impl Operation for OrderCredit {
    fn name(&self) -> &str {
        ORDER_CREDIT
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, _params: &Value) -> Result<TaskOutcome> {
        let file = ctx.files.snapshot(entity_id).await?;
        let request = json!({
            "borrower": file.borrower.full_name(),
            "ssn_last4": file.borrower.ssn_last4,
        });

        let response = match call(ctx, &ctx.systems.credit_bureau, entity_id, request).await {
            Ok(response) => response,
            Err(e) if e.kind == ExternalErrorKind::InvalidData => {
                return record_failure(ctx, entity_id, "credit_order", e, &[INSUFFICIENT_CREDIT_FLAG]).await
            }
            Err(e) => return record_failure(ctx, entity_id, "credit_order", e, &[]).await,
        };

        let score = response
            .data
            .get("credit_score")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
            .ok_or_else(|| LoanError::internal("credit report without a score"))?;
        let inquiries = response.data.get("inquiries").and_then(Value::as_u64).unwrap_or(0);
        let monthly_debt = response.decimal("total_monthly_debt").unwrap_or_default();
        let derogatory: Vec<String> = response
            .data
            .get("derogatory_items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        ctx.files
            .update(entity_id, |file| {
                let document = Document::approved(DocumentType::CreditReport, ACTOR)
                    .with_metadata("report_id", response.data["report_id"].clone())
                    .with_metadata("credit_score", score)
                    .with_metadata("transaction_id", response.transaction_id.clone());
                file.add_document(document)?;

                file.borrower.credit_score = Some(score);
                file.financial_metrics.total_monthly_debt = Some(monthly_debt);

                if score < 620 {
                    file.add_flag(format!("Credit score {} below 620 - limited program eligibility", score));
                }
                if score < 580 {
                    file.add_flag(format!("Credit score {} below 580 - FHA minimum", score));
                }
                if inquiries > 3 {
                    file.add_flag(format!("{} recent credit inquiries", inquiries));
                }
                for item in &derogatory {
                    file.add_flag(format!("{}{}", DEROGATORY_PREFIX, item));
                }

                let details = format!("Credit report received, score {}", score);
                if !file.advance_status(LoanStatus::CreditOrdered, ACTOR, details.clone()) {
                    file.add_audit_entry(ACTOR, "credit_report_received", details);
                }
                Ok(())
            })
            .await?;

        info!(loan = %entity_id, score, "Credit report recorded");
        Ok(TaskOutcome::completed(format!(
            "Credit score {}, monthly debt ${}",
            score, monthly_debt
        )))
    }
}

pub struct OrderAppraisal;

#[async_trait]
impl Operation for OrderAppraisal {
    fn name(&self) -> &str {
        ORDER_APPRAISAL
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, _params: &Value) -> Result<TaskOutcome> {
        let file = ctx.files.snapshot(entity_id).await?;
        let price = file.loan.purchase_price.unwrap_or(file.loan.loan_amount);
        let request = json!({
            "purchase_price": price.to_string(),
            "address": format!("{}, {}, {} {}", file.property.street, file.property.city, file.property.state, file.property.zip_code),
        });

        let response = match call(ctx, &ctx.systems.appraisal, entity_id, request).await {
            Ok(response) => response,
            Err(e) => return record_failure(ctx, entity_id, "appraisal_order", e, &[]).await,
        };
        let value = response
            .decimal("appraised_value")
            .ok_or_else(|| LoanError::internal("appraisal without a value"))?;

        ctx.files
            .update(entity_id, |file| {
                let document = Document::approved(DocumentType::Appraisal, ACTOR)
                    .with_metadata("order_id", response.data["order_id"].clone())
                    .with_metadata("appraised_value", value.to_string());
                file.add_document(document)?;
                file.property.appraised_value = Some(value);
                add_warnings(file, &response);

                let details = format!("Appraisal ordered, value ${}", value);
                if !file.advance_status(LoanStatus::AppraisalOrdered, ACTOR, details.clone()) {
                    file.add_audit_entry(ACTOR, "appraisal_received", details);
                }
                Ok(())
            })
            .await?;
        Ok(TaskOutcome::completed(format!("Appraised at ${}", value)))
    }
}

pub struct OrderFlood;

#[async_trait]
impl Operation for OrderFlood {
    fn name(&self) -> &str {
        ORDER_FLOOD
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, _params: &Value) -> Result<TaskOutcome> {
        let file = ctx.files.snapshot(entity_id).await?;
        let request = json!({
            "zip_code": file.property.zip_code,
            "address": file.property.street,
        });

        let response = match call(ctx, &ctx.systems.flood, entity_id, request).await {
            Ok(response) => response,
            Err(e) => return record_failure(ctx, entity_id, "flood_certification", e, &[]).await,
        };
        let zone = response
            .data
            .get("flood_zone")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let insurance_required = response
            .data
            .get("flood_insurance_required")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        ctx.files
            .update(entity_id, |file| {
                let document = Document::approved(DocumentType::FloodCertification, ACTOR)
                    .with_metadata("flood_zone", zone.clone())
                    .with_metadata("certificate", response.data["certificate"].clone());
                file.add_document(document)?;
                file.property.flood_zone = Some(zone.clone());
                file.property.flood_insurance_required = insurance_required;
                if insurance_required {
                    file.add_flag("Flood insurance required");
                }
                file.add_audit_entry(ACTOR, "flood_certified", format!("Flood zone {}", zone));
                Ok(())
            })
            .await?;
        Ok(TaskOutcome::completed(format!(
            "Flood zone {}{}",
            zone,
            if insurance_required { ", insurance required" } else { "" }
        )))
    }
}

pub struct VerifyEmployment;

#[async_trait]
impl Operation for VerifyEmployment {
    fn name(&self) -> &str {
        VERIFY_EMPLOYMENT
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, _params: &Value) -> Result<TaskOutcome> {
        let file = ctx.files.snapshot(entity_id).await?;
        let request = json!({
            "employer_name": file.borrower.employer_name,
            "employee_name": file.borrower.full_name(),
            "reported_income": file.borrower.stated_monthly_income.to_string(),
        });

        let response = match call(ctx, &ctx.systems.employment, entity_id, request).await {
            Ok(response) => response,
            Err(e) => return record_failure(ctx, entity_id, "employment_verification", e, &[]).await,
        };
        let verified = response
            .decimal("verified_income")
            .ok_or_else(|| LoanError::internal("employment verification without income"))?;

        ctx.files
            .update(entity_id, |file| {
                let document = Document::approved(DocumentType::EmploymentVerification, ACTOR)
                    .with_metadata("transaction_id", response.transaction_id.clone())
                    .with_metadata("verified_income", verified.to_string());
                file.add_document(document)?;
                file.borrower.employment_verified = true;
                file.financial_metrics.verified_monthly_income = Some(verified);
                add_warnings(file, &response);
                file.add_audit_entry(
                    ACTOR,
                    "employment_verified",
                    format!("Verified monthly income ${}", verified),
                );
                Ok(())
            })
            .await?;
        Ok(TaskOutcome::completed(format!("Verified monthly income ${}", verified)))
    }
}

/// Housing payment and ratios derived from a loan file
#[derive(Debug, Clone, PartialEq)]
pub struct RatioCalculation {
    pub ltv_ratio: Decimal,
    pub dti_ratio: Option<Decimal>,
    pub front_end_ratio: Option<Decimal>,
    pub monthly_housing_payment: Decimal,
}

impl RatioCalculation {
    /// Fails if the file has no credit debt figure yet
    pub fn from_file(file: &LoanFile) -> Result<Self> {
        let existing_debt = file
            .financial_metrics
            .total_monthly_debt
            .ok_or_else(|| LoanError::internal("ratios need the credit report's monthly debt"))?;
        let loan_amount = file.loan.loan_amount;
        let property_value = file
            .property
            .appraised_value
            .or(file.loan.purchase_price)
            .filter(|v| !v.is_zero())
            .ok_or_else(|| LoanError::internal("ratios need a property value"))?;
        let hundred = Decimal::ONE_HUNDRED;

        let ltv_ratio = (loan_amount / property_value * hundred).round_dp(4);

        // Principal and interest, plus 1.2% yearly tax, $100 insurance and 0.5% PMI above 80% LTV
        let annual_rate = file.loan.interest_rate.unwrap_or(Decimal::new(7, 0));
        let principal_interest = monthly_payment(loan_amount, annual_rate, file.loan.term_months);
        let property_tax = property_value * Decimal::new(12, 3) / Decimal::from(12);
        let insurance = Decimal::from(100);
        let pmi = if ltv_ratio > LTV_LIMIT {
            loan_amount * Decimal::new(5, 3) / Decimal::from(12)
        } else {
            Decimal::ZERO
        };
        let housing = (principal_interest + property_tax + insurance + pmi).round_dp(2);

        let income = file
            .financial_metrics
            .verified_monthly_income
            .unwrap_or(file.borrower.stated_monthly_income);
        let (dti_ratio, front_end_ratio) = if income.is_zero() {
            (None, None)
        } else {
            (
                Some(((existing_debt + housing) / income * hundred).round_dp(4)),
                Some((housing / income * hundred).round_dp(4)),
            )
        };

        Ok(Self {
            ltv_ratio,
            dti_ratio,
            front_end_ratio,
            monthly_housing_payment: housing,
        })
    }
}

/// Level monthly payment of a fully amortizing loan
pub fn monthly_payment(principal: Decimal, annual_rate_percent: Decimal, months: u32) -> Decimal {
    if months == 0 {
        return principal;
    }
    let rate = annual_rate_percent / Decimal::ONE_HUNDRED / Decimal::from(12);
    if rate.is_zero() {
        return principal / Decimal::from(months);
    }
    let growth = pow(Decimal::ONE + rate, months);
    principal * rate * growth / (growth - Decimal::ONE)
}

fn pow(base: Decimal, mut exp: u32) -> Decimal {
    let mut result = Decimal::ONE;
    let mut base = base;
    while exp > 0 {
        if exp & 1 == 1 {
            result *= base;
        }
        base *= base;
        exp >>= 1;
    }
    result
}

pub struct CalculateRatios;

#[async_trait]
impl Operation for CalculateRatios {
    fn name(&self) -> &str {
        CALCULATE_RATIOS
    }

    // No outside call: one critical section
    async fn run(&self, ctx: &TaskContext, entity_id: &str, _params: &Value) -> Result<TaskOutcome> {
        let ratios = ctx
            .files
            .update(entity_id, |file| {
                let ratios = RatioCalculation::from_file(file)?;
                let metrics = &mut file.financial_metrics;
                metrics.ltv_ratio = Some(ratios.ltv_ratio);
                metrics.dti_ratio = ratios.dti_ratio;
                metrics.front_end_ratio = ratios.front_end_ratio;
                metrics.monthly_housing_payment = Some(ratios.monthly_housing_payment);

                if let Some(dti) = ratios.dti_ratio.filter(|dti| *dti > DTI_LIMIT) {
                    file.add_flag(format!("DTI {}% exceeds 43% guideline", dti.round_dp(2)));
                }
                if ratios.ltv_ratio > LTV_LIMIT {
                    file.add_flag(format!(
                        "LTV {}% above 80% - PMI required",
                        ratios.ltv_ratio.round_dp(2)
                    ));
                }
                file.add_audit_entry(
                    ACTOR,
                    "ratios_calculated",
                    format!(
                        "LTV {}%, DTI {}%",
                        ratios.ltv_ratio.round_dp(2),
                        ratios
                            .dti_ratio
                            .map(|d| d.round_dp(2).to_string())
                            .unwrap_or_else(|| "n/a".to_string())
                    ),
                );
                Ok(ratios)
            })
            .await?;

        Ok(TaskOutcome::completed(format!(
            "LTV {}%, housing payment ${}",
            ratios.ltv_ratio.round_dp(2),
            ratios.monthly_housing_payment
        )))
    }
}

pub struct SubmitToUnderwriting;

#[async_trait]
impl Operation for SubmitToUnderwriting {
    fn name(&self) -> &str {
        SUBMIT_TO_UNDERWRITING
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, _params: &Value) -> Result<TaskOutcome> {
        let flags = ctx
            .files
            .update(entity_id, |file| {
                let details = format!(
                    "Submitted with {} documents and {} flags",
                    file.documents.len(),
                    file.flags.len()
                );
                file.update_status(LoanStatus::Submitted, ACTOR, details)?;
                Ok(file.flags.len())
            })
            .await?;
        Ok(TaskOutcome::completed(format!(
            "Submitted to underwriting with {} flags",
            flags
        )))
    }
}
