//! Underwriter operations.
//!
//! Automated findings come first and run alone. The four area reviews read
//! only the loan file, so they run together; each records its issues on the
//! file. Conditions are issued from those issues plus the automated required
//! documents, and the file then either waits on conditions or is approved.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{call, ACTOR, DEROGATORY_PREFIX};
use crate::core::errors::{LoanError, Result};
use crate::external::INCOME_VARIANCE_WARNING;
use crate::record::{
    ConditionSeverity, ConditionType, DecisionType, DocumentStatus, DocumentType, LoanFile,
    LoanStatus, UnderwritingCondition, UnderwritingDecision,
};
use crate::tasks::{Operation, OperationRegistry, Task, TaskContext, TaskGraph, TaskOutcome};

pub const RUN_AUTOMATED_UNDERWRITING: &str = "run_automated_underwriting";
pub const REVIEW_CREDIT_PROFILE: &str = "review_credit_profile";
pub const REVIEW_INCOME_EMPLOYMENT: &str = "review_income_employment";
pub const REVIEW_ASSETS_RESERVES: &str = "review_assets_reserves";
pub const REVIEW_PROPERTY_APPRAISAL: &str = "review_property_appraisal";
pub const ISSUE_UNDERWRITING_CONDITIONS: &str = "issue_underwriting_conditions";
pub const CLEAR_CONDITIONS: &str = "clear_conditions";
pub const ISSUE_FINAL_APPROVAL: &str = "issue_final_approval";
pub const DENY_LOAN: &str = "deny_loan";

pub const REVIEWS: [&str; 4] = [
    REVIEW_CREDIT_PROFILE,
    REVIEW_INCOME_EMPLOYMENT,
    REVIEW_ASSETS_RESERVES,
    REVIEW_PROPERTY_APPRAISAL,
];

const UNDERWRITER: &str = "underwriter";
const AUTOMATED_UNDERWRITER: &str = "automated_underwriting_system";
const DEFAULT_DENIAL_REASON: &str = "Does not meet underwriting guidelines";

pub(super) fn register(registry: &mut OperationRegistry) {
    registry.register(Arc::new(RunAutomatedUnderwriting));
    registry.register(Arc::new(Review::credit()));
    registry.register(Arc::new(Review::income()));
    registry.register(Arc::new(Review::assets()));
    registry.register(Arc::new(Review::property()));
    registry.register(Arc::new(IssueUnderwritingConditions));
    registry.register(Arc::new(ClearConditions));
    registry.register(Arc::new(IssueFinalApproval));
    registry.register(Arc::new(DenyLoan));
}

/// Underwriting of a submitted loan.
///
/// Automated underwriting runs alone, the four reviews then run together,
/// and conditions are issued once every review has finished.
pub fn underwriting_graph() -> Result<TaskGraph> {
    let ops = super::loan_operations();
    let mut tasks = vec![Task::new(RUN_AUTOMATED_UNDERWRITING, ops.get(RUN_AUTOMATED_UNDERWRITING)?)
        .sequential()
        .estimated(Duration::from_secs(3))];
    for review in REVIEWS {
        tasks.push(
            Task::new(review, ops.get(review)?)
                .depends_on([RUN_AUTOMATED_UNDERWRITING])
                .estimated(Duration::from_secs(1)),
        );
    }
    tasks.push(
        Task::new(ISSUE_UNDERWRITING_CONDITIONS, ops.get(ISSUE_UNDERWRITING_CONDITIONS)?)
            .depends_on(REVIEWS)
            .sequential()
            .estimated(Duration::from_secs(1)),
    );
    TaskGraph::from_tasks(tasks)
}

/// Clear every open condition, then issue the final approval
pub fn closing_graph() -> Result<TaskGraph> {
    let ops = super::loan_operations();
    TaskGraph::from_tasks([
        Task::new(CLEAR_CONDITIONS, ops.get(CLEAR_CONDITIONS)?).sequential(),
        Task::new(ISSUE_FINAL_APPROVAL, ops.get(ISSUE_FINAL_APPROVAL)?)
            .depends_on([CLEAR_CONDITIONS])
            .sequential(),
    ])
}

fn strings(data: &Value, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

// Only a submitted loan, or one already in review, can be underwritten
fn ensure_reviewable(file: &LoanFile) -> Result<()> {
    match file.status {
        LoanStatus::Submitted | LoanStatus::UnderwritingReview => Ok(()),
        other => Err(LoanError::InvalidTransition {
            entity_id: file.loan_number.clone(),
            from: other.to_string(),
            to: LoanStatus::UnderwritingReview.to_string(),
        }),
    }
}

pub struct RunAutomatedUnderwriting;

#[async_trait]
impl Operation for RunAutomatedUnderwriting {
    fn name(&self) -> &str {
        RUN_AUTOMATED_UNDERWRITING
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, _params: &Value) -> Result<TaskOutcome> {
        let file = ctx.files.snapshot(entity_id).await?;
        ensure_reviewable(&file)?;
        let metrics = &file.financial_metrics;
        let request = json!({
            "credit_score": file.borrower.credit_score,
            "dti_ratio": metrics.dti_ratio.map(|d| d.to_string()),
            "ltv_ratio": metrics.ltv_ratio.map(|l| l.to_string()),
        });

        let response = match call(ctx, &ctx.systems.underwriting, entity_id, request).await {
            Ok(response) => response,
            Err(e) => {
                ctx.files
                    .record_failure(entity_id, UNDERWRITER, "automated_underwriting", &e)
                    .await?;
                return Ok(TaskOutcome::failed(
                    e.kind,
                    format!("automated_underwriting failed ({}): {}", e.kind, e.message),
                ));
            }
        };
        let recommendation = response
            .data
            .get("recommendation")
            .and_then(Value::as_str)
            .ok_or_else(|| LoanError::internal("automated findings without a recommendation"))?
            .to_string();
        let findings = strings(&response.data, "findings");
        let required_documents = strings(&response.data, "required_documents");
        let price_adjustment = response.decimal("loan_level_price_adjustment").unwrap_or_default();
        let reserves_months = response.data["reserves_required_months"].as_u64().unwrap_or(2);

        let reason = format!("DU recommendation: {}", recommendation);
        ctx.files
            .update(entity_id, |file| {
                ensure_reviewable(file)?;
                let decision =
                    UnderwritingDecision::new(AUTOMATED_UNDERWRITER, DecisionType::AutomatedFindings, reason.clone())
                        .with_findings(findings.clone(), required_documents.clone());
                file.record_decision(decision);
                if file.status != LoanStatus::UnderwritingReview {
                    file.update_status(
                        LoanStatus::UnderwritingReview,
                        UNDERWRITER,
                        format!("Automated underwriting: {}", recommendation),
                    )?;
                }
                let entry = file.add_audit_entry(UNDERWRITER, "automated_underwriting", reason.clone());
                entry
                    .metadata
                    .insert("transaction_id".to_string(), Value::from(response.transaction_id.clone()));
                entry
                    .metadata
                    .insert("casefile_id".to_string(), response.data["casefile_id"].clone());
                entry.metadata.insert(
                    "loan_level_price_adjustment".to_string(),
                    Value::from(price_adjustment.to_string()),
                );
                entry
                    .metadata
                    .insert("reserves_required_months".to_string(), Value::from(reserves_months));
                Ok(())
            })
            .await?;

        info!(loan = %entity_id, recommendation = %recommendation, findings = findings.len(), "Automated findings recorded");
        Ok(TaskOutcome::completed(format!(
            "{}, {} required document(s)",
            reason,
            required_documents.len()
        )))
    }
}

/// What one review found
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub issues: Vec<String>,
    pub details: String,
}

/// One underwriting review area.
///
/// Reviews make no outside calls: each is a single critical section that
/// assesses the file and replaces that area's issues.
pub struct Review {
    name: &'static str,
    area: &'static str,
    assess: fn(&LoanFile) -> Result<Assessment>,
}

impl Review {
    pub fn credit() -> Self {
        Self {
            name: REVIEW_CREDIT_PROFILE,
            area: "credit",
            assess: assess_credit,
        }
    }

    pub fn income() -> Self {
        Self {
            name: REVIEW_INCOME_EMPLOYMENT,
            area: "income",
            assess: assess_income,
        }
    }

    pub fn assets() -> Self {
        Self {
            name: REVIEW_ASSETS_RESERVES,
            area: "assets",
            assess: assess_assets,
        }
    }

    pub fn property() -> Self {
        Self {
            name: REVIEW_PROPERTY_APPRAISAL,
            area: "appraisal",
            assess: assess_property,
        }
    }

    pub fn area(&self) -> &str {
        self.area
    }
}

#[async_trait]
impl Operation for Review {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, _params: &Value) -> Result<TaskOutcome> {
        let assessment = ctx
            .files
            .update(entity_id, |file| {
                let assessment = (self.assess)(file)?;
                file.record_review(self.area, assessment.issues.clone(), UNDERWRITER, assessment.details.clone());
                Ok(assessment)
            })
            .await?;
        Ok(TaskOutcome::completed(format!(
            "{}; {} issue(s)",
            assessment.details,
            assessment.issues.len()
        )))
    }
}

pub fn assess_credit(file: &LoanFile) -> Result<Assessment> {
    let score = file
        .borrower
        .credit_score
        .ok_or_else(|| LoanError::internal("credit review needs a credit report"))?;
    let derogatory: Vec<&String> = file
        .flags
        .iter()
        .filter(|f| f.starts_with(DEROGATORY_PREFIX))
        .collect();

    let mut issues = Vec::new();
    if score < 620 {
        issues.push("Credit score below conventional minimum".to_string());
    }
    if derogatory.iter().any(|f| f.contains("late payment")) {
        issues.push("Recent late payments - LOE required".to_string());
    }
    if file.flags.iter().any(|f| f.ends_with("recent credit inquiries")) {
        issues.push("Multiple credit inquiries - LOE required".to_string());
    }
    if !derogatory.is_empty() {
        issues.push("Derogatory items present - LOE required".to_string());
    }
    Ok(Assessment {
        details: format!("Credit score {}", score),
        issues,
    })
}

pub fn assess_income(file: &LoanFile) -> Result<Assessment> {
    let stated = file.borrower.stated_monthly_income;
    let verified = file.financial_metrics.verified_monthly_income;

    let mut issues = Vec::new();
    if !file.borrower.employment_verified {
        issues.push("Employment not verified - VOE required".to_string());
    }
    if let Some(verified) = verified.filter(|v| *v < stated * Decimal::new(95, 2)) {
        issues.push(format!(
            "Verified income ${} below stated ${}",
            verified.round_dp(2),
            stated.round_dp(2)
        ));
    }
    if file.flags.iter().any(|f| f.starts_with(INCOME_VARIANCE_WARNING)) {
        issues.push("Income variance needs a letter of explanation".to_string());
    }
    Ok(Assessment {
        details: format!("Qualifying income ${}", verified.unwrap_or(stated).round_dp(2)),
        issues,
    })
}

pub fn assess_assets(file: &LoanFile) -> Result<Assessment> {
    let reserves_months = match file.financial_metrics.dti_ratio {
        Some(dti) if dti > Decimal::from(45) => 6,
        _ => 2,
    };
    let on_file = |doc_type: &DocumentType| {
        file.documents_of_type(doc_type).any(|d| {
            matches!(
                d.status,
                DocumentStatus::Received | DocumentStatus::UnderReview | DocumentStatus::Approved
            )
        })
    };
    let statements = [DocumentType::BankStatement, DocumentType::AssetStatement]
        .iter()
        .filter(|t| on_file(t))
        .count();

    let mut issues = Vec::new();
    if statements == 0 {
        issues.push(format!(
            "Bank statements needed to verify {} months reserves",
            reserves_months
        ));
    }
    if let (Some(value), Some(price)) = (file.property.appraised_value, file.loan.purchase_price) {
        if value < price {
            issues.push(format!(
                "Additional assets of ${} needed to cover appraisal gap",
                (price - value).round_dp(2)
            ));
        }
    }
    Ok(Assessment {
        details: format!("{} months reserves required", reserves_months),
        issues,
    })
}

pub fn assess_property(file: &LoanFile) -> Result<Assessment> {
    let mut issues = Vec::new();
    match (file.property.appraised_value, file.loan.purchase_price) {
        (None, _) => issues.push("No appraisal on file".to_string()),
        (Some(value), Some(price)) if value < price => {
            issues.push(format!("Value below purchase price by ${}", (price - value).round_dp(2)))
        }
        _ => {}
    }
    if file.property.flood_zone.is_none() {
        issues.push("Flood certification missing".to_string());
    } else if file.property.flood_insurance_required {
        issues.push("Flood insurance policy required".to_string());
    }
    Ok(Assessment {
        details: match file.property.appraised_value {
            Some(value) => format!("Appraised value ${}", value),
            None => "Appraisal pending".to_string(),
        },
        issues,
    })
}

fn severity_for(condition_type: ConditionType) -> ConditionSeverity {
    match condition_type {
        ConditionType::Insurance => ConditionSeverity::PriorToFunding,
        _ => ConditionSeverity::Required,
    }
}

/// Issues conditions and records the underwriting decision.
///
/// Sources, in order: every review area's issues, the latest automated
/// required documents, then `params.conditions`. A description already
/// carried by any condition on the file is not issued again.
pub struct IssueUnderwritingConditions;

#[async_trait]
impl Operation for IssueUnderwritingConditions {
    fn name(&self) -> &str {
        ISSUE_UNDERWRITING_CONDITIONS
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, params: &Value) -> Result<TaskOutcome> {
        let requested = strings(params, "conditions");

        let (issued, open, status) = ctx
            .files
            .update(entity_id, |file| {
                let mut wanted: Vec<(String, String, String)> = Vec::new();
                for (area, issues) in &file.review_issues {
                    for issue in issues {
                        wanted.push((area.clone(), issue.clone(), format!("Found in {} review", area)));
                    }
                }
                if let Some(findings) = file
                    .decisions
                    .iter()
                    .rev()
                    .find(|d| d.decision == DecisionType::AutomatedFindings)
                {
                    for doc in &findings.required_documents {
                        wanted.push((
                            "automated_underwriting".to_string(),
                            doc.clone(),
                            findings.reason.clone(),
                        ));
                    }
                }
                for description in &requested {
                    wanted.push(("underwriter".to_string(), description.clone(), "Underwriter review".to_string()));
                }

                let mut seen: BTreeSet<String> = file.conditions.iter().map(|c| c.description.clone()).collect();
                let mut issued = Vec::new();
                for (category, description, reason) in wanted {
                    if !seen.insert(description.clone()) {
                        continue;
                    }
                    let condition_type = ConditionType::from_description(&description);
                    let condition = UnderwritingCondition::new(
                        condition_type,
                        severity_for(condition_type),
                        category,
                        description,
                        reason,
                    );
                    issued.push(condition.condition_id.clone());
                    file.add_condition(condition)?;
                }

                let open = file.open_conditions().count();
                if open == 0 {
                    file.record_decision(UnderwritingDecision::new(
                        UNDERWRITER,
                        DecisionType::Approve,
                        "No open conditions",
                    ));
                    file.update_status(LoanStatus::Approved, UNDERWRITER, "Approved without conditions")?;
                } else {
                    let reason = format!("Conditional approval - {} condition(s) issued", issued.len());
                    file.record_decision(
                        UnderwritingDecision::new(UNDERWRITER, DecisionType::ApproveWithConditions, reason.clone())
                            .with_conditions(issued.clone()),
                    );
                    file.update_status(LoanStatus::ConditionsPending, UNDERWRITER, reason)?;
                }
                Ok((issued.len(), open, file.status))
            })
            .await?;

        info!(loan = %entity_id, issued, open, status = %status, "Underwriting conditions issued");
        Ok(TaskOutcome::completed(format!(
            "{} condition(s) issued, {} open, status {}",
            issued, open, status
        )))
    }
}

/// Clears `params.condition_ids`, or every open condition when none are
/// named. Once nothing is open the file goes back to the underwriter.
pub struct ClearConditions;

#[async_trait]
impl Operation for ClearConditions {
    fn name(&self) -> &str {
        CLEAR_CONDITIONS
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, params: &Value) -> Result<TaskOutcome> {
        let named = strings(params, "condition_ids");
        let documents = strings(params, "documents");
        let notes = params.get("notes").and_then(Value::as_str).map(str::to_string);

        let (cleared, open) = ctx
            .files
            .update(entity_id, |file| {
                let ids: Vec<String> = if named.is_empty() {
                    file.open_conditions().map(|c| c.condition_id.clone()).collect()
                } else {
                    named.clone()
                };
                for id in &ids {
                    file.clear_condition(id, documents.clone(), notes.clone(), ACTOR)?;
                }
                let open = file.open_conditions().count();
                if open == 0 && file.status == LoanStatus::ConditionsPending {
                    file.update_status(
                        LoanStatus::ConditionsSubmitted,
                        ACTOR,
                        format!("All conditions cleared ({} this pass)", ids.len()),
                    )?;
                }
                Ok((ids.len(), open))
            })
            .await?;
        Ok(TaskOutcome::completed(format!(
            "Cleared {} condition(s), {} still open",
            cleared, open
        )))
    }
}

/// Clear to close. Refused while any condition is open.
pub struct IssueFinalApproval;

#[async_trait]
impl Operation for IssueFinalApproval {
    fn name(&self) -> &str {
        ISSUE_FINAL_APPROVAL
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, params: &Value) -> Result<TaskOutcome> {
        let notes = params
            .get("notes")
            .and_then(Value::as_str)
            .unwrap_or("Final approval by underwriter")
            .to_string();

        let decision_id = ctx
            .files
            .update(entity_id, |file| {
                let open = file.open_conditions().count();
                if open > 0 {
                    return Err(LoanError::OpenConditions {
                        entity_id: file.loan_number.clone(),
                        open,
                    });
                }
                if file.status == LoanStatus::ConditionsSubmitted {
                    file.update_status(LoanStatus::Approved, UNDERWRITER, "All conditions cleared")?;
                }
                let decision =
                    UnderwritingDecision::new(UNDERWRITER, DecisionType::Approve, "Final approval - Clear to Close")
                        .with_notes(notes.clone());
                let decision_id = decision.decision_id.clone();
                file.record_decision(decision);
                file.update_status(
                    LoanStatus::ClearToClose,
                    UNDERWRITER,
                    "Final approval issued - Clear to Close",
                )?;
                Ok(decision_id)
            })
            .await?;

        info!(loan = %entity_id, decision = %decision_id, "Clear to close");
        Ok(TaskOutcome::completed(format!("Clear to close ({})", decision_id)))
    }
}

/// Records a denial. `params.reason` names why.
pub struct DenyLoan;

#[async_trait]
impl Operation for DenyLoan {
    fn name(&self) -> &str {
        DENY_LOAN
    }

    async fn run(&self, ctx: &TaskContext, entity_id: &str, params: &Value) -> Result<TaskOutcome> {
        let reason = params
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_DENIAL_REASON)
            .to_string();

        ctx.files
            .update(entity_id, |file| {
                file.record_decision(UnderwritingDecision::new(UNDERWRITER, DecisionType::Deny, reason.clone()));
                file.update_status(LoanStatus::Denied, UNDERWRITER, format!("Loan denied: {}", reason))
            })
            .await?;

        info!(loan = %entity_id, reason = %reason, "Loan denied");
        Ok(TaskOutcome::completed(format!("Denied: {}", reason)))
    }
}
