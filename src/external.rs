//! The slow, fallible side of a task.
//!
//! Operations talk to outside systems only through [`ExternalSystem`]. The
//! simulators here sleep for a random latency and fail with classified
//! errors at configurable rates.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::core::errors::{ExternalError, ExternalErrorKind};

pub const DOCUMENT_REVIEW: &str = "document_review";
pub const CREDIT_BUREAU: &str = "credit_bureau";
pub const APPRAISAL_MANAGEMENT: &str = "appraisal_management";
pub const FLOOD_CERTIFICATION: &str = "flood_certification";
pub const EMPLOYMENT_VERIFICATION: &str = "employment_verification";
pub const AUTOMATED_UNDERWRITING: &str = "automated_underwriting";

/// Prefix of the warning raised when verified income strays from the reported figure
pub const INCOME_VARIANCE_WARNING: &str = "Income variance detected";

/// Zip codes the flood simulator always places in a high-risk zone
pub const HIGH_RISK_ZIP_CODES: [&str; 8] = [
    "33139", "33109", "70112", "70113", "70117", "77551", "08260", "23451",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub entity_id: String,
    #[serde(default)]
    pub params: Value,
}

impl ExternalRequest {
    pub fn new(entity_id: impl Into<String>, params: Value) -> Self {
        Self {
            entity_id: entity_id.into(),
            params,
        }
    }

    fn param_decimal(&self, key: &str) -> Option<Decimal> {
        match self.params.get(key)? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.to_string().parse().ok(),
            _ => None,
        }
    }

    fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key)?.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub system: String,
    pub transaction_id: String,
    pub data: Value,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ExternalResponse {
    /// Decimal field of `data`, accepted as a string or a number
    pub fn decimal(&self, key: &str) -> Option<Decimal> {
        match self.data.get(key)? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.to_string().parse().ok(),
            _ => None,
        }
    }
}

/// A dependency outside the process
#[async_trait]
pub trait ExternalSystem: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, request: &ExternalRequest) -> Result<ExternalResponse, ExternalError>;
}

/// Run `call` under an optional time budget; expiry becomes a `Timeout`
pub async fn call_with_budget(
    system: &dyn ExternalSystem,
    request: &ExternalRequest,
    budget: Option<Duration>,
) -> Result<ExternalResponse, ExternalError> {
    let Some(budget) = budget else {
        return system.call(request).await;
    };
    match tokio::time::timeout(budget, system.call(request)).await {
        Ok(result) => result,
        Err(_) => Err(ExternalError::timeout(
            system.name(),
            format!("no response within {}ms", budget.as_millis()),
        )),
    }
}

/// Failure rates applied after the simulated latency, checked in order
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultProfile {
    pub timeout: f64,
    pub unavailable: f64,
    pub invalid_data: f64,
}

impl FaultProfile {
    pub const NONE: FaultProfile = FaultProfile {
        timeout: 0.0,
        unavailable: 0.0,
        invalid_data: 0.0,
    };

    fn pick(&self, roll: f64) -> Option<ExternalErrorKind> {
        if roll < self.timeout {
            Some(ExternalErrorKind::Timeout)
        } else if roll < self.timeout + self.unavailable {
            Some(ExternalErrorKind::Unavailable)
        } else if roll < self.timeout + self.unavailable + self.invalid_data {
            Some(ExternalErrorKind::InvalidData)
        } else {
            None
        }
    }
}

type Responder = dyn Fn(&ExternalRequest, &mut fastrand::Rng) -> (Value, Vec<String>) + Send + Sync;

/// Fault-injecting stand-in for an outside system
pub struct SimulatedSystem {
    name: String,
    min_latency: Duration,
    max_latency: Duration,
    faults: FaultProfile,
    failure_messages: [String; 3],
    forced: Mutex<VecDeque<ExternalErrorKind>>,
    rng: Mutex<fastrand::Rng>,
    responder: Arc<Responder>,
}

impl SimulatedSystem {
    pub fn new<F>(name: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&ExternalRequest, &mut fastrand::Rng) -> (Value, Vec<String>) + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            failure_messages: [
                format!("{} timeout - please retry", name),
                format!("{} under maintenance", name),
                format!("{} rejected the request data", name),
            ],
            name,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            faults: FaultProfile::NONE,
            forced: Mutex::new(VecDeque::new()),
            rng: Mutex::new(fastrand::Rng::new()),
            responder: Arc::new(responder),
        }
    }

    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.min_latency = min;
        self.max_latency = max.max(min);
        self
    }

    pub fn with_fixed_latency(self, latency: Duration) -> Self {
        self.with_latency(latency, latency)
    }

    pub fn with_faults(mut self, faults: FaultProfile) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        *lock(&self.rng) = fastrand::Rng::with_seed(seed);
        self
    }

    /// Message used for failures of `kind`
    pub fn with_failure_message(mut self, kind: ExternalErrorKind, message: impl Into<String>) -> Self {
        self.failure_messages[kind_index(kind)] = message.into();
        self
    }

    /// Zero latency and no random faults
    pub fn instant(self) -> Self {
        self.with_latency(Duration::ZERO, Duration::ZERO)
            .with_faults(FaultProfile::NONE)
    }

    /// Make the next call fail with `kind`, after the usual latency.
    /// Queued failures are consumed in order.
    pub fn force_next(&self, kind: ExternalErrorKind) {
        lock(&self.forced).push_back(kind);
    }

    pub fn document_review() -> Self {
        Self::new(DOCUMENT_REVIEW, |request, rng| {
            let document = request.param_str("document").unwrap_or("URLA").to_string();
            (
                json!({
                    "document": document,
                    "verified": true,
                    "pages": rng.u32(1..=12),
                }),
                Vec::new(),
            )
        })
        .with_latency(Duration::from_millis(200), Duration::from_millis(800))
        .with_faults(FaultProfile {
            timeout: 0.02,
            ..FaultProfile::NONE
        })
    }

    pub fn credit_bureau() -> Self {
        Self::new(CREDIT_BUREAU, |_request, rng| {
            let score = rng.u16(580..=820);
            let inquiries = rng.u32(0..=5);
            let tradelines = rng.u32(3..=12);
            let mut monthly_debt = 0u32;
            for _ in 0..tradelines {
                // Closed accounts carry no payment
                if rng.f64() > 0.3 {
                    monthly_debt += rng.u32(50..=1500);
                }
            }
            let derogatory: Vec<&str> = if score < 620 {
                let pool = [
                    "Collection account - Medical $2,500",
                    "30-day late payment in last 12 months",
                    "60-day late payment 18 months ago",
                ];
                let take = rng.usize(1..=2);
                pool.iter().take(take).copied().collect()
            } else {
                Vec::new()
            };
            (
                json!({
                    "report_id": format!("CR-{}", rng.u32(100_000..=999_999)),
                    "credit_score": score,
                    "inquiries": inquiries,
                    "tradelines": tradelines,
                    "total_monthly_debt": Decimal::from(monthly_debt).to_string(),
                    "derogatory_items": derogatory,
                }),
                Vec::new(),
            )
        })
        .with_latency(Duration::from_millis(500), Duration::from_millis(2000))
        .with_faults(FaultProfile {
            timeout: 0.05,
            unavailable: 0.02,
            invalid_data: 0.01,
        })
        .with_failure_message(ExternalErrorKind::Timeout, "Credit bureau timeout - please retry")
        .with_failure_message(
            ExternalErrorKind::Unavailable,
            "Credit bureau under maintenance (2AM-4AM EST)",
        )
        .with_failure_message(
            ExternalErrorKind::InvalidData,
            "Borrower has insufficient credit history",
        )
    }

    pub fn appraisal_management() -> Self {
        Self::new(APPRAISAL_MANAGEMENT, |request, rng| {
            let price = request.param_decimal("purchase_price").unwrap_or_default();
            let (low, high) = if rng.f64() < 0.15 { (9000, 9500) } else { (9800, 10200) };
            let factor = Decimal::new(i64::from(rng.u32(low..=high)), 4);
            let value = (price * factor).round_dp(0);
            let mut warnings = Vec::new();
            if value < price {
                warnings.push("Appraised value below purchase price - renegotiation required".to_string());
            }
            (
                json!({
                    "order_id": format!("APR-{}", rng.u32(100_000..=999_999)),
                    "appraised_value": value.to_string(),
                    "appraiser_assigned": rng.bool(),
                }),
                warnings,
            )
        })
        .with_latency(Duration::from_millis(1000), Duration::from_millis(2000))
    }

    pub fn flood_certification() -> Self {
        Self::new(FLOOD_CERTIFICATION, |request, rng| {
            let zip = request.param_str("zip_code").unwrap_or_default();
            let zone = if HIGH_RISK_ZIP_CODES.contains(&zip) {
                ["AE", "VE", "A"][rng.usize(..3)]
            } else {
                ["X", "X", "X", "C"][rng.usize(..4)]
            };
            let insurance_required = matches!(zone, "A" | "AE" | "VE" | "V");
            (
                json!({
                    "flood_zone": zone,
                    "flood_insurance_required": insurance_required,
                    "certificate": format!("FLOOD-{}", rng.u32(100_000..=999_999)),
                }),
                Vec::new(),
            )
        })
        .with_latency(Duration::from_millis(300), Duration::from_millis(1000))
        .with_faults(FaultProfile {
            timeout: 0.02,
            ..FaultProfile::NONE
        })
        .with_failure_message(ExternalErrorKind::Timeout, "Flood certification service timeout")
    }

    pub fn employment_verification() -> Self {
        Self::new(EMPLOYMENT_VERIFICATION, |request, rng| {
            let reported = request.param_decimal("reported_income").unwrap_or_default();
            let factor = Decimal::new(i64::from(rng.u32(9500..=10500)), 4);
            let verified = (reported * factor).round_dp(2);
            let mut warnings = Vec::new();
            if (verified - reported).abs() > reported * Decimal::new(1, 1) {
                warnings.push(format!(
                    "{}: Reported ${}, Verified ${}",
                    INCOME_VARIANCE_WARNING, reported, verified
                ));
            }
            (
                json!({
                    "employer_name": request.param_str("employer_name").unwrap_or_default(),
                    "employment_status": "active",
                    "employment_type": (["full_time", "part_time", "contract"][rng.usize(..3)]),
                    "reported_income": reported.to_string(),
                    "verified_income": verified.to_string(),
                }),
                warnings,
            )
        })
        .with_latency(Duration::from_millis(1000), Duration::from_millis(3000))
    }

    /// Desktop-underwriter style recommendation from score and ratios.
    /// A missing score is treated as 700.
    pub fn automated_underwriting() -> Self {
        Self::new(AUTOMATED_UNDERWRITING, |request, rng| {
            let score = request
                .params
                .get("credit_score")
                .and_then(Value::as_u64)
                .unwrap_or(700);
            let dti = request.param_decimal("dti_ratio");
            let ltv = request.param_decimal("ltv_ratio");
            let above = |ratio: Option<Decimal>, limit: i64| ratio.map_or(false, |r| r > Decimal::from(limit));

            let recommendation = if above(dti, 50) {
                "refer"
            } else if score < 620 {
                "caution"
            } else if above(ltv, 95) {
                "refer"
            } else if score >= 740 && dti.map_or(false, |d| d <= Decimal::from(43)) {
                "approve"
            } else {
                ["approve", "approve", "refer"][rng.usize(..3)]
            };

            let mut findings = Vec::new();
            let mut required_documents = Vec::new();
            if let Some(dti) = dti.filter(|d| *d > Decimal::from(43)) {
                findings.push(format!("DTI ratio {}% exceeds guidelines", dti.round_dp(2)));
                required_documents.push("VOE - Verify stable employment".to_string());
            }
            if let Some(ltv) = ltv.filter(|l| *l > Decimal::from(80)) {
                findings.push(format!("LTV ratio {}% requires PMI", ltv.round_dp(2)));
                required_documents.push("PMI certificate".to_string());
            }
            if score < 680 {
                findings.push(format!("Credit score {} below preferred threshold", score));
                required_documents.push("LOE - Explain credit inquiries".to_string());
            }

            let mut price_adjustment = Decimal::ZERO;
            if score < 700 {
                price_adjustment += Decimal::new(5, 1);
            }
            if above(ltv, 80) {
                price_adjustment += Decimal::new(25, 2);
            }
            let reserves_months = if above(dti, 45) { 6 } else { 2 };

            (
                json!({
                    "casefile_id": format!("CF{}", rng.u32(1_000_000..=9_999_999)),
                    "recommendation": recommendation,
                    "findings": findings,
                    "required_documents": required_documents,
                    "loan_level_price_adjustment": price_adjustment.to_string(),
                    "reserves_required_months": reserves_months,
                }),
                Vec::new(),
            )
        })
        .with_latency(Duration::from_millis(1000), Duration::from_millis(3000))
        .with_faults(FaultProfile {
            timeout: 0.03,
            ..FaultProfile::NONE
        })
        .with_failure_message(ExternalErrorKind::Timeout, "Automated underwriting system timeout")
    }

    fn latency(&self, rng: &mut fastrand::Rng) -> Duration {
        if self.max_latency <= self.min_latency {
            return self.min_latency;
        }
        let span = (self.max_latency - self.min_latency).as_millis() as u64;
        self.min_latency + Duration::from_millis(rng.u64(0..=span))
    }
}

#[async_trait]
impl ExternalSystem for SimulatedSystem {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &ExternalRequest) -> Result<ExternalResponse, ExternalError> {
        // Draw everything up front so no lock is held across the sleep
        let (latency, roll, mut rng) = {
            let mut rng = lock(&self.rng);
            let call_rng = rng.fork();
            (self.latency(&mut rng), rng.f64(), call_rng)
        };
        debug!(system = %self.name, loan = %request.entity_id, latency_ms = latency.as_millis() as u64, "External call");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let forced = lock(&self.forced).pop_front();
        if let Some(kind) = forced.or_else(|| self.faults.pick(roll)) {
            return Err(ExternalError::new(
                &self.name,
                kind,
                &self.failure_messages[kind_index(kind)],
            ));
        }

        let (data, warnings) = (self.responder)(request, &mut rng);
        Ok(ExternalResponse {
            system: self.name.clone(),
            transaction_id: format!("TXN-{}", rng.u32(100_000..=999_999)),
            data,
            warnings,
        })
    }
}

/// The set of outside systems the loan operations use
#[derive(Clone)]
pub struct ExternalSystems {
    pub document_review: Arc<dyn ExternalSystem>,
    pub credit_bureau: Arc<dyn ExternalSystem>,
    pub appraisal: Arc<dyn ExternalSystem>,
    pub flood: Arc<dyn ExternalSystem>,
    pub employment: Arc<dyn ExternalSystem>,
    pub underwriting: Arc<dyn ExternalSystem>,
}

impl ExternalSystems {
    /// Simulators with realistic latency and fault rates
    pub fn simulated() -> Self {
        Self {
            document_review: Arc::new(SimulatedSystem::document_review()),
            credit_bureau: Arc::new(SimulatedSystem::credit_bureau()),
            appraisal: Arc::new(SimulatedSystem::appraisal_management()),
            flood: Arc::new(SimulatedSystem::flood_certification()),
            employment: Arc::new(SimulatedSystem::employment_verification()),
            underwriting: Arc::new(SimulatedSystem::automated_underwriting()),
        }
    }

    /// Simulators that answer immediately and never fail on their own
    pub fn instant() -> Self {
        Self {
            document_review: Arc::new(SimulatedSystem::document_review().instant()),
            credit_bureau: Arc::new(SimulatedSystem::credit_bureau().instant()),
            appraisal: Arc::new(SimulatedSystem::appraisal_management().instant()),
            flood: Arc::new(SimulatedSystem::flood_certification().instant()),
            employment: Arc::new(SimulatedSystem::employment_verification().instant()),
            underwriting: Arc::new(SimulatedSystem::automated_underwriting().instant()),
        }
    }
}

fn kind_index(kind: ExternalErrorKind) -> usize {
    match kind {
        ExternalErrorKind::Timeout => 0,
        ExternalErrorKind::Unavailable => 1,
        ExternalErrorKind::InvalidData => 2,
    }
}

// A panic while holding one of these leaves plain data behind; keep using it
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
