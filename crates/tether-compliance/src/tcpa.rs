use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde_json::json;

use tether_types::CoreResult;

use crate::context::{ComplianceContext, Regulation, Violation, ViolationSeverity};
use crate::framework::{ComplianceGate, GateCheckOutcome};

/// Statutory exposure per negligent TCPA violation.
const TCPA_EXPOSURE_USD: f64 = 500.0;

#[derive(Debug, Clone)]
pub struct TcpaConfig {
    /// Permitted local calling window, `[start_hour, end_hour)`.
    pub window_start_hour: u32,
    pub window_end_hour: u32,
    pub max_daily_calls_per_recipient: usize,
    pub require_caller_id: bool,
    pub dnc_cache_ttl_hours: i64,
}

impl Default for TcpaConfig {
    fn default() -> Self {
        Self {
            window_start_hour: 8,
            window_end_hour: 21,
            max_daily_calls_per_recipient: 3,
            require_caller_id: true,
            dnc_cache_ttl_hours: 24,
        }
    }
}

#[derive(Debug, Clone)]
struct ConsentRecord {
    express: bool,
    #[allow(dead_code)]
    granted_at: DateTime<Utc>,
}

#[derive(Default)]
struct TcpaState {
    dnc: HashSet<String>,
    dnc_checked_at: HashMap<String, DateTime<Utc>>,
    consents: HashMap<String, ConsentRecord>,
    call_log: HashMap<String, Vec<DateTime<Utc>>>,
    // (month, day) blackout dates
    holidays: HashSet<(u32, u32)>,
}

/// Telephone Consumer Protection Act gate: local calling window, holiday
/// blackouts, DNC, prior express consent, daily call caps, caller id.
pub struct TcpaGate {
    config: TcpaConfig,
    state: RwLock<TcpaState>,
}

impl TcpaGate {
    pub fn new(config: TcpaConfig) -> Self {
        let mut state = TcpaState::default();
        // federal holidays observed as call blackouts
        state.holidays.insert((1, 1));
        state.holidays.insert((7, 4));
        state.holidays.insert((12, 25));
        Self {
            config,
            state: RwLock::new(state),
        }
    }

    pub fn add_to_dnc(&self, phone: impl Into<String>) {
        self.state.write().dnc.insert(phone.into());
    }

    pub fn record_consent(&self, phone: impl Into<String>, express: bool) {
        self.state.write().consents.insert(
            phone.into(),
            ConsentRecord {
                express,
                granted_at: Utc::now(),
            },
        );
    }

    pub fn record_call(&self, phone: impl Into<String>, at: DateTime<Utc>) {
        self.state.write().call_log.entry(phone.into()).or_default().push(at);
    }

    pub fn add_holiday(&self, month: u32, day: u32) {
        self.state.write().holidays.insert((month, day));
    }

    /// Whether the cached DNC lookup for this number is still fresh.
    pub fn dnc_cache_fresh(&self, phone: &str) -> bool {
        self.state.read().dnc_checked_at.get(phone).is_some_and(|at| {
            Utc::now() - *at < chrono::Duration::hours(self.config.dnc_cache_ttl_hours)
        })
    }
}

impl ComplianceGate for TcpaGate {
    fn id(&self) -> &str {
        "tcpa"
    }

    fn regulation(&self) -> Regulation {
        Regulation::Tcpa
    }

    fn priority(&self) -> i32 {
        50
    }

    fn check(&self, ctx: &ComplianceContext) -> CoreResult<GateCheckOutcome> {
        let Some(phone) = ctx.target.phone.as_deref() else {
            // not a calling action; nothing for this gate to say
            return Ok(GateCheckOutcome::allow());
        };

        let mut violations = Vec::new();
        let violation = |code: &str, severity, message: String| {
            Violation::new(code, Regulation::Tcpa, severity, message)
                .with_exposure(TCPA_EXPOSURE_USD)
        };

        // local calling window: outside [8, 21) local time is off-limits
        match local_time(ctx) {
            Some(local) => {
                let hour = local.0;
                if hour < self.config.window_start_hour || hour >= self.config.window_end_hour {
                    violations.push(
                        violation(
                            "TCPA-001",
                            ViolationSeverity::High,
                            format!(
                                "call at {hour:02}:{:02} local time is outside the {}:00-{}:00 window",
                                local.1, self.config.window_start_hour, self.config.window_end_hour
                            ),
                        )
                        .with_rule("47 CFR 64.1200(c)(1)")
                        .with_evidence(json!({"local_hour": hour, "timezone": ctx.target.timezone}))
                        .with_remediation("schedule the call inside the recipient's local calling window"),
                    );
                }
                if self.state.read().holidays.contains(&(local.2, local.3)) {
                    violations.push(
                        violation(
                            "TCPA-002",
                            ViolationSeverity::Medium,
                            format!("calls are blacked out on {}/{}", local.2, local.3),
                        )
                        .with_remediation("retry on the next business day"),
                    );
                }
            }
            None => {
                // unknown local time means the window cannot be proven; fail closed
                violations.push(
                    violation(
                        "TCPA-001",
                        ViolationSeverity::High,
                        "recipient timezone is missing or invalid; calling window cannot be verified"
                            .to_string(),
                    )
                    .with_rule("47 CFR 64.1200(c)(1)")
                    .with_remediation("resolve the recipient's timezone before calling"),
                );
            }
        }

        {
            let mut state = self.state.write();
            state.dnc_checked_at.insert(phone.to_string(), Utc::now());
            if state.dnc.contains(phone) {
                violations.push(
                    violation(
                        "TCPA-003",
                        ViolationSeverity::Critical,
                        format!("{phone} is on the Do-Not-Call registry"),
                    )
                    .with_rule("47 CFR 64.1200(c)(2)")
                    .with_remediation("remove the number from the campaign"),
                );
            }
        }

        let state = self.state.read();
        match state.consents.get(phone) {
            Some(consent) if consent.express => {}
            Some(_) => violations.push(
                violation(
                    "TCPA-004",
                    ViolationSeverity::Critical,
                    format!("consent on file for {phone} is not prior express consent"),
                )
                .with_rule("47 CFR 64.1200(a)(1)")
                .with_remediation("obtain prior express consent before calling"),
            ),
            None => violations.push(
                violation(
                    "TCPA-004",
                    ViolationSeverity::Critical,
                    format!("no prior express consent on file for {phone}"),
                )
                .with_rule("47 CFR 64.1200(a)(1)")
                .with_remediation("obtain prior express consent before calling"),
            ),
        }

        let today = ctx.timestamp.date_naive();
        let calls_today = state
            .call_log
            .get(phone)
            .map(|calls| calls.iter().filter(|at| at.date_naive() == today).count())
            .unwrap_or(0);
        if calls_today >= self.config.max_daily_calls_per_recipient {
            violations.push(
                violation(
                    "TCPA-005",
                    ViolationSeverity::High,
                    format!(
                        "{calls_today} calls to {phone} today reach the daily cap of {}",
                        self.config.max_daily_calls_per_recipient
                    ),
                )
                .with_remediation("wait until tomorrow before calling again"),
            );
        }
        drop(state);

        if self.config.require_caller_id {
            let caller_id = ctx.data_str("caller_id").unwrap_or("");
            if caller_id.is_empty() || caller_id.eq_ignore_ascii_case("anonymous") {
                violations.push(
                    violation(
                        "TCPA-006",
                        ViolationSeverity::High,
                        "caller id is missing or anonymous".to_string(),
                    )
                    .with_rule("47 CFR 64.1601(e)")
                    .with_remediation("present a valid outbound caller id"),
                );
            }
        }

        Ok(GateCheckOutcome::from_violations(violations))
    }
}

/// (hour, minute, month, day) in the recipient's local timezone.
fn local_time(ctx: &ComplianceContext) -> Option<(u32, u32, u32, u32)> {
    let tz: Tz = ctx.target.timezone.as_deref()?.parse().ok()?;
    let local = ctx.timestamp.with_timezone(&tz);
    Some((local.hour(), local.minute(), local.month(), local.day()))
}
