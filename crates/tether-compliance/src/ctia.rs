use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::json;

use tether_types::CoreResult;

use crate::context::{ComplianceContext, Regulation, Violation, ViolationSeverity};
use crate::framework::{ComplianceGate, GateCheckOutcome};

#[derive(Debug, Clone)]
pub struct CtiaConfig {
    /// Opt-ins older than this are stale and no longer usable.
    pub opt_in_max_age_days: i64,
    pub quiet_start_hour: u32,
    pub quiet_end_hour: u32,
    pub max_per_day: usize,
    pub max_per_week: usize,
    pub max_per_month: usize,
    pub max_body_length: usize,
    pub opt_out_hint: String,
}

impl Default for CtiaConfig {
    fn default() -> Self {
        Self {
            opt_in_max_age_days: 365,
            quiet_start_hour: 21,
            quiet_end_hour: 8,
            max_per_day: 3,
            max_per_week: 10,
            max_per_month: 30,
            max_body_length: 160,
            opt_out_hint: "STOP".to_string(),
        }
    }
}

#[derive(Default)]
struct CtiaState {
    opt_ins: HashMap<String, DateTime<Utc>>,
    opt_outs: HashSet<String>,
    message_log: HashMap<String, Vec<DateTime<Utc>>>,
    registered_senders: HashSet<String>,
}

/// CTIA messaging-principles gate: opt-in freshness, opt-out membership,
/// rolling volume caps, quiet hours, and content rules.
pub struct CtiaGate {
    config: CtiaConfig,
    prohibited: Vec<(&'static str, Regex)>,
    state: RwLock<CtiaState>,
}

impl CtiaGate {
    pub fn new(config: CtiaConfig) -> Self {
        // SHAFT categories; patterns are deliberately coarse
        let prohibited = [
            ("sex", r"(?i)\b(xxx|adult content|escort)\b"),
            ("hate", r"(?i)\b(hate speech)\b"),
            ("alcohol", r"(?i)\b(whiskey|vodka|beer deal)\b"),
            ("firearms", r"(?i)\b(firearm|gun sale|ammo)\b"),
            ("tobacco", r"(?i)\b(cigarette|vape deal|tobacco)\b"),
        ]
        .into_iter()
        .filter_map(|(label, pattern)| Regex::new(pattern).ok().map(|re| (label, re)))
        .collect();

        Self {
            config,
            prohibited,
            state: RwLock::new(CtiaState::default()),
        }
    }

    pub fn record_opt_in(&self, phone: impl Into<String>) {
        let phone = phone.into();
        let mut state = self.state.write();
        state.opt_outs.remove(&phone);
        state.opt_ins.insert(phone, Utc::now());
    }

    /// Inbound keyword handling: STOP populates the opt-out set.
    pub fn process_inbound(&self, phone: &str, body: &str) {
        let normalized = body.trim().to_uppercase();
        if normalized == "STOP" || normalized.starts_with("STOP ") {
            let mut state = self.state.write();
            state.opt_outs.insert(phone.to_string());
            state.opt_ins.remove(phone);
        }
    }

    pub fn record_message(&self, phone: impl Into<String>, at: DateTime<Utc>) {
        self.state.write().message_log.entry(phone.into()).or_default().push(at);
    }

    pub fn register_sender(&self, sender_id: impl Into<String>) {
        self.state.write().registered_senders.insert(sender_id.into());
    }

    pub fn is_opted_out(&self, phone: &str) -> bool {
        self.state.read().opt_outs.contains(phone)
    }

    fn in_quiet_hours(&self, ctx: &ComplianceContext) -> Option<bool> {
        let tz: Tz = ctx.target.timezone.as_deref()?.parse().ok()?;
        let hour = ctx.timestamp.with_timezone(&tz).hour();
        // quiet window wraps midnight: [start, 24) ∪ [0, end)
        Some(hour >= self.config.quiet_start_hour || hour < self.config.quiet_end_hour)
    }
}

impl ComplianceGate for CtiaGate {
    fn id(&self) -> &str {
        "ctia"
    }

    fn regulation(&self) -> Regulation {
        Regulation::Ctia
    }

    fn priority(&self) -> i32 {
        40
    }

    fn check(&self, ctx: &ComplianceContext) -> CoreResult<GateCheckOutcome> {
        let Some(phone) = ctx.target.phone.as_deref() else {
            return Ok(GateCheckOutcome::allow());
        };
        let body = ctx.data_str("body").unwrap_or("");
        let mut violations = Vec::new();

        let state = self.state.read();
        match state.opt_ins.get(phone) {
            Some(opted_in_at)
                if ctx.timestamp - *opted_in_at
                    <= Duration::days(self.config.opt_in_max_age_days) => {}
            Some(opted_in_at) => violations.push(
                Violation::new(
                    "CTIA-001",
                    Regulation::Ctia,
                    ViolationSeverity::High,
                    format!("opt-in for {phone} is stale (recorded {opted_in_at})"),
                )
                .with_remediation("re-confirm the recipient's opt-in"),
            ),
            None => violations.push(
                Violation::new(
                    "CTIA-001",
                    Regulation::Ctia,
                    ViolationSeverity::High,
                    format!("no opt-in on file for {phone}"),
                )
                .with_remediation("collect an opt-in before messaging"),
            ),
        }

        if state.opt_outs.contains(phone) {
            violations.push(
                Violation::new(
                    "CTIA-002",
                    Regulation::Ctia,
                    ViolationSeverity::Critical,
                    format!("{phone} has opted out"),
                )
                .with_remediation("suppress this recipient permanently"),
            );
        }

        if let Some(log) = state.message_log.get(phone) {
            let windows = [
                ("day", Duration::days(1), self.config.max_per_day),
                ("week", Duration::weeks(1), self.config.max_per_week),
                ("month", Duration::days(30), self.config.max_per_month),
            ];
            for (label, span, cap) in windows {
                let sent = log.iter().filter(|at| ctx.timestamp - **at <= span).count();
                if sent >= cap {
                    violations.push(
                        Violation::new(
                            "CTIA-003",
                            Regulation::Ctia,
                            ViolationSeverity::Medium,
                            format!("{sent} messages to {phone} in the last {label} reach the cap of {cap}"),
                        )
                        .with_evidence(json!({"window": label, "sent": sent, "cap": cap}))
                        .with_remediation("reduce message frequency to this recipient"),
                    );
                    break;
                }
            }
        }
        drop(state);

        match self.in_quiet_hours(ctx) {
            Some(true) => violations.push(
                Violation::new(
                    "CTIA-004",
                    Regulation::Ctia,
                    ViolationSeverity::High,
                    "message falls inside the recipient's quiet hours".to_string(),
                )
                .with_remediation("send between 8:00 and 21:00 recipient-local time"),
            ),
            Some(false) => {}
            None => violations.push(
                Violation::new(
                    "CTIA-004",
                    Regulation::Ctia,
                    ViolationSeverity::High,
                    "recipient timezone unknown; quiet hours cannot be verified".to_string(),
                )
                .with_remediation("resolve the recipient's timezone before messaging"),
            ),
        }

        if body.chars().count() > self.config.max_body_length {
            violations.push(
                Violation::new(
                    "CTIA-005",
                    Regulation::Ctia,
                    ViolationSeverity::Low,
                    format!(
                        "body of {} chars exceeds the {}-char limit",
                        body.chars().count(),
                        self.config.max_body_length
                    ),
                )
                .with_remediation("shorten the message body"),
            );
        }

        if !body.to_uppercase().contains(&self.config.opt_out_hint.to_uppercase()) {
            violations.push(
                Violation::new(
                    "CTIA-006",
                    Regulation::Ctia,
                    ViolationSeverity::Medium,
                    format!("body lacks the `{}` opt-out hint", self.config.opt_out_hint),
                )
                .with_remediation("append opt-out instructions, e.g. `Reply STOP to unsubscribe`"),
            );
        }

        for (label, re) in &self.prohibited {
            if re.is_match(body) {
                violations.push(
                    Violation::new(
                        "CTIA-007",
                        Regulation::Ctia,
                        ViolationSeverity::Critical,
                        format!("body matches the prohibited `{label}` category"),
                    )
                    .with_remediation("remove prohibited content from the message"),
                );
            }
        }

        let sender = ctx.data_str("sender_id").unwrap_or("");
        if sender.is_empty() || !self.state.read().registered_senders.contains(sender) {
            violations.push(
                Violation::new(
                    "CTIA-008",
                    Regulation::Ctia,
                    ViolationSeverity::High,
                    format!("sender id `{sender}` is not registered"),
                )
                .with_remediation("register the sender id with the carrier program"),
            );
        }

        Ok(GateCheckOutcome::from_violations(violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sms_ctx() -> ComplianceContext {
        let mut ctx = ComplianceContext::new("messenger", "send_sms");
        ctx.target.phone = Some("+14155550111".to_string());
        ctx.target.timezone = Some("America/New_York".to_string());
        // 16:00 UTC = 12:00 in New York (summer)
        ctx.timestamp = Utc.with_ymd_and_hms(2025, 7, 15, 16, 0, 0).unwrap();
        ctx.data = json!({
            "body": "Your order shipped. Reply STOP to unsubscribe.",
            "sender_id": "12345"
        });
        ctx
    }

    fn ready_gate() -> CtiaGate {
        let gate = CtiaGate::new(CtiaConfig::default());
        gate.record_opt_in("+14155550111");
        gate.register_sender("12345");
        gate
    }

    #[test]
    fn clean_message_passes() {
        let gate = ready_gate();
        let outcome = gate.check(&sms_ctx()).unwrap();
        assert!(outcome.allowed, "violations: {:?}", outcome.violations);
    }

    #[test]
    fn stop_keyword_populates_opt_out() {
        let gate = ready_gate();
        gate.process_inbound("+14155550111", "stop");
        assert!(gate.is_opted_out("+14155550111"));

        let outcome = gate.check(&sms_ctx()).unwrap();
        let codes: Vec<&str> = outcome.violations.iter().map(|v| v.code.as_str()).collect();
        // opt-out removed the opt-in too
        assert!(codes.contains(&"CTIA-001"));
        assert!(codes.contains(&"CTIA-002"));
    }

    #[test]
    fn quiet_hours_block_by_recipient_timezone() {
        let gate = ready_gate();
        let mut ctx = sms_ctx();
        // 02:00 UTC = 22:00 in New York
        ctx.timestamp = Utc.with_ymd_and_hms(2025, 7, 16, 2, 0, 0).unwrap();
        let outcome = gate.check(&ctx).unwrap();
        assert!(outcome.violations.iter().any(|v| v.code == "CTIA-004"));
    }

    #[test]
    fn daily_cap_trips_after_configured_sends() {
        let gate = ready_gate();
        let ctx = sms_ctx();
        for _ in 0..3 {
            gate.record_message("+14155550111", ctx.timestamp - Duration::hours(2));
        }
        let outcome = gate.check(&ctx).unwrap();
        assert!(outcome.violations.iter().any(|v| v.code == "CTIA-003"));
    }

    #[test]
    fn content_rules_flag_length_hint_and_prohibited() {
        let gate = ready_gate();
        let mut ctx = sms_ctx();
        ctx.data = json!({
            "body": format!("Huge gun sale this weekend! {}", "x".repeat(200)),
            "sender_id": "12345"
        });
        let outcome = gate.check(&ctx).unwrap();
        let codes: Vec<&str> = outcome.violations.iter().map(|v| v.code.as_str()).collect();
        assert!(codes.contains(&"CTIA-005"));
        assert!(codes.contains(&"CTIA-006"));
        assert!(codes.contains(&"CTIA-007"));
    }

    #[test]
    fn unregistered_sender_is_flagged() {
        let gate = ready_gate();
        let mut ctx = sms_ctx();
        ctx.data["sender_id"] = json!("99999");
        let outcome = gate.check(&ctx).unwrap();
        assert!(outcome.violations.iter().any(|v| v.code == "CTIA-008"));
    }

    #[test]
    fn stale_opt_in_is_flagged() {
        let gate = ready_gate();
        let mut ctx = sms_ctx();
        // opt-in was recorded "now"; jump the clock past the freshness window
        ctx.timestamp = Utc::now() + Duration::days(400);
        let outcome = gate.check(&ctx).unwrap();
        assert!(outcome.violations.iter().any(|v| v.code == "CTIA-001"));
    }
}
