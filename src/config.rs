/// Billing configuration assembled once at startup and handed to the
/// components that need it. Reminder enablement and the due-day offset are
/// injected here instead of being read from ambient process state.
#[derive(Clone, Debug)]
pub struct BillingConfig {
    /// Days between issuing a bill and its due date.
    pub bill_days_to_due: i64,
    /// Master switch for automatic reminder escalation.
    pub enable_reminders: bool,
    /// Cadence of the background reminder scan.
    pub reminder_scan_interval_secs: u64,
    /// Days a paper reminder may stay unpaid before it shows up in the
    /// overdue report.
    pub paper_reminder_grace_days: i64,
    /// Account details printed on bills and handed to the renderer.
    pub iban_account_number: String,
    pub bic_code: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            bill_days_to_due: 14,
            enable_reminders: true,
            reminder_scan_interval_secs: 300,
            paper_reminder_grace_days: 14,
            iban_account_number: String::new(),
            bic_code: String::new(),
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bill_days_to_due: std::env::var("BILL_DAYS_TO_DUE")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.bill_days_to_due),
            enable_reminders: std::env::var("ENABLE_REMINDERS")
                .ok()
                .map(|value| {
                    let normalized = value.trim().to_ascii_lowercase();
                    matches!(normalized.as_str(), "1" | "true" | "yes")
                })
                .unwrap_or(defaults.enable_reminders),
            reminder_scan_interval_secs: std::env::var("REMINDER_SCAN_INTERVAL_SECS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.reminder_scan_interval_secs),
            paper_reminder_grace_days: std::env::var("PAPER_REMINDER_GRACE_DAYS")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .filter(|value| *value >= 0)
                .unwrap_or(defaults.paper_reminder_grace_days),
            iban_account_number: std::env::var("IBAN_ACCOUNT_NUMBER")
                .ok()
                .map(|value| value.trim().to_string())
                .unwrap_or(defaults.iban_account_number),
            bic_code: std::env::var("BIC_CODE")
                .ok()
                .map(|value| value.trim().to_string())
                .unwrap_or(defaults.bic_code),
        }
    }
}
