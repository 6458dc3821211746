use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

/// One stored security question / answer pair.
#[derive(Clone, Deserialize)]
pub struct SecurityQuestion {
    pub question: String,
    pub answer: String,
}

impl fmt::Debug for SecurityQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityQuestion")
            .field("question", &self.question)
            .field("answer", &"<redacted>")
            .finish()
    }
}

/// Portal login identity. Immutable for the process lifetime; sourced from
/// credential.json and never logged — the `Debug` impl redacts the password
/// and all answers.
#[derive(Clone, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub security_questions: Vec<SecurityQuestion>,
}

impl Credential {
    /// Look up the stored answer for a question as presented by the portal.
    ///
    /// Matching is case-insensitive substring containment in either direction,
    /// since the portal renders stored questions with varying prefixes and
    /// punctuation ("Q2: What city were you born in?").
    pub fn answer_for(&self, presented: &str) -> Option<&str> {
        let presented = presented.trim().to_lowercase();
        if presented.is_empty() {
            return None;
        }
        self.security_questions
            .iter()
            .find(|qa| {
                let stored = qa.question.trim().to_lowercase();
                !stored.is_empty() && (presented.contains(&stored) || stored.contains(&presented))
            })
            .map(|qa| qa.answer.as_str())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("security_questions", &self.security_questions.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Slots & filtering
// ─────────────────────────────────────────────────────────────────────────────

/// A discrete appointment opportunity. Produced fresh on every poll, never
/// mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    #[serde(default)]
    pub time: Option<NaiveTime>,
    #[serde(default)]
    pub facility: Option<String>,
}

impl Slot {
    /// Identity tuple used by the dispatcher to guarantee at-most-one alert
    /// per distinct slot value within a run.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.date,
            self.time.map(|t| t.to_string()).unwrap_or_default(),
            self.facility.as_deref().unwrap_or_default()
        )
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.date)?;
        if let Some(t) = self.time {
            write!(f, " {}", t.format("%H:%M"))?;
        }
        if let Some(fac) = &self.facility {
            write!(f, " at {fac}")?;
        }
        Ok(())
    }
}

/// Caller-supplied match criteria, immutable per run.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterCriteria {
    pub earliest: NaiveDate,
    #[serde(default)]
    pub latest: Option<NaiveDate>,
    #[serde(default)]
    pub excluded: BTreeSet<NaiveDate>,
    /// Facility allow-list. `None` admits every facility; a slot without a
    /// facility id only matches when no allow-list is set.
    #[serde(default)]
    pub facilities: Option<BTreeSet<String>>,
}

impl FilterCriteria {
    pub fn admits(&self, slot: &Slot) -> bool {
        if slot.date < self.earliest {
            return false;
        }
        if let Some(latest) = self.latest {
            if slot.date > latest {
                return false;
            }
        }
        if self.excluded.contains(&slot.date) {
            return false;
        }
        if let Some(allowed) = &self.facilities {
            match &slot.facility {
                Some(fac) => allowed.contains(fac),
                None => false,
            }
        } else {
            true
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notification
// ─────────────────────────────────────────────────────────────────────────────

/// A matched slot the moment it was first seen this run.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub slot: Slot,
    pub first_seen: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            first_seen: Utc::now(),
        }
    }

    /// Operator-facing alert text.
    pub fn message(&self) -> String {
        format!(
            "Appointment slot open: {} (seen {})",
            self.slot,
            self.first_seen.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}
