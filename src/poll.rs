//! Authenticated calendar polling and pure slot filtering.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, info};

use crate::browser::driver::{PageDriver, PageMarker};
use crate::core::types::{FilterCriteria, Slot};
use crate::core::SentinelError;
use crate::session::SessionHandle;

pub struct SlotPoller {
    driver: Arc<dyn PageDriver>,
}

impl SlotPoller {
    pub fn new(driver: Arc<dyn PageDriver>) -> Self {
        Self { driver }
    }

    /// Query the calendar once. Requires an authenticated session — the
    /// first thing checked is the page marker, so a mid-flight logout shows
    /// up as `SessionExpired` rather than a confusing parse failure.
    pub async fn poll(&self, handle: &SessionHandle) -> Result<Vec<Slot>, SentinelError> {
        debug_assert!(handle.is_authenticated(), "poll requires Authenticated");

        match self.driver.read_marker().await? {
            PageMarker::Authenticated => {}
            marker => {
                info!("logged-out indicator during poll ({marker:?})");
                return Err(SentinelError::SessionExpired);
            }
        }

        let body = self.driver.fetch_calendar().await?;
        let slots = parse_schedule_days(&body)?;
        info!("poll returned {} open day(s)", slots.len());
        Ok(slots)
    }
}

/// Parse the schedule-days payload into an ordered slot list.
///
/// Expected shape:
/// `{"ScheduleDays": [{"Date": "2024-06-10", "Time": "09:30", "FacilityId": "MTL"}, ...]}`
/// `Date` may carry a `T…` time suffix; `Time` and `FacilityId` are optional
/// and `FacilityId` may be numeric. An empty array is a valid, slotless day.
pub fn parse_schedule_days(body: &str) -> Result<Vec<Slot>, SentinelError> {
    let parse_err = |msg: String| SentinelError::Parse(msg);

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| parse_err(format!("not json: {e}")))?;
    let days = value
        .get("ScheduleDays")
        .and_then(|v| v.as_array())
        .ok_or_else(|| parse_err("missing ScheduleDays array".into()))?;

    let mut slots = Vec::with_capacity(days.len());
    for (i, day) in days.iter().enumerate() {
        let raw_date = day
            .get("Date")
            .and_then(|v| v.as_str())
            .ok_or_else(|| parse_err(format!("entry {i}: missing Date")))?;
        // Tolerate "2024-06-10T00:00:00" by taking the date prefix.
        let date_part = raw_date.get(..10).unwrap_or(raw_date);
        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
            .map_err(|e| parse_err(format!("entry {i}: bad Date {raw_date:?}: {e}")))?;

        let time = match day.get("Time").and_then(|v| v.as_str()) {
            Some(t) => Some(
                NaiveTime::parse_from_str(t, "%H:%M:%S")
                    .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
                    .map_err(|e| parse_err(format!("entry {i}: bad Time {t:?}: {e}")))?,
            ),
            None => None,
        };

        let facility = day.get("FacilityId").and_then(|v| {
            v.as_str()
                .map(str::to_string)
                .or_else(|| v.as_i64().map(|n| n.to_string()))
        });

        slots.push(Slot {
            date,
            time,
            facility,
        });
    }

    debug!("parsed {} schedule day(s)", slots.len());
    Ok(slots)
}

/// Pure, order-preserving filter. Idempotent by construction.
pub fn filter_slots(slots: &[Slot], criteria: &FilterCriteria) -> Vec<Slot> {
    slots
        .iter()
        .filter(|s| criteria.admits(s))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parses_full_payload_in_order() {
        let body = r#"{
            "ScheduleDays": [
                {"Date": "2024-05-01"},
                {"Date": "2024-06-10T00:00:00", "Time": "09:30", "FacilityId": "MTL"},
                {"Date": "2024-07-01", "FacilityId": 12}
            ]
        }"#;
        let slots = parse_schedule_days(body).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].date, d(2024, 5, 1));
        assert_eq!(slots[1].time.unwrap().to_string(), "09:30:00");
        assert_eq!(slots[1].facility.as_deref(), Some("MTL"));
        assert_eq!(slots[2].facility.as_deref(), Some("12"));
    }

    #[test]
    fn empty_schedule_is_valid_not_an_error() {
        let slots = parse_schedule_days(r#"{"ScheduleDays": []}"#).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn malformed_payloads_are_parse_errors() {
        for body in [
            "<html>waiting room</html>",
            r#"{"SomethingElse": []}"#,
            r#"{"ScheduleDays": [{"NoDate": true}]}"#,
            r#"{"ScheduleDays": [{"Date": "junk"}]}"#,
            r#"{"ScheduleDays": [{"Date": "2024-06-10", "Time": "late"}]}"#,
        ] {
            let err = parse_schedule_days(body).unwrap_err();
            assert!(matches!(err, SentinelError::Parse(_)), "{body}");
        }
    }

    fn criteria(earliest: NaiveDate) -> FilterCriteria {
        FilterCriteria {
            earliest,
            latest: None,
            excluded: BTreeSet::new(),
            facilities: None,
        }
    }

    #[test]
    fn filter_is_order_preserving() {
        let slots: Vec<Slot> = [d(2024, 7, 1), d(2024, 5, 1), d(2024, 6, 10)]
            .into_iter()
            .map(|date| Slot {
                date,
                time: None,
                facility: None,
            })
            .collect();
        let kept = filter_slots(&slots, &criteria(d(2024, 6, 1)));
        assert_eq!(
            kept.iter().map(|s| s.date).collect::<Vec<_>>(),
            vec![d(2024, 7, 1), d(2024, 6, 10)]
        );
    }

    #[test]
    fn filter_is_idempotent() {
        let slots: Vec<Slot> = (1..=20)
            .map(|day| Slot {
                date: d(2024, 6, day),
                time: None,
                facility: if day % 2 == 0 {
                    Some("MTL".into())
                } else {
                    None
                },
            })
            .collect();
        let c = FilterCriteria {
            earliest: d(2024, 6, 5),
            latest: Some(d(2024, 6, 15)),
            excluded: [d(2024, 6, 8)].into_iter().collect(),
            facilities: Some(["MTL".to_string()].into_iter().collect()),
        };
        let once = filter_slots(&slots, &c);
        let twice = filter_slots(&once, &c);
        assert_eq!(once, twice);
    }
}
