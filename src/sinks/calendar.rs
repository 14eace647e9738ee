//! Calendar.app sink driven through `osascript`.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};

use super::{
    applescript_date_lines, escape_applescript, run_osascript, CalendarSink, ExistingEvent,
};
use crate::classifier::EventItem;
use crate::errors::SinkError;

pub struct AppleCalendar {
    calendar_name: Option<String>,
}

impl AppleCalendar {
    pub fn new(calendar_name: Option<String>) -> Self {
        Self { calendar_name }
    }

    /// AppleScript expression resolving the target calendar: the configured
    /// one when present, otherwise the first writable calendar (Calendar.app
    /// does not expose the system default to scripting).
    fn calendar_selection(&self) -> String {
        let by_name = match &self.calendar_name {
            Some(name) => format!(
                "try\n\
                 set targetCal to calendar \"{}\"\n\
                 end try\n",
                escape_applescript(name)
            ),
            None => String::new(),
        };
        format!(
            "set targetCal to missing value\n\
             {by_name}\
             if targetCal is missing value then\n\
             repeat with c in calendars\n\
             try\n\
             if writable of c then\n\
             set targetCal to c\n\
             exit repeat\n\
             end if\n\
             end try\n\
             end repeat\n\
             end if\n\
             if targetCal is missing value then error \"no writable calendar available\"\n"
        )
    }
}

#[async_trait]
impl CalendarSink for AppleCalendar {
    async fn events_on_day(&self, day: NaiveDate) -> Result<Vec<ExistingEvent>, SinkError> {
        let day_start = day.and_hms_opt(0, 0, 0).unwrap_or(NaiveDateTime::MIN);
        let next_day = day_start + Duration::days(1);
        let script = format!(
            "{day_start_lines}\n\
             {next_day_lines}\n\
             set out to \"\"\n\
             tell application \"Calendar\"\n\
             repeat with c in calendars\n\
             repeat with e in (every event of c whose start date \u{2265} dayStart and start date < nextDay)\n\
             set out to out & (summary of e) & tab & ((start date of e) as \u{00ab}class isot\u{00bb} as string) & linefeed\n\
             end repeat\n\
             end repeat\n\
             end tell\n\
             return out",
            day_start_lines = applescript_date_lines("dayStart", day_start),
            next_day_lines = applescript_date_lines("nextDay", next_day),
        );

        let output = run_osascript(&script).await?;
        Ok(parse_events_output(&output))
    }

    async fn create_event(&self, event: &EventItem) -> Result<(), SinkError> {
        let all_day_line = if event.all_day {
            "set allday event of newEvent to true\n"
        } else {
            ""
        };
        let script = format!(
            "{start_lines}\n\
             {end_lines}\n\
             tell application \"Calendar\"\n\
             {selection}\
             tell targetCal\n\
             set newEvent to make new event with properties {{summary:\"{title}\", start date:startDate, end date:endDate}}\n\
             {all_day_line}\
             end tell\n\
             end tell",
            start_lines = applescript_date_lines("startDate", event.start),
            end_lines = applescript_date_lines("endDate", event.end),
            selection = self.calendar_selection(),
            title = escape_applescript(&event.title),
            all_day_line = all_day_line,
        );

        run_osascript(&script).await?;
        tracing::info!("Created calendar event '{}' at {}", event.title, event.start);
        Ok(())
    }
}

/// Parse the tab-separated `title \t ISO-start` lines the query script emits.
/// Unparseable lines are skipped; an existing entry we cannot read should
/// never block creation.
fn parse_events_output(output: &str) -> Vec<ExistingEvent> {
    output
        .lines()
        .filter_map(|line| {
            let (title, iso) = line.rsplit_once('\t')?;
            let start = parse_iso(iso.trim())?;
            Some(ExistingEvent {
                title: title.trim().to_string(),
                start,
            })
        })
        .collect()
}

fn parse_iso(raw: &str) -> Option<NaiveDateTime> {
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y%m%dT%H%M%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_output_lines() {
        let output = "Dinner with Sam\t2026-08-28T19:00:00\nbroken line\nStandup\t20260828T093000\n";
        let events = parse_events_output(output);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].title, "Dinner with Sam");
        assert_eq!(
            events[0].start,
            NaiveDate::from_ymd_opt(2026, 8, 28)
                .unwrap()
                .and_hms_opt(19, 0, 0)
                .unwrap()
        );
        assert_eq!(events[1].title, "Standup");
    }

    #[test]
    fn selection_prefers_configured_calendar() {
        let sink = AppleCalendar::new(Some("Plans".to_string()));
        let selection = sink.calendar_selection();
        assert!(selection.contains("calendar \"Plans\""));
        assert!(selection.contains("if writable of c then"));

        let fallback_only = AppleCalendar::new(None).calendar_selection();
        assert!(!fallback_only.contains("calendar \""));
    }
}
