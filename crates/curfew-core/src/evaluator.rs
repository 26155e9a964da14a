//! Schedule window evaluation
//!
//! Pure predicates over schedules. Nothing here touches the store or the
//! clock, so a given (schedule, instant, zone) triple always evaluates the
//! same way.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use curfew_api::Schedule;

/// Whether `schedule` is enabled and its window contains `now` in `tz`
pub fn is_schedule_active(schedule: &Schedule, now: DateTime<Utc>, tz: Tz) -> bool {
    schedule.is_active && schedule.window().contains_at(now, tz)
}

/// Schedules that are currently in effect
pub fn active_schedules<'a>(
    schedules: &'a [Schedule],
    now: DateTime<Utc>,
    tz: Tz,
) -> impl Iterator<Item = &'a Schedule> + 'a {
    schedules
        .iter()
        .filter(move |s| is_schedule_active(s, now, tz))
}

/// A device should be locked when any of its schedules is in effect.
/// No schedules means unlocked.
pub fn should_lock(schedules: &[Schedule], now: DateTime<Utc>, tz: Tz) -> bool {
    active_schedules(schedules, now, tz).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use curfew_util::{DaysOfWeek, ParentId, ScheduleId, WallClock};

    fn schedule(start: &str, end: &str, days: &[u8]) -> Schedule {
        Schedule {
            id: ScheduleId::new(1),
            parent_id: ParentId::new("p"),
            name: "Test".into(),
            start_time: WallClock::parse(start).unwrap(),
            end_time: WallClock::parse(end).unwrap(),
            days_of_week: DaysOfWeek::from_indices(days.iter().copied()),
            is_active: true,
            created_at: at("2023-12-01T00:00:00Z"),
        }
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    const UTC: Tz = chrono_tz::UTC;

    // 2024-01-01 is a Monday

    #[test]
    fn same_day_window_bounds_are_inclusive() {
        let s = schedule("14:00", "18:00", &[1]);

        assert!(!is_schedule_active(&s, at("2024-01-01T13:59:59Z"), UTC));
        assert!(is_schedule_active(&s, at("2024-01-01T14:00:00Z"), UTC));
        assert!(is_schedule_active(&s, at("2024-01-01T18:00:59Z"), UTC));
        assert!(!is_schedule_active(&s, at("2024-01-01T18:01:00Z"), UTC));
    }

    #[test]
    fn day_outside_set_is_never_active() {
        let s = schedule("00:00", "23:59", &[0, 6]);
        assert!(!is_schedule_active(&s, at("2024-01-01T12:00:00Z"), UTC));
        assert!(is_schedule_active(&s, at("2024-01-06T12:00:00Z"), UTC));
    }

    #[test]
    fn overnight_window_on_listed_day() {
        let s = schedule("22:00", "06:30", &[1]);
        assert!(is_schedule_active(&s, at("2024-01-01T23:00:00Z"), UTC));
        assert!(is_schedule_active(&s, at("2024-01-01T05:00:00Z"), UTC));
        assert!(!is_schedule_active(&s, at("2024-01-01T12:00:00Z"), UTC));
    }

    #[test]
    fn overnight_window_ends_at_midnight_when_next_day_unlisted() {
        let monday_only = schedule("22:00", "06:30", &[1]);
        assert!(!is_schedule_active(&monday_only, at("2024-01-02T05:00:00Z"), UTC));

        let monday_and_tuesday = schedule("22:00", "06:30", &[1, 2]);
        assert!(is_schedule_active(&monday_and_tuesday, at("2024-01-02T05:00:00Z"), UTC));
    }

    #[test]
    fn disabled_schedule_is_never_active() {
        let mut s = schedule("00:00", "23:59", &[0, 1, 2, 3, 4, 5, 6]);
        s.is_active = false;
        assert!(!is_schedule_active(&s, at("2024-01-01T12:00:00Z"), UTC));
    }

    #[test]
    fn empty_day_set_is_never_active() {
        let mut s = schedule("00:00", "23:59", &[]);
        s.days_of_week = DaysOfWeek::from_stored("not json");
        assert!(!is_schedule_active(&s, at("2024-01-01T12:00:00Z"), UTC));
    }

    #[test]
    fn equal_bounds_are_inactive() {
        let s = schedule("09:00", "09:00", &[1]);
        assert!(!is_schedule_active(&s, at("2024-01-01T09:00:00Z"), UTC));
    }

    #[test]
    fn evaluation_uses_the_requested_zone() {
        // 17:00 UTC Monday is 22:30 Monday in Kolkata
        let s = schedule("22:00", "23:00", &[1]);
        let now = at("2024-01-01T17:00:00Z");
        assert!(!is_schedule_active(&s, now, UTC));
        assert!(is_schedule_active(&s, now, chrono_tz::Asia::Kolkata));
    }

    #[test]
    fn should_lock_requires_any_active_schedule() {
        let now = at("2024-01-01T23:00:00Z");
        assert!(!should_lock(&[], now, UTC));

        let homework = schedule("16:00", "18:00", &[1]);
        let bedtime = schedule("22:00", "06:30", &[1]);
        assert!(!should_lock(std::slice::from_ref(&homework), now, UTC));
        assert!(should_lock(&[homework.clone(), bedtime.clone()], now, UTC));

        let schedules = [homework, bedtime];
        let active: Vec<_> = active_schedules(&schedules, now, UTC).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].start_time.to_string(), "22:00");
    }
}
