use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use foreman::domain::models::{QuotaWindow, TenantConfig};
use foreman::services::RetryPolicy;
use proptest::prelude::*;

fn every_day() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ]
}

fn instant(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

proptest! {
    /// Property: backoff never shrinks as retries accumulate
    #[test]
    fn prop_backoff_is_monotonic(
        initial in 0u64..120_000,
        max in 0u64..7_200_000,
        retry in 1u32..64,
    ) {
        let policy = RetryPolicy::new(3, initial, max);
        prop_assert!(policy.backoff(retry) <= policy.backoff(retry + 1));
    }

    /// Property: no delay exceeds the cap
    #[test]
    fn prop_backoff_is_capped(
        initial in 0u64..120_000,
        max in 0u64..7_200_000,
        retry in any::<u32>(),
    ) {
        let policy = RetryPolicy::new(3, initial, max);
        let cap = std::time::Duration::from_millis(max.max(initial));
        prop_assert!(policy.backoff(retry) <= cap);
    }

    /// Property: below the cap, each retry waits strictly longer than the last
    #[test]
    fn prop_retry_deadlines_grow_below_cap(
        initial in 1u64..60_000,
        retry in 1u32..10,
    ) {
        let policy = RetryPolicy::new(3, initial, u64::MAX / 4);
        let now = Utc::now();
        prop_assert!(policy.next_retry_at(now, retry + 1) > policy.next_retry_at(now, retry));
        prop_assert!(policy.next_retry_at(now, retry) > now);
    }
}

/// Property: an ordinary window admits exactly the times inside it
#[test_strategy::proptest]
fn prop_working_hours_match_window(
    #[strategy(0u32..86_400)] start_secs: u32,
    #[strategy(0u32..86_400)] end_secs: u32,
    #[strategy(0i64..4_000_000_000)] at: i64,
) {
    prop_assume!(start_secs <= end_secs);
    let mut tenant = TenantConfig::new("acme");
    tenant.working_hours_start = NaiveTime::from_num_seconds_from_midnight_opt(start_secs, 0).unwrap();
    tenant.working_hours_end = NaiveTime::from_num_seconds_from_midnight_opt(end_secs, 0).unwrap();
    tenant.working_days = every_day();

    let now = instant(at);
    let secs = now.time().num_seconds_from_midnight();
    let inside = (start_secs..=end_secs).contains(&secs);
    prop_assert_eq!(tenant.is_within_working_hours(now), inside);
}

/// Property: a tenant with no working days never admits work
#[test_strategy::proptest]
fn prop_no_working_days_means_closed(
    #[strategy(0i64..4_000_000_000)] at: i64,
    #[strategy(prop::sample::select(vec!["UTC", "America/New_York", "Asia/Tokyo", "Australia/Adelaide"]))]
    timezone: &'static str,
) {
    let mut tenant = TenantConfig::new("acme");
    tenant.working_hours_start = NaiveTime::MIN;
    tenant.working_hours_end = NaiveTime::from_hms_opt(23, 59, 59).unwrap();
    tenant.working_days = Vec::new();
    tenant.timezone = timezone.to_string();

    prop_assert!(!tenant.is_within_working_hours(instant(at)));
}

/// Property: quota windows start at or before now, daily inside monthly
#[test_strategy::proptest]
fn prop_quota_windows_contain_now(
    #[strategy(0i64..4_000_000_000)] at: i64,
    #[strategy(prop::sample::select(vec!["UTC", "Europe/Berlin", "Pacific/Auckland", "America/Los_Angeles"]))]
    timezone: &'static str,
) {
    let mut tenant = TenantConfig::new("acme");
    tenant.timezone = timezone.to_string();
    let now = instant(at);

    let daily = tenant.quota_window_start(QuotaWindow::Daily, now);
    let monthly = tenant.quota_window_start(QuotaWindow::Monthly, now);
    prop_assert!(daily <= now);
    prop_assert!(now - daily < Duration::hours(26));
    prop_assert!(monthly <= daily);
}
