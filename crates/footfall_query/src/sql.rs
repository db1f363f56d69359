//! SQL for each read endpoint over `v_traffic_normalized`.
//!
//! Every statement takes the working-day window (and store, when filtered)
//! as bound parameters. Only the bucket unit, strftime formats and the hour
//! shift are spliced into the text, and those come from closed enums and
//! validated settings.

use footfall_db::{quote_literal, DbValue};

use crate::params::{StatsFilter, Window};

pub const NORMALIZED_VIEW: &str = "v_traffic_normalized";

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<DbValue>,
}

/// `WHERE record_time >= ? AND record_time < ? [AND store_name = ?]`
fn filter_clause(filter: &StatsFilter, window: Window) -> (String, Vec<DbValue>) {
    let mut clause = "WHERE record_time >= ? AND record_time < ?".to_string();
    let mut params = vec![
        DbValue::Timestamp(window.start),
        DbValue::Timestamp(window.end),
    ];
    if let Some(store) = &filter.store {
        clause.push_str(" AND store_name = ?");
        params.push(DbValue::Text(store.clone()));
    }
    (clause, params)
}

fn shift(hours: u32) -> String {
    format!("INTERVAL '{} hours'", hours)
}

/// One row: total_in, average_in, peak_time, current_occupancy, busiest_store.
pub fn metrics(filter: &StatsFilter, window: Window, shift_hours: u32) -> Statement {
    let (clause, params) = filter_clause(filter, window);
    let unit = filter.period.bucket().unit();
    let sql = format!(
        "WITH filtered_data AS (SELECT * FROM {view} {clause}), \
         period_summary AS ( \
             SELECT date_trunc('{unit}', adjusted_time) AS period, \
                    SUM(in_count) AS total_in_per_period \
             FROM filtered_data GROUP BY period \
         ) \
         SELECT \
             (SELECT CAST(SUM(in_count) AS BIGINT) FROM filtered_data) AS total_in, \
             (SELECT CAST(AVG(total_in_per_period) AS DOUBLE) FROM period_summary) AS average_in, \
             (SELECT strftime(arg_max(period, total_in_per_period) + {shift}, {fmt}) \
                FROM period_summary) AS peak_time, \
             (SELECT CAST(SUM(in_count) - SUM(out_count) AS BIGINT) FROM filtered_data) AS current_occupancy, \
             (SELECT store_name FROM filtered_data GROUP BY store_name \
                ORDER BY SUM(in_count) DESC, store_name LIMIT 1) AS busiest_store",
        view = NORMALIZED_VIEW,
        clause = clause,
        unit = unit,
        shift = shift(shift_hours),
        fmt = quote_literal(filter.period.peak_format()),
    );
    Statement { sql, params }
}

/// Total inbound visitors in the window; NULL when it is empty.
pub fn total_in(filter: &StatsFilter, window: Window) -> Statement {
    let (clause, params) = filter_clause(filter, window);
    Statement {
        sql: format!(
            "SELECT CAST(SUM(in_count) AS BIGINT) AS total_in FROM {} {}",
            NORMALIZED_VIEW, clause
        ),
        params,
    }
}

/// Rows (x, y): bucket label and inbound total, in time order.
pub fn trend(filter: &StatsFilter, window: Window, shift_hours: u32) -> Statement {
    let (clause, params) = filter_clause(filter, window);
    let bucket = filter.period.bucket();
    let sql = format!(
        "SELECT strftime(bucket + {shift}, {fmt}) AS x, y FROM ( \
             SELECT date_trunc('{unit}', adjusted_time) AS bucket, \
                    CAST(SUM(in_count) AS BIGINT) AS y \
             FROM {view} {clause} GROUP BY bucket \
         ) ORDER BY bucket",
        shift = shift(shift_hours),
        fmt = quote_literal(bucket.label_format()),
        unit = bucket.unit(),
        view = NORMALIZED_VIEW,
        clause = clause,
    );
    Statement { sql, params }
}

/// Rows (x, y): store name and inbound total, largest first, positive only.
pub fn store_distribution(filter: &StatsFilter, window: Window) -> Statement {
    let (clause, params) = filter_clause(filter, window);
    let sql = format!(
        "SELECT store_name AS x, CAST(SUM(in_count) AS BIGINT) AS y \
         FROM {view} {clause} \
         GROUP BY store_name HAVING SUM(in_count) > 0 \
         ORDER BY y DESC, x",
        view = NORMALIZED_VIEW,
        clause = clause,
    );
    Statement { sql, params }
}

/// Rows (period, total_in, pct_change) for every bucket, newest first.
pub fn details(filter: &StatsFilter, window: Window, shift_hours: u32) -> Statement {
    let (clause, params) = filter_clause(filter, window);
    let bucket = filter.period.bucket();
    let sql = format!(
        "WITH filtered_data AS (SELECT * FROM {view} {clause}), \
         aggregated AS ( \
             SELECT date_trunc('{unit}', adjusted_time) AS period_start, \
                    SUM(in_count) AS total_in \
             FROM filtered_data GROUP BY period_start \
         ), \
         with_previous AS ( \
             SELECT period_start, total_in, \
                    LAG(total_in, 1, 0) OVER (ORDER BY period_start) AS previous_in \
             FROM aggregated \
         ) \
         SELECT strftime(period_start + {shift}, {fmt}) AS period, \
                CAST(total_in AS BIGINT) AS total_in, \
                CAST(CASE WHEN previous_in = 0 THEN 0.0 \
                     ELSE ROUND((total_in - previous_in) * 100.0 / previous_in, 1) END AS DOUBLE) \
                    AS pct_change \
         FROM with_previous ORDER BY period_start DESC",
        view = NORMALIZED_VIEW,
        clause = clause,
        unit = bucket.unit(),
        shift = shift(shift_hours),
        fmt = quote_literal(bucket.label_format()),
    );
    Statement { sql, params }
}

pub fn stores() -> Statement {
    Statement {
        sql: "SELECT CAST(store_id AS BIGINT) AS store_id, store_name \
              FROM dim_stores ORDER BY store_name"
            .to_string(),
        params: Vec::new(),
    }
}

pub fn error_logs(limit: u32) -> Statement {
    Statement {
        sql: "SELECT CAST(a.log_id AS BIGINT) AS id, b.store_name, \
                     strftime(a.logged_at, '%Y-%m-%d %H:%M:%S') AS log_time, \
                     CAST(a.error_code AS BIGINT) AS error_code, a.error_message \
              FROM fact_errors a LEFT JOIN dim_stores b ON a.store_id = b.store_id \
              ORDER BY a.logged_at DESC LIMIT ?"
            .to_string(),
        params: vec![DbValue::Integer(i64::from(limit))],
    }
}

pub fn latest_record_time() -> Statement {
    Statement {
        sql: "SELECT strftime(MAX(recorded_at), '%Y-%m-%dT%H:%M:%S') AS latest_record_time \
              FROM fact_traffic"
            .to_string(),
        params: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Period, StatsParams, WorkingHours};

    fn filter(period: &str, store: &str) -> StatsFilter {
        StatsFilter::from_params(&StatsParams {
            period: Some(period.into()),
            start_date: Some("2024-01-10".into()),
            end_date: Some("2024-01-10".into()),
            store: Some(store.into()),
            ..StatsParams::default()
        })
        .unwrap()
    }

    fn window(filter: &StatsFilter) -> Window {
        filter.window(WorkingHours { start: 9, end: 2 })
    }

    #[test]
    fn store_filter_adds_a_bound_parameter() {
        let all = filter("day", "all");
        let stmt = store_distribution(&all, window(&all));
        assert_eq!(stmt.params.len(), 2);
        assert!(!stmt.sql.contains("store_name = ?"));

        let one = filter("day", "Store A");
        let stmt = store_distribution(&one, window(&one));
        assert_eq!(stmt.params.len(), 3);
        assert_eq!(stmt.params[2], DbValue::Text("Store A".into()));
        assert!(stmt.sql.contains("AND store_name = ?"));
    }

    #[test]
    fn store_names_are_never_spliced() {
        let f = filter("day", "x'; DROP TABLE dim_stores; --");
        for stmt in [
            metrics(&f, window(&f), 9),
            trend(&f, window(&f), 9),
            details(&f, window(&f), 9),
            total_in(&f, window(&f)),
        ] {
            assert!(!stmt.sql.contains("DROP TABLE"));
        }
    }

    #[test]
    fn bucket_and_shift_follow_the_period() {
        let f = filter("year", "all");
        assert_eq!(f.period, Period::Year);
        let stmt = trend(&f, window(&f), 9);
        assert!(stmt.sql.contains("date_trunc('month', adjusted_time)"));
        assert!(stmt.sql.contains("INTERVAL '9 hours'"));
        assert!(stmt.sql.contains("'%Y-%m'"));

        let stmt = metrics(&f, window(&f), 9);
        assert!(stmt.sql.contains("'Tháng %m'"));
    }
}
