//! Request parameters and the date arithmetic behind every stats endpoint.

use chrono::{Days, Months, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{ApiError, ApiResult};

pub const DEFAULT_PAGE_SIZE: u32 = 31;
pub const MAX_PAGE_SIZE: u32 = 500;
pub const DEFAULT_ERROR_LOG_LIMIT: u32 = 100;
pub const MAX_ERROR_LOG_LIMIT: u32 = 1000;
const DATE_FORMAT: &str = "%Y-%m-%d";
const ALL_STORES: &str = "all";

/// Reporting period selected on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Period {
    #[default]
    Day,
    Week,
    Month,
    Year,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// `date_trunc` unit used to bucket rows.
    pub fn bucket(&self) -> Bucket {
        match self {
            Self::Day => Bucket::Hour,
            Self::Week | Self::Month => Bucket::Day,
            Self::Year => Bucket::Month,
        }
    }

    /// strftime format of the busiest bucket in the metrics card.
    pub fn peak_format(&self) -> &'static str {
        match self {
            Self::Day => "%H:%M",
            Self::Week | Self::Month => "%d/%m",
            Self::Year => "Tháng %m",
        }
    }

    /// The equivalent range one period earlier.
    pub fn previous_range(&self, start: NaiveDate, end: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
        match self {
            Self::Day => Some((
                start.checked_sub_days(Days::new(1))?,
                end.checked_sub_days(Days::new(1))?,
            )),
            Self::Week => Some((
                start.checked_sub_days(Days::new(7))?,
                end.checked_sub_days(Days::new(7))?,
            )),
            Self::Month => Some((
                start.checked_sub_months(Months::new(1))?,
                start.checked_sub_days(Days::new(1))?,
            )),
            Self::Year => Some((
                start.checked_sub_months(Months::new(12))?,
                end.checked_sub_months(Months::new(12))?,
            )),
        }
    }
}

impl FromStr for Period {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(ApiError::invalid(format!(
                "invalid period '{}': expected day, week, month or year",
                other
            ))),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Hour,
    Day,
    Month,
}

impl Bucket {
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// strftime format of trend x-labels.
    pub fn label_format(&self) -> &'static str {
        match self {
            Self::Hour => "%Y-%m-%d %H:00",
            Self::Day => "%Y-%m-%d",
            Self::Month => "%Y-%m",
        }
    }
}

/// Opening hours that define a business day.
///
/// A business day starts at `start` on its calendar date and ends at `end`
/// on the following date, so late-night traffic counts towards the day it
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingHours {
    pub start: u32,
    pub end: u32,
}

/// Half-open `[start, end)` time range bound into the SQL filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Raw query string of the stats endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsParams {
    pub period: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub store: Option<String>,
    pub page: Option<String>,
    pub page_size: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorLogParams {
    pub limit: Option<String>,
}

/// Validated date range and store filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsFilter {
    pub period: Period,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// `None` selects every store.
    pub store: Option<String>,
}

impl StatsFilter {
    pub fn from_params(params: &StatsParams) -> ApiResult<Self> {
        let period = match non_blank(&params.period) {
            Some(raw) => raw.parse()?,
            None => Period::default(),
        };
        let start_date = parse_date("start_date", &params.start_date)?;
        let end_date = parse_date("end_date", &params.end_date)?;
        if end_date < start_date {
            return Err(ApiError::invalid(format!(
                "end_date {} is before start_date {}",
                end_date, start_date
            )));
        }
        let store = non_blank(&params.store)
            .filter(|s| !s.eq_ignore_ascii_case(ALL_STORES))
            .map(str::to_string);
        Ok(Self {
            period,
            start_date,
            end_date,
            store,
        })
    }

    /// `[start_date + start hours, end_date + 1 day + end hours)`.
    pub fn window(&self, hours: WorkingHours) -> Window {
        let at_hour = |date: NaiveDate, hour: u32| {
            date.and_time(NaiveTime::default()) + chrono::Duration::hours(i64::from(hour))
        };
        let day_after_end = self.end_date.succ_opt().unwrap_or(self.end_date);
        Window {
            start: at_hour(self.start_date, hours.start),
            end: at_hour(day_after_end, hours.end),
        }
    }

    /// Same store and period, shifted one period back.
    pub fn previous(&self) -> ApiResult<Self> {
        let (start_date, end_date) = self
            .period
            .previous_range(self.start_date, self.end_date)
            .ok_or_else(|| ApiError::invalid("date range is out of bounds"))?;
        Ok(Self {
            start_date,
            end_date,
            ..self.clone()
        })
    }

    /// Canonical parts for cache keys.
    pub fn key_parts(&self) -> [String; 4] {
        [
            self.period.to_string(),
            self.start_date.format(DATE_FORMAT).to_string(),
            self.end_date.format(DATE_FORMAT).to_string(),
            self.store.clone().unwrap_or_else(|| ALL_STORES.to_string()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub fn from_params(params: &StatsParams) -> ApiResult<Self> {
        let page = parse_bounded("page", &params.page, 1, 1, u32::MAX)?;
        let page_size = parse_bounded(
            "page_size",
            &params.page_size,
            DEFAULT_PAGE_SIZE,
            1,
            MAX_PAGE_SIZE,
        )?;
        Ok(Self { page, page_size })
    }

    /// Row offset of the first item on this page.
    pub fn offset(&self) -> usize {
        (self.page as usize - 1).saturating_mul(self.page_size as usize)
    }
}

pub fn error_log_limit(params: &ErrorLogParams) -> ApiResult<u32> {
    parse_bounded(
        "limit",
        &params.limit,
        DEFAULT_ERROR_LOG_LIMIT,
        1,
        MAX_ERROR_LOG_LIMIT,
    )
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_date(name: &str, value: &Option<String>) -> ApiResult<NaiveDate> {
    let raw = non_blank(value).ok_or_else(|| ApiError::invalid(format!("{} is required", name)))?;
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|_| {
        ApiError::invalid(format!("invalid {} '{}': expected YYYY-MM-DD", name, raw))
    })
}

fn parse_bounded(
    name: &str,
    value: &Option<String>,
    default: u32,
    min: u32,
    max: u32,
) -> ApiResult<u32> {
    let Some(raw) = non_blank(value) else {
        return Ok(default);
    };
    match raw.parse::<u32>() {
        Ok(n) if (min..=max).contains(&n) => Ok(n),
        _ => Err(ApiError::invalid(format!(
            "invalid {} '{}': expected an integer in {}..={}",
            name, raw, min, max
        ))),
    }
}
