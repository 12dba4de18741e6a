//! Date-range parsing and calendar-month sharding
//!
//! A single search query over a multi-year window blows past the forge's
//! page-count and total-result limits, so the requested range is split into
//! calendar-month shards and one search task is seeded per shard. Month
//! granularity works well in practice; the extreme fallback would be per-day
//! shards.

use chrono::{Datelike, NaiveDate};
use regex::Regex;

use crate::error::{Error, Result};

/// Inclusive month range, as `(first_year, first_month, last_year, last_month)`
pub type MonthRange = (i32, u32, i32, u32);

/// Parse a month-range expression
///
/// Two syntaxes are supported:
/// - `YYYY-MM..YYYY-MM` — explicit month range (order-insensitive, `..` may
///   also be written as `-` or whitespace)
/// - `- <N>y <M>m` — "since N years and M months before `reference`", with
///   unit abbreviations `y`/`yr`/`year` and `m`/`mo`/`mth`/`mn`/`month`
///   (plural forms accepted)
pub fn parse_date_range(input: &str, reference: NaiveDate) -> Result<MonthRange> {
    let input = input.trim();

    if let Some(rest) = input.strip_prefix('-') {
        return parse_relative(rest.trim(), reference);
    }

    let re = Regex::new(r"^(\d{4})\s*-?\s*(\d{2})\s*(?:\.\.|-|\s*)\s*(\d{4})\s*-?\s*(\d{2})$")
        .map_err(|e| Error::Other(e.to_string()))?;
    let caps = re
        .captures(input)
        .ok_or_else(|| Error::InvalidDateRange(format!("unrecognized range format: {input}")))?;

    let nums: Vec<i64> = (1..=4)
        .map(|i| caps[i].parse::<i64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::InvalidDateRange(e.to_string()))?;
    let (y0, m0, y1, m1) = (nums[0] as i32, nums[1] as u32, nums[2] as i32, nums[3] as u32);

    if !(1..=12).contains(&m0) || !(1..=12).contains(&m1) {
        return Err(Error::InvalidDateRange(format!(
            "month out of range in: {input}"
        )));
    }

    // normalize so the first month is the earlier one
    if (y0, m0) > (y1, m1) {
        Ok((y1, m1, y0, m0))
    } else {
        Ok((y0, m0, y1, m1))
    }
}

fn parse_relative(input: &str, reference: NaiveDate) -> Result<MonthRange> {
    let re_year =
        Regex::new(r"(\d+)\s*(?:yr|year|y)s?").map_err(|e| Error::Other(e.to_string()))?;
    let re_month =
        Regex::new(r"(\d+)\s*(?:mo|month|mth|mn|m)s?").map_err(|e| Error::Other(e.to_string()))?;

    let years: i32 = re_year
        .captures(input)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);
    let months: i32 = re_month
        .captures(input)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0);

    let total_months = years * 12 + months;
    if total_months == 0 {
        return Err(Error::InvalidDateRange(format!(
            "relative range names no period: - {input}"
        )));
    }

    let to_year = reference.year();
    let to_month = reference.month() as i32;

    let since_year = to_year - total_months / 12;
    let since_month = to_month - total_months % 12;

    if since_month <= 0 {
        Ok((
            since_year - 1,
            (since_month + 12) as u32,
            to_year,
            to_month as u32,
        ))
    } else {
        Ok((since_year, since_month as u32, to_year, to_month as u32))
    }
}

/// Generate one query window per calendar month
///
/// Each window spans the first day of a month to the first day of the next
/// (`YYYY-MM-01..YYYY-MM-01`), which is the `author-date:` range syntax the
/// forge search API accepts.
pub fn month_shards(range: MonthRange) -> Vec<String> {
    let (first_year, first_month, last_year, last_month) = range;
    let mut shards = Vec::new();
    let mut year = first_year;
    let mut month = first_month;

    loop {
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        shards.push(format!(
            "{year:04}-{month:02}-01..{next_year:04}-{next_month:02}-01"
        ));
        year = next_year;
        month = next_month;
        if (year, month) >= (last_year, last_month) {
            break;
        }
    }

    shards
}
