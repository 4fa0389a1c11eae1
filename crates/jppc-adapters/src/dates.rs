//! Era-aware date parsing for vendor pages.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::text::normalize_text;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateParseError {
    #[error("no recognizable date in `{0}`")]
    NotFound(String),
    #[error("invalid calendar date {year}-{month}-{day}")]
    InvalidDate { year: i32, month: u32, day: u32 },
}

static WESTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4})\s*年\s*(\d{1,2})\s*月\s*(\d{1,2})\s*日").expect("valid regex")
});
static ERA_KANJI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(令和|平成|昭和)\s*(元|\d{1,2})\s*年\s*(\d{1,2})\s*月\s*(\d{1,2})\s*日")
        .expect("valid regex")
});
static ERA_LETTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^A-Za-z])([RHS])\s*(\d{1,2})\s*[./]\s*(\d{1,2})\s*[./]\s*(\d{1,2})")
        .expect("valid regex")
});
static NUMERIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\D)(\d{4})\s*[-/.]\s*(\d{1,2})\s*[-/.]\s*(\d{1,2})").expect("valid regex")
});

/// Gregorian year preceding year 1 of each era.
fn era_base_year(era: &str) -> Option<i32> {
    match era {
        "令和" | "R" => Some(2018),
        "平成" | "H" => Some(1988),
        "昭和" | "S" => Some(1925),
        _ => None,
    }
}

fn ymd(year: i32, month: u32, day: u32) -> Result<NaiveDate, DateParseError> {
    NaiveDate::from_ymd_opt(year, month, day)
        .ok_or(DateParseError::InvalidDate { year, month, day })
}

fn num<T: std::str::FromStr>(text: &str) -> Option<T> {
    text.parse().ok()
}

/// Finds the first date in `text` written in any form vendors use:
/// `2024年4月1日`, `令和6年4月1日`, `令和元年5月1日`, `R6.4.1`, `2024/4/1`, `2024-04-01`.
pub fn parse_vendor_date(text: &str) -> Result<NaiveDate, DateParseError> {
    let normalized = normalize_text(text);

    if let Some(cap) = WESTERN.captures(&normalized) {
        if let (Some(y), Some(m), Some(d)) = (num(&cap[1]), num(&cap[2]), num(&cap[3])) {
            return ymd(y, m, d);
        }
    }

    if let Some(cap) = ERA_KANJI.captures(&normalized) {
        let era_year = if &cap[2] == "元" { Some(1) } else { num::<i32>(&cap[2]) };
        if let (Some(base), Some(ey), Some(m), Some(d)) =
            (era_base_year(&cap[1]), era_year, num(&cap[3]), num(&cap[4]))
        {
            return ymd(base + ey, m, d);
        }
    }

    if let Some(cap) = ERA_LETTER.captures(&normalized) {
        if let (Some(base), Some(ey), Some(m), Some(d)) = (
            era_base_year(&cap[1]),
            num::<i32>(&cap[2]),
            num(&cap[3]),
            num(&cap[4]),
        ) {
            return ymd(base + ey, m, d);
        }
    }

    if let Some(cap) = NUMERIC.captures(&normalized) {
        if let (Some(y), Some(m), Some(d)) = (num(&cap[1]), num(&cap[2]), num(&cap[3])) {
            return ymd(y, m, d);
        }
    }

    Err(DateParseError::NotFound(text.chars().take(80).collect()))
}
