//! Cron schedule parsing and next-firing computation.

use {
    chrono::{DateTime, Utc},
    cron::Schedule,
    mememo_common::{Error, Result},
};

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parse a standard 5-field cron expression.
///
/// The `cron` crate wants seconds and year fields as well, so 5-field input
/// is padded to `0 <expr> *`. It also numbers weekdays from Sunday = 1, so
/// the weekday field is rewritten to names first (0 and 7 are Sunday).
/// 6- and 7-field expressions pass through.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let padded = match fields.as_slice() {
        [minute, hour, dom, month, dow] => {
            format!("0 {minute} {hour} {dom} {month} {} *", weekday_field(dow)?)
        },
        _ => expr.to_string(),
    };
    padded
        .parse::<Schedule>()
        .map_err(|e| Error::validation(format!("invalid cron expression '{expr}': {e}")))
}

fn weekday_field(field: &str) -> Result<String> {
    let items = field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (item, None),
            };
            let base = match base.split_once('-') {
                Some((from, to)) => weekday_range(from, to, step.is_some())?,
                None => weekday(base)?,
            };
            Ok(match step {
                Some(step) => format!("{base}/{step}"),
                None => base,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(items.join(","))
}

fn weekday_range(from: &str, to: &str, stepped: bool) -> Result<String> {
    match (from.parse::<usize>(), to.parse::<usize>()) {
        // A range ending on 7 runs through Sunday.
        (Ok(0), Ok(7)) => Ok("SUN-SAT".to_string()),
        (Ok(from), Ok(7)) if from < 7 && !stepped => {
            Ok(format!("{}-SAT,SUN", weekday_name(from)?))
        },
        (Ok(from), Ok(7)) if from < 7 => Err(Error::validation(format!(
            "stepped weekday range cannot end on 7: {from}-7"
        ))),
        _ => Ok(format!("{}-{}", weekday(from)?, weekday(to)?)),
    }
}

fn weekday(token: &str) -> Result<String> {
    match token.parse::<usize>() {
        Ok(n) => weekday_name(n).map(str::to_string),
        // `*`, `?` and names pass through.
        Err(_) => Ok(token.to_string()),
    }
}

fn weekday_name(n: usize) -> Result<&'static str> {
    match n {
        0..=7 => Ok(WEEKDAYS[n % 7]),
        _ => Err(Error::validation(format!("weekday out of range: {n}"))),
    }
}

/// The first firing strictly after `reference`, or `None` for never.
pub fn next_after(schedule: &Schedule, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&reference).next()
}
