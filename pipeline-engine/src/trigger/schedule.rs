// Schedule Validation
// Five-field cron expressions, validated at load time and handed to an external scheduler

use std::collections::BTreeSet;

use crate::error::DefinitionError;

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const FIELDS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59, names: &[] },
    FieldSpec { name: "hour", min: 0, max: 23, names: &[] },
    FieldSpec { name: "day of month", min: 1, max: 31, names: &[] },
    FieldSpec { name: "month", min: 1, max: 12, names: &MONTHS },
    FieldSpec { name: "day of week", min: 0, max: 6, names: &WEEKDAYS },
];

/// A validated cron schedule with each field expanded to its value set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    pub expression: String,
    pub minutes: BTreeSet<u32>,
    pub hours: BTreeSet<u32>,
    pub days_of_month: BTreeSet<u32>,
    pub months: BTreeSet<u32>,
    pub days_of_week: BTreeSet<u32>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, DefinitionError> {
        let invalid = |message: String| DefinitionError::InvalidSchedule {
            cron: expression.to_string(),
            message,
        };

        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", parts.len())));
        }

        let mut sets = Vec::with_capacity(5);
        for (part, spec) in parts.iter().zip(FIELDS.iter()) {
            sets.push(parse_field(part, spec).map_err(invalid)?);
        }

        let mut sets = sets.into_iter();
        let mut next = || sets.next().unwrap_or_default();
        Ok(Self {
            expression: expression.to_string(),
            minutes: next(),
            hours: next(),
            days_of_month: next(),
            months: next(),
            days_of_week: next(),
        })
    }
}

fn parse_field(field: &str, spec: &FieldSpec) -> Result<BTreeSet<u32>, String> {
    let mut values = BTreeSet::new();

    for item in field.split(',') {
        if item.is_empty() {
            return Err(format!("empty list item in {} field", spec.name));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(a, spec)?, value(b, spec)?)
        } else {
            let v = value(range, spec)?;
            // `N/S` runs from N to the end of the field
            if item.contains('/') {
                (v, spec.max)
            } else {
                (v, v)
            }
        };

        if start > end {
            return Err(format!(
                "range {}-{} is reversed in {} field",
                start, end, spec.name
            ));
        }

        values.extend((start..=end).step_by(step as usize));
    }

    Ok(values)
}

fn value(text: &str, spec: &FieldSpec) -> Result<u32, String> {
    let parsed = match text.parse::<u32>() {
        Ok(n) => n,
        Err(_) => {
            let position = spec
                .names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(text))
                .ok_or_else(|| format!("invalid value '{}' in {} field", text, spec.name))?;
            position as u32 + spec.min
        }
    };

    if parsed < spec.min || parsed > spec.max {
        return Err(format!(
            "{} is out of range {}-{} for {} field",
            parsed, spec.min, spec.max, spec.name
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_common_schedules() {
        let nightly = CronSchedule::parse("30 2 * * *").unwrap();
        assert_eq!(nightly.minutes, BTreeSet::from([30]));
        assert_eq!(nightly.hours, BTreeSet::from([2]));
        assert_eq!(nightly.days_of_month.len(), 31);

        let weekdays = CronSchedule::parse("*/15 9-17 * * MON-FRI").unwrap();
        assert_eq!(weekdays.minutes, BTreeSet::from([0, 15, 30, 45]));
        assert_eq!(weekdays.days_of_week, BTreeSet::from([1, 2, 3, 4, 5]));

        let quarterly = CronSchedule::parse("0 0 1 jan,apr,jul,oct *").unwrap();
        assert_eq!(quarterly.months, BTreeSet::from([1, 4, 7, 10]));
    }

    #[test]
    fn test_reject_invalid_schedules() {
        for cron in ["* * * *", "60 * * * *", "* * * * 8", "*/0 * * * *", "5-1 * * * *", "a * * * *"] {
            let err = CronSchedule::parse(cron).unwrap_err();
            assert!(
                matches!(err, DefinitionError::InvalidSchedule { cron: ref c, .. } if c == cron),
                "expected invalid schedule for {cron}"
            );
        }
    }
}
