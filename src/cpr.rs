//! Danish CPR numbers (`DDMMYY-SSSS`).
//!
//! Only the format is checked: ten digits, optionally split by a dash after
//! the sixth, whose first six digits form a real calendar date in either the
//! 1900s or the 2000s. The modulus-11 checksum was retired in 2007 and is not
//! enforced.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cpr(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CprError {
    #[error("CPR number must be 10 digits, optionally formatted DDMMYY-SSSS")]
    Format,
    #[error("CPR number does not start with a valid birth date")]
    BirthDate,
}

impl Cpr {
    pub fn parse(input: &str) -> Result<Self, CprError> {
        let trimmed = input.trim();
        if !trimmed.is_ascii() {
            return Err(CprError::Format);
        }
        let digits: String = match trimmed.len() {
            10 => trimmed.to_string(),
            11 if trimmed.as_bytes()[6] == b'-' => {
                format!("{}{}", &trimmed[..6], &trimmed[7..])
            }
            _ => return Err(CprError::Format),
        };
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CprError::Format);
        }

        let field = |range: std::ops::Range<usize>| digits[range].parse::<u32>().unwrap_or(0);
        let (day, month, yy) = (field(0..2), field(2..4), field(4..6));
        let valid_in = |century: i32| {
            NaiveDate::from_ymd_opt(century + yy as i32, month, day).is_some()
        };
        if !valid_in(1900) && !valid_in(2000) {
            return Err(CprError::BirthDate);
        }

        Ok(Self(digits))
    }

    /// Canonical `DDMMYY-SSSS` rendering.
    pub fn formatted(&self) -> String {
        format!("{}-{}", &self.0[..6], &self.0[6..])
    }
}

impl fmt::Display for Cpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.formatted())
    }
}

impl FromStr for Cpr {
    type Err = CprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Cpr {
    type Error = CprError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Cpr> for String {
    fn from(value: Cpr) -> Self {
        value.0
    }
}
