//! Lenient numeric cells.
//!
//! Roster files are often exported from spreadsheets, where an empty cell
//! shows up as `""` and numbers sometimes arrive quoted.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Cell {
    Number(i64),
    Text(String),
}

/// Deserialize an optional integer, treating a blank string as unset.
pub(crate) fn blank_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    let raw = match Option::<Cell>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Cell::Number(n)) => n,
        Some(Cell::Text(text)) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<i64>()
                .map_err(|_| D::Error::custom(format!("expected a number, got '{text}'")))?
        }
    };

    T::try_from(raw)
        .map(Some)
        .map_err(|_| D::Error::custom(format!("value {raw} is out of range")))
}
