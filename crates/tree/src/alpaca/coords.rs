//! Angle parsing for coordinate parameters.
//!
//! Clients may send coordinates either as decimal degrees (numbers) or as
//! sexagesimal strings. By convention a right-ascension string is an hour
//! angle (`"12:30:00"` = 187.5 deg) while declination, altitude and azimuth
//! strings are degrees.

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AngleParseError {
    #[error("can not parse angle from {0:?}")]
    Malformed(String),
}

/// Parse a sexagesimal string (`"-12:30:45.5"`, `"12 30 45"`, or a plain
/// decimal) into its decimal value in the same unit.
pub fn parse_sexagesimal(raw: &str) -> Result<f64, AngleParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AngleParseError::Malformed(raw.to_owned()));
    }
    let (sign, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let parts: Vec<&str> = body
        .split(|c: char| c == ':' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(AngleParseError::Malformed(raw.to_owned()));
    }
    let mut total = 0.0;
    let mut scale = 1.0;
    for part in &parts {
        let piece: f64 = part
            .parse()
            .map_err(|_| AngleParseError::Malformed(raw.to_owned()))?;
        if piece < 0.0 {
            return Err(AngleParseError::Malformed(raw.to_owned()));
        }
        total += piece / scale;
        scale *= 60.0;
    }
    Ok(sign * total)
}

/// Degrees from a declination / altitude / azimuth string.
pub fn angle_string_to_deg(raw: &str) -> Result<f64, AngleParseError> {
    parse_sexagesimal(raw)
}

/// Degrees from a right-ascension string (hour angle).
pub fn hourangle_string_to_deg(raw: &str) -> Result<f64, AngleParseError> {
    Ok(parse_sexagesimal(raw)? * 15.0)
}

pub fn hourangle_to_deg(hours: f64) -> f64 {
    hours / 24.0 * 360.0
}

pub fn deg_to_hourangle(deg: f64) -> f64 {
    deg / 360.0 * 24.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signed_sexagesimal() {
        assert_eq!(parse_sexagesimal("12:30:00").unwrap(), 12.5);
        assert_eq!(parse_sexagesimal("-0:30").unwrap(), -0.5);
        assert_eq!(parse_sexagesimal("+45").unwrap(), 45.0);
        assert_eq!(parse_sexagesimal("10 15 00").unwrap(), 10.25);
        assert!((parse_sexagesimal("-12:30:45.5").unwrap() - (-12.512_638_888)).abs() < 1e-6);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_sexagesimal("").is_err());
        assert!(parse_sexagesimal("12:xx:00").is_err());
        assert!(parse_sexagesimal("1:2:3:4").is_err());
        // A minus sign inside the body would silently flip a component.
        assert!(parse_sexagesimal("12:-30:00").is_err());
    }

    #[test]
    fn right_ascension_strings_are_hour_angles() {
        assert_eq!(hourangle_string_to_deg("12:30:00").unwrap(), 187.5);
        assert_eq!(angle_string_to_deg("12:30:00").unwrap(), 12.5);
    }

    #[test]
    fn hourangle_degree_conversions_are_inverse() {
        assert_eq!(hourangle_to_deg(12.5), 187.5);
        assert_eq!(deg_to_hourangle(187.5), 12.5);
    }
}
