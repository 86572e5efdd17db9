use crate::error::AppError;

/// Parse a duration in seconds with an optional unit (ms, s, m, h).
pub fn parse_time(time_str: &str) -> Result<f64, AppError> {
    let time_str = time_str.trim();
    if time_str.is_empty() {
        return Err(AppError::ParseError("Invalid format: empty string".to_string()));
    }

    if let Ok(seconds) = time_str.parse::<f64>() {
        return Ok(seconds);
    }

    let split_index = time_str
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(time_str.len());
    let (numeric_part, unit_part) = time_str.split_at(split_index);

    let value = numeric_part
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid number in '{time_str}'")))?;

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(value / 1000.0),
        "s" => Ok(value),
        "m" => Ok(value * 60.0),
        "h" => Ok(value * 3600.0),
        unit => Err(AppError::ParseError(format!("Invalid unit '{unit}'"))),
    }
}
