#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    #[error("timestamp must be HH:MM:SS, got {0:?}")]
    Format(String),
    #[error("invalid timestamp component {0:?}")]
    Component(String),
}

/// Converts an `HH:MM:SS[.frac]` offset into total seconds.
///
/// With `ceil_minutes` set the seconds field is rounded up to the next
/// whole minute boundary before summation, so `00:01:30` becomes 120.
pub fn timestamp_to_seconds(timestamp: &str, ceil_minutes: bool) -> Result<f64, TimestampError> {
    let parts: Vec<&str> = timestamp.split(':').collect();
    if parts.len() != 3 {
        return Err(TimestampError::Format(timestamp.to_string()));
    }

    let hours: u32 = parts[0]
        .parse()
        .map_err(|_| TimestampError::Component(parts[0].to_string()))?;
    let minutes: u32 = parts[1]
        .parse()
        .map_err(|_| TimestampError::Component(parts[1].to_string()))?;
    let mut seconds: f64 = parts[2]
        .parse()
        .map_err(|_| TimestampError::Component(parts[2].to_string()))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(TimestampError::Component(parts[2].to_string()));
    }

    if ceil_minutes {
        seconds = (seconds / 60.0).ceil() * 60.0;
    }

    Ok(f64::from(hours) * 3600.0 + f64::from(minutes) * 60.0 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_components_sum_to_seconds() {
        assert_eq!(timestamp_to_seconds("01:02:03", false).unwrap(), 3723.0);
        assert_eq!(timestamp_to_seconds("00:00:00", false).unwrap(), 0.0);
    }

    #[test]
    fn fractional_seconds_are_kept() {
        assert_eq!(timestamp_to_seconds("00:01:30.5", false).unwrap(), 90.5);
    }

    #[test]
    fn ceil_minutes_rounds_seconds_to_minute_boundary() {
        assert_eq!(timestamp_to_seconds("00:01:30", true).unwrap(), 120.0);
        // A field already on the boundary stays put.
        assert_eq!(timestamp_to_seconds("00:02:00", true).unwrap(), 120.0);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(matches!(
            timestamp_to_seconds("90", false),
            Err(TimestampError::Format(_))
        ));
        assert!(matches!(
            timestamp_to_seconds("00:xx:00", false),
            Err(TimestampError::Component(_))
        ));
        assert!(matches!(
            timestamp_to_seconds("00:00:-5", false),
            Err(TimestampError::Component(_))
        ));
    }
}
