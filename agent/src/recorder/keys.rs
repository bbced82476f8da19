use chrono::{DateTime, TimeZone, Utc};

fn fmt_ts(ms: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now);
    dt.format("%Y%m%dT%H%M%S%3fZ").to_string()
}

/// File name a finished clip is uploaded under.
/// e.g. "20260218T093000000Z_20260218T093012500Z.webm"
pub fn clip_file_name(start_ms: i64, end_ms: i64, extension: &str) -> String {
    format!(
        "{start}_{end}.{extension}",
        start = fmt_ts(start_ms),
        end = fmt_ts(end_ms),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_name_format() {
        // 2025-02-18T09:30:00.000Z
        let start = 1739871000000i64;
        let end = start + 12_500;

        let name = clip_file_name(start, end, "webm");
        assert_eq!(name, "20250218T093000000Z_20250218T093012500Z.webm");
    }

    #[test]
    fn mp4_extension_kept() {
        assert!(clip_file_name(0, 1, "mp4").ends_with(".mp4"));
    }
}
