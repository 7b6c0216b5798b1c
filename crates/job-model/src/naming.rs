//! Output file naming.

use chrono::{DateTime, SecondsFormat, Utc};
use url::Url;

use crate::job::JobId;

/// Build the file name for a recording of `url` started at `at`.
///
/// The name is the URL host with every non-word character replaced by `_`,
/// followed by a filesystem-safe UTC timestamp and the job id, e.g.
/// `www_example_com_2024-05-01T10-00-00-000Z_3.mp4`.
pub fn output_file_name(url: &Url, at: DateTime<Utc>, job_id: JobId, extension: &str) -> String {
    let host: String = url
        .host_str()
        .filter(|h| !h.is_empty())
        .unwrap_or("local")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{host}_{stamp}_{job_id}.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn host_is_sanitized() {
        let url = Url::parse("https://www.example-site.com:8080/a/b?c=d").unwrap();
        assert_eq!(
            output_file_name(&url, at(), 3, "mp4"),
            "www_example_site_com_2024-05-01T10-00-00-000Z_3.mp4"
        );
    }

    #[test]
    fn file_urls_fall_back_to_local() {
        let url = Url::parse("file:///tmp/page.html").unwrap();
        assert_eq!(
            output_file_name(&url, at(), 12, "webm"),
            "local_2024-05-01T10-00-00-000Z_12.webm"
        );
    }

    #[test]
    fn name_contains_no_path_separators_or_colons() {
        let url = Url::parse("http://[::1]:3000/").unwrap();
        let name = output_file_name(&url, at(), 1, "mp4");
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
    }
}
