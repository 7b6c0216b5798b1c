//! Browser binary discovery and headless process launch.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use siterec_common::error::{SiterecError, SiterecResult};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

/// Well-known install locations, checked after explicit configuration.
const KNOWN_BROWSER_PATHS: &[&str] = &[
    "/usr/bin/chromium-browser",
    "/usr/bin/chromium",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/google-chrome",
    "/opt/google/chrome/chrome",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

/// Names resolved through `PATH` as a last resort.
const PATH_BROWSER_NAMES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome-stable",
    "google-chrome",
    "chrome",
];

const DEVTOOLS_PREFIX: &str = "DevTools listening on ";

static PROFILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Parameters for starting a browser process.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Explicit binary; discovery is used when `None`.
    pub browser_path: Option<PathBuf>,
    pub extra_args: Vec<String>,
    /// How long to wait for the DevTools endpoint to be announced.
    pub timeout: Duration,
}

/// A running browser process and its DevTools endpoint.
pub struct LaunchedBrowser {
    pub child: Child,
    pub ws_url: String,
    pub profile_dir: PathBuf,
}

/// Candidate binaries in priority order: configured path, `CHROME_PATH`,
/// `PUPPETEER_EXECUTABLE_PATH`, known install paths that exist, then bare
/// names for `PATH` lookup.
pub fn browser_candidates(configured: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = configured {
        candidates.push(path.to_path_buf());
    }
    for var in ["CHROME_PATH", "PUPPETEER_EXECUTABLE_PATH"] {
        if let Ok(value) = std::env::var(var) {
            let path = PathBuf::from(value.trim());
            if !value.trim().is_empty() && path.exists() {
                candidates.push(path);
            }
        }
    }
    candidates.extend(
        KNOWN_BROWSER_PATHS
            .iter()
            .map(PathBuf::from)
            .filter(|p| p.exists()),
    );
    candidates.extend(PATH_BROWSER_NAMES.iter().map(PathBuf::from));
    candidates.dedup();
    candidates
}

/// Command-line switches for a headless capture browser.
pub fn launch_args(options: &LaunchOptions, profile_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--headless=new".to_string(),
        format!(
            "--window-size={},{}",
            options.viewport_width, options.viewport_height
        ),
        "--remote-debugging-port=0".to_string(),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-accelerated-2d-canvas".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-ipc-flooding-protection".to_string(),
        "--ignore-certificate-errors".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
    ];
    args.extend(
        options
            .extra_args
            .iter()
            .filter(|a| !a.trim().is_empty())
            .cloned(),
    );
    args.push("about:blank".to_string());
    args
}

/// Extract the WebSocket URL from a browser stderr line.
pub fn parse_devtools_line(line: &str) -> Option<&str> {
    let url = line.trim().strip_prefix(DEVTOOLS_PREFIX)?.trim();
    url.starts_with("ws://").then_some(url)
}

/// Start a headless browser and wait for its DevTools endpoint.
pub async fn launch_browser(options: &LaunchOptions) -> SiterecResult<LaunchedBrowser> {
    let candidates = browser_candidates(options.browser_path.as_deref());
    launch_first(&candidates, options).await
}

/// Try each binary in order; the error names all of them if none comes up.
async fn launch_first(
    candidates: &[PathBuf],
    options: &LaunchOptions,
) -> SiterecResult<LaunchedBrowser> {
    let profile_dir = std::env::temp_dir().join(format!(
        "siterec-profile-{}-{}",
        std::process::id(),
        PROFILE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    tokio::fs::create_dir_all(&profile_dir).await?;
    let args = launch_args(options, &profile_dir);

    let mut failures = Vec::new();
    for candidate in candidates {
        let mut cmd = Command::new(candidate);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                failures.push(format!("{}: {e}", candidate.display()));
                continue;
            }
        };

        let Some(stderr) = child.stderr.take() else {
            let _ = child.kill().await;
            failures.push(format!("{}: stderr unavailable", candidate.display()));
            continue;
        };

        match wait_for_devtools(stderr, options.timeout).await {
            Ok(ws_url) => {
                tracing::info!(
                    browser = %candidate.display(),
                    pid = child.id(),
                    "Browser launched"
                );
                return Ok(LaunchedBrowser {
                    child,
                    ws_url,
                    profile_dir,
                });
            }
            Err(e) => {
                let _ = child.kill().await;
                failures.push(format!("{}: {e}", candidate.display()));
            }
        }
    }

    let _ = tokio::fs::remove_dir_all(&profile_dir).await;
    Err(SiterecError::launch(format!(
        "no usable browser found (tried {})",
        failures.join("; ")
    )))
}

/// Read stderr until the DevTools line appears, then keep draining it in the
/// background so the browser never blocks on a full pipe.
async fn wait_for_devtools(stderr: ChildStderr, timeout: Duration) -> SiterecResult<String> {
    let mut lines = BufReader::new(stderr).lines();

    let found = tokio::time::timeout(timeout, async {
        while let Some(line) = lines.next_line().await? {
            if let Some(url) = parse_devtools_line(&line) {
                return Ok(Some(url.to_string()));
            }
            tracing::trace!(line = %line, "browser stderr");
        }
        Ok::<_, std::io::Error>(None)
    })
    .await
    .map_err(|_| SiterecError::timeout("DevTools endpoint announcement", timeout))??;

    let ws_url = found.ok_or_else(|| {
        SiterecError::launch("browser exited before announcing a DevTools endpoint")
    })?;

    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::trace!(line = %line, "browser stderr");
        }
    });

    Ok(ws_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devtools_line_is_parsed() {
        let line = "DevTools listening on ws://127.0.0.1:40123/devtools/browser/3f2a\n";
        assert_eq!(
            parse_devtools_line(line),
            Some("ws://127.0.0.1:40123/devtools/browser/3f2a")
        );
        assert_eq!(parse_devtools_line("[0101/000000.0:ERROR] something"), None);
        assert_eq!(parse_devtools_line("DevTools listening on nonsense"), None);
    }

    #[test]
    fn launch_args_carry_geometry_and_profile() {
        let options = LaunchOptions {
            viewport_width: 1280,
            viewport_height: 720,
            browser_path: None,
            extra_args: vec!["--lang=en-US".to_string(), "  ".to_string()],
            timeout: Duration::from_secs(5),
        };
        let args = launch_args(&options, Path::new("/tmp/profile"));
        assert!(args.contains(&"--window-size=1280,720".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--remote-debugging-port=0".to_string()));
        assert!(args.contains(&"--lang=en-US".to_string()));
        assert!(!args.iter().any(|a| a.trim().is_empty()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn configured_browser_comes_first() {
        let candidates = browser_candidates(Some(Path::new("/opt/custom/chrome")));
        assert_eq!(candidates[0], PathBuf::from("/opt/custom/chrome"));
        assert!(candidates.contains(&PathBuf::from("chromium")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_fails_when_no_candidate_announces_devtools() {
        let options = LaunchOptions {
            viewport_width: 800,
            viewport_height: 600,
            browser_path: None,
            extra_args: Vec::new(),
            timeout: Duration::from_secs(5),
        };
        let candidates = [
            PathBuf::from("/nonexistent/siterec-browser"),
            PathBuf::from("true"),
        ];

        let err = match launch_first(&candidates, &options).await {
            Ok(_) => panic!("launch should fail"),
            Err(e) => e,
        };
        let message = err.to_string();
        assert!(matches!(err, SiterecError::Launch { .. }), "{message}");
        assert!(message.contains("/nonexistent/siterec-browser"), "{message}");
        assert!(message.contains("true: "), "{message}");
    }
}
