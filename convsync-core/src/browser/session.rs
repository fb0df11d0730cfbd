use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::handler::Handler;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::console::spawn_console_relay;
use super::error::{BrowserError, BrowserResult};
use super::page::{bounded, HarvestPage, RunSession, SessionLauncher};
use super::profile::{BrowserProfile, ProfileManager};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserEngine {
    Chromium,
    Firefox,
}

impl fmt::Display for BrowserEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrowserEngine::Chromium => write!(f, "chromium"),
            BrowserEngine::Firefox => write!(f, "firefox"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewportSpec {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
}

impl Default for ViewportSpec {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
        }
    }
}

/// Host-side browser settings. Viewport and user agent are fixed so runs are
/// reproducible.
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub engine: BrowserEngine,
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub profiles_dir: PathBuf,
    pub viewport: ViewportSpec,
    pub user_agent: String,
    pub launch_timeout: Duration,
}

impl BrowserSettings {
    pub fn new(engine: BrowserEngine, headless: bool, profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            headless,
            executable: None,
            profiles_dir: profiles_dir.into(),
            viewport: ViewportSpec::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            launch_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_executable(mut self, executable: Option<PathBuf>) -> Self {
        self.executable = executable;
        self
    }

    fn executable_for_engine(&self) -> Option<PathBuf> {
        if let Some(path) = &self.executable {
            return Some(path.clone());
        }
        let var = match self.engine {
            BrowserEngine::Chromium => "CONVSYNC_CHROME",
            BrowserEngine::Firefox => "CONVSYNC_FIREFOX",
        };
        std::env::var_os(var)
            .map(PathBuf::from)
            .or_else(|| match self.engine {
                BrowserEngine::Chromium => None,
                BrowserEngine::Firefox => Some(PathBuf::from("firefox")),
            })
    }
}

#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    settings: BrowserSettings,
    profiles: ProfileManager,
}

impl BrowserLauncher {
    pub fn new(settings: BrowserSettings) -> BrowserResult<Self> {
        let profiles = ProfileManager::with_default_ttl(&settings.profiles_dir)?;
        Ok(Self { settings, profiles })
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }

    pub async fn launch(&self) -> BrowserResult<BrowserSession> {
        if let Err(err) = self.profiles.cleanup_expired() {
            warn!(error = %err, "failed to sweep expired profiles");
        }
        let profile = self.profiles.allocate()?;
        info!(
            engine = %self.settings.engine,
            profile = %profile.id(),
            headless = self.settings.headless,
            width = self.settings.viewport.width,
            height = self.settings.viewport.height,
            "launching browser"
        );

        let launched = match self.settings.engine {
            BrowserEngine::Chromium => self.launch_chromium(&profile).await,
            BrowserEngine::Firefox => self.launch_firefox(&profile).await,
        };
        let (browser, handler, child) = match launched {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(cleanup) = profile.discard().await {
                    warn!(error = %cleanup, "failed to remove profile after launch failure");
                }
                return Err(err);
            }
        };

        let handler_task = spawn_handler(handler);
        match open_page(&browser, &profile, &self.settings).await {
            Ok((page, console_task)) => Ok(BrowserSession {
                browser,
                handler_task: Some(handler_task),
                console_task: Some(console_task),
                child,
                profile: Some(profile),
                page,
            }),
            Err(err) => {
                // The page never came up; tear the process down by hand.
                let mut browser = browser;
                if let Err(close) = browser.close().await {
                    warn!(error = %close, "failed to close browser after page setup failure");
                }
                handler_task.abort();
                if let Some(mut child) = child {
                    let _ = child.kill().await;
                }
                if let Err(cleanup) = profile.discard().await {
                    warn!(error = %cleanup, "failed to remove profile after page setup failure");
                }
                Err(err)
            }
        }
    }

    async fn launch_chromium(
        &self,
        profile: &BrowserProfile,
    ) -> BrowserResult<(Browser, Handler, Option<Child>)> {
        let config = self.build_chromium_config(profile)?;
        let (browser, handler) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;
        Ok((browser, handler, None))
    }

    fn build_chromium_config(&self, profile: &BrowserProfile) -> BrowserResult<ChromiumConfig> {
        let viewport = &self.settings.viewport;
        let mut builder = ChromiumConfig::builder()
            .user_data_dir(profile.path())
            .request_timeout(self.settings.launch_timeout)
            .viewport(ChromiumViewport {
                width: viewport.width,
                height: viewport.height,
                device_scale_factor: Some(viewport.device_scale_factor),
                emulating_mobile: false,
                is_landscape: viewport.width >= viewport.height,
                has_touch: false,
            });
        if let Some(executable) = self.settings.executable_for_engine() {
            builder = builder.chrome_executable(executable);
        }
        if !self.settings.headless {
            builder = builder.with_head();
        }
        builder = builder.args(vec![
            format!("--user-agent={}", self.settings.user_agent),
            format!("--window-size={},{}", viewport.width, viewport.height),
            "--disable-web-security".to_string(),
            "--disable-features=IsolateOrigins,site-per-process".to_string(),
            "--no-first-run".to_string(),
            "--password-store=basic".to_string(),
        ]);
        builder.build().map_err(BrowserError::Configuration)
    }

    /// Firefox is started by hand and driven through its remote protocol
    /// endpoint, which chromiumoxide can attach to.
    async fn launch_firefox(
        &self,
        profile: &BrowserProfile,
    ) -> BrowserResult<(Browser, Handler, Option<Child>)> {
        let executable = self
            .settings
            .executable_for_engine()
            .ok_or_else(|| BrowserError::Launch("no firefox executable configured".into()))?;
        let viewport = &self.settings.viewport;
        let mut command = Command::new(&executable);
        command
            .arg("--remote-debugging-port=0")
            .arg("--no-remote")
            .arg("--profile")
            .arg(profile.path())
            .arg(format!("--width={}", viewport.width))
            .arg(format!("--height={}", viewport.height))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.settings.headless {
            command.arg("--headless");
        }
        let mut child = command.spawn().map_err(|err| {
            BrowserError::Launch(format!("failed to spawn {}: {err}", executable.display()))
        })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BrowserError::Launch("firefox stderr unavailable".into()))?;

        let endpoint = bounded(
            "firefox remote endpoint",
            self.settings.launch_timeout,
            async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(line) = lines.next_line().await? {
                    debug!(line = %line, "firefox stderr");
                    if let Some(url) = parse_devtools_endpoint(&line) {
                        return Ok(url);
                    }
                }
                Err(BrowserError::Launch(
                    "firefox exited before exposing a remote endpoint".into(),
                ))
            },
        )
        .await;
        let endpoint = match endpoint {
            Ok(url) => url,
            Err(err) => {
                let _ = child.kill().await;
                return Err(err);
            }
        };

        match Browser::connect(endpoint).await {
            Ok((browser, handler)) => Ok((browser, handler, Some(child))),
            Err(err) => {
                let _ = child.kill().await;
                Err(BrowserError::Launch(err.to_string()))
            }
        }
    }
}

#[async_trait(?Send)]
impl SessionLauncher for BrowserLauncher {
    type Session = BrowserSession;

    async fn open(&self) -> BrowserResult<BrowserSession> {
        self.launch().await
    }
}

async fn open_page(
    browser: &Browser,
    profile: &BrowserProfile,
    settings: &BrowserSettings,
) -> BrowserResult<(BrowserPage, JoinHandle<()>)> {
    profile.touch().await?;
    let page = browser.new_page(CreateTargetParams::new("about:blank")).await?;
    let params = SetUserAgentOverrideParams::builder()
        .user_agent(settings.user_agent.clone())
        .build()
        .map_err(BrowserError::Configuration)?;
    page.set_user_agent(params).await?;
    let console_task = spawn_console_relay(&page).await?;
    Ok((BrowserPage { page }, console_task))
}

fn spawn_handler(mut handler: Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(err) = event {
                debug!(error = %err, "browser handler reported error");
            }
        }
    })
}

/// Extracts the websocket URL from a "... listening on ws://..." stderr line.
pub fn parse_devtools_endpoint(line: &str) -> Option<String> {
    if !line.to_lowercase().contains("listening on") {
        return None;
    }
    let start = line.find("ws://")?;
    line[start..]
        .split_whitespace()
        .next()
        .map(str::to_string)
}

#[derive(Debug)]
pub struct BrowserSession {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    console_task: Option<JoinHandle<()>>,
    child: Option<Child>,
    profile: Option<BrowserProfile>,
    page: BrowserPage,
}

impl BrowserSession {
    pub fn profile(&self) -> Option<&BrowserProfile> {
        self.profile.as_ref()
    }

    pub async fn shutdown(&mut self) -> BrowserResult<()> {
        info!("shutting down browser");
        if let Some(task) = self.console_task.take() {
            task.abort();
        }
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                debug!(error = %err, "browser process already gone");
            }
        }
        if let Some(profile) = self.profile.take() {
            profile.discard().await?;
        }
        Ok(())
    }
}

#[async_trait(?Send)]
impl RunSession for BrowserSession {
    type Page = BrowserPage;

    fn page(&self) -> &BrowserPage {
        &self.page
    }

    async fn hold(&self) {
        wait_for_operator().await;
    }

    async fn release(mut self) -> BrowserResult<()> {
        self.shutdown().await
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("BrowserSession dropped without explicit shutdown");
            }
        }
    }
}

async fn wait_for_operator() {
    info!("browser is visible, press Enter to close it");
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    if let Err(err) = stdin.read_line(&mut line).await {
        warn!(error = %err, "could not read from stdin, closing browser");
    }
}

#[derive(Debug)]
pub struct BrowserPage {
    page: Page,
}

impl BrowserPage {
    pub fn inner(&self) -> &Page {
        &self.page
    }
}

#[async_trait(?Send)]
impl HarvestPage for BrowserPage {
    async fn navigate(&self, url: &str, timeout: Duration) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        bounded(&format!("navigation to {url}"), timeout, async {
            self.page.goto(params).await?;
            self.page.wait_for_navigation().await?;
            Ok(())
        })
        .await
    }

    async fn evaluate(&self, script: &str, timeout: Duration) -> BrowserResult<Value> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(BrowserError::Configuration)?;
        bounded("script evaluation", timeout, async {
            let result = self.page.evaluate_expression(params).await?;
            Ok(result.value().cloned().unwrap_or(Value::Null))
        })
        .await
    }

    async fn screenshot(&self, path: &Path) -> BrowserResult<()> {
        let params = ScreenshotParams::builder().full_page(true).build();
        self.page.save_screenshot(params, path).await?;
        Ok(())
    }
}
