use async_trait::async_trait;
use browser_agent::config::BrowserConfig;
use browser_agent::driver::{BrowserDriver, SessionFactory};
use browser_agent::error::DriverError;
use browser_agent::types::{Action, ActionResult, Observation, TabInfo};
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dom;
use crate::types::{MAX_WAIT_SECONDS, TAB_OPEN_POLL, TAB_OPEN_POLLS};

/// One browser session: a Chrome instance (launched or attached) and the tab
/// currently driven. All CDP calls block, so they run on the blocking pool.
pub struct ChromeDriver {
    browser: Arc<Browser>,
    active: Arc<Mutex<Arc<Tab>>>,
    attached: bool,
    deadline: Duration,
}

impl ChromeDriver {
    fn launch(config: &BrowserConfig, deadline: Duration) -> Result<Self, DriverError> {
        // 1. Try to attach to an already running Chrome.
        if let Some(url) = &config.attach_url {
            info!(url = %url, "attaching to existing Chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    // Own tab per session so concurrent runs do not collide.
                    let tab = browser.new_tab().map_err(classify)?;
                    tab.set_default_timeout(deadline);
                    info!("attached to existing Chrome");
                    return Ok(Self {
                        browser: Arc::new(browser),
                        active: Arc::new(Mutex::new(tab)),
                        attached: true,
                        deadline,
                    });
                }
                Err(err) => warn!(error = %err, "could not attach, launching a new Chrome"),
            }
        }

        // 2. Launch our own.
        let options = LaunchOptions {
            headless: config.headless,
            path: config.chrome_path.as_deref().map(expand_home),
            user_data_dir: config.profile_dir.as_deref().map(expand_home),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        info!(headless = config.headless, "starting Chrome");
        let browser = Browser::new(options)
            .map_err(|err| DriverError::Crashed(format!("browser launch failed: {}", err)))?;
        let tab = browser.new_tab().map_err(classify)?;
        tab.set_default_timeout(deadline);
        tab.navigate_to("about:blank").map_err(classify)?;
        info!("Chrome ready");

        Ok(Self {
            browser: Arc::new(browser),
            active: Arc::new(Mutex::new(tab)),
            attached: false,
            deadline,
        })
    }

    /// Run CDP work on the blocking pool. The tab's default timeout bounds
    /// the waits inside `work`; if it still overruns the deadline we wait
    /// for it anyway, since the thread keeps driving the tab until it ends.
    async fn blocking<T, F>(&self, work: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Browser, &Mutex<Arc<Tab>>, Duration) -> Result<T, DriverError> + Send + 'static,
    {
        let browser = self.browser.clone();
        let active = self.active.clone();
        let deadline = self.deadline;
        let mut task = tokio::task::spawn_blocking(move || work(&browser, &active, deadline));
        let joined = match tokio::time::timeout(self.deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    deadline_ms = self.deadline.as_millis() as u64,
                    "browser call overran its deadline, waiting for it to stop"
                );
                task.await
            }
        };
        joined.map_err(|err| DriverError::protocol(format!("browser task failed: {}", err)))?
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn observe(&self, force_fresh: bool) -> Result<Observation, DriverError> {
        debug!(force_fresh, "capturing observation");
        self.blocking(|browser, active, _| {
            let tab = active_tab(active)?;
            let mut observation = dom::capture_observation(&tab).map_err(classify)?;
            observation.tabs = list_tabs(browser)?;
            Ok(observation)
        })
        .await
    }

    async fn execute(&self, action: &Action) -> Result<ActionResult, DriverError> {
        let action = action.clone();
        self.blocking(move |browser, active, deadline| {
            match perform(browser, active, deadline, &action) {
                Ok(result) => Ok(result),
                Err(err) => {
                    let classified = classify(err);
                    if classified.is_fatal() {
                        Err(classified)
                    } else {
                        Ok(ActionResult::failed(action, classified.to_string()))
                    }
                }
            }
        })
        .await
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let url = url.to_string();
        self.blocking(move |_, active, _| {
            let tab = active_tab(active)?;
            tab.navigate_to(&url)
                .and_then(|tab| tab.wait_until_navigated())
                .map_err(classify)?;
            Ok(())
        })
        .await
    }

    async fn pending_requests(&self) -> Result<usize, DriverError> {
        self.blocking(|_, active, _| {
            dom::pending_requests(&active_tab(active)?).map_err(classify)
        })
        .await
    }

    async fn close(&self) -> Result<(), DriverError> {
        if !self.attached {
            // The launched Chrome exits once the last handle is dropped.
            return Ok(());
        }
        self.blocking(|_, active, _| {
            active_tab(active)?.close(true).map_err(classify)?;
            Ok(())
        })
        .await
    }
}

fn active_tab(active: &Mutex<Arc<Tab>>) -> Result<Arc<Tab>, DriverError> {
    active
        .lock()
        .map(|tab| tab.clone())
        .map_err(|_| DriverError::protocol("active tab lock poisoned"))
}

fn set_active(active: &Mutex<Arc<Tab>>, tab: Arc<Tab>) -> Result<(), DriverError> {
    let mut slot = active
        .lock()
        .map_err(|_| DriverError::protocol("active tab lock poisoned"))?;
    *slot = tab;
    Ok(())
}

fn all_tabs(browser: &Browser) -> Result<Vec<Arc<Tab>>, DriverError> {
    browser
        .get_tabs()
        .lock()
        .map(|tabs| tabs.clone())
        .map_err(|_| DriverError::protocol("tab list lock poisoned"))
}

fn list_tabs(browser: &Browser) -> Result<Vec<TabInfo>, DriverError> {
    Ok(all_tabs(browser)?
        .iter()
        .map(|tab| TabInfo {
            tab_id: tab.get_target_id().to_string(),
            url: tab.get_url(),
            title: tab.get_title().unwrap_or_default(),
        })
        .collect())
}

fn find_tab(browser: &Browser, tab_id: &str) -> Result<Option<Arc<Tab>>, DriverError> {
    Ok(all_tabs(browser)?
        .into_iter()
        .find(|tab| tab.get_target_id().as_str() == tab_id))
}

fn tab_ids(browser: &Browser) -> Result<Vec<String>, DriverError> {
    Ok(all_tabs(browser)?
        .iter()
        .map(|tab| tab.get_target_id().to_string())
        .collect())
}

/// The tab that appeared between two listings, newest first.
fn opened_tab(before: &[String], after: &[String]) -> Option<String> {
    after.iter().rev().find(|id| !before.contains(id)).cloned()
}

/// Follow a tab a click just opened (`target=_blank`, `window.open`).
fn follow_opened_tab(
    browser: &Browser,
    active: &Mutex<Arc<Tab>>,
    deadline: Duration,
    before: &[String],
) -> anyhow::Result<()> {
    // Chrome registers the new target shortly after the click returns.
    for _ in 0..TAB_OPEN_POLLS {
        if let Some(id) = opened_tab(before, &tab_ids(browser)?) {
            if let Some(tab) = find_tab(browser, &id)? {
                info!(tab_id = %id, "click opened a new tab, switching to it");
                tab.set_default_timeout(deadline);
                tab.activate()?;
                set_active(active, tab)?;
            }
            return Ok(());
        }
        std::thread::sleep(TAB_OPEN_POLL);
    }
    Ok(())
}

/// Run one action. Errors here are ordinary action failures unless
/// [`classify`] says the session is gone.
fn perform(
    browser: &Browser,
    active: &Mutex<Arc<Tab>>,
    deadline: Duration,
    action: &Action,
) -> anyhow::Result<ActionResult> {
    let tab = active_tab(active)?;
    match action {
        Action::Navigate { url, new_tab } => {
            let target = if *new_tab {
                let tab = browser.new_tab()?;
                tab.set_default_timeout(deadline);
                set_active(active, tab.clone())?;
                tab
            } else {
                tab
            };
            target.navigate_to(url)?.wait_until_navigated()?;
        }
        Action::Click { index } => {
            let before = tab_ids(browser)?;
            tab.find_element(&dom::selector_for(*index))?.click()?;
            follow_opened_tab(browser, active, deadline, &before)?;
        }
        Action::Type { index, text, clear } => {
            tab.find_element(&dom::selector_for(*index))?.click()?;
            if *clear {
                dom::clear_input(&tab, *index)?;
            }
            tab.type_str(text)?;
        }
        Action::Scroll { down, pages, index } => {
            dom::scroll(&tab, *down, *pages, *index)?;
        }
        Action::SendKeys { keys } => {
            tab.press_key(keys)?;
        }
        Action::SelectDropdown { index, text } => {
            if !dom::select_option(&tab, *index, text)? {
                return Ok(ActionResult::failed(
                    action.clone(),
                    format!("no option '{}' in dropdown {}", text, index),
                ));
            }
        }
        Action::SwitchTab { tab_id } => {
            let Some(target) = find_tab(browser, tab_id)? else {
                return Ok(ActionResult::failed(
                    action.clone(),
                    format!("tab {} not found", tab_id),
                ));
            };
            target.activate()?;
            set_active(active, target)?;
        }
        Action::CloseTab { tab_id } => {
            let Some(target) = find_tab(browser, tab_id)? else {
                return Ok(ActionResult::failed(
                    action.clone(),
                    format!("tab {} not found", tab_id),
                ));
            };
            target.close(true)?;
            if tab.get_target_id() == target.get_target_id() {
                let next = match all_tabs(browser)?
                    .into_iter()
                    .find(|t| t.get_target_id() != target.get_target_id())
                {
                    Some(next) => next,
                    None => {
                        let tab = browser.new_tab()?;
                        tab.set_default_timeout(deadline);
                        tab
                    }
                };
                next.activate()?;
                set_active(active, next)?;
            }
        }
        Action::GoBack => {
            dom::go_back(&tab)?;
        }
        Action::Wait { seconds } => {
            std::thread::sleep(Duration::from_secs((*seconds).min(MAX_WAIT_SECONDS)));
        }
        Action::Extract { .. } => {
            let text = dom::extract_text(&tab)?;
            return Ok(ActionResult::extracted(action.clone(), text));
        }
        Action::Done { .. } => return Ok(ActionResult::done(action.clone())),
    }
    Ok(ActionResult::ok(action.clone()))
}

/// Sort a CDP error into lost-session or recoverable.
fn classify(err: anyhow::Error) -> DriverError {
    if let Some(driver_err) = err.downcast_ref::<DriverError>() {
        return match driver_err {
            DriverError::Disconnected(msg) => DriverError::Disconnected(msg.clone()),
            DriverError::Crashed(msg) => DriverError::Crashed(msg.clone()),
            DriverError::Protocol(msg) => DriverError::Protocol(msg.clone()),
            DriverError::Timeout(ms) => DriverError::Timeout(*ms),
            DriverError::ElementNotFound(index) => DriverError::ElementNotFound(*index),
        };
    }
    let message = format!("{:#}", err);
    let lowered = message.to_lowercase();
    if lowered.contains("connection is closed") || lowered.contains("connection closed") {
        DriverError::Disconnected(message)
    } else if lowered.contains("process exited") || lowered.contains("target crashed") {
        DriverError::Crashed(message)
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        DriverError::Timeout(0)
    } else {
        DriverError::protocol(message)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

pub struct ChromeSessionFactory {
    config: BrowserConfig,
    deadline: Duration,
}

impl ChromeSessionFactory {
    /// `deadline` bounds every browser call of the sessions it opens.
    pub fn new(config: BrowserConfig, deadline: Duration) -> Self {
        Self { config, deadline }
    }
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn open(&self) -> Result<Box<dyn BrowserDriver>, DriverError> {
        let config = self.config.clone();
        let deadline = self.deadline;
        let driver = tokio::task::spawn_blocking(move || ChromeDriver::launch(&config, deadline))
            .await
            .map_err(|err| DriverError::Crashed(format!("browser launch task failed: {}", err)))??;
        Ok(Box::new(driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_connections_are_fatal() {
        let err = classify(anyhow::anyhow!(
            "Unable to make method calls because underlying connection is closed"
        ));
        assert!(err.is_fatal());
        assert!(!classify(anyhow::anyhow!("Could not find element")).is_fatal());
    }

    #[test]
    fn newly_opened_tab_is_detected() {
        let before = vec!["A".to_string(), "B".to_string()];
        let after = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        assert_eq!(opened_tab(&before, &after), Some("C".to_string()));
        assert_eq!(opened_tab(&before, &before), None);

        let closed_one = vec!["B".to_string()];
        assert_eq!(opened_tab(&before, &closed_one), None);
    }

    #[test]
    fn home_prefix_is_expanded() {
        let plain = Path::new("/tmp/profile");
        assert_eq!(expand_home(plain), PathBuf::from("/tmp/profile"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/agent")), home.join("agent"));
        }
    }
}
