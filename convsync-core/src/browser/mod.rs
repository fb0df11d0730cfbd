mod console;
mod error;
mod injector;
mod page;
mod profile;
mod session;

pub use console::{classify, spawn_console_relay, ConsoleLevel, ConsoleLine};
pub use error::{BrowserError, BrowserResult};
pub use injector::{
    escape_js_literal, storage_write_script, ConfigInjector, CONFIG_STORAGE_KEY,
    PARTITION_STORAGE_KEY,
};
pub use page::{bounded, HarvestPage, RunSession, SessionLauncher};
pub use profile::{BrowserProfile, ProfileManager};
pub use session::{
    parse_devtools_endpoint, BrowserEngine, BrowserLauncher, BrowserPage, BrowserSession,
    BrowserSettings, ViewportSpec, DEFAULT_USER_AGENT,
};
