use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::error::BrowserResult;
use super::page::HarvestPage;

pub const CONFIG_STORAGE_KEY: &str = "SCRAPER_CONFIG";
pub const PARTITION_STORAGE_KEY: &str = "SCRAPER_DB_NAME";

const STORAGE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes values into the page's local storage under fixed keys. Injecting the
/// same value twice leaves storage byte-identical.
#[derive(Debug, Clone, Default)]
pub struct ConfigInjector;

impl ConfigInjector {
    pub fn new() -> Self {
        Self
    }

    pub async fn inject<P, T>(&self, page: &P, config: &T) -> BrowserResult<()>
    where
        P: HarvestPage + ?Sized,
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(config)?;
        debug!(key = CONFIG_STORAGE_KEY, bytes = payload.len(), "injecting run configuration");
        page.evaluate(&storage_write_script(CONFIG_STORAGE_KEY, &payload), STORAGE_WRITE_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Tells the page scripts which data partition the run belongs to.
    pub async fn mark_partition<P>(&self, page: &P, partition: &str) -> BrowserResult<()>
    where
        P: HarvestPage + ?Sized,
    {
        debug!(partition, "marking data partition");
        page.evaluate(
            &storage_write_script(PARTITION_STORAGE_KEY, partition),
            STORAGE_WRITE_TIMEOUT,
        )
        .await?;
        Ok(())
    }
}

pub fn storage_write_script(key: &str, value: &str) -> String {
    format!(
        "localStorage.setItem('{}', '{}');",
        escape_js_literal(key),
        escape_js_literal(value)
    )
}

/// Escapes `raw` for embedding inside a single-quoted JavaScript string.
pub fn escape_js_literal(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\u{2028}' => escaped.push_str("\\u2028"),
            '\u{2029}' => escaped.push_str("\\u2029"),
            '<' => escaped.push_str("\\x3c"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::Path;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct RecordingPage {
        scripts: RefCell<Vec<String>>,
    }

    #[async_trait(?Send)]
    impl HarvestPage for RecordingPage {
        async fn navigate(&self, _url: &str, _timeout: Duration) -> BrowserResult<()> {
            Ok(())
        }

        async fn evaluate(&self, script: &str, _timeout: Duration) -> BrowserResult<Value> {
            self.scripts.borrow_mut().push(script.to_string());
            Ok(Value::Null)
        }

        async fn screenshot(&self, _path: &Path) -> BrowserResult<()> {
            Ok(())
        }
    }

    fn unescape(literal: &str) -> String {
        let mut out = String::new();
        let mut chars = literal.chars();
        while let Some(ch) = chars.next() {
            if ch != '\\' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('x') => {
                    let hex: String = chars.by_ref().take(2).collect();
                    out.push(char::from(u8::from_str_radix(&hex, 16).unwrap()));
                }
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    out.push(char::from_u32(u32::from_str_radix(&hex, 16).unwrap()).unwrap());
                }
                Some(other) => out.push(other),
                None => {}
            }
        }
        out
    }

    #[tokio::test]
    async fn repeated_injection_writes_identical_scripts() {
        let page = RecordingPage::default();
        let injector = ConfigInjector::new();
        let config = json!({"email": "a@b.c", "password": "it's"});
        injector.inject(&page, &config).await.unwrap();
        injector.inject(&page, &config).await.unwrap();
        let scripts = page.scripts.borrow();
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0], scripts[1]);
        assert!(scripts[0].starts_with("localStorage.setItem('SCRAPER_CONFIG', '"));
    }

    #[test]
    fn hostile_values_survive_escaping() {
        let raw = r#"{"password":"a'b\\c</script>","note":"line1
line2"}"#;
        let escaped = escape_js_literal(raw);
        assert!(!escaped.contains('\n'));
        assert!(!escaped.contains("</script>"));
        assert_eq!(unescape(&escaped), raw);
    }

    #[tokio::test]
    async fn partition_goes_to_its_own_key() {
        let page = RecordingPage::default();
        ConfigInjector::new()
            .mark_partition(&page, "annonces_messages_jean")
            .await
            .unwrap();
        assert_eq!(
            page.scripts.borrow()[0],
            "localStorage.setItem('SCRAPER_DB_NAME', 'annonces_messages_jean');"
        );
    }
}
