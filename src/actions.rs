//! High-level page interaction helpers.
//!
//! Thin convenience layer over a single page: form filling, clicking,
//! scrolling, waiting, text extraction. Everything goes through the driver's
//! script evaluation, with optional human-like pacing (randomized delays,
//! stepped scrolling) around the interactions.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::driver::{Driver, DriverError};

/// Poll interval while waiting for an element
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn fill_script(selector: &str, text: &str) -> String {
    format!(
        "(() => {{\n\
         const el = document.querySelector({selector});\n\
         if (!el) return false;\n\
         el.focus();\n\
         el.value = {text};\n\
         el.dispatchEvent(new Event('input', {{ bubbles: true }}));\n\
         el.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
         return true;\n\
         }})()",
        selector = js_string(selector),
        text = js_string(text),
    )
}

fn click_script(selector: &str) -> String {
    format!(
        "(() => {{\n\
         const el = document.querySelector({selector});\n\
         if (!el) return false;\n\
         el.click();\n\
         return true;\n\
         }})()",
        selector = js_string(selector),
    )
}

fn exists_script(selector: &str) -> String {
    format!(
        "document.querySelector({}) !== null",
        js_string(selector)
    )
}

fn extract_text_script(selector: &str) -> String {
    format!(
        "Array.from(document.querySelectorAll({})).map(el => (el.textContent || '').trim()).filter(t => t.length > 0)",
        js_string(selector)
    )
}

/// Interaction helpers bound to one page.
pub struct PageActions<'a, D: Driver> {
    driver: &'a D,
    page: &'a D::Page,
    human_like: bool,
}

impl<'a, D: Driver> PageActions<'a, D> {
    /// Wrap a page with human-like pacing enabled.
    pub fn new(driver: &'a D, page: &'a D::Page) -> Self {
        Self {
            driver,
            page,
            human_like: true,
        }
    }

    /// Toggle human-like pacing.
    pub fn human_like(mut self, enabled: bool) -> Self {
        self.human_like = enabled;
        self
    }

    /// Fill an input field, firing input/change events.
    pub async fn fill(&self, selector: &str, text: &str) -> Result<(), DriverError> {
        if self.human_like {
            self.random_delay(100, 300).await;
        }
        let result = self.driver.eval(self.page, &fill_script(selector, text)).await?;
        if result.as_bool() != Some(true) {
            return Err(DriverError::Script(format!(
                "element not found: {}",
                selector
            )));
        }
        debug!(selector, "field filled");
        Ok(())
    }

    /// Click an element.
    pub async fn click(&self, selector: &str) -> Result<(), DriverError> {
        if self.human_like {
            self.random_delay(200, 500).await;
        }
        let result = self.driver.eval(self.page, &click_script(selector)).await?;
        if result.as_bool() != Some(true) {
            return Err(DriverError::Script(format!(
                "element not found: {}",
                selector
            )));
        }
        if self.human_like {
            self.random_delay(500, 1500).await;
        }
        debug!(selector, "element clicked");
        Ok(())
    }

    /// Scroll vertically by a pixel delta. Human-like mode breaks the scroll
    /// into uneven steps.
    pub async fn scroll_by(&self, delta_y: i64) -> Result<(), DriverError> {
        if self.human_like {
            let steps = 5;
            let per_step = delta_y / steps;
            for _ in 0..steps {
                let jitter = rand::thread_rng().gen_range(-20..20);
                let script = format!("window.scrollBy(0, {})", per_step + jitter);
                self.driver.eval(self.page, &script).await?;
                self.random_delay(50, 150).await;
            }
        } else {
            let script = format!("window.scrollBy(0, {})", delta_y);
            self.driver.eval(self.page, &script).await?;
        }
        Ok(())
    }

    pub async fn scroll_to_bottom(&self) -> Result<(), DriverError> {
        self.driver
            .eval(self.page, "window.scrollTo(0, document.body.scrollHeight)")
            .await?;
        Ok(())
    }

    pub async fn scroll_to_top(&self) -> Result<(), DriverError> {
        self.driver.eval(self.page, "window.scrollTo(0, 0)").await?;
        Ok(())
    }

    /// Wait until a selector matches. Returns false on timeout rather than
    /// erroring, since absence is often an expected answer.
    pub async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool, DriverError> {
        let deadline = Instant::now() + timeout;
        let script = exists_script(selector);
        loop {
            let found = self.driver.eval(self.page, &script).await?;
            if found.as_bool() == Some(true) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(selector, timeout_ms = timeout.as_millis() as u64, "element did not appear");
                return Ok(false);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    /// Text content of every element matching the selector.
    pub async fn extract_text(&self, selector: &str) -> Result<Vec<String>, DriverError> {
        let result = self
            .driver
            .eval(self.page, &extract_text_script(selector))
            .await?;
        let texts = result
            .as_array()
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(texts)
    }

    /// Fill several fields in order.
    pub async fn fill_form(&self, fields: &[(&str, &str)]) -> Result<(), DriverError> {
        for (selector, value) in fields {
            self.fill(selector, value).await?;
            if self.human_like {
                self.random_delay(200, 500).await;
            }
        }
        debug!(count = fields.len(), "form filled");
        Ok(())
    }

    async fn random_delay(&self, min_ms: u64, max_ms: u64) {
        let delay = rand::thread_rng().gen_range(min_ms..max_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}
