//! Overlay Rasterizer (§4.5): renders HTML containers and embedded apps to
//! transparent, content-addressed PNGs via a headless browser.
//!
//! One browser instance is launched per run and reused across every page;
//! each page is closed after its screenshot. This is the `RenderContext`
//! redesign from §9 — no global browser singleton, the caller owns one
//! instance and passes it explicitly to whatever needs rasterization.

use crate::error::{CompileError, Result};
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use stsvideo_core::types::{App, Container};

const APP_READY_TIMEOUT: Duration = Duration::from_millis(5000);
const APP_READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Rasterizer {
    browser: Browser,
    touched_keys: HashSet<String>,
}

impl Rasterizer {
    pub fn launch() -> Result<Self> {
        let options = LaunchOptions::default_builder()
            .sandbox(false)
            .build()
            .map_err(|e| CompileError::ContainerRenderFailed {
                container_id: "<launch>".to_string(),
                message: e.to_string(),
            })?;
        let browser = Browser::new(options).map_err(|e| CompileError::ContainerRenderFailed {
            container_id: "<launch>".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            browser,
            touched_keys: HashSet::new(),
        })
    }

    pub fn touched_keys(&self) -> &HashSet<String> {
        &self.touched_keys
    }

    pub fn rasterize_container(
        &mut self,
        project_dir: &Path,
        container: &Container,
        width: u32,
        height: u32,
    ) -> Result<PathBuf> {
        let key = content_key(&[
            &container.inner_html,
            &container.css_text,
            &width.to_string(),
            &height.to_string(),
        ]);
        self.touched_keys.insert(key.clone());

        let out_dir = project_dir.join(".cache").join("containers");
        std::fs::create_dir_all(&out_dir)?;
        let out_path = out_dir.join(format!("{key}.png"));
        if out_path.exists() {
            return Ok(out_path);
        }

        let html = render_container_document(container, width, height);
        let temp_path = out_dir.join(format!(".{key}.source.html"));
        std::fs::write(&temp_path, html)?;
        let file_url = format!("file://{}", temp_path.display());

        let result = (|| -> Result<()> {
            let tab = self.browser.new_tab().map_err(|e| CompileError::ContainerRenderFailed {
                container_id: container.id.clone(),
                message: e.to_string(),
            })?;
            tab.set_default_timeout(Duration::from_secs(30));
            set_transparent_background(&tab).map_err(|e| CompileError::ContainerRenderFailed {
                container_id: container.id.clone(),
                message: e.to_string(),
            })?;
            tab.navigate_to(&file_url)
                .and_then(|t| t.wait_until_navigated())
                .map_err(|e| CompileError::ContainerRenderFailed {
                    container_id: container.id.clone(),
                    message: e.to_string(),
                })?;
            let png = tab
                .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| CompileError::ContainerRenderFailed {
                    container_id: container.id.clone(),
                    message: e.to_string(),
                })?;
            std::fs::write(&out_path, png)?;
            let _ = tab.close(true);
            Ok(())
        })();

        let _ = std::fs::remove_file(&temp_path);
        result?;
        Ok(out_path)
    }

    pub fn rasterize_app(
        &mut self,
        project_dir: &Path,
        app: &App,
        output_name: &str,
        width: u32,
        height: u32,
    ) -> Result<PathBuf> {
        let canonical_params = canonicalize_params(&app.params);
        let key = content_key(&[
            &app.dir.to_string_lossy(),
            &canonical_params,
            app.title.as_deref().unwrap_or(""),
            app.date.as_deref().unwrap_or(""),
            &app.tags.join(","),
            output_name,
            &width.to_string(),
            &height.to_string(),
        ]);
        self.touched_keys.insert(key.clone());

        let out_dir = project_dir.join("cache").join("apps");
        std::fs::create_dir_all(&out_dir)?;
        let out_path = out_dir.join(format!("{key}.png"));
        if out_path.exists() {
            return Ok(out_path);
        }

        let index_html = app.dir.join("index.html");
        let query = build_query_string(app);
        let file_url = format!("file://{}?{query}", index_html.display());

        let tab = self.browser.new_tab().map_err(|e| CompileError::ContainerRenderFailed {
            container_id: app.id.clone(),
            message: e.to_string(),
        })?;
        tab.set_default_timeout(Duration::from_secs(30));
        set_transparent_background(&tab).map_err(|e| CompileError::ContainerRenderFailed {
            container_id: app.id.clone(),
            message: e.to_string(),
        })?;
        tab.evaluate("window.__stsRenderComplete = false;", false)
            .map_err(|e| CompileError::ContainerRenderFailed {
                container_id: app.id.clone(),
                message: e.to_string(),
            })?;
        tab.navigate_to(&file_url).map_err(|e| CompileError::ContainerRenderFailed {
            container_id: app.id.clone(),
            message: e.to_string(),
        })?;

        let start = Instant::now();
        loop {
            let ready = tab
                .evaluate("window.__stsRenderComplete === true", false)
                .ok()
                .and_then(|v| v.value.and_then(|v| v.as_bool()))
                .unwrap_or(false);
            if ready {
                break;
            }
            if start.elapsed() >= APP_READY_TIMEOUT {
                let _ = tab.close(true);
                return Err(CompileError::AppRenderTimeout(app.id.clone()));
            }
            std::thread::sleep(APP_READY_POLL_INTERVAL);
        }

        let png = tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(|e| CompileError::ContainerRenderFailed {
                container_id: app.id.clone(),
                message: e.to_string(),
            })?;
        std::fs::write(&out_path, png)?;
        let _ = tab.close(true);

        Ok(out_path)
    }
}

fn set_transparent_background(tab: &headless_chrome::Tab) -> std::result::Result<(), anyhow::Error> {
    tab.call_method(Page::SetDefaultBackgroundColorOverride {
        color: Some(Page::RGBA {
            r: 0,
            g: 0,
            b: 0,
            a: Some(0.0),
        }),
    })?;
    Ok(())
}

fn render_container_document(container: &Container, width: u32, height: u32) -> String {
    format!(
        r#"<!doctype html><html><head><meta charset="utf-8">
<style>* {{ margin:0; padding:0; box-sizing:border-box; }} html,body {{ width:{width}px; height:{height}px; background:transparent; overflow:hidden; }}</style>
<style>{css}</style>
</head><body>{html}</body></html>"#,
        css = container.css_text,
        html = container.inner_html,
    )
}

fn build_query_string(app: &App) -> String {
    let mut params = app.params.clone();
    params
        .entry("title".to_string())
        .or_insert_with(|| serde_json::Value::String(app.title.clone().unwrap_or_default()));
    params
        .entry("date".to_string())
        .or_insert_with(|| serde_json::Value::String(app.date.clone().unwrap_or_default()));
    params
        .entry("tags".to_string())
        .or_insert_with(|| serde_json::Value::String(app.tags.join(",")));

    params
        .into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            format!("{}={}", urlencode(&k), urlencode(&value))
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn urlencode(s: &str) -> String {
    let mut out = String::new();
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn canonicalize_params(params: &serde_json::Map<String, serde_json::Value>) -> String {
    let sorted: BTreeMap<&String, &serde_json::Value> = params.iter().collect();
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn content_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(16);
    hex
}
