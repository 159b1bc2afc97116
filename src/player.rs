//! The static player bundle: an HTML template substituted per request plus
//! the css/js/image assets next to it.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

pub const PLAYER_TEMPLATE: &str = "player.html";

/// Values substituted into the player template on every request.
pub struct PlayerVars<'a> {
    pub app_title: &'a str,
    pub page_title: &'a str,
    pub stream_url: &'a str,
    pub server_port: u16,
    pub initial_status: &'a str,
}

pub struct PlayerAssets {
    dir: PathBuf,
    template: String,
}

impl PlayerAssets {
    pub fn load(dir: &Path) -> Result<Self> {
        let template_path = dir.join(PLAYER_TEMPLATE);
        let template = std::fs::read_to_string(&template_path)
            .with_context(|| format!("reading player template {}", template_path.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            template,
        })
    }

    pub fn render_player(&self, vars: &PlayerVars) -> String {
        self.template
            .replace("{{APP_TITLE}}", vars.app_title)
            .replace("{{PAGE_TITLE}}", vars.page_title)
            .replace("{{STREAM_URL}}", vars.stream_url)
            .replace("{{SERVER_PORT}}", &vars.server_port.to_string())
            .replace("{{INITIAL_STATUS}}", vars.initial_status)
    }

    /// Resolve a request path like `/css/style.css` inside the bundle.
    /// Anything that would escape the bundle directory resolves to `None`.
    pub fn asset_path(&self, request_path: &str) -> Option<PathBuf> {
        let relative = request_path.trim_start_matches('/');
        let candidate = Path::new(relative);
        if candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.dir.join(candidate))
    }
}
