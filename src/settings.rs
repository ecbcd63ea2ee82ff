use std::path::{Path, PathBuf};

use log::LevelFilter;

use crate::color::Rgb;

/// Engine-wide settings, persisted as `key=value` lines.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    pub max_undo_steps: usize,
    /// 0 disables the memory limit.
    pub max_history_memory_mb: usize,
    /// Largest canvas edge dialogs may propose and storage will load.
    pub max_canvas_dim: u32,
    pub thumbnail_max_edge: u32,
    pub log_level: LevelFilter,
    pub primary_color: Rgb,
    pub secondary_color: Rgb,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: 50,
            max_history_memory_mb: 100,
            max_canvas_dim: 32768,
            thumbnail_max_edge: 256,
            log_level: LevelFilter::Info,
            primary_color: Rgb::BLACK,
            secondary_color: Rgb::WHITE,
        }
    }
}

impl EngineSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/paintcore/paintcore_settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\PaintCore\paintcore_settings.cfg
    /// On macOS:   ~/Library/Application Support/PaintCore/paintcore_settings.cfg
    /// Fallback:   same directory as the executable.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
                    PathBuf::from(home).join(".config")
                })
                .join("paintcore");
            Some(config_dir.join("paintcore_settings.cfg"))
        }
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            Some(PathBuf::from(appdata).join("PaintCore").join("paintcore_settings.cfg"))
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("PaintCore")
                    .join("paintcore_settings.cfg"),
            )
        }
        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            std::env::current_exe().ok().and_then(|p| p.parent().map(|d| d.join("paintcore_settings.cfg")))
        }
    }

    fn color_to_str(c: Rgb) -> String {
        format!("{},{},{}", c.r, c.g, c.b)
    }

    /// Parse "r,g,b"
    fn str_to_color(s: &str) -> Option<Rgb> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            return None;
        }
        let r = parts[0].trim().parse::<u8>().ok()?;
        let g = parts[1].trim().parse::<u8>().ok()?;
        let b = parts[2].trim().parse::<u8>().ok()?;
        Some(Rgb::new(r, g, b))
    }

    pub fn to_config_string(&self) -> String {
        format!(
            "max_undo_steps={}\n\
             max_history_memory_mb={}\n\
             max_canvas_dim={}\n\
             thumbnail_max_edge={}\n\
             log_level={}\n\
             primary_color={}\n\
             secondary_color={}\n",
            self.max_undo_steps,
            self.max_history_memory_mb,
            self.max_canvas_dim,
            self.thumbnail_max_edge,
            self.log_level.as_str().to_lowercase(),
            Self::color_to_str(self.primary_color),
            Self::color_to_str(self.secondary_color),
        )
    }

    /// Parse settings text. Unknown keys and bad values keep their defaults.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let Some((key, val)) = line.split_once('=') else { continue };
            let val = val.trim();
            match key.trim() {
                "max_undo_steps" => {
                    if let Ok(v) = val.parse::<usize>()
                        && v > 0
                    {
                        s.max_undo_steps = v;
                    }
                }
                "max_history_memory_mb" => {
                    if let Ok(v) = val.parse() {
                        s.max_history_memory_mb = v;
                    }
                }
                "max_canvas_dim" => {
                    if let Ok(v) = val.parse::<u32>()
                        && v > 0
                    {
                        s.max_canvas_dim = v;
                    }
                }
                "thumbnail_max_edge" => {
                    if let Ok(v) = val.parse::<u32>()
                        && v > 0
                    {
                        s.thumbnail_max_edge = v;
                    }
                }
                "log_level" => {
                    if let Some(level) = crate::logger::parse_level(val) {
                        s.log_level = level;
                    }
                }
                "primary_color" => {
                    if let Some(c) = Self::str_to_color(val) {
                        s.primary_color = c;
                    }
                }
                "secondary_color" => {
                    if let Some(c) = Self::str_to_color(val) {
                        s.secondary_color = c;
                    }
                }
                _ => {}
            }
        }
        s
    }

    /// History memory limit in bytes, `None` when disabled.
    pub fn history_memory_limit(&self) -> Option<usize> {
        (self.max_history_memory_mb > 0).then(|| self.max_history_memory_mb * 1024 * 1024)
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())
    }

    /// Load settings from disk (returns default if file missing or corrupt)
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn save(&self) {
        let Some(path) = Self::settings_path() else { return };
        if let Err(e) = self.save_to(&path) {
            log::warn!("Could not write settings to {}: {}", path.display(), e);
        }
    }
}
